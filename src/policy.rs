//! Deciding whether a finished delta is worth publishing.
//!
//! Signing and code-signature comparison live outside this crate; they are
//! reached only through the traits below.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{IoContext, Result};

pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Produces a detached signature for a patch file.
pub trait PatchSigner {
    fn sign(&self, patch: &Path) -> std::result::Result<Vec<u8>, CollaboratorError>;
}

/// Compares the signing identity of two bundle trees.
pub trait SigningIdentityOracle {
    fn same_identity(
        &self,
        before: &Path,
        after: &Path,
    ) -> std::result::Result<bool, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaDecision {
    Publish { signature: Vec<u8> },
    /// Not meaningfully smaller than the full update
    TooLarge,
    UntrustedIdentity,
    SigningFailed { reason: String },
}

/// A delta must be a bit smaller than the full update it replaces.
/// Integer division on both sides, so tiny sizes round the same way.
pub fn delta_is_worthwhile(delta_size: u64, full_size: u64) -> bool {
    delta_size / 7 <= full_size / 8
}

/// Size first, then identity, then signing: the first check that fails decides.
pub fn evaluate_delta(
    patch: &Path,
    full_size: u64,
    before: &Path,
    after: &Path,
    oracle: &dyn SigningIdentityOracle,
    signer: &dyn PatchSigner,
) -> Result<DeltaDecision> {
    let delta_size = std::fs::metadata(patch).at(patch)?.len();
    if !delta_is_worthwhile(delta_size, full_size) {
        debug!(
            patch = %patch.display(),
            delta_size,
            full_size,
            "delta discarded, not sufficiently smaller"
        );
        return Ok(DeltaDecision::TooLarge);
    }

    match oracle.same_identity(before, after) {
        Ok(true) => {}
        Ok(false) => return Ok(DeltaDecision::UntrustedIdentity),
        Err(e) => {
            warn!(patch = %patch.display(), error = %e, "could not compare signing identities");
            return Ok(DeltaDecision::UntrustedIdentity);
        }
    }

    Ok(match signer.sign(patch) {
        Ok(signature) => DeltaDecision::Publish { signature },
        Err(e) => {
            warn!(patch = %patch.display(), error = %e, "delta could not be signed");
            DeltaDecision::SigningFailed {
                reason: e.to_string(),
            }
        }
    })
}
