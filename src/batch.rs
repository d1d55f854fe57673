//! Produce many archives at once under a concurrency cap.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::create::{create_patch, CreateOptions};
use crate::error::{Error, Result};
use crate::patch_format::PatchSummary;

/// Default number of archives produced at the same time.
pub const MAX_CONCURRENT_CREATES: usize = 8;

#[derive(Debug, Clone)]
pub struct CreateJob {
    pub before: PathBuf,
    pub after: PathBuf,
    pub output: PathBuf,
}

/// Run every job with at most `limit` in flight. One result per job, in job order.
pub async fn create_patches(
    jobs: Vec<CreateJob>,
    options: &CreateOptions,
    limit: usize,
) -> Vec<Result<PatchSummary>> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::with_capacity(jobs.len());

    for job in jobs {
        let permit = semaphore.clone().acquire_owned().await.map_err(|_| Error::Io {
            path: job.output.clone(),
            source: io::Error::other("concurrency semaphore closed"),
        });
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            let _permit = match permit {
                Ok(permit) => permit,
                Err(e) => return Err(e),
            };
            debug!(output = %job.output.display(), "creating patch");
            create_patch(&job.before, &job.after, &job.output, &options).await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.map_err(Error::from).and_then(|r| r));
    }
    results
}
