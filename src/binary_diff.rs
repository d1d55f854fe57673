use std::collections::HashMap;

use crate::patch_format::DiffChunk;
use crate::rolling_hash::RollingHash;

pub const BLOCK_SIZE: usize = 4096;

struct BlockSignature {
    rolling_hash: u32,
    strong_hash: blake3::Hash,
    offset: u64,
}

/// Compute a block-level diff turning `old` into `new`.
///
/// rsync-style matching:
/// 1. Split old data into fixed-size blocks and sign each (rolling + BLAKE3)
/// 2. Slide a rolling window over new data looking for signed blocks
/// 3. Emit Copy for matched blocks, Insert for the bytes in between
///
/// Adjacent copies of contiguous old ranges are merged, so an unchanged run
/// of blocks costs one chunk.
pub fn compute_diff(old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
    if new.is_empty() {
        return vec![];
    }
    if old.is_empty() || new.len() < BLOCK_SIZE {
        return vec![DiffChunk::Insert { data: new.to_vec() }];
    }

    let signatures = build_signatures(old);
    let hash_table = build_hash_table(&signatures);

    match_blocks(old, new, &hash_table, &signatures)
}

/// Serialized size of a chunk list as stored in a patch payload.
pub fn encoded_len(chunks: &[DiffChunk]) -> u64 {
    bincode::serialized_size(chunks).unwrap_or(u64::MAX)
}

fn build_signatures(data: &[u8]) -> Vec<BlockSignature> {
    data.chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, block)| BlockSignature {
            rolling_hash: RollingHash::over(block).digest(),
            strong_hash: blake3::hash(block),
            offset: (i * BLOCK_SIZE) as u64,
        })
        .collect()
}

fn build_hash_table(signatures: &[BlockSignature]) -> HashMap<u32, Vec<usize>> {
    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.rolling_hash).or_default().push(idx);
    }
    table
}

fn push_copy(chunks: &mut Vec<DiffChunk>, offset: u64, length: u64) {
    if let Some(DiffChunk::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = chunks.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    chunks.push(DiffChunk::Copy { offset, length });
}

fn match_blocks(
    old: &[u8],
    new: &[u8],
    hash_table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Vec<DiffChunk> {
    let mut chunks: Vec<DiffChunk> = Vec::new();
    let mut insert_buf: Vec<u8> = Vec::new();

    let mut rolling = RollingHash::over(&new[..BLOCK_SIZE]);
    let mut pos: usize = 0;

    while pos + BLOCK_SIZE <= new.len() {
        let window = &new[pos..pos + BLOCK_SIZE];

        if let Some((offset, length)) =
            find_match(rolling.digest(), window, old, hash_table, signatures)
        {
            if !insert_buf.is_empty() {
                chunks.push(DiffChunk::Insert {
                    data: std::mem::take(&mut insert_buf),
                });
            }
            push_copy(&mut chunks, offset, length);

            pos += length as usize;
            if pos + BLOCK_SIZE <= new.len() {
                rolling = RollingHash::over(&new[pos..pos + BLOCK_SIZE]);
            }
        } else {
            insert_buf.push(new[pos]);
            pos += 1;
            if pos + BLOCK_SIZE <= new.len() {
                rolling.roll(new[pos - 1], new[pos + BLOCK_SIZE - 1]);
            }
        }
    }

    // Tail shorter than a full window
    insert_buf.extend_from_slice(&new[pos..]);
    if !insert_buf.is_empty() {
        chunks.push(DiffChunk::Insert { data: insert_buf });
    }

    chunks
}

/// Find an old block equal to the current window. Returns (old_offset, length).
fn find_match(
    rolling_digest: u32,
    window: &[u8],
    old: &[u8],
    hash_table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Option<(u64, u64)> {
    let candidates = hash_table.get(&rolling_digest)?;
    let strong = blake3::hash(window);

    candidates.iter().find_map(|&idx| {
        let sig = &signatures[idx];
        let block_len = (old.len() - sig.offset as usize).min(BLOCK_SIZE);
        // A short trailing block can only match a window of the same length.
        (block_len == window.len() && sig.strong_hash == strong)
            .then_some((sig.offset, block_len as u64))
    })
}
