use crate::patch_format::DiffChunk;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("copy of {length} bytes at offset {offset} exceeds the {source_len}-byte source")]
pub struct ChunkOutOfRange {
    pub offset: u64,
    pub length: u64,
    pub source_len: u64,
}

/// Reconstruct new content from old content and a chunk list.
///
/// Chunks come from an untrusted patch, so every copy range is checked
/// against `old` before anything is allocated.
pub fn apply_diff(old: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, ChunkOutOfRange> {
    let mut output_len: u64 = 0;
    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let in_range = offset
                    .checked_add(*length)
                    .is_some_and(|end| end <= old.len() as u64);
                if !in_range {
                    return Err(ChunkOutOfRange {
                        offset: *offset,
                        length: *length,
                        source_len: old.len() as u64,
                    });
                }
                output_len += length;
            }
            DiffChunk::Insert { data } => output_len += data.len() as u64,
        }
    }

    let mut result = Vec::with_capacity(output_len as usize);
    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let start = *offset as usize;
                result.extend_from_slice(&old[start..start + *length as usize]);
            }
            DiffChunk::Insert { data } => result.extend_from_slice(data),
        }
    }

    Ok(result)
}
