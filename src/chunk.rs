//! Chunk planning: splits a file size into the ordered byte ranges workers
//! transfer in parallel, per the size-tiering table chosen once per task and
//! never revisited across resumes.

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;
const SINGLE_CHUNK_THRESHOLD: u64 = 4 * MIB;
const TIER_CEILING: u64 = 100 * MIB;
const DEFAULT_CHUNK_SIZE: u64 = 4 * MIB;
const ARIA2_CHUNK_SIZE: u64 = 1 * MIB;
const ARIA2_MAX_CHUNKS: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Chunk {
    fn pending(index: usize, offset: u64, size: u64) -> Self {
        Chunk {
            index,
            offset,
            size,
            status: ChunkStatus::Pending,
            sha256: None,
            attempts: 0,
            error: None,
        }
    }
}

/// Choose the base chunk size for a file of size `file_size`, honoring
/// `config.aria2` and an explicit `chunk_size` override (default mode only).
pub fn base_chunk_size(file_size: u64, aria2: bool, explicit: Option<u64>) -> u64 {
    if file_size < SINGLE_CHUNK_THRESHOLD {
        return file_size.max(1);
    }

    if aria2 {
        if file_size > TIER_CEILING {
            let by_cap = file_size.div_ceil(ARIA2_MAX_CHUNKS);
            return ARIA2_CHUNK_SIZE.max(by_cap);
        }
        return ARIA2_CHUNK_SIZE;
    }

    if let Some(size) = explicit {
        return size.max(1);
    }

    if file_size <= TIER_CEILING {
        DEFAULT_CHUNK_SIZE
    } else {
        DEFAULT_CHUNK_SIZE.max(file_size.div_ceil(256))
    }
}

/// Tile `file_size` bytes into an ordered, contiguous chunk list. A zero-byte
/// file yields a single size-0 chunk so it still round-trips the verifier.
pub fn plan(file_size: u64, aria2: bool, explicit_chunk_size: Option<u64>) -> Vec<Chunk> {
    if file_size == 0 {
        return vec![Chunk::pending(0, 0, 0)];
    }

    if file_size < SINGLE_CHUNK_THRESHOLD {
        return vec![Chunk::pending(0, 0, file_size)];
    }

    let chunk_size = base_chunk_size(file_size, aria2, explicit_chunk_size);
    let mut chunks = Vec::with_capacity((file_size.div_ceil(chunk_size)) as usize);
    let mut offset = 0u64;
    let mut index = 0usize;
    while offset < file_size {
        let size = chunk_size.min(file_size - offset);
        chunks.push(Chunk::pending(index, offset, size));
        offset += size;
        index += 1;
    }
    chunks
}

/// Validate the chunk-list invariants from the data model: strictly
/// increasing contiguous offsets, sizes summing to `file_size`, and a
/// `0..N` index run.
pub fn validate_chunks(chunks: &[Chunk], file_size: u64) -> bool {
    if chunks.is_empty() {
        return file_size == 0;
    }

    let mut expected_offset = 0u64;
    let mut total = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i || chunk.offset != expected_offset {
            return false;
        }
        expected_offset += chunk.size;
        total += chunk.size;
    }
    total == file_size
}
