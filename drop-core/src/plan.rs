//! Chunk and batch planning.
//!
//! A file of `total` bytes is cut into chunks of at most `chunk_size`
//! bytes, grouped into batches of at most `batch_size` chunks. Only the
//! final chunk of the file carries `is_last`; the final chunk of every
//! batch carries `batch_end`.

use crate::Tunables;

/// One chunk's byte range within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// First byte of the chunk.
    pub offset: u64,
    /// Length in bytes.
    pub len: usize,
    /// Final chunk of the file.
    pub is_last: bool,
    /// Final chunk of its batch.
    pub batch_end: bool,
}

impl ChunkSpec {
    /// One past the last byte of the chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// The chunks of one batch, covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Offset the batch starts at.
    pub start: u64,
    /// Offset one past the batch's last byte.
    pub end: u64,
    /// Chunks in send order.
    pub chunks: Vec<ChunkSpec>,
}

impl BatchPlan {
    /// Bytes covered by the batch.
    pub fn byte_len(&self) -> u64 {
        self.end - self.start
    }
}

/// Plan the batch that starts at `offset`.
///
/// Returns `None` once `offset` has reached `total`.
pub fn plan_batch(offset: u64, total: u64, tunables: &Tunables) -> Option<BatchPlan> {
    if offset >= total {
        return None;
    }
    let chunk_size = tunables.chunk_size.max(1) as u64;
    let batch_bytes = chunk_size.saturating_mul(tunables.batch_size.max(1) as u64);
    let end = offset.saturating_add(batch_bytes).min(total);

    let mut chunks = Vec::new();
    let mut at = offset;
    while at < end {
        let chunk_end = (at + chunk_size).min(end);
        chunks.push(ChunkSpec {
            offset: at,
            len: (chunk_end - at) as usize,
            is_last: chunk_end == total,
            batch_end: chunk_end == end,
        });
        at = chunk_end;
    }

    Some(BatchPlan {
        start: offset,
        end,
        chunks,
    })
}

/// Every chunk of a `total`-byte file, in order.
pub fn partition(total: u64, tunables: &Tunables) -> Vec<ChunkSpec> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while let Some(batch) = plan_batch(offset, total, tunables) {
        offset = batch.end;
        chunks.extend(batch.chunks);
    }
    chunks
}
