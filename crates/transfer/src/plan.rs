use crate::TransferError;

/// Chunk layout of a file and the upload strategy chosen for it.
///
/// Computed once when a session is created and never re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
    /// Whole-file upload instead of blocks + merge.
    pub direct: bool,
}

impl ChunkPlan {
    /// Plans an upload of `total_size` bytes.
    ///
    /// Direct upload is chosen when `force_direct` is set or the file is
    /// smaller than `direct_threshold`.
    pub fn new(
        total_size: u64,
        chunk_size: u64,
        direct_threshold: u64,
        force_direct: bool,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        let chunk_count = usize::try_from(total_size.div_ceil(chunk_size))
            .map_err(|_| TransferError::InvalidChunkSize(chunk_size))?;

        Ok(Self {
            total_size,
            chunk_size,
            chunk_count,
            direct: force_direct || total_size < direct_threshold,
        })
    }

    /// Byte offset of chunk `index`.
    pub fn chunk_offset(&self, index: usize) -> u64 {
        (index as u64).saturating_mul(self.chunk_size)
    }

    /// Byte length of chunk `index`; only the last chunk may be shorter.
    pub fn chunk_len(&self, index: usize) -> u64 {
        let offset = self.chunk_offset(index);
        self.total_size.saturating_sub(offset).min(self.chunk_size)
    }

    /// Total bytes covered by the given chunk indices.
    ///
    /// Counts every chunk at full size, then removes the over-count of the
    /// short last chunk when it is part of the set.
    pub fn bytes_for<'a>(&self, indices: impl IntoIterator<Item = &'a usize>) -> u64 {
        let mut count = 0u64;
        let mut has_last = false;
        for &index in indices {
            count += 1;
            if index + 1 == self.chunk_count {
                has_last = true;
            }
        }
        // u128 keeps `count * chunk_size` exact for any u64 inputs.
        let mut bytes = u128::from(count) * u128::from(self.chunk_size);
        if has_last {
            bytes -= u128::from(self.chunk_size - self.chunk_len(self.chunk_count - 1));
        }
        u64::try_from(bytes).unwrap_or(u64::MAX).min(self.total_size)
    }

    /// Number of chunks that fit in `max_memory`, never less than one.
    pub fn max_loaded_chunks(&self, max_memory: u64) -> usize {
        usize::try_from(max_memory / self.chunk_size)
            .unwrap_or(usize::MAX)
            .max(1)
    }
}
