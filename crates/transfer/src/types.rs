use blockput_protocol::ChunkReceipt;

/// A chunk read from the source file, waiting in the read-ahead queue.
#[derive(Debug, Clone)]
pub struct LoadedChunk {
    /// 0-based chunk index.
    pub index: usize,
    /// Byte offset within the file.
    pub offset: u64,
    /// Byte length of this chunk.
    pub length: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
    /// Content fingerprint of `data` (empty when fingerprinting is off).
    pub fingerprint: String,
}

/// Index-addressed receipts, one slot per chunk.
///
/// Slots are filled in completion order but always read back in index
/// order.
#[derive(Debug, Clone, Default)]
pub struct ReceiptBook {
    slots: Vec<Option<ChunkReceipt>>,
    filled: usize,
}

impl ReceiptBook {
    /// Creates an empty book for `chunk_count` chunks.
    pub fn new(chunk_count: usize) -> Self {
        Self {
            slots: vec![None; chunk_count],
            filled: 0,
        }
    }

    /// Stores the receipt of chunk `index`. Returns `false` if `index` is
    /// out of range.
    pub fn insert(&mut self, index: usize, receipt: ChunkReceipt) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(receipt);
        true
    }

    /// Number of chunks that hold a receipt.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// `true` iff every chunk holds a receipt.
    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// All slots in index order, as persisted in the resume cache.
    pub fn slots(&self) -> &[Option<ChunkReceipt>] {
        &self.slots
    }

    /// Receipt tokens in index order, or `None` while any slot is empty.
    pub fn tokens(&self) -> Option<Vec<&str>> {
        self.slots
            .iter()
            .map(|slot| slot.as_ref().map(|r| r.ctx.as_str()))
            .collect()
    }
}
