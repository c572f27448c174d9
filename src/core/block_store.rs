//! Fixed pool of KV cache blocks with reference counting.
//!
//! The store owns every physical block and nothing else: it hands out free
//! blocks, counts references, and takes blocks back when the last reference
//! drops. Free blocks are handed out in ascending id order, which keeps
//! allocation deterministic for a given call sequence.

use std::collections::BTreeSet;

use crate::core::block::{Block, BlockId};
use crate::error::{Error, Result};

/// Pool of `num_blocks` KV cache blocks.
#[derive(Debug)]
pub struct BlockStore {
    blocks: Vec<Block>,
    free: BTreeSet<BlockId>,
}

impl BlockStore {
    /// Create a store with all blocks free.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: (0..num_blocks).map(Block::new).collect(),
            free: (0..num_blocks).collect(),
        }
    }

    /// Total number of blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of free blocks.
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Number of blocks with at least one reference.
    pub fn num_used(&self) -> usize {
        self.blocks.len() - self.free.len()
    }

    /// Whether `n` blocks can be allocated right now.
    pub fn can_allocate(&self, n: usize) -> bool {
        self.free.len() >= n
    }

    /// Allocate the lowest-id free block with a reference count of one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] when the pool is exhausted.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let id = *self.free.iter().next().ok_or(Error::OutOfBlocks)?;
        self.free.remove(&id);
        let block = &mut self.blocks[id];
        block.set_content_hash(None);
        block.retain();
        Ok(id)
    }

    /// Increment the reference count of an allocated block.
    pub fn retain(&mut self, id: BlockId) {
        self.blocks[id].retain();
    }

    /// Decrement the reference count of a block.
    ///
    /// When the count reaches zero the block returns to the free set and its
    /// content hash is cleared. Returns `true` if the block became free.
    pub fn release(&mut self, id: BlockId) -> bool {
        let block = &mut self.blocks[id];
        if block.release() == 0 {
            block.set_content_hash(None);
            self.free.insert(id);
            true
        } else {
            false
        }
    }

    /// Current reference count of a block.
    pub fn ref_count(&self, id: BlockId) -> usize {
        self.blocks[id].ref_count()
    }

    /// Content hash of a full block, if registered.
    pub fn content_hash(&self, id: BlockId) -> Option<u64> {
        self.blocks[id].content_hash()
    }

    /// Record the content hash of a block that just became full.
    pub fn set_content_hash(&mut self, id: BlockId, hash: u64) {
        self.blocks[id].set_content_hash(Some(hash));
    }
}
