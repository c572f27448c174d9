//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A block holds the key/value
//! state for `block_size` token positions and is the unit of allocation,
//! sharing and preemption.

use xxhash_rust::xxh64::xxh64;

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Identifier of a physical block in the pool.
pub type BlockId = usize;

/// Compute a cumulative hash for a block of tokens including its prefix
/// chain.
///
/// The hash covers the token ids spanned by the block and the hash of the
/// preceding block, so two blocks collide only when both their contents and
/// their entire history match.
///
/// # Example
///
/// ```
/// use nano_batch::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut data = Vec::with_capacity(8 + token_ids.len() * 4);
    if let Some(parent) = parent_hash {
        data.extend_from_slice(&parent.to_le_bytes());
    }
    for &token in token_ids {
        data.extend_from_slice(&token.to_le_bytes());
    }
    xxh64(&data, 0)
}

/// Chained hashes for every *full* block of a token sequence.
///
/// The trailing partial block, if any, is excluded: only full blocks are
/// immutable and therefore content-addressable.
pub fn chain_block_hashes(token_ids: &[u32], block_size: usize) -> Vec<u64> {
    let mut hashes = Vec::with_capacity(token_ids.len() / block_size);
    let mut parent = None;
    for chunk in token_ids.chunks(block_size) {
        if chunk.len() < block_size {
            break;
        }
        let hash = hash_token_block(chunk, parent);
        hashes.push(hash);
        parent = Some(hash);
    }
    hashes
}

/// Number of blocks needed for a sequence of the given length.
///
/// # Example
///
/// ```
/// use nano_batch::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}

/// Bookkeeping record for one physical block.
///
/// Blocks are indistinguishable except by id. The reference count tracks
/// how many block tables (and prefix-cache entries do not count) point at
/// the block; a block with zero references is free.
#[derive(Debug, Clone)]
pub struct Block {
    block_id: BlockId,
    ref_count: usize,
    content_hash: Option<u64>,
}

impl Block {
    /// Create a block record in the free state.
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            ref_count: 0,
            content_hash: None,
        }
    }

    /// Get the block id.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// A block with no references is free.
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// Content hash, set only once the block is full and immutable.
    pub fn content_hash(&self) -> Option<u64> {
        self.content_hash
    }

    pub(crate) fn set_content_hash(&mut self, hash: Option<u64>) {
        self.content_hash = hash;
    }

    pub(crate) fn retain(&mut self) {
        self.ref_count += 1;
    }

    pub(crate) fn release(&mut self) -> usize {
        debug_assert!(self.ref_count > 0, "release of free block {}", self.block_id);
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}
