//! Per-sequence block tables and the manager that owns the block pool.
//!
//! A [`BlockTable`] maps a sequence's logical token positions to physical
//! blocks, like a page table maps virtual pages to frames. Token `p` lives
//! at slot `blocks[p / block_size] * block_size + p % block_size`.
//!
//! The [`BlockTableManager`] couples the tables to the [`BlockStore`] and
//! the [`PrefixCache`]: it allocates slots for scheduled tokens, forks
//! tables copy-on-write, registers full blocks under their content hash,
//! and returns blocks to the pool when references drop.

use std::collections::HashMap;

use tracing::trace;

use crate::core::block::{chain_block_hashes, compute_num_blocks, BlockId};
use crate::core::block_store::BlockStore;
use crate::core::prefix_cache::PrefixCache;
use crate::core::sequence::{SequenceGroup, SequenceId};
use crate::error::{Error, Result};

/// Physical copy directive for the model runner: `(src, dst)`.
pub type BlockCopy = (BlockId, BlockId);

/// Ordered physical blocks covering one sequence's KV context.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    /// Token slots assigned so far; the last block holds
    /// `num_tokens - (len - 1) * block_size` of them.
    num_tokens: usize,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Occupancy of the last block, in `[1, block_size]` when non-empty.
    pub fn filled_in_last_block(&self) -> usize {
        if self.num_tokens == 0 {
            0
        } else {
            self.num_tokens - (self.blocks.len() - 1) * self.block_size
        }
    }

    /// New blocks required to cover `total_tokens` positions.
    pub fn blocks_needed_for(&self, total_tokens: usize) -> usize {
        compute_num_blocks(total_tokens, self.block_size).saturating_sub(self.blocks.len())
    }

    pub fn append_block(&mut self, block_id: BlockId) {
        self.blocks.push(block_id);
    }

    fn replace_block(&mut self, idx: usize, block_id: BlockId) {
        self.blocks[idx] = block_id;
    }

    fn set_num_tokens(&mut self, num_tokens: usize) {
        self.num_tokens = num_tokens;
    }

    /// Physical slot indices for positions `[start, start + n)`.
    pub fn slot_mapping(&self, start: usize, n: usize) -> Vec<usize> {
        (start..start + n)
            .map(|pos| {
                let block = self.blocks[pos / self.block_size];
                block * self.block_size + pos % self.block_size
            })
            .collect()
    }

    /// Shrink the table to cover exactly `target_tokens` positions,
    /// returning the block ids cut off the tail. The caller owns releasing
    /// them back to the store.
    pub fn trim_to(&mut self, target_tokens: usize) -> Vec<BlockId> {
        debug_assert!(target_tokens <= self.num_tokens);
        self.num_tokens = target_tokens;
        let required = compute_num_blocks(target_tokens, self.block_size);
        if self.blocks.len() > required {
            self.blocks.split_off(required)
        } else {
            Vec::new()
        }
    }

    /// Empty the table, returning every block id for release.
    pub fn release_all(&mut self) -> Vec<BlockId> {
        self.num_tokens = 0;
        std::mem::take(&mut self.blocks)
    }
}

/// Owns the block pool, the prefix index and every sequence's block table.
#[derive(Debug)]
pub struct BlockTableManager {
    store: BlockStore,
    index: PrefixCache,
    tables: HashMap<SequenceId, BlockTable>,
    block_size: usize,
    enable_prefix_caching: bool,
}

impl BlockTableManager {
    pub fn new(num_kv_blocks: usize, block_size: usize, enable_prefix_caching: bool) -> Self {
        Self {
            store: BlockStore::new(num_kv_blocks),
            index: PrefixCache::new(),
            tables: HashMap::new(),
            block_size,
            enable_prefix_caching,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.store.num_free()
    }

    pub fn num_total_blocks(&self) -> usize {
        self.store.num_blocks()
    }

    /// Fraction of the pool currently referenced.
    pub fn cache_usage(&self) -> f32 {
        if self.store.num_blocks() == 0 {
            return 0.0;
        }
        self.store.num_used() as f32 / self.store.num_blocks() as f32
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn has_block_table(&self, seq_id: SequenceId) -> bool {
        self.tables.contains_key(&seq_id)
    }

    pub fn block_table(&self, seq_id: SequenceId) -> Option<&BlockTable> {
        self.tables.get(&seq_id)
    }

    /// Snapshot of a sequence's physical block ids.
    pub fn block_ids(&self, seq_id: SequenceId) -> Option<Vec<BlockId>> {
        self.tables.get(&seq_id).map(|t| t.block_ids().to_vec())
    }

    pub fn ref_count(&self, block_id: BlockId) -> usize {
        self.store.ref_count(block_id)
    }

    /// Blocks the group needs to advance each schedulable sequence by
    /// `num_tokens` positions, counting copy-on-write clones.
    pub fn blocks_needed_for_group(&self, group: &SequenceGroup, num_tokens: usize) -> usize {
        let target = group.num_processed_tokens() + num_tokens;
        group
            .schedulable_seq_ids()
            .iter()
            .map(|&seq_id| self.blocks_needed_for_seq(seq_id, target))
            .sum()
    }

    fn blocks_needed_for_seq(&self, seq_id: SequenceId, target_tokens: usize) -> usize {
        match self.tables.get(&seq_id) {
            None => compute_num_blocks(target_tokens, self.block_size),
            Some(table) => {
                if target_tokens <= table.num_tokens() {
                    return 0;
                }
                let mut needed = table.blocks_needed_for(target_tokens);
                // Extending into a shared, partially filled last block clones it.
                if table.num_tokens() % self.block_size != 0 {
                    let last = *table.block_ids().last().expect("non-empty table");
                    if self.store.ref_count(last) > 1 {
                        needed += 1;
                    }
                }
                needed
            }
        }
    }

    /// Assign slots for this step's scheduled tokens of every schedulable
    /// sequence in the group.
    ///
    /// Allocates fresh blocks where the context grows, clones shared
    /// partially filled last blocks (copy-on-write), and registers blocks
    /// that became full in the prefix index. The returned copies must be
    /// performed by the model runner before the forward pass reads them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if the pool runs dry; the caller is
    /// expected to have checked [`blocks_needed_for_group`] first.
    ///
    /// [`blocks_needed_for_group`]: Self::blocks_needed_for_group
    pub fn append_slots(&mut self, group: &SequenceGroup) -> Result<Vec<BlockCopy>> {
        let k = group.num_scheduled_tokens();
        let target = group.num_processed_tokens() + k;
        let mut copies = Vec::new();

        for seq_id in group.schedulable_seq_ids() {
            let table = self
                .tables
                .entry(seq_id)
                .or_insert_with(|| BlockTable::new(self.block_size));
            if target <= table.num_tokens() {
                // Re-streaming into already assigned slots (restored prefix
                // or rewound suffix); nothing to allocate.
                continue;
            }

            // Copy-on-write: the extension writes into the last block, which
            // must be exclusively owned.
            if table.num_tokens() % self.block_size != 0 {
                let last_idx = table.num_blocks() - 1;
                let last = table.block_ids()[last_idx];
                if self.store.ref_count(last) > 1 {
                    let clone = self.store.allocate()?;
                    table.replace_block(last_idx, clone);
                    copies.push((last, clone));
                    let hash = self.store.content_hash(last);
                    if self.store.release(last) {
                        if let Some(h) = hash {
                            self.index.remove(h, last);
                        }
                    }
                    trace!(seq_id, src = last, dst = clone, "copy-on-write clone");
                }
            }

            while table.num_blocks() * self.block_size < target {
                let block = self.store.allocate()?;
                table.append_block(block);
            }
            table.set_num_tokens(target);

            if self.enable_prefix_caching {
                if let Some(tokens) = group.all_token_ids(seq_id) {
                    self.register_full_blocks(seq_id, &tokens);
                }
            }
        }
        Ok(copies)
    }

    /// Hash every full block of the sequence whose tokens are all known,
    /// deduplicating against the prefix index.
    fn register_full_blocks(&mut self, seq_id: SequenceId, tokens: &[u32]) {
        let hashes = chain_block_hashes(tokens, self.block_size);
        let table = match self.tables.get_mut(&seq_id) {
            Some(t) => t,
            None => return,
        };
        let full_blocks = (table.num_tokens() / self.block_size).min(hashes.len());

        for i in 0..full_blocks {
            let block = table.block_ids()[i];
            if self.store.content_hash(block).is_some() {
                continue;
            }
            let hash = hashes[i];
            match self.index.get(hash) {
                Some(cached) if cached != block => {
                    // Same content and history already live in the cache:
                    // share the cached block and drop ours.
                    self.store.retain(cached);
                    table.replace_block(i, cached);
                    let old_hash = self.store.content_hash(block);
                    if self.store.release(block) {
                        if let Some(h) = old_hash {
                            self.index.remove(h, block);
                        }
                    }
                    trace!(seq_id, block, cached, "deduplicated full block");
                }
                Some(_) => {}
                None => {
                    self.store.set_content_hash(block, hash);
                    self.index.insert(hash, block);
                }
            }
        }
    }

    /// Attach prefix-cached blocks to a freshly admitted group.
    ///
    /// Walks the prompt block by block, probing the index with the chained
    /// hashes, and attaches every hit with an extra reference. The matched
    /// positions are marked processed, except that the final prompt token is
    /// always left uncomputed so the forward pass still produces the logits
    /// the first sampled token comes from.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        if !self.enable_prefix_caching || !group.is_waiting() {
            return;
        }
        let seq_ids = group.schedulable_seq_ids();
        let seq_id = match seq_ids.as_slice() {
            [only] => *only,
            _ => return,
        };
        if self.tables.contains_key(&seq_id) {
            return;
        }

        let hashes = chain_block_hashes(group.prompt_ids(), self.block_size);
        let mut table = BlockTable::new(self.block_size);
        for hash in hashes {
            match self.index.get(hash) {
                Some(block) => {
                    self.store.retain(block);
                    table.append_block(block);
                }
                None => break,
            }
        }
        if table.num_blocks() == 0 {
            return;
        }
        let matched_tokens = table.num_blocks() * self.block_size;
        table.set_num_tokens(matched_tokens);

        let processed = matched_tokens.min(group.prompt_len().saturating_sub(1));
        trace!(
            request_id = group.request_id(),
            matched_tokens,
            processed,
            "restored prefix-cached blocks"
        );
        self.tables.insert(seq_id, table);
        group.advance_processed(processed);
    }

    /// Fork a child's block table from its parent: a shallow copy with every
    /// block retained. Divergence is resolved later by copy-on-write.
    pub fn fork_sequence(&mut self, parent_id: SequenceId, child_id: SequenceId) -> Result<()> {
        let table = self
            .tables
            .get(&parent_id)
            .ok_or(Error::SequenceNotFound(parent_id))?
            .clone();
        for &block in table.block_ids() {
            self.store.retain(block);
        }
        self.tables.insert(child_id, table);
        Ok(())
    }

    /// Drop a sequence's table and release every block it referenced.
    pub fn free_sequence(&mut self, seq_id: SequenceId) {
        if let Some(mut table) = self.tables.remove(&seq_id) {
            for block in table.release_all() {
                self.release_block(block);
            }
        }
    }

    /// Release the trailing blocks of a sequence past `target_tokens`.
    pub fn trim_sequence(&mut self, seq_id: SequenceId, target_tokens: usize) {
        if let Some(table) = self.tables.get_mut(&seq_id) {
            if target_tokens >= table.num_tokens() {
                return;
            }
            for block in table.trim_to(target_tokens) {
                self.release_block(block);
            }
        }
    }

    fn release_block(&mut self, block: BlockId) {
        let hash = self.store.content_hash(block);
        if self.store.release(block) {
            if let Some(h) = hash {
                self.index.remove(h, block);
            }
        }
    }
}
