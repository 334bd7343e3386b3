//! Chain state: the block index, the UTXO set and the active tip, moved
//! together.
//!
//! [`ChainState`] is the single writer over all persistent ledger state.
//! Blocks arrive through [`ChainState::process_block`] (or the
//! `check_block` / `accept_block` pair). A block extending the tip is applied
//! at once; any other block is stored untrusted and, if the fork-choice rule
//! prefers it, the tip is moved to it by undoing back to the fork point and
//! replaying the new branch. A branch that fails to replay is deleted and the
//! chain settles on the best branch that remains.
//!
//! After every successful commit or undo, the UTXO store's last applied block
//! is the tip. A storage failure halts the chain: every later mutating call
//! fails with [`ChainError::Halted`] until it is reopened.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use quarry_core::error::{BlockError, ChainError, Rejection, StoreError};
use quarry_core::params::ConsensusParams;
use quarry_core::traits::{BlockStore, ChainListener, HeaderRecord, SignatureVerifier};
use quarry_core::types::{Block, Hash256, OutPoint};
use tracing::{debug, error, info, warn};

use crate::apply::{ApplyContext, BlockChanges, apply_block};
use crate::index::{BlockIndex, BlockNode, NodeId};
use crate::utxo::{UnspentOutput, UtxoOptions, UtxoStore};
use crate::validator::{self, CheckedBlock, verify_flags_for};
use crate::verify::VerifyPool;

#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    pub utxo: UtxoOptions,
    /// Script verification threads; zero verifies inline.
    pub verify_threads: usize,
    /// Undo this many blocks right after opening, then stop.
    pub undo_blocks: u64,
    /// Do not replay stored blocks past the UTXO tip when opening.
    pub do_not_rescan: bool,
}

pub struct ChainState<S: BlockStore> {
    params: ConsensusParams,
    index: BlockIndex,
    tip: NodeId,
    utxo: UtxoStore,
    blocks: S,
    pool: VerifyPool,
    verifier: Arc<dyn SignatureVerifier>,
    listener: Option<Arc<dyn ChainListener>>,
    last_known_height: u64,
    halted: Option<String>,
}

impl<S: BlockStore> std::fmt::Debug for ChainState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainState")
            .field("network", &self.params.network)
            .field("blocks", &self.index.len())
            .field("height", &self.height())
            .field("tip", &self.tip_hash())
            .finish_non_exhaustive()
    }
}

impl<S: BlockStore> ChainState<S> {
    /// Open the chain: load the UTXO set, rebuild the block index from the
    /// store's header log, and locate the tip at the UTXO set's last block.
    pub fn open(
        params: ConsensusParams,
        blocks: S,
        verifier: Arc<dyn SignatureVerifier>,
        options: ChainOptions,
    ) -> Result<Self, ChainError> {
        let mut utxo = UtxoStore::open(options.utxo.clone())?;
        let pool = VerifyPool::new(options.verify_threads)?;
        let index = build_index(&params, blocks.headers()?);

        let (last_height, last_hash) = utxo.last_block();
        let tip = if last_hash.is_zero() {
            index.root()
        } else {
            index.lookup(&last_hash).ok_or_else(|| {
                StoreError::Corrupt(format!("utxo last block {last_hash} is not in the block index"))
            })?
        };
        if index[tip].height != last_height {
            return Err(StoreError::HeightMismatch { expected: index[tip].height, got: last_height }.into());
        }

        let dropped = utxo.retain_undo(|height, hash| {
            index.ancestor(tip, height).is_some_and(|id| index[id].hash == *hash)
        })?;
        if dropped > 0 {
            warn!(dropped, "discarded undo records off the active branch");
        }

        let last_known_height = index.ids().map(|id| index[id].height).max().unwrap_or(0);
        let mut chain = Self {
            params,
            index,
            tip,
            utxo,
            blocks,
            pool,
            verifier,
            listener: None,
            last_known_height,
            halted: None,
        };
        info!(
            blocks = chain.index.len(),
            height = chain.height(),
            tip = %chain.tip_hash(),
            verify_threads = chain.pool.threads(),
            "chain opened"
        );

        if options.undo_blocks > 0 {
            info!(count = options.undo_blocks, "undoing blocks on request");
            for _ in 0..options.undo_blocks {
                chain.undo_last_block()?;
            }
            return Ok(chain);
        }

        if !options.do_not_rescan {
            let end = chain.index.farthest_node(chain.index.root(), chain.params.fork_choice);
            if chain.index.prefers(end, chain.tip, chain.params.fork_choice) {
                let end_hash = chain.index[end].hash;
                info!(from = chain.height(), to = chain.index[end].height, "replaying stored blocks");
                match chain.move_to_block(&end_hash) {
                    Ok(()) => {}
                    Err(e @ ChainError::ReorgFallback { .. }) => warn!(error = %e, "replay stopped early"),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(chain)
    }

    pub fn set_listener(&mut self, listener: Arc<dyn ChainListener>) {
        self.listener = Some(listener);
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn tip(&self) -> NodeId {
        self.tip
    }

    pub fn tip_node(&self) -> &BlockNode {
        &self.index[self.tip]
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.index[self.tip].hash
    }

    pub fn height(&self) -> u64 {
        self.index[self.tip].height
    }

    pub fn utxo(&self) -> &UtxoStore {
        &self.utxo
    }

    pub fn blocks(&self) -> &S {
        &self.blocks
    }

    /// Highest block height known to exist, for deciding which blocks keep
    /// undo data.
    pub fn last_known_height(&self) -> u64 {
        self.last_known_height
    }

    /// Raise the known height, for example from headers announced by peers.
    pub fn note_known_height(&mut self, height: u64) {
        self.last_known_height = self.last_known_height.max(height);
    }

    /// The storage failure that stopped block processing, if any.
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Deepest side-branch attachment the chain can still reorganize to:
    /// the moving checkpoint, or the undo window if that is shorter.
    pub fn reorg_depth(&self) -> u64 {
        self.params.moving_checkpoint_depth.min(self.utxo.undo_window())
    }

    pub fn get_unspent(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, ChainError> {
        Ok(self.utxo.get(outpoint)?)
    }

    // --- Block intake ---

    pub fn check_block(&self, block: &Block, trusted: bool) -> Result<CheckedBlock, Rejection> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.check_block_at(block, trusted, now)
    }

    /// [`Self::check_block`] with an explicit current time.
    pub fn check_block_at(&self, block: &Block, trusted: bool, now: u64) -> Result<CheckedBlock, Rejection> {
        let depth = self.reorg_depth();
        validator::check_block_within(&self.index, self.tip, &self.params, block, trusted, now, depth)
    }

    /// Check and accept `block`.
    pub fn process_block(&mut self, block: &Block, trusted: bool) -> Result<(), ChainError> {
        self.ensure_running()?;
        let checked = self.check_block(block, trusted)?;
        self.accept_block(block, checked)
    }

    /// Link a checked block into the index and, if it extends the tip, apply
    /// it. A block on another branch is stored and may trigger a reorg.
    ///
    /// `checked` must come from checking this very block against the current
    /// index; a check that went stale (its parent was deleted since) is
    /// refused as deferred.
    pub fn accept_block(&mut self, block: &Block, checked: CheckedBlock) -> Result<(), ChainError> {
        self.ensure_running()?;
        let result = self.accept_checked(block, checked);
        self.halt_on_fatal(result)
    }

    fn accept_checked(&mut self, block: &Block, checked: CheckedBlock) -> Result<(), ChainError> {
        let CheckedBlock { hash, parent, size, trusted, flags, .. } = checked;
        if hash != block.hash() {
            return Err(ChainError::UnknownBlock(hash));
        }
        if self.index.contains(&hash) {
            return Err(Rejection::benign(BlockError::AlreadyKnown(hash)).into());
        }
        let prev = block.header.prev_hash;
        let height = match self.index.get(parent) {
            Some(node) if node.hash == prev => node.height + 1,
            _ => return Err(Rejection::deferred(BlockError::UnknownParent(prev)).into()),
        };
        let id = self
            .index
            .insert(parent, hash, block.header)
            .ok_or(ChainError::UnknownBlock(prev))?;
        self.index.set_payload(id, block.transactions.len() as u32, size as u32, trusted);

        if parent == self.tip {
            let changes = match self.apply(block, height, flags, trusted) {
                Ok(changes) => changes,
                Err(e) => {
                    warn!(height, %hash, error = %e, "block failed to apply");
                    self.index.detach(id);
                    return Err(e);
                }
            };
            self.index.set_trusted(id);
            self.blocks.put(height, block, true)?;
            self.commit(id, block, &changes)?;
            self.note_known_height(height);
            return Ok(());
        }

        self.blocks.put(height, block, trusted)?;
        self.note_known_height(height);
        if self.index.prefers(id, self.tip, self.params.fork_choice) {
            info!(height, %hash, tip_height = self.height(), "new branch is preferred, reorganizing");
            self.move_to(&hash)
        } else {
            debug!(height, %hash, "stored side-branch block");
            Ok(())
        }
    }

    // --- Tip movement ---

    /// Make `hash` the tip: undo to the fork point, then replay its branch.
    ///
    /// If the branch cannot be fully replayed the chain settles on the best
    /// remaining branch and [`ChainError::ReorgFallback`] reports where it
    /// ended up.
    pub fn move_to_block(&mut self, hash: &Hash256) -> Result<(), ChainError> {
        self.ensure_running()?;
        let result = self.move_to(hash);
        self.halt_on_fatal(result)
    }

    fn move_to(&mut self, hash: &Hash256) -> Result<(), ChainError> {
        let target = self.index.lookup(hash).ok_or(ChainError::UnknownBlock(*hash))?;
        let target_height = self.index[target].height;
        self.reorg_to(target)?;

        let choice = self.params.fork_choice;
        while self.tip_hash() != *hash {
            let best = self.index.farthest_node(self.index.root(), choice);
            if best == self.tip {
                break;
            }
            let before = (self.tip, self.index.len());
            match self.reorg_to(best) {
                Ok(()) => {}
                Err(ChainError::MissingBlockData { .. } | ChainError::ReorgFallback { .. }) => break,
                Err(e) => return Err(e),
            }
            if (self.tip, self.index.len()) == before {
                break;
            }
        }

        if self.tip_hash() != *hash {
            return Err(ChainError::ReorgFallback {
                target: *hash,
                target_height,
                reached: self.tip_hash(),
                reached_height: self.height(),
            });
        }
        Ok(())
    }

    fn reorg_to(&mut self, target: NodeId) -> Result<(), ChainError> {
        let fork = self.fork_with_payloads(target)?;
        let undo_count = self.height() - self.index[fork].height;
        if undo_count > 0 {
            info!(
                from = self.height(),
                to = self.index[target].height,
                fork = self.index[fork].height,
                undo_count,
                "reorganizing"
            );
        }
        while self.tip != fork {
            self.undo_tip()?;
        }
        self.parse_till(target)?;
        if undo_count > 0 {
            info!(height = self.height(), tip = %self.tip_hash(), "reorganization finished");
        }
        Ok(())
    }

    /// Fork point of the tip and `target`, checking that every block between
    /// it and `target` has a stored payload and every block between it and
    /// the tip can be undone. Nothing is changed when either check fails.
    fn fork_with_payloads(&self, target: NodeId) -> Result<NodeId, ChainError> {
        let missing = |id: NodeId| {
            let node = &self.index[id];
            ChainError::MissingBlockData { hash: node.hash, height: node.height }
        };
        let mut cur = target;
        let mut last = self.tip;
        while self.index[cur].height > self.index[last].height {
            cur = self.index.parent(cur).ok_or_else(|| missing(cur))?;
            if !self.index[cur].has_payload() {
                return Err(missing(cur));
            }
        }
        while self.index[last].height > self.index[cur].height {
            last = self.index.parent(last).ok_or_else(|| missing(last))?;
        }
        while cur != last {
            let parent = self.index.parent(cur).ok_or_else(|| missing(cur))?;
            if !self.index[parent].has_payload() {
                return Err(missing(parent));
            }
            cur = parent;
            last = self.index.parent(last).ok_or_else(|| missing(last))?;
        }

        let fork_height = self.index[cur].height;
        if let Some(height) = (fork_height + 1..=self.height()).find(|h| !self.utxo.has_undo(*h)) {
            let node = &self.index[target];
            warn!(
                target = %node.hash,
                fork = fork_height,
                missing_undo = height,
                "branch forks below the undo data, not reorganizing"
            );
            return Err(ChainError::ReorgFallback {
                target: node.hash,
                target_height: node.height,
                reached: self.tip_hash(),
                reached_height: self.height(),
            });
        }
        Ok(cur)
    }

    /// Apply stored blocks from the tip towards its descendant `hash`,
    /// stopping at the first block without a payload. A block that fails to
    /// apply is deleted together with its descendants.
    pub fn parse_till_block(&mut self, hash: &Hash256) -> Result<(), ChainError> {
        self.ensure_running()?;
        let result = match self.index.lookup(hash) {
            Some(end) => self.parse_till(end),
            None => Err(ChainError::UnknownBlock(*hash)),
        };
        self.halt_on_fatal(result)
    }

    fn parse_till(&mut self, end: NodeId) -> Result<(), ChainError> {
        if self.index.ancestor(end, self.height()) != Some(self.tip) {
            return Ok(());
        }
        while self.tip != end {
            let Some(next) = self.index.find_path_to(self.tip, end) else {
                break;
            };
            let (hash, height) = (self.index[next].hash, self.index[next].height);
            if !self.index[next].has_payload() {
                debug!(height, %hash, "stopping at block without payload");
                break;
            }
            let stored = self
                .blocks
                .get(&hash)?
                .ok_or(ChainError::MissingBlockData { hash, height })?;
            let flags = verify_flags_for(height, stored.block.header.timestamp, &self.params);
            let changes = match self.apply(&stored.block, height, flags, stored.trusted) {
                Ok(changes) => changes,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(height, %hash, error = %e, "stored block failed to apply");
                    self.remove_branch(next)?;
                    break;
                }
            };
            if !stored.trusted {
                self.blocks.mark_trusted(&hash)?;
                self.index.set_trusted(next);
            }
            self.commit(next, &stored.block, &changes)?;
        }
        Ok(())
    }

    /// Reverse the tip block and move the tip to its parent.
    pub fn undo_last_block(&mut self) -> Result<(), ChainError> {
        self.ensure_running()?;
        let result = self.undo_tip();
        self.halt_on_fatal(result)
    }

    fn undo_tip(&mut self) -> Result<(), ChainError> {
        let node = &self.index[self.tip];
        let (hash, height) = (node.hash, node.height);
        let parent = node.parent.ok_or(StoreError::UndoMissing { height })?;
        let parent_hash = self.index[parent].hash;

        let stored = self
            .blocks
            .get(&hash)?
            .ok_or_else(|| StoreError::Corrupt(format!("tip block {hash} at height {height} is not stored")))?;
        self.utxo.undo(&stored.block, height, parent_hash)?;
        self.tip = parent;
        info!(height, %hash, "block undone");
        if let Some(listener) = &self.listener {
            listener.block_disconnected(&stored.block, height);
        }
        Ok(())
    }

    /// Remove `hash` and every block built on it from the index, and flag
    /// them invalid in the block store. Blocks on the active chain are left
    /// alone. Returns the removed hashes.
    pub fn delete_branch(&mut self, hash: &Hash256) -> Result<Vec<Hash256>, ChainError> {
        self.ensure_running()?;
        let result = match self.index.lookup(hash) {
            Some(id) => self.remove_branch(id),
            None => Err(ChainError::UnknownBlock(*hash)),
        };
        self.halt_on_fatal(result)
    }

    fn remove_branch(&mut self, id: NodeId) -> Result<Vec<Hash256>, ChainError> {
        if self.index.on_active_branch(id, self.tip) {
            warn!(height = self.index[id].height, "refusing to delete a block on the active chain");
            return Ok(Vec::new());
        }
        let height = self.index[id].height;
        let removed = self.index.remove_subtree(id);
        for hash in &removed {
            self.blocks.mark_invalid(hash)?;
        }
        warn!(height, count = removed.len(), "deleted branch");
        Ok(removed)
    }

    // --- Housekeeping ---

    /// Background work for idle periods. Returns whether anything started.
    pub fn idle(&mut self) -> bool {
        let blocks = self.blocks.idle();
        self.utxo.idle() || blocks
    }

    pub fn stats(&self) -> String {
        format!(
            "CHAIN: blocks:{}  Height:{}  MedianTime:{}\n{}\n{}",
            self.index.len(),
            self.height(),
            self.index.median_time_past(self.tip),
            self.blocks.stats(),
            self.utxo.stats()
        )
    }

    /// Flush the UTXO set and close the block store.
    pub fn close(&mut self) -> Result<(), ChainError> {
        self.utxo.close();
        self.blocks.close()?;
        info!(height = self.height(), "chain closed");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), ChainError> {
        match &self.halted {
            Some(reason) => Err(ChainError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt_on_fatal<T>(&mut self, result: Result<T, ChainError>) -> Result<T, ChainError> {
        if let Err(e) = &result {
            if e.is_fatal() && self.halted.is_none() {
                error!(height = self.height(), error = %e, "storage failure, block processing halted");
                self.halted = Some(e.to_string());
            }
        }
        result
    }

    fn apply(&self, block: &Block, height: u64, flags: u32, trusted: bool) -> Result<BlockChanges, ChainError> {
        let ctx = ApplyContext {
            height,
            last_known_height: self.last_known_height,
            undo_window: self.utxo.undo_window(),
            coinbase_maturity: self.params.coinbase_maturity,
            flags,
            trusted,
        };
        let utxo = &self.utxo;
        apply_block(block, &ctx, &self.pool, self.verifier.as_ref(), |op| utxo.get(op))
    }

    fn commit(&mut self, id: NodeId, block: &Block, changes: &BlockChanges) -> Result<(), ChainError> {
        let (hash, height) = (self.index[id].hash, self.index[id].height);
        self.utxo.commit(changes, hash)?;
        self.tip = id;
        info!(
            height,
            %hash,
            txs = block.transactions.len(),
            spent = changes.spent_count(),
            "block connected"
        );
        if let Some(listener) = &self.listener {
            listener.block_connected(block, height);
        }
        Ok(())
    }
}

/// Rebuild the block index from a header log. Invalid records are skipped,
/// as are records whose parent is unknown.
fn build_index(params: &ConsensusParams, mut records: Vec<HeaderRecord>) -> BlockIndex {
    let mut index = BlockIndex::new(params.genesis);
    records.retain(|r| !r.invalid());
    records.sort_by_key(|r| r.height);
    let mut orphans = 0usize;
    for rec in records {
        if index.contains(&rec.hash) {
            continue;
        }
        let Some(parent) = index.lookup(&rec.header.prev_hash) else {
            orphans += 1;
            continue;
        };
        if index[parent].height + 1 != rec.height {
            warn!(height = rec.height, hash = %rec.hash, "header record height does not follow its parent");
            continue;
        }
        if let Some(id) = index.insert(parent, rec.hash, rec.header) {
            index.set_payload(id, rec.tx_count, rec.size, rec.trusted());
        }
    }
    if orphans > 0 {
        warn!(orphans, "dropped header records with no known parent");
    }
    index
}
