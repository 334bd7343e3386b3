//! Block index tree.
//!
//! Every known header lives in an arena slot addressed by [`NodeId`]. Parent
//! links are ids, never owning edges, and children are kept in arrival
//! order, which decides ties in [`BlockIndex::farthest_node`]. The index
//! holds side branches and header-only nodes as well as the active chain;
//! which node is the tip is the caller's business.
//!
//! All walks are loops over ids, so arbitrarily deep chains never grow the
//! call stack.

use std::collections::HashMap;
use std::ops::Index;

use primitive_types::U256;
use quarry_core::constants::MEDIAN_TIME_SPAN;
use quarry_core::difficulty::{block_proof, retarget};
use quarry_core::params::{ConsensusParams, ForkChoice};
use quarry_core::types::{BlockHeader, Hash256};

/// Arena slot of a [`BlockNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct BlockNode {
    pub hash: Hash256,
    pub height: u64,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub header: BlockHeader,
    /// Zero while only the header is known.
    pub tx_count: u32,
    pub size: u32,
    pub trusted: bool,
    /// Sum of block proofs from the root to this node, inclusive.
    pub chain_work: U256,
}

impl BlockNode {
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn bits(&self) -> u32 {
        self.header.bits
    }

    pub fn has_payload(&self) -> bool {
        self.tx_count > 0
    }
}

#[derive(Debug)]
pub struct BlockIndex {
    nodes: Vec<Option<BlockNode>>,
    free: Vec<usize>,
    by_hash: HashMap<Hash256, NodeId>,
    root: NodeId,
}

impl Index<NodeId> for BlockIndex {
    type Output = BlockNode;

    /// Panics on an id whose node has been removed.
    fn index(&self, id: NodeId) -> &BlockNode {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("stale block node id {}", id.0),
        }
    }
}

impl BlockIndex {
    /// An index holding only the root. The root counts as having a payload so
    /// that walks towards it terminate.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let root = BlockNode {
            hash,
            height: 0,
            parent: None,
            children: Vec::new(),
            header: genesis,
            tx_count: 1,
            size: BlockHeader::SIZE as u32,
            trusted: true,
            chain_work: block_proof(genesis.bits),
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, NodeId(0));
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            by_hash,
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&BlockNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut BlockNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    /// Ids of every live node, in slot order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| NodeId(i)))
    }

    /// Link a header under `parent`. Returns the existing id if the hash is
    /// already indexed, or `None` if `parent` is not live.
    pub fn insert(&mut self, parent: NodeId, hash: Hash256, header: BlockHeader) -> Option<NodeId> {
        if let Some(id) = self.lookup(&hash) {
            return Some(id);
        }
        let (height, parent_work) = {
            let p = self.get(parent)?;
            (p.height + 1, p.chain_work)
        };
        let node = BlockNode {
            hash,
            height,
            parent: Some(parent),
            children: Vec::new(),
            header,
            tx_count: 0,
            size: 0,
            trusted: false,
            chain_work: parent_work.saturating_add(block_proof(header.bits)),
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        };
        self.by_hash.insert(hash, id);
        if let Some(p) = self.get_mut(parent) {
            p.children.push(id);
        }
        Some(id)
    }

    /// Record that the block's payload is available.
    pub fn set_payload(&mut self, id: NodeId, tx_count: u32, size: u32, trusted: bool) {
        if let Some(node) = self.get_mut(id) {
            node.tx_count = tx_count;
            node.size = size;
            node.trusted = trusted;
        }
    }

    pub fn set_trusted(&mut self, id: NodeId) {
        if let Some(node) = self.get_mut(id) {
            node.trusted = true;
        }
    }

    /// The ancestor of `id` (or `id` itself) at `height`.
    pub fn ancestor(&self, id: NodeId, height: u64) -> Option<NodeId> {
        let mut cur = id;
        loop {
            let node = self.get(cur)?;
            if node.height == height {
                return Some(cur);
            }
            if node.height < height {
                return None;
            }
            cur = node.parent?;
        }
    }

    /// Median timestamp of `id` and up to ten of its ancestors.
    pub fn median_time_past(&self, id: NodeId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cur = Some(id);
        while let Some(node) = cur.and_then(|c| self.get(c)) {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(node.timestamp());
            cur = node.parent;
        }
        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// The child of `from` on the way to its descendant `to`.
    pub fn find_path_to(&self, from: NodeId, to: NodeId) -> Option<NodeId> {
        let from_node = self.get(from)?;
        if let [only] = from_node.children.as_slice() {
            return Some(*only);
        }
        let mut cur = to;
        loop {
            let node = self.get(cur)?;
            match node.parent {
                Some(p) if p == from => return Some(cur),
                Some(p) => cur = p,
                None => return None,
            }
        }
    }

    /// Deepest common ancestor of `a` and `b`.
    pub fn fork_point(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (a, b);
        let height = self.get(a)?.height.min(self.get(b)?.height);
        a = self.ancestor(a, height)?;
        b = self.ancestor(b, height)?;
        while a != b {
            a = self.parent(a)?;
            b = self.parent(b)?;
        }
        Some(a)
    }

    /// The descendant of `from` (or `from` itself) that ranks highest under
    /// `choice`. Earlier-inserted branches win ties.
    pub fn farthest_node(&self, from: NodeId, choice: ForkChoice) -> NodeId {
        let mut best = from;
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let Some(node) = self.get(id) else { continue };
            if self.ranks_above(id, best, choice) {
                best = id;
            }
            stack.extend(node.children.iter().rev().copied());
        }
        best
    }

    /// Whether a switch from `current` to `candidate` is warranted.
    pub fn prefers(&self, candidate: NodeId, current: NodeId, choice: ForkChoice) -> bool {
        self.ranks_above(candidate, current, choice)
    }

    fn ranks_above(&self, a: NodeId, b: NodeId, choice: ForkChoice) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(x), Some(y)) => match choice {
                ForkChoice::Height => x.height > y.height,
                ForkChoice::MostWork => x.chain_work > y.chain_work,
            },
            _ => false,
        }
    }

    /// Whether the chain ending at `a` carries strictly more cumulative work
    /// from the root than the one ending at `b`. Their shared prefix counts
    /// equally on both sides.
    pub fn more_work(&self, a: NodeId, b: NodeId) -> bool {
        self.ranks_above(a, b, ForkChoice::MostWork)
    }

    /// Whether `id` lies on the chain ending at `tip`.
    pub fn on_active_branch(&self, id: NodeId, tip: NodeId) -> bool {
        match self.get(id) {
            Some(node) => self.ancestor(tip, node.height) == Some(id),
            None => false,
        }
    }

    /// Whether every ancestor of `id` down to the active chain has its
    /// payload.
    pub fn has_all_parents(&self, id: NodeId, tip: NodeId) -> bool {
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            if self.on_active_branch(p, tip) {
                return true;
            }
            match self.get(p) {
                Some(node) if node.has_payload() => cur = node.parent,
                _ => return false,
            }
        }
        false
    }

    /// Remove a childless node and unlink it from its parent.
    pub fn detach(&mut self, id: NodeId) -> Option<BlockNode> {
        if id == self.root || !self.get(id)?.children.is_empty() {
            return None;
        }
        self.unlink(id);
        self.take(id)
    }

    /// Remove `id` and all its descendants. Returns the removed hashes, `id`
    /// first, parents before children.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<Hash256> {
        if id == self.root || self.get(id).is_none() {
            return Vec::new();
        }
        self.unlink(id);
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.take(cur) {
                removed.push(node.hash);
                stack.extend(node.children.into_iter().rev());
            }
        }
        removed
    }

    fn unlink(&mut self, id: NodeId) {
        if let Some(parent) = self.parent(id) {
            if let Some(p) = self.get_mut(parent) {
                p.children.retain(|c| *c != id);
            }
        }
    }

    fn take(&mut self, id: NodeId) -> Option<BlockNode> {
        let node = self.nodes.get_mut(id.0)?.take()?;
        self.by_hash.remove(&node.hash);
        self.free.push(id.0);
        Some(node)
    }

    /// Compact bits a child of `parent` with timestamp `time` must carry.
    pub fn next_work_required(&self, parent: NodeId, time: u32, params: &ConsensusParams) -> u32 {
        let Some(last) = self.get(parent) else {
            return params.pow_limit_bits;
        };
        if last.parent.is_none() {
            return params.pow_limit_bits;
        }
        let interval = params.retarget_interval.max(1);

        if (last.height + 1) % interval != 0 {
            if params.allow_min_difficulty_blocks {
                if u64::from(time) > u64::from(last.timestamp()) + 2 * params.target_spacing {
                    return params.pow_limit_bits;
                }
                return self.last_normal_bits(parent, interval, params);
            }
            return last.bits();
        }

        if params.no_retargeting {
            return last.bits();
        }

        let first_height = last.height + 1 - interval;
        let first_time = self
            .ancestor(parent, first_height)
            .and_then(|id| self.get(id))
            .map_or(last.timestamp(), BlockNode::timestamp);
        let actual = i64::from(last.timestamp()) - i64::from(first_time);
        retarget(last.bits(), actual, params)
    }

    /// Bits of the nearest ancestor that was not mined under the testnet
    /// minimum-difficulty exception.
    fn last_normal_bits(&self, from: NodeId, interval: u64, params: &ConsensusParams) -> u32 {
        let mut cur = from;
        loop {
            let node = &self[cur];
            match node.parent {
                Some(p) if node.height % interval != 0 && node.bits() == params.pow_limit_bits => cur = p,
                _ => return node.bits(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header(prev: Hash256, time: u32, bits: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_hash: prev,
            merkle_root: Hash256::ZERO,
            timestamp: time,
            bits,
            nonce,
        }
    }

    fn genesis() -> BlockHeader {
        make_header(Hash256::ZERO, 1_000_000, 0x207fffff, 0)
    }

    /// Append `n` nodes under `from`, `spacing` seconds apart.
    fn extend(index: &mut BlockIndex, from: NodeId, n: usize, spacing: u32, salt: u32) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut cur = from;
        for i in 0..n {
            let prev = &index[cur];
            let header = make_header(prev.hash, prev.timestamp() + spacing, prev.bits(), salt * 10_000 + i as u32);
            let id = index.insert(cur, header.hash(), header).unwrap();
            index.set_payload(id, 1, 100, false);
            ids.push(id);
            cur = id;
        }
        ids
    }

    // --- Structure ---

    #[test]
    fn insert_sets_height_and_links() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let a = extend(&mut index, root, 3, 600, 1);
        assert_eq!(index.len(), 4);
        assert_eq!(index[a[2]].height, 3);
        assert_eq!(index.parent(a[0]), Some(index.root()));
        assert_eq!(index[index.root()].children, vec![a[0]]);
        assert_eq!(index.lookup(&index[a[1]].hash), Some(a[1]));
    }

    #[test]
    fn insert_is_idempotent_and_needs_live_parent() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let a = extend(&mut index, root, 1, 600, 1);
        let header = index[a[0]].header;
        assert_eq!(index.insert(index.root(), header.hash(), header), Some(a[0]));
        assert_eq!(index.len(), 2);
        assert_eq!(index.insert(NodeId(99), Hash256([7; 32]), header), None);
    }

    #[test]
    fn heights_increase_along_every_edge() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let main = extend(&mut index, root, 5, 600, 1);
        extend(&mut index, main[1], 4, 600, 2);
        extend(&mut index, main[3], 2, 600, 3);
        for id in index.ids() {
            if let Some(p) = index.parent(id) {
                assert_eq!(index[id].height, index[p].height + 1);
            }
        }
    }

    #[test]
    fn ancestor_walks_to_height() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let a = extend(&mut index, root, 6, 600, 1);
        assert_eq!(index.ancestor(a[5], 2), Some(a[1]));
        assert_eq!(index.ancestor(a[5], 0), Some(index.root()));
        assert_eq!(index.ancestor(a[1], 4), None);
    }

    #[test]
    fn median_time_past_uses_eleven_blocks() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let a = extend(&mut index, root, 20, 600, 1);
        // Times are increasing, so the median of the last 11 is the 6th newest.
        let tip = a[19];
        assert_eq!(index.median_time_past(tip), index[a[14]].timestamp());
        // Fewer than 11 ancestors: median of what exists.
        assert_eq!(index.median_time_past(a[1]), index[a[0]].timestamp());
    }

    // --- Branches ---

    #[test]
    fn path_and_fork_point() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let main = extend(&mut index, root, 4, 600, 1);
        let side = extend(&mut index, main[1], 3, 600, 2);
        assert_eq!(index.fork_point(main[3], side[2]), Some(main[1]));
        assert_eq!(index.find_path_to(main[1], side[2]), Some(side[0]));
        assert_eq!(index.find_path_to(main[1], main[3]), Some(main[2]));
        // Single child: followed without looking at the target.
        assert_eq!(index.find_path_to(main[2], main[3]), Some(main[3]));
    }

    #[test]
    fn farthest_node_by_height_prefers_first_branch_on_tie() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let main = extend(&mut index, root, 3, 600, 1);
        let side = extend(&mut index, main[0], 2, 600, 2);
        assert_eq!(index[main[2]].height, index[side[1]].height);
        assert_eq!(index.farthest_node(index.root(), ForkChoice::Height), main[2]);
        let longer = extend(&mut index, side[1], 1, 600, 3);
        assert_eq!(index.farthest_node(index.root(), ForkChoice::Height), longer[0]);
    }

    #[test]
    fn most_work_beats_height() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let long = extend(&mut index, root, 3, 600, 1);
        // One block at a much harder target.
        let header = make_header(index[index.root()].hash, 1_000_600, 0x1d00ffff, 42);
        let heavy = index.insert(index.root(), header.hash(), header).unwrap();
        assert!(index.more_work(heavy, long[2]));
        // Totals from the root: a descendant outweighs its ancestor, equals tie.
        assert!(index.more_work(long[2], long[0]));
        assert!(!index.more_work(long[2], long[2]));
        assert_eq!(index.farthest_node(index.root(), ForkChoice::MostWork), heavy);
        assert!(index.prefers(heavy, long[2], ForkChoice::MostWork));
        assert!(!index.prefers(heavy, long[2], ForkChoice::Height));
    }

    #[test]
    fn active_branch_and_parents() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let main = extend(&mut index, root, 4, 600, 1);
        let side = extend(&mut index, main[1], 3, 600, 2);
        let tip = main[3];
        assert!(index.on_active_branch(main[2], tip));
        assert!(!index.on_active_branch(side[0], tip));
        assert!(index.has_all_parents(side[2], tip));

        index.set_payload(side[0], 0, 0, false);
        assert!(!index.has_all_parents(side[2], tip));
        assert!(index.has_all_parents(side[0], tip));
    }

    #[test]
    fn detach_only_leaves() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let a = extend(&mut index, root, 2, 600, 1);
        assert!(index.detach(a[0]).is_none());
        assert!(index.detach(index.root()).is_none());
        let gone = index.detach(a[1]).unwrap();
        assert_eq!(gone.height, 2);
        assert!(index[a[0]].children.is_empty());
        assert!(!index.contains(&gone.hash));
    }

    #[test]
    fn remove_subtree_returns_hashes_and_reuses_slots() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let main = extend(&mut index, root, 3, 600, 1);
        let side = extend(&mut index, main[0], 2, 600, 2);
        extend(&mut index, side[0], 1, 600, 3);
        let side_root_hash = index[side[0]].hash;

        let removed = index.remove_subtree(side[0]);
        assert_eq!(removed.len(), 3);
        assert_eq!(removed[0], side_root_hash);
        assert_eq!(index.len(), 4);
        assert_eq!(index[main[0]].children, vec![main[1]]);

        let again = extend(&mut index, main[2], 1, 600, 4);
        assert!(again[0].index() < 7);
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn deep_chain_walks_do_not_recurse() {
        let mut index = BlockIndex::new(genesis());
        let root = index.root();
        let a = extend(&mut index, root, 20_000, 1, 1);
        let tip = *a.last().unwrap();
        assert_eq!(index.farthest_node(index.root(), ForkChoice::Height), tip);
        assert_eq!(index.remove_subtree(a[0]).len(), 20_000);
        assert_eq!(index.len(), 1);
    }

    // --- Retarget ---

    fn retarget_params(interval: u64) -> ConsensusParams {
        ConsensusParams {
            retarget_interval: interval,
            target_spacing: 600,
            target_timespan: interval * 600,
            no_retargeting: false,
            allow_min_difficulty_blocks: false,
            ..ConsensusParams::mainnet()
        }
    }

    fn mainnet_index() -> BlockIndex {
        BlockIndex::new(make_header(Hash256::ZERO, 1_000_000, 0x1d00ffff, 0))
    }

    #[test]
    fn genesis_child_gets_pow_limit() {
        let params = retarget_params(4);
        let index = mainnet_index();
        assert_eq!(index.next_work_required(index.root(), 0, &params), params.pow_limit_bits);
    }

    #[test]
    fn off_boundary_keeps_bits() {
        let params = retarget_params(4);
        let mut index = mainnet_index();
        let root = index.root();
        let a = extend(&mut index, root, 1, 600, 1);
        assert_eq!(index.next_work_required(a[0], 0, &params), 0x1d00ffff);
    }

    #[test]
    fn boundary_fast_window_hardens() {
        let params = retarget_params(4);
        let mut index = mainnet_index();
        // Heights 1..=3; the child at 4 is a boundary. The window took 180s
        // against an expected 2400s, so the clamp to a quarter applies.
        let root = index.root();
        let a = extend(&mut index, root, 3, 60, 1);
        let bits = index.next_work_required(a[2], 0, &params);
        assert_eq!(bits, retarget(0x1d00ffff, 180, &params));
        assert!(compact_target(bits) < compact_target(0x1d00ffff));
    }

    #[test]
    fn boundary_slow_window_capped_at_limit() {
        let params = retarget_params(4);
        let mut index = mainnet_index();
        let root = index.root();
        let a = extend(&mut index, root, 3, 10_000, 1);
        assert_eq!(index.next_work_required(a[2], 0, &params), params.pow_limit_bits);
    }

    #[test]
    fn no_retargeting_keeps_bits_on_boundary() {
        let params = ConsensusParams { no_retargeting: true, ..retarget_params(4) };
        let mut index = mainnet_index();
        let root = index.root();
        let a = extend(&mut index, root, 3, 1, 1);
        assert_eq!(index.next_work_required(a[2], 0, &params), 0x1d00ffff);
    }

    #[test]
    fn testnet_min_difficulty_exception() {
        let params = ConsensusParams { allow_min_difficulty_blocks: true, ..retarget_params(100) };
        let mut index = mainnet_index();
        let root = index.root();
        let a = extend(&mut index, root, 1, 600, 1);
        // Replace the chain with a harder block at height 2.
        let prev = &index[a[0]];
        let hard = make_header(prev.hash, prev.timestamp() + 600, 0x1c00ffff, 9);
        let h2 = index.insert(a[0], hard.hash(), hard).unwrap();
        let easy_parent = index[h2].clone();
        let easy = make_header(easy_parent.hash, easy_parent.timestamp() + 1300, 0x1d00ffff, 10);
        let h3 = index.insert(h2, easy.hash(), easy).unwrap();

        let late = index[h3].timestamp() + 1201;
        assert_eq!(index.next_work_required(h3, late, &params), params.pow_limit_bits);
        // On time: the last block not mined at the minimum difficulty.
        let on_time = index[h3].timestamp() + 600;
        assert_eq!(index.next_work_required(h3, on_time, &params), 0x1c00ffff);
    }

    fn compact_target(bits: u32) -> U256 {
        quarry_core::difficulty::compact_to_u256(bits).unwrap()
    }
}
