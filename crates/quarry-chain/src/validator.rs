//! Block validation.
//!
//! A candidate is checked in two passes:
//!
//! - **Header** checks need the block index: size, version, proof of work
//!   against the header's own target, clock drift, duplicate and parent
//!   lookup, the moving-checkpoint depth, the retarget rule, median time past
//!   and version thresholds.
//! - **Content** checks look only at the block itself: coinbase layout and
//!   height prefix, merkle root, and per-transaction structure and finality.
//!   Trusted blocks skip this pass.
//!
//! Nothing here touches the UTXO set or mutates the index.

use quarry_core::constants::{
    MAX_FUTURE_BLOCK_TIME, MIN_BLOCK_SIZE, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY,
    VERIFY_DERSIG, VERIFY_NONE, VERIFY_P2SH,
};
use quarry_core::difficulty::check_proof_of_work;
use quarry_core::error::{BlockError, Rejection};
use quarry_core::merkle::block_merkle_root;
use quarry_core::params::ConsensusParams;
use quarry_core::types::{Block, Hash256};
use quarry_core::validation::{check_transaction, coinbase_height_prefix, is_final};

use crate::index::{BlockIndex, NodeId};

/// A block that passed [`check_block_at`], with what accepting it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedBlock {
    pub hash: Hash256,
    pub height: u64,
    pub parent: NodeId,
    pub size: usize,
    pub trusted: bool,
    /// Script verification flags for the block's inputs.
    pub flags: u32,
    /// Median time past of the parent.
    pub median_time: u32,
}

/// Check `block` against the index at `now`, in Unix seconds.
pub fn check_block_at(
    index: &BlockIndex,
    tip: NodeId,
    params: &ConsensusParams,
    block: &Block,
    trusted: bool,
    now: u64,
) -> Result<CheckedBlock, Rejection> {
    check_block_within(index, tip, params, block, trusted, now, params.moving_checkpoint_depth)
}

/// [`check_block_at`] refusing side-branch blocks `max_depth` or more
/// heights below the tip, for callers whose reorg reach is shorter than the
/// moving checkpoint.
pub fn check_block_within(
    index: &BlockIndex,
    tip: NodeId,
    params: &ConsensusParams,
    block: &Block,
    trusted: bool,
    now: u64,
    max_depth: u64,
) -> Result<CheckedBlock, Rejection> {
    let checked = check_header(index, tip, params, block, trusted, now, max_depth)?;
    if !trusted {
        check_contents(block, checked.height, checked.median_time, checked.flags, params)
            .map_err(Rejection::misbehaving)?;
    }
    Ok(checked)
}

fn check_header(
    index: &BlockIndex,
    tip: NodeId,
    params: &ConsensusParams,
    block: &Block,
    trusted: bool,
    now: u64,
    max_depth: u64,
) -> Result<CheckedBlock, Rejection> {
    let header = &block.header;

    // --- Size and self-contained header checks ---

    let size = block.serialized_size();
    if size < MIN_BLOCK_SIZE {
        return Err(Rejection::misbehaving(BlockError::TooSmall { size }));
    }
    if size > params.max_block_size {
        return Err(Rejection::misbehaving(BlockError::Oversized { size, max: params.max_block_size }));
    }
    if header.version == 0 {
        return Err(Rejection::misbehaving(BlockError::ZeroVersion));
    }
    let hash = header.hash();
    if !check_proof_of_work(&hash, header.bits, &params.pow_limit) {
        return Err(Rejection::misbehaving(BlockError::HighHash));
    }
    let limit = now + MAX_FUTURE_BLOCK_TIME;
    if u64::from(header.timestamp) > limit {
        return Err(Rejection::misbehaving(BlockError::TimeTooNew {
            time: u64::from(header.timestamp),
            limit,
        }));
    }

    // --- Position in the index ---

    if let Some(id) = index.lookup(&hash) {
        let error = if id == index.root() {
            BlockError::Genesis
        } else {
            BlockError::AlreadyKnown(hash)
        };
        return Err(Rejection::benign(error));
    }
    let Some(parent) = index.lookup(&header.prev_hash) else {
        return Err(Rejection::deferred(BlockError::UnknownParent(header.prev_hash)));
    };
    let height = index[parent].height + 1;

    let tip_height = index[tip].height;
    if parent != tip && tip_height.saturating_sub(height) >= max_depth {
        return Err(Rejection::benign(BlockError::TooDeep { height, tip_height }));
    }

    // --- Work, time and version against the parent ---

    let expected = index.next_work_required(parent, header.timestamp, params);
    if header.bits != expected {
        return Err(Rejection::misbehaving(BlockError::BadDifficulty { got: header.bits, expected }));
    }
    let median_time = index.median_time_past(parent);
    if header.timestamp <= median_time {
        return Err(Rejection::misbehaving(BlockError::TimeTooOld {
            time: header.timestamp,
            median: median_time,
        }));
    }
    let version = header.version;
    if (version < 2 && height >= params.bip34_height)
        || (version < 3 && height >= params.bip66_height)
        || (version < 4 && height >= params.bip65_height)
    {
        return Err(Rejection::misbehaving(BlockError::BadVersion { version, height }));
    }

    Ok(CheckedBlock {
        hash,
        height,
        parent,
        size,
        trusted,
        flags: verify_flags_for(height, header.timestamp, params),
        median_time,
    })
}

/// Context-free checks on the block body.
pub fn check_contents(
    block: &Block,
    height: u64,
    median_time: u32,
    flags: u32,
    params: &ConsensusParams,
) -> Result<(), BlockError> {
    // --- Coinbase ---

    let coinbase = match block.transactions.first() {
        Some(tx) if tx.is_coinbase() => tx,
        _ => return Err(BlockError::NoCoinbase),
    };
    if height >= params.bip34_height {
        let prefix = coinbase_height_prefix(height);
        let script = coinbase.inputs.first().map_or(&[][..], |i| &i.script_sig[..]);
        if !script.starts_with(&prefix) {
            return Err(BlockError::BadCoinbaseHeight { height });
        }
    }
    if let Some(index) = block.transactions.iter().skip(1).position(|tx| tx.is_coinbase()) {
        return Err(BlockError::MultipleCoinbase(index + 1));
    }

    // --- Merkle root ---

    let (root, mutated) = block_merkle_root(&block.transactions);
    if mutated {
        return Err(BlockError::DuplicateTransactions);
    }
    if root != block.header.merkle_root {
        return Err(BlockError::BadMerkleRoot);
    }

    // --- Transactions ---

    let lock_time_cutoff = if flags & VERIFY_CHECKSEQUENCEVERIFY != 0 {
        median_time
    } else {
        block.header.timestamp
    };
    for (index, tx) in block.transactions.iter().enumerate() {
        check_transaction(tx).map_err(|source| BlockError::Transaction { index, source })?;
        if !is_final(tx, height, lock_time_cutoff) {
            return Err(BlockError::NonFinal { index });
        }
    }
    Ok(())
}

/// Script verification flags in force for a block at `height` with header
/// time `time`.
pub fn verify_flags_for(height: u64, time: u32, params: &ConsensusParams) -> u32 {
    let mut flags = VERIFY_NONE;
    if time >= params.bip16_time {
        flags |= VERIFY_P2SH;
    }
    if height >= params.bip66_height {
        flags |= VERIFY_DERSIG;
    }
    if height >= params.bip65_height {
        flags |= VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if height >= params.csv_height {
        flags |= VERIFY_CHECKSEQUENCEVERIFY;
    }
    flags
}
