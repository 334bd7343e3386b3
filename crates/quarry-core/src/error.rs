//! Error types for the chain state engine.
//!
//! Block-level failures are split by who is at fault and whether retrying can
//! help (see [`RejectKind`]). Storage failures are a separate type because
//! they are never the sender's fault and must halt block processing.
use thiserror::Error;

use crate::types::{Hash256, OutPoint};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    #[error("compact target has the sign bit set")] Negative,
    #[error("compact target overflows 256 bits")] Overflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no inputs")] EmptyInputs,
    #[error("no outputs")] EmptyOutputs,
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("output {index} value {value} out of range")] ValueOutOfRange { index: usize, value: u64 },
    #[error("value overflow")] ValueOverflow,
    #[error("duplicate input: {0}")] DuplicateInput(OutPoint),
    #[error("coinbase script size {0} outside [2, 100]")] CoinbaseScriptSize(usize),
    #[error("null prevout in non-coinbase input {0}")] NullPrevout(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block too small: {size} bytes")] TooSmall { size: usize },
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("version 0 not allowed")] ZeroVersion,
    #[error("hash does not meet its own target")] HighHash,
    #[error("timestamp {time} too far in the future (limit {limit})")] TimeTooNew { time: u64, limit: u64 },
    #[error("genesis")] Genesis,
    #[error("already known: {0}")] AlreadyKnown(Hash256),
    #[error("parent not found: {0}")] UnknownParent(Hash256),
    #[error("attaches too deep: height {height}, tip {tip_height}")] TooDeep { height: u64, tip_height: u64 },
    #[error("incorrect difficulty bits: got {got:#010x}, expected {expected:#010x}")] BadDifficulty { got: u32, expected: u32 },
    #[error("timestamp {time} not after median time past {median}")] TimeTooOld { time: u32, median: u32 },
    #[error("version {version:#010x} rejected at height {height}")] BadVersion { version: u32, height: u64 },
    #[error("first transaction is not coinbase")] NoCoinbase,
    #[error("coinbase does not start with height {height}")] BadCoinbaseHeight { height: u64 },
    #[error("extra coinbase at index {0}")] MultipleCoinbase(usize),
    #[error("duplicate transaction (mutated merkle tree)")] DuplicateTransactions,
    #[error("merkle root mismatch")] BadMerkleRoot,
    #[error("tx {index}: {source}")] Transaction { index: usize, source: TransactionError },
    #[error("tx {index} is not final")] NonFinal { index: usize },
}

/// Classification of a rejected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Malformed: size, merkle, coinbase layout, transaction structure.
    Structural,
    /// Cannot be judged yet; retry once the parent is known.
    Deferred,
    /// Violates a consensus rule: work, time, version, scripts, value.
    Consensus,
    /// Already indexed; nothing to do.
    Duplicate,
}

impl BlockError {
    pub fn kind(&self) -> RejectKind {
        match self {
            Self::UnknownParent(_) => RejectKind::Deferred,
            Self::Genesis | Self::AlreadyKnown(_) => RejectKind::Duplicate,
            Self::ZeroVersion
            | Self::HighHash
            | Self::TimeTooNew { .. }
            | Self::BadDifficulty { .. }
            | Self::TimeTooOld { .. }
            | Self::BadVersion { .. }
            | Self::BadCoinbaseHeight { .. }
            | Self::NonFinal { .. } => RejectKind::Consensus,
            _ => RejectKind::Structural,
        }
    }
}

/// Outcome of a failed block check: what went wrong, whether the peer that
/// sent it should be penalised, and whether it may become valid later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error}")]
pub struct Rejection {
    pub error: BlockError,
    pub misbehave: bool,
    pub retry_later: bool,
}

impl Rejection {
    /// Rejected, sender not penalised.
    pub fn benign(error: BlockError) -> Self {
        Self { error, misbehave: false, retry_later: false }
    }

    /// Rejected, sender penalised.
    pub fn misbehaving(error: BlockError) -> Self {
        Self { error, misbehave: true, retry_later: false }
    }

    /// Not judged yet; retry when dependencies arrive.
    pub fn deferred(error: BlockError) -> Self {
        Self { error, misbehave: false, retry_later: true }
    }

    pub fn kind(&self) -> RejectKind {
        if self.retry_later {
            RejectKind::Deferred
        } else {
            self.error.kind()
        }
    }
}

/// Consensus failures found while applying a block's transactions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("block has no transactions")] EmptyBlock,
    #[error("coinbase script size {0} outside [2, 100]")] CoinbaseScriptSize(usize),
    #[error("unknown input: {0}")] UnknownInput(OutPoint),
    #[error("output index out of range: {0}")] OutputIndexOutOfRange(OutPoint),
    #[error("double spend inside the block: {0}")] DoubleSpend(OutPoint),
    #[error("cannot spend the block's own coinbase: {0}")] SpendsOwnCoinbase(OutPoint),
    #[error("immature coinbase spend {outpoint} (age {age})")] ImmatureCoinbase { outpoint: OutPoint, age: u64 },
    #[error("script verification failed {failures} time(s)")] ScriptFailed { failures: u32 },
    #[error("tx {txid} spends {outputs} but has only {inputs}")] OutputsExceedInputs { txid: Hash256, inputs: u64, outputs: u64 },
    #[error("block outputs {outputs} exceed inputs plus subsidy {inputs}")] BlockValueExceeded { inputs: u64, outputs: u64 },
    #[error("value overflow")] ValueOverflow,
}

/// Persistent-state failures. Never caused by the block's sender; processing
/// must stop rather than continue with an inconsistent UTXO set.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")] Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")] Corrupt(String),
    #[error("undo data missing for height {height}")] UndoMissing { height: u64 },
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("backend: {0}")] Backend(String),
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)] Rejected(#[from] Rejection),
    #[error("block {hash} at height {height} failed to apply: {source}")] Apply { hash: Hash256, height: u64, source: ApplyError },
    #[error("storage: {0}")] Store(#[from] StoreError),
    #[error("block {hash} at height {height} has no stored payload")] MissingBlockData { hash: Hash256, height: u64 },
    #[error("unknown block: {0}")] UnknownBlock(Hash256),
    #[error("reorg to {target} (height {target_height}) fell back to {reached} (height {reached_height})")]
    ReorgFallback { target: Hash256, target_height: u64, reached: Hash256, reached_height: u64 },
    #[error("verify pool: {0}")] Pool(String),
    #[error("chain halted after a storage failure: {0}")] Halted(String),
}

impl ChainError {
    /// Whether the node must stop processing blocks.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Halted(_))
    }
}
