//! Protocol constants. All monetary values in base units (1 coin = 10^8 units).

pub const COIN: u64 = 100_000_000;

/// Upper bound on any single value and on the sum of a transaction's outputs.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Initial block subsidy, halved every [`SUBSIDY_HALVING_INTERVAL`] blocks.
pub const INITIAL_SUBSIDY: u64 = 50 * COIN;

pub const SUBSIDY_HALVING_INTERVAL: u64 = 210_000;

/// Serialized block size limits, in bytes. A header alone is 80 bytes, so
/// anything below 81 cannot carry a transaction.
pub const MIN_BLOCK_SIZE: usize = 81;
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Blocks a coinbase output must wait before it can be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// Allowed coinbase input script length, inclusive.
pub const COINBASE_SCRIPT_MIN: usize = 2;
pub const COINBASE_SCRIPT_MAX: usize = 100;

/// Blocks whose timestamps feed the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// How far ahead of local time a block timestamp may be, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Lock times below this are block heights, at or above it unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number that makes an input final.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// Target seconds between blocks.
pub const TARGET_SPACING: u64 = 10 * 60;

/// Seconds a full retarget window is expected to take (two weeks).
pub const TARGET_TIMESPAN: u64 = 14 * 24 * 60 * 60;

/// Blocks per retarget window.
pub const RETARGET_INTERVAL: u64 = TARGET_TIMESPAN / TARGET_SPACING;

/// Per-window retarget clamp factor.
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Blocks attaching this many heights or more below the tip (on a side
/// branch) are refused outright.
pub const MOVING_CHECKPOINT_DEPTH: u64 = 2016;

/// Number of recent blocks whose undo records are retained.
pub const UNDO_WINDOW: u64 = 256;

/// Script evaluation flags passed to the signature verifier.
pub const VERIFY_NONE: u32 = 0;
pub const VERIFY_P2SH: u32 = 1 << 0;
pub const VERIFY_DERSIG: u32 = 1 << 2;
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;

/// Leading opcode of provably unspendable outputs.
pub const OP_RETURN: u8 = 0x6a;

/// Network selector for consensus parameter presets and data directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Mainnet,
    /// Public test network with the minimum-difficulty exception.
    Testnet,
    /// Local regression-test network: trivial difficulty, no retargeting.
    Regtest,
}

impl NetworkType {
    /// Subdirectory name appended to the base data directory path.
    ///
    /// # Examples
    ///
    /// ```
    /// use quarry_core::constants::NetworkType;
    /// assert_eq!(NetworkType::Testnet.data_dir_suffix(), "testnet");
    /// ```
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}
