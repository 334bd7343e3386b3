//! Consensus parameters.
//!
//! Everything the validator and the retarget rule need to know about a
//! network is a value in [`ConsensusParams`]; nothing here is computed from
//! chain data. Presets exist for mainnet, testnet and regtest, and tests
//! override individual fields (for example a shallow moving checkpoint).

use primitive_types::U256;

use crate::constants::{
    COINBASE_MATURITY, MAX_BLOCK_SIZE, MOVING_CHECKPOINT_DEPTH, NetworkType, RETARGET_INTERVAL,
    TARGET_SPACING, TARGET_TIMESPAN,
};
use crate::types::{BlockHeader, Hash256};

/// Merkle root shared by the genesis blocks of all three presets, in the
/// byte-reversed display form.
const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

/// Which branch wins when two compete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkChoice {
    /// Switch to a candidate whose height is strictly greater than the tip's.
    #[default]
    Height,
    /// Switch to a candidate with strictly more cumulative proof of work than
    /// the tip, counted from their fork point.
    MostWork,
}

#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub network: NetworkType,
    /// Header of the root block. It is never applied to the UTXO set.
    pub genesis: BlockHeader,
    /// Easiest allowed target, and its compact encoding.
    pub pow_limit: U256,
    pub pow_limit_bits: u32,
    pub retarget_interval: u64,
    pub target_spacing: u64,
    pub target_timespan: u64,
    /// Testnet rule: a block more than two spacings after its parent may use
    /// the minimum difficulty.
    pub allow_min_difficulty_blocks: bool,
    /// Keep the parent's bits at every retarget boundary.
    pub no_retargeting: bool,
    pub coinbase_maturity: u64,
    pub moving_checkpoint_depth: u64,
    pub max_block_size: usize,
    /// First block time at which P2SH evaluation is enabled.
    pub bip16_time: u32,
    /// Height from which version 2 and the coinbase height prefix are required.
    pub bip34_height: u64,
    /// Height from which version 3 and strict DER signatures are required.
    pub bip66_height: u64,
    /// Height from which version 4 and CHECKLOCKTIMEVERIFY are required.
    pub bip65_height: u64,
    /// Height from which relative lock times apply and transaction finality
    /// is judged against the median time past.
    pub csv_height: u64,
    pub fork_choice: ForkChoice,
}

impl ConsensusParams {
    pub fn mainnet() -> Self {
        Self {
            network: NetworkType::Mainnet,
            genesis: genesis_header(1_231_006_505, 0x1d00ffff, 2_083_236_893),
            pow_limit: U256::MAX >> 32u32,
            pow_limit_bits: 0x1d00ffff,
            retarget_interval: RETARGET_INTERVAL,
            target_spacing: TARGET_SPACING,
            target_timespan: TARGET_TIMESPAN,
            allow_min_difficulty_blocks: false,
            no_retargeting: false,
            coinbase_maturity: COINBASE_MATURITY,
            moving_checkpoint_depth: MOVING_CHECKPOINT_DEPTH,
            max_block_size: MAX_BLOCK_SIZE,
            bip16_time: 1_333_238_400,
            bip34_height: 227_931,
            bip66_height: 363_725,
            bip65_height: 388_381,
            csv_height: 419_328,
            fork_choice: ForkChoice::Height,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: NetworkType::Testnet,
            genesis: genesis_header(1_296_688_602, 0x1d00ffff, 414_098_458),
            allow_min_difficulty_blocks: true,
            bip16_time: 1_329_264_000,
            bip34_height: 21_111,
            bip66_height: 330_776,
            bip65_height: 581_885,
            csv_height: 770_112,
            ..Self::mainnet()
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: NetworkType::Regtest,
            genesis: genesis_header(1_296_688_602, 0x207fffff, 2),
            pow_limit: U256::MAX >> 1u32,
            pow_limit_bits: 0x207fffff,
            no_retargeting: true,
            bip16_time: 0,
            bip34_height: 500,
            bip66_height: 1_251,
            bip65_height: 1_351,
            csv_height: 432,
            ..Self::mainnet()
        }
    }

    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }
}

fn genesis_header(timestamp: u32, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_hash: Hash256::ZERO,
        merkle_root: Hash256::from_hex(GENESIS_MERKLE_ROOT).unwrap_or_default(),
        timestamp,
        bits,
        nonce,
    }
}
