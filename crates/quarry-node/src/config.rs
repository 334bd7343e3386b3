//! Node configuration.
//!
//! [`NodeConfig`] has usable defaults for every field. [`NodeConfig::load`]
//! layers an optional config file (any format the `config` crate detects from
//! the extension) and `QUARRY_*` environment variables on top of them, so
//! `QUARRY_NETWORK=regtest` or `QUARRY_VERIFY_THREADS=8` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quarry_chain::{ChainOptions, UtxoOptions};
use quarry_core::constants::{NetworkType, UNDO_WINDOW};
use quarry_core::params::{ConsensusParams, ForkChoice};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "QUARRY";

/// Configuration for a node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data. Each network gets its own
    /// subdirectory.
    pub data_dir: PathBuf,
    pub network: NetworkType,
    /// Log level filter string (e.g. "info", "debug", "quarry_chain=trace").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
    /// Script verification threads; zero verifies inline.
    pub verify_threads: usize,
    /// Number of recent blocks that can be undone.
    pub undo_window: u64,
    /// Seconds an unhurried UTXO snapshot may take.
    pub write_target_secs: u64,
    /// Blocks the live UTXO set may run ahead of its snapshot before an idle
    /// save starts.
    pub skip_save_blocks: u64,
    /// Keep the UTXO set in memory only.
    pub volatile_utxo: bool,
    pub fork_choice: ForkChoice,
    /// Milliseconds between idle ticks of [`Node::run`](crate::Node::run).
    pub idle_interval_ms: u64,
    /// Undo this many blocks on startup and stop there.
    pub undo_blocks: u64,
    /// Skip replaying stored blocks past the UTXO tip on startup.
    pub do_not_rescan: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quarry");

        Self {
            data_dir,
            network: NetworkType::default(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            verify_threads: 0,
            undo_window: UNDO_WINDOW,
            write_target_secs: 5 * 60,
            skip_save_blocks: 0,
            volatile_utxo: false,
            fork_choice: ForkChoice::default(),
            idle_interval_ms: 1_000,
            undo_blocks: 0,
            do_not_rescan: false,
        }
    }
}

impl NodeConfig {
    /// Defaults, then `path` if given, then `QUARRY_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Per-network directory under `data_dir`.
    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.data_dir_suffix())
    }

    /// Path to the RocksDB block database.
    pub fn db_path(&self) -> PathBuf {
        self.chain_dir().join("blocks")
    }

    /// Directory of the UTXO snapshot and undo files.
    pub fn utxo_dir(&self) -> PathBuf {
        self.chain_dir().join("utxo")
    }

    /// Network preset with the configured fork-choice rule.
    pub fn consensus_params(&self) -> ConsensusParams {
        ConsensusParams {
            fork_choice: self.fork_choice,
            ..ConsensusParams::for_network(self.network)
        }
    }

    pub fn chain_options(&self) -> ChainOptions {
        let utxo = UtxoOptions {
            dir: (!self.volatile_utxo).then(|| self.utxo_dir()),
            undo_window: self.undo_window,
            write_target: Duration::from_secs(self.write_target_secs),
            skip_save_blocks: self.skip_save_blocks,
        };
        ChainOptions {
            utxo,
            verify_threads: self.verify_threads,
            undo_blocks: self.undo_blocks,
            do_not_rescan: self.do_not_rescan,
        }
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_data_dir_ends_with_quarry() {
        let cfg = NodeConfig::default();
        assert!(cfg.data_dir.ends_with("quarry"));
    }

    #[test]
    fn default_network_is_mainnet() {
        assert_eq!(NodeConfig::default().network, NetworkType::Mainnet);
    }

    #[test]
    fn default_log_settings() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.log_format, "text");
    }

    #[test]
    fn paths_are_per_network() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/q"),
            network: NetworkType::Regtest,
            ..NodeConfig::default()
        };
        assert_eq!(cfg.chain_dir(), PathBuf::from("/tmp/q/regtest"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/q/regtest/blocks"));
        assert_eq!(cfg.utxo_dir(), PathBuf::from("/tmp/q/regtest/utxo"));
    }

    #[test]
    fn volatile_utxo_has_no_dir() {
        let cfg = NodeConfig { volatile_utxo: true, ..NodeConfig::default() };
        assert!(cfg.chain_options().utxo.dir.is_none());
        let cfg = NodeConfig::default();
        assert_eq!(cfg.chain_options().utxo.dir, Some(cfg.utxo_dir()));
    }

    #[test]
    fn chain_options_carry_settings() {
        let cfg = NodeConfig {
            verify_threads: 3,
            undo_window: 10,
            write_target_secs: 7,
            undo_blocks: 2,
            ..NodeConfig::default()
        };
        let opts = cfg.chain_options();
        assert_eq!(opts.verify_threads, 3);
        assert_eq!(opts.utxo.undo_window, 10);
        assert_eq!(opts.utxo.write_target, Duration::from_secs(7));
        assert_eq!(opts.undo_blocks, 2);
        assert!(!opts.do_not_rescan);
    }

    #[test]
    fn consensus_params_follow_network_and_fork_choice() {
        let cfg = NodeConfig {
            network: NetworkType::Testnet,
            fork_choice: ForkChoice::MostWork,
            ..NodeConfig::default()
        };
        let params = cfg.consensus_params();
        assert_eq!(params.network, NetworkType::Testnet);
        assert_eq!(params.fork_choice, ForkChoice::MostWork);
        assert!(params.allow_min_difficulty_blocks);
    }

    #[test]
    fn idle_interval_is_never_zero() {
        let cfg = NodeConfig { idle_interval_ms: 0, ..NodeConfig::default() };
        assert_eq!(cfg.idle_interval(), Duration::from_millis(1));
    }

    #[test]
    fn load_without_file_gives_defaults() {
        let cfg = NodeConfig::load(None).unwrap();
        assert_eq!(cfg.undo_window, NodeConfig::default().undo_window);
        assert_eq!(cfg.fork_choice, ForkChoice::Height);
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarry.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "network = \"regtest\"\nverify_threads = 4\nfork_choice = \"most_work\"\ndata_dir = \"/srv/quarry\""
        )
        .unwrap();

        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.network, NetworkType::Regtest);
        assert_eq!(cfg.verify_threads, 4);
        assert_eq!(cfg.fork_choice, ForkChoice::MostWork);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/quarry"));
        // Unset keys keep their defaults.
        assert_eq!(cfg.log_format, "text");
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
