//! Node handle and idle loop.
//!
//! [`Node`] owns the [`ChainState`] behind a single mutex: every block,
//! undo and query goes through it one at a time. [`Node::run`] ticks the
//! chain's idle work (background UTXO snapshots, block store housekeeping)
//! until [`Node::shutdown`] is called.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use quarry_chain::{ChainState, UnspentOutput};
use quarry_core::error::{ChainError, Rejection};
use quarry_core::traits::{ChainListener, SignatureVerifier};
use quarry_core::types::{Block, Hash256, OutPoint};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::storage::RocksBlockStore;

pub type NodeChain = ChainState<RocksBlockStore>;

pub struct Node {
    chain: Mutex<NodeChain>,
    config: NodeConfig,
    shutdown: Notify,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("network", &self.config.network)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Open the block store and chain under `config.chain_dir()`, replaying
    /// or undoing blocks as the config asks.
    pub fn open(config: NodeConfig, verifier: Arc<dyn SignatureVerifier>) -> Result<Arc<Self>, NodeError> {
        std::fs::create_dir_all(config.chain_dir())?;
        let blocks = RocksBlockStore::open(config.db_path())?;
        let chain = ChainState::open(config.consensus_params(), blocks, verifier, config.chain_options())?;
        info!(
            network = ?config.network,
            data_dir = %config.chain_dir().display(),
            height = chain.height(),
            tip = %chain.tip_hash(),
            "node opened"
        );
        Ok(Arc::new(Self { chain: Mutex::new(chain), config, shutdown: Notify::new() }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Check and accept a block from the outside world.
    ///
    /// Storage failures are logged at error level. After one the chain is
    /// halted and every later block fails with [`ChainError::Halted`] until
    /// the node is reopened.
    pub fn process_block(&self, block: &Block) -> Result<(), ChainError> {
        let result = self.chain.lock().process_block(block, false);
        match &result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => error!(hash = %block.hash(), error = %e, "storage failure while processing block"),
            Err(ChainError::Rejected(r)) if r.retry_later => debug!(hash = %block.hash(), error = %r, "block deferred"),
            Err(e) => warn!(hash = %block.hash(), error = %e, "block not accepted"),
        }
        result
    }

    /// Header and contents checks only; nothing is stored.
    pub fn check_block(&self, block: &Block) -> Result<(), Rejection> {
        self.chain.lock().check_block(block, false).map(|_| ())
    }

    /// (height, hash) of the active tip.
    pub fn chain_tip(&self) -> (u64, Hash256) {
        let chain = self.chain.lock();
        (chain.height(), chain.tip_hash())
    }

    pub fn get_unspent(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, ChainError> {
        self.chain.lock().get_unspent(outpoint)
    }

    pub fn undo_last_block(&self) -> Result<(), ChainError> {
        self.chain.lock().undo_last_block()
    }

    pub fn set_listener(&self, listener: Arc<dyn ChainListener>) {
        self.chain.lock().set_listener(listener);
    }

    /// Run `f` with the chain locked.
    pub fn with_chain<R>(&self, f: impl FnOnce(&NodeChain) -> R) -> R {
        f(&self.chain.lock())
    }

    pub fn stats(&self) -> String {
        self.chain.lock().stats()
    }

    /// One round of idle work. Skipped when a writer holds the chain.
    pub fn idle(&self) -> bool {
        match self.chain.try_lock() {
            Some(mut chain) => chain.idle(),
            None => false,
        }
    }

    /// Tick [`idle`](Self::idle) every `idle_interval` until shut down.
    pub async fn run(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.idle_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.idle() {
                        debug!("idle work done");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("node idle loop stopped");
                    break;
                }
            }
        }
    }

    /// Stop [`run`](Self::run). A shutdown requested before `run` starts
    /// still takes effect.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Flush the UTXO set and the block store.
    pub fn close(&self) -> Result<(), ChainError> {
        self.chain.lock().close()
    }
}
