//! # quarry-chain
//! The chain state engine: block index, validator, transaction application
//! with a script verification pool, the UTXO store and the reorganization
//! controller that ties them together.

pub mod apply;
pub mod chain;
pub mod index;
pub mod memory_store;
pub mod utxo;
pub mod validator;
pub mod verify;

pub use chain::{ChainOptions, ChainState};
pub use index::{BlockIndex, BlockNode, NodeId};
pub use memory_store::MemoryBlockStore;
pub use utxo::{UnspentOutput, UtxoOptions, UtxoStore};
pub use validator::CheckedBlock;
pub use verify::VerifyPool;
