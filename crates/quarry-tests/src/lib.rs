//! Integration test suite for the Quarry chain engine.
//!
//! The tests under `tests/` drive [`quarry_chain::ChainState`] end to end:
//! concrete scenarios, reorganizations, UTXO store laws under random block
//! sequences, and malformed or hostile blocks. [`helpers`] builds and mines
//! the blocks they feed in.

pub mod helpers;
