//! Block subsidy schedule.

use crate::constants::{INITIAL_SUBSIDY, SUBSIDY_HALVING_INTERVAL};

/// New coins a block at `height` may create, halving every 210 000 blocks and
/// reaching zero after 64 halvings.
pub fn block_subsidy(height: u64) -> u64 {
    let halvings = height / SUBSIDY_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}
