//! Transaction merkle tree.
//!
//! Internal nodes are `SHA256d(left || right)`. Odd-length layers are padded
//! by pairing the last element with itself.
//!
//! That padding rule makes distinct transaction lists share a root: `[a, b,
//! c]` and `[a, b, c, c]` hash identically. [`merkle_root`] therefore also
//! reports whether any layer paired two equal, non-padding siblings, which is
//! how a mutated (duplicated) transaction list is detected.

use sha2::{Digest, Sha256};

use crate::types::{Hash256, Transaction};

fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    let first = hasher.finalize();
    Hash256(Sha256::digest(first).into())
}

/// Compute the merkle root of `leaves` and whether the list is mutated.
///
/// Returns [`Hash256::ZERO`] (not mutated) for an empty slice and the leaf
/// itself for a single element.
pub fn merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return (Hash256::ZERO, false);
    }

    let mut layer = leaves.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            match pair {
                [left, right] => {
                    if left == right {
                        mutated = true;
                    }
                    next.push(node_hash(left, right));
                }
                [last] => next.push(node_hash(last, last)),
                _ => unreachable!("chunks(2) yields one or two elements"),
            }
        }
        layer = next;
    }
    (layer[0], mutated)
}

/// Merkle root and mutation flag over the txids of `txs`.
pub fn block_merkle_root(txs: &[Transaction]) -> (Hash256, bool) {
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    merkle_root(&txids)
}
