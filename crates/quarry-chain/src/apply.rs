//! Transaction application engine.
//!
//! [`apply_block`] walks a block's transactions against the UTXO set and
//! produces the [`BlockChanges`] that commit it, or the first consensus
//! failure. It never mutates the store: lookups go through a caller-supplied
//! closure and every effect is collected in the returned changes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use quarry_core::constants::{COINBASE_SCRIPT_MAX, COINBASE_SCRIPT_MIN};
use quarry_core::error::{ApplyError, ChainError, StoreError};
use quarry_core::reward::block_subsidy;
use quarry_core::traits::SignatureVerifier;
use quarry_core::types::{Block, Hash256, OutPoint, Transaction};
use tracing::debug;

use crate::utxo::{UnspentOutput, UtxoOutput, UtxoRecord};
use crate::verify::{ScriptCheck, VerifyPool};

/// Everything a block does to the UTXO set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockChanges {
    pub height: u64,
    /// Outputs created by the block and not spent inside it, one record per
    /// transaction, in block order.
    pub added: Vec<UtxoRecord>,
    /// Outputs of earlier blocks consumed by this one.
    pub spent: BTreeMap<Hash256, BTreeSet<u32>>,
    /// Full copies of the consumed outputs, present when the block is close
    /// enough to the best known height that it may need undoing.
    pub undo: Option<Vec<UtxoRecord>>,
}

impl BlockChanges {
    pub fn spent_count(&self) -> usize {
        self.spent.values().map(BTreeSet::len).sum()
    }
}

/// Per-block inputs to the engine.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext {
    pub height: u64,
    /// Highest block height known to exist anywhere.
    pub last_known_height: u64,
    pub undo_window: u64,
    pub coinbase_maturity: u64,
    /// Script verification flags for this block.
    pub flags: u32,
    /// Skip script checks.
    pub trusted: bool,
}

impl ApplyContext {
    fn keeps_undo(&self) -> bool {
        self.height + self.undo_window >= self.last_known_height
    }
}

/// Outputs created earlier in the same block.
struct Shadow {
    tx_index: usize,
    coinbase: bool,
    spent: Vec<bool>,
}

/// Validate `block` against the UTXO set seen through `lookup` and compute
/// its changes.
///
/// Consensus failures are returned as [`ChainError::Apply`]; lookup failures
/// as [`ChainError::Store`].
pub fn apply_block<F>(
    block: &Block,
    ctx: &ApplyContext,
    pool: &VerifyPool,
    verifier: &dyn SignatureVerifier,
    mut lookup: F,
) -> Result<BlockChanges, ChainError>
where
    F: FnMut(&OutPoint) -> Result<Option<UnspentOutput>, StoreError>,
{
    let hash = block.hash();
    let height = ctx.height;
    let fail = |source: ApplyError| ChainError::Apply { hash, height, source };

    let coinbase = block.transactions.first().ok_or_else(|| fail(ApplyError::EmptyBlock))?;
    let script_len = coinbase.inputs.first().map_or(0, |i| i.script_sig.len());
    if !(COINBASE_SCRIPT_MIN..=COINBASE_SCRIPT_MAX).contains(&script_len) {
        return Err(fail(ApplyError::CoinbaseScriptSize(script_len)));
    }

    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    let subsidy = block_subsidy(height);

    let (walked, failures) = pool.run(verifier, |batch| -> Result<_, ChainError> {
        let mut shadow: HashMap<Hash256, Shadow> = HashMap::with_capacity(block.transactions.len());
        let mut spent: BTreeMap<Hash256, BTreeSet<u32>> = BTreeMap::new();
        let mut undo: Option<BTreeMap<Hash256, UtxoRecord>> = ctx.keeps_undo().then(BTreeMap::new);
        let mut block_in = subsidy;
        let mut block_out = 0u64;

        for (i, tx) in block.transactions.iter().enumerate() {
            let tx_out = tx.total_output_value().ok_or_else(|| fail(ApplyError::ValueOverflow))?;
            block_out = block_out.checked_add(tx_out).ok_or_else(|| fail(ApplyError::ValueOverflow))?;

            if i > 0 {
                let mut tx_in = 0u64;
                for (j, input) in tx.inputs.iter().enumerate() {
                    let prev = input.previous_output;
                    let (value, pk_script) = if let Some(entry) = shadow.get_mut(&prev.txid) {
                        let source = &block.transactions[entry.tx_index];
                        let out = source
                            .outputs
                            .get(prev.index as usize)
                            .ok_or_else(|| fail(ApplyError::OutputIndexOutOfRange(prev)))?;
                        if entry.coinbase {
                            return Err(fail(ApplyError::SpendsOwnCoinbase(prev)));
                        }
                        let slot = &mut entry.spent[prev.index as usize];
                        if *slot {
                            return Err(fail(ApplyError::DoubleSpend(prev)));
                        }
                        *slot = true;
                        (out.value, out.pk_script.clone())
                    } else {
                        let out = lookup(&prev)?.ok_or_else(|| fail(ApplyError::UnknownInput(prev)))?;
                        if prev.index >= out.out_count {
                            return Err(fail(ApplyError::OutputIndexOutOfRange(prev)));
                        }
                        if !spent.entry(prev.txid).or_default().insert(prev.index) {
                            return Err(fail(ApplyError::DoubleSpend(prev)));
                        }
                        if out.coinbase {
                            let age = height.saturating_sub(out.height);
                            if age < ctx.coinbase_maturity {
                                return Err(fail(ApplyError::ImmatureCoinbase { outpoint: prev, age }));
                            }
                        }
                        if let Some(undo) = undo.as_mut() {
                            undo.entry(prev.txid)
                                .or_insert_with(|| UtxoRecord {
                                    txid: prev.txid,
                                    height: out.height,
                                    coinbase: out.coinbase,
                                    outputs: vec![None; out.out_count as usize],
                                })
                                .restore(
                                    prev.index,
                                    UtxoOutput { value: out.value, pk_script: out.pk_script.clone() },
                                );
                        }
                        (out.value, out.pk_script)
                    };

                    tx_in = tx_in.checked_add(value).ok_or_else(|| fail(ApplyError::ValueOverflow))?;
                    if !ctx.trusted {
                        batch.submit(ScriptCheck { tx, input_index: j, pk_script, value, flags: ctx.flags });
                    }
                }

                if tx_out > tx_in {
                    return Err(fail(ApplyError::OutputsExceedInputs {
                        txid: txids[i],
                        inputs: tx_in,
                        outputs: tx_out,
                    }));
                }
                block_in = block_in.checked_add(tx_in).ok_or_else(|| fail(ApplyError::ValueOverflow))?;
            }

            shadow.insert(
                txids[i],
                Shadow { tx_index: i, coinbase: i == 0, spent: vec![false; tx.outputs.len()] },
            );
        }

        Ok((shadow, spent, undo, block_in, block_out))
    });

    let (shadow, spent, undo, block_in, block_out) = walked?;
    if failures > 0 {
        return Err(fail(ApplyError::ScriptFailed { failures }));
    }
    if block_in < block_out {
        return Err(fail(ApplyError::BlockValueExceeded { inputs: block_in, outputs: block_out }));
    }

    let mut added = Vec::with_capacity(block.transactions.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        let Some(entry) = shadow.get(&txids[i]) else {
            continue;
        };
        // A later transaction with the same txid replaced this one's entry.
        if entry.tx_index != i {
            continue;
        }
        let mut rec = UtxoRecord::from_transaction(txids[i], tx, height);
        for (index, spent) in entry.spent.iter().enumerate() {
            if *spent {
                rec.outputs[index] = None;
            }
        }
        if !rec.is_empty() {
            added.push(rec);
        }
    }

    let changes = BlockChanges {
        height,
        added,
        spent,
        undo: undo.map(|u| u.into_values().collect()),
    };
    debug!(
        height,
        txs = block.transactions.len(),
        added = changes.added.len(),
        spent = changes.spent_count(),
        undo = changes.undo.is_some(),
        "block applied"
    );
    Ok(changes)
}
