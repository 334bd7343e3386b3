//! Stateless transaction checks.
//!
//! Everything here looks only at the transaction itself (plus the height and
//! time it is being judged at). Checks that need the UTXO set live in the
//! application engine.

use std::collections::HashSet;

use crate::constants::{
    COINBASE_SCRIPT_MAX, COINBASE_SCRIPT_MIN, LOCKTIME_THRESHOLD, MAX_BLOCK_SIZE, MAX_MONEY,
    SEQUENCE_FINAL,
};
use crate::error::TransactionError;
use crate::types::Transaction;

/// Structural sanity of a single transaction.
///
/// Rejects empty input or output lists, transactions larger than a block,
/// output values (individually or summed) above [`MAX_MONEY`], an outpoint
/// spent twice, coinbase scripts outside `[2, 100]` bytes and null prevouts
/// in ordinary transactions.
pub fn check_transaction(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() {
        return Err(TransactionError::EmptyInputs);
    }
    if tx.outputs.is_empty() {
        return Err(TransactionError::EmptyOutputs);
    }

    let size = tx.serialized_size();
    if size > MAX_BLOCK_SIZE {
        return Err(TransactionError::Oversized { size, max: MAX_BLOCK_SIZE });
    }

    let mut total = 0u64;
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.value > MAX_MONEY {
            return Err(TransactionError::ValueOutOfRange { index, value: output.value });
        }
        total = total
            .checked_add(output.value)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or(TransactionError::ValueOverflow)?;
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.previous_output) {
            return Err(TransactionError::DuplicateInput(input.previous_output));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(COINBASE_SCRIPT_MIN..=COINBASE_SCRIPT_MAX).contains(&len) {
            return Err(TransactionError::CoinbaseScriptSize(len));
        }
    } else if let Some(i) = tx.inputs.iter().position(|i| i.previous_output.is_null()) {
        return Err(TransactionError::NullPrevout(i));
    }

    Ok(())
}

/// Whether `tx` may be included in a block at `height` with time `time`.
///
/// A zero lock time is always final. Otherwise the lock time is compared
/// with the height when below [`LOCKTIME_THRESHOLD`] and with the time when at
/// or above it; an unexpired lock is still final when every input has a final
/// sequence number.
pub fn is_final(tx: &Transaction, height: u64, time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        u64::from(time)
    };
    if u64::from(tx.lock_time) < cutoff {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// The script prefix a coinbase must start with at `height`: a single data
/// push of the height as a minimally encoded little-endian script number.
///
/// ```
/// use quarry_core::validation::coinbase_height_prefix;
/// assert_eq!(coinbase_height_prefix(1), vec![0x01, 0x01]);
/// assert_eq!(coinbase_height_prefix(0x80), vec![0x02, 0x80, 0x00]);
/// ```
pub fn coinbase_height_prefix(height: u64) -> Vec<u8> {
    let mut num: Vec<u8> = height.to_le_bytes().to_vec();
    while num.len() > 1 && num[num.len() - 1] == 0 {
        num.pop();
    }
    // Script numbers are signed; keep a set top bit from reading as negative.
    if num[num.len() - 1] & 0x80 != 0 {
        num.push(0);
    }
    let mut out = Vec::with_capacity(num.len() + 1);
    out.push(num.len() as u8);
    out.extend_from_slice(&num);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::types::{Hash256, OutPoint, TxInput, TxOutput};

    fn make_tx(prevouts: &[OutPoint], values: &[u64]) -> Transaction {
        Transaction {
            version: 1,
            inputs: prevouts
                .iter()
                .map(|p| TxInput { previous_output: *p, script_sig: vec![0x51], sequence: SEQUENCE_FINAL })
                .collect(),
            outputs: values
                .iter()
                .map(|v| TxOutput { value: *v, pk_script: vec![0x51] })
                .collect(),
            lock_time: 0,
        }
    }

    fn make_coinbase(script: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput { previous_output: OutPoint::null(), script_sig: script, sequence: SEQUENCE_FINAL }],
            outputs: vec![TxOutput { value: 50 * COIN, pk_script: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Hash256([n; 32]), 0)
    }

    // --- check_transaction ---

    #[test]
    fn valid_transaction_passes() {
        assert_eq!(check_transaction(&make_tx(&[op(1), op(2)], &[COIN, 2 * COIN])), Ok(()));
    }

    #[test]
    fn empty_lists_rejected() {
        assert_eq!(check_transaction(&make_tx(&[], &[COIN])), Err(TransactionError::EmptyInputs));
        assert_eq!(check_transaction(&make_tx(&[op(1)], &[])), Err(TransactionError::EmptyOutputs));
    }

    #[test]
    fn value_above_max_money_rejected() {
        let err = check_transaction(&make_tx(&[op(1)], &[MAX_MONEY + 1])).unwrap_err();
        assert!(matches!(err, TransactionError::ValueOutOfRange { index: 0, .. }));
    }

    #[test]
    fn summed_values_above_max_money_rejected() {
        let err = check_transaction(&make_tx(&[op(1)], &[MAX_MONEY, 1])).unwrap_err();
        assert_eq!(err, TransactionError::ValueOverflow);
    }

    #[test]
    fn duplicate_input_rejected() {
        let err = check_transaction(&make_tx(&[op(1), op(1)], &[COIN])).unwrap_err();
        assert_eq!(err, TransactionError::DuplicateInput(op(1)));
    }

    #[test]
    fn null_prevout_outside_coinbase_rejected() {
        let err = check_transaction(&make_tx(&[op(1), OutPoint::null()], &[COIN])).unwrap_err();
        assert_eq!(err, TransactionError::NullPrevout(1));
    }

    #[test]
    fn coinbase_script_bounds() {
        assert!(check_transaction(&make_coinbase(vec![0x01, 0x01])).is_ok());
        assert!(check_transaction(&make_coinbase(vec![0x00; 100])).is_ok());
        assert_eq!(
            check_transaction(&make_coinbase(vec![0x01])),
            Err(TransactionError::CoinbaseScriptSize(1))
        );
        assert_eq!(
            check_transaction(&make_coinbase(vec![0x00; 101])),
            Err(TransactionError::CoinbaseScriptSize(101))
        );
    }

    // --- is_final ---

    #[test]
    fn zero_lock_time_is_final() {
        assert!(is_final(&make_tx(&[op(1)], &[1]), 0, 0));
    }

    #[test]
    fn height_lock() {
        let mut tx = make_tx(&[op(1)], &[1]);
        tx.lock_time = 100;
        tx.inputs[0].sequence = 0;
        assert!(!is_final(&tx, 100, u32::MAX));
        assert!(is_final(&tx, 101, 0));
    }

    #[test]
    fn time_lock() {
        let mut tx = make_tx(&[op(1)], &[1]);
        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        tx.inputs[0].sequence = 0;
        assert!(!is_final(&tx, u64::MAX, LOCKTIME_THRESHOLD + 10));
        assert!(is_final(&tx, 0, LOCKTIME_THRESHOLD + 11));
    }

    #[test]
    fn final_sequences_override_lock() {
        let mut tx = make_tx(&[op(1)], &[1]);
        tx.lock_time = 1_000;
        assert!(is_final(&tx, 1, 0));
    }

    // --- coinbase_height_prefix ---

    #[test]
    fn height_prefix_is_minimal() {
        assert_eq!(coinbase_height_prefix(0), vec![0x01, 0x00]);
        assert_eq!(coinbase_height_prefix(0x7f), vec![0x01, 0x7f]);
        assert_eq!(coinbase_height_prefix(0x0100), vec![0x02, 0x00, 0x01]);
        assert_eq!(coinbase_height_prefix(227_931), vec![0x03, 0x5b, 0x7a, 0x03]);
        assert_eq!(coinbase_height_prefix(0x8000), vec![0x03, 0x00, 0x80, 0x00]);
    }
}
