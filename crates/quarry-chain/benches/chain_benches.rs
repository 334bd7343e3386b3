//! Criterion benchmarks for quarry-chain hot paths.
//!
//! Covers: UTXO record encoding and point lookups, and applying a block of
//! independent spends with inline and threaded script verification.

use std::collections::HashMap;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use quarry_chain::apply::{ApplyContext, apply_block};
use quarry_chain::utxo::{UnspentOutput, UtxoRecord};
use quarry_chain::verify::VerifyPool;
use quarry_core::constants::COIN;
use quarry_core::traits::SignatureVerifier;
use quarry_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use quarry_core::validation::coinbase_height_prefix;

struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _: &[u8], _: &[u8], _: usize, _: &Transaction, _: u64, _: u32) -> bool {
        true
    }
}

fn pkh(seed: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[seed; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn make_tx(prev: OutPoint, outputs: usize) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput { previous_output: prev, script_sig: vec![0x42; 107], sequence: u32::MAX }],
        outputs: (0..outputs)
            .map(|i| TxOutput { value: 1_000 + i as u64, pk_script: pkh(i as u8) })
            .collect(),
        lock_time: 0,
    }
}

/// A block spending `n` funded outpoints, and the lookup table backing them.
fn make_block(n: usize) -> (Block, HashMap<OutPoint, UnspentOutput>) {
    let mut utxos = HashMap::new();
    let mut txs = vec![Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            script_sig: coinbase_height_prefix(500),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput { value: 50 * COIN, pk_script: pkh(0) }],
        lock_time: 0,
    }];
    for i in 0..n {
        let mut txid = [0u8; 32];
        txid[..8].copy_from_slice(&(i as u64).to_le_bytes());
        let prev = OutPoint::new(Hash256(txid), 0);
        utxos.insert(
            prev,
            UnspentOutput { value: COIN, pk_script: pkh(1), height: 10, coinbase: false, out_count: 1 },
        );
        txs.push(make_tx(prev, 2));
    }
    let block = Block {
        header: BlockHeader {
            version: 4,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000,
            bits: 0x207fffff,
            nonce: 0,
        },
        transactions: txs,
    };
    (block, utxos)
}

fn bench_record_codec(c: &mut Criterion) {
    let tx = make_tx(OutPoint::new(Hash256([1; 32]), 0), 20);
    let record = UtxoRecord::from_transaction(tx.txid(), &tx, 123_456);
    let encoded = record.encode();

    c.bench_function("utxo_record_encode_20_outputs", |b| {
        b.iter(|| black_box(&record).encode())
    });

    c.bench_function("utxo_record_decode_20_outputs", |b| {
        b.iter(|| UtxoRecord::decode(record.txid, black_box(&encoded)))
    });

    c.bench_function("utxo_record_decode_single_output", |b| {
        b.iter(|| UtxoRecord::decode_output(black_box(&encoded), 17))
    });
}

fn bench_apply_block(c: &mut Criterion) {
    let (block, utxos) = make_block(1_000);
    let ctx = ApplyContext {
        height: 500,
        last_known_height: 500,
        undo_window: 256,
        coinbase_maturity: 100,
        flags: 0,
        trusted: false,
    };
    let inline = VerifyPool::inline();
    let threaded = VerifyPool::new(4).expect("thread pool");

    c.bench_function("apply_block_1000_spends_inline", |b| {
        b.iter(|| apply_block(black_box(&block), &ctx, &inline, &AcceptAll, |op| Ok(utxos.get(op).cloned())))
    });

    c.bench_function("apply_block_1000_spends_4_threads", |b| {
        b.iter(|| apply_block(black_box(&block), &ctx, &threaded, &AcceptAll, |op| Ok(utxos.get(op).cloned())))
    });
}

criterion_group!(benches, bench_record_codec, bench_apply_block);
criterion_main!(benches);
