//! Shared test helpers for the integration tests.

use std::sync::Arc;

use quarry_chain::{ChainOptions, ChainState, MemoryBlockStore};
use quarry_core::difficulty::check_proof_of_work;
use quarry_core::merkle::block_merkle_root;
use quarry_core::params::ConsensusParams;
use quarry_core::reward::block_subsidy;
use quarry_core::traits::{BlockStore, SignatureVerifier};
use quarry_core::types::*;
use quarry_core::validation::coinbase_height_prefix;

/// Verifier that accepts every script.
pub struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _: &[u8], _: &[u8], _: usize, _: &Transaction, _: u64, _: u32) -> bool {
        true
    }
}

/// Verifier that rejects every script.
pub struct RejectAll;

impl SignatureVerifier for RejectAll {
    fn verify(&self, _: &[u8], _: &[u8], _: usize, _: &Transaction, _: u64, _: u32) -> bool {
        false
    }
}

/// Regtest with a two-block coinbase maturity and a six-block moving
/// checkpoint, so tests stay short.
pub fn test_params() -> ConsensusParams {
    ConsensusParams {
        coinbase_maturity: 2,
        moving_checkpoint_depth: 6,
        ..ConsensusParams::regtest()
    }
}

pub type MemoryChain = ChainState<MemoryBlockStore>;

/// A fresh in-memory chain at genesis that accepts every script.
pub fn memory_chain(params: ConsensusParams) -> MemoryChain {
    memory_chain_with(params, Arc::new(AcceptAll), ChainOptions::default())
}

pub fn memory_chain_with(
    params: ConsensusParams,
    verifier: Arc<dyn SignatureVerifier>,
    options: ChainOptions,
) -> MemoryChain {
    ChainState::open(params, MemoryBlockStore::new(), verifier, options).unwrap()
}

/// Pay-to-pubkey-hash style script, distinct per seed.
pub fn pkh(seed: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[seed; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Coinbase paying `value` at `height`. `salt` keeps sibling blocks at the
/// same height from sharing a coinbase txid.
pub fn make_coinbase(height: u64, value: u64, salt: u8) -> Transaction {
    let mut script_sig = coinbase_height_prefix(height);
    script_sig.extend_from_slice(&[0x01, salt]);
    Transaction {
        version: 1,
        inputs: vec![TxInput { previous_output: OutPoint::null(), script_sig, sequence: u32::MAX }],
        outputs: vec![TxOutput { value, pk_script: pkh(salt) }],
        lock_time: 0,
    }
}

/// Unsigned transaction spending `inputs` into `outputs`.
pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<(u64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|op| TxInput { previous_output: op, script_sig: vec![0x51], sequence: u32::MAX })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, pk_script)| TxOutput { value, pk_script })
            .collect(),
        lock_time: 0,
    }
}

/// Search nonces until the header meets its own target.
pub fn mine(block: &mut Block, params: &ConsensusParams) {
    while !check_proof_of_work(&block.hash(), block.header.bits, &params.pow_limit) {
        block.header.nonce += 1;
    }
}

/// Recompute the merkle root after editing transactions, then re-mine.
pub fn reseal(block: &mut Block, params: &ConsensusParams) {
    block.header.merkle_root = block_merkle_root(&block.transactions).0;
    block.header.nonce = 0;
    mine(block, params);
}

/// A valid, mined block on `parent`: a coinbase claiming the full subsidy
/// followed by `txs`, ten minutes after the parent, at the required bits.
pub fn make_block<S: BlockStore>(
    chain: &ChainState<S>,
    parent: &Hash256,
    salt: u8,
    txs: Vec<Transaction>,
) -> Block {
    let index = chain.index();
    let parent_id = index.lookup(parent).unwrap();
    let p = &index[parent_id];
    let height = p.height + 1;
    let timestamp = p.timestamp() + 600;

    let mut transactions = vec![make_coinbase(height, block_subsidy(height), salt)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 4,
            prev_hash: p.hash,
            merkle_root: block_merkle_root(&transactions).0,
            timestamp,
            bits: index.next_work_required(parent_id, timestamp, chain.params()),
            nonce: 0,
        },
        transactions,
    };
    mine(&mut block, chain.params());
    block
}

/// Mine and process `n` coinbase-only blocks on `from`. Processing errors
/// are ignored; the blocks are returned either way.
pub fn extend<S: BlockStore>(chain: &mut ChainState<S>, from: Hash256, n: usize, salt: u8) -> Vec<Block> {
    let mut parent = from;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let block = make_block(chain, &parent, salt, vec![]);
        parent = block.hash();
        let _ = chain.process_block(&block, false);
        out.push(block);
    }
    out
}

/// Output 0 of the block's coinbase.
pub fn coinbase_out(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}
