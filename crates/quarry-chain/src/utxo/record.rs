//! UTXO records and their compact encoding.
//!
//! A record holds the still-unspent outputs of one transaction. Its compact
//! form, which is what the live map stores, is:
//!
//! ```text
//! varint height
//! varint 2 * out_count + coinbase
//! for each unspent output, by increasing index:
//!     varint index, varint value, varint script length, script
//! ```
//!
//! Snapshot and undo files store records as entries: varint entry length,
//! 32-byte txid, compact record (the length covers txid and record).

use quarry_core::error::StoreError;
use quarry_core::types::{Hash256, Transaction};
use quarry_core::varint::{Cursor, write_varint};

/// Upper bound on the output count of a decoded record. A transaction cannot
/// have more outputs than fit in a block.
const MAX_RECORD_OUTPUTS: u64 = 1_000_000 / 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoOutput {
    pub value: u64,
    pub pk_script: Vec<u8>,
}

/// Unspent outputs of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoRecord {
    pub txid: Hash256,
    /// Height of the block that created the transaction.
    pub height: u64,
    pub coinbase: bool,
    /// One slot per output of the creating transaction; `None` once spent.
    pub outputs: Vec<Option<UtxoOutput>>,
}

/// A single unspent output as seen by callers of `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub value: u64,
    pub pk_script: Vec<u8>,
    pub height: u64,
    pub coinbase: bool,
    /// Output count of the originating transaction.
    pub out_count: u32,
}

impl UtxoRecord {
    /// Record with every output of `tx` unspent.
    pub fn from_transaction(txid: Hash256, tx: &Transaction, height: u64) -> Self {
        Self {
            txid,
            height,
            coinbase: tx.is_coinbase(),
            outputs: tx
                .outputs
                .iter()
                .map(|o| Some(UtxoOutput { value: o.value, pk_script: o.pk_script.clone() }))
                .collect(),
        }
    }

    /// Same transaction, no outputs present.
    pub fn empty_like(&self) -> Self {
        Self {
            txid: self.txid,
            height: self.height,
            coinbase: self.coinbase,
            outputs: vec![None; self.outputs.len()],
        }
    }

    pub fn out_count(&self) -> u32 {
        self.outputs.len() as u32
    }

    /// No unspent output left.
    pub fn is_empty(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn output(&self, index: u32) -> Option<&UtxoOutput> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    /// Remove and return output `index`.
    pub fn take(&mut self, index: u32) -> Option<UtxoOutput> {
        self.outputs.get_mut(index as usize).and_then(Option::take)
    }

    /// Put an output into slot `index`, growing the slot list if needed.
    pub fn restore(&mut self, index: u32, output: UtxoOutput) {
        let index = index as usize;
        if self.outputs.len() <= index {
            self.outputs.resize(index + 1, None);
        }
        self.outputs[index] = Some(output);
    }

    /// Copy every present output of `other` into this record.
    pub fn merge(&mut self, other: UtxoRecord) {
        if self.outputs.len() < other.outputs.len() {
            self.outputs.resize(other.outputs.len(), None);
        }
        for (index, output) in other.outputs.into_iter().enumerate() {
            if let Some(output) = output {
                self.outputs[index] = Some(output);
            }
        }
    }

    pub fn unspent(&self, index: u32) -> Option<UnspentOutput> {
        self.output(index).map(|o| UnspentOutput {
            value: o.value,
            pk_script: o.pk_script.clone(),
            height: self.height,
            coinbase: self.coinbase,
            out_count: self.out_count(),
        })
    }

    /// Number of present outputs.
    pub fn unspent_count(&self) -> usize {
        self.outputs.iter().filter(|o| o.is_some()).count()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.outputs.len() * 32);
        write_varint(&mut buf, self.height);
        write_varint(&mut buf, 2 * self.outputs.len() as u64 + u64::from(self.coinbase));
        for (index, output) in self.outputs.iter().enumerate() {
            if let Some(output) = output {
                write_varint(&mut buf, index as u64);
                write_varint(&mut buf, output.value);
                write_varint(&mut buf, output.pk_script.len() as u64);
                buf.extend_from_slice(&output.pk_script);
            }
        }
        buf
    }

    pub fn decode(txid: Hash256, data: &[u8]) -> Result<Self, StoreError> {
        let mut cur = Cursor::new(data);
        let (height, coinbase, out_count) = read_header(&mut cur)?;
        let mut outputs = vec![None; out_count as usize];
        let mut next = 0u64;
        while !cur.is_empty() {
            let (index, value, script) = read_output(&mut cur)?;
            if index < next || index >= out_count {
                return Err(corrupt("output index out of order"));
            }
            outputs[index as usize] = Some(UtxoOutput { value, pk_script: script.to_vec() });
            next = index + 1;
        }
        Ok(Self { txid, height, coinbase, outputs })
    }

    /// Decode only output `index` of an encoded record.
    pub fn decode_output(data: &[u8], index: u32) -> Result<Option<UnspentOutput>, StoreError> {
        let mut cur = Cursor::new(data);
        let (height, coinbase, out_count) = read_header(&mut cur)?;
        while !cur.is_empty() {
            let (at, value, script) = read_output(&mut cur)?;
            if at == u64::from(index) {
                return Ok(Some(UnspentOutput {
                    value,
                    pk_script: script.to_vec(),
                    height,
                    coinbase,
                    out_count: out_count as u32,
                }));
            }
            if at > u64::from(index) {
                break;
            }
        }
        Ok(None)
    }

    /// Append this record as a length-prefixed entry.
    pub fn write_entry(&self, buf: &mut Vec<u8>) {
        write_entry(buf, &self.txid, &self.encode());
    }

    pub fn read_entry(cur: &mut Cursor<'_>) -> Result<Self, StoreError> {
        let (txid, data) = read_entry(cur)?;
        Self::decode(txid, data)
    }
}

/// Append `txid` and already-encoded `record` as one entry.
pub fn write_entry(buf: &mut Vec<u8>, txid: &Hash256, record: &[u8]) {
    write_varint(buf, (32 + record.len()) as u64);
    buf.extend_from_slice(txid.as_bytes());
    buf.extend_from_slice(record);
}

/// Read one entry, returning the txid and the still-encoded record.
pub fn read_entry<'a>(cur: &mut Cursor<'a>) -> Result<(Hash256, &'a [u8]), StoreError> {
    let len = cur.varint().ok_or_else(|| corrupt("truncated entry length"))?;
    let len = usize::try_from(len).map_err(|_| corrupt("entry length overflow"))?;
    if len < 32 {
        return Err(corrupt("entry shorter than a txid"));
    }
    let txid = cur.array::<32>().ok_or_else(|| corrupt("truncated txid"))?;
    let data = cur.bytes(len - 32).ok_or_else(|| corrupt("truncated record"))?;
    Ok((Hash256(txid), data))
}

fn read_header(cur: &mut Cursor<'_>) -> Result<(u64, bool, u64), StoreError> {
    let height = cur.varint().ok_or_else(|| corrupt("truncated height"))?;
    let packed = cur.varint().ok_or_else(|| corrupt("truncated output count"))?;
    let out_count = packed >> 1;
    if out_count > MAX_RECORD_OUTPUTS {
        return Err(corrupt("output count too large"));
    }
    Ok((height, packed & 1 == 1, out_count))
}

fn read_output<'a>(cur: &mut Cursor<'a>) -> Result<(u64, u64, &'a [u8]), StoreError> {
    let index = cur.varint().ok_or_else(|| corrupt("truncated output index"))?;
    let value = cur.varint().ok_or_else(|| corrupt("truncated value"))?;
    let len = cur.varint().ok_or_else(|| corrupt("truncated script length"))?;
    let len = usize::try_from(len).map_err(|_| corrupt("script length overflow"))?;
    let script = cur.bytes(len).ok_or_else(|| corrupt("truncated script"))?;
    Ok((index, value, script))
}

fn corrupt(what: &str) -> StoreError {
    StoreError::Corrupt(format!("utxo record: {what}"))
}
