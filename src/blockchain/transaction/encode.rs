//! Raw transaction wire format.
//!
//! ```text
//! version (LE32) · varint n_in · [prev txid (internal order) · index (LE32)
//!   · varint len · script_sig · sequence (LE32)] · varint n_out
//!   · [value (LE64) · varint len · script_pubkey] · locktime (LE32)
//! ```

use sha2::{Digest, Sha256};

use crate::blockchain::types::{BlockchainError, BlockchainResult};

/// Transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    /// Referenced txid in internal (little-endian) byte order.
    pub prev_tx_hash: [u8; 32],
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// Transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Transaction {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.inputs.len() * 148 + self.outputs.len() * 34);
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(&input.prev_tx_hash);
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            write_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            write_output(&mut out, output);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    /// Display-order transaction id.
    pub fn tx_id(&self) -> String {
        let mut hash = sha256d(&self.serialize());
        hash.reverse();
        hex::encode(hash)
    }

    pub fn deserialize(bytes: &[u8]) -> BlockchainResult<Self> {
        let mut reader = Reader::new(bytes);
        let version = reader.read_u32()?;
        let n_in = reader.read_varint()?;
        let mut inputs = Vec::with_capacity(n_in.min(1024) as usize);
        for _ in 0..n_in {
            let mut prev_tx_hash = [0u8; 32];
            prev_tx_hash.copy_from_slice(reader.take(32)?);
            let prev_index = reader.read_u32()?;
            let len = reader.read_varint()? as usize;
            let script_sig = reader.take(len)?.to_vec();
            let sequence = reader.read_u32()?;
            inputs.push(TxIn {
                prev_tx_hash,
                prev_index,
                script_sig,
                sequence,
            });
        }
        let n_out = reader.read_varint()?;
        let mut outputs = Vec::with_capacity(n_out.min(1024) as usize);
        for _ in 0..n_out {
            let value = reader.read_u64()?;
            let len = reader.read_varint()? as usize;
            let script_pubkey = reader.take(len)?.to_vec();
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let locktime = reader.read_u32()?;
        if !reader.is_empty() {
            return Err(BlockchainError::Decode(format!(
                "{} trailing bytes after transaction",
                reader.remaining()
            )));
        }
        Ok(Self {
            version,
            inputs,
            outputs,
            locktime,
        })
    }
}

pub(crate) fn write_output(out: &mut Vec<u8>, output: &TxOut) {
    out.extend_from_slice(&output.value.to_le_bytes());
    write_varint(out, output.script_pubkey.len() as u64);
    out.extend_from_slice(&output.script_pubkey);
}

/// Bitcoin variable-length integer.
pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let once = Sha256::digest(data);
    let twice = Sha256::digest(once);
    let mut out = [0u8; 32];
    out.copy_from_slice(&twice);
    out
}

/// Convert a display-order hex txid into internal byte order.
pub fn tx_hash_from_hex(tx_id: &str) -> BlockchainResult<[u8; 32]> {
    let bytes = hex::decode(tx_id)
        .map_err(|e| BlockchainError::Decode(format!("Invalid txid '{}': {}", tx_id, e)))?;
    if bytes.len() != 32 {
        return Err(BlockchainError::Decode(format!(
            "Invalid txid '{}': expected 32 bytes",
            tx_id
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Ok(hash)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> BlockchainResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(BlockchainError::Decode(format!(
                "Unexpected end of transaction at byte {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> BlockchainResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> BlockchainResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_varint(&mut self) -> BlockchainResult<u64> {
        let first = self.take(1)?[0];
        Ok(match first {
            0xfd => {
                let mut buf = [0u8; 2];
                buf.copy_from_slice(self.take(2)?);
                u64::from(u16::from_le_bytes(buf))
            }
            0xfe => u64::from(self.read_u32()?),
            0xff => self.read_u64()?,
            n => u64::from(n),
        })
    }
}
