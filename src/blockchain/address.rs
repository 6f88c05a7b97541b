//! Address encoding: CashAddr and legacy base58check.
//!
//! Both forms decode into the same [`Address`]; the engine always renders
//! CashAddr with its network prefix.

use std::fmt;

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::blockchain::types::{BlockchainError, BlockchainResult, Network};

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Output template the address pays to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    P2pkh,
    P2sh,
}

impl AddressKind {
    fn version_byte(&self) -> u8 {
        // Type bits shifted into the high nibble; size code 0 (160 bits).
        match self {
            AddressKind::P2pkh => 0x00,
            AddressKind::P2sh => 0x08,
        }
    }
}

/// A decoded address: network, template and 20-byte hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub network: Network,
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl Address {
    /// Pay-to-public-key-hash address for a compressed public key.
    pub fn p2pkh_from_pubkey(network: Network, pubkey: &[u8]) -> Self {
        Self {
            network,
            kind: AddressKind::P2pkh,
            hash: hash160(pubkey),
        }
    }

    /// Parse CashAddr (prefixed or bare) or legacy base58check for `network`.
    pub fn parse(input: &str, network: Network) -> BlockchainResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(BlockchainError::InvalidAddress(input.to_string()));
        }
        if let Ok(addr) = Self::from_cashaddr(trimmed, network) {
            return Ok(addr);
        }
        Self::from_legacy(trimmed, network)
    }

    /// Decode a CashAddr string. A missing prefix is taken to be the network's.
    pub fn from_cashaddr(input: &str, network: Network) -> BlockchainResult<Self> {
        let invalid = || BlockchainError::InvalidAddress(input.to_string());

        let has_upper = input.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = input.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower {
            return Err(invalid());
        }
        let lowered = input.to_ascii_lowercase();
        let (prefix, payload) = match lowered.split_once(':') {
            Some((p, rest)) => (p.to_string(), rest.to_string()),
            None => (network.cashaddr_prefix().to_string(), lowered.clone()),
        };
        if prefix != network.cashaddr_prefix() {
            return Err(invalid());
        }

        let mut values = Vec::with_capacity(payload.len());
        for c in payload.bytes() {
            let pos = CHARSET.iter().position(|&x| x == c).ok_or_else(invalid)?;
            values.push(pos as u8);
        }
        if values.len() < 8 {
            return Err(invalid());
        }

        let mut checked = prefix_values(&prefix);
        checked.extend_from_slice(&values);
        if polymod(&checked) != 0 {
            return Err(invalid());
        }

        let data = convert_bits(&values[..values.len() - 8], 5, 8, false).ok_or_else(invalid)?;
        if data.len() != 21 {
            return Err(invalid());
        }
        let kind = match data[0] {
            0x00 => AddressKind::P2pkh,
            0x08 => AddressKind::P2sh,
            _ => return Err(invalid()),
        };
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&data[1..]);
        Ok(Self { network, kind, hash })
    }

    /// Decode a legacy base58check address.
    pub fn from_legacy(input: &str, network: Network) -> BlockchainResult<Self> {
        let invalid = || BlockchainError::InvalidAddress(input.to_string());
        let bytes = bs58::decode(input)
            .with_check(None)
            .into_vec()
            .map_err(|_| invalid())?;
        if bytes.len() != 21 {
            return Err(invalid());
        }
        let (p2pkh, p2sh) = network.legacy_versions();
        let kind = match bytes[0] {
            v if v == p2pkh => AddressKind::P2pkh,
            v if v == p2sh => AddressKind::P2sh,
            _ => return Err(invalid()),
        };
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[1..]);
        Ok(Self { network, kind, hash })
    }

    /// Render as CashAddr with prefix.
    pub fn to_cashaddr(&self) -> String {
        let prefix = self.network.cashaddr_prefix();
        let mut raw = Vec::with_capacity(21);
        raw.push(self.kind.version_byte());
        raw.extend_from_slice(&self.hash);
        let payload = convert_bits(&raw, 8, 5, true).unwrap_or_default();

        let mut checked = prefix_values(prefix);
        checked.extend_from_slice(&payload);
        checked.extend_from_slice(&[0u8; 8]);
        let checksum = polymod(&checked);

        let mut out = String::with_capacity(prefix.len() + 1 + payload.len() + 8);
        out.push_str(prefix);
        out.push(':');
        for v in &payload {
            out.push(CHARSET[*v as usize] as char);
        }
        for i in 0..8 {
            let v = ((checksum >> (5 * (7 - i))) & 0x1f) as usize;
            out.push(CHARSET[v] as char);
        }
        out
    }

    /// Render as legacy base58check.
    pub fn to_legacy(&self) -> String {
        let (p2pkh, p2sh) = self.network.legacy_versions();
        let version = match self.kind {
            AddressKind::P2pkh => p2pkh,
            AddressKind::P2sh => p2sh,
        };
        let mut raw = Vec::with_capacity(21);
        raw.push(version);
        raw.extend_from_slice(&self.hash);
        bs58::encode(raw).with_check().into_string()
    }

    /// Locking script paying this address.
    pub fn locking_script(&self) -> Vec<u8> {
        match self.kind {
            AddressKind::P2pkh => {
                // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
                let mut script = Vec::with_capacity(25);
                script.extend_from_slice(&[0x76, 0xa9, 0x14]);
                script.extend_from_slice(&self.hash);
                script.extend_from_slice(&[0x88, 0xac]);
                script
            }
            AddressKind::P2sh => {
                // OP_HASH160 <20> OP_EQUAL
                let mut script = Vec::with_capacity(23);
                script.extend_from_slice(&[0xa9, 0x14]);
                script.extend_from_slice(&self.hash);
                script.push(0x87);
                script
            }
        }
    }
}

impl Address {
    /// Whether `script_sig` spends an output locked to this address.
    ///
    /// The last push of a standard unlock script reveals what the lock commits
    /// to: the public key for P2PKH, the redeem script for P2SH.
    pub fn is_unlocked_by(&self, script_sig: &[u8]) -> bool {
        last_push(script_sig).is_some_and(|data| hash160(data) == self.hash)
    }
}

/// Final data push of a push-only script, if it has any.
fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut pos = 0;
    let mut last = None;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;
        let len = match opcode {
            0x01..=0x4b => usize::from(opcode),
            0x4c => {
                let len = usize::from(*script.get(pos)?);
                pos += 1;
                len
            }
            0x4d => {
                let bytes = script.get(pos..pos + 2)?;
                pos += 2;
                usize::from(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
            0x4e => {
                let bytes = script.get(pos..pos + 4)?;
                pos += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => continue,
        };
        last = Some(script.get(pos..pos.checked_add(len)?)?);
        pos += len;
    }
    last
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cashaddr())
    }
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

fn prefix_values(prefix: &str) -> Vec<u8> {
    let mut values: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    values.push(0);
    values
}

fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_ffff_ffff) << 5) ^ u64::from(*d);
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let maxv: u32 = (1 << to) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    for value in data {
        let v = u32::from(*value);
        if v >> from != 0 {
            return None;
        }
        acc = (acc << from) | v;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return None;
    }
    Some(out)
}
