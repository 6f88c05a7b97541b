//! Hierarchical deterministic key derivation.
//!
//! # Security
//! - The master seed is loaded ONLY from an environment variable
//! - Keys are never logged or serialized
//!
//! Receiving keys live at `m/44'/<coin>'/<account>'/0/<index>` (BIP32/BIP44).

use std::fmt;

use hmac::{Hmac, Mac};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{PublicKey, Scalar};
use sha2::Sha512;

use crate::blockchain::address::Address;
use crate::blockchain::types::{BlockchainError, BlockchainResult, Network};

/// Environment variable holding the hex-encoded master seed.
pub const SEED_ENV_VAR: &str = "SETTLEMENT_MASTER_SEED";

const HARDENED: u32 = 0x8000_0000;

type HmacSha512 = Hmac<Sha512>;

/// Private extended key: signing key plus chain code.
#[derive(Clone)]
pub(crate) struct ExtendedKey {
    pub(crate) key: SigningKey,
    pub(crate) chain_code: [u8; 32],
}

impl ExtendedKey {
    pub(crate) fn master(seed: &[u8]) -> BlockchainResult<Self> {
        if seed.len() < 16 || seed.len() > 64 {
            return Err(BlockchainError::Wallet(format!(
                "Seed must be 16-64 bytes, got {}",
                seed.len()
            )));
        }
        let mut mac = HmacSha512::new_from_slice(b"Bitcoin seed")
            .map_err(|e| BlockchainError::Wallet(e.to_string()))?;
        mac.update(seed);
        Self::from_hmac_output(&mac.finalize().into_bytes())
    }

    fn from_hmac_output(out: &[u8]) -> BlockchainResult<Self> {
        let key = SigningKey::from_slice(&out[..32])
            .map_err(|_| BlockchainError::Wallet("Derived key out of range".to_string()))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&out[32..]);
        Ok(Self { key, chain_code })
    }

    pub(crate) fn public_key(&self) -> [u8; 33] {
        compressed_public_key(&self.key)
    }

    pub(crate) fn derive_child(&self, index: u32) -> BlockchainResult<Self> {
        let mut mac = HmacSha512::new_from_slice(&self.chain_code)
            .map_err(|e| BlockchainError::Wallet(e.to_string()))?;
        if index >= HARDENED {
            mac.update(&[0u8]);
            mac.update(&self.key.to_bytes());
        } else {
            mac.update(&self.public_key());
        }
        mac.update(&index.to_be_bytes());
        let out = mac.finalize().into_bytes();

        let mut il = [0u8; 32];
        il.copy_from_slice(&out[..32]);
        let tweak: Option<Scalar> = Scalar::from_repr(il.into()).into();
        let tweak = tweak.ok_or_else(|| {
            BlockchainError::Wallet(format!("Child {} tweak exceeds curve order", index))
        })?;
        let parent: Scalar = *self.key.as_nonzero_scalar().as_ref();
        let child = tweak + parent;
        let key = SigningKey::from_bytes(&child.to_bytes())
            .map_err(|_| BlockchainError::Wallet(format!("Child {} is the zero key", index)))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&out[32..]);
        Ok(Self { key, chain_code })
    }

    pub(crate) fn derive_path(&self, path: &[u32]) -> BlockchainResult<Self> {
        path.iter()
            .try_fold(self.clone(), |key, index| key.derive_child(*index))
    }
}

/// Signing material for one derivation index.
#[derive(Clone)]
pub struct KeySet {
    pub index: u32,
    signing_key: SigningKey,
    pub public_key: [u8; 33],
    pub address: Address,
}

impl KeySet {
    /// Build a key set from a raw hex private key (no derivation).
    pub fn from_private_key(private_key_hex: &str, network: Network) -> BlockchainResult<Self> {
        let bytes = hex::decode(private_key_hex.trim_start_matches("0x"))
            .map_err(|e| BlockchainError::Wallet(format!("Invalid private key format: {}", e)))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| BlockchainError::Wallet(format!("Invalid private key format: {}", e)))?;
        Ok(Self::from_signing_key(0, signing_key, network))
    }

    fn from_signing_key(index: u32, signing_key: SigningKey, network: Network) -> Self {
        let public_key = compressed_public_key(&signing_key);
        let address = Address::p2pkh_from_pubkey(network, &public_key);
        Self {
            index,
            signing_key,
            public_key,
            address,
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("index", &self.index)
            .field("address", &self.address.to_cashaddr())
            .finish_non_exhaustive()
    }
}

/// Deterministic wallet rooted at the receive chain of one account.
#[derive(Clone)]
pub struct HdWallet {
    network: Network,
    account: u32,
    receive_chain: ExtendedKey,
}

impl HdWallet {
    /// Create a wallet from raw seed bytes.
    pub fn from_seed(seed: &[u8], network: Network, account: u32) -> BlockchainResult<Self> {
        if account >= HARDENED {
            return Err(BlockchainError::Wallet(format!(
                "Account {} out of range",
                account
            )));
        }
        let master = ExtendedKey::master(seed)?;
        let receive_chain = master.derive_path(&[
            44 | HARDENED,
            network.coin_type() | HARDENED,
            account | HARDENED,
            0,
        ])?;

        tracing::info!(
            network = ?network,
            account = account,
            "HD wallet initialized"
        );

        Ok(Self {
            network,
            account,
            receive_chain,
        })
    }

    /// Create a wallet from a hex-encoded seed.
    pub fn from_seed_hex(seed_hex: &str, network: Network, account: u32) -> BlockchainResult<Self> {
        let seed = hex::decode(seed_hex.trim())
            .map_err(|e| BlockchainError::Wallet(format!("Invalid seed format: {}", e)))?;
        Self::from_seed(&seed, network, account)
    }

    /// Load the seed from the named environment variable.
    pub fn from_env(env_var: &str, network: Network, account: u32) -> BlockchainResult<Self> {
        let seed_hex = std::env::var(env_var).map_err(|_| {
            BlockchainError::Wallet(format!("Environment variable {} not set", env_var))
        })?;
        Self::from_seed_hex(&seed_hex, network, account)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn account(&self) -> u32 {
        self.account
    }

    /// Derive the signing keys for a receiving index.
    pub fn derive_key_set(&self, index: u32) -> BlockchainResult<KeySet> {
        if index >= HARDENED {
            return Err(BlockchainError::Wallet(format!(
                "Index {} out of range",
                index
            )));
        }
        let child = self.receive_chain.derive_child(index)?;
        Ok(KeySet::from_signing_key(index, child.key, self.network))
    }

    /// Derive only the receiving address for an index.
    pub fn derive_address(&self, index: u32) -> BlockchainResult<Address> {
        Ok(self.derive_key_set(index)?.address)
    }
}

impl fmt::Debug for HdWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdWallet")
            .field("network", &self.network)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

fn compressed_public_key(key: &SigningKey) -> [u8; 33] {
    let point = PublicKey::from(key.verifying_key()).to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(point.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP32 test vector 1
    const VECTOR_SEED: &str = "000102030405060708090a0b0c0d0e0f";

    fn master() -> ExtendedKey {
        ExtendedKey::master(&hex::decode(VECTOR_SEED).unwrap()).unwrap()
    }

    #[test]
    fn test_bip32_master_key() {
        let m = master();
        assert_eq!(
            hex::encode(m.key.to_bytes()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(m.chain_code),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );
    }

    #[test]
    fn test_bip32_hardened_then_normal_child() {
        let child = master().derive_path(&[HARDENED]).unwrap();
        assert_eq!(
            hex::encode(child.key.to_bytes()),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );

        let grandchild = child.derive_child(1).unwrap();
        assert_eq!(
            hex::encode(grandchild.key.to_bytes()),
            "3c6cb8d0f6a264c91ea8b5030fadaa8e538b020f0a387421a12de9319dc93368"
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = HdWallet::from_seed_hex(VECTOR_SEED, Network::Mainnet, 0).unwrap();
        let b = HdWallet::from_seed_hex(VECTOR_SEED, Network::Mainnet, 0).unwrap();
        assert_eq!(a.derive_address(7).unwrap(), b.derive_address(7).unwrap());
        assert_ne!(a.derive_address(7).unwrap(), a.derive_address(8).unwrap());

        let other_account = HdWallet::from_seed_hex(VECTOR_SEED, Network::Mainnet, 1).unwrap();
        assert_ne!(a.derive_address(0).unwrap(), other_account.derive_address(0).unwrap());
    }

    #[test]
    fn test_key_set_address_matches_public_key() {
        let wallet = HdWallet::from_seed_hex(VECTOR_SEED, Network::Testnet, 0).unwrap();
        let keys = wallet.derive_key_set(3).unwrap();
        assert_eq!(keys.index, 3);
        assert!(keys.public_key[0] == 0x02 || keys.public_key[0] == 0x03);
        assert_eq!(keys.address, Address::p2pkh_from_pubkey(Network::Testnet, &keys.public_key));
        assert!(keys.address.to_cashaddr().starts_with("bchtest:q"));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(HdWallet::from_seed_hex("zz", Network::Mainnet, 0).is_err());
        assert!(HdWallet::from_seed(&[1u8; 8], Network::Mainnet, 0).is_err());
        let wallet = HdWallet::from_seed_hex(VECTOR_SEED, Network::Mainnet, 0).unwrap();
        assert!(wallet.derive_key_set(HARDENED).is_err());
        assert!(KeySet::from_private_key("invalid_key", Network::Mainnet)
            .unwrap_err()
            .to_string()
            .contains("Invalid private key"));
    }

    #[test]
    fn test_debug_never_prints_secret() {
        let keys = KeySet::from_private_key(
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35",
            Network::Mainnet,
        )
        .unwrap();
        let rendered = format!("{:?}", keys);
        assert!(!rendered.contains("e8f32e72"));
    }
}
