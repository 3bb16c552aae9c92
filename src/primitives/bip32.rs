//! BIP32 Hierarchical Deterministic Keys.
//!
//! Only what an account coordinator needs: parsing paths, deriving children,
//! and (de)serialising extended keys so an account can be opened from an
//! `xprv`/`xpub` string.

use crate::primitives::address::Network;
use crate::{HdError, Result};
use base58check::{FromBase58Check, ToBase58Check};
use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

const BIP32_MASTER_KEY: &[u8] = b"Bitcoin seed";
const BIP32_HARDENED_KEY_LIMIT: u32 = 0x80000000;
const EXTENDED_KEY_LEN: usize = 78;

/// Chain code for BIP32 key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainCode(pub [u8; 32]);

impl ChainCode {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Key fingerprint (first 4 bytes of HASH160 of public key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 4]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = Ripemd160::digest(Sha256::digest(public_key.serialize()));
        let mut fingerprint = [0u8; 4];
        fingerprint.copy_from_slice(&hash[0..4]);
        Fingerprint(fingerprint)
    }
}

/// Derivation path, relative to whichever key it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivationPath {
    path: Vec<u32>,
}

impl DerivationPath {
    pub fn new(path: Vec<u32>) -> Self {
        DerivationPath { path }
    }

    pub fn master() -> Self {
        DerivationPath { path: Vec::new() }
    }

    pub fn path(&self) -> &[u32] {
        &self.path
    }

    pub fn is_hardened(child_number: u32) -> bool {
        child_number >= BIP32_HARDENED_KEY_LIMIT
    }

    pub fn hardened(index: u32) -> u32 {
        index + BIP32_HARDENED_KEY_LIMIT
    }

    /// True if any component requires the private key to derive
    pub fn has_hardened_step(&self) -> bool {
        self.path.iter().any(|&c| Self::is_hardened(c))
    }

    pub fn child(&self, child_number: u32) -> DerivationPath {
        let mut new_path = self.path.clone();
        new_path.push(child_number);
        DerivationPath::new(new_path)
    }
}

impl FromStr for DerivationPath {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "m" {
            return Ok(DerivationPath::master());
        }

        let path_str = s.strip_prefix("m/").ok_or_else(|| {
            HdError::InvalidInput("Derivation path must start with 'm' or 'm/'".to_string())
        })?;
        if path_str.is_empty() {
            return Ok(DerivationPath::master());
        }

        let mut path = Vec::new();
        for component in path_str.split('/') {
            let (index_str, is_hardened) = match component.strip_suffix(&['\'', 'h'][..]) {
                Some(stripped) => (stripped, true),
                None => (component, false),
            };

            let index: u32 = index_str.parse().map_err(|_| {
                HdError::InvalidInput(format!("Invalid path component: '{}'", component))
            })?;

            if index >= BIP32_HARDENED_KEY_LIMIT {
                return Err(HdError::InvalidInput(format!(
                    "Path component index too large: {}",
                    index
                )));
            }

            path.push(if is_hardened { DerivationPath::hardened(index) } else { index });
        }

        Ok(DerivationPath::new(path))
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for &child_number in &self.path {
            if DerivationPath::is_hardened(child_number) {
                write!(f, "/{}'", child_number - BIP32_HARDENED_KEY_LIMIT)?;
            } else {
                write!(f, "/{}", child_number)?;
            }
        }
        Ok(())
    }
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 64]> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .map_err(|e| HdError::Derivation(format!("HMAC key rejected: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn split_i(i: &[u8; 64]) -> Result<(SecretKey, ChainCode)> {
    let (il, ir) = i.split_at(32);
    let tweak = SecretKey::from_slice(il)
        .map_err(|e| HdError::Derivation(format!("Derived tweak out of range: {}", e)))?;
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(ir);
    Ok((tweak, ChainCode(chain_code)))
}

fn encode_extended(data: &[u8]) -> String {
    // base58check carries a one-byte version; the 4-byte BIP32 version spills into the payload.
    data[1..].to_base58check(data[0])
}

fn decode_extended(s: &str) -> Result<[u8; EXTENDED_KEY_LEN]> {
    let (version, payload) = s
        .from_base58check()
        .map_err(|e| HdError::InvalidInput(format!("Invalid extended key encoding: {:?}", e)))?;

    if payload.len() != EXTENDED_KEY_LEN - 1 {
        return Err(HdError::InvalidInput(format!(
            "Invalid extended key length: {} expected {}",
            payload.len() + 1,
            EXTENDED_KEY_LEN
        )));
    }

    let mut data = [0u8; EXTENDED_KEY_LEN];
    data[0] = version;
    data[1..].copy_from_slice(&payload);
    Ok(data)
}

/// Extended private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedPrivateKey {
    pub network: Network,
    pub depth: u8,
    pub parent_fingerprint: Fingerprint,
    pub child_number: u32,
    pub private_key: SecretKey,
    pub chain_code: ChainCode,
}

impl ExtendedPrivateKey {
    pub fn new_master_from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let i = hmac_sha512(BIP32_MASTER_KEY, &[seed])?;
        let (private_key, chain_code) = split_i(&i)?;

        Ok(ExtendedPrivateKey {
            network,
            depth: 0,
            parent_fingerprint: Fingerprint([0; 4]),
            child_number: 0,
            private_key,
            chain_code,
        })
    }

    pub fn derive_child(&self, child_number: u32) -> Result<ExtendedPrivateKey> {
        let secp = Secp256k1::new();
        let public_key = self.private_key.public_key(&secp);
        let index = child_number.to_be_bytes();

        let i = if DerivationPath::is_hardened(child_number) {
            hmac_sha512(&self.chain_code.0, &[&[0u8][..], &self.private_key.secret_bytes()[..], &index[..]])?
        } else {
            hmac_sha512(&self.chain_code.0, &[&public_key.serialize()[..], &index[..]])?
        };
        let (tweak, chain_code) = split_i(&i)?;

        let private_key = self
            .private_key
            .add_tweak(&Scalar::from(tweak))
            .map_err(|e| HdError::Derivation(format!("Invalid child private key: {}", e)))?;

        Ok(ExtendedPrivateKey {
            network: self.network,
            depth: self.depth.wrapping_add(1),
            parent_fingerprint: Fingerprint::from_public_key(&public_key),
            child_number,
            private_key,
            chain_code,
        })
    }

    pub fn derive_path(&self, path: &DerivationPath) -> Result<ExtendedPrivateKey> {
        let mut current_key = self.clone();
        for &child_number in path.path() {
            current_key = current_key.derive_child(child_number)?;
        }
        Ok(current_key)
    }

    pub fn extended_public_key(&self) -> ExtendedPublicKey {
        let secp = Secp256k1::new();
        ExtendedPublicKey {
            network: self.network,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
            public_key: self.private_key.public_key(&secp),
            chain_code: self.chain_code,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.extended_public_key().fingerprint()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(EXTENDED_KEY_LEN);
        data.extend_from_slice(&self.network.xprv_version());
        data.push(self.depth);
        data.extend_from_slice(self.parent_fingerprint.as_bytes());
        data.extend_from_slice(&self.child_number.to_be_bytes());
        data.extend_from_slice(self.chain_code.as_bytes());
        data.push(0x00);
        data.extend_from_slice(&self.private_key.secret_bytes());
        data
    }
}

impl FromStr for ExtendedPrivateKey {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        let data = decode_extended(s)?;
        let version = [data[0], data[1], data[2], data[3]];
        let network = Network::from_xprv_version(version)
            .ok_or_else(|| HdError::InvalidInput("Not an extended private key".to_string()))?;

        if data[45] != 0x00 {
            return Err(HdError::InvalidInput("Invalid private key prefix".to_string()));
        }

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);
        let private_key = SecretKey::from_slice(&data[46..78])
            .map_err(|e| HdError::InvalidInput(format!("Invalid private key: {}", e)))?;

        Ok(ExtendedPrivateKey {
            network,
            depth: data[4],
            parent_fingerprint: Fingerprint([data[5], data[6], data[7], data[8]]),
            child_number: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
            private_key,
            chain_code: ChainCode(chain_code),
        })
    }
}

impl fmt::Display for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode_extended(&self.to_bytes()))
    }
}

/// Extended public key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtendedPublicKey {
    pub network: Network,
    pub depth: u8,
    pub parent_fingerprint: Fingerprint,
    pub child_number: u32,
    pub public_key: PublicKey,
    pub chain_code: ChainCode,
}

impl ExtendedPublicKey {
    /// Derive a child public key (non-hardened only)
    pub fn derive_child(&self, child_number: u32) -> Result<ExtendedPublicKey> {
        if DerivationPath::is_hardened(child_number) {
            return Err(HdError::Derivation(
                "Cannot derive hardened child from public key".to_string(),
            ));
        }

        let secp = Secp256k1::new();
        let i = hmac_sha512(
            &self.chain_code.0,
            &[&self.public_key.serialize()[..], &child_number.to_be_bytes()[..]],
        )?;
        let (tweak, chain_code) = split_i(&i)?;

        let public_key = self
            .public_key
            .combine(&tweak.public_key(&secp))
            .map_err(|e| HdError::Derivation(format!("Failed to combine public keys: {}", e)))?;

        Ok(ExtendedPublicKey {
            network: self.network,
            depth: self.depth.wrapping_add(1),
            parent_fingerprint: self.fingerprint(),
            child_number,
            public_key,
            chain_code,
        })
    }

    pub fn derive_path(&self, path: &DerivationPath) -> Result<ExtendedPublicKey> {
        let mut current_key = self.clone();
        for &child_number in path.path() {
            current_key = current_key.derive_child(child_number)?;
        }
        Ok(current_key)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(&self.public_key)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(EXTENDED_KEY_LEN);
        data.extend_from_slice(&self.network.xpub_version());
        data.push(self.depth);
        data.extend_from_slice(self.parent_fingerprint.as_bytes());
        data.extend_from_slice(&self.child_number.to_be_bytes());
        data.extend_from_slice(self.chain_code.as_bytes());
        data.extend_from_slice(&self.public_key.serialize());
        data
    }
}

impl FromStr for ExtendedPublicKey {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        let data = decode_extended(s)?;
        let version = [data[0], data[1], data[2], data[3]];
        let network = Network::from_xpub_version(version)
            .ok_or_else(|| HdError::InvalidInput("Not an extended public key".to_string()))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);
        let public_key = PublicKey::from_slice(&data[45..78])
            .map_err(|e| HdError::InvalidInput(format!("Invalid public key: {}", e)))?;

        Ok(ExtendedPublicKey {
            network,
            depth: data[4],
            parent_fingerprint: Fingerprint([data[5], data[6], data[7], data[8]]),
            child_number: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
            public_key,
            chain_code: ChainCode(chain_code),
        })
    }
}

impl fmt::Display for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode_extended(&self.to_bytes()))
    }
}

/// Account-level root key handed to a coordinator.
///
/// Branch derivation only ever uses the public half; the private half is kept
/// for callers that sign elsewhere and is dropped entirely for watch-only
/// accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountKey {
    Private(ExtendedPrivateKey),
    Public(ExtendedPublicKey),
}

impl AccountKey {
    pub fn is_watch_only(&self) -> bool {
        matches!(self, AccountKey::Public(_))
    }

    /// Drop any private material.
    pub fn into_watch_only(self) -> AccountKey {
        match self {
            AccountKey::Private(xprv) => AccountKey::Public(xprv.extended_public_key()),
            public => public,
        }
    }

    pub fn extended_public_key(&self) -> ExtendedPublicKey {
        match self {
            AccountKey::Private(xprv) => xprv.extended_public_key(),
            AccountKey::Public(xpub) => xpub.clone(),
        }
    }

    /// Extended public key at `path` below this account key.
    pub fn derive_public(&self, path: &DerivationPath) -> Result<ExtendedPublicKey> {
        match self {
            AccountKey::Private(xprv) => Ok(xprv.derive_path(path)?.extended_public_key()),
            AccountKey::Public(xpub) => xpub.derive_path(path),
        }
    }
}

impl FromStr for AccountKey {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        match ExtendedPrivateKey::from_str(s) {
            Ok(xprv) => Ok(AccountKey::Private(xprv)),
            Err(_) => ExtendedPublicKey::from_str(s).map(AccountKey::Public),
        }
    }
}
