//! Account addresses for both ledger contexts.
//!
//! Primary-ledger addresses are base58check pay-to-pubkey-hash strings; the
//! secondary ledger encodes the same kind of key hash as bech32 under its own
//! human-readable part. Both are keyed by network, so a network switch changes
//! every address string even though the derived keys stay the same.

use crate::types::LedgerContext;
use crate::{HdError, Result};
use base58check::{FromBase58Check, ToBase58Check};
use bech32::{FromBase32, ToBase32, Variant};
use ripemd::Ripemd160;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const MAINNET_PRIVATE_VERSION: [u8; 4] = [0x04, 0x88, 0xAD, 0xE4]; // xprv
const MAINNET_PUBLIC_VERSION: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E]; // xpub
const TESTNET_PRIVATE_VERSION: [u8; 4] = [0x04, 0x35, 0x83, 0x94]; // tprv
const TESTNET_PUBLIC_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xCF]; // tpub

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Version byte of primary-ledger addresses
    pub fn pubkey_hash_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6f,
        }
    }

    /// Human-readable part of secondary-ledger addresses
    pub fn secondary_hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "stk",
            Network::Testnet => "tstk",
            Network::Regtest => "rstk",
        }
    }

    pub fn xpub_version(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => MAINNET_PUBLIC_VERSION,
            Network::Testnet | Network::Regtest => TESTNET_PUBLIC_VERSION,
        }
    }

    pub fn xprv_version(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => MAINNET_PRIVATE_VERSION,
            Network::Testnet | Network::Regtest => TESTNET_PRIVATE_VERSION,
        }
    }

    pub fn from_xpub_version(version: [u8; 4]) -> Option<Network> {
        match version {
            MAINNET_PUBLIC_VERSION => Some(Network::Mainnet),
            TESTNET_PUBLIC_VERSION => Some(Network::Testnet),
            _ => None,
        }
    }

    pub fn from_xprv_version(version: [u8; 4]) -> Option<Network> {
        match version {
            MAINNET_PRIVATE_VERSION => Some(Network::Mainnet),
            TESTNET_PRIVATE_VERSION => Some(Network::Testnet),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" | "localtest" => Ok(Network::Regtest),
            other => Err(HdError::InvalidInput(format!("Unknown network: {}", other))),
        }
    }
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub network: Network,
    pub context: LedgerContext,
    pub hash: [u8; 20],
}

impl Address {
    pub fn from_public_key(public_key: &PublicKey, network: Network, context: LedgerContext) -> Self {
        Address {
            network,
            context,
            hash: hash160(&public_key.serialize()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        match self.context {
            LedgerContext::Primary => Ok(self.hash.to_base58check(self.network.pubkey_hash_version())),
            LedgerContext::Secondary => {
                bech32::encode(self.network.secondary_hrp(), self.hash.to_base32(), Variant::Bech32)
                    .map_err(|e| HdError::InvalidInput(format!("bech32 encoding failed: {}", e)))
            }
        }
    }

    /// Parse `s` as an address of `context` on `network`.
    pub fn parse(s: &str, network: Network, context: LedgerContext) -> Result<Self> {
        let payload = match context {
            LedgerContext::Primary => {
                let (version, payload) = s
                    .from_base58check()
                    .map_err(|e| HdError::InvalidInput(format!("Invalid address '{}': {:?}", s, e)))?;
                if version != network.pubkey_hash_version() {
                    return Err(HdError::InvalidInput(format!(
                        "Address '{}' is not a {} address",
                        s, network
                    )));
                }
                payload
            }
            LedgerContext::Secondary => {
                let (hrp, data, variant) = bech32::decode(s)
                    .map_err(|e| HdError::InvalidInput(format!("Invalid address '{}': {}", s, e)))?;
                if hrp != network.secondary_hrp() || variant != Variant::Bech32 {
                    return Err(HdError::InvalidInput(format!(
                        "Address '{}' is not a {} secondary-ledger address",
                        s, network
                    )));
                }
                Vec::<u8>::from_base32(&data)
                    .map_err(|e| HdError::InvalidInput(format!("Invalid address '{}': {}", s, e)))?
            }
        };

        let hash: [u8; 20] = payload.as_slice().try_into().map_err(|_| {
            HdError::InvalidInput(format!("Address '{}' has a {}-byte payload", s, payload.len()))
        })?;

        Ok(Address { network, context, hash })
    }
}
