//! # Chain Parameters, Addresses and Keys
//!
//! The chain reuses Bitcoin's script and transaction formats but carries its
//! own base58 version bytes, so addresses are encoded here on top of the
//! `bitcoin` crate's hash and base58check primitives instead of through
//! `bitcoin::Address`.

use crate::config::chain as params;
use crate::error::{EngineError, EngineResult};
use bitcoin::{
    base58,
    hashes::{hash160, Hash},
    secp256k1::{Secp256k1, SecretKey},
    NetworkKind, PrivateKey, PubkeyHash, PublicKey, Script, ScriptBuf, ScriptHash,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Which deployment of the chain addresses belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainNetwork {
    Mainnet,
    Testnet,
}

impl ChainNetwork {
    pub fn p2pkh_version(self) -> u8 {
        match self {
            ChainNetwork::Mainnet => params::MAINNET_P2PKH_VERSION,
            ChainNetwork::Testnet => params::TESTNET_P2PKH_VERSION,
        }
    }

    pub fn p2sh_version(self) -> u8 {
        match self {
            ChainNetwork::Mainnet => params::MAINNET_P2SH_VERSION,
            ChainNetwork::Testnet => params::TESTNET_P2SH_VERSION,
        }
    }

    fn key_kind(self) -> NetworkKind {
        match self {
            ChainNetwork::Mainnet => NetworkKind::Main,
            ChainNetwork::Testnet => NetworkKind::Test,
        }
    }
}

impl FromStr for ChainNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(ChainNetwork::Mainnet),
            "testnet" | "test" => Ok(ChainNetwork::Testnet),
            _ => Err(format!("Invalid network: {}", s)),
        }
    }
}

impl fmt::Display for ChainNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainNetwork::Mainnet => write!(f, "mainnet"),
            ChainNetwork::Testnet => write!(f, "testnet"),
        }
    }
}

/// What an address commits to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressKind {
    PubkeyHash,
    ScriptHash,
}

/// A base58check address of the chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainAddress {
    network: ChainNetwork,
    kind: AddressKind,
    hash: [u8; 20],
}

impl ChainAddress {
    /// Pay-to-pubkey-hash address for a key
    pub fn p2pkh(public_key: &PublicKey, network: ChainNetwork) -> Self {
        Self {
            network,
            kind: AddressKind::PubkeyHash,
            hash: public_key.pubkey_hash().to_byte_array(),
        }
    }

    /// Pay-to-script-hash address for a redeem script
    pub fn p2sh(redeem_script: &Script, network: ChainNetwork) -> Self {
        Self {
            network,
            kind: AddressKind::ScriptHash,
            hash: hash160::Hash::hash(redeem_script.as_bytes()).to_byte_array(),
        }
    }

    /// Recover the address a standard locking script pays to.
    ///
    /// Asset-transfer scripts start with an ordinary P2PKH/P2SH prefix, so
    /// they resolve to the owner's address as well.
    pub fn from_script(script: &Script, network: ChainNetwork) -> Option<Self> {
        let bytes = script.as_bytes();
        if bytes.len() >= 25
            && bytes[0] == 0x76
            && bytes[1] == 0xa9
            && bytes[2] == 0x14
            && bytes[23] == 0x88
            && bytes[24] == 0xac
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes[3..23]);
            return Some(Self {
                network,
                kind: AddressKind::PubkeyHash,
                hash,
            });
        }
        if bytes.len() >= 23 && bytes[0] == 0xa9 && bytes[1] == 0x14 && bytes[22] == 0x87 {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes[2..22]);
            return Some(Self {
                network,
                kind: AddressKind::ScriptHash,
                hash,
            });
        }
        None
    }

    /// Parse an address and require it to belong to `network`
    pub fn parse(address: &str, network: ChainNetwork) -> EngineResult<Self> {
        let parsed: ChainAddress = address.parse()?;
        if parsed.network != network {
            return Err(EngineError::InvalidAddress {
                address: address.to_string(),
            });
        }
        Ok(parsed)
    }

    pub fn network(&self) -> ChainNetwork {
        self.network
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// The standard locking script for this address
    pub fn script_pubkey(&self) -> ScriptBuf {
        match self.kind {
            AddressKind::PubkeyHash => {
                ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(self.hash))
            }
            AddressKind::ScriptHash => {
                ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(self.hash))
            }
        }
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match self.kind {
            AddressKind::PubkeyHash => self.network.p2pkh_version(),
            AddressKind::ScriptHash => self.network.p2sh_version(),
        };
        let mut payload = Vec::with_capacity(21);
        payload.push(version);
        payload.extend_from_slice(&self.hash);
        write!(f, "{}", base58::encode_check(&payload))
    }
}

impl FromStr for ChainAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidAddress {
            address: s.to_string(),
        };
        let payload = base58::decode_check(s).map_err(|_| invalid())?;
        if payload.len() != 21 {
            return Err(invalid());
        }
        let (network, kind) = match payload[0] {
            params::MAINNET_P2PKH_VERSION => (ChainNetwork::Mainnet, AddressKind::PubkeyHash),
            params::MAINNET_P2SH_VERSION => (ChainNetwork::Mainnet, AddressKind::ScriptHash),
            params::TESTNET_P2PKH_VERSION => (ChainNetwork::Testnet, AddressKind::PubkeyHash),
            params::TESTNET_P2SH_VERSION => (ChainNetwork::Testnet, AddressKind::ScriptHash),
            _ => return Err(invalid()),
        };
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Self {
            network,
            kind,
            hash,
        })
    }
}

impl Serialize for ChainAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A signing key and its compressed public key.
///
/// Persistent key storage is outside this crate; callers hand the engine the
/// active key pair(s) they want to sign with.
#[derive(Clone)]
pub struct KeyPair {
    secret: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Import a compressed-key WIF
    pub fn from_wif(wif: &str) -> EngineResult<Self> {
        let secret =
            PrivateKey::from_wif(wif).map_err(|e| EngineError::key(format!("bad WIF: {}", e)))?;
        if !secret.compressed {
            return Err(EngineError::key("uncompressed keys are not supported"));
        }
        Ok(Self::from_private_key(secret))
    }

    /// Build a key pair from raw secret bytes
    pub fn from_secret_bytes(bytes: &[u8; 32], network: ChainNetwork) -> EngineResult<Self> {
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| EngineError::key(format!("bad secret key: {}", e)))?;
        Ok(Self::from_private_key(PrivateKey::new(
            secret_key,
            network.key_kind(),
        )))
    }

    fn from_private_key(secret: PrivateKey) -> Self {
        let public = secret.public_key(&Secp256k1::new());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret.inner
    }

    pub fn to_wif(&self) -> String {
        self.secret.to_wif()
    }

    /// The key's pay-to-pubkey-hash address
    pub fn address(&self, network: ChainNetwork) -> ChainAddress {
        ChainAddress::p2pkh(&self.public, network)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Reject anything that is not a 33-byte compressed key
pub fn require_compressed(key: &PublicKey) -> EngineResult<()> {
    if !key.compressed || key.to_bytes().len() != params::PUBLIC_KEY_SIZE {
        return Err(EngineError::key(format!(
            "expected a {}-byte compressed key, got {} bytes",
            params::PUBLIC_KEY_SIZE,
            key.to_bytes().len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> KeyPair {
        KeyPair::from_secret_bytes(&[byte; 32], ChainNetwork::Mainnet).unwrap()
    }

    #[test]
    fn test_mainnet_address_prefixes() {
        let key = test_key(1);
        let address = key.address(ChainNetwork::Mainnet);
        assert!(address.to_string().starts_with('R'));

        let redeem = ScriptBuf::from(vec![0x51]);
        let p2sh = ChainAddress::p2sh(&redeem, ChainNetwork::Mainnet);
        assert!(p2sh.to_string().starts_with('r'));
    }

    #[test]
    fn test_address_round_trip_and_network_check() {
        let key = test_key(2);
        let address = key.address(ChainNetwork::Testnet);
        let text = address.to_string();

        let parsed = ChainAddress::parse(&text, ChainNetwork::Testnet).unwrap();
        assert_eq!(parsed, address);
        assert!(ChainAddress::parse(&text, ChainNetwork::Mainnet).is_err());
        assert!("not-an-address".parse::<ChainAddress>().is_err());
    }

    #[test]
    fn test_address_from_script() {
        let key = test_key(3);
        let address = key.address(ChainNetwork::Mainnet);
        let recovered =
            ChainAddress::from_script(&address.script_pubkey(), ChainNetwork::Mainnet).unwrap();
        assert_eq!(recovered, address);

        let op_return = ScriptBuf::from(vec![0x6a, 0x01, 0x00]);
        assert!(ChainAddress::from_script(&op_return, ChainNetwork::Mainnet).is_none());
    }

    #[test]
    fn test_wif_round_trip() {
        let key = test_key(4);
        let imported = KeyPair::from_wif(&key.to_wif()).unwrap();
        assert_eq!(imported.public_key(), key.public_key());
        assert!(require_compressed(imported.public_key()).is_ok());
    }
}
