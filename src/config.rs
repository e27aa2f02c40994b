//! # Configuration Constants
//!
//! Compile-time defaults for the chain, the fee model and the fee-delegation
//! protocol, plus [`EngineConfig`] which lets the environment override the values
//! that legitimately vary between deployments.

use crate::chain::ChainNetwork;
use crate::utxo::FeeModel;
use std::env as std_env;

/// Chain consensus parameters
pub mod chain {
    /// Base58 version byte for pay-to-pubkey-hash addresses (mainnet, "R...")
    pub const MAINNET_P2PKH_VERSION: u8 = 60;

    /// Base58 version byte for pay-to-script-hash addresses (mainnet, "r...")
    pub const MAINNET_P2SH_VERSION: u8 = 122;

    /// Base58 version byte for pay-to-pubkey-hash addresses (testnet)
    pub const TESTNET_P2PKH_VERSION: u8 = 111;

    /// Base58 version byte for pay-to-script-hash addresses (testnet)
    pub const TESTNET_P2SH_VERSION: u8 = 196;

    /// Minimal units per whole coin
    pub const COIN: u64 = 100_000_000;

    /// Maximum size of a redeem script (the P2SH push ceiling)
    pub const MAX_REDEEM_SCRIPT_SIZE: usize = 520;

    /// Values below this are block heights, values at or above are unix timestamps
    pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

    /// Serialized length of a compressed public key
    pub const PUBLIC_KEY_SIZE: usize = 33;

    /// Opcode introducing an embedded asset payload in an output script
    pub const ASSET_MARKER_OPCODE: u8 = 0xc0;

    /// Prefix of an asset-transfer payload ("rvn" + 't')
    pub const ASSET_TRANSFER_PREFIX: [u8; 4] = [0x72, 0x76, 0x6e, 0x74];

    /// Longest asset name an asset-transfer payload may carry
    pub const MAX_ASSET_NAME_LENGTH: usize = 32;
}

/// Fee model defaults
///
/// Fees are linear in input and output counts. The weights are serialized sizes
/// of a standard pay-to-pubkey-hash input/output and the fixed transaction
/// overhead, priced at a flat rate per byte.
pub mod fees {
    /// Fixed transaction overhead in bytes (version, counts, locktime)
    pub const BASE_BYTES: u64 = 10;

    /// Serialized size of a signed pay-to-pubkey-hash input
    pub const INPUT_BYTES: u64 = 148;

    /// Serialized size of a pay-to-pubkey-hash output
    pub const OUTPUT_BYTES: u64 = 34;

    /// Fee rate in minimal units per byte (0.01 coin per kilobyte)
    pub const UNITS_PER_BYTE: u64 = 1_000;
}

/// Fee-delegation protocol constants
pub mod delegation {
    /// Flat asset amount the completer claims for paying the network fee
    pub const DEFAULT_CLAIM_AMOUNT: u64 = 100_000_000;

    /// Flat asset amount claimed by a bridge operator in the bridge variant
    pub const DEFAULT_BRIDGE_FEE: u64 = 500_000_000;

    /// Upper bound on the fee a completer may report (one full coin)
    pub const REPORTED_FEE_CEILING: u64 = super::chain::COIN;

    /// Native amount a completer typically keeps reserved for one completion
    pub const DEFAULT_FEE_RESERVED: u64 = 1_000_000;
}

/// Memo output constraints
pub mod memo {
    /// Shortest accepted memo payload
    pub const MIN_LENGTH: usize = 5;

    /// Longest accepted memo payload
    pub const MAX_LENGTH: usize = 79;
}

/// Network and RPC configuration
pub mod network {
    use std::time::Duration;

    /// Default node RPC URL
    pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8766";

    /// Default RPC username
    pub const DEFAULT_RPC_USER: &str = "user";

    /// Default RPC password
    pub const DEFAULT_RPC_PASSWORD: &str = "password";

    /// Default Blockbook explorer API base
    pub const EXPLORER_API_BASE: &str = "https://blockbook.ravencoin.org/api/v2";

    /// Request timeout for network operations
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Environment variable names
pub mod env {
    /// "mainnet" or "testnet"
    pub const NETWORK: &str = "RVN_NETWORK";

    /// RPC URL override
    pub const RPC_URL: &str = "RVN_RPC_URL";

    /// RPC username override
    pub const RPC_USER: &str = "RVN_RPC_USER";

    /// RPC password override
    pub const RPC_PASSWORD: &str = "RVN_RPC_PASSWORD";

    /// Explorer API base override
    pub const EXPLORER_URL: &str = "RVN_EXPLORER_URL";

    /// Fee rate override (minimal units per byte)
    pub const FEE_RATE: &str = "RVN_FEE_RATE";

    /// WIF of the key the binary signs with
    pub const SIGNING_WIF: &str = "RVN_SIGNING_WIF";
}

/// Runtime configuration assembled from defaults and the environment
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub network: ChainNetwork,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub explorer_url: String,
    pub fee_model: FeeModel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: ChainNetwork::Mainnet,
            rpc_url: network::DEFAULT_RPC_URL.to_string(),
            rpc_user: network::DEFAULT_RPC_USER.to_string(),
            rpc_password: network::DEFAULT_RPC_PASSWORD.to_string(),
            explorer_url: network::EXPLORER_API_BASE.to_string(),
            fee_model: FeeModel::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `.env` and the process environment, falling back
    /// to the defaults above for anything unset or unparsable.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let network = std_env::var(env::NETWORK)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.network);
        let fee_model = match std_env::var(env::FEE_RATE).ok().and_then(|v| v.parse().ok()) {
            Some(rate) => FeeModel {
                units_per_byte: rate,
                ..defaults.fee_model
            },
            None => defaults.fee_model,
        };

        Self {
            network,
            rpc_url: std_env::var(env::RPC_URL).unwrap_or(defaults.rpc_url),
            rpc_user: std_env::var(env::RPC_USER).unwrap_or(defaults.rpc_user),
            rpc_password: std_env::var(env::RPC_PASSWORD).unwrap_or(defaults.rpc_password),
            explorer_url: std_env::var(env::EXPLORER_URL).unwrap_or(defaults.explorer_url),
            fee_model,
        }
    }
}
