//! # Services Module
//!
//! Network seams for the payment engine and the fee completer.
//!
//! ## Components
//!
//! - **[`UnspentSource`]**: lists unspent outputs for an address, natively or per asset
//! - **[`Broadcaster`]**: submits a signed transaction and returns its id
//! - **RPC Client**: node JSON-RPC implementation of both
//! - **Explorer Client**: Blockbook HTTP implementation of both
//!
//! Neither client retries. A failed call comes back as a
//! [`NetworkError`](crate::error::NetworkError) and the caller decides.

pub mod explorer_client;
pub mod rpc_client;

pub use explorer_client::ExplorerClient;
pub use rpc_client::NodeRpcClient;

use crate::chain::ChainAddress;
use crate::error::NetworkResult;
use crate::utxo::UnspentOutput;
use bitcoin::{Transaction, Txid};

/// Where the engine learns about spendable outputs
pub trait UnspentSource {
    /// Unspent outputs paying `address`. With `asset` set, only outputs
    /// carrying that asset; otherwise only native outputs.
    fn list_unspent(
        &self,
        address: &ChainAddress,
        asset: Option<&str>,
    ) -> NetworkResult<Vec<UnspentOutput>>;
}

/// Where signed transactions go
pub trait Broadcaster {
    fn broadcast(&self, tx: &Transaction) -> NetworkResult<Txid>;
}
