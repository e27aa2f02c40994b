use super::{Broadcaster, UnspentSource};
use crate::chain::ChainAddress;
use crate::config::network::REQUEST_TIMEOUT;
use crate::error::{NetworkError, NetworkResult};
use crate::utxo::UnspentOutput;
use bitcoin::{consensus::encode::serialize_hex, Transaction, Txid};
use log::debug;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::str::FromStr;

/// Unspent output as listed by the Blockbook `utxo` endpoint
#[derive(Debug, Deserialize)]
struct ExplorerUtxo {
    txid: String,
    vout: u32,
    /// Decimal string in minimal units
    value: String,
}

#[derive(Debug, Deserialize)]
struct SendTxReply {
    result: Option<String>,
    error: Option<SendTxError>,
}

#[derive(Debug, Deserialize)]
struct SendTxError {
    message: String,
}

/// Client for a Blockbook block explorer.
///
/// Blockbook lists native outputs only and omits their scripts; each output is
/// given the queried address's locking script.
#[derive(Debug, Clone)]
pub struct ExplorerClient {
    client: Client,
    api_base: String,
}

impl ExplorerClient {
    pub fn new(api_base: impl Into<String>) -> NetworkResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> NetworkResult<T> {
        let url = format!("{}/{}", self.api_base, path);
        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() && status.as_u16() != 400 {
            return Err(NetworkError::InvalidResponse {
                message: format!("HTTP {} from {}", status, url),
            });
        }
        Ok(response.json()?)
    }
}

impl UnspentSource for ExplorerClient {
    fn list_unspent(
        &self,
        address: &ChainAddress,
        asset: Option<&str>,
    ) -> NetworkResult<Vec<UnspentOutput>> {
        if let Some(asset) = asset {
            return Err(NetworkError::InvalidResponse {
                message: format!("explorer does not index {} outputs", asset),
            });
        }
        let entries: Vec<ExplorerUtxo> = self.get_json(&format!("utxo/{}", address))?;
        debug!("{} unspent output(s) at {}", entries.len(), address);

        entries
            .into_iter()
            .map(|entry| to_unspent(entry, address))
            .collect()
    }
}

impl Broadcaster for ExplorerClient {
    fn broadcast(&self, tx: &Transaction) -> NetworkResult<Txid> {
        let reply: SendTxReply = self.get_json(&format!("sendtx/{}", serialize_hex(tx)))?;
        match (reply.result, reply.error) {
            (_, Some(error)) => Err(NetworkError::Rejected {
                message: error.message,
            }),
            (Some(txid), None) => Txid::from_str(&txid).map_err(|e| {
                NetworkError::InvalidResponse {
                    message: format!("txid {}: {}", txid, e),
                }
            }),
            (None, None) => Err(NetworkError::InvalidResponse {
                message: "sendtx reply carries neither result nor error".to_string(),
            }),
        }
    }
}

fn to_unspent(entry: ExplorerUtxo, address: &ChainAddress) -> NetworkResult<UnspentOutput> {
    let invalid = |what: String| NetworkError::InvalidResponse { message: what };
    let txid = Txid::from_str(&entry.txid).map_err(|e| invalid(format!("txid {}: {}", entry.txid, e)))?;
    let value = entry
        .value
        .parse::<u64>()
        .map_err(|e| invalid(format!("value {}: {}", entry.value, e)))?;
    Ok(UnspentOutput::native(txid, entry.vout, value).with_locking_script(address.script_pubkey()))
}
