use super::{Broadcaster, UnspentSource};
use crate::chain::ChainAddress;
use crate::config::EngineConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::script::ChainView;
use crate::utxo::UnspentOutput;
use bitcoin::{consensus::encode::serialize_hex, OutPoint, ScriptBuf, Transaction, Txid};
use bitcoincore_rpc::{jsonrpc, Auth, Client, RpcApi};
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;

/// One entry of the address index's `getaddressutxos` reply
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressUtxo {
    txid: String,
    output_index: u32,
    script: String,
    satoshis: u64,
    #[serde(default)]
    asset_name: Option<String>,
}

/// JSON-RPC client for a node running with the address index enabled
#[derive(Debug)]
pub struct NodeRpcClient {
    client: Client,
}

impl NodeRpcClient {
    pub fn new(url: &str, user: &str, password: &str) -> NetworkResult<Self> {
        let auth = Auth::UserPass(user.to_string(), password.to_string());
        let client = Client::new(url, auth)?;
        Ok(Self { client })
    }

    pub fn from_config(config: &EngineConfig) -> NetworkResult<Self> {
        Self::new(&config.rpc_url, &config.rpc_user, &config.rpc_password)
    }

    /// Current block count
    pub fn block_count(&self) -> NetworkResult<u64> {
        Ok(self.client.get_block_count()?)
    }

    /// Heights and median times needed to judge whether `outpoints` can be
    /// spent through a timelocked branch right now
    pub fn chain_snapshot(&self, outpoints: &[OutPoint]) -> NetworkResult<ChainSnapshot> {
        let info = self.client.call::<Value>("getblockchaininfo", &[])?;
        let tip = field_u64(&info, "blocks")?;
        let median_time = field_u64(&info, "mediantime")?;

        let mut confirmations = HashMap::new();
        for outpoint in outpoints {
            let tx = self.client.call::<Value>(
                "getrawtransaction",
                &[outpoint.txid.to_string().into(), true.into()],
            )?;
            let Some(block_hash) = tx["blockhash"].as_str() else {
                debug!("{} is unconfirmed", outpoint.txid);
                continue;
            };
            let header = self
                .client
                .call::<Value>("getblockheader", &[block_hash.into(), true.into()])?;
            confirmations.insert(
                *outpoint,
                (
                    field_u64(&header, "height")? as u32,
                    field_u64(&header, "mediantime")? as u32,
                ),
            );
        }

        Ok(ChainSnapshot {
            next_height: tip as u32 + 1,
            median_time: median_time as u32,
            confirmations,
        })
    }
}

impl UnspentSource for NodeRpcClient {
    fn list_unspent(
        &self,
        address: &ChainAddress,
        asset: Option<&str>,
    ) -> NetworkResult<Vec<UnspentOutput>> {
        let mut request = json!({ "addresses": [address.to_string()] });
        if let Some(asset) = asset {
            request["assetName"] = asset.into();
        }
        let entries = self
            .client
            .call::<Vec<AddressUtxo>>("getaddressutxos", &[request])?;
        debug!("{} unspent output(s) at {}", entries.len(), address);

        entries
            .into_iter()
            .map(|entry| {
                let txid = Txid::from_str(&entry.txid).map_err(|e| NetworkError::InvalidResponse {
                    message: format!("txid {}: {}", entry.txid, e),
                })?;
                let script = ScriptBuf::from_hex(&entry.script).map_err(|e| {
                    NetworkError::InvalidResponse {
                        message: format!("script for {}:{}: {}", entry.txid, entry.output_index, e),
                    }
                })?;
                let unspent = match entry.asset_name.filter(|name| name != "RVN") {
                    Some(name) => UnspentOutput::asset(txid, entry.output_index, name, entry.satoshis),
                    None => UnspentOutput::native(txid, entry.output_index, entry.satoshis),
                };
                Ok(unspent.with_locking_script(script))
            })
            .collect()
    }
}

impl Broadcaster for NodeRpcClient {
    fn broadcast(&self, tx: &Transaction) -> NetworkResult<Txid> {
        let result = self
            .client
            .call::<String>("sendrawtransaction", &[serialize_hex(tx).into()]);
        let txid = match result {
            Ok(txid) => txid,
            Err(bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rejection))) => {
                return Err(NetworkError::Rejected {
                    message: rejection.message,
                })
            }
            Err(e) => return Err(e.into()),
        };
        Txid::from_str(&txid).map_err(|e| NetworkError::InvalidResponse {
            message: format!("txid {}: {}", txid, e),
        })
    }
}

/// Chain state captured from the node at one moment
#[derive(Debug, Clone, Default)]
pub struct ChainSnapshot {
    pub next_height: u32,
    pub median_time: u32,
    pub confirmations: HashMap<OutPoint, (u32, u32)>,
}

impl ChainView for ChainSnapshot {
    fn next_height(&self) -> u32 {
        self.next_height
    }

    fn median_time(&self) -> u32 {
        self.median_time
    }

    fn confirmation(&self, outpoint: &OutPoint) -> Option<(u32, u32)> {
        self.confirmations.get(outpoint).copied()
    }
}

fn field_u64(value: &Value, name: &str) -> NetworkResult<u64> {
    value[name].as_u64().ok_or_else(|| NetworkError::InvalidResponse {
        message: format!("missing numeric field {}", name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_utxo_shape() {
        let entry: AddressUtxo = serde_json::from_value(json!({
            "address": "RXissueAssetXXXXXXXXXXXXXXXXXhhZGt",
            "assetName": "TOKEN",
            "txid": "ab".repeat(32),
            "outputIndex": 3,
            "script": "76a914000000000000000000000000000000000000000088ac",
            "satoshis": 500_000_000u64,
            "height": 1_234
        }))
        .unwrap();
        assert_eq!(entry.output_index, 3);
        assert_eq!(entry.asset_name.as_deref(), Some("TOKEN"));
        assert!(ScriptBuf::from_hex(&entry.script).unwrap().is_p2pkh());
    }

    #[test]
    fn test_snapshot_answers_as_chain_view() {
        let outpoint = OutPoint::new(Txid::from_str(&"cd".repeat(32)).unwrap(), 0);
        let mut snapshot = ChainSnapshot {
            next_height: 101,
            median_time: 1_700_000_000,
            ..Default::default()
        };
        snapshot.confirmations.insert(outpoint, (100, 1_699_999_000));

        assert_eq!(snapshot.next_height(), 101);
        assert_eq!(snapshot.confirmation(&outpoint), Some((100, 1_699_999_000)));
        assert_eq!(snapshot.confirmation(&OutPoint::null()), None);
    }
}
