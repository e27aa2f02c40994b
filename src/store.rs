//! # Redeem Script Store
//!
//! A P2SH output can only be spent by someone holding its redeem script, so
//! every compiled template is written to a JSON file keyed by the UTC time it
//! becomes spendable:
//!
//! ```json
//! {
//!   "2026-03-01T00:00:00Z": {
//!     "redeemScriptHex": "52210279be...52ae",
//!     "redeemScriptSize": 71,
//!     "p2shAddress": "r...",
//!     "fundingTxid": "ab..",
//!     "fundingVout": 0,
//!     "originalParams": { "template": "basicMultisig", ... }
//!   }
//! }
//! ```
//!
//! Loading re-checks every record: the key must be a UTC time with a `Z`
//! suffix, the stored size must match the decoded script, and recompiling
//! `originalParams` must reproduce it.

use crate::chain::{ChainAddress, ChainNetwork};
use crate::error::{EngineError, EngineResult};
use crate::script::ScriptTemplate;
use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One persisted template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemScriptRecord {
    pub redeem_script_hex: String,
    pub redeem_script_size: usize,
    pub p2sh_address: ChainAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_txid: Option<Txid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_vout: Option<u32>,
    pub original_params: ScriptTemplate,
}

impl RedeemScriptRecord {
    pub fn new(template: &ScriptTemplate, network: ChainNetwork) -> EngineResult<Self> {
        let script = template.compile()?;
        Ok(Self {
            redeem_script_hex: hex::encode(script.as_bytes()),
            redeem_script_size: script.len(),
            p2sh_address: ChainAddress::p2sh(&script, network),
            funding_txid: None,
            funding_vout: None,
            original_params: template.clone(),
        })
    }

    pub fn funding(&self) -> Option<OutPoint> {
        Some(OutPoint::new(self.funding_txid?, self.funding_vout?))
    }

    /// Size, address and template must all agree with the stored script
    pub fn check(&self) -> EngineResult<()> {
        let bytes = hex::decode(&self.redeem_script_hex)
            .map_err(|e| EngineError::encoding(format!("redeemScriptHex: {}", e)))?;
        if bytes.len() != self.redeem_script_size {
            return Err(EngineError::encoding(format!(
                "redeemScriptSize is {} but the script is {} bytes",
                self.redeem_script_size,
                bytes.len()
            )));
        }
        let compiled = self.original_params.compile()?;
        if compiled.as_bytes() != bytes.as_slice() {
            return Err(EngineError::encoding(
                "originalParams compile to a different script",
            ));
        }
        let address = ChainAddress::p2sh(&compiled, self.p2sh_address.network());
        if address != self.p2sh_address {
            return Err(EngineError::encoding(format!(
                "p2shAddress {} does not match the script ({})",
                self.p2sh_address, address
            )));
        }
        Ok(())
    }
}

/// Redeem scripts on disk, keyed by eligibility time
#[derive(Debug, Clone)]
pub struct RedeemScriptStore {
    path: PathBuf,
    records: BTreeMap<String, RedeemScriptRecord>,
}

impl RedeemScriptStore {
    /// Open `path`, starting empty when the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self {
                path: path.as_ref().to_path_buf(),
                records: BTreeMap::new(),
            })
        }
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let records: BTreeMap<String, RedeemScriptRecord> = serde_json::from_str(&json)?;
        for (key, record) in &records {
            parse_key(key)?;
            record
                .check()
                .map_err(|e| EngineError::encoding(format!("record {}: {}", key, e)))?;
        }
        debug!("loaded {} redeem script(s) from {}", records.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn save(&self) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(&self.records)?;
        fs::write(&self.path, json)?;
        info!(
            "saved {} redeem script(s) to {}",
            self.records.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compile and record `template` under `eligible_at`. Each time holds one script.
    pub fn insert(
        &mut self,
        eligible_at: DateTime<Utc>,
        template: &ScriptTemplate,
        network: ChainNetwork,
    ) -> EngineResult<&RedeemScriptRecord> {
        let key = format_key(eligible_at);
        if self.records.contains_key(&key) {
            return Err(EngineError::template(format!(
                "a redeem script is already stored for {}",
                key
            )));
        }
        let record = RedeemScriptRecord::new(template, network)?;
        Ok(&*self.records.entry(key).or_insert(record))
    }

    pub fn record_funding(&mut self, eligible_at: DateTime<Utc>, outpoint: OutPoint) -> EngineResult<()> {
        let key = format_key(eligible_at);
        let record = self
            .records
            .get_mut(&key)
            .ok_or_else(|| EngineError::not_found(format!("redeem script for {}", key)))?;
        record.funding_txid = Some(outpoint.txid);
        record.funding_vout = Some(outpoint.vout);
        Ok(())
    }

    pub fn get(&self, eligible_at: DateTime<Utc>) -> Option<&RedeemScriptRecord> {
        self.records.get(&format_key(eligible_at))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RedeemScriptRecord)> {
        self.records.iter().map(|(key, record)| (key.as_str(), record))
    }

    /// Records whose eligibility time is at or before `now`
    pub fn due(&self, now: DateTime<Utc>) -> EngineResult<Vec<&RedeemScriptRecord>> {
        let mut due = Vec::new();
        for (key, record) in &self.records {
            if parse_key(key)? <= now {
                due.push(record);
            }
        }
        Ok(due)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn format_key(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Keys must be written exactly as [`format_key`] writes them, or lookups miss
fn parse_key(key: &str) -> EngineResult<DateTime<Utc>> {
    let at = DateTime::parse_from_rfc3339(key)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| EngineError::encoding(format!("record key {}: {}", key, e)))?;
    let canonical = format_key(at);
    if canonical != key {
        return Err(EngineError::encoding(format!(
            "record key {} is not in UTC form (expected {})",
            key, canonical
        )));
    }
    Ok(at)
}
