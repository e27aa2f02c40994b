//! Wire encoding for a chain without segregated witness.
//!
//! Transactions are consensus-serialized with no marker, flag or witness
//! section. Anything carrying witness data is rejected in both directions.

use crate::chain::{ChainAddress, ChainNetwork};
use crate::error::{EngineError, EngineResult};
use crate::outputs::{classify_output, OutputKind};
use bitcoin::{
    consensus::encode::{deserialize, serialize},
    script::Instruction,
    sighash::EcdsaSighashType,
    Script, Transaction,
};
use serde::Serialize;

pub fn encode(tx: &Transaction) -> EngineResult<Vec<u8>> {
    reject_witness(tx)?;
    Ok(serialize(tx))
}

pub fn encode_hex(tx: &Transaction) -> EngineResult<String> {
    Ok(hex::encode(encode(tx)?))
}

pub fn decode(bytes: &[u8]) -> EngineResult<Transaction> {
    let tx: Transaction = deserialize(bytes)
        .map_err(|e| EngineError::encoding(format!("transaction: {}", e)))?;
    reject_witness(&tx)?;
    Ok(tx)
}

pub fn decode_hex(text: &str) -> EngineResult<Transaction> {
    let bytes = hex::decode(text.trim())
        .map_err(|e| EngineError::encoding(format!("transaction hex: {}", e)))?;
    decode(&bytes)
}

fn reject_witness(tx: &Transaction) -> EngineResult<()> {
    if tx.input.iter().any(|input| !input.witness.is_empty()) {
        return Err(EngineError::encoding(
            "witness data is not valid on this chain",
        ));
    }
    Ok(())
}

/// Sighash flags of every signature pushed by an unlocking script.
///
/// A push counts as a signature when it looks like DER (`0x30` header, plausible
/// length); the flag is its final byte.
pub fn signature_flags(script_sig: &Script) -> Vec<u8> {
    script_sig
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(push)) => {
                let bytes = push.as_bytes();
                let looks_like_der =
                    (9..=73).contains(&bytes.len()) && bytes[0] == 0x30 && bytes[1] as usize == bytes.len() - 3;
                if looks_like_der {
                    bytes.last().copied()
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect()
}

/// Whether every signature in `script_sig` uses `flag` (and there is at least one)
pub fn signed_with(script_sig: &Script, flag: EcdsaSighashType) -> bool {
    let flags = signature_flags(script_sig);
    !flags.is_empty() && flags.iter().all(|f| *f as u32 == flag.to_u32())
}

/// Human-readable view of a transaction
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub txid: String,
    pub version: i32,
    pub lock_time: u32,
    pub size: usize,
    pub inputs: Vec<InputSummary>,
    pub outputs: Vec<OutputSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSummary {
    pub outpoint: String,
    pub sequence: u32,
    pub sighash_flags: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSummary {
    pub value: u64,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

pub fn summarize(tx: &Transaction, network: ChainNetwork) -> TransactionSummary {
    TransactionSummary {
        txid: tx.compute_txid().to_string(),
        version: tx.version.0,
        lock_time: tx.lock_time.to_consensus_u32(),
        size: serialize(tx).len(),
        inputs: tx
            .input
            .iter()
            .map(|input| InputSummary {
                outpoint: input.previous_output.to_string(),
                sequence: input.sequence.0,
                sighash_flags: signature_flags(&input.script_sig),
            })
            .collect(),
        outputs: tx
            .output
            .iter()
            .map(|output| {
                let address = ChainAddress::from_script(&output.script_pubkey, network)
                    .map(|a| a.to_string());
                let mut summary = OutputSummary {
                    value: output.value.to_sat(),
                    kind: "unknown",
                    address,
                    asset: None,
                    asset_amount: None,
                    memo: None,
                };
                match classify_output(output) {
                    OutputKind::Native => summary.kind = "native",
                    OutputKind::Asset(transfer) => {
                        summary.kind = "asset";
                        summary.asset = Some(transfer.asset);
                        summary.asset_amount = Some(transfer.amount);
                    }
                    OutputKind::Memo(data) => {
                        summary.kind = "memo";
                        summary.memo = Some(String::from_utf8_lossy(&data).into_owned());
                    }
                    OutputKind::Unknown => {}
                }
                summary
            })
            .collect(),
    }
}
