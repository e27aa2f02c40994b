//! Interchange types shared by the two parties of a fee delegation.

use crate::chain::ChainAddress;
use crate::config::delegation::REPORTED_FEE_CEILING;
use crate::error::{EngineError, EngineResult};
use crate::tx::codec;
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flat compensation agreed before a delegation starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationTerms {
    /// Asset the originator pays in and the claim is denominated in
    pub asset: String,
    /// Asset amount the completer collects
    pub claim_amount: u64,
    /// Completer address receiving the claim and the native change
    pub completer: ChainAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeTerms>,
}

impl DelegationTerms {
    pub fn new(asset: impl Into<String>, claim_amount: u64, completer: ChainAddress) -> Self {
        Self {
            asset: asset.into(),
            claim_amount,
            completer,
            bridge: None,
        }
    }

    pub fn with_bridge(mut self, bridge: BridgeTerms) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Asset the originator owes beyond its payments
    pub fn asset_overhead(&self) -> EngineResult<u64> {
        let bridge_fee = self.bridge.as_ref().map_or(0, |b| b.fee);
        self.claim_amount
            .checked_add(bridge_fee)
            .ok_or_else(|| EngineError::payment("claim plus bridge fee overflows"))
    }
}

/// Bridge variant: an operator claim ahead of the completer's outputs and a
/// foreign-chain address carried in the memo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeTerms {
    pub operator: ChainAddress,
    pub fee: u64,
    pub foreign_address: String,
}

/// Native amounts the completer commits to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    /// Value of the completer's pre-reserved native output
    pub fee_sats_reserved: u64,
    /// Portion of the reserve actually paid as network fee
    pub reported_fee_sats: u64,
}

impl FeeQuote {
    pub fn new(fee_sats_reserved: u64, reported_fee_sats: u64) -> Self {
        Self {
            fee_sats_reserved,
            reported_fee_sats,
        }
    }

    /// Reported fee must be under one coin and strictly under the reserve
    pub fn validate(&self) -> EngineResult<()> {
        if self.reported_fee_sats >= REPORTED_FEE_CEILING {
            return Err(EngineError::fee_mismatch(format!(
                "reported fee {} is not below the ceiling of {}",
                self.reported_fee_sats, REPORTED_FEE_CEILING
            )));
        }
        if self.reported_fee_sats >= self.fee_sats_reserved {
            return Err(EngineError::fee_mismatch(format!(
                "reported fee {} is not below the reserved {}",
                self.reported_fee_sats, self.fee_sats_reserved
            )));
        }
        Ok(())
    }

    /// Native value returned to the completer
    pub fn completer_change(&self) -> EngineResult<u64> {
        self.fee_sats_reserved
            .checked_sub(self.reported_fee_sats)
            .ok_or_else(|| {
                EngineError::fee_mismatch(format!(
                    "reported fee {} exceeds the reserved {}",
                    self.reported_fee_sats, self.fee_sats_reserved
                ))
            })
    }
}

/// What the originator hands to the completer.
///
/// Parsing is strict: unknown fields, missing fields, negative amounts or a
/// transaction that does not decode reject the whole envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeeDelegationEnvelope {
    pub partial_tx_hex: String,
    pub fee_sats_reserved: u64,
    pub reported_fee_sats: u64,
}

impl FeeDelegationEnvelope {
    pub fn new(partial_tx: &Transaction, quote: FeeQuote) -> EngineResult<Self> {
        Ok(Self {
            partial_tx_hex: codec::encode_hex(partial_tx)?,
            fee_sats_reserved: quote.fee_sats_reserved,
            reported_fee_sats: quote.reported_fee_sats,
        })
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        let envelope: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::malformed(e.to_string()))?;
        envelope.partial_tx()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn quote(&self) -> FeeQuote {
        FeeQuote::new(self.fee_sats_reserved, self.reported_fee_sats)
    }

    pub fn partial_tx(&self) -> EngineResult<Transaction> {
        codec::decode_hex(&self.partial_tx_hex)
            .map_err(|e| EngineError::malformed(format!("partialTxHex: {}", e)))
    }
}

/// Where a delegation stands from the completer's side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationState {
    /// Envelope issued, not yet completed
    Originated,
    /// Completer input appended, signed and broadcast
    Completed { txid: Txid },
    /// Envelope discarded without broadcast
    Aborted { reason: String },
}

impl DelegationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DelegationState::Originated)
    }

    /// Terminal states never move again
    pub fn complete(self, txid: Txid) -> Self {
        match self {
            DelegationState::Originated => DelegationState::Completed { txid },
            terminal => terminal,
        }
    }

    pub fn abort(self, reason: impl Into<String>) -> Self {
        match self {
            DelegationState::Originated => DelegationState::Aborted {
                reason: reason.into(),
            },
            terminal => terminal,
        }
    }
}

impl fmt::Display for DelegationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationState::Originated => write!(f, "originated"),
            DelegationState::Completed { txid } => write!(f, "completed ({})", txid),
            DelegationState::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}
