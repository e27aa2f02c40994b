//! # UTXO Selection and Fee Model
//!
//! Selection works on an immutable snapshot of the caller's unspent set and
//! returns the chosen inputs together with the untouched remainder. The caller
//! decides when to refresh the snapshot from the network.
//!
//! The selector guarantees coverage, not minimality:
//! `sum(selected) >= target + fee(inputs, outputs)`. It first accumulates in
//! ascending value order; if that exhausts the set (typical when the set is
//! dominated by outputs worth less than their own input fee) it restarts over
//! the same candidates largest-first, which converges with fewer inputs.

use crate::config::fees;
use crate::error::{EngineError, EngineResult};
use bitcoin::{OutPoint, ScriptBuf, Txid};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An unspent output as reported by the network indexer.
///
/// For asset outputs `value` is the asset amount in the asset's minimal units;
/// the output itself carries no native value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout_index: u32,
    pub value: u64,
    #[serde(
        rename = "lockingScriptHex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub locking_script: Option<ScriptBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_name: Option<String>,
}

impl UnspentOutput {
    pub fn native(txid: Txid, vout_index: u32, value: u64) -> Self {
        Self {
            txid,
            vout_index,
            value,
            locking_script: None,
            asset_name: None,
        }
    }

    pub fn asset(txid: Txid, vout_index: u32, asset: impl Into<String>, amount: u64) -> Self {
        Self {
            txid,
            vout_index,
            value: amount,
            locking_script: None,
            asset_name: Some(asset.into()),
        }
    }

    pub fn with_locking_script(mut self, script: ScriptBuf) -> Self {
        self.locking_script = Some(script);
        self
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout_index)
    }

    pub fn denomination(&self) -> Denomination {
        match &self.asset_name {
            Some(name) => Denomination::Asset(name.clone()),
            None => Denomination::Native,
        }
    }

    /// Native value this output contributes to a transaction's fee balance
    pub fn native_value(&self) -> u64 {
        if self.asset_name.is_some() {
            0
        } else {
            self.value
        }
    }
}

/// The unit a selection is denominated in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Denomination {
    Native,
    Asset(String),
}

impl Denomination {
    pub fn matches(&self, unspent: &UnspentOutput) -> bool {
        match (self, &unspent.asset_name) {
            (Denomination::Native, None) => true,
            (Denomination::Asset(wanted), Some(name)) => wanted == name,
            _ => false,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Denomination::Native)
    }
}

/// Linear fee model: a fixed base plus a fixed weight per input and output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeModel {
    pub base_bytes: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub units_per_byte: u64,
}

impl Default for FeeModel {
    fn default() -> Self {
        Self {
            base_bytes: fees::BASE_BYTES,
            input_bytes: fees::INPUT_BYTES,
            output_bytes: fees::OUTPUT_BYTES,
            units_per_byte: fees::UNITS_PER_BYTE,
        }
    }
}

impl FeeModel {
    /// Estimated fee for a transaction with the given input and output counts
    pub fn fee(&self, inputs: usize, outputs: usize) -> u64 {
        let size = self
            .base_bytes
            .saturating_add((inputs as u64).saturating_mul(self.input_bytes))
            .saturating_add((outputs as u64).saturating_mul(self.output_bytes));
        size.saturating_mul(self.units_per_byte)
    }

    /// Native value below which an output costs more to spend than it is worth
    pub fn dust_threshold(&self) -> u64 {
        self.input_bytes.saturating_mul(self.units_per_byte)
    }
}

/// Inputs and outputs already committed to the transaction outside this selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Committed {
    pub inputs: usize,
    pub outputs: usize,
}

impl Committed {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self { inputs, outputs }
    }
}

/// Which ordering produced a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPass {
    Ascending,
    Descending,
}

/// Result of a selection: chosen inputs plus what is left of the snapshot
#[derive(Debug, Clone)]
pub struct Selection {
    pub selected: Vec<UnspentOutput>,
    pub remainder: Vec<UnspentOutput>,
    /// Sum of the selected values, in the selection's denomination
    pub total: u64,
    /// Fee charged against this selection (always zero for asset selections)
    pub fee: u64,
    pub pass: SelectionPass,
}

impl Selection {
    /// Surplus over `target + fee`, i.e. the change this selection produces
    pub fn change(&self, target: u64) -> u64 {
        self.total.saturating_sub(target).saturating_sub(self.fee)
    }
}

/// Chooses inputs covering a target amount
#[derive(Debug, Clone, Default)]
pub struct UtxoSelector {
    fee_model: FeeModel,
    reserve: Option<u64>,
}

impl UtxoSelector {
    pub fn new(fee_model: FeeModel) -> Self {
        Self {
            fee_model,
            reserve: None,
        }
    }

    /// Hold back one native output of exactly `amount` from every selection.
    ///
    /// A fee completer keeps such an output for future completions and only
    /// ever spends it through [`UtxoSelector::find_exact`].
    pub fn with_reserve(mut self, amount: u64) -> Self {
        self.reserve = Some(amount);
        self
    }

    pub fn fee_model(&self) -> &FeeModel {
        &self.fee_model
    }

    /// Select candidates of `denomination` covering `target` plus the fee for
    /// the final input/output counts (native only).
    pub fn select(
        &self,
        candidates: &[UnspentOutput],
        denomination: &Denomination,
        target: u64,
        committed: Committed,
    ) -> EngineResult<Selection> {
        let mut seen = HashSet::new();
        let mut reserve_skipped = false;
        let mut pool: Vec<usize> = Vec::new();
        for (idx, unspent) in candidates.iter().enumerate() {
            if !denomination.matches(unspent) || !seen.insert(unspent.outpoint()) {
                continue;
            }
            if denomination.is_native() && !reserve_skipped && self.reserve == Some(unspent.value)
            {
                reserve_skipped = true;
                continue;
            }
            pool.push(idx);
        }

        pool.sort_by_key(|&idx| candidates[idx].value);
        let attempt = self
            .accumulate(candidates, &pool, denomination, target, committed)
            .map(|picked| (picked, SelectionPass::Ascending))
            .or_else(|| {
                debug!(
                    "ascending pass exhausted {} candidates for target {}; retrying largest-first",
                    pool.len(),
                    target
                );
                pool.reverse();
                self.accumulate(candidates, &pool, denomination, target, committed)
                    .map(|picked| (picked, SelectionPass::Descending))
            });

        let ((picked, total, fee), pass) = match attempt {
            Some(found) => found,
            None => {
                let available = pool
                    .iter()
                    .fold(0u64, |sum, &idx| sum.saturating_add(candidates[idx].value));
                let required = target
                    .saturating_add(self.fee_for(denomination, committed.inputs + 1, committed));
                return Err(match denomination {
                    Denomination::Native => EngineError::InsufficientFunds {
                        required,
                        available,
                    },
                    Denomination::Asset(asset) => EngineError::InsufficientAsset {
                        asset: asset.clone(),
                        required,
                        available,
                    },
                });
            }
        };

        let picked_set: HashSet<usize> = picked.iter().copied().collect();
        let selected = picked.iter().map(|&idx| candidates[idx].clone()).collect();
        let remainder = candidates
            .iter()
            .enumerate()
            .filter(|(idx, _)| !picked_set.contains(idx))
            .map(|(_, unspent)| unspent.clone())
            .collect();

        debug!(
            "selected {} input(s) totalling {} for target {} (fee {}, {:?} pass)",
            picked.len(),
            total,
            target,
            fee,
            pass
        );

        Ok(Selection {
            selected,
            remainder,
            total,
            fee,
            pass,
        })
    }

    /// Locate the single native output worth exactly `value`
    pub fn find_exact(&self, candidates: &[UnspentOutput], value: u64) -> EngineResult<UnspentOutput> {
        candidates
            .iter()
            .find(|unspent| unspent.asset_name.is_none() && unspent.value == value)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("unspent output of exactly {}", value)))
    }

    fn accumulate(
        &self,
        candidates: &[UnspentOutput],
        order: &[usize],
        denomination: &Denomination,
        target: u64,
        committed: Committed,
    ) -> Option<(Vec<usize>, u64, u64)> {
        let mut picked = Vec::new();
        let mut total = 0u64;
        for &idx in order {
            picked.push(idx);
            total = total.checked_add(candidates[idx].value)?;
            let fee = self.fee_for(denomination, committed.inputs + picked.len(), committed);
            if total >= target.checked_add(fee)? {
                return Some((picked, total, fee));
            }
        }
        None
    }

    fn fee_for(&self, denomination: &Denomination, inputs: usize, committed: Committed) -> u64 {
        if denomination.is_native() {
            self.fee_model.fee(inputs, committed.outputs)
        } else {
            0
        }
    }
}
