use super::envelope::{DelegationState, DelegationTerms, FeeDelegationEnvelope, FeeQuote};
use crate::chain::{ChainAddress, ChainNetwork, KeyPair};
use crate::error::{EngineError, EngineResult};
use crate::outputs::{classify_output, parse_asset_transfer, OutputCompiler, OutputKind, Payment};
use crate::services::{Broadcaster, UnspentSource};
use crate::tx::codec::signed_with;
use crate::tx::{verify_spend, TransactionAssembler, TransactionSigner};
use crate::utxo::{Committed, Denomination, FeeModel, UnspentOutput, UtxoSelector};
use crate::wallet::PaymentRequest;
use bitcoin::{sighash::EcdsaSighashType, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// The value holder: pays in assets only and leaves the fee to the completer
#[derive(Debug, Clone)]
pub struct Originator {
    network: ChainNetwork,
    selector: UtxoSelector,
    compiler: OutputCompiler,
    signer: TransactionSigner,
}

impl Originator {
    pub fn new(network: ChainNetwork) -> Self {
        Self {
            network,
            selector: UtxoSelector::new(FeeModel::default()),
            compiler: OutputCompiler::new(),
            signer: TransactionSigner::anyone_can_pay(),
        }
    }

    /// Build and sign the partial transaction.
    ///
    /// Outputs, in order: payments, asset change, memo, bridge claim, completer
    /// claim, completer native change.
    pub fn originate(
        &self,
        request: &PaymentRequest,
        terms: &DelegationTerms,
        quote: FeeQuote,
        unspent: &[UnspentOutput],
        keys: &[KeyPair],
    ) -> EngineResult<FeeDelegationEnvelope> {
        quote.validate()?;
        for address in [&request.change_address, &terms.completer] {
            self.require_network(address)?;
        }
        if let Some(native) = request.payments.iter().find(|p| p.denomination.is_native()) {
            return Err(EngineError::payment(format!(
                "delegated payment to {} must be in an asset",
                native.to
            )));
        }
        let memo = match (&terms.bridge, &request.memo) {
            (Some(_), Some(_)) => {
                return Err(EngineError::payment(
                    "bridge delegations carry the foreign address as their memo",
                ))
            }
            (Some(bridge), None) => Some(bridge.foreign_address.as_bytes().to_vec()),
            (None, memo) => memo.clone(),
        };

        let compiled = self.compiler.compile(&request.payments)?;
        let mut required: BTreeMap<String, u64> = compiled
            .assets()
            .map(|(asset, amount)| (asset.to_string(), amount))
            .collect();
        let owed = required.entry(terms.asset.clone()).or_insert(0);
        *owed = owed
            .checked_add(terms.asset_overhead()?)
            .ok_or_else(|| EngineError::payment("asset total overflows"))?;

        let mut outputs = compiled.outputs;
        let mut assembler = TransactionAssembler::new();
        let mut snapshot = unspent.to_vec();
        for (asset, amount) in &required {
            let denomination = Denomination::Asset(asset.clone());
            let selection =
                self.selector
                    .select(&snapshot, &denomination, *amount, Committed::default())?;
            if let Some(change) = self.compiler.change_output(
                &denomination,
                selection.total,
                *amount,
                0,
                &request.change_address,
            )? {
                outputs.push(change);
            }
            for input in selection.selected {
                assembler.add_input(input)?;
            }
            snapshot = selection.remainder;
        }

        if let Some(memo) = memo {
            outputs.push(self.compiler.memo_output(&memo)?);
        }
        if let Some(bridge) = &terms.bridge {
            self.require_network(&bridge.operator)?;
            outputs.push(self.compiler.output_for(&Payment::asset(
                bridge.operator.clone(),
                terms.asset.clone(),
                bridge.fee,
            ))?);
        }
        outputs.push(self.compiler.output_for(&Payment::asset(
            terms.completer.clone(),
            terms.asset.clone(),
            terms.claim_amount,
        ))?);
        outputs.push(
            self.compiler
                .output_for(&Payment::native(terms.completer.clone(), quote.completer_change()?))?,
        );
        assembler.add_outputs(outputs);

        let partial = self.signer.sign(&assembler.build_partial(), keys)?;
        info!(
            "originated delegation: {} input(s), {} output(s), {} reserved by {}",
            partial.input.len(),
            partial.output.len(),
            quote.fee_sats_reserved,
            terms.completer
        );
        FeeDelegationEnvelope::new(&partial, quote)
    }

    fn require_network(&self, address: &ChainAddress) -> EngineResult<()> {
        if address.network() != self.network {
            return Err(EngineError::InvalidAddress {
                address: address.to_string(),
            });
        }
        Ok(())
    }
}

/// The fee payer: appends its reserved native output and collects the claim
#[derive(Debug, Clone)]
pub struct Completer {
    key: KeyPair,
    terms: DelegationTerms,
    selector: UtxoSelector,
    signer: TransactionSigner,
}

impl Completer {
    /// `terms.completer` must be the address of `key` on `network`
    pub fn new(key: KeyPair, network: ChainNetwork, terms: DelegationTerms) -> EngineResult<Self> {
        if key.address(network) != terms.completer {
            return Err(EngineError::InvalidAddress {
                address: terms.completer.to_string(),
            });
        }
        Ok(Self {
            key,
            terms,
            selector: UtxoSelector::new(FeeModel::default()),
            signer: TransactionSigner::anyone_can_pay(),
        })
    }

    pub fn terms(&self) -> &DelegationTerms {
        &self.terms
    }

    /// Check the envelope and return its partial transaction.
    ///
    /// Claim and change outputs are located by position from the end of the
    /// output list. Only the final change output may carry native value.
    pub fn verify(&self, envelope: &FeeDelegationEnvelope) -> EngineResult<Transaction> {
        let tx = envelope.partial_tx()?;
        let quote = envelope.quote();
        let completer_script = self.terms.completer.script_pubkey();
        let tail = if self.terms.bridge.is_some() { 3 } else { 2 };
        if tx.input.is_empty() || tx.output.len() < tail {
            return Err(EngineError::unverified(format!(
                "expected at least one input and {} outputs, found {} and {}",
                tail,
                tx.input.len(),
                tx.output.len()
            )));
        }
        let n = tx.output.len();

        let claim = &tx.output[n - 2];
        check_claim(claim, &self.terms.asset, self.terms.claim_amount, &completer_script)
            .map_err(|e| EngineError::fee_mismatch(format!("completer claim {}", e)))?;
        if let Some(bridge) = &self.terms.bridge {
            check_claim(
                &tx.output[n - 3],
                &self.terms.asset,
                bridge.fee,
                &bridge.operator.script_pubkey(),
            )
            .map_err(|e| EngineError::fee_mismatch(format!("bridge claim {}", e)))?;
        }

        let change = &tx.output[n - 1];
        let expected = quote.completer_change()?;
        if !matches!(classify_output(change), OutputKind::Native)
            || change.script_pubkey != completer_script
        {
            return Err(EngineError::fee_mismatch(
                "final output is not native change to the completer",
            ));
        }
        if change.value.to_sat() != expected {
            return Err(EngineError::fee_mismatch(format!(
                "completer change is {} but reserved {} minus reported {} is {}",
                change.value.to_sat(),
                quote.fee_sats_reserved,
                quote.reported_fee_sats,
                expected
            )));
        }

        // Anything native ahead of the change would come out of the network fee
        let diverted = tx.output[..n - 1]
            .iter()
            .fold(0u64, |sum, output| sum.saturating_add(output.value.to_sat()));
        if diverted != 0 {
            return Err(EngineError::fee_mismatch(format!(
                "{} native units are paid out ahead of the completer change",
                diverted
            )));
        }

        quote.validate()?;

        if let Some((index, _)) = tx
            .input
            .iter()
            .enumerate()
            .find(|(_, input)| !signed_with(&input.script_sig, EcdsaSighashType::AllPlusAnyoneCanPay))
        {
            return Err(EngineError::unverified(format!(
                "input {} is not signed ANYONECANPAY|ALL",
                index
            )));
        }
        debug!("envelope checks passed for {}", tx.compute_txid());
        Ok(tx)
    }

    /// Verify, append the reserved output as a new input and sign only that input
    pub fn complete(
        &self,
        envelope: &FeeDelegationEnvelope,
        unspent: &[UnspentOutput],
    ) -> EngineResult<Transaction> {
        let mut tx = self.verify(envelope)?;
        let reserved = self.selector.find_exact(unspent, envelope.fee_sats_reserved)?;
        if tx.input.iter().any(|i| i.previous_output == reserved.outpoint()) {
            return Err(EngineError::unverified(format!(
                "{} is already spent by the partial transaction",
                reserved.outpoint()
            )));
        }
        let script_pubkey = reserved
            .locking_script
            .clone()
            .unwrap_or_else(|| self.terms.completer.script_pubkey());

        let index = tx.input.len();
        tx.input.push(TxIn {
            previous_output: reserved.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        });
        self.signer
            .sign_pubkey_hash(&mut tx, index, &script_pubkey, &self.key)?;
        verify_spend(&tx, index, &script_pubkey, None)?;

        info!(
            "completed delegation {} with {} (fee {})",
            tx.compute_txid(),
            reserved.outpoint(),
            envelope.reported_fee_sats
        );
        Ok(tx)
    }

    /// Run the completer phase end to end on an untrusted envelope.
    ///
    /// Rejected envelopes come back as [`DelegationState::Aborted`]; lookup and
    /// broadcast failures are returned as errors.
    pub fn run(
        &self,
        envelope_json: &str,
        source: &dyn UnspentSource,
        broadcaster: &dyn Broadcaster,
    ) -> EngineResult<DelegationState> {
        let state = DelegationState::Originated;
        let completed = FeeDelegationEnvelope::from_json(envelope_json).and_then(|envelope| {
            let unspent = source.list_unspent(&self.terms.completer, None)?;
            self.complete(&envelope, &unspent)
        });
        let tx = match completed {
            Ok(tx) => tx,
            Err(e) if e.is_delegation_rejection() => {
                warn!("discarding fee-delegation envelope: {}", e);
                return Ok(state.abort(e.to_string()));
            }
            Err(e) => return Err(e),
        };
        let txid = broadcaster.broadcast(&tx)?;
        info!("broadcast delegated transaction {}", txid);
        Ok(state.complete(txid))
    }
}

fn check_claim(
    output: &TxOut,
    asset: &str,
    amount: u64,
    owner: &ScriptBuf,
) -> Result<(), String> {
    let transfer =
        parse_asset_transfer(&output.script_pubkey).ok_or("is not an asset transfer")?;
    if transfer.asset != asset {
        return Err(format!("pays {} instead of {}", transfer.asset, asset));
    }
    if transfer.amount != amount {
        return Err(format!("is {} instead of {}", transfer.amount, amount));
    }
    if transfer.owner_script != *owner {
        return Err("is addressed elsewhere".to_string());
    }
    Ok(())
}
