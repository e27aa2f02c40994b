//! # Payment Engine
//!
//! Turns a list of payments into a signed transaction over a snapshot of the
//! payer's unspent outputs:
//!
//! 1. compile the payments into outputs, in request order
//! 2. select inputs for each asset and add asset change
//! 3. append the memo, if any
//! 4. select native inputs covering native payments plus the fee, add native change
//!    unless it is dust, which goes to the fee instead
//! 5. sign every input with `SIGHASH_ALL` and verify
//!
//! [`PaymentEngine::pay`] wraps this with a fresh unspent listing and a broadcast.

use crate::chain::{ChainAddress, ChainNetwork, KeyPair};
use crate::error::{EngineError, EngineResult};
use crate::outputs::{OutputCompiler, Payment};
use crate::services::{Broadcaster, UnspentSource};
use crate::tx::{TransactionAssembler, TransactionSigner};
use crate::utxo::{Committed, Denomination, FeeModel, UnspentOutput, UtxoSelector};
use bitcoin::{Transaction, Txid};
use log::{debug, info};
use std::collections::BTreeSet;

/// What to pay, where change goes, and an optional memo
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payments: Vec<Payment>,
    pub memo: Option<Vec<u8>>,
    pub change_address: ChainAddress,
}

impl PaymentRequest {
    pub fn new(payments: Vec<Payment>, change_address: ChainAddress) -> Self {
        Self {
            payments,
            memo: None,
            change_address,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<Vec<u8>>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    fn assets(&self) -> BTreeSet<&str> {
        self.payments
            .iter()
            .filter_map(|p| match &p.denomination {
                Denomination::Asset(name) => Some(name.as_str()),
                Denomination::Native => None,
            })
            .collect()
    }
}

/// A signed payment and the part of the snapshot it left unspent
#[derive(Debug, Clone)]
pub struct BuiltPayment {
    pub tx: Transaction,
    pub fee: u64,
    pub remainder: Vec<UnspentOutput>,
}

#[derive(Debug, Clone)]
pub struct PaymentEngine {
    network: ChainNetwork,
    selector: UtxoSelector,
    compiler: OutputCompiler,
    signer: TransactionSigner,
}

impl PaymentEngine {
    pub fn new(network: ChainNetwork, fee_model: FeeModel) -> Self {
        Self::with_selector(network, UtxoSelector::new(fee_model))
    }

    /// Use a preconfigured selector, e.g. one holding back a reserved output
    pub fn with_selector(network: ChainNetwork, selector: UtxoSelector) -> Self {
        Self {
            network,
            selector,
            compiler: OutputCompiler::new(),
            signer: TransactionSigner::new(),
        }
    }

    pub fn network(&self) -> ChainNetwork {
        self.network
    }

    pub fn build_payment(
        &self,
        request: &PaymentRequest,
        unspent: &[UnspentOutput],
        keys: &[KeyPair],
    ) -> EngineResult<BuiltPayment> {
        if request.change_address.network() != self.network {
            return Err(EngineError::InvalidAddress {
                address: request.change_address.to_string(),
            });
        }
        let compiled = self.compiler.compile(&request.payments)?;
        let mut outputs = compiled.outputs.clone();
        let mut inputs = Vec::new();
        let mut snapshot = unspent.to_vec();

        for (asset, amount) in compiled.assets() {
            let denomination = Denomination::Asset(asset.to_string());
            let selection =
                self.selector
                    .select(&snapshot, &denomination, amount, Committed::default())?;
            if let Some(change) = self.compiler.change_output(
                &denomination,
                selection.total,
                amount,
                0,
                &request.change_address,
            )? {
                outputs.push(change);
            }
            inputs.extend(selection.selected);
            snapshot = selection.remainder;
        }

        if let Some(memo) = &request.memo {
            outputs.push(self.compiler.memo_output(memo)?);
        }

        // Native selection is charged for every input and output, its own change included
        let native_target = compiled.required(&Denomination::Native);
        let selection = self.selector.select(
            &snapshot,
            &Denomination::Native,
            native_target,
            Committed::new(inputs.len(), outputs.len() + 1),
        )?;
        let surplus = selection.change(native_target);
        if surplus >= self.selector.fee_model().dust_threshold() {
            if let Some(change) = self.compiler.change_output(
                &Denomination::Native,
                selection.total,
                native_target,
                selection.fee,
                &request.change_address,
            )? {
                outputs.push(change);
            }
        } else {
            debug!("folding {} of sub-dust change into the fee", surplus);
        }
        inputs.extend(selection.selected);
        snapshot = selection.remainder;

        let mut assembler = TransactionAssembler::new();
        for input in inputs {
            assembler.add_input(input)?;
        }
        assembler.add_outputs(outputs);
        let unsigned = assembler.build()?;
        let fee = unsigned.fee();
        let tx = self.signer.sign(&unsigned, keys)?;

        Ok(BuiltPayment {
            tx,
            fee,
            remainder: snapshot,
        })
    }

    /// List the unspent outputs of every key, build the payment and broadcast it
    pub fn pay(
        &self,
        request: &PaymentRequest,
        keys: &[KeyPair],
        source: &dyn UnspentSource,
        broadcaster: &dyn Broadcaster,
    ) -> EngineResult<Txid> {
        let assets = request.assets();
        let mut unspent = Vec::new();
        for key in keys {
            let address = key.address(self.network);
            unspent.extend(source.list_unspent(&address, None)?);
            for asset in &assets {
                unspent.extend(source.list_unspent(&address, Some(asset))?);
            }
        }

        let built = self.build_payment(request, &unspent, keys)?;
        let txid = broadcaster.broadcast(&built.tx)?;
        info!("broadcast payment {} (fee {})", txid, built.fee);
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::{classify_output, OutputKind};
    use crate::services::memory::{MemoryUnspentSource, RecordingBroadcaster};
    use crate::tx::codec::signature_flags;
    use bitcoin::{Amount, ScriptBuf};
    use std::str::FromStr;

    const NET: ChainNetwork = ChainNetwork::Mainnet;

    fn key(byte: u8) -> KeyPair {
        KeyPair::from_secret_bytes(&[byte; 32], NET).unwrap()
    }

    fn txid(n: u8) -> Txid {
        Txid::from_str(&format!("{:02x}", n).repeat(32)).unwrap()
    }

    fn owned(key: &KeyPair, unspent: UnspentOutput) -> UnspentOutput {
        unspent.with_locking_script(key.address(NET).script_pubkey())
    }

    fn engine() -> PaymentEngine {
        PaymentEngine::new(NET, FeeModel::default())
    }

    #[test]
    fn test_native_payment_with_change() {
        let payer = key(1);
        let unspent = vec![
            owned(&payer, UnspentOutput::native(txid(1), 0, 5_000_000)),
            owned(&payer, UnspentOutput::native(txid(2), 1, 20_000_000)),
        ];
        let request = PaymentRequest::new(
            vec![Payment::native(key(2).address(NET), 10_000_000)],
            payer.address(NET),
        );

        let built = engine().build_payment(&request, &unspent, &[payer.clone()]).unwrap();
        let tx = &built.tx;
        assert_eq!(tx.output[0].value, Amount::from_sat(10_000_000));
        assert_eq!(tx.output[0].script_pubkey, key(2).address(NET).script_pubkey());

        let native_in: u64 = tx
            .input
            .iter()
            .map(|i| unspent.iter().find(|u| u.outpoint() == i.previous_output).unwrap().value)
            .sum();
        let native_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(native_in - native_out, built.fee);
        assert_eq!(
            built.fee,
            FeeModel::default().fee(tx.input.len(), tx.output.len())
        );
        for input in &tx.input {
            assert_eq!(signature_flags(&input.script_sig), vec![0x01]);
        }
    }

    #[test]
    fn test_dust_change_goes_to_fee() {
        let payer = key(1);
        let with_change = FeeModel::default().fee(1, 2);
        let unspent = vec![owned(
            &payer,
            UnspentOutput::native(txid(1), 0, 500_000 + with_change + 100),
        )];
        let request = PaymentRequest::new(
            vec![Payment::native(key(2).address(NET), 500_000)],
            payer.address(NET),
        );

        let built = engine().build_payment(&request, &unspent, &[payer]).unwrap();
        assert_eq!(built.tx.output.len(), 1);
        assert_eq!(built.tx.output[0].value, Amount::from_sat(500_000));
        assert_eq!(built.fee, with_change + 100);
    }

    #[test]
    fn test_asset_payment_funds_fee_natively() {
        let payer = key(1);
        let unspent = vec![
            owned(&payer, UnspentOutput::asset(txid(1), 0, "TOKEN", 700)),
            owned(&payer, UnspentOutput::asset(txid(2), 0, "OTHER", 50)),
            owned(&payer, UnspentOutput::native(txid(3), 0, 3_000_000)),
        ];
        let request = PaymentRequest::new(
            vec![Payment::asset(key(2).address(NET), "TOKEN", 500)],
            payer.address(NET),
        )
        .with_memo(b"invoice-42".to_vec());

        let built = engine().build_payment(&request, &unspent, &[payer.clone()]).unwrap();
        let kinds: Vec<_> = built.tx.output.iter().map(classify_output).collect();
        assert!(matches!(&kinds[0], OutputKind::Asset(t) if t.asset == "TOKEN" && t.amount == 500));
        assert!(matches!(&kinds[1], OutputKind::Asset(t) if t.asset == "TOKEN" && t.amount == 200));
        assert!(matches!(&kinds[2], OutputKind::Memo(m) if m == b"invoice-42"));
        assert!(matches!(&kinds[3], OutputKind::Native));
        assert_eq!(built.tx.input.len(), 2);

        assert_eq!(built.remainder.len(), 1);
        assert_eq!(built.remainder[0].asset_name.as_deref(), Some("OTHER"));
    }

    #[test]
    fn test_insufficient_asset() {
        let payer = key(1);
        let unspent = vec![
            owned(&payer, UnspentOutput::asset(txid(1), 0, "TOKEN", 100)),
            owned(&payer, UnspentOutput::native(txid(3), 0, 3_000_000)),
        ];
        let request = PaymentRequest::new(
            vec![Payment::asset(key(2).address(NET), "TOKEN", 500)],
            payer.address(NET),
        );
        assert!(matches!(
            engine().build_payment(&request, &unspent, &[payer]),
            Err(EngineError::InsufficientAsset { required: 500, available: 100, .. })
        ));
    }

    #[test]
    fn test_reserved_output_is_not_spent() {
        let payer = key(1);
        let unspent = vec![
            owned(&payer, UnspentOutput::native(txid(1), 0, 1_000_000)),
            owned(&payer, UnspentOutput::native(txid(2), 0, 2_000_000)),
        ];
        let request = PaymentRequest::new(
            vec![Payment::native(key(2).address(NET), 1_500_000)],
            payer.address(NET),
        );
        let engine = PaymentEngine::with_selector(
            NET,
            UtxoSelector::new(FeeModel::default()).with_reserve(1_000_000),
        );

        let built = engine.build_payment(&request, &unspent, &[payer]).unwrap();
        assert_eq!(built.tx.input.len(), 1);
        assert_eq!(built.tx.input[0].previous_output, unspent[1].outpoint());
        assert_eq!(built.remainder, vec![unspent[0].clone()]);
    }

    #[test]
    fn test_missing_key_fails_signing() {
        let payer = key(1);
        let unspent = vec![owned(&payer, UnspentOutput::native(txid(1), 0, 5_000_000))];
        let request = PaymentRequest::new(
            vec![Payment::native(key(2).address(NET), 1_000_000)],
            payer.address(NET),
        );
        assert!(matches!(
            engine().build_payment(&request, &unspent, &[key(9)]),
            Err(EngineError::Signing { .. })
        ));
    }

    #[test]
    fn test_pay_lists_and_broadcasts() {
        let payer = key(1);
        let address = payer.address(NET);
        let source = MemoryUnspentSource::default()
            .with(&address, UnspentOutput::native(txid(1), 0, 4_000_000))
            .with(&address, UnspentOutput::asset(txid(2), 0, "TOKEN", 10))
            .with(&key(5).address(NET), UnspentOutput::native(txid(3), 0, 9_000_000));
        let broadcaster = RecordingBroadcaster::default();
        let request = PaymentRequest::new(
            vec![Payment::asset(key(2).address(NET), "TOKEN", 10)],
            address.clone(),
        );

        let txid = engine()
            .pay(&request, &[payer], &source, &broadcaster)
            .unwrap();
        let sent = broadcaster.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].compute_txid(), txid);
        // Exact asset amount: no asset change, one native change
        assert_eq!(sent[0].output.len(), 2);
        assert!(sent[0]
            .input
            .iter()
            .all(|i| i.previous_output.txid != self::txid(3)));
    }

    #[test]
    fn test_broadcast_rejection_surfaces_as_network_error() {
        let payer = key(1);
        let source = MemoryUnspentSource::default()
            .with(&payer.address(NET), UnspentOutput::native(txid(1), 0, 4_000_000));
        let broadcaster = RecordingBroadcaster {
            reject: true,
            ..Default::default()
        };
        let request = PaymentRequest::new(
            vec![Payment::native(key(2).address(NET), 1_000_000)],
            payer.address(NET),
        );
        let err = engine()
            .pay(&request, &[payer], &source, &broadcaster)
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_change_address_must_match_network() {
        let payer = key(1);
        let request = PaymentRequest::new(
            vec![Payment::native(key(2).address(NET), 1_000)],
            payer.address(ChainNetwork::Testnet),
        );
        let unspent = vec![UnspentOutput::native(txid(1), 0, 1).with_locking_script(ScriptBuf::new())];
        assert!(matches!(
            engine().build_payment(&request, &unspent, &[payer]),
            Err(EngineError::InvalidAddress { .. })
        ));
    }
}
