//! Scenario tests for the two-phase fee delegation.

use super::*;
use crate::chain::{ChainAddress, ChainNetwork, KeyPair};
use crate::config::delegation::{DEFAULT_BRIDGE_FEE, DEFAULT_CLAIM_AMOUNT};
use crate::error::EngineError;
use crate::outputs::{asset_transfer_script, classify_output, parse_asset_transfer, OutputKind, Payment};
use crate::services::memory::{MemoryUnspentSource, RecordingBroadcaster};
use crate::tx::codec::{self, signature_flags};
use crate::tx::{verify_spend, TransactionSigner};
use crate::utxo::UnspentOutput;
use crate::wallet::PaymentRequest;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid};
use std::str::FromStr;

const NET: ChainNetwork = ChainNetwork::Mainnet;
const HOLDING: u64 = 500_000_000;
const PAYMENT: u64 = 200_000_000;
const RESERVED: u64 = 1_000_000;
const REPORTED: u64 = 250_000;

fn key(byte: u8) -> KeyPair {
    KeyPair::from_secret_bytes(&[byte; 32], NET).unwrap()
}

fn txid(n: u8) -> Txid {
    Txid::from_str(&format!("{:02x}", n).repeat(32)).unwrap()
}

fn originator_key() -> KeyPair {
    key(1)
}

fn completer_key() -> KeyPair {
    key(7)
}

fn payee() -> ChainAddress {
    key(2).address(NET)
}

fn holding_script(amount: u64) -> ScriptBuf {
    asset_transfer_script(
        &originator_key().address(NET).script_pubkey(),
        "TOKEN",
        amount,
    )
    .unwrap()
}

fn holdings(amount: u64) -> Vec<UnspentOutput> {
    vec![UnspentOutput::asset(txid(1), 0, "TOKEN", amount).with_locking_script(holding_script(amount))]
}

fn terms() -> DelegationTerms {
    DelegationTerms::new("TOKEN", DEFAULT_CLAIM_AMOUNT, completer_key().address(NET))
}

fn request() -> PaymentRequest {
    PaymentRequest::new(
        vec![Payment::asset(payee(), "TOKEN", PAYMENT)],
        originator_key().address(NET),
    )
}

fn originate(quote: FeeQuote) -> FeeDelegationEnvelope {
    Originator::new(NET)
        .originate(&request(), &terms(), quote, &holdings(HOLDING), &[originator_key()])
        .unwrap()
}

fn completer() -> Completer {
    Completer::new(completer_key(), NET, terms()).unwrap()
}

fn completer_unspent() -> Vec<UnspentOutput> {
    let script = completer_key().address(NET).script_pubkey();
    vec![
        UnspentOutput::native(txid(9), 0, 3_000_000).with_locking_script(script.clone()),
        UnspentOutput::native(txid(9), 1, RESERVED).with_locking_script(script),
    ]
}

fn native_value_of(tx: &Transaction, unspent: &[UnspentOutput]) -> u64 {
    tx.input
        .iter()
        .filter_map(|i| unspent.iter().find(|u| u.outpoint() == i.previous_output))
        .map(|u| u.native_value())
        .sum()
}

#[test]
fn test_partial_transaction_layout() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let tx = envelope.partial_tx().unwrap();

    assert_eq!(tx.input.len(), 1);
    assert_eq!(signature_flags(&tx.input[0].script_sig), vec![0x81]);

    let kinds: Vec<_> = tx.output.iter().map(classify_output).collect();
    assert!(matches!(&kinds[0], OutputKind::Asset(t) if t.amount == PAYMENT));
    // Holding minus payment minus claim
    assert!(matches!(&kinds[1], OutputKind::Asset(t) if t.amount == 200_000_000));
    assert!(matches!(&kinds[2], OutputKind::Asset(t) if t.amount == DEFAULT_CLAIM_AMOUNT));
    assert!(matches!(&kinds[3], OutputKind::Native));
    assert_eq!(tx.output[3].value.to_sat(), 750_000);
}

#[test]
fn test_completion_returns_reserve_minus_reported_fee() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let unspent = completer_unspent();
    let tx = completer().complete(&envelope, &unspent).unwrap();

    assert_eq!(tx.input.len(), 2);
    assert_eq!(tx.input[1].previous_output, unspent[1].outpoint());
    assert_eq!(tx.output.last().unwrap().value.to_sat(), 750_000);

    let native_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
    assert_eq!(native_value_of(&tx, &unspent) - native_out, REPORTED);

    for input in &tx.input {
        assert_eq!(signature_flags(&input.script_sig), vec![0x81]);
    }
    // The originator's signature survives the appended input
    verify_spend(&tx, 0, &holding_script(HOLDING), None).unwrap();
    verify_spend(&tx, 1, &unspent[1].locking_script.clone().unwrap(), None).unwrap();
}

#[test]
fn test_reported_fee_equal_to_reserve_is_rejected() {
    let err = Originator::new(NET)
        .originate(
            &request(),
            &terms(),
            FeeQuote::new(RESERVED, RESERVED),
            &holdings(HOLDING),
            &[originator_key()],
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::FeeMismatch { .. }));

    let mut envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    envelope.reported_fee_sats = RESERVED;
    assert!(matches!(
        completer().complete(&envelope, &completer_unspent()),
        Err(EngineError::FeeMismatch { .. })
    ));
}

#[test]
fn test_reported_fee_above_ceiling_is_rejected() {
    let quote = FeeQuote::new(300_000_000, 150_000_000);
    assert!(matches!(quote.validate(), Err(EngineError::FeeMismatch { .. })));
    assert!(FeeQuote::new(RESERVED, REPORTED).validate().is_ok());
}

#[test]
fn test_claim_amount_must_match_terms() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let greedy = DelegationTerms::new("TOKEN", 2 * DEFAULT_CLAIM_AMOUNT, completer_key().address(NET));
    let completer = Completer::new(completer_key(), NET, greedy).unwrap();
    assert!(matches!(
        completer.verify(&envelope),
        Err(EngineError::FeeMismatch { .. })
    ));
}

#[test]
fn test_claim_to_another_completer_is_rejected() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let other = key(8);
    let completer = Completer::new(
        other.clone(),
        NET,
        DelegationTerms::new("TOKEN", DEFAULT_CLAIM_AMOUNT, other.address(NET)),
    )
    .unwrap();
    assert!(matches!(
        completer.verify(&envelope),
        Err(EngineError::FeeMismatch { .. })
    ));
}

#[test]
fn test_completer_cannot_redirect_payment() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let mut tx = completer().complete(&envelope, &completer_unspent()).unwrap();

    tx.output[0].script_pubkey = asset_transfer_script(
        &completer_key().address(NET).script_pubkey(),
        "TOKEN",
        PAYMENT,
    )
    .unwrap();
    assert!(matches!(
        verify_spend(&tx, 0, &holding_script(HOLDING), None),
        Err(EngineError::ScriptVerificationFailed { input: 0, .. })
    ));
}

#[test]
fn test_native_output_ahead_of_change_is_rejected() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let mut tx = envelope.partial_tx().unwrap();
    tx.output.insert(
        2,
        TxOut {
            value: Amount::from_sat(REPORTED - 1),
            script_pubkey: originator_key().address(NET).script_pubkey(),
        },
    );
    TransactionSigner::anyone_can_pay()
        .sign_pubkey_hash(&mut tx, 0, &holding_script(HOLDING), &originator_key())
        .unwrap();
    let siphoning = FeeDelegationEnvelope::new(&tx, envelope.quote()).unwrap();

    assert!(matches!(
        completer().complete(&siphoning, &completer_unspent()),
        Err(EngineError::FeeMismatch { .. })
    ));
}

#[test]
fn test_sighash_all_envelope_is_unverified() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let mut tx = envelope.partial_tx().unwrap();
    TransactionSigner::new()
        .sign_pubkey_hash(&mut tx, 0, &holding_script(HOLDING), &originator_key())
        .unwrap();
    let resigned = FeeDelegationEnvelope::new(&tx, envelope.quote()).unwrap();

    assert!(matches!(
        completer().verify(&resigned),
        Err(EngineError::Unverified { .. })
    ));
}

#[test]
fn test_truncated_output_list_is_unverified() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let mut tx = envelope.partial_tx().unwrap();
    tx.output.truncate(1);
    let truncated = FeeDelegationEnvelope::new(&tx, envelope.quote()).unwrap();
    assert!(matches!(
        completer().verify(&truncated),
        Err(EngineError::Unverified { .. })
    ));
}

#[test]
fn test_missing_reserve_is_not_found() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let unspent = vec![completer_unspent().remove(0)];
    assert!(matches!(
        completer().complete(&envelope, &unspent),
        Err(EngineError::NotFound { .. })
    ));
}

#[test]
fn test_envelope_json_shape() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
    assert_eq!(value["feeSatsReserved"], 1_000_000);
    assert_eq!(value["reportedFeeSats"], 250_000);
    assert!(value["partialTxHex"].is_string());

    let parsed = FeeDelegationEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
    assert_eq!(parsed, envelope);
}

#[test]
fn test_malformed_envelopes_are_rejected_before_checks() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let cases = [
        format!(
            r#"{{"partialTxHex":"{}","feeSatsReserved":1000000,"reportedFeeSats":250000,"extra":1}}"#,
            envelope.partial_tx_hex
        ),
        format!(
            r#"{{"partialTxHex":"{}","feeSatsReserved":1000000,"reportedFeeSats":-5}}"#,
            envelope.partial_tx_hex
        ),
        format!(
            r#"{{"partialTxHex":"{}","feeSatsReserved":1000000}}"#,
            envelope.partial_tx_hex
        ),
        r#"{"partialTxHex":"not-hex","feeSatsReserved":1000000,"reportedFeeSats":250000}"#
            .to_string(),
    ];
    for json in cases {
        assert!(
            matches!(
                FeeDelegationEnvelope::from_json(&json),
                Err(EngineError::MalformedEnvelope { .. })
            ),
            "accepted {}",
            json
        );
    }
}

#[test]
fn test_run_completes_and_broadcasts() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let address = completer_key().address(NET);
    let source = MemoryUnspentSource::default()
        .with(&address, UnspentOutput::native(txid(9), 1, RESERVED));
    let broadcaster = RecordingBroadcaster::default();

    let state = completer()
        .run(&envelope.to_json().unwrap(), &source, &broadcaster)
        .unwrap();
    let sent = broadcaster.sent.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        state,
        DelegationState::Completed {
            txid: sent[0].compute_txid()
        }
    );
    assert_eq!(codec::signature_flags(&sent[0].input[1].script_sig), vec![0x81]);
}

#[test]
fn test_run_aborts_without_broadcasting() {
    let mut envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    envelope.reported_fee_sats = 100_000;
    let address = completer_key().address(NET);
    let source = MemoryUnspentSource::default()
        .with(&address, UnspentOutput::native(txid(9), 1, RESERVED));
    let broadcaster = RecordingBroadcaster::default();

    let state = completer()
        .run(&envelope.to_json().unwrap(), &source, &broadcaster)
        .unwrap();
    assert!(matches!(state, DelegationState::Aborted { .. }));
    assert!(broadcaster.sent.borrow().is_empty());

    let state = completer()
        .run(r#"{"partialTxHex":"00"}"#, &source, &broadcaster)
        .unwrap();
    assert!(matches!(state, DelegationState::Aborted { .. }));
    assert!(broadcaster.sent.borrow().is_empty());
}

#[test]
fn test_run_surfaces_missing_reserve_as_error() {
    let envelope = originate(FeeQuote::new(RESERVED, REPORTED));
    let source = MemoryUnspentSource::default();
    let broadcaster = RecordingBroadcaster::default();
    assert!(matches!(
        completer().run(&envelope.to_json().unwrap(), &source, &broadcaster),
        Err(EngineError::NotFound { .. })
    ));
}

#[test]
fn test_bridge_variant_layout() {
    let operator = key(8).address(NET);
    let foreign = "0x52908400098527886E0F7030069857D2E4169EE7";
    let terms = terms().with_bridge(BridgeTerms {
        operator: operator.clone(),
        fee: DEFAULT_BRIDGE_FEE,
        foreign_address: foreign.to_string(),
    });
    let holding = 1_000_000_000;
    let envelope = Originator::new(NET)
        .originate(
            &request(),
            &terms,
            FeeQuote::new(RESERVED, REPORTED),
            &holdings(holding),
            &[originator_key()],
        )
        .unwrap();
    let tx = envelope.partial_tx().unwrap();
    let n = tx.output.len();
    assert_eq!(n, 6);

    assert!(matches!(classify_output(&tx.output[n - 4]), OutputKind::Memo(m) if m == foreign.as_bytes()));
    let bridge_claim = parse_asset_transfer(&tx.output[n - 3].script_pubkey).unwrap();
    assert_eq!(bridge_claim.amount, DEFAULT_BRIDGE_FEE);
    assert_eq!(bridge_claim.owner_script, operator.script_pubkey());
    let change = parse_asset_transfer(&tx.output[1].script_pubkey).unwrap();
    assert_eq!(change.amount, holding - PAYMENT - DEFAULT_CLAIM_AMOUNT - DEFAULT_BRIDGE_FEE);

    let completer = Completer::new(completer_key(), NET, terms).unwrap();
    let completed = completer.complete(&envelope, &completer_unspent()).unwrap();
    assert_eq!(completed.output.last().unwrap().value.to_sat(), 750_000);
}

#[test]
fn test_bridge_fee_is_checked() {
    let operator = key(8).address(NET);
    let bridge = BridgeTerms {
        operator,
        fee: DEFAULT_BRIDGE_FEE,
        foreign_address: "0x52908400098527886E0F7030069857D2E4169EE7".to_string(),
    };
    let originator_terms = terms().with_bridge(BridgeTerms {
        fee: DEFAULT_BRIDGE_FEE / 2,
        ..bridge.clone()
    });
    let envelope = Originator::new(NET)
        .originate(
            &request(),
            &originator_terms,
            FeeQuote::new(RESERVED, REPORTED),
            &holdings(1_000_000_000),
            &[originator_key()],
        )
        .unwrap();

    let completer = Completer::new(completer_key(), NET, terms().with_bridge(bridge)).unwrap();
    assert!(matches!(
        completer.verify(&envelope),
        Err(EngineError::FeeMismatch { .. })
    ));
}

#[test]
fn test_native_payments_cannot_be_delegated() {
    let request = PaymentRequest::new(
        vec![Payment::native(payee(), 10_000)],
        originator_key().address(NET),
    );
    assert!(matches!(
        Originator::new(NET).originate(
            &request,
            &terms(),
            FeeQuote::new(RESERVED, REPORTED),
            &holdings(HOLDING),
            &[originator_key()],
        ),
        Err(EngineError::InvalidPayment { .. })
    ));
}

#[test]
fn test_completer_key_must_own_terms_address() {
    assert!(matches!(
        Completer::new(key(3), NET, terms()),
        Err(EngineError::InvalidAddress { .. })
    ));
}

#[test]
fn test_terminal_states_do_not_move() {
    let done = DelegationState::Originated.complete(txid(4));
    assert!(done.is_terminal());
    assert_eq!(done.clone().abort("late"), done);

    let aborted = DelegationState::Originated.abort("claim output");
    assert_eq!(aborted.clone().complete(txid(5)), aborted);
    assert!(!DelegationState::Originated.is_terminal());
}
