//! # Transaction Signing
//!
//! Legacy (pre-segwit) ECDSA signing: for each input the signature hash covers
//! the spent output's script code, the input index and the sighash flag. Once
//! all inputs are signed, every unlocking script is evaluated against its
//! locking script before the transaction is returned.
//!
//! Asset outputs carry the chain's asset opcode after their pay-to-pubkey-hash
//! prefix. The local evaluator does not implement that opcode, so spending such
//! an output stops at [`ScriptError::AssetMarker`] after the owner's signature
//! has been checked. That single case is logged and let through; asset rules are
//! enforced by network consensus.

use super::builder::{InputKind, TemplateSpend, UnsignedTransaction};
use crate::chain::KeyPair;
use crate::error::{EngineError, EngineResult};
use crate::script::{
    check_finality, interpreter::TransactionContext, push_data, verify_input, ChainView,
    ScriptError,
};
use bitcoin::{
    ecdsa,
    hashes::Hash,
    script::Builder,
    secp256k1::{All, Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    PublicKey, Script, ScriptBuf, Transaction,
};
use log::{debug, info, warn};

/// A detached signature by one key over one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureShare {
    pub input_index: usize,
    pub public_key: PublicKey,
    pub signature: ecdsa::Signature,
}

impl SignatureShare {
    pub fn sighash_type(&self) -> EcdsaSighashType {
        self.signature.sighash_type
    }
}

/// Signs transaction inputs with a fixed sighash flag
#[derive(Debug, Clone)]
pub struct TransactionSigner {
    secp: Secp256k1<All>,
    sighash_type: EcdsaSighashType,
}

impl Default for TransactionSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionSigner {
    /// Signer committing to all inputs and outputs
    pub fn new() -> Self {
        Self::with_sighash(EcdsaSighashType::All)
    }

    pub fn with_sighash(sighash_type: EcdsaSighashType) -> Self {
        Self {
            secp: Secp256k1::new(),
            sighash_type,
        }
    }

    /// Signer whose signatures leave room for inputs appended later
    pub fn anyone_can_pay() -> Self {
        Self::with_sighash(EcdsaSighashType::AllPlusAnyoneCanPay)
    }

    pub fn sighash_type(&self) -> EcdsaSighashType {
        self.sighash_type
    }

    /// Sign input `index` over `script_code` without touching the transaction
    pub fn signature_share(
        &self,
        tx: &Transaction,
        index: usize,
        script_code: &Script,
        key: &KeyPair,
    ) -> EngineResult<SignatureShare> {
        let sighash = SighashCache::new(tx)
            .legacy_signature_hash(index, script_code, self.sighash_type.to_u32())
            .map_err(|e| EngineError::signing(format!("input {}: {}", index, e)))?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = self.secp.sign_ecdsa(&message, key.secret_key());
        debug!(
            "signed input {} with {} ({:?})",
            index,
            key.public_key(),
            self.sighash_type
        );
        Ok(SignatureShare {
            input_index: index,
            public_key: *key.public_key(),
            signature: ecdsa::Signature {
                signature,
                sighash_type: self.sighash_type,
            },
        })
    }

    /// Sign a pay-to-pubkey-hash input: `<sig> <pubkey>`
    pub fn sign_pubkey_hash(
        &self,
        tx: &mut Transaction,
        index: usize,
        script_pubkey: &Script,
        key: &KeyPair,
    ) -> EngineResult<()> {
        let share = self.signature_share(tx, index, script_pubkey, key)?;
        let script_sig = Builder::new()
            .push_slice(push_data(&share.signature.to_vec())?)
            .push_key(key.public_key())
            .into_script();
        set_script_sig(tx, index, script_sig)
    }

    /// Sign a template input with every available key the branch checks
    pub fn sign_template(
        &self,
        tx: &mut Transaction,
        index: usize,
        spend: &TemplateSpend,
        keys: &[KeyPair],
    ) -> EngineResult<()> {
        let path = spend.path();
        let shares = path
            .keys
            .iter()
            .filter_map(|wanted| keys.iter().find(|k| k.public_key() == wanted))
            .take(path.required)
            .map(|key| self.signature_share(tx, index, spend.redeem_script(), key))
            .collect::<EngineResult<Vec<_>>>()?;
        self.apply_shares(tx, index, spend, &shares)
    }

    /// Install an unlocking script built from shares collected elsewhere
    pub fn apply_shares(
        &self,
        tx: &mut Transaction,
        index: usize,
        spend: &TemplateSpend,
        shares: &[SignatureShare],
    ) -> EngineResult<()> {
        if let Some(stray) = shares.iter().find(|s| s.input_index != index) {
            return Err(EngineError::signing(format!(
                "share for input {} applied to input {}",
                stray.input_index, index
            )));
        }
        let script_sig = spend.unlock().from_shares(shares)?;
        set_script_sig(tx, index, script_sig)
    }

    /// Sign every input and verify the result
    pub fn sign(&self, unsigned: &UnsignedTransaction, keys: &[KeyPair]) -> EngineResult<Transaction> {
        self.sign_with_view(unsigned, keys, None)
    }

    /// Sign every input, verify scripts, and with a view also check that the
    /// transaction's timelocks have matured
    pub fn sign_with_view(
        &self,
        unsigned: &UnsignedTransaction,
        keys: &[KeyPair],
        view: Option<&dyn ChainView>,
    ) -> EngineResult<Transaction> {
        let mut tx = unsigned.tx.clone();
        for (index, input) in unsigned.inputs.iter().enumerate() {
            match &input.kind {
                InputKind::PubkeyHash => {
                    let key = key_for_pubkey_hash(keys, &input.script_pubkey).ok_or_else(|| {
                        EngineError::signing(format!(
                            "no key for input {} ({})",
                            index,
                            input.unspent.outpoint()
                        ))
                    })?;
                    self.sign_pubkey_hash(&mut tx, index, &input.script_pubkey, key)?;
                }
                InputKind::Template(spend) => self.sign_template(&mut tx, index, spend, keys)?,
            }
        }

        for (index, input) in unsigned.inputs.iter().enumerate() {
            verify_spend(&tx, index, &input.script_pubkey, view)?;
        }
        info!(
            "signed transaction {} ({} inputs, {} outputs)",
            tx.compute_txid(),
            tx.input.len(),
            tx.output.len()
        );
        Ok(tx)
    }
}

/// Evaluate input `index` against the output it spends, tolerating only the
/// asset-opcode gap, then check finality when a chain view is given
pub fn verify_spend(
    tx: &Transaction,
    index: usize,
    script_pubkey: &Script,
    view: Option<&dyn ChainView>,
) -> EngineResult<()> {
    let input = tx.input.get(index).ok_or_else(|| EngineError::ScriptVerificationFailed {
        input: index,
        reason: "no such input".to_string(),
    })?;
    let ctx = TransactionContext::new(tx, index);
    match verify_input(&input.script_sig, script_pubkey, &ctx) {
        Ok(()) => {}
        Err(ScriptError::AssetMarker) => warn!(
            "input {}: asset opcode not evaluated locally, deferring to consensus",
            index
        ),
        Err(e) => {
            return Err(EngineError::ScriptVerificationFailed {
                input: index,
                reason: e.to_string(),
            })
        }
    }
    if let Some(view) = view {
        check_finality(tx, index, view).map_err(|e| EngineError::ScriptVerificationFailed {
            input: index,
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn key_for_pubkey_hash<'a>(keys: &'a [KeyPair], script_pubkey: &Script) -> Option<&'a KeyPair> {
    let prefix = script_pubkey.as_bytes().get(..25)?;
    keys.iter().find(|key| {
        ScriptBuf::new_p2pkh(&key.public_key().pubkey_hash()).as_bytes() == prefix
    })
}

fn set_script_sig(tx: &mut Transaction, index: usize, script_sig: ScriptBuf) -> EngineResult<()> {
    let input = tx
        .input
        .get_mut(index)
        .ok_or_else(|| EngineError::signing(format!("no input {}", index)))?;
    input.script_sig = script_sig;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainNetwork;
    use crate::outputs::asset_transfer_script;
    use crate::tx::builder::TransactionAssembler;
    use crate::utxo::UnspentOutput;
    use bitcoin::{Amount, TxOut, Txid};
    use std::str::FromStr;

    fn key(byte: u8) -> KeyPair {
        KeyPair::from_secret_bytes(&[byte; 32], ChainNetwork::Mainnet).unwrap()
    }

    fn txid(n: u8) -> Txid {
        Txid::from_str(&format!("{:02x}", n).repeat(32)).unwrap()
    }

    fn p2pkh(key: &KeyPair) -> ScriptBuf {
        key.address(ChainNetwork::Mainnet).script_pubkey()
    }

    fn one_input(owner_script: ScriptBuf, value: u64) -> UnsignedTransaction {
        let mut assembler = TransactionAssembler::new();
        assembler
            .add_input(UnspentOutput::native(txid(1), 0, value).with_locking_script(owner_script))
            .unwrap();
        assembler.add_output(TxOut {
            value: Amount::from_sat(value / 2),
            script_pubkey: p2pkh(&key(9)),
        });
        assembler.build().unwrap()
    }

    #[test]
    fn test_pubkey_hash_signing_verifies() {
        let alice = key(1);
        let unsigned = one_input(p2pkh(&alice), 100_000);
        let tx = TransactionSigner::new().sign(&unsigned, &[alice]).unwrap();
        assert!(!tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let unsigned = one_input(p2pkh(&key(1)), 100_000);
        assert!(matches!(
            TransactionSigner::new().sign(&unsigned, &[key(2)]),
            Err(EngineError::Signing { .. })
        ));
    }

    #[test]
    fn test_tampered_output_fails_verification() {
        let alice = key(1);
        let unsigned = one_input(p2pkh(&alice), 100_000);
        let mut tx = TransactionSigner::new().sign(&unsigned, &[alice]).unwrap();
        tx.output[0].value = Amount::from_sat(1);
        assert!(matches!(
            verify_spend(&tx, 0, &p2pkh(&key(1)), None),
            Err(EngineError::ScriptVerificationFailed { input: 0, .. })
        ));
    }

    #[test]
    fn test_asset_input_passes_through_gap() {
        let alice = key(1);
        let asset_script = asset_transfer_script(&p2pkh(&alice), "TOKEN", 500).unwrap();
        let mut unsigned = one_input(asset_script.clone(), 0);
        unsigned.inputs[0].unspent = UnspentOutput::asset(txid(1), 0, "TOKEN", 500)
            .with_locking_script(asset_script.clone());
        unsigned.tx.output[0].value = Amount::ZERO;

        let tx = TransactionSigner::anyone_can_pay()
            .sign(&unsigned, &[alice])
            .unwrap();
        let script_sig = &tx.input[0].script_sig;
        let first_push = script_sig.instructions().next().unwrap().unwrap();
        let sig = first_push.push_bytes().unwrap().as_bytes();
        assert_eq!(*sig.last().unwrap(), 0x81);

        // A wrong signer still fails before the gap is reached
        let mut forged = tx.clone();
        let bob_share = TransactionSigner::anyone_can_pay()
            .signature_share(&unsigned.tx, 0, &asset_script, &key(2))
            .unwrap();
        forged.input[0].script_sig = Builder::new()
            .push_slice(push_data(&bob_share.signature.to_vec()).unwrap())
            .push_key(key(1).public_key())
            .into_script();
        assert!(verify_spend(&forged, 0, &asset_script, None).is_err());
    }

    #[test]
    fn test_anyone_can_pay_survives_appended_input() {
        let alice = key(1);
        let unsigned = one_input(p2pkh(&alice), 100_000);
        let mut tx = TransactionSigner::anyone_can_pay()
            .sign(&unsigned, &[alice])
            .unwrap();

        tx.input.push(bitcoin::TxIn {
            previous_output: bitcoin::OutPoint::new(txid(2), 3),
            ..Default::default()
        });
        assert!(verify_spend(&tx, 0, &p2pkh(&key(1)), None).is_ok());

        let all = TransactionSigner::new().sign(&unsigned, &[key(1)]).unwrap();
        let mut extended = all.clone();
        extended.input.push(tx.input[1].clone());
        assert!(verify_spend(&extended, 0, &p2pkh(&key(1)), None).is_err());
    }
}
