//! Transaction assembly.
//!
//! The assembler only arranges inputs and outputs; it never selects coins or
//! signs. It does enforce that native inputs cover native outputs, so every
//! [`UnsignedTransaction`] has a non-negative fee.

use crate::error::{EngineError, EngineResult};
use crate::script::{
    locktime::AbsoluteLock, BranchPath, ScriptTemplate, SpendBranch, UnlockBuilder,
};
use crate::utxo::UnspentOutput;
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, Script, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};
use log::debug;

/// A spend through one branch of a P2SH template.
///
/// Derives the input's `nSequence` and the transaction's `nLockTime` from the
/// branch: a relative lock goes into the sequence, an absolute lock into the
/// locktime (with a sequence that keeps locktime enforcement on).
#[derive(Debug, Clone)]
pub struct TemplateSpend {
    template: ScriptTemplate,
    unlock: UnlockBuilder,
}

impl TemplateSpend {
    pub fn new(template: ScriptTemplate, branch: SpendBranch) -> EngineResult<Self> {
        let unlock = UnlockBuilder::new(&template, branch)?;
        Ok(Self { template, unlock })
    }

    pub fn template(&self) -> &ScriptTemplate {
        &self.template
    }

    pub fn branch(&self) -> SpendBranch {
        self.unlock.branch()
    }

    pub fn path(&self) -> &BranchPath {
        self.unlock.path()
    }

    pub fn unlock(&self) -> &UnlockBuilder {
        &self.unlock
    }

    pub fn redeem_script(&self) -> &Script {
        self.unlock.redeem_script()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2sh(&self.redeem_script().script_hash())
    }

    pub fn sequence(&self) -> Sequence {
        let path = self.path();
        match (path.relative_lock, path.absolute_lock) {
            (Some(relative), _) => relative.to_sequence(),
            (None, Some(_)) => Sequence::ENABLE_LOCKTIME_NO_RBF,
            (None, None) => Sequence::MAX,
        }
    }

    pub fn lock_time(&self) -> Option<AbsoluteLock> {
        self.path().absolute_lock
    }
}

/// How an input gets its unlocking script
#[derive(Debug, Clone)]
pub enum InputKind {
    /// Pay-to-pubkey-hash, including asset outputs built on one
    PubkeyHash,
    /// A P2SH template branch
    Template(TemplateSpend),
}

/// An input together with what is needed to sign and verify it
#[derive(Debug, Clone)]
pub struct SpendInput {
    pub unspent: UnspentOutput,
    pub script_pubkey: ScriptBuf,
    pub kind: InputKind,
}

/// A transaction shell awaiting signatures
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    pub inputs: Vec<SpendInput>,
}

impl UnsignedTransaction {
    pub fn native_in(&self) -> u64 {
        self.inputs.iter().map(|i| i.unspent.native_value()).sum()
    }

    pub fn native_out(&self) -> u64 {
        self.tx.output.iter().map(|o| o.value.to_sat()).sum()
    }

    /// Native fee paid; zero while a partial transaction is still underfunded
    pub fn fee(&self) -> u64 {
        self.native_in().saturating_sub(self.native_out())
    }

    /// Locking scripts of the spent outputs, by input index
    pub fn prevout_scripts(&self) -> Vec<ScriptBuf> {
        self.inputs.iter().map(|i| i.script_pubkey.clone()).collect()
    }
}

/// Arranges inputs and outputs into a transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionAssembler {
    inputs: Vec<(SpendInput, Sequence)>,
    outputs: Vec<TxOut>,
    lock_time: Option<AbsoluteLock>,
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pay-to-pubkey-hash input; the unspent must carry its locking script
    pub fn add_input(&mut self, unspent: UnspentOutput) -> EngineResult<&mut Self> {
        let script_pubkey = unspent.locking_script.clone().ok_or_else(|| {
            EngineError::not_found(format!("locking script for {}", unspent.outpoint()))
        })?;
        self.add_pubkey_hash_input(unspent, script_pubkey)
    }

    pub fn add_pubkey_hash_input(
        &mut self,
        unspent: UnspentOutput,
        script_pubkey: ScriptBuf,
    ) -> EngineResult<&mut Self> {
        if !script_pubkey.as_bytes().get(..25).is_some_and(|p| Script::from_bytes(p).is_p2pkh()) {
            return Err(EngineError::template(format!(
                "{} is not a pubkey-hash output",
                unspent.outpoint()
            )));
        }
        self.push_input(
            SpendInput {
                unspent,
                script_pubkey,
                kind: InputKind::PubkeyHash,
            },
            Sequence::MAX,
        )
    }

    /// Add an input spending a template output through the given branch
    pub fn add_template_input(
        &mut self,
        unspent: UnspentOutput,
        spend: TemplateSpend,
    ) -> EngineResult<&mut Self> {
        let script_pubkey = spend.script_pubkey();
        if let Some(reported) = &unspent.locking_script {
            if *reported != script_pubkey {
                return Err(EngineError::template(format!(
                    "{} is not locked by this {} template",
                    unspent.outpoint(),
                    spend.template().name()
                )));
            }
        }
        if let Some(lock) = spend.lock_time() {
            self.require_lock_time(lock)?;
        }
        let sequence = spend.sequence();
        self.push_input(
            SpendInput {
                unspent,
                script_pubkey,
                kind: InputKind::Template(spend),
            },
            sequence,
        )
    }

    pub fn add_output(&mut self, output: TxOut) -> &mut Self {
        self.outputs.push(output);
        self
    }

    pub fn add_outputs(&mut self, outputs: impl IntoIterator<Item = TxOut>) -> &mut Self {
        self.outputs.extend(outputs);
        self
    }

    /// Raise the transaction locktime to at least `lock`
    pub fn require_lock_time(&mut self, lock: AbsoluteLock) -> EngineResult<&mut Self> {
        match self.lock_time {
            Some(current) if !current.is_same_kind(lock) => {
                return Err(EngineError::locktime(format!(
                    "inputs need both {} and {}",
                    current, lock
                )));
            }
            Some(current) if current.to_consensus_u32() >= lock.to_consensus_u32() => {}
            _ => self.lock_time = Some(lock),
        }
        Ok(self)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn build(&self) -> EngineResult<UnsignedTransaction> {
        let unsigned = self.assemble();
        let (native_in, native_out) = (unsigned.native_in(), unsigned.native_out());
        if native_in < native_out {
            return Err(EngineError::InsufficientFunds {
                required: native_out,
                available: native_in,
            });
        }
        debug!(
            "assembled {} input(s), {} output(s), fee {}",
            unsigned.tx.input.len(),
            unsigned.tx.output.len(),
            Amount::from_sat(native_in - native_out)
        );
        Ok(unsigned)
    }

    /// Build without the balance check, for a transaction whose remaining
    /// native value is supplied by another party's appended input
    pub fn build_partial(&self) -> UnsignedTransaction {
        let unsigned = self.assemble();
        debug!(
            "assembled partial transaction: {} input(s), {} output(s), {} native short",
            unsigned.tx.input.len(),
            unsigned.tx.output.len(),
            unsigned.native_out().saturating_sub(unsigned.native_in())
        );
        unsigned
    }

    fn assemble(&self) -> UnsignedTransaction {
        let lock_time = match self.lock_time {
            Some(lock) => LockTime::from_consensus(lock.to_consensus_u32()),
            None => LockTime::ZERO,
        };
        let tx = Transaction {
            version: Version::TWO,
            lock_time,
            input: self
                .inputs
                .iter()
                .map(|(input, sequence)| TxIn {
                    previous_output: input.unspent.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence: *sequence,
                    witness: Witness::default(),
                })
                .collect(),
            output: self.outputs.clone(),
        };
        UnsignedTransaction {
            tx,
            inputs: self.inputs.iter().map(|(input, _)| input.clone()).collect(),
        }
    }

    fn push_input(&mut self, input: SpendInput, sequence: Sequence) -> EngineResult<&mut Self> {
        let outpoint = input.unspent.outpoint();
        if self.inputs.iter().any(|(i, _)| i.unspent.outpoint() == outpoint) {
            return Err(EngineError::template(format!("{} is already an input", outpoint)));
        }
        self.inputs.push((input, sequence));
        Ok(self)
    }
}
