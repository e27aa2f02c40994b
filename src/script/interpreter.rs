//! # Legacy Script Evaluator
//!
//! A small evaluator for the non-segwit script subset this engine emits and
//! spends: pushes, small integers, `IF`/`NOTIF`/`ELSE`/`ENDIF`, the stack and
//! hash opcodes a P2PKH/P2SH spend needs, `CHECKSIG`, `CHECKMULTISIG`,
//! `CHECKLOCKTIMEVERIFY` and `CHECKSEQUENCEVERIFY`, with P2SH evaluation of the
//! redeem script.
//!
//! Signature checks and transaction fields come in through [`SpendContext`];
//! chain state for finality comes in through [`ChainView`]. The chain's asset
//! opcode (`0xc0`) is not evaluated: reaching it yields
//! [`ScriptError::AssetMarker`], which callers may treat as a pass-through since
//! asset semantics are enforced by consensus.

use super::locktime::{
    SEQUENCE_DISABLE_FLAG, SEQUENCE_TIME_FLAG, SEQUENCE_TIME_GRANULARITY, SEQUENCE_VALUE_MASK,
};
use crate::config::chain::{ASSET_MARKER_OPCODE, LOCKTIME_THRESHOLD};
use bitcoin::{
    hashes::{hash160, sha256, sha256d, Hash},
    opcodes::all::*,
    script::Instruction,
    secp256k1::{ecdsa, Message, PublicKey as SecpPublicKey, Secp256k1, VerifyOnly},
    sighash::SighashCache,
    OutPoint, Script, Sequence, Transaction,
};
use thiserror::Error;

/// Largest element a script may push
pub const MAX_ELEMENT_SIZE: usize = 520;

/// Largest key count CHECKMULTISIG accepts
pub const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;

/// Errors raised while evaluating a script
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("asset opcode 0xc0 is not evaluated locally")]
    AssetMarker,

    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("malformed script: {0}")]
    Malformed(String),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("push of {0} bytes exceeds the element limit")]
    PushSize(usize),

    #[error("unbalanced conditional")]
    UnbalancedConditional,

    #[error("script number overflow")]
    NumberOverflow,

    #[error("{0} failed")]
    VerifyFailed(&'static str),

    #[error("script returned early")]
    EarlyReturn,

    #[error("script evaluated to false")]
    EvalFalse,

    #[error("invalid public key count")]
    InvalidPubKeyCount,

    #[error("invalid signature count")]
    InvalidSignatureCount,

    #[error("multisig dummy element must be empty")]
    NullDummy,

    #[error("negative locktime")]
    NegativeLockTime,

    #[error("unsatisfied locktime: {0}")]
    UnsatisfiedLockTime(String),

    #[error("unlocking script must contain only pushes")]
    PushOnly,

    #[error("signature check failed: {0}")]
    Signature(String),

    #[error("transaction is not final: {0}")]
    NonFinal(String),
}

impl ScriptError {
    /// The one evaluator gap callers are allowed to tolerate
    pub fn is_asset_marker(&self) -> bool {
        matches!(self, ScriptError::AssetMarker)
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;

/// Transaction data the evaluator needs for one input
pub trait SpendContext {
    /// Check a signature (DER plus trailing sighash byte) against a public key
    /// over `script_code`
    fn verify_signature(
        &self,
        signature: &[u8],
        public_key: &[u8],
        script_code: &Script,
    ) -> ScriptResult<bool>;

    fn lock_time(&self) -> u32;

    fn version(&self) -> i32;

    /// nSequence of the input being evaluated
    fn sequence(&self) -> u32;
}

/// [`SpendContext`] over a real transaction, using legacy signature hashes
pub struct TransactionContext<'a> {
    tx: &'a Transaction,
    input_index: usize,
    cache: SighashCache<&'a Transaction>,
    secp: Secp256k1<VerifyOnly>,
}

impl<'a> TransactionContext<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize) -> Self {
        Self {
            tx,
            input_index,
            cache: SighashCache::new(tx),
            secp: Secp256k1::verification_only(),
        }
    }
}

impl SpendContext for TransactionContext<'_> {
    fn verify_signature(
        &self,
        signature: &[u8],
        public_key: &[u8],
        script_code: &Script,
    ) -> ScriptResult<bool> {
        let Some((&flag, der)) = signature.split_last() else {
            return Ok(false);
        };
        let Ok(sig) = ecdsa::Signature::from_der(der) else {
            return Ok(false);
        };
        let Ok(key) = SecpPublicKey::from_slice(public_key) else {
            return Ok(false);
        };
        let sighash = self
            .cache
            .legacy_signature_hash(self.input_index, script_code, flag as u32)
            .map_err(|e| ScriptError::Signature(e.to_string()))?;
        let message = Message::from_digest(sighash.to_byte_array());
        Ok(self.secp.verify_ecdsa(&message, &sig, &key).is_ok())
    }

    fn lock_time(&self) -> u32 {
        self.tx.lock_time.to_consensus_u32()
    }

    fn version(&self) -> i32 {
        self.tx.version.0
    }

    fn sequence(&self) -> u32 {
        self.tx
            .input
            .get(self.input_index)
            .map(|input| input.sequence.0)
            .unwrap_or(Sequence::MAX.0)
    }
}

/// Chain state needed to decide whether timelocks have matured
pub trait ChainView {
    /// Height of the block that would include the transaction
    fn next_height(&self) -> u32;

    /// Median time past of the current tip
    fn median_time(&self) -> u32;

    /// Height and median time of the block that confirmed `outpoint`, if any
    fn confirmation(&self, outpoint: &OutPoint) -> Option<(u32, u32)>;
}

/// Evaluate `script_sig` against `script_pubkey`, descending into the redeem
/// script for P2SH outputs
pub fn verify_input(
    script_sig: &Script,
    script_pubkey: &Script,
    ctx: &dyn SpendContext,
) -> ScriptResult<()> {
    if !script_sig.is_push_only() {
        return Err(ScriptError::PushOnly);
    }

    let mut stack = Vec::new();
    execute(script_sig, &mut stack, ctx)?;
    let mut p2sh_stack = stack.clone();

    execute(script_pubkey, &mut stack, ctx)?;
    require_true(&stack)?;

    if script_pubkey.is_p2sh() {
        let redeem = p2sh_stack.pop().ok_or(ScriptError::StackUnderflow)?;
        execute(Script::from_bytes(&redeem), &mut p2sh_stack, ctx)?;
        require_true(&p2sh_stack)?;
    }
    Ok(())
}

/// Check that input `index` of `tx` could be mined in the next block: the
/// transaction-level locktime against height or median time, and the input's
/// relative lock against its prevout's confirmation
pub fn check_finality(tx: &Transaction, index: usize, view: &dyn ChainView) -> ScriptResult<()> {
    let input = tx
        .input
        .get(index)
        .ok_or_else(|| ScriptError::NonFinal(format!("no input {}", index)))?;

    let lock_time = tx.lock_time.to_consensus_u32();
    if lock_time != 0 && !tx.input.iter().all(|i| i.sequence == Sequence::MAX) {
        let (current, unit) = if lock_time < LOCKTIME_THRESHOLD {
            (view.next_height(), "height")
        } else {
            (view.median_time(), "median time")
        };
        if lock_time >= current {
            return Err(ScriptError::NonFinal(format!(
                "locktime {} not reached at {} {}",
                lock_time, unit, current
            )));
        }
    }

    let sequence = input.sequence.0;
    if tx.version.0 < 2 || sequence & SEQUENCE_DISABLE_FLAG != 0 {
        return Ok(());
    }
    let (conf_height, conf_time) = view.confirmation(&input.previous_output).ok_or_else(|| {
        ScriptError::NonFinal(format!("{} is unconfirmed", input.previous_output))
    })?;
    let value = sequence & SEQUENCE_VALUE_MASK;
    if sequence & SEQUENCE_TIME_FLAG != 0 {
        let mature_at = conf_time as u64 + value as u64 * SEQUENCE_TIME_GRANULARITY;
        if (view.median_time() as u64) < mature_at {
            return Err(ScriptError::NonFinal(format!(
                "relative time lock matures at {}, median time is {}",
                mature_at,
                view.median_time()
            )));
        }
    } else {
        let mature_at = conf_height as u64 + value as u64;
        if (view.next_height() as u64) < mature_at {
            return Err(ScriptError::NonFinal(format!(
                "relative lock matures at height {}, next block is {}",
                mature_at,
                view.next_height()
            )));
        }
    }
    Ok(())
}

fn require_true(stack: &[Vec<u8>]) -> ScriptResult<()> {
    match stack.last() {
        Some(top) if as_bool(top) => Ok(()),
        _ => Err(ScriptError::EvalFalse),
    }
}

/// Run one script over `stack`
pub fn execute(script: &Script, stack: &mut Vec<Vec<u8>>, ctx: &dyn SpendContext) -> ScriptResult<()> {
    let mut exec_stack: Vec<bool> = Vec::new();

    for instruction in script.instructions() {
        let instruction = instruction.map_err(|e| ScriptError::Malformed(e.to_string()))?;
        let executing = exec_stack.iter().all(|branch| *branch);

        let op = match instruction {
            Instruction::PushBytes(push) => {
                if push.len() > MAX_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize(push.len()));
                }
                if executing {
                    stack.push(push.as_bytes().to_vec());
                }
                continue;
            }
            Instruction::Op(op) => op,
        };

        match op {
            OP_IF | OP_NOTIF => {
                let mut value = false;
                if executing {
                    let top = pop(stack)?;
                    value = as_bool(&top);
                    if op == OP_NOTIF {
                        value = !value;
                    }
                }
                exec_stack.push(value);
                continue;
            }
            OP_ELSE => {
                let last = exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
                continue;
            }
            OP_ENDIF => {
                exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                continue;
            }
            _ => {}
        }

        if !executing {
            continue;
        }

        match op {
            OP_PUSHNUM_NEG1 => stack.push(encode_num(-1)),
            OP_PUSHNUM_1 | OP_PUSHNUM_2 | OP_PUSHNUM_3 | OP_PUSHNUM_4 | OP_PUSHNUM_5
            | OP_PUSHNUM_6 | OP_PUSHNUM_7 | OP_PUSHNUM_8 | OP_PUSHNUM_9 | OP_PUSHNUM_10
            | OP_PUSHNUM_11 | OP_PUSHNUM_12 | OP_PUSHNUM_13 | OP_PUSHNUM_14 | OP_PUSHNUM_15
            | OP_PUSHNUM_16 => {
                let n = op.to_u8() - OP_PUSHNUM_1.to_u8() + 1;
                stack.push(encode_num(n as i64));
            }
            OP_NOP | OP_NOP1 | OP_NOP4 | OP_NOP5 | OP_NOP6 | OP_NOP7 | OP_NOP8 | OP_NOP9
            | OP_NOP10 => {}
            OP_VERIFY => verify(stack, "VERIFY")?,
            OP_RETURN => return Err(ScriptError::EarlyReturn),
            OP_DROP => {
                pop(stack)?;
            }
            OP_2DROP => {
                pop(stack)?;
                pop(stack)?;
            }
            OP_DUP => {
                let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                stack.push(top);
            }
            OP_SWAP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::StackUnderflow);
                }
                stack.swap(len - 1, len - 2);
            }
            OP_SIZE => {
                let len = stack.last().ok_or(ScriptError::StackUnderflow)?.len();
                stack.push(encode_num(len as i64));
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                let a = pop(stack)?;
                let b = pop(stack)?;
                stack.push(encode_bool(a == b));
                if op == OP_EQUALVERIFY {
                    verify(stack, "EQUALVERIFY")?;
                }
            }
            OP_SHA256 => {
                let top = pop(stack)?;
                stack.push(sha256::Hash::hash(&top).to_byte_array().to_vec());
            }
            OP_HASH160 => {
                let top = pop(stack)?;
                stack.push(hash160::Hash::hash(&top).to_byte_array().to_vec());
            }
            OP_HASH256 => {
                let top = pop(stack)?;
                stack.push(sha256d::Hash::hash(&top).to_byte_array().to_vec());
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let public_key = pop(stack)?;
                let signature = pop(stack)?;
                let valid = !signature.is_empty()
                    && ctx.verify_signature(&signature, &public_key, script)?;
                stack.push(encode_bool(valid));
                if op == OP_CHECKSIGVERIFY {
                    verify(stack, "CHECKSIGVERIFY")?;
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let valid = check_multisig(stack, script, ctx)?;
                stack.push(encode_bool(valid));
                if op == OP_CHECKMULTISIGVERIFY {
                    verify(stack, "CHECKMULTISIGVERIFY")?;
                }
            }
            OP_CLTV => check_lock_time_verify(stack, ctx)?,
            OP_CSV => check_sequence_verify(stack, ctx)?,
            _ if op.to_u8() == ASSET_MARKER_OPCODE => {
                // Only a passing owner script may reach the gap
                require_true(stack)?;
                return Err(ScriptError::AssetMarker);
            }
            _ => return Err(ScriptError::UnsupportedOpcode(op.to_u8())),
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn check_multisig(
    stack: &mut Vec<Vec<u8>>,
    script: &Script,
    ctx: &dyn SpendContext,
) -> ScriptResult<bool> {
    let key_count = decode_num(&pop(stack)?, 4)?;
    if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&key_count) {
        return Err(ScriptError::InvalidPubKeyCount);
    }
    let mut keys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        keys.push(pop(stack)?);
    }
    keys.reverse();

    let sig_count = decode_num(&pop(stack)?, 4)?;
    if sig_count < 0 || sig_count > key_count {
        return Err(ScriptError::InvalidSignatureCount);
    }
    let mut signatures = Vec::with_capacity(sig_count as usize);
    for _ in 0..sig_count {
        signatures.push(pop(stack)?);
    }
    signatures.reverse();

    if !pop(stack)?.is_empty() {
        return Err(ScriptError::NullDummy);
    }

    // Signatures must appear in the same relative order as their keys
    let mut key_iter = keys.iter();
    for signature in &signatures {
        if signature.is_empty() {
            return Ok(false);
        }
        loop {
            let Some(key) = key_iter.next() else {
                return Ok(false);
            };
            if ctx.verify_signature(signature, key, script)? {
                break;
            }
        }
    }
    Ok(true)
}

fn check_lock_time_verify(stack: &[Vec<u8>], ctx: &dyn SpendContext) -> ScriptResult<()> {
    let required = decode_num(stack.last().ok_or(ScriptError::StackUnderflow)?, 5)?;
    if required < 0 {
        return Err(ScriptError::NegativeLockTime);
    }
    let tx_lock_time = ctx.lock_time() as i64;
    let threshold = LOCKTIME_THRESHOLD as i64;
    if (required < threshold) != (tx_lock_time < threshold) {
        return Err(ScriptError::UnsatisfiedLockTime(format!(
            "mismatched locktime kinds: script {}, transaction {}",
            required, tx_lock_time
        )));
    }
    if required > tx_lock_time {
        return Err(ScriptError::UnsatisfiedLockTime(format!(
            "script requires {}, transaction locktime is {}",
            required, tx_lock_time
        )));
    }
    if ctx.sequence() == Sequence::MAX.0 {
        return Err(ScriptError::UnsatisfiedLockTime(
            "input sequence is final".to_string(),
        ));
    }
    Ok(())
}

fn check_sequence_verify(stack: &[Vec<u8>], ctx: &dyn SpendContext) -> ScriptResult<()> {
    let required = decode_num(stack.last().ok_or(ScriptError::StackUnderflow)?, 5)?;
    if required < 0 {
        return Err(ScriptError::NegativeLockTime);
    }
    let required = required as u32;
    if required & SEQUENCE_DISABLE_FLAG != 0 {
        return Ok(());
    }
    if ctx.version() < 2 {
        return Err(ScriptError::UnsatisfiedLockTime(format!(
            "transaction version {} does not enable relative locks",
            ctx.version()
        )));
    }
    let sequence = ctx.sequence();
    if sequence & SEQUENCE_DISABLE_FLAG != 0 {
        return Err(ScriptError::UnsatisfiedLockTime(
            "input sequence disables relative locks".to_string(),
        ));
    }
    let mask = SEQUENCE_TIME_FLAG | SEQUENCE_VALUE_MASK;
    let (required, sequence) = (required & mask, sequence & mask);
    if (required & SEQUENCE_TIME_FLAG) != (sequence & SEQUENCE_TIME_FLAG) {
        return Err(ScriptError::UnsatisfiedLockTime(
            "mismatched relative lock kinds".to_string(),
        ));
    }
    if required > sequence {
        return Err(ScriptError::UnsatisfiedLockTime(format!(
            "script requires sequence {}, input carries {}",
            required, sequence
        )));
    }
    Ok(())
}

fn pop(stack: &mut Vec<Vec<u8>>) -> ScriptResult<Vec<u8>> {
    stack.pop().ok_or(ScriptError::StackUnderflow)
}

fn verify(stack: &mut Vec<Vec<u8>>, name: &'static str) -> ScriptResult<()> {
    if as_bool(&pop(stack)?) {
        Ok(())
    } else {
        Err(ScriptError::VerifyFailed(name))
    }
}

fn as_bool(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        None => false,
        Some((&last, rest)) => rest.iter().any(|b| *b != 0) || (last != 0 && last != 0x80),
    }
}

fn encode_bool(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

/// Minimal little-endian sign-magnitude encoding
fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().is_some_and(|b| b & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        if let Some(last) = out.last_mut() {
            *last |= 0x80;
        }
    }
    out
}

fn decode_num(bytes: &[u8], max_len: usize) -> ScriptResult<i64> {
    if bytes.len() > max_len {
        return Err(ScriptError::NumberOverflow);
    }
    let Some((&last, _)) = bytes.split_last() else {
        return Ok(0);
    };
    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        Ok(-(value & mask))
    } else {
        Ok(value)
    }
}
