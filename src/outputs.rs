//! # Output Compiler
//!
//! Turns payment requests into transaction outputs:
//!
//! - native payments pay the destination's standard locking script;
//! - asset payments append an asset-transfer payload to that same script
//!   (`<owner script> OP_ASSET <"rvnt" len name amount_le> OP_DROP`) and carry
//!   zero native value;
//! - change is `gathered - spent - fee`, at most one output per denomination;
//! - memos are zero-value `OP_RETURN` outputs.

use crate::chain::ChainAddress;
use crate::config::{chain as params, memo};
use crate::error::{EngineError, EngineResult};
use crate::utxo::Denomination;
use bitcoin::{
    opcodes::{all::*, Opcode},
    script::{Builder, Instruction, PushBytesBuf},
    Amount, Script, ScriptBuf, TxOut,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One requested transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub to: ChainAddress,
    pub amount: u64,
    pub denomination: Denomination,
}

impl Payment {
    pub fn native(to: ChainAddress, amount: u64) -> Self {
        Self {
            to,
            amount,
            denomination: Denomination::Native,
        }
    }

    pub fn asset(to: ChainAddress, asset: impl Into<String>, amount: u64) -> Self {
        Self {
            to,
            amount,
            denomination: Denomination::Asset(asset.into()),
        }
    }
}

/// Decoded asset-transfer output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTransfer {
    pub asset: String,
    pub amount: u64,
    /// The plain locking script the payload is attached to
    pub owner_script: ScriptBuf,
}

/// What an output does, as far as this engine can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputKind {
    Native,
    Asset(AssetTransfer),
    Memo(Vec<u8>),
    Unknown,
}

/// Compiled payment outputs plus what they require from the inputs
#[derive(Debug, Clone, Default)]
pub struct CompiledOutputs {
    pub outputs: Vec<TxOut>,
    pub required: BTreeMap<Denomination, u64>,
}

impl CompiledOutputs {
    /// Total the outputs spend in `denomination`
    pub fn required(&self, denomination: &Denomination) -> u64 {
        self.required.get(denomination).copied().unwrap_or(0)
    }

    /// Assets in a stable order
    pub fn assets(&self) -> impl Iterator<Item = (&str, u64)> {
        self.required.iter().filter_map(|(d, amount)| match d {
            Denomination::Asset(name) => Some((name.as_str(), *amount)),
            Denomination::Native => None,
        })
    }
}

/// Builds payment, change, asset and memo outputs
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputCompiler;

impl OutputCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile payments into outputs, preserving request order
    pub fn compile(&self, payments: &[Payment]) -> EngineResult<CompiledOutputs> {
        let mut compiled = CompiledOutputs::default();
        for payment in payments {
            if payment.amount == 0 {
                return Err(EngineError::payment(format!(
                    "zero-amount payment to {}",
                    payment.to
                )));
            }
            compiled.outputs.push(self.output_for(payment)?);
            let total = compiled
                .required
                .entry(payment.denomination.clone())
                .or_insert(0);
            *total = total
                .checked_add(payment.amount)
                .ok_or_else(|| EngineError::payment("payment total overflows"))?;
        }
        Ok(compiled)
    }

    pub fn output_for(&self, payment: &Payment) -> EngineResult<TxOut> {
        match &payment.denomination {
            Denomination::Native => Ok(TxOut {
                value: Amount::from_sat(payment.amount),
                script_pubkey: payment.to.script_pubkey(),
            }),
            Denomination::Asset(asset) => Ok(TxOut {
                value: Amount::ZERO,
                script_pubkey: asset_transfer_script(
                    &payment.to.script_pubkey(),
                    asset,
                    payment.amount,
                )?,
            }),
        }
    }

    /// Change for one denomination: `None` when nothing is left over
    pub fn change_output(
        &self,
        denomination: &Denomination,
        gathered: u64,
        spent: u64,
        fee: u64,
        to: &ChainAddress,
    ) -> EngineResult<Option<TxOut>> {
        let required = spent
            .checked_add(fee)
            .ok_or_else(|| EngineError::payment("spend plus fee overflows"))?;
        let change = gathered.checked_sub(required).ok_or_else(|| match denomination {
            Denomination::Native => EngineError::InsufficientFunds {
                required,
                available: gathered,
            },
            Denomination::Asset(asset) => EngineError::InsufficientAsset {
                asset: asset.clone(),
                required,
                available: gathered,
            },
        })?;
        if change == 0 {
            return Ok(None);
        }
        self.output_for(&Payment {
            to: to.clone(),
            amount: change,
            denomination: denomination.clone(),
        })
        .map(Some)
    }

    pub fn memo_output(&self, data: &[u8]) -> EngineResult<TxOut> {
        Ok(TxOut {
            value: Amount::ZERO,
            script_pubkey: memo_script(data)?,
        })
    }
}

/// Attach an asset-transfer payload to a plain locking script
pub fn asset_transfer_script(owner: &Script, asset: &str, amount: u64) -> EngineResult<ScriptBuf> {
    if !(owner.is_p2pkh() || owner.is_p2sh()) {
        return Err(EngineError::payment(
            "asset outputs must pay a pubkey-hash or script-hash address",
        ));
    }
    validate_asset_name(asset)?;

    let mut payload = Vec::with_capacity(params::ASSET_TRANSFER_PREFIX.len() + asset.len() + 9);
    payload.extend_from_slice(&params::ASSET_TRANSFER_PREFIX);
    payload.push(asset.len() as u8);
    payload.extend_from_slice(asset.as_bytes());
    payload.extend_from_slice(&amount.to_le_bytes());
    let payload = PushBytesBuf::try_from(payload)
        .map_err(|e| EngineError::encoding(format!("asset payload: {}", e)))?;

    let tail = Builder::new()
        .push_opcode(Opcode::from(params::ASSET_MARKER_OPCODE))
        .push_slice(payload)
        .push_opcode(OP_DROP)
        .into_script();

    let mut bytes = owner.to_bytes();
    bytes.extend_from_slice(tail.as_bytes());
    Ok(ScriptBuf::from(bytes))
}

/// Recover the asset transfer carried by a locking script, if any
pub fn parse_asset_transfer(script: &Script) -> Option<AssetTransfer> {
    let bytes = script.as_bytes();
    let prefix_len = if bytes.len() > 25 && Script::from_bytes(&bytes[..25]).is_p2pkh() {
        25
    } else if bytes.len() > 23 && Script::from_bytes(&bytes[..23]).is_p2sh() {
        23
    } else {
        return None;
    };

    let tail = Script::from_bytes(&bytes[prefix_len..]);
    let mut instructions = tail.instructions();
    match instructions.next()? {
        Ok(Instruction::Op(op)) if op.to_u8() == params::ASSET_MARKER_OPCODE => {}
        _ => return None,
    }
    let payload = match instructions.next()? {
        Ok(Instruction::PushBytes(push)) => push.as_bytes().to_vec(),
        _ => return None,
    };
    match instructions.next()? {
        Ok(Instruction::Op(op)) if op == OP_DROP => {}
        _ => return None,
    }
    if instructions.next().is_some() {
        return None;
    }

    let rest = payload.strip_prefix(&params::ASSET_TRANSFER_PREFIX[..])?;
    let (&name_len, rest) = rest.split_first()?;
    let name_len = name_len as usize;
    if rest.len() < name_len + 8 {
        return None;
    }
    let asset = String::from_utf8(rest[..name_len].to_vec()).ok()?;
    let mut amount = [0u8; 8];
    amount.copy_from_slice(&rest[name_len..name_len + 8]);

    Some(AssetTransfer {
        asset,
        amount: u64::from_le_bytes(amount),
        owner_script: ScriptBuf::from(bytes[..prefix_len].to_vec()),
    })
}

/// Provably unspendable `OP_RETURN <data>` script
pub fn memo_script(data: &[u8]) -> EngineResult<ScriptBuf> {
    if data.len() < memo::MIN_LENGTH || data.len() > memo::MAX_LENGTH {
        return Err(EngineError::InvalidMemo {
            length: data.len(),
            min: memo::MIN_LENGTH,
            max: memo::MAX_LENGTH,
        });
    }
    let push = PushBytesBuf::try_from(data.to_vec())
        .map_err(|e| EngineError::encoding(format!("memo payload: {}", e)))?;
    Ok(Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push)
        .into_script())
}

/// Classify an output by its locking script
pub fn classify_output(output: &TxOut) -> OutputKind {
    let script = &output.script_pubkey;
    if let Some(transfer) = parse_asset_transfer(script) {
        return OutputKind::Asset(transfer);
    }
    if script.is_op_return() {
        let data = script
            .instructions()
            .skip(1)
            .find_map(|ins| match ins {
                Ok(Instruction::PushBytes(push)) => Some(push.as_bytes().to_vec()),
                _ => None,
            })
            .unwrap_or_default();
        return OutputKind::Memo(data);
    }
    if script.is_p2pkh() || script.is_p2sh() {
        return OutputKind::Native;
    }
    OutputKind::Unknown
}

fn validate_asset_name(asset: &str) -> EngineResult<()> {
    if asset.is_empty() || asset.len() > params::MAX_ASSET_NAME_LENGTH {
        return Err(EngineError::payment(format!(
            "asset name must be 1..={} bytes, got {}",
            params::MAX_ASSET_NAME_LENGTH,
            asset.len()
        )));
    }
    if !asset.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(EngineError::payment(format!(
            "asset name {:?} contains unsupported characters",
            asset
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainNetwork, KeyPair};

    fn address(byte: u8) -> ChainAddress {
        KeyPair::from_secret_bytes(&[byte; 32], ChainNetwork::Mainnet)
            .unwrap()
            .address(ChainNetwork::Mainnet)
    }

    #[test]
    fn test_asset_script_layout() {
        let owner = address(1).script_pubkey();
        let script = asset_transfer_script(&owner, "TOKEN", 250_000_000).unwrap();
        let bytes = script.as_bytes();

        assert_eq!(&bytes[..25], owner.as_bytes());
        assert_eq!(bytes[25], 0xc0);
        // push length: 4 prefix + 1 length + 5 name + 8 amount
        assert_eq!(bytes[26], 18);
        assert_eq!(&bytes[27..31], b"rvnt");
        assert_eq!(bytes[31], 5);
        assert_eq!(&bytes[32..37], b"TOKEN");
        assert_eq!(&bytes[37..45], &250_000_000u64.to_le_bytes());
        assert_eq!(bytes[45], 0x75);
        assert_eq!(bytes.len(), 46);
    }

    #[test]
    fn test_parse_asset_transfer() {
        let owner = address(2).script_pubkey();
        let script = asset_transfer_script(&owner, "BRIDGE/USD", 42).unwrap();

        let transfer = parse_asset_transfer(&script).unwrap();
        assert_eq!(transfer.asset, "BRIDGE/USD");
        assert_eq!(transfer.amount, 42);
        assert_eq!(transfer.owner_script, owner);
        assert!(parse_asset_transfer(&owner).is_none());
    }

    #[test]
    fn test_asset_name_limits() {
        let owner = address(3).script_pubkey();
        assert!(asset_transfer_script(&owner, "", 1).is_err());
        assert!(asset_transfer_script(&owner, &"A".repeat(33), 1).is_err());
        assert!(asset_transfer_script(&owner, "HAS SPACE", 1).is_err());
        let memo = memo_script(b"hello").unwrap();
        assert!(asset_transfer_script(&memo, "TOKEN", 1).is_err());
    }

    #[test]
    fn test_compile_preserves_order_and_totals() {
        let compiler = OutputCompiler::new();
        let payments = vec![
            Payment::asset(address(4), "TOKEN", 700),
            Payment::native(address(5), 1_000),
            Payment::asset(address(6), "TOKEN", 300),
        ];
        let compiled = compiler.compile(&payments).unwrap();

        assert_eq!(compiled.outputs.len(), 3);
        assert_eq!(compiled.outputs[0].value, Amount::ZERO);
        assert_eq!(compiled.outputs[1].value, Amount::from_sat(1_000));
        assert_eq!(compiled.required(&Denomination::Native), 1_000);
        assert_eq!(
            compiled.required(&Denomination::Asset("TOKEN".to_string())),
            1_000
        );
        assert_eq!(compiled.assets().collect::<Vec<_>>(), vec![("TOKEN", 1_000)]);
        assert!(compiler
            .compile(&[Payment::native(address(5), 0)])
            .is_err());
    }

    #[test]
    fn test_change_output() {
        let compiler = OutputCompiler::new();
        let to = address(7);

        let change = compiler
            .change_output(&Denomination::Native, 5_000, 3_000, 500, &to)
            .unwrap()
            .unwrap();
        assert_eq!(change.value, Amount::from_sat(1_500));

        assert!(compiler
            .change_output(&Denomination::Native, 3_500, 3_000, 500, &to)
            .unwrap()
            .is_none());

        let token = Denomination::Asset("TOKEN".to_string());
        let err = compiler
            .change_output(&token, 10, 11, 0, &to)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientAsset { required: 11, available: 10, .. }));

        let asset_change = compiler.change_output(&token, 20, 11, 0, &to).unwrap().unwrap();
        assert_eq!(parse_asset_transfer(&asset_change.script_pubkey).unwrap().amount, 9);
    }

    #[test]
    fn test_memo_bounds() {
        assert!(matches!(
            memo_script(b"abcd"),
            Err(EngineError::InvalidMemo { length: 4, .. })
        ));
        assert!(memo_script(&[b'x'; 80]).is_err());

        let output = OutputCompiler::new()
            .memo_output(b"0x52908400098527886E0F7030069857D2E4169EE7")
            .unwrap();
        assert_eq!(output.value, Amount::ZERO);
        assert!(output.script_pubkey.is_op_return());
        assert_eq!(
            classify_output(&output),
            OutputKind::Memo(b"0x52908400098527886E0F7030069857D2E4169EE7".to_vec())
        );
    }
}
