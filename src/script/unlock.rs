//! Unlocking scripts for template branches.
//!
//! Layout of a P2SH unlock, bottom of the stack first:
//!
//! ```text
//! [OP_0]            dummy element, multisig branches only
//! <sig> ...         in the order their keys appear in the redeem script
//! <selector> ...    innermost IF first, so the outermost IF pops first
//! <redeem script>
//! ```

use super::template::{BranchPath, ScriptTemplate, SpendBranch};
use super::push_data;
use crate::error::{EngineError, EngineResult};
use crate::tx::signer::SignatureShare;
use bitcoin::{script::Builder, Script, ScriptBuf};

/// Builds the unlocking script for one branch of one template
#[derive(Debug, Clone)]
pub struct UnlockBuilder {
    redeem_script: ScriptBuf,
    branch: SpendBranch,
    path: BranchPath,
}

impl UnlockBuilder {
    pub fn new(template: &ScriptTemplate, branch: SpendBranch) -> EngineResult<Self> {
        Ok(Self {
            redeem_script: template.compile()?,
            branch,
            path: template.branch_path(branch)?,
        })
    }

    pub fn redeem_script(&self) -> &Script {
        &self.redeem_script
    }

    pub fn branch(&self) -> SpendBranch {
        self.branch
    }

    pub fn path(&self) -> &BranchPath {
        &self.path
    }

    /// Lay out serialized signatures exactly as given.
    ///
    /// No reordering or counting happens here; a wrong order or a short set
    /// simply fails evaluation. Use [`UnlockBuilder::from_shares`] to combine
    /// shares from several signers.
    pub fn build(&self, signatures: &[Vec<u8>]) -> EngineResult<ScriptBuf> {
        let mut builder = Builder::new();
        if self.path.multisig {
            builder = builder.push_int(0);
        }
        for signature in signatures {
            builder = builder.push_slice(push_data(signature)?);
        }
        for selector in self.path.selectors.iter().rev() {
            builder = builder.push_int(i64::from(*selector));
        }
        Ok(builder
            .push_slice(push_data(self.redeem_script.as_bytes())?)
            .into_script())
    }

    /// Combine detached shares, ordered by the position of their key in the
    /// redeem script
    pub fn from_shares(&self, shares: &[SignatureShare]) -> EngineResult<ScriptBuf> {
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.path.keys.len()];
        for share in shares {
            let position = self
                .path
                .keys
                .iter()
                .position(|key| *key == share.public_key)
                .ok_or_else(|| {
                    EngineError::signing(format!(
                        "{} does not sign the {:?} branch",
                        share.public_key, self.branch
                    ))
                })?;
            if slots[position].is_some() {
                return Err(EngineError::signing(format!(
                    "duplicate share from {}",
                    share.public_key
                )));
            }
            slots[position] = Some(share.signature.to_vec());
        }

        let ordered: Vec<Vec<u8>> = slots
            .into_iter()
            .flatten()
            .take(self.path.required)
            .collect();
        if ordered.len() < self.path.required {
            return Err(EngineError::signing(format!(
                "{:?} branch needs {} signature(s), got {}",
                self.branch,
                self.path.required,
                ordered.len()
            )));
        }
        self.build(&ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainNetwork, KeyPair};
    use crate::script::locktime::RelativeLock;
    use bitcoin::script::Instruction;

    fn key(byte: u8) -> KeyPair {
        KeyPair::from_secret_bytes(&[byte; 32], ChainNetwork::Mainnet).unwrap()
    }

    fn pushes(script: &Script) -> Vec<Vec<u8>> {
        script
            .instructions()
            .map(|ins| match ins.unwrap() {
                Instruction::PushBytes(push) => push.as_bytes().to_vec(),
                Instruction::Op(op) => vec![op.to_u8()],
            })
            .collect()
    }

    #[test]
    fn test_reclaim_layout() {
        let template = ScriptTemplate::renewable_channel(
            *key(1).public_key(),
            *key(2).public_key(),
            RelativeLock::blocks(10).unwrap(),
        )
        .unwrap();
        let unlock = UnlockBuilder::new(&template, SpendBranch::Reclaim).unwrap();
        let script = unlock.build(&[b"sig".to_vec()]).unwrap();

        let items = pushes(&script);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], b"sig".to_vec());
        assert!(items[1].is_empty());
        assert_eq!(items[2], template.compile().unwrap().to_bytes());
    }

    #[test]
    fn test_cooperative_layout_has_dummy_and_true() {
        let template = ScriptTemplate::renewable_channel(
            *key(1).public_key(),
            *key(2).public_key(),
            RelativeLock::blocks(10).unwrap(),
        )
        .unwrap();
        let unlock = UnlockBuilder::new(&template, SpendBranch::Cooperative).unwrap();
        let script = unlock.build(&[b"s1".to_vec(), b"s2".to_vec()]).unwrap();

        let items = pushes(&script);
        assert!(items[0].is_empty());
        assert_eq!(items[1], b"s1".to_vec());
        assert_eq!(items[2], b"s2".to_vec());
        // OP_1 selector
        assert_eq!(items[3], vec![0x51]);
    }

    #[test]
    fn test_selectors_push_innermost_first() {
        let template = ScriptTemplate::tiered_release(
            *key(1).public_key(),
            vec![*key(2).public_key(), *key(3).public_key()],
            vec![
                crate::script::locktime::AbsoluteLock::Height(100),
                crate::script::locktime::AbsoluteLock::Height(200),
            ],
        )
        .unwrap();
        // Tier 0: outer IF false, inner IF true
        let unlock = UnlockBuilder::new(&template, SpendBranch::Delayed(0)).unwrap();
        let items = pushes(&unlock.build(&[b"sig".to_vec()]).unwrap());
        assert_eq!(items[1], vec![0x51]);
        assert!(items[2].is_empty());
    }
}
