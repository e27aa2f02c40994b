//! # Script Templates
//!
//! Every conditional locking script this engine produces is one variant of
//! [`ScriptTemplate`]. Compilation is a pure function of the parameters: the
//! same template always yields the byte-identical redeem script, which is what
//! gets hashed into the funding P2SH address.
//!
//! Branch layout is also owned here ([`ScriptTemplate::branch_path`]) so the
//! unlock side can never disagree with the script it unlocks.
//!
//! ## Opcode sequences
//!
//! ```text
//! BasicMultisig        m <k1> .. <kn> n CHECKMULTISIG
//! RenewableChannel     IF 2 <sender> <receiver> 2 CHECKMULTISIG
//!                      ELSE <rel> CHECKSEQUENCEVERIFY DROP <sender> CHECKSIG ENDIF
//! ExpiringChannel      IF 2 <sender> <receiver> 2 CHECKMULTISIG
//!                      ELSE <abs> CHECKLOCKTIMEVERIFY DROP <sender> CHECKSIG ENDIF
//! TieredRelease        IF <tk> CLTV DROP <dk> CHECKSIG
//!                      ELSE IF <tk-1> ... ELSE <immediate> CHECKSIG ENDIF .. ENDIF
//! HybridMultisigTiered IF <t2> CLTV DROP <d2> CHECKSIG
//!                      ELSE IF <t1> CLTV DROP <d1> CHECKSIG
//!                      ELSE IF 5 <c1> .. <c5> 5 CHECKMULTISIG
//!                      ELSE <immediate> CHECKSIG ENDIF ENDIF ENDIF
//! ```

use super::locktime::{ensure_strictly_increasing, AbsoluteLock, RelativeLock};
use crate::chain::{require_compressed, ChainAddress, ChainNetwork};
use crate::config::chain::MAX_REDEEM_SCRIPT_SIZE;
use crate::error::{EngineError, EngineResult};
use bitcoin::{
    opcodes::all::*,
    script::Builder,
    PublicKey, ScriptBuf,
};
use serde::{Deserialize, Serialize};

/// Most keys a bare CHECKMULTISIG may reference
pub const MAX_MULTISIG_KEYS: usize = 20;

/// Delayed tiers a [`ScriptTemplate::TieredRelease`] supports
pub const MAX_RELEASE_TIERS: usize = 3;

/// Co-signers in a [`ScriptTemplate::HybridMultisigTiered`] early-release branch
pub const HYBRID_COSIGNERS: usize = 5;

/// Delayed tiers in a [`ScriptTemplate::HybridMultisigTiered`]
pub const HYBRID_TIERS: usize = 2;

/// A closed set of spending conditions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "template", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ScriptTemplate {
    /// m-of-n over the keys in the given order
    BasicMultisig { pubkeys: Vec<PublicKey>, m: usize },
    /// Cooperative 2-of-2, or sender alone after a relative delay since funding
    RenewableChannel {
        sender: PublicKey,
        receiver: PublicKey,
        relative_lock: RelativeLock,
    },
    /// Cooperative 2-of-2, or sender alone after a fixed expiry
    ExpiringChannel {
        sender: PublicKey,
        receiver: PublicKey,
        absolute_lock: AbsoluteLock,
    },
    /// Immediate key, plus delayed keys that each unlock at their own locktime
    TieredRelease {
        immediate_key: PublicKey,
        delayed_keys: Vec<PublicKey>,
        locktimes: Vec<AbsoluteLock>,
    },
    /// Two delayed tiers above a 5-of-5 co-signer branch or the immediate key
    HybridMultisigTiered {
        immediate_key: PublicKey,
        multisig_keys: Vec<PublicKey>,
        delayed_keys: Vec<PublicKey>,
        locktimes: Vec<AbsoluteLock>,
    },
}

/// The branch of a template being spent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpendBranch {
    /// The whole of a [`ScriptTemplate::BasicMultisig`]
    Multisig,
    /// A channel's 2-of-2 branch
    Cooperative,
    /// A channel's sender-only branch after its lock
    Reclaim,
    /// Delayed tier `n`, counted from 0 in ascending locktime order
    Delayed(usize),
    /// The immediate key of a tiered template
    Immediate,
    /// The 5-of-5 co-signer branch of a hybrid template
    CoSigned,
}

/// Everything needed to satisfy one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPath {
    /// IF selectors, outermost first
    pub selectors: Vec<bool>,
    /// Keys the branch checks, in script order
    pub keys: Vec<PublicKey>,
    /// Signatures required; more than one means CHECKMULTISIG
    pub required: usize,
    pub multisig: bool,
    pub relative_lock: Option<RelativeLock>,
    pub absolute_lock: Option<AbsoluteLock>,
}

impl BranchPath {
    fn single(selectors: Vec<bool>, key: PublicKey) -> Self {
        Self {
            selectors,
            keys: vec![key],
            required: 1,
            multisig: false,
            relative_lock: None,
            absolute_lock: None,
        }
    }

    fn multisig(selectors: Vec<bool>, keys: Vec<PublicKey>, required: usize) -> Self {
        Self {
            selectors,
            keys,
            required,
            multisig: true,
            relative_lock: None,
            absolute_lock: None,
        }
    }
}

impl ScriptTemplate {
    pub fn basic_multisig(m: usize, pubkeys: Vec<PublicKey>) -> EngineResult<Self> {
        let template = ScriptTemplate::BasicMultisig { pubkeys, m };
        template.validate()?;
        Ok(template)
    }

    pub fn renewable_channel(
        sender: PublicKey,
        receiver: PublicKey,
        relative_lock: RelativeLock,
    ) -> EngineResult<Self> {
        let template = ScriptTemplate::RenewableChannel {
            sender,
            receiver,
            relative_lock,
        };
        template.validate()?;
        Ok(template)
    }

    pub fn expiring_channel(
        sender: PublicKey,
        receiver: PublicKey,
        absolute_lock: AbsoluteLock,
    ) -> EngineResult<Self> {
        let template = ScriptTemplate::ExpiringChannel {
            sender,
            receiver,
            absolute_lock,
        };
        template.validate()?;
        Ok(template)
    }

    /// `delayed_keys[i]` unlocks at `locktimes[i]`; locktimes must strictly increase
    pub fn tiered_release(
        immediate_key: PublicKey,
        delayed_keys: Vec<PublicKey>,
        locktimes: Vec<AbsoluteLock>,
    ) -> EngineResult<Self> {
        let template = ScriptTemplate::TieredRelease {
            immediate_key,
            delayed_keys,
            locktimes,
        };
        template.validate()?;
        Ok(template)
    }

    pub fn hybrid_multisig_tiered(
        immediate_key: PublicKey,
        multisig_keys: Vec<PublicKey>,
        delayed_keys: Vec<PublicKey>,
        locktimes: Vec<AbsoluteLock>,
    ) -> EngineResult<Self> {
        let template = ScriptTemplate::HybridMultisigTiered {
            immediate_key,
            multisig_keys,
            delayed_keys,
            locktimes,
        };
        template.validate()?;
        Ok(template)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScriptTemplate::BasicMultisig { .. } => "basicMultisig",
            ScriptTemplate::RenewableChannel { .. } => "renewableChannel",
            ScriptTemplate::ExpiringChannel { .. } => "expiringChannel",
            ScriptTemplate::TieredRelease { .. } => "tieredRelease",
            ScriptTemplate::HybridMultisigTiered { .. } => "hybridMultisigTiered",
        }
    }

    /// Check parameters without building the script.
    ///
    /// Constructors call this, and so does [`ScriptTemplate::compile`] since a
    /// deserialized template never went through a constructor.
    pub fn validate(&self) -> EngineResult<()> {
        for key in self.keys() {
            require_compressed(key)?;
        }
        match self {
            ScriptTemplate::BasicMultisig { pubkeys, m } => {
                let n = pubkeys.len();
                if n == 0 || n > MAX_MULTISIG_KEYS {
                    return Err(EngineError::template(format!(
                        "multisig needs 1..={} keys, got {}",
                        MAX_MULTISIG_KEYS, n
                    )));
                }
                if *m == 0 || *m > n {
                    return Err(EngineError::template(format!(
                        "threshold must satisfy 1 <= m <= n, got m={} n={}",
                        m, n
                    )));
                }
            }
            ScriptTemplate::RenewableChannel {
                sender,
                receiver,
                relative_lock,
            } => {
                distinct_parties(sender, receiver)?;
                relative_lock.validate()?;
            }
            ScriptTemplate::ExpiringChannel {
                sender,
                receiver,
                absolute_lock,
            } => {
                distinct_parties(sender, receiver)?;
                absolute_lock.validate()?;
            }
            ScriptTemplate::TieredRelease {
                delayed_keys,
                locktimes,
                ..
            } => {
                if delayed_keys.is_empty() || delayed_keys.len() > MAX_RELEASE_TIERS {
                    return Err(EngineError::template(format!(
                        "tiered release supports 1..={} delayed tiers, got {}",
                        MAX_RELEASE_TIERS,
                        delayed_keys.len()
                    )));
                }
                tiers_match(delayed_keys, locktimes)?;
                ensure_strictly_increasing(locktimes)?;
            }
            ScriptTemplate::HybridMultisigTiered {
                multisig_keys,
                delayed_keys,
                locktimes,
                ..
            } => {
                if multisig_keys.len() != HYBRID_COSIGNERS {
                    return Err(EngineError::template(format!(
                        "hybrid template needs exactly {} co-signer keys, got {}",
                        HYBRID_COSIGNERS,
                        multisig_keys.len()
                    )));
                }
                if delayed_keys.len() != HYBRID_TIERS {
                    return Err(EngineError::template(format!(
                        "hybrid template needs exactly {} delayed keys, got {}",
                        HYBRID_TIERS,
                        delayed_keys.len()
                    )));
                }
                tiers_match(delayed_keys, locktimes)?;
                ensure_strictly_increasing(locktimes)?;
            }
        }
        Ok(())
    }

    /// Compile to the redeem script
    pub fn compile(&self) -> EngineResult<ScriptBuf> {
        self.validate()?;

        let script = match self {
            ScriptTemplate::BasicMultisig { pubkeys, m } => {
                push_multisig(Builder::new(), *m, pubkeys).into_script()
            }
            ScriptTemplate::RenewableChannel {
                sender,
                receiver,
                relative_lock,
            } => {
                let builder = Builder::new().push_opcode(OP_IF);
                push_multisig(builder, 2, &[*sender, *receiver])
                    .push_opcode(OP_ELSE)
                    .push_int(relative_lock.to_consensus_u32() as i64)
                    .push_opcode(OP_CSV)
                    .push_opcode(OP_DROP)
                    .push_key(sender)
                    .push_opcode(OP_CHECKSIG)
                    .push_opcode(OP_ENDIF)
                    .into_script()
            }
            ScriptTemplate::ExpiringChannel {
                sender,
                receiver,
                absolute_lock,
            } => {
                let builder = Builder::new().push_opcode(OP_IF);
                push_multisig(builder, 2, &[*sender, *receiver])
                    .push_opcode(OP_ELSE)
                    .push_int(absolute_lock.to_consensus_u32() as i64)
                    .push_opcode(OP_CLTV)
                    .push_opcode(OP_DROP)
                    .push_key(sender)
                    .push_opcode(OP_CHECKSIG)
                    .push_opcode(OP_ENDIF)
                    .into_script()
            }
            ScriptTemplate::TieredRelease {
                immediate_key,
                delayed_keys,
                locktimes,
            } => {
                let builder = push_tier_ladder(Builder::new(), delayed_keys, locktimes);
                let builder = builder.push_key(immediate_key).push_opcode(OP_CHECKSIG);
                close_ladder(builder, delayed_keys.len()).into_script()
            }
            ScriptTemplate::HybridMultisigTiered {
                immediate_key,
                multisig_keys,
                delayed_keys,
                locktimes,
            } => {
                let builder = push_tier_ladder(Builder::new(), delayed_keys, locktimes)
                    .push_opcode(OP_IF);
                let builder = push_multisig(builder, multisig_keys.len(), multisig_keys)
                    .push_opcode(OP_ELSE)
                    .push_key(immediate_key)
                    .push_opcode(OP_CHECKSIG)
                    .push_opcode(OP_ENDIF);
                close_ladder(builder, delayed_keys.len()).into_script()
            }
        };

        if script.len() > MAX_REDEEM_SCRIPT_SIZE {
            return Err(EngineError::ScriptTooLarge {
                size: script.len(),
                max: MAX_REDEEM_SCRIPT_SIZE,
            });
        }
        Ok(script)
    }

    /// The P2SH locking script funding outputs pay to
    pub fn script_pubkey(&self) -> EngineResult<ScriptBuf> {
        Ok(ScriptBuf::new_p2sh(&self.compile()?.script_hash()))
    }

    pub fn p2sh_address(&self, network: ChainNetwork) -> EngineResult<ChainAddress> {
        Ok(ChainAddress::p2sh(&self.compile()?, network))
    }

    /// Selectors, keys and locks for spending `branch`
    pub fn branch_path(&self, branch: SpendBranch) -> EngineResult<BranchPath> {
        let unsupported = || {
            EngineError::template(format!("{} has no {:?} branch", self.name(), branch))
        };
        match (self, branch) {
            (ScriptTemplate::BasicMultisig { pubkeys, m }, SpendBranch::Multisig) => {
                Ok(BranchPath::multisig(Vec::new(), pubkeys.clone(), *m))
            }
            (
                ScriptTemplate::RenewableChannel {
                    sender, receiver, ..
                }
                | ScriptTemplate::ExpiringChannel {
                    sender, receiver, ..
                },
                SpendBranch::Cooperative,
            ) => Ok(BranchPath::multisig(vec![true], vec![*sender, *receiver], 2)),
            (
                ScriptTemplate::RenewableChannel {
                    sender,
                    relative_lock,
                    ..
                },
                SpendBranch::Reclaim,
            ) => Ok(BranchPath {
                relative_lock: Some(*relative_lock),
                ..BranchPath::single(vec![false], *sender)
            }),
            (
                ScriptTemplate::ExpiringChannel {
                    sender,
                    absolute_lock,
                    ..
                },
                SpendBranch::Reclaim,
            ) => Ok(BranchPath {
                absolute_lock: Some(*absolute_lock),
                ..BranchPath::single(vec![false], *sender)
            }),
            (
                ScriptTemplate::TieredRelease {
                    delayed_keys,
                    locktimes,
                    ..
                }
                | ScriptTemplate::HybridMultisigTiered {
                    delayed_keys,
                    locktimes,
                    ..
                },
                SpendBranch::Delayed(tier),
            ) => {
                let key = delayed_keys.get(tier).ok_or_else(unsupported)?;
                let lock = locktimes.get(tier).ok_or_else(unsupported)?;
                Ok(BranchPath {
                    absolute_lock: Some(*lock),
                    ..BranchPath::single(tier_selectors(delayed_keys.len(), Some(tier)), *key)
                })
            }
            (
                ScriptTemplate::TieredRelease {
                    immediate_key,
                    delayed_keys,
                    ..
                },
                SpendBranch::Immediate,
            ) => Ok(BranchPath::single(
                tier_selectors(delayed_keys.len(), None),
                *immediate_key,
            )),
            (
                ScriptTemplate::HybridMultisigTiered {
                    immediate_key,
                    delayed_keys,
                    ..
                },
                SpendBranch::Immediate,
            ) => {
                let mut selectors = tier_selectors(delayed_keys.len(), None);
                selectors.push(false);
                Ok(BranchPath::single(selectors, *immediate_key))
            }
            (
                ScriptTemplate::HybridMultisigTiered {
                    multisig_keys,
                    delayed_keys,
                    ..
                },
                SpendBranch::CoSigned,
            ) => {
                let mut selectors = tier_selectors(delayed_keys.len(), None);
                selectors.push(true);
                Ok(BranchPath::multisig(
                    selectors,
                    multisig_keys.clone(),
                    multisig_keys.len(),
                ))
            }
            _ => Err(unsupported()),
        }
    }

    /// Every branch this template offers
    pub fn branches(&self) -> Vec<SpendBranch> {
        match self {
            ScriptTemplate::BasicMultisig { .. } => vec![SpendBranch::Multisig],
            ScriptTemplate::RenewableChannel { .. } | ScriptTemplate::ExpiringChannel { .. } => {
                vec![SpendBranch::Cooperative, SpendBranch::Reclaim]
            }
            ScriptTemplate::TieredRelease { delayed_keys, .. } => {
                let mut branches: Vec<_> =
                    (0..delayed_keys.len()).map(SpendBranch::Delayed).collect();
                branches.push(SpendBranch::Immediate);
                branches
            }
            ScriptTemplate::HybridMultisigTiered { delayed_keys, .. } => {
                let mut branches: Vec<_> =
                    (0..delayed_keys.len()).map(SpendBranch::Delayed).collect();
                branches.push(SpendBranch::CoSigned);
                branches.push(SpendBranch::Immediate);
                branches
            }
        }
    }

    fn keys(&self) -> Vec<&PublicKey> {
        match self {
            ScriptTemplate::BasicMultisig { pubkeys, .. } => pubkeys.iter().collect(),
            ScriptTemplate::RenewableChannel {
                sender, receiver, ..
            }
            | ScriptTemplate::ExpiringChannel {
                sender, receiver, ..
            } => vec![sender, receiver],
            ScriptTemplate::TieredRelease {
                immediate_key,
                delayed_keys,
                ..
            } => std::iter::once(immediate_key).chain(delayed_keys).collect(),
            ScriptTemplate::HybridMultisigTiered {
                immediate_key,
                multisig_keys,
                delayed_keys,
                ..
            } => std::iter::once(immediate_key)
                .chain(multisig_keys)
                .chain(delayed_keys)
                .collect(),
        }
    }
}

fn distinct_parties(sender: &PublicKey, receiver: &PublicKey) -> EngineResult<()> {
    if sender == receiver {
        return Err(EngineError::template("sender and receiver must differ"));
    }
    Ok(())
}

fn tiers_match(delayed_keys: &[PublicKey], locktimes: &[AbsoluteLock]) -> EngineResult<()> {
    if delayed_keys.len() != locktimes.len() {
        return Err(EngineError::template(format!(
            "{} delayed keys but {} locktimes",
            delayed_keys.len(),
            locktimes.len()
        )));
    }
    Ok(())
}

fn push_multisig(builder: Builder, m: usize, keys: &[PublicKey]) -> Builder {
    let builder = keys
        .iter()
        .fold(builder.push_int(m as i64), |b, key| b.push_key(key));
    builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
}

/// Opens one IF per delayed tier, most distant locktime first, leaving the
/// builder inside the innermost ELSE
fn push_tier_ladder(builder: Builder, keys: &[PublicKey], locktimes: &[AbsoluteLock]) -> Builder {
    keys.iter()
        .zip(locktimes)
        .rev()
        .fold(builder, |b, (key, lock)| {
            b.push_opcode(OP_IF)
                .push_int(lock.to_consensus_u32() as i64)
                .push_opcode(OP_CLTV)
                .push_opcode(OP_DROP)
                .push_key(key)
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ELSE)
        })
}

fn close_ladder(builder: Builder, depth: usize) -> Builder {
    (0..depth).fold(builder, |b, _| b.push_opcode(OP_ENDIF))
}

/// Selectors reaching delayed tier `target` (or falling through all tiers),
/// outermost first. The outermost IF guards the highest tier.
fn tier_selectors(tiers: usize, target: Option<usize>) -> Vec<bool> {
    match target {
        Some(tier) => {
            let mut selectors = vec![false; tiers - 1 - tier];
            selectors.push(true);
            selectors
        }
        None => vec![false; tiers],
    }
}
