//! # rvn-channels: Payments, Channels and Fee Delegation
//!
//! Transaction construction for a Bitcoin-derived chain whose outputs carry
//! either the native coin or a colored asset. The library selects inputs,
//! compiles conditional locking scripts (multisig, CSV/CLTV payment channels,
//! tiered releases), assembles and signs transactions against them, and lets an
//! asset-only holder have a second party pay the network fee.

pub mod chain;
pub mod config;
pub mod delegation;
pub mod error;
pub mod outputs;
pub mod script;
pub mod services;
pub mod store;
pub mod tx;
pub mod utxo;
pub mod wallet;

// Re-export commonly used types
pub use chain::{ChainAddress, ChainNetwork, KeyPair};
pub use delegation::{Completer, DelegationState, DelegationTerms, FeeDelegationEnvelope, Originator};
pub use error::{EngineError, EngineResult};
pub use outputs::{OutputCompiler, Payment};
pub use script::{AbsoluteLock, RelativeLock, ScriptTemplate, SpendBranch, UnlockBuilder};
pub use store::RedeemScriptStore;
pub use tx::{TransactionAssembler, TransactionSigner};
pub use utxo::{FeeModel, UnspentOutput, UtxoSelector};
pub use wallet::{PaymentEngine, PaymentRequest};
