//! Transaction assembly, signing and wire encoding.

pub mod builder;
pub mod codec;
pub mod signer;

pub use builder::{InputKind, SpendInput, TemplateSpend, TransactionAssembler, UnsignedTransaction};
pub use signer::{verify_spend, SignatureShare, TransactionSigner};
