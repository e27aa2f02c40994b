//! # Fee Delegation
//!
//! Lets a holder of only asset outputs pay a network fee through a second
//! party, the completer, without giving the completer any say over the
//! payment itself.
//!
//! ## Phases
//!
//! - **Originate**: the value holder selects asset inputs, compiles every final
//!   output (including the completer's claim and native change) and signs each
//!   input `ANYONECANPAY|ALL`. The partial transaction travels in a
//!   [`FeeDelegationEnvelope`].
//! - **Complete**: the completer checks the envelope, appends its reserved
//!   native output as a new input, signs only that input with the same flag and
//!   broadcasts.
//!
//! `ALL` pins every output, so any change the completer makes to them breaks
//! the originator's signatures. `ANYONECANPAY` leaves the input list open.

pub mod envelope;
pub mod protocol;

#[cfg(test)]
mod tests;

pub use envelope::{BridgeTerms, DelegationState, DelegationTerms, FeeDelegationEnvelope, FeeQuote};
pub use protocol::{Completer, Originator};
