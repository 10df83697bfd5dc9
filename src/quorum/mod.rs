//! Voting membership: peer definitions, quorum verifiers and per-proposal
//! ack aggregation.

mod peers;
mod tracker;
mod verifier;

pub use peers::*;
pub use tracker::*;
pub use verifier::*;

#[cfg(test)]
mod verifier_test;
