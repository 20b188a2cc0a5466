//! Refseal Verify - The verification engine
//!
//! Decides whether recorded reference state transitions were authorized
//! under the applicable policy, and aggregates verdicts across linked
//! repositories.

pub mod engine;
pub mod network;
pub mod verdict;

pub use engine::VerificationEngine;
pub use network::{verify_network, NetworkOptions};
pub use verdict::{MemberVerdict, NetworkVerdict, SatisfiedRule, Verdict};
