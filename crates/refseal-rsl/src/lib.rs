//! Refseal RSL - The reference state log
//!
//! An append-only, hash-chained record of every state transition of every
//! protected reference, with propagation between linked repositories.

pub mod entry;
pub mod log;
pub mod propagate;

pub use entry::RslEntry;
pub use log::{RecordOptions, ReferenceStateLog};
pub use propagate::{propagate, propagate_from, PropagateOptions, PropagationSummary};
