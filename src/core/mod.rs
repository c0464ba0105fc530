//! Core rule-generation and reconciliation engine
//!
//! - [`firewall`]: Per-server engine (ledger mutators, generate, reconcile, teardown)
//! - [`ledger`]: Declarative network model of one server
//! - [`compiler`]: Ledger → ordered rule bands per family
//! - [`sets`]: Address-set derivation and synchronization
//! - [`backend`]: Command and native backends behind one trait
//! - [`rule`]: Structured rule specification and argument rendering
//! - [`topology`]: Server identity and topology
//! - [`network`]: Address families and CIDR helpers
//! - [`profiles`]: Server profile files
//! - [`error`]: Error types for engine operations

pub mod backend;
pub mod compiler;
pub mod error;
pub mod firewall;
pub mod ledger;
pub mod network;
pub mod profiles;
pub mod rule;
pub mod sets;
pub mod topology;

#[cfg(test)]
pub mod test_helpers;
