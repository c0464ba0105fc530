//! vpnfw - per-server VPN firewall engine
//!
//! Translates the network topology of a VPN server into iptables rules and
//! ipset address sets, keeps them converged with the kernel and removes them
//! when the server stops.
//!
//! # Architecture
//!
//! - [`core`] - Ledger, rule compiler, address sets, backends and the engine
//! - [`command`] - Command runner capability used for every external tool
//! - [`config`] - Static settings snapshot
//! - [`validators`] - Input validation and sanitization
//! - [`audit`] - Audit logging for privileged CLI operations
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Every rule carries an ownership comment for selective teardown
//! - Kernel mutations from all servers in a process are serialized
//! - Networks, interface names and set names are validated before use
//! - Teardown is one-shot and freezes the engine

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod audit;
pub mod command;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::backend::{Backend, BackendKind, KernelLock};
pub use core::error::{Error, Result};
pub use core::firewall::ServerFirewall;
pub use core::rule::{Chain, Rule, Target};
pub use core::topology::{ServerIdentity, ServerTopology};
