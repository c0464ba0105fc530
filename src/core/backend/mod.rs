//! Backend adapters that apply rules and address sets to the kernel
//!
//! Two interchangeable implementations sit behind [`Backend`]:
//!
//! - [`command::CommandBackend`] renders each rule as an argument list and
//!   runs `iptables`/`ip6tables` (`-I`, `-A`, `-D`).
//! - [`native::NativeBackend`] drives the tables through the `iptables`
//!   crate and can answer existence checks.
//!
//! Both manage address sets through the `ipset` utility ([`ipset`]) and
//! serialize every kernel mutation on a shared [`KernelLock`].

pub mod command;
pub mod ipset;
pub mod native;

use crate::command::CommandRunner;
use crate::config::Settings;
use crate::core::error::Result;
use crate::core::network::Family;
use crate::core::rule::Rule;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, warn};

/// Which backend implementation manages the kernel tables
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    /// The `iptables` crate, with existence checks
    Native,
    /// External `iptables` / `ip6tables` processes
    #[default]
    Command,
}

/// Uniform rule and address-set operations.
///
/// Rules are tagged with the backend's [`owner`](Backend::owner) comment.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Ownership comment attached to every rule this backend writes
    fn owner(&self) -> &str;

    /// Inserts at the head of the chain, retrying transient failures.
    fn insert_rule(&self, family: Family, rule: &Rule) -> Result<()>;

    /// Appends to the tail of the chain, retrying transient failures.
    fn append_rule(&self, family: Family, rule: &Rule) -> Result<()>;

    /// Deletes a rule; returns whether it existed.
    fn remove_rule(&self, family: Family, rule: &Rule) -> bool;

    fn rule_exists(&self, family: Family, rule: &Rule) -> bool;

    fn create_set(&self, name: &str, family: Family) -> Result<()>;

    fn destroy_set(&self, name: &str) -> Result<()>;

    fn add_set_member(&self, name: &str, network: &str) -> Result<()>;
}

/// Serializes mutation of the kernel firewall namespace.
///
/// Every server instance in a process must share one lock; clone it into
/// each backend. Held only while a backend call runs, never across compilation.
#[derive(Debug, Clone, Default)]
pub struct KernelLock(Arc<Mutex<()>>);

impl KernelLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the kernel tables are free.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (), so a poisoned lock is still usable
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Insert/append retry behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.insert_attempts.max(1),
            delay: settings.retry_delay(),
        }
    }

    /// Runs `op` until it succeeds or the attempts are exhausted.
    ///
    /// Every failed attempt but the last is logged; the last error is returned.
    pub(crate) fn run<F>(&self, action: &str, family: Family, rule: &Rule, mut op: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    error!(
                        family = %family,
                        rule = %rule,
                        error = %e,
                        attempt,
                        "Failed to {action} iptables rule, retrying..."
                    );
                }
            }
            attempt += 1;
            std::thread::sleep(self.delay);
        }
    }
}

/// Builds the backend named in `settings`.
///
/// The native binding is used only if it initialises for both families;
/// otherwise this logs a warning and falls back to the command backend.
pub fn select(
    settings: &Settings,
    runner: Arc<dyn CommandRunner>,
    lock: KernelLock,
    owner: String,
) -> Box<dyn Backend> {
    if settings.backend == BackendKind::Native {
        match native::NativeBackend::open(settings, Arc::clone(&runner), lock.clone(), owner.clone())
        {
            Ok(backend) => return Box::new(backend),
            Err(e) => {
                warn!(error = %e, "Native iptables binding unavailable, using command backend");
            }
        }
    }
    Box::new(command::CommandBackend::new(settings, runner, lock, owner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::core::rule::{Chain, Target};
    use std::cell::Cell;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let calls = Cell::new(0);
        let rule = Rule::new(Chain::Input, Target::Accept);
        let result = policy(3).run("insert", Family::Ipv4, &rule, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::Internal("busy".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_exhaustion_returns_last_error() {
        let calls = Cell::new(0);
        let rule = Rule::new(Chain::Input, Target::Accept);
        let result = policy(3).run("append", Family::Ipv6, &rule, || {
            calls.set(calls.get() + 1);
            Err(Error::Internal(format!("attempt {}", calls.get())))
        });
        assert!(matches!(result, Err(Error::Internal(msg)) if msg == "attempt 3"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!("Command".parse::<BackendKind>().unwrap(), BackendKind::Command);
        assert_eq!(BackendKind::default(), BackendKind::Command);
        assert_eq!(BackendKind::Native.to_string(), "native");
    }

    #[test]
    fn test_kernel_lock_is_shared_between_clones() {
        let lock = KernelLock::new();
        let other = lock.clone();
        let guard = lock.acquire();
        assert!(other.0.try_lock().is_err());
        drop(guard);
        assert!(other.0.try_lock().is_ok());
    }
}
