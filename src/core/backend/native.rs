//! Backend over the `iptables` crate
//!
//! Table access goes through [`TableOps`], which mirrors the crate API, so
//! tests can run the backend against an in-memory table model.

use super::ipset::IpsetCommands;
use super::{Backend, BackendKind, KernelLock, RetryPolicy};
use crate::command::CommandRunner;
use crate::config::Settings;
use crate::core::error::{Error, Result};
use crate::core::network::Family;
use crate::core::rule::Rule;
use std::sync::Arc;
use tracing::debug;

type OpResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Rule operations on one address family's tables.
///
/// All methods are synchronous, matching the underlying `iptables` crate.
pub trait TableOps: Send + Sync {
    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> OpResult<()>;
    fn append(&self, table: &str, chain: &str, rule: &str) -> OpResult<()>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> OpResult<bool>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> OpResult<()>;
}

/// Production [`TableOps`] backed by [`iptables::IPTables`]
pub struct IptablesTables {
    inner: iptables::IPTables,
}

impl IptablesTables {
    pub fn new(family: Family) -> Result<Self> {
        let inner = iptables::new(family.is_ipv6()).map_err(|e| Error::Native(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl TableOps for IptablesTables {
    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> OpResult<()> {
        self.inner.insert(table, chain, rule, position)
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> OpResult<()> {
        self.inner.append(table, chain, rule)
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> OpResult<bool> {
        self.inner.exists(table, chain, rule)
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> OpResult<()> {
        self.inner.delete(table, chain, rule)
    }
}

pub struct NativeBackend {
    v4: Box<dyn TableOps>,
    v6: Box<dyn TableOps>,
    ipset: IpsetCommands,
    retry: RetryPolicy,
    lock: KernelLock,
    owner: String,
}

impl NativeBackend {
    /// Opens the kernel tables of both families.
    pub fn open(
        settings: &Settings,
        runner: Arc<dyn CommandRunner>,
        lock: KernelLock,
        owner: String,
    ) -> Result<Self> {
        let v4 = IptablesTables::new(Family::Ipv4)?;
        let v6 = IptablesTables::new(Family::Ipv6)?;
        Ok(Self::with_tables(
            settings,
            Box::new(v4),
            Box::new(v6),
            runner,
            lock,
            owner,
        ))
    }

    pub fn with_tables(
        settings: &Settings,
        v4: Box<dyn TableOps>,
        v6: Box<dyn TableOps>,
        runner: Arc<dyn CommandRunner>,
        lock: KernelLock,
        owner: String,
    ) -> Self {
        Self {
            v4,
            v6,
            ipset: IpsetCommands::new(runner, settings.ipset_cmd.clone()),
            retry: RetryPolicy::from_settings(settings),
            lock,
            owner,
        }
    }

    fn tables(&self, family: Family) -> &dyn TableOps {
        match family {
            Family::Ipv4 => self.v4.as_ref(),
            Family::Ipv6 => self.v6.as_ref(),
        }
    }

    fn rule_string(&self, rule: &Rule) -> String {
        rule.body_args(&self.owner).join(" ")
    }
}

fn native_err(e: &dyn std::error::Error) -> Error {
    Error::Native(e.to_string())
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn insert_rule(&self, family: Family, rule: &Rule) -> Result<()> {
        let spec = self.rule_string(rule);
        let table = rule.table().to_string();
        let chain = rule.chain.to_string();
        let ops = self.tables(family);
        let _guard = self.lock.acquire();
        self.retry.run("insert", family, rule, || {
            ops.insert(&table, &chain, &spec, 1)
                .map_err(|e| native_err(e.as_ref()))
        })
    }

    fn append_rule(&self, family: Family, rule: &Rule) -> Result<()> {
        let spec = self.rule_string(rule);
        let table = rule.table().to_string();
        let chain = rule.chain.to_string();
        let ops = self.tables(family);
        let _guard = self.lock.acquire();
        self.retry.run("append", family, rule, || {
            ops.append(&table, &chain, &spec)
                .map_err(|e| native_err(e.as_ref()))
        })
    }

    fn remove_rule(&self, family: Family, rule: &Rule) -> bool {
        let spec = self.rule_string(rule);
        let _guard = self.lock.acquire();
        match self
            .tables(family)
            .delete(rule.table().as_ref(), rule.chain.as_ref(), &spec)
        {
            Ok(()) => true,
            Err(e) => {
                debug!(family = %family, rule = %rule, error = %e, "Rule was not present");
                false
            }
        }
    }

    fn rule_exists(&self, family: Family, rule: &Rule) -> bool {
        let spec = self.rule_string(rule);
        let _guard = self.lock.acquire();
        match self
            .tables(family)
            .exists(rule.table().as_ref(), rule.chain.as_ref(), &spec)
        {
            Ok(found) => found,
            Err(e) => {
                // Unknown counts as missing so reconciliation repairs it
                debug!(family = %family, rule = %rule, error = %e, "Existence check failed");
                false
            }
        }
    }

    fn create_set(&self, name: &str, family: Family) -> Result<()> {
        let _guard = self.lock.acquire();
        self.ipset.create(name, family)
    }

    fn destroy_set(&self, name: &str) -> Result<()> {
        let _guard = self.lock.acquire();
        self.ipset.destroy(name)
    }

    fn add_set_member(&self, name: &str, network: &str) -> Result<()> {
        let _guard = self.lock.acquire();
        self.ipset.add(name, network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{Chain, Target};
    use crate::core::test_helpers::{MemoryTables, RecordingRunner};

    fn backend(v4: &MemoryTables, v6: &MemoryTables) -> NativeBackend {
        NativeBackend::with_tables(
            &Settings::default(),
            Box::new(v4.clone()),
            Box::new(v6.clone()),
            Arc::new(RecordingRunner::new()),
            KernelLock::new(),
            "pritunl-abc".to_string(),
        )
    }

    #[test]
    fn test_nat_chains_use_nat_table() {
        let (v4, v6) = (MemoryTables::new(), MemoryTables::new());
        let backend = backend(&v4, &v6);
        let rule = Rule::new(
            Chain::Prerouting,
            Target::Netmap {
                to: "10.8.0.0/24".into(),
            },
        )
        .in_interface("tun0")
        .destination("172.16.0.0/24");

        backend.insert_rule(Family::Ipv4, &rule).unwrap();
        let rules = v4.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].0, "nat");
        assert_eq!(rules[0].1, "PREROUTING");
        assert!(rules[0].2.ends_with("--comment pritunl-abc"));
        assert!(v6.rules().is_empty());
    }

    #[test]
    fn test_exists_and_remove_round_trip() {
        let (v4, v6) = (MemoryTables::new(), MemoryTables::new());
        let backend = backend(&v4, &v6);
        let rule = Rule::new(Chain::Forward, Target::Drop).out_interface("tun0");

        assert!(!backend.rule_exists(Family::Ipv6, &rule));
        backend.append_rule(Family::Ipv6, &rule).unwrap();
        assert!(backend.rule_exists(Family::Ipv6, &rule));
        assert!(!backend.rule_exists(Family::Ipv4, &rule));

        assert!(backend.remove_rule(Family::Ipv6, &rule));
        assert!(!backend.remove_rule(Family::Ipv6, &rule));
        assert!(v6.rules().is_empty());
    }

    #[test]
    fn test_insert_retries_then_fails() {
        let (v4, v6) = (MemoryTables::new(), MemoryTables::new());
        v4.fail_next_writes(5);
        let settings = Settings {
            retry_delay_ms: 1,
            ..Settings::default()
        };
        let backend = NativeBackend::with_tables(
            &settings,
            Box::new(v4.clone()),
            Box::new(v6),
            Arc::new(RecordingRunner::new()),
            KernelLock::new(),
            "pritunl-abc".to_string(),
        );

        let rule = Rule::new(Chain::Input, Target::Accept);
        assert!(matches!(
            backend.insert_rule(Family::Ipv4, &rule),
            Err(Error::Native(_))
        ));
        assert_eq!(v4.write_attempts(), 3);
    }
}
