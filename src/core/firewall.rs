//! Per-server firewall engine
//!
//! A [`ServerFirewall`] owns the network ledger of one VPN server, compiles it,
//! keeps the kernel converged with the compiled rules and finally tears
//! everything down exactly once.
//!
//! # Lifecycle
//!
//! ```text
//! add_* ──► generate ──► upsert_rules (periodic) ──► clear_rules
//!   ▲           │                                        │
//!   └───────────┘                                        ▼
//!                                                     cleared
//! ```
//!
//! Once cleared, every operation is a silent no-op.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vpnfw::command::SystemRunner;
//! use vpnfw::config::Settings;
//! use vpnfw::core::backend::KernelLock;
//! use vpnfw::core::firewall::ServerFirewall;
//! use vpnfw::core::topology::{ServerIdentity, ServerTopology};
//!
//! let firewall = ServerFirewall::new(
//!     ServerIdentity::new("5f2a9c", "srv")?,
//!     ServerTopology::new("tun0", "10.8.0.0/24", "10.8.0.1"),
//!     &Settings::default(),
//!     KernelLock::new(),
//!     Arc::new(SystemRunner),
//! )?;
//! firewall.add_route("10.0.0.0/8", false, None)?;
//! firewall.add_nat_network("10.8.0.0/24")?;
//! firewall.generate()?;
//! firewall.upsert_rules(false)?;
//! // ...
//! firewall.clear_rules()?;
//! # Ok::<(), vpnfw::Error>(())
//! ```

use crate::command::CommandRunner;
use crate::config::Settings;
use crate::core::backend::{self, Backend, BackendKind, KernelLock};
use crate::core::compiler::{self, Band, RuleSet};
use crate::core::error::Result;
use crate::core::ledger::NetworkLedger;
use crate::core::network::Family;
use crate::core::rule::Rule;
use crate::core::sets::{self, AddressSet, SetNames};
use crate::core::topology::{ServerIdentity, ServerTopology};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Mutable state guarded by the per-instance lock
#[derive(Debug, Default)]
struct State {
    ledger: NetworkLedger,
    /// `None` until the first successful generate
    compiled: Option<RuleSet>,
    sets: Vec<AddressSet>,
    adhoc: Vec<Rule>,
    adhoc6: Vec<Rule>,
    /// Every compiled rule ever written, across regenerations
    installed: Vec<(Family, Rule)>,
}

impl State {
    fn adhoc_mut(&mut self, family: Family) -> &mut Vec<Rule> {
        match family {
            Family::Ipv4 => &mut self.adhoc,
            Family::Ipv6 => &mut self.adhoc6,
        }
    }
}

pub struct ServerFirewall {
    identity: ServerIdentity,
    topology: ServerTopology,
    ipv6: bool,
    names: SetNames,
    backend: Box<dyn Backend>,
    cleared: AtomicBool,
    state: Mutex<State>,
}

impl ServerFirewall {
    /// Creates the engine with the backend chosen by `settings`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the identity or topology is invalid.
    pub fn new(
        identity: ServerIdentity,
        topology: ServerTopology,
        settings: &Settings,
        lock: KernelLock,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        identity.validate()?;
        let owner = identity.owner_tag(&settings.owner_prefix);
        let backend = backend::select(settings, runner, lock, owner);
        Self::with_backend(identity, topology, settings, backend)
    }

    /// Creates the engine over an already constructed backend.
    pub fn with_backend(
        identity: ServerIdentity,
        topology: ServerTopology,
        settings: &Settings,
        backend: Box<dyn Backend>,
    ) -> Result<Self> {
        identity.validate()?;
        topology.validate()?;

        let ipv6 = topology.ipv6 && settings.ipv6;
        info!(
            server_id = %identity.server_id,
            backend = %backend.kind(),
            ipv6,
            "Firewall engine created"
        );

        Ok(Self {
            names: SetNames::new(&identity),
            identity,
            topology,
            ipv6,
            backend,
            cleared: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        // Every mutation leaves State structurally valid, so recover from poison
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the instance lock unless the engine has been cleared.
    fn active_state(&self) -> Option<MutexGuard<'_, State>> {
        if self.is_cleared() {
            return None;
        }
        let state = self.lock_state();
        // clear_rules may have won the race for the lock
        if self.is_cleared() {
            return None;
        }
        Some(state)
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }

    pub fn accept_all(&self) -> bool {
        self.lock_state().ledger.accept_all()
    }

    /// Copy of the last compiled rules, if generate has succeeded
    pub fn compiled(&self) -> Option<RuleSet> {
        self.lock_state().compiled.clone()
    }

    pub fn set_names(&self) -> Vec<String> {
        self.names.all()
    }

    pub fn owner_tag(&self) -> &str {
        self.backend.owner()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn topology(&self) -> &ServerTopology {
        &self.topology
    }

    /// IPv6 processing is on for this server and globally
    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6
    }

    /// Records a routed network, or a NAT route when `nat` is set.
    pub fn add_route(&self, network: &str, nat: bool, nat_interface: Option<&str>) -> Result<()> {
        let Some(mut state) = self.active_state() else {
            return Ok(());
        };
        state.ledger.add_route(network, nat, nat_interface)
    }

    pub fn add_deny_route(&self, network: &str) -> Result<()> {
        let Some(mut state) = self.active_state() else {
            return Ok(());
        };
        state.ledger.add_deny_route(network)
    }

    pub fn add_nat_network(&self, network: &str) -> Result<()> {
        let Some(mut state) = self.active_state() else {
            return Ok(());
        };
        state.ledger.add_nat_network(network)
    }

    /// Maps traffic for `external` arriving on the virtual interface onto `internal`.
    pub fn add_netmap(&self, external: &str, internal: &str) -> Result<()> {
        let Some(mut state) = self.active_state() else {
            return Ok(());
        };
        state.ledger.add_netmap(external, internal)
    }

    /// Attaches a caller-supplied IPv4 rule outside the compiled policy.
    ///
    /// The rule is tracked for teardown and inserted unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`](crate::Error::Validation) for a malformed
    /// field, in which case nothing is tracked, or the backend error of a
    /// failed insert.
    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        self.attach(Family::Ipv4, rule)
    }

    pub fn add_rule6(&self, rule: Rule) -> Result<()> {
        self.attach(Family::Ipv6, rule)
    }

    fn attach(&self, family: Family, rule: Rule) -> Result<()> {
        let Some(mut state) = self.active_state() else {
            return Ok(());
        };
        rule.validate()?;
        // Tracked before inserting so teardown also covers a failed insert
        state.adhoc_mut(family).push(rule.clone());
        if !self.backend.rule_exists(family, &rule) {
            self.backend.insert_rule(family, &rule)?;
        }
        Ok(())
    }

    /// Detaches a rule added with [`add_rule`](Self::add_rule).
    ///
    /// Returns whether the rule was tracked. An untracked rule is logged as
    /// lost unless `silent` is set; it is never an error.
    pub fn remove_rule(&self, rule: &Rule, silent: bool) -> bool {
        self.detach(Family::Ipv4, rule, silent)
    }

    pub fn remove_rule6(&self, rule: &Rule, silent: bool) -> bool {
        self.detach(Family::Ipv6, rule, silent)
    }

    fn detach(&self, family: Family, rule: &Rule, silent: bool) -> bool {
        let Some(mut state) = self.active_state() else {
            return false;
        };

        let tracked = state.adhoc_mut(family);
        let Some(index) = tracked.iter().position(|r| r == rule) else {
            if !silent {
                warn!(
                    server_id = %self.identity.server_id,
                    rule = %rule,
                    "Lost {} rule",
                    family.tool_label()
                );
            }
            return false;
        };
        tracked.remove(index);
        self.backend.remove_rule(family, rule);
        true
    }

    /// Compiles the ledger and rebuilds the address sets.
    ///
    /// Replaces the previously compiled rules. Rules are not pushed to the
    /// kernel here; call [`upsert_rules`](Self::upsert_rules) next.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a set cannot be created or populated. The previous
    /// compilation is discarded either way; rules it already installed stay
    /// tracked for teardown.
    pub fn generate(&self) -> Result<()> {
        let Some(mut state) = self.active_state() else {
            return Ok(());
        };
        state.compiled = None;

        let compiled = compiler::compile(&state.ledger, &self.topology, &self.names, self.ipv6)?;
        let sets = sets::derive_sets(&state.ledger, &self.names);
        state.sets.clone_from(&sets);
        sets::sync_sets(self.backend.as_ref(), &sets)?;

        info!(
            server_id = %self.identity.server_id,
            rules = compiled.len(),
            accept_all = state.ledger.accept_all(),
            "Firewall policy generated"
        );
        state.compiled = Some(compiled);
        Ok(())
    }

    /// Re-installs every compiled rule the backend reports missing.
    ///
    /// Accept and deny rules are inserted at the head of their chain, drop
    /// rules appended. With `log`, each repair is reported as an unexpected
    /// loss. Does nothing before the first generate.
    ///
    /// # Errors
    ///
    /// Returns `Err` once an insert or append has exhausted its retries.
    pub fn upsert_rules(&self, log: bool) -> Result<()> {
        let Some(mut guard) = self.active_state() else {
            return Ok(());
        };
        let State {
            ledger,
            compiled,
            installed,
            ..
        } = &mut *guard;
        let Some(compiled) = compiled.as_ref() else {
            return Ok(());
        };
        if compiled.ipv4.accept.is_empty() {
            return Ok(());
        }

        self.ensure(Family::Ipv4, Band::Accept, &compiled.ipv4.accept, log, installed)?;
        if self.ipv6 {
            self.ensure(Family::Ipv6, Band::Accept, &compiled.ipv6.accept, log, installed)?;
        }

        if self.topology.restrict_routes {
            self.ensure(Family::Ipv4, Band::Drop, &compiled.ipv4.drop, log, installed)?;
            if self.ipv6 {
                self.ensure(Family::Ipv6, Band::Drop, &compiled.ipv6.drop, log, installed)?;
            }
        }

        if !ledger.deny_routes(Family::Ipv4).is_empty() {
            self.ensure(Family::Ipv4, Band::Deny, &compiled.ipv4.deny, log, installed)?;
        }
        if self.ipv6 && !ledger.deny_routes(Family::Ipv6).is_empty() {
            self.ensure(Family::Ipv6, Band::Deny, &compiled.ipv6.deny, log, installed)?;
        }
        Ok(())
    }

    fn ensure(
        &self,
        family: Family,
        band: Band,
        rules: &[Rule],
        log: bool,
        installed: &mut Vec<(Family, Rule)>,
    ) -> Result<()> {
        let kind = match band {
            Band::Accept => "",
            Band::Drop => "drop ",
            Band::Deny => "deny ",
        };

        for rule in rules {
            if self.backend.rule_exists(family, rule) {
                continue;
            }
            if log {
                error!(
                    server_id = %self.identity.server_id,
                    rule = %rule,
                    "Unexpected loss of {} {kind}rule, adding again...",
                    family.tool_label()
                );
            }
            // Recorded before writing, like ad-hoc rules
            let entry = (family, rule.clone());
            if !installed.contains(&entry) {
                installed.push(entry);
            }
            match band {
                Band::Drop => self.backend.append_rule(family, rule)?,
                Band::Accept | Band::Deny => self.backend.insert_rule(family, rule)?,
            }
        }
        Ok(())
    }

    /// Removes every rule and set this instance created and freezes it.
    ///
    /// Removal failures are logged and skipped; teardown always runs to the
    /// end. Calling it again does nothing.
    pub fn clear_rules(&self) -> Result<()> {
        if self.cleared.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.lock_state();
        let compiled = state.compiled.take().unwrap_or_default();
        let adhoc = std::mem::take(&mut state.adhoc);
        let adhoc6 = std::mem::take(&mut state.adhoc6);
        let address_sets = std::mem::take(&mut state.sets);
        let installed = std::mem::take(&mut state.installed);
        state.ledger = NetworkLedger::default();

        let mut plan: Vec<(Family, Rule)> = Vec::new();
        let mut queue = |family: Family, rules: &[Rule]| {
            plan.extend(rules.iter().map(|rule| (family, rule.clone())));
        };

        queue(Family::Ipv4, &compiled.ipv4.accept);
        queue(Family::Ipv4, &adhoc);
        if self.ipv6 {
            queue(Family::Ipv6, &compiled.ipv6.accept);
        }
        // Ad-hoc IPv6 rules were installed regardless of the IPv6 switch
        queue(Family::Ipv6, &adhoc6);

        if self.topology.restrict_routes {
            queue(Family::Ipv4, &compiled.ipv4.drop);
            if self.ipv6 {
                queue(Family::Ipv6, &compiled.ipv6.drop);
            }
        }

        queue(Family::Ipv4, &compiled.ipv4.deny);
        if self.ipv6 {
            queue(Family::Ipv6, &compiled.ipv6.deny);
        }

        // Leftovers of earlier compilations, including one a failed generate discarded
        for entry in installed {
            if !plan.contains(&entry) {
                plan.push(entry);
            }
        }

        let mut missing = 0usize;
        for (family, rule) in &plan {
            if !self.backend.remove_rule(*family, rule) {
                missing += 1;
            }
        }

        sets::destroy_sets(self.backend.as_ref(), &address_sets);

        if missing > 0 {
            debug!(missing, "Some rules were already gone at teardown");
        }
        info!(server_id = %self.identity.server_id, "Firewall policy cleared");
        Ok(())
    }
}

impl std::fmt::Debug for ServerFirewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFirewall")
            .field("identity", &self.identity)
            .field("backend", &self.backend.kind())
            .field("ipv6", &self.ipv6)
            .field("cleared", &self.is_cleared())
            .finish_non_exhaustive()
    }
}
