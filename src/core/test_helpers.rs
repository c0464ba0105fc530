//! Shared test utilities for core module tests
//!
//! Provides fake kernels and common fixtures so no test touches real
//! iptables or ipset. This module is only compiled in test mode.

use crate::command::CommandRunner;
use crate::config::Settings;
use crate::core::backend::native::{NativeBackend, TableOps};
use crate::core::backend::KernelLock;
use crate::core::error::{Error, Result};
use crate::core::firewall::ServerFirewall;
use crate::core::topology::{ServerIdentity, ServerTopology};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("VPNFW_IPSET_CMD", "/bin/false");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("VPNFW_IPSET_CMD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Debug)]
struct Failure {
    pattern: String,
    /// `None` fails forever
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct RunnerState {
    calls: Vec<Vec<String>>,
    failures: Vec<Failure>,
}

/// [`CommandRunner`] that records every argv and succeeds unless told otherwise.
///
/// Clones share the same log, so keep one handle and give the other to the
/// code under test.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every argv run so far, in order
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    /// Every argv joined with spaces, for substring assertions
    pub fn lines(&self) -> Vec<String> {
        self.lock().calls.iter().map(|argv| argv.join(" ")).collect()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Fails the next `times` commands whose joined argv contains `pattern`.
    pub fn fail_matching(&self, pattern: &str, times: usize) {
        self.lock().failures.push(Failure {
            pattern: pattern.to_string(),
            remaining: Some(times),
        });
    }

    /// Fails every command whose joined argv contains `pattern`.
    pub fn fail_always(&self, pattern: &str) {
        self.lock().failures.push(Failure {
            pattern: pattern.to_string(),
            remaining: None,
        });
    }

    fn record(&self, argv: &[String]) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(argv.to_vec());

        let line = argv.join(" ");
        let failure = state.failures.iter_mut().find(|f| {
            line.contains(&f.pattern) && f.remaining.is_none_or(|remaining| remaining > 0)
        });
        if let Some(failure) = failure {
            if let Some(remaining) = failure.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(Error::Command {
                program: argv.first().cloned().unwrap_or_default(),
                message: "exit status: 1".to_string(),
                stderr: Some(format!("simulated failure: {line}")),
                exit_code: Some(1),
            });
        }
        Ok(String::new())
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String]) -> Result<String> {
        self.record(argv)
    }

    fn run_timeout(&self, argv: &[String], _timeout: Duration) -> Result<String> {
        self.record(argv)
    }
}

#[derive(Debug, Default)]
struct TablesState {
    /// (table, chain, rule) in kernel order
    rules: Vec<(String, String, String)>,
    fail_writes: usize,
    write_attempts: usize,
}

/// In-memory [`TableOps`] standing in for one family's kernel tables.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    state: Arc<Mutex<TablesState>>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TablesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rules(&self) -> Vec<(String, String, String)> {
        self.lock().rules.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rules.is_empty()
    }

    /// Rules of one chain, in kernel order
    pub fn chain(&self, chain: &str) -> Vec<String> {
        self.lock()
            .rules
            .iter()
            .filter(|(_, c, _)| c == chain)
            .map(|(_, _, rule)| rule.clone())
            .collect()
    }

    /// Drops the first rule containing `needle`, as another tool would.
    pub fn delete_matching(&self, needle: &str) -> bool {
        let mut state = self.lock();
        match state.rules.iter().position(|(_, _, rule)| rule.contains(needle)) {
            Some(index) => {
                state.rules.remove(index);
                true
            }
            None => false,
        }
    }

    /// Makes the next `n` inserts/appends fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    /// Number of insert/append calls, failed ones included
    pub fn write_attempts(&self) -> usize {
        self.lock().write_attempts
    }

    fn begin_write(state: &mut TablesState) -> std::result::Result<(), Box<dyn std::error::Error>> {
        state.write_attempts += 1;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err("iptables: Resource temporarily unavailable.".into());
        }
        Ok(())
    }
}

impl TableOps for MemoryTables {
    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        _position: i32,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut state = self.lock();
        Self::begin_write(&mut state)?;
        state
            .rules
            .insert(0, (table.to_string(), chain.to_string(), rule.to_string()));
        Ok(())
    }

    fn append(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut state = self.lock();
        Self::begin_write(&mut state)?;
        state
            .rules
            .push((table.to_string(), chain.to_string(), rule.to_string()));
        Ok(())
    }

    fn exists(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> std::result::Result<bool, Box<dyn std::error::Error>> {
        Ok(self
            .lock()
            .rules
            .iter()
            .any(|(t, c, r)| t == table && c == chain && r == rule))
    }

    fn delete(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut state = self.lock();
        let index = state
            .rules
            .iter()
            .position(|(t, c, r)| t == table && c == chain && r == rule)
            .ok_or("iptables: Bad rule (does a matching rule exist in that chain?).")?;
        state.rules.remove(index);
        Ok(())
    }
}

/// Shared in-memory sink for `tracing` output.
///
/// ```ignore
/// let logs = LogCapture::new();
/// tracing::subscriber::with_default(logs.subscriber(), || firewall.remove_rule(&rule, false));
/// assert_eq!(logs.count("Lost"), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain-text fmt subscriber writing every level into this capture
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + use<> {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish()
    }

    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Number of captured lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|line| line.contains(needle)).count()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Settings with a negligible retry delay
pub fn test_settings() -> Settings {
    Settings {
        retry_delay_ms: 1,
        ..Settings::default()
    }
}

pub fn test_identity() -> ServerIdentity {
    ServerIdentity::new("5f2a9c", "srv").unwrap()
}

/// IPv4-only server on `tun0`
pub fn test_topology() -> ServerTopology {
    ServerTopology::new("tun0", "10.8.0.0/24", "10.8.0.1")
}

/// Dual-stack server on `tun0`
pub fn test_topology6() -> ServerTopology {
    test_topology().with_ipv6("fd00:8::/64", "fd00:8::1")
}

/// Engine over the command backend, recording every command it runs.
pub fn command_firewall(topology: ServerTopology) -> (ServerFirewall, RecordingRunner) {
    let runner = RecordingRunner::new();
    let firewall = ServerFirewall::new(
        test_identity(),
        topology,
        &test_settings(),
        KernelLock::new(),
        Arc::new(runner.clone()),
    )
    .unwrap();
    (firewall, runner)
}

/// Engine over the native backend with in-memory tables.
///
/// Returns the IPv4 and IPv6 tables plus the runner that sees ipset calls.
pub fn native_firewall(
    topology: ServerTopology,
) -> (ServerFirewall, MemoryTables, MemoryTables, RecordingRunner) {
    let settings = test_settings();
    let identity = test_identity();
    let (v4, v6) = (MemoryTables::new(), MemoryTables::new());
    let runner = RecordingRunner::new();
    let backend = NativeBackend::with_tables(
        &settings,
        Box::new(v4.clone()),
        Box::new(v6.clone()),
        Arc::new(runner.clone()),
        KernelLock::new(),
        identity.owner_tag(&settings.owner_prefix),
    );
    let firewall =
        ServerFirewall::with_backend(identity, topology, &settings, Box::new(backend)).unwrap();
    (firewall, v4, v6, runner)
}
