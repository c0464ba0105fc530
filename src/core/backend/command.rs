//! Backend that shells out to `iptables` / `ip6tables`

use super::ipset::IpsetCommands;
use super::{Backend, BackendKind, KernelLock, RetryPolicy};
use crate::command::CommandRunner;
use crate::config::Settings;
use crate::core::error::Result;
use crate::core::network::Family;
use crate::core::rule::Rule;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct CommandBackend {
    runner: Arc<dyn CommandRunner>,
    ipset: IpsetCommands,
    iptables_cmd: String,
    ip6tables_cmd: String,
    timeout: Duration,
    retry: RetryPolicy,
    lock: KernelLock,
    owner: String,
}

impl CommandBackend {
    pub fn new(
        settings: &Settings,
        runner: Arc<dyn CommandRunner>,
        lock: KernelLock,
        owner: String,
    ) -> Self {
        Self {
            ipset: IpsetCommands::new(Arc::clone(&runner), settings.ipset_cmd.clone()),
            runner,
            iptables_cmd: settings.iptables_cmd.clone(),
            ip6tables_cmd: settings.ip6tables_cmd.clone(),
            timeout: settings.command_timeout(),
            retry: RetryPolicy::from_settings(settings),
            lock,
            owner,
        }
    }

    fn tool(&self, family: Family) -> &str {
        match family {
            Family::Ipv4 => &self.iptables_cmd,
            Family::Ipv6 => &self.ip6tables_cmd,
        }
    }

    /// Full command line for one operation (`-I`, `-A` or `-D`)
    pub fn command_line(&self, family: Family, op: &str, rule: &Rule) -> Vec<String> {
        let mut argv = vec![self.tool(family).to_string(), op.to_string()];
        argv.extend(rule.to_args(&self.owner));
        argv
    }

    fn write_with_retry(&self, action: &str, op: &str, family: Family, rule: &Rule) -> Result<()> {
        let argv = self.command_line(family, op, rule);
        let _guard = self.lock.acquire();
        self.retry.run(action, family, rule, || {
            self.runner.run_timeout(&argv, self.timeout).map(drop)
        })
    }
}

impl Backend for CommandBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Command
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn insert_rule(&self, family: Family, rule: &Rule) -> Result<()> {
        self.write_with_retry("insert", "-I", family, rule)
    }

    fn append_rule(&self, family: Family, rule: &Rule) -> Result<()> {
        self.write_with_retry("append", "-A", family, rule)
    }

    fn remove_rule(&self, family: Family, rule: &Rule) -> bool {
        let argv = self.command_line(family, "-D", rule);
        let _guard = self.lock.acquire();
        match self.runner.run(&argv) {
            Ok(_) => true,
            Err(e) => {
                debug!(family = %family, rule = %rule, error = %e, "Rule was not present");
                false
            }
        }
    }

    /// Always false: the utility offers no cheap lookup, so existence is
    /// treated as unknown and every reconciliation re-inserts.
    fn rule_exists(&self, _family: Family, _rule: &Rule) -> bool {
        false
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
    use crate::core::rule::{Chain, SetDirection, Target};

    fn backend() -> CommandBackend {
        CommandBackend::new(
            &Settings::default(),
            Arc::new(crate::command::SystemRunner),
            KernelLock::new(),
            "pritunl-abc".to_string(),
        )
    }

    #[test]
    fn test_command_line_shape() {
        let rule = Rule::new(Chain::Input, Target::Accept)
            .in_interface("tun0")
            .match_set("abc_srvr", SetDirection::Dst);
        let argv = backend().command_line(Family::Ipv4, "-I", &rule);
        assert_eq!(
            argv,
            vec![
                "iptables",
                "-I",
                "INPUT",
                "-i",
                "tun0",
                "-m",
                "set",
                "--match-set",
                "abc_srvr",
                "dst",
                "-j",
                "ACCEPT",
                "-m",
                "comment",
                "--comment",
                "pritunl-abc",
            ]
        );
    }

    #[test]
    fn test_ipv6_uses_ip6tables() {
        let rule = Rule::new(Chain::Postrouting, Target::Masquerade).source("fd00::/64");
        let argv = backend().command_line(Family::Ipv6, "-D", &rule);
        assert_eq!(&argv[..5], &["ip6tables", "-D", "POSTROUTING", "-t", "nat"]);
    }

    #[test]
    fn test_exists_is_always_false() {
        let rule = Rule::new(Chain::Input, Target::Accept);
        assert!(!backend().rule_exists(Family::Ipv4, &rule));
        assert_eq!(backend().kind(), BackendKind::Command);
    }
}
