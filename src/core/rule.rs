//! Structured firewall rule specification
//!
//! A [`Rule`] is the unit both backends operate on. Two rules are the same rule
//! when they are structurally equal, which is what removal and the ad-hoc rule
//! tracking list rely on.
//!
//! # Example
//!
//! ```
//! use vpnfw::core::rule::{Chain, Rule, Target};
//!
//! let rule = Rule::new(Chain::Input, Target::Accept).in_interface("tun0");
//! assert_eq!(
//!     rule.to_args("pritunl-abc"),
//!     vec!["INPUT", "-i", "tun0", "-j", "ACCEPT", "-m", "comment", "--comment", "pritunl-abc"],
//! );
//! ```

use crate::core::error::{Error, Result};
use crate::core::network::parse_network;
use crate::validators::{validate_interface, validate_protocol, validate_set_name};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Netfilter chain (processing stage) a rule belongs to
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Chain {
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "OUTPUT")]
    Output,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "PREROUTING")]
    Prerouting,
    #[strum(serialize = "POSTROUTING")]
    Postrouting,
}

impl Chain {
    /// Table the chain lives in
    pub const fn table(self) -> Table {
        match self {
            Chain::Prerouting | Chain::Postrouting => Table::Nat,
            Chain::Input | Chain::Output | Chain::Forward => Table::Filter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
pub enum Table {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
}

/// Which packet address an address-set match is applied to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum SetDirection {
    #[strum(serialize = "src")]
    Src,
    #[strum(serialize = "dst")]
    Dst,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetMatch {
    pub name: String,
    pub direction: SetDirection,
}

/// Conntrack states used by the compiled policy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum CtState {
    #[strum(serialize = "NEW")]
    New,
    #[strum(serialize = "RELATED")]
    Related,
    #[strum(serialize = "ESTABLISHED")]
    Established,
    #[strum(serialize = "INVALID")]
    Invalid,
}

/// What happens to a matching packet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum Target {
    Accept,
    Drop,
    Masquerade,
    /// Static 1:1 translation onto an equally sized block
    Netmap { to: String },
}

impl Target {
    pub const fn name(&self) -> &'static str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
            Target::Masquerade => "MASQUERADE",
            Target::Netmap { .. } => "NETMAP",
        }
    }
}

/// A single firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub chain: Chain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_set: Option<SetMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ctstate: Vec<CtState>,
    pub target: Target,
}

impl Rule {
    pub fn new(chain: Chain, target: Target) -> Self {
        Self {
            chain,
            protocol: None,
            in_interface: None,
            out_interface: None,
            source: None,
            destination: None,
            match_set: None,
            ctstate: Vec::new(),
            target,
        }
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn in_interface(mut self, iface: impl Into<String>) -> Self {
        self.in_interface = Some(iface.into());
        self
    }

    pub fn out_interface(mut self, iface: impl Into<String>) -> Self {
        self.out_interface = Some(iface.into());
        self
    }

    pub fn source(mut self, network: impl Into<String>) -> Self {
        self.source = Some(network.into());
        self
    }

    pub fn destination(mut self, network: impl Into<String>) -> Self {
        self.destination = Some(network.into());
        self
    }

    pub fn match_set(mut self, name: impl Into<String>, direction: SetDirection) -> Self {
        self.match_set = Some(SetMatch {
            name: name.into(),
            direction,
        });
        self
    }

    pub fn ctstate(mut self, states: &[CtState]) -> Self {
        self.ctstate = states.to_vec();
        self
    }

    pub const fn table(&self) -> Table {
        self.chain.table()
    }

    /// Checks every caller-supplied field before the rule reaches a backend.
    ///
    /// The native backend passes the rule as one whitespace-separated string,
    /// so each field must be a single well-formed token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if let Some(protocol) = &self.protocol {
            validate_protocol(protocol).map_err(|e| Error::validation("protocol", e))?;
        }

        for (field, iface) in [
            ("in_interface", &self.in_interface),
            ("out_interface", &self.out_interface),
        ] {
            if let Some(iface) = iface {
                if iface.is_empty() {
                    return Err(Error::validation(field, "Interface name cannot be empty"));
                }
                validate_interface(iface).map_err(|e| Error::validation(field, e))?;
            }
        }

        let networks = [
            ("source", self.source.as_deref()),
            ("destination", self.destination.as_deref()),
            (
                "netmap_to",
                match &self.target {
                    Target::Netmap { to } => Some(to.as_str()),
                    _ => None,
                },
            ),
        ];
        for (field, network) in networks {
            if let Some(network) = network {
                parse_network(network).map_err(|e| Error::validation(field, e.to_string()))?;
            }
        }

        if let Some(set) = &self.match_set {
            validate_set_name(&set.name).map_err(|e| Error::validation("match_set", e))?;
        }
        Ok(())
    }

    /// Matches and target, without the ownership comment
    fn match_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(16);
        let options = [
            ("-p", &self.protocol),
            ("-i", &self.in_interface),
            ("-o", &self.out_interface),
            ("-s", &self.source),
            ("-d", &self.destination),
        ];
        for (flag, value) in options {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }

        if let Some(set) = &self.match_set {
            args.push("-m".to_string());
            args.push("set".to_string());
            args.push("--match-set".to_string());
            args.push(set.name.clone());
            args.push(set.direction.to_string());
        }
        if !self.ctstate.is_empty() {
            let states = self
                .ctstate
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<String>>()
                .join(",");
            args.push("-m".to_string());
            args.push("conntrack".to_string());
            args.push("--ctstate".to_string());
            args.push(states);
        }

        args.push("-j".to_string());
        args.push(self.target.name().to_string());
        if let Target::Netmap { to } = &self.target {
            args.push("--to".to_string());
            args.push(to.clone());
        }
        args
    }

    /// Rule body after the chain name, including the ownership comment.
    ///
    /// This is the string form the native binding expects.
    pub fn body_args(&self, owner: &str) -> Vec<String> {
        let mut args = self.match_args();
        args.push("-m".to_string());
        args.push("comment".to_string());
        args.push("--comment".to_string());
        args.push(owner.to_string());
        args
    }

    /// Full argument list for the command utility, minus the tool and the
    /// `-I`/`-A`/`-D` operation flag that precedes it.
    pub fn to_args(&self, owner: &str) -> Vec<String> {
        let mut args = self.chain_args();
        args.extend(self.body_args(owner));
        args
    }

    // The chain has to directly follow -I/-A/-D, so the table comes after it
    fn chain_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(20);
        args.push(self.chain.to_string());
        if self.table() == Table::Nat {
            args.push("-t".to_string());
            args.push("nat".to_string());
        }
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Untagged form; backends append the owner comment
        let mut args = self.chain_args();
        args.extend(self.match_args());
        write!(f, "{}", args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_match_rendering() {
        let rule = Rule::new(Chain::Forward, Target::Accept)
            .out_interface("tun3")
            .match_set("abc_serverr", SetDirection::Src)
            .ctstate(&[CtState::Related, CtState::Established]);

        assert_eq!(
            rule.to_args("pritunl-abc"),
            vec![
                "FORWARD",
                "-o",
                "tun3",
                "-m",
                "set",
                "--match-set",
                "abc_serverr",
                "src",
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
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
    fn test_nat_rules_select_nat_table() {
        let rule = Rule::new(
            Chain::Prerouting,
            Target::Netmap {
                to: "10.8.0.0/24".into(),
            },
        )
        .in_interface("tun0")
        .destination("172.16.0.0/24");

        assert_eq!(rule.table(), Table::Nat);
        let args = rule.to_args("pritunl-x");
        assert_eq!(&args[..3], &["PREROUTING", "-t", "nat"]);
        assert!(args.windows(2).any(|w| w == ["--to", "10.8.0.0/24"]));
        assert_eq!(Chain::Forward.table(), Table::Filter);
    }

    #[test]
    fn test_display_omits_comment() {
        let rule = Rule::new(Chain::Input, Target::Drop).in_interface("tun0");
        assert_eq!(rule.to_string(), "INPUT -i tun0 -j DROP");
    }

    #[test]
    fn test_structural_equality() {
        let a = Rule::new(Chain::Input, Target::Accept).destination("10.0.0.0/8");
        let b = Rule::new(Chain::Input, Target::Accept).destination("10.0.0.0/8");
        let c = Rule::new(Chain::Output, Target::Accept).destination("10.0.0.0/8");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rule_json_shape() {
        let json = r#"{"chain":"INPUT","in_interface":"tun0","target":{"kind":"accept"}}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule, Rule::new(Chain::Input, Target::Accept).in_interface("tun0"));
    }

    #[test]
    fn test_validate_accepts_well_formed_rule() {
        let rule = Rule::new(Chain::Forward, Target::Accept)
            .protocol("udp")
            .in_interface("eth0")
            .out_interface("tun0")
            .source("10.8.0.0/24")
            .destination("fd00::1")
            .match_set("5f2a9c_srvr", SetDirection::Dst);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_extra_options_in_fields() {
        let smuggled = [
            Rule::new(Chain::Input, Target::Accept).in_interface("eth0 -s 0.0.0.0/0 -p tcp"),
            Rule::new(Chain::Input, Target::Accept).out_interface(""),
            Rule::new(Chain::Input, Target::Accept).protocol("tcp --dport 22"),
            Rule::new(Chain::Input, Target::Accept).source("10.0.0.0/8 -j DROP"),
            Rule::new(Chain::Input, Target::Accept).destination("not-a-network"),
            Rule::new(Chain::Input, Target::Accept).match_set("a b", SetDirection::Src),
            Rule::new(
                Chain::Prerouting,
                Target::Netmap {
                    to: "10.8.0.0/24 -i eth0".into(),
                },
            ),
        ];
        for rule in smuggled {
            assert!(
                matches!(rule.validate(), Err(Error::Validation { .. })),
                "accepted {rule}"
            );
        }
    }

    #[test]
    fn test_chain_parse() {
        assert_eq!("postrouting".parse::<Chain>().unwrap(), Chain::Postrouting);
        assert!("BOGUS".parse::<Chain>().is_err());
    }
}
