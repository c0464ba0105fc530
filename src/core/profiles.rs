//! Server profile files
//!
//! A profile is a standalone JSON file describing one VPN server: its
//! identity, topology, networks and any ad-hoc rules. The CLI feeds profiles
//! into a [`ServerFirewall`]; the server-management layer normally calls the
//! engine's add operations directly instead.
//!
//! ```json
//! {
//!   "identity": { "server_id": "5f2a9c", "server_type": "srv" },
//!   "topology": {
//!     "virt_interface": "tun0",
//!     "virt_network": "10.8.0.0/24",
//!     "server_addr": "10.8.0.1",
//!     "restrict_routes": true
//!   },
//!   "routes": [
//!     { "network": "10.0.0.0/8" },
//!     { "network": "192.168.1.0/24", "nat": true, "nat_interface": "eth1" }
//!   ],
//!   "deny_routes": ["10.0.5.0/24"],
//!   "nat_networks": ["10.8.0.0/24"]
//! }
//! ```

use crate::core::error::Result;
use crate::core::firewall::ServerFirewall;
use crate::core::ledger::NetworkLedger;
use crate::core::rule::Rule;
use crate::core::topology::{ServerIdentity, ServerTopology};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub network: String,
    #[serde(default)]
    pub nat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_interface: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetmapEntry {
    pub external: String,
    pub internal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub identity: ServerIdentity,
    pub topology: ServerTopology,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub deny_routes: Vec<String>,
    #[serde(default)]
    pub nat_networks: Vec<String>,
    #[serde(default)]
    pub netmaps: Vec<NetmapEntry>,
    /// Ad-hoc IPv4 rules attached after the compiled policy
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub rules6: Vec<Rule>,
}

impl ServerProfile {
    /// Checks identity, topology, every network entry and every ad-hoc rule.
    pub fn validate(&self) -> Result<()> {
        self.identity.validate()?;
        self.topology.validate()?;
        for rule in self.rules.iter().chain(&self.rules6) {
            rule.validate()?;
        }
        self.ledger().map(drop)
    }

    /// Builds the ledger this profile describes
    pub fn ledger(&self) -> Result<NetworkLedger> {
        let mut ledger = NetworkLedger::new();
        for route in &self.routes {
            ledger.add_route(&route.network, route.nat, route.nat_interface.as_deref())?;
        }
        for network in &self.deny_routes {
            ledger.add_deny_route(network)?;
        }
        for network in &self.nat_networks {
            ledger.add_nat_network(network)?;
        }
        for netmap in &self.netmaps {
            ledger.add_netmap(&netmap.external, &netmap.internal)?;
        }
        Ok(ledger)
    }

    /// Feeds the profile's networks into `firewall`.
    ///
    /// Ad-hoc rules are left out; attach them with
    /// [`attach_rules`](Self::attach_rules) once the policy is installed.
    pub fn populate(&self, firewall: &ServerFirewall) -> Result<()> {
        for route in &self.routes {
            firewall.add_route(&route.network, route.nat, route.nat_interface.as_deref())?;
        }
        for network in &self.deny_routes {
            firewall.add_deny_route(network)?;
        }
        for network in &self.nat_networks {
            firewall.add_nat_network(network)?;
        }
        for netmap in &self.netmaps {
            firewall.add_netmap(&netmap.external, &netmap.internal)?;
        }
        Ok(())
    }

    pub fn attach_rules(&self, firewall: &ServerFirewall) -> Result<()> {
        for rule in &self.rules {
            firewall.add_rule(rule.clone())?;
        }
        for rule in &self.rules6 {
            firewall.add_rule6(rule.clone())?;
        }
        Ok(())
    }
}

fn parse_profile(json: &str) -> Result<ServerProfile> {
    let profile: ServerProfile = serde_json::from_str(json)?;
    profile.validate()?;
    Ok(profile)
}

/// Loads and validates a profile.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_profile(path: &Path) -> Result<ServerProfile> {
    let json = tokio::fs::read_to_string(path).await?;
    parse_profile(&json)
}
