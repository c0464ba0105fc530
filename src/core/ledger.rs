//! Declarative network model for one VPN server
//!
//! The ledger only records what the server wants; it never touches the kernel.
//! Every network is validated and classified by family on the way in, so the
//! compiler can treat its contents as well formed.

use crate::core::error::Result;
use crate::core::network::{Family, is_all_addresses, parse_network};
use crate::validators::validate_interface;
use std::collections::{BTreeMap, BTreeSet};

/// Per-family network pools plus static address mappings.
///
/// Ordered collections keep compilation output deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkLedger {
    routes: BTreeSet<String>,
    routes6: BTreeSet<String>,
    deny_routes: BTreeSet<String>,
    deny_routes6: BTreeSet<String>,
    nat_routes: BTreeMap<String, Option<String>>,
    nat_routes6: BTreeMap<String, Option<String>>,
    nat_networks: BTreeSet<String>,
    nat_networks6: BTreeSet<String>,
    netmaps: BTreeMap<String, String>,
    accept_all: bool,
}

impl NetworkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a routed network, or a NAT route when `nat` is set.
    ///
    /// Adding the all-addresses network of either family turns on accept-all.
    pub fn add_route(
        &mut self,
        network: &str,
        nat: bool,
        nat_interface: Option<&str>,
    ) -> Result<()> {
        parse_network(network)?;
        let nat_interface = nat_interface
            .map(|iface| {
                validate_interface(iface)
                    .map_err(|e| crate::core::error::Error::validation("nat_interface", e))
            })
            .transpose()?
            .filter(|iface| !iface.is_empty());

        if is_all_addresses(network) {
            self.accept_all = true;
        }

        let family = Family::of(network);
        if nat {
            let routes = match family {
                Family::Ipv4 => &mut self.nat_routes,
                Family::Ipv6 => &mut self.nat_routes6,
            };
            routes.insert(network.to_string(), nat_interface);
        } else {
            let routes = match family {
                Family::Ipv4 => &mut self.routes,
                Family::Ipv6 => &mut self.routes6,
            };
            routes.insert(network.to_string());
        }
        Ok(())
    }

    pub fn add_deny_route(&mut self, network: &str) -> Result<()> {
        parse_network(network)?;
        let routes = match Family::of(network) {
            Family::Ipv4 => &mut self.deny_routes,
            Family::Ipv6 => &mut self.deny_routes6,
        };
        routes.insert(network.to_string());
        Ok(())
    }

    pub fn add_nat_network(&mut self, network: &str) -> Result<()> {
        parse_network(network)?;
        let networks = match Family::of(network) {
            Family::Ipv4 => &mut self.nat_networks,
            Family::Ipv6 => &mut self.nat_networks6,
        };
        networks.insert(network.to_string());
        Ok(())
    }

    /// Maps traffic addressed to `external` onto `internal` (NETMAP).
    pub fn add_netmap(&mut self, external: &str, internal: &str) -> Result<()> {
        parse_network(external)?;
        parse_network(internal)?;
        if Family::of(external) != Family::of(internal) {
            return Err(crate::core::error::Error::InvalidNetwork {
                network: internal.to_string(),
                reason: format!("netmap target family differs from {external}"),
            });
        }
        self.netmaps
            .insert(external.to_string(), internal.to_string());
        Ok(())
    }

    pub fn accept_all(&self) -> bool {
        self.accept_all
    }

    pub fn routes(&self, family: Family) -> &BTreeSet<String> {
        match family {
            Family::Ipv4 => &self.routes,
            Family::Ipv6 => &self.routes6,
        }
    }

    pub fn deny_routes(&self, family: Family) -> &BTreeSet<String> {
        match family {
            Family::Ipv4 => &self.deny_routes,
            Family::Ipv6 => &self.deny_routes6,
        }
    }

    pub fn nat_routes(&self, family: Family) -> &BTreeMap<String, Option<String>> {
        match family {
            Family::Ipv4 => &self.nat_routes,
            Family::Ipv6 => &self.nat_routes6,
        }
    }

    pub fn nat_networks(&self, family: Family) -> &BTreeSet<String> {
        match family {
            Family::Ipv4 => &self.nat_networks,
            Family::Ipv6 => &self.nat_networks6,
        }
    }

    /// Netmap entries of one family as `(external, internal)` pairs
    pub fn netmaps(&self, family: Family) -> impl Iterator<Item = (&str, &str)> {
        self.netmaps
            .iter()
            .filter(move |(external, _)| Family::of(external) == family)
            .map(|(external, internal)| (external.as_str(), internal.as_str()))
    }
}
