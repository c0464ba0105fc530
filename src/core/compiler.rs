//! Rule compiler
//!
//! Translates a [`NetworkLedger`] and a [`ServerTopology`] into ordered rule
//! lists. Compilation is pure: it never touches the kernel, and compiling an
//! unchanged ledger twice yields equal output.
//!
//! Rules are split into three priority bands per family:
//!
//! | Band   | Applied with | Installed when                     |
//! |--------|--------------|------------------------------------|
//! | accept | insert (`-I`)| always                             |
//! | drop   | append (`-A`)| `restrict_routes` is set           |
//! | deny   | insert (`-I`)| the family has deny routes         |
//!
//! Within each band, stages are emitted in the order INPUT, OUTPUT, FORWARD,
//! PREROUTING, POSTROUTING.

use crate::core::error::{Error, Result};
use crate::core::ledger::NetworkLedger;
use crate::core::network::{Family, prefix_len};
use crate::core::rule::{Chain, CtState, Rule, SetDirection, Target};
use crate::core::sets::{SetCategory, SetNames};
use crate::core::topology::ServerTopology;
use serde::Serialize;
use std::collections::BTreeSet;

const RELATED_ESTABLISHED: &[CtState] = &[CtState::Related, CtState::Established];

/// Priority band a compiled rule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Band {
    Accept,
    Drop,
    Deny,
}

/// Compiled rules of one family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleBands {
    pub accept: Vec<Rule>,
    pub drop: Vec<Rule>,
    pub deny: Vec<Rule>,
}

impl RuleBands {
    pub fn band(&self, band: Band) -> &[Rule] {
        match band {
            Band::Accept => &self.accept,
            Band::Drop => &self.drop,
            Band::Deny => &self.deny,
        }
    }

    pub fn len(&self) -> usize {
        self.accept.len() + self.drop.len() + self.deny.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rules of all bands that belong to `chain`, in band order
    pub fn chain(&self, chain: Chain) -> impl Iterator<Item = &Rule> {
        self.accept
            .iter()
            .chain(&self.drop)
            .chain(&self.deny)
            .filter(move |rule| rule.chain == chain)
    }
}

/// Compiled rules of both families
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleSet {
    pub ipv4: RuleBands,
    pub ipv6: RuleBands,
}

impl RuleSet {
    pub fn family(&self, family: Family) -> &RuleBands {
        match family {
            Family::Ipv4 => &self.ipv4,
            Family::Ipv6 => &self.ipv6,
        }
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compiles the ledger for both families.
///
/// IPv6 bands are left empty unless `ipv6` is set.
///
/// # Errors
///
/// Returns `Err` if a network lacks a parseable prefix, or if IPv6 is
/// enabled without an IPv6 client network and server address.
pub fn compile(
    ledger: &NetworkLedger,
    topology: &ServerTopology,
    names: &SetNames,
    ipv6: bool,
) -> Result<RuleSet> {
    let ipv4 = FamilyCompiler::new(ledger, topology, names, Family::Ipv4)?.compile()?;
    let ipv6 = if ipv6 {
        FamilyCompiler::new(ledger, topology, names, Family::Ipv6)?.compile()?
    } else {
        RuleBands::default()
    };
    Ok(RuleSet { ipv4, ipv6 })
}

struct FamilyCompiler<'a> {
    ledger: &'a NetworkLedger,
    topology: &'a ServerTopology,
    family: Family,
    iface: &'a str,
    virt_network: &'a str,
    server_addr: &'a str,
    routes_set: String,
    deny_set: String,
    nat_set: String,
    nat_networks_set: String,
    out: RuleBands,
}

impl<'a> FamilyCompiler<'a> {
    fn new(
        ledger: &'a NetworkLedger,
        topology: &'a ServerTopology,
        names: &SetNames,
        family: Family,
    ) -> Result<Self> {
        let virt_network = topology
            .virt_network(family)
            .ok_or_else(|| Error::validation("virt_network6", "required when ipv6 is set"))?;
        let server_addr = topology
            .server_addr(family)
            .ok_or_else(|| Error::validation("server_addr6", "required when ipv6 is set"))?;

        Ok(Self {
            ledger,
            topology,
            family,
            iface: &topology.virt_interface,
            virt_network,
            server_addr,
            routes_set: names.name(SetCategory::Routes, family),
            deny_set: names.name(SetCategory::DenyRoutes, family),
            nat_set: names.name(SetCategory::NatRoutes, family),
            nat_networks_set: names.name(SetCategory::NatNetworks, family),
            out: RuleBands::default(),
        })
    }

    fn compile(mut self) -> Result<RuleBands> {
        self.input();
        self.output();
        self.forward();
        self.prerouting();
        self.postrouting()?;
        Ok(self.out)
    }

    /// The server firewalls its own IPv6 clients under accept-all
    fn ipv6_firewalled(&self) -> bool {
        self.family.is_ipv6() && self.topology.ipv6_firewall
    }

    fn input(&mut self) {
        let iface = self.iface;

        if self.ledger.accept_all() {
            if self.ipv6_firewalled() {
                let network = self.virt_network;
                self.out.accept.push(
                    Rule::new(Chain::Input, Target::Accept)
                        .destination(network)
                        .ctstate(RELATED_ESTABLISHED),
                );
                self.out.accept.push(
                    Rule::new(Chain::Input, Target::Accept)
                        .protocol("icmpv6")
                        .destination(network)
                        .ctstate(&[CtState::New]),
                );
                self.out
                    .drop
                    .push(Rule::new(Chain::Input, Target::Drop).destination(network));
            } else {
                self.out
                    .accept
                    .push(Rule::new(Chain::Input, Target::Accept).in_interface(iface));
            }
            return;
        }

        let local = if self.topology.inter_client {
            self.virt_network
        } else {
            self.server_addr
        };
        self.out.accept.push(
            Rule::new(Chain::Input, Target::Accept)
                .in_interface(iface)
                .destination(local),
        );

        self.out.accept.push(
            Rule::new(Chain::Input, Target::Accept)
                .in_interface(iface)
                .match_set(&self.routes_set, SetDirection::Dst),
        );
        self.out.deny.push(
            Rule::new(Chain::Input, Target::Drop)
                .in_interface(iface)
                .match_set(&self.deny_set, SetDirection::Dst),
        );
        self.out.accept.push(
            Rule::new(Chain::Input, Target::Accept)
                .in_interface(iface)
                .match_set(&self.nat_set, SetDirection::Dst),
        );

        self.out
            .drop
            .push(Rule::new(Chain::Input, Target::Drop).in_interface(iface));
    }

    fn output(&mut self) {
        let iface = self.iface;

        if self.ledger.accept_all() {
            self.out
                .accept
                .push(Rule::new(Chain::Output, Target::Accept).out_interface(iface));
            return;
        }

        let local = if self.topology.inter_client {
            self.virt_network
        } else {
            self.server_addr
        };
        self.out.accept.push(
            Rule::new(Chain::Output, Target::Accept)
                .out_interface(iface)
                .source(local),
        );

        self.out.accept.push(
            Rule::new(Chain::Output, Target::Accept)
                .out_interface(iface)
                .match_set(&self.routes_set, SetDirection::Src),
        );
        self.out.deny.push(
            Rule::new(Chain::Output, Target::Drop)
                .out_interface(iface)
                .match_set(&self.deny_set, SetDirection::Src),
        );
        self.out.accept.push(
            Rule::new(Chain::Output, Target::Accept)
                .out_interface(iface)
                .match_set(&self.nat_set, SetDirection::Src),
        );

        self.out
            .drop
            .push(Rule::new(Chain::Output, Target::Drop).out_interface(iface));
    }

    fn forward(&mut self) {
        let iface = self.iface;

        if self.ledger.accept_all() {
            if self.ipv6_firewalled() {
                let network = self.virt_network;
                self.out.accept.push(
                    Rule::new(Chain::Forward, Target::Accept)
                        .destination(network)
                        .ctstate(RELATED_ESTABLISHED),
                );
                self.out.accept.push(
                    Rule::new(Chain::Forward, Target::Accept)
                        .protocol("icmpv6")
                        .destination(network)
                        .ctstate(&[CtState::New]),
                );
                // Lives in the accept band so it is inserted ahead of the accepts above
                self.out.accept.push(
                    Rule::new(Chain::Forward, Target::Drop)
                        .destination(network)
                        .ctstate(&[CtState::Invalid]),
                );
                self.out
                    .drop
                    .push(Rule::new(Chain::Forward, Target::Drop).destination(network));
            } else {
                self.out
                    .accept
                    .push(Rule::new(Chain::Forward, Target::Accept).in_interface(iface));
                self.out
                    .accept
                    .push(Rule::new(Chain::Forward, Target::Accept).out_interface(iface));
            }
            return;
        }

        if self.topology.inter_client {
            let network = self.virt_network;
            self.out.accept.push(
                Rule::new(Chain::Forward, Target::Accept)
                    .in_interface(iface)
                    .destination(network),
            );
            self.out.accept.push(
                Rule::new(Chain::Forward, Target::Accept)
                    .out_interface(iface)
                    .source(network),
            );
        }

        self.out.accept.push(
            Rule::new(Chain::Forward, Target::Accept)
                .in_interface(iface)
                .match_set(&self.routes_set, SetDirection::Dst),
        );
        self.out.accept.push(
            Rule::new(Chain::Forward, Target::Accept)
                .out_interface(iface)
                .match_set(&self.routes_set, SetDirection::Src),
        );

        self.out.deny.push(
            Rule::new(Chain::Forward, Target::Drop)
                .in_interface(iface)
                .match_set(&self.deny_set, SetDirection::Dst),
        );
        self.out.deny.push(
            Rule::new(Chain::Forward, Target::Drop)
                .out_interface(iface)
                .match_set(&self.deny_set, SetDirection::Src),
        );

        self.out.accept.push(
            Rule::new(Chain::Forward, Target::Accept)
                .in_interface(iface)
                .match_set(&self.nat_set, SetDirection::Dst),
        );
        self.out.accept.push(
            Rule::new(Chain::Forward, Target::Accept)
                .out_interface(iface)
                .match_set(&self.nat_set, SetDirection::Src)
                .ctstate(RELATED_ESTABLISHED),
        );

        self.out
            .drop
            .push(Rule::new(Chain::Forward, Target::Drop).in_interface(iface));
        self.out
            .drop
            .push(Rule::new(Chain::Forward, Target::Drop).out_interface(iface));
    }

    fn prerouting(&mut self) {
        let ledger = self.ledger;
        for (external, internal) in ledger.netmaps(self.family) {
            self.out.accept.push(
                Rule::new(
                    Chain::Prerouting,
                    Target::Netmap {
                        to: internal.to_string(),
                    },
                )
                .in_interface(self.iface)
                .destination(external),
            );
        }
    }

    fn postrouting(&mut self) -> Result<()> {
        let ledger = self.ledger;
        let topology = self.topology;
        let nat_networks = ledger.nat_networks(self.family);

        // Dormant: no uplink interface is ever assigned by the caller
        if ledger.accept_all()
            && let Some(uplink) = topology.uplink_interface(self.family)
        {
            self.out.accept.push(
                Rule::new(Chain::Postrouting, Target::Masquerade)
                    .out_interface(uplink)
                    .match_set(&self.nat_networks_set, SetDirection::Src),
            );
        }

        let routes = ledger.routes(self.family);
        let nat_routes = ledger.nat_routes(self.family);

        let mut prefixes = BTreeSet::new();
        for network in routes.iter().chain(nat_routes.keys()) {
            prefixes.insert(prefix_len(network)?);
        }

        // Shorter prefixes first, so each pass only sees its own routes
        for prefix in prefixes {
            for (route, interface) in nat_routes {
                if prefix_len(route)? != prefix {
                    continue;
                }
                for nat_network in nat_networks {
                    let mut rule = Rule::new(Chain::Postrouting, Target::Masquerade)
                        .source(nat_network)
                        .destination(route);
                    if let Some(interface) = interface {
                        rule = rule.out_interface(interface);
                    }
                    self.out.accept.push(rule);
                }
            }

            for route in routes {
                if prefix_len(route)? != prefix {
                    continue;
                }
                for nat_network in nat_networks {
                    self.out.accept.push(
                        Rule::new(Chain::Postrouting, Target::Accept)
                            .source(nat_network)
                            .destination(route),
                    );
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::core::topology::ServerIdentity;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_postrouting_sorted_by_prefix(
            routes in prop::collection::vec((any::<u8>(), 1u8..=32, any::<bool>()), 1..10),
            routes6 in prop::collection::vec((any::<u16>(), 1u8..=128, any::<bool>()), 0..10),
        ) {
            let mut ledger = NetworkLedger::new();
            for (octet, prefix, nat) in &routes {
                ledger.add_route(&format!("{octet}.0.0.0/{prefix}"), *nat, None).unwrap();
            }
            for (seg, prefix, nat) in &routes6 {
                ledger.add_route(&format!("fd00:{seg:x}::/{prefix}"), *nat, None).unwrap();
            }
            ledger.add_nat_network("10.8.0.0/24").unwrap();
            ledger.add_nat_network("fd00:c0a8::/64").unwrap();

            let topology = ServerTopology::new("tun0", "10.8.0.0/24", "10.8.0.1")
                .with_ipv6("fd00:c0a8::/64", "fd00:c0a8::1");
            let names = SetNames::new(&ServerIdentity::new("p", "t").unwrap());
            let rules = compile(&ledger, &topology, &names, true).unwrap();

            for family in [Family::Ipv4, Family::Ipv6] {
                let prefixes: Vec<u8> = rules
                    .family(family)
                    .chain(Chain::Postrouting)
                    .map(|r| prefix_len(r.destination.as_deref().unwrap()).unwrap())
                    .collect();
                prop_assert!(prefixes.windows(2).all(|w| w[0] <= w[1]));
            }

            let expected4 = ledger.routes(Family::Ipv4).len() + ledger.nat_routes(Family::Ipv4).len();
            prop_assert_eq!(rules.ipv4.chain(Chain::Postrouting).count(), expected4);
            let expected6 = ledger.routes(Family::Ipv6).len() + ledger.nat_routes(Family::Ipv6).len();
            prop_assert_eq!(rules.ipv6.chain(Chain::Postrouting).count(), expected6);
        }
    }
}
