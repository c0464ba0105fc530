//! Address-set derivation and synchronization
//!
//! Each server owns eight `hash:net` sets: routes, deny routes, NAT routes and
//! NAT networks, once per family. Sets are rebuilt from scratch on every
//! generate: destroy, create, populate.

use crate::core::backend::Backend;
use crate::core::error::Result;
use crate::core::ledger::NetworkLedger;
use crate::core::network::{Family, is_all_addresses};
use crate::core::topology::ServerIdentity;
use std::collections::BTreeSet;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

/// Logical contents of an address set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SetCategory {
    Routes,
    DenyRoutes,
    NatRoutes,
    NatNetworks,
}

impl SetCategory {
    /// Single-letter suffix used in set names
    pub const fn suffix(self) -> char {
        match self {
            SetCategory::Routes => 'r',
            SetCategory::DenyRoutes => 'd',
            SetCategory::NatRoutes => 'n',
            SetCategory::NatNetworks => 'h',
        }
    }
}

/// Set-name generator for one server.
///
/// ```
/// use vpnfw::core::network::Family;
/// use vpnfw::core::sets::{SetCategory, SetNames};
/// use vpnfw::core::topology::ServerIdentity;
///
/// let names = SetNames::new(&ServerIdentity::new("5f2a", "srv").unwrap());
/// assert_eq!(names.name(SetCategory::Routes, Family::Ipv4), "5f2a_srvr");
/// assert_eq!(names.name(SetCategory::NatNetworks, Family::Ipv6), "5f2a_srvh6");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNames {
    prefix: String,
}

impl SetNames {
    pub fn new(identity: &ServerIdentity) -> Self {
        Self {
            prefix: identity.set_prefix(),
        }
    }

    pub fn name(&self, category: SetCategory, family: Family) -> String {
        match family {
            Family::Ipv4 => format!("{}{}", self.prefix, category.suffix()),
            Family::Ipv6 => format!("{}{}6", self.prefix, category.suffix()),
        }
    }

    /// All eight names, IPv4 first
    pub fn all(&self) -> Vec<String> {
        Family::iter()
            .flat_map(|family| SetCategory::iter().map(move |c| (c, family)))
            .map(|(category, family)| self.name(category, family))
            .collect()
    }
}

/// A set as it should exist in the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    pub name: String,
    pub family: Family,
    pub category: SetCategory,
    pub members: BTreeSet<String>,
}

/// Derives the eight sets from the ledger, leaving out all-addresses networks.
pub fn derive_sets(ledger: &NetworkLedger, names: &SetNames) -> Vec<AddressSet> {
    let mut sets = Vec::with_capacity(8);
    for family in Family::iter() {
        for category in SetCategory::iter() {
            let pool: Vec<&String> = match category {
                SetCategory::Routes => ledger.routes(family).iter().collect(),
                SetCategory::DenyRoutes => ledger.deny_routes(family).iter().collect(),
                SetCategory::NatRoutes => ledger.nat_routes(family).keys().collect(),
                SetCategory::NatNetworks => ledger.nat_networks(family).iter().collect(),
            };
            sets.push(AddressSet {
                name: names.name(category, family),
                family,
                category,
                members: pool
                    .into_iter()
                    .filter(|network| !is_all_addresses(network))
                    .cloned()
                    .collect(),
            });
        }
    }
    sets
}

/// Best-effort destroy of every set; failures are logged and skipped.
pub fn destroy_sets(backend: &dyn Backend, sets: &[AddressSet]) {
    for set in sets {
        if let Err(e) = backend.destroy_set(&set.name) {
            debug!(set = %set.name, error = %e, "Set not destroyed");
        }
    }
}

/// Rebuilds `sets` in the kernel.
///
/// Destroy failures are expected when a set does not exist yet. A failed
/// create or add aborts and is returned.
pub fn sync_sets(backend: &dyn Backend, sets: &[AddressSet]) -> Result<()> {
    destroy_sets(backend, sets);

    for set in sets {
        backend.create_set(&set.name, set.family).inspect_err(|e| {
            warn!(set = %set.name, family = %set.family, error = %e, "Failed to create address set");
        })?;
        for member in &set.members {
            backend.add_set_member(&set.name, member).inspect_err(|e| {
                warn!(set = %set.name, member = %member, error = %e, "Failed to populate address set");
            })?;
        }
    }

    info!(
        sets = sets.len(),
        members = sets.iter().map(|s| s.members.len()).sum::<usize>(),
        "Address sets synchronized"
    );
    Ok(())
}
