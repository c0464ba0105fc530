//! Address families and CIDR helpers
//!
//! Network strings are classified by syntax: anything containing `:` is IPv6,
//! everything else IPv4. Parsing is done with [`ipnetwork`] so malformed input
//! is rejected where it enters the ledger instead of surfacing later as an
//! iptables failure.

use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

pub const ALL_IPV4: &str = "0.0.0.0/0";
pub const ALL_IPV6: &str = "::/0";

/// Address family of a network, rule or address set
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
}

impl Family {
    /// Classifies a network string by the presence of the IPv6 separator.
    pub fn of(network: &str) -> Self {
        if network.contains(':') {
            Family::Ipv6
        } else {
            Family::Ipv4
        }
    }

    /// The literal all-addresses network for this family
    pub const fn all_addresses(self) -> &'static str {
        match self {
            Family::Ipv4 => ALL_IPV4,
            Family::Ipv6 => ALL_IPV6,
        }
    }

    /// Name used in log messages ("iptables" / "ip6tables")
    pub const fn tool_label(self) -> &'static str {
        match self {
            Family::Ipv4 => "iptables",
            Family::Ipv6 => "ip6tables",
        }
    }

    /// ipset `family` argument
    pub const fn ipset_family(self) -> &'static str {
        match self {
            Family::Ipv4 => "inet",
            Family::Ipv6 => "inet6",
        }
    }

    pub const fn is_ipv6(self) -> bool {
        matches!(self, Family::Ipv6)
    }
}

/// Returns true if `network` is the literal all-addresses network of either family.
pub fn is_all_addresses(network: &str) -> bool {
    network == Family::of(network).all_addresses()
}

/// Parses a network string, rejecting anything that is not an address or CIDR block.
pub fn parse_network(network: &str) -> Result<IpNetwork> {
    let parsed: IpNetwork = network.parse().map_err(|e| Error::InvalidNetwork {
        network: network.to_string(),
        reason: format!("{e}"),
    })?;

    // "1.2.3.4:80" style strings would classify as IPv6 by syntax alone
    if parsed.is_ipv4() != (Family::of(network) == Family::Ipv4) {
        return Err(Error::InvalidNetwork {
            network: network.to_string(),
            reason: "address family does not match its syntax".to_string(),
        });
    }

    Ok(parsed)
}

/// Prefix length of a network string (a bare address counts as a host route).
pub fn prefix_len(network: &str) -> Result<u8> {
    parse_network(network).map(|n| n.prefix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_classification() {
        assert_eq!(Family::of("10.0.0.0/8"), Family::Ipv4);
        assert_eq!(Family::of("fd00::/64"), Family::Ipv6);
        assert_eq!(Family::of(ALL_IPV6), Family::Ipv6);
    }

    #[test]
    fn test_prefix_len() {
        assert_eq!(prefix_len("10.0.0.0/8").unwrap(), 8);
        assert_eq!(prefix_len("fd00::/48").unwrap(), 48);
        assert_eq!(prefix_len("10.8.0.1").unwrap(), 32);
        assert_eq!(prefix_len(ALL_IPV4).unwrap(), 0);
    }

    #[test]
    fn test_malformed_network_rejected() {
        assert!(matches!(
            parse_network("10.0.0.0/abc"),
            Err(Error::InvalidNetwork { .. })
        ));
        assert!(parse_network("not-a-network").is_err());
        assert!(parse_network("10.0.0.0/33").is_err());
        assert!(parse_network("").is_err());
    }

    #[test]
    fn test_all_addresses() {
        assert!(is_all_addresses("0.0.0.0/0"));
        assert!(is_all_addresses("::/0"));
        assert!(!is_all_addresses("0.0.0.0/1"));
        assert_eq!(Family::Ipv6.all_addresses(), "::/0");
    }
}
