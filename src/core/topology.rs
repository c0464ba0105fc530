//! Server identity and topology
//!
//! [`ServerIdentity`] names every kernel object a server owns. [`ServerTopology`]
//! carries the interface, addresses and policy flags the compiler reads on
//! every generate.

use crate::core::error::{Error, Result};
use crate::core::network::{Family, parse_network};
use crate::validators::{
    MAX_SET_NAME_LEN, sanitize_comment, validate_identifier, validate_interface,
};
use serde::{Deserialize, Serialize};

/// `(server_id, server_type)` pair owning a set of rules and address sets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub server_id: String,
    pub server_type: String,
}

impl ServerIdentity {
    /// Longest category suffix appended to the set prefix (`r6`, `d6`, ...)
    const LONGEST_SUFFIX: usize = 2;

    /// Creates an identity, rejecting ids that would produce invalid set names.
    pub fn new(server_id: impl Into<String>, server_type: impl Into<String>) -> Result<Self> {
        let identity = Self {
            server_id: server_id.into(),
            server_type: server_type.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.server_id).map_err(|e| Error::validation("server_id", e))?;
        validate_identifier(&self.server_type)
            .map_err(|e| Error::validation("server_type", e))?;

        let longest = self.set_prefix().len() + Self::LONGEST_SUFFIX;
        if longest > MAX_SET_NAME_LEN {
            return Err(Error::validation(
                "server_id",
                format!(
                    "set names would be {longest} characters, the kernel allows {MAX_SET_NAME_LEN}"
                ),
            ));
        }
        Ok(())
    }

    /// Prefix shared by all address sets of this server (`<id>_<type>`)
    pub fn set_prefix(&self) -> String {
        format!("{}_{}", self.server_id, self.server_type)
    }

    /// Ownership comment attached to every rule (`<prefix>-<id>`)
    pub fn owner_tag(&self, owner_prefix: &str) -> String {
        sanitize_comment(&format!("{owner_prefix}-{}", self.server_id))
    }
}

/// Interface, addresses and policy flags of one VPN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTopology {
    pub virt_interface: String,
    pub virt_network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virt_network6: Option<String>,
    pub server_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_addr6: Option<String>,
    /// Clients may reach each other
    #[serde(default)]
    pub inter_client: bool,
    /// Install the default-drop band after the accept rules
    #[serde(default)]
    pub restrict_routes: bool,
    #[serde(default)]
    pub ipv6: bool,
    /// The server firewalls its own IPv6 clients rather than just routing them
    #[serde(default)]
    pub ipv6_firewall: bool,
    /// Fixed uplink for blanket masquerading under accept-all.
    ///
    /// The server-management layer never assigns this, so the masquerade
    /// branch it enables is dormant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_interface6: Option<String>,
}

impl ServerTopology {
    pub fn new(
        virt_interface: impl Into<String>,
        virt_network: impl Into<String>,
        server_addr: impl Into<String>,
    ) -> Self {
        Self {
            virt_interface: virt_interface.into(),
            virt_network: virt_network.into(),
            virt_network6: None,
            server_addr: server_addr.into(),
            server_addr6: None,
            inter_client: false,
            restrict_routes: false,
            ipv6: false,
            ipv6_firewall: false,
            uplink_interface: None,
            uplink_interface6: None,
        }
    }

    /// Enables IPv6 with the given client network and server address.
    pub fn with_ipv6(
        mut self,
        virt_network6: impl Into<String>,
        server_addr6: impl Into<String>,
    ) -> Self {
        self.ipv6 = true;
        self.virt_network6 = Some(virt_network6.into());
        self.server_addr6 = Some(server_addr6.into());
        self
    }

    /// Checks interface names and that every address parses in its family.
    pub fn validate(&self) -> Result<()> {
        let iface = validate_interface(&self.virt_interface)
            .map_err(|e| Error::validation("virt_interface", e))?;
        if iface.is_empty() {
            return Err(Error::validation("virt_interface", "cannot be empty"));
        }
        for uplink in [&self.uplink_interface, &self.uplink_interface6]
            .into_iter()
            .flatten()
        {
            validate_interface(uplink).map_err(|e| Error::validation("uplink_interface", e))?;
        }

        expect_family("virt_network", &self.virt_network, Family::Ipv4)?;
        expect_family("server_addr", &self.server_addr, Family::Ipv4)?;

        if self.ipv6 {
            let network6 = self
                .virt_network6
                .as_deref()
                .ok_or_else(|| Error::validation("virt_network6", "required when ipv6 is set"))?;
            let addr6 = self
                .server_addr6
                .as_deref()
                .ok_or_else(|| Error::validation("server_addr6", "required when ipv6 is set"))?;
            expect_family("virt_network6", network6, Family::Ipv6)?;
            expect_family("server_addr6", addr6, Family::Ipv6)?;
        }
        Ok(())
    }

    pub fn virt_network(&self, family: Family) -> Option<&str> {
        match family {
            Family::Ipv4 => Some(&self.virt_network),
            Family::Ipv6 => self.virt_network6.as_deref(),
        }
    }

    pub fn server_addr(&self, family: Family) -> Option<&str> {
        match family {
            Family::Ipv4 => Some(&self.server_addr),
            Family::Ipv6 => self.server_addr6.as_deref(),
        }
    }

    pub fn uplink_interface(&self, family: Family) -> Option<&str> {
        match family {
            Family::Ipv4 => self.uplink_interface.as_deref(),
            Family::Ipv6 => self.uplink_interface6.as_deref(),
        }
    }
}

fn expect_family(field: &str, network: &str, family: Family) -> Result<()> {
    parse_network(network)?;
    if Family::of(network) != family {
        return Err(Error::validation(field, format!("'{network}' is not {family}")));
    }
    Ok(())
}
