use thiserror::Error;

/// Core error types for vpnfw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables/ip6tables/ipset exited unsuccessfully
    #[error("{program} failed: {message}")]
    Command {
        program: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// A bounded command did not finish in time and was killed
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    /// A network string could not be parsed as an address or CIDR block
    #[error("Invalid network '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },

    /// Identity or topology input failed validation
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// The `iptables` crate (which drives the iptables binary) reported an error
    #[error("iptables library error: {0}")]
    Native(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Captured stderr of a failed command, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Command { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables/ipset error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run vpnfw as root or with CAP_NET_ADMIN")
                .with_suggestion("Check that the service unit does not drop capabilities");
        }

        // Missing binaries
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables or ipset is not installed or not found in PATH")
                .with_suggestion("Install iptables and ipset: sudo apt install iptables ipset  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables ipset  (Fedora/RHEL)")
                .with_suggestion("Or point iptables_cmd / ipset_cmd in config.json at the binaries");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("another app is currently holding") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Another firewall manager may be applying rules right now")
                .with_suggestion("Check for conflicting managers: sudo systemctl status firewalld ufw")
                .with_suggestion("The rule will be retried on the next reconciliation pass");
        }

        // Referenced set is missing
        if lower.contains("set") && lower.contains("doesn't exist") {
            return ErrorTranslation::new("Referenced address set does not exist")
                .with_suggestion("Address sets are created by generate; run it before reconciling")
                .with_suggestion("List sets: sudo ipset list -n")
                .with_help("https://ipset.netfilter.org/ipset.man.html");
        }

        // Set already exists on create
        if lower.contains("set with the same name already exists") {
            return ErrorTranslation::new("Address set already exists")
                .with_suggestion("A previous instance may not have been torn down")
                .with_suggestion("The set is still referenced by a rule and cannot be destroyed")
                .with_help("https://ipset.netfilter.org/ipset.man.html");
        }

        // Chain errors
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match extension not available")
                .with_suggestion("Load the missing modules: sudo modprobe xt_set xt_NETMAP xt_conntrack")
                .with_suggestion("NAT rules need the nat table: sudo modprobe iptable_nat");
        }

        // Bad rule
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("Rule not found in chain")
                .with_suggestion("The rule may have been removed by another process")
                .with_suggestion("It will be re-added on the next reconciliation pass");
        }

        // Invalid address
        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use proper IP format: 10.8.0.0/24")
                .with_suggestion("For IPv6: fd00::/64")
                .with_help("https://en.wikipedia.org/wiki/Classless_Inter-Domain_Routing");
        }

        // Resource busy
        if lower.contains("resource busy") || lower.contains("in use by a kernel component") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("The set is still referenced by an installed rule")
                .with_suggestion("Remove the rules first, then destroy the set");
        }

        // Timeout errors
        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The firewall operation took too long")
                .with_suggestion("Check system load: uptime");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command() {
        let translation = IptablesErrorPattern::match_error("command not found: ipset");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_xtables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("xtables lock"));
    }

    #[test]
    fn test_missing_set() {
        let translation = IptablesErrorPattern::match_error(
            "iptables v1.8.7 (legacy): Set abc_serverr doesn't exist.",
        );
        assert!(translation.user_message.contains("address set"));
        assert!(translation.help_url.is_some());
    }

    #[test]
    fn test_missing_extension() {
        let translation =
            IptablesErrorPattern::match_error("iptables: No chain/target/match by that name.");
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("modprobe"))
        );
    }

    #[test]
    fn test_fallback_keeps_message() {
        let translation = IptablesErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_stderr_accessor() {
        let err = Error::Command {
            program: "iptables".into(),
            message: "exit status 1".into(),
            stderr: Some("Bad rule".into()),
            exit_code: Some(1),
        };
        assert_eq!(err.stderr(), Some("Bad rule"));
        assert_eq!(Error::Internal("x".into()).stderr(), None);
    }
}
