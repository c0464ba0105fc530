//! Static settings snapshot
//!
//! Settings are read once when a [`ServerFirewall`](crate::core::firewall::ServerFirewall)
//! is constructed. A missing `config.json` yields defaults; a malformed one is an error
//! so a typo never silently changes which backend manages the kernel tables.

use crate::core::backend::BackendKind;
use crate::core::error::{Error, Result};
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternative config file
pub const CONFIG_ENV: &str = "VPNFW_CONFIG";

const DEFAULT_IPTABLES_CMD: &str = match option_env!("VPNFW_SYSTEM_IPTABLES_PATH") {
    Some(path) => path,
    None => "iptables",
};

const DEFAULT_IP6TABLES_CMD: &str = match option_env!("VPNFW_SYSTEM_IP6TABLES_PATH") {
    Some(path) => path,
    None => "ip6tables",
};

const DEFAULT_IPSET_CMD: &str = match option_env!("VPNFW_SYSTEM_IPSET_PATH") {
    Some(path) => path,
    None => "ipset",
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Preferred backend; `native` falls back to `command` when the binding is unavailable
    #[serde(default)]
    pub backend: BackendKind,
    /// Global IPv6 switch, ANDed with each server's own flag
    #[serde(default = "default_true")]
    pub ipv6: bool,
    #[serde(default = "default_iptables_cmd")]
    pub iptables_cmd: String,
    #[serde(default = "default_ip6tables_cmd")]
    pub ip6tables_cmd: String,
    #[serde(default = "default_ipset_cmd")]
    pub ipset_cmd: String,
    /// Attempts per rule insert/append before the failure is surfaced
    #[serde(default = "default_insert_attempts")]
    pub insert_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound for a single iptables insert/append invocation
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Ownership comment prefix; rules are tagged `<prefix>-<server_id>`
    #[serde(default = "default_owner_prefix")]
    pub owner_prefix: String,
    /// Reconciliation period of `vpnfw run`
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ipv6: true,
            iptables_cmd: default_iptables_cmd(),
            ip6tables_cmd: default_ip6tables_cmd(),
            ipset_cmd: default_ipset_cmd(),
            insert_attempts: default_insert_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            owner_prefix: default_owner_prefix(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl Settings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Applies `VPNFW_IPTABLES_CMD`, `VPNFW_IP6TABLES_CMD` and `VPNFW_IPSET_CMD`.
    ///
    /// Tests point these at mock scripts.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(cmd) = std::env::var("VPNFW_IPTABLES_CMD")
            && !cmd.is_empty()
        {
            self.iptables_cmd = cmd;
        }
        if let Ok(cmd) = std::env::var("VPNFW_IP6TABLES_CMD")
            && !cmd.is_empty()
        {
            self.ip6tables_cmd = cmd;
        }
        if let Ok(cmd) = std::env::var("VPNFW_IPSET_CMD")
            && !cmd.is_empty()
        {
            self.ipset_cmd = cmd;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.insert_attempts == 0 {
            return Err(Error::validation(
                "insert_attempts",
                "must be at least 1",
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::validation(
                "command_timeout_secs",
                "must be at least 1",
            ));
        }
        if crate::validators::sanitize_comment(&self.owner_prefix) != self.owner_prefix
            || self.owner_prefix.is_empty()
        {
            return Err(Error::validation(
                "owner_prefix",
                "use only a-z, 0-9, '-', '_', '.', ':' (max 64)",
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_iptables_cmd() -> String {
    DEFAULT_IPTABLES_CMD.to_string()
}

fn default_ip6tables_cmd() -> String {
    DEFAULT_IP6TABLES_CMD.to_string()
}

fn default_ipset_cmd() -> String {
    DEFAULT_IPSET_CMD.to_string()
}

fn default_insert_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_command_timeout_secs() -> u64 {
    15
}

fn default_owner_prefix() -> String {
    "pritunl".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    10
}

/// Default location of `config.json`, honouring `VPNFW_CONFIG`
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.is_empty()
    {
        return Some(PathBuf::from(path));
    }
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Loads settings from `path`, or defaults if the file does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read, is not valid JSON, or
/// holds out-of-range values.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let settings = match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str::<Settings>(&json)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            Settings::default()
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let settings = settings.with_env_overrides();
    settings.validate()?;
    Ok(settings)
}

/// Saves settings using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory (created 0o600).
/// 2. Flushes it to disk.
/// 3. Atomically renames it over the target path.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(settings)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.backend, BackendKind::Command);
        assert_eq!(settings.insert_attempts, 3);
        assert_eq!(settings.retry_delay(), Duration::from_millis(500));
        assert_eq!(settings.command_timeout(), Duration::from_secs(15));
        assert_eq!(settings.owner_prefix, "pritunl");
        assert!(settings.ipv6);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"backend":"native","ipv6":false}"#).unwrap();
        assert_eq!(settings.backend, BackendKind::Native);
        assert!(!settings.ipv6);
        assert_eq!(settings.ipset_cmd, DEFAULT_IPSET_CMD);
        assert_eq!(settings.insert_attempts, 3);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.insert_attempts, Settings::default().insert_attempts);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings(&path), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"insert_attempts":0}"#).unwrap();
        assert!(matches!(load_settings(&path), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_zero_command_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"command_timeout_secs":0}"#).unwrap();
        assert!(matches!(
            load_settings(&path),
            Err(Error::Validation { field, .. }) if field == "command_timeout_secs"
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let settings = Settings {
            backend: BackendKind::Native,
            retry_delay_ms: 10,
            ..Settings::default()
        };

        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.backend, BackendKind::Native);
        assert_eq!(loaded.retry_delay_ms, 10);
    }

    #[test]
    fn test_env_overrides_command_paths() {
        let _guard = crate::core::test_helpers::ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("VPNFW_IPSET_CMD", "/opt/ipset/bin/ipset");
            std::env::set_var("VPNFW_IPTABLES_CMD", "");
        }

        let settings = Settings::default().with_env_overrides();
        assert_eq!(settings.ipset_cmd, "/opt/ipset/bin/ipset");
        assert_eq!(settings.iptables_cmd, DEFAULT_IPTABLES_CMD);

        unsafe {
            std::env::remove_var("VPNFW_IPSET_CMD");
            std::env::remove_var("VPNFW_IPTABLES_CMD");
        }
    }
}
