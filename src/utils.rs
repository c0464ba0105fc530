//! Utility functions for directory management
//!
//! Follows the XDG Base Directory specification:
//!
//! - Data: `~/.local/share/vpnfw/` - `config.json`
//! - State: `~/.local/state/vpnfw/` - audit log and CLI log file
//!
//! Services running as root get the root user's directories.

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "vpnfw", "vpnfw").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "vpnfw", "vpnfw")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    builder.mode(0o700); // User read/write/execute only
    builder.recursive(true);

    if let Some(dir) = get_data_dir() {
        builder.create(dir)?;
    }
    if let Some(dir) = get_state_dir() {
        builder.create(dir)?;
    }

    Ok(())
}
