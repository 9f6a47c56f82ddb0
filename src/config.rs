//! Runtime options threaded into the composing layers and back-ends.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_list_with_xattrs() -> bool {
    true
}

/// 45 minutes, the ingest overlay default.
fn default_visibility_timeout() -> u64 {
    45 * 60
}

/// Options carried alongside calls. Logging is deliberately absent: the
/// embedding application installs the process-wide `tracing` subscriber.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// When false, back-ends may skip extended attributes in `list` and
    /// `walk` to save round-trips.
    pub list_with_xattrs: bool,
    /// Root directory for persistent handle databases; absent means no
    /// handle database is created.
    pub persistent_storage: Option<PathBuf>,
    /// Suppresses handle databases even when storage is configured.
    pub disable_persistent_handle_db: bool,
    /// Native back-end derives handles from the underlying inode numbers.
    pub use_server_inodes: bool,
    /// Native back-end accepts `chown`; otherwise it refuses.
    pub allow_server_chown: bool,
    /// When set, `open_file` is only allowed under these prefixes.
    pub open_file_allowed_paths: Option<Vec<String>>,
    /// Ingest overlay: how long tagged uploads stay visible to their
    /// uploader, in seconds.
    pub file_visibility_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            list_with_xattrs: default_list_with_xattrs(),
            persistent_storage: None,
            disable_persistent_handle_db: false,
            use_server_inodes: false,
            allow_server_chown: false,
            open_file_allowed_paths: None,
            file_visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

impl Config {
    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| Error::Invalid(err.to_string()))
    }

    /// Reads and parses a TOML config file.
    pub async fn load(file: &std::path::Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(file).await?;
        Self::from_toml_str(&raw)
    }

    pub fn file_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.file_visibility_timeout_secs)
    }

    /// Whether a persistent handle database should exist for a mount
    /// whose back-end cannot resolve handles natively.
    pub fn handle_db_root(&self) -> Option<&std::path::Path> {
        if self.disable_persistent_handle_db {
            return None;
        }
        self.persistent_storage.as_deref()
    }
}
