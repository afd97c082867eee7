//! Repository configuration stored at `<repo>/repos-config.json`

use crate::dump::UuidAction;
use crate::error::{ReposError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "repos-config.json";

/// Defaults for `dump_fs`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpDefaults {
    #[serde(default)]
    pub use_deltas: bool,
    #[serde(default)]
    pub incremental: bool,
}

/// Defaults for `load_fs`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadDefaults {
    #[serde(default)]
    pub uuid_action: UuidAction,
    #[serde(default)]
    pub use_pre_commit_hook: bool,
    #[serde(default)]
    pub use_post_commit_hook: bool,
}

/// Repository configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReposConfig {
    /// Name passed to the authorization predicate
    #[serde(default = "default_name")]
    pub name: String,
    /// Authz file, relative to the repository directory unless absolute
    #[serde(default)]
    pub authz_file: Option<PathBuf>,
    /// Decoded revisions kept in memory by the sled store
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub dump: DumpDefaults,
    #[serde(default)]
    pub load: LoadDefaults,
}

fn default_name() -> String {
    "repos".to_string()
}

fn default_cache_size() -> usize {
    64
}

impl Default for ReposConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            authz_file: None,
            cache_size: default_cache_size(),
            dump: DumpDefaults::default(),
            load: LoadDefaults::default(),
        }
    }
}

impl ReposConfig {
    /// Load the config of a repository directory; a missing file yields the
    /// defaults.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path).map_err(|e| {
            ReposError::Config(format!("Failed to read {}: {}", config_path.display(), e))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| ReposError::Config(format!("Failed to parse {}: {}", config_path.display(), e)))
    }

    /// Save atomically through a temporary file.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    /// Authz file resolved against the repository directory
    pub fn authz_path(&self, repo_path: &Path) -> Option<PathBuf> {
        self.authz_file.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                repo_path.join(p)
            }
        })
    }
}
