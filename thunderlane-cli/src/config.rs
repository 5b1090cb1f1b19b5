//! Layered configuration: bundled defaults, then the operator's file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use thunderlane_core::ThunderlaneConfig;
use toml::{Table, Value};
use tracing::{debug, warn};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Parse the configuration bundled with the binary.
pub fn bundled() -> Result<ThunderlaneConfig> {
    Ok(Value::Table(bundled_table()?).try_into()?)
}

fn bundled_table() -> Result<Table> {
    DEFAULT_CONFIG
        .parse::<Table>()
        .context("bundled default config is not valid TOML")
}

/// Loaded configuration and where it came from.
pub struct ConfigManager {
    path: PathBuf,
    from_file: bool,
    config: ThunderlaneConfig,
}

impl ConfigManager {
    /// Load from `explicit` when given (it must exist), otherwise from the
    /// platform config directory when a file is present there.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(anyhow!("config file {} does not exist", path.display()));
                }
                Self::load_with_path(path)
            }
            None => Self::load_with_path(default_config_path()?),
        }
    }

    /// Bundled defaults overlaid with `path` when it exists.
    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut merged = bundled_table()?;
        let from_file = path.exists();

        if from_file {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            let user: Table = contents
                .parse()
                .with_context(|| format!("invalid TOML in {}", path.display()))?;
            for key in user.keys().filter(|key| !merged.contains_key(*key)) {
                warn!(section = %key, path = %path.display(), "ignoring unknown config section");
            }
            merge_tables(&mut merged, user);
            debug!(path = %path.display(), "user config merged");
        }

        let config: ThunderlaneConfig = Value::Table(merged)
            .try_into()
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok(Self {
            path,
            from_file,
            config,
        })
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ThunderlaneConfig {
        &self.config
    }

    /// File consulted for overrides.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file existed and was merged.
    #[must_use]
    pub const fn from_file(&self) -> bool {
        self.from_file
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        self.config
            .validate()
            .with_context(|| format!("configuration from {} is invalid", self.path.display()))
    }

    /// Effective value at a dotted key such as `consensus.max_steps`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let mut current = Value::try_from(&self.config)?;
        for segment in key.split('.') {
            let Some(next) = current.get(segment).cloned() else {
                return Ok(None);
            };
            current = next;
        }
        Ok(Some(match current {
            Value::String(text) => text,
            other => other.to_string(),
        }))
    }

    /// Effective configuration as TOML.
    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("failed to render configuration")
    }
}

/// Overlay `overlay` onto `base`, recursing into tables; other values replace.
pub fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// `<config dir>/thunderlane/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let base =
        dirs::config_dir().ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
    Ok(base.join("thunderlane").join("config.toml"))
}
