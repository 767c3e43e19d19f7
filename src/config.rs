//! Configuration file (`propbind.toml`)
//!
//! Everything is optional; a missing file or key falls back to the
//! registry and store defaults. Relative database paths resolve against the
//! directory the caller passes as the project base.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::registry::DEFAULT_TEXT_MAX_LENGTH;

pub const CONFIG_FILE: &str = "propbind.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropbindConfig {
    /// SQLite file, relative to the project base
    pub database: Option<String>,
    /// Default max length of text columns
    pub text_max_length: usize,
    pub foreign_keys: bool,
    /// Default for entity types that do not set it
    pub save_on_create: bool,
}

impl Default for PropbindConfig {
    fn default() -> Self {
        Self {
            database: None,
            text_max_length: DEFAULT_TEXT_MAX_LENGTH,
            foreign_keys: true,
            save_on_create: true,
        }
    }
}

impl PropbindConfig {
    /// Read a config file, `None` if it does not exist
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Config at `path`, or `propbind.toml` under `base`; defaults when absent
    pub fn discover(path: Option<&Path>, base: &Path) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| base.join(CONFIG_FILE));
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    /// Write the config as TOML, refusing to replace a file unless `force`
    pub fn save(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        if path.exists() && !force {
            anyhow::bail!("config already exists at {} (pass force to overwrite)", path.display());
        }
        self.validate()?;
        std::fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.text_max_length == 0 {
            anyhow::bail!("text_max_length must be positive");
        }
        Ok(())
    }

    pub fn database_path(&self, base: &Path) -> PathBuf {
        match &self.database {
            Some(db) if Path::new(db).is_absolute() => PathBuf::from(db),
            Some(db) => base.join(db),
            None => base.join(".propbind").join("propbind.db"),
        }
    }
}

/// Create the directory a database file will live in
pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display())),
        _ => Ok(()),
    }
}
