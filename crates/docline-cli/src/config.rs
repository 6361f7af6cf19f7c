//! Configuration file discovery and loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use docline_core::LoaderConfig;

/// Loaded configuration and the file it came from
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub loader: LoaderConfig,
    pub source: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./docline.toml (current directory)
    /// 2. ~/.config/docline/config.toml
    ///
    /// If no config file is found, returns defaults.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("docline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", "docline") {
            let user_config = dirs.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }
        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let loader = parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::info!("Loaded config from {}", path.display());
        Ok(Self {
            loader,
            source: Some(path.to_path_buf()),
        })
    }
}

/// Parse TOML, expanding `${VAR}` references in every string value.
fn parse(content: &str) -> Result<LoaderConfig> {
    let mut value: toml::Value = toml::from_str(content)?;
    expand_values(&mut value)?;
    Ok(value.try_into()?)
}

fn expand_values(value: &mut toml::Value) -> Result<()> {
    match value {
        toml::Value::String(s) => *s = expand_env_vars(s)?,
        toml::Value::Array(items) => {
            for item in items {
                expand_values(item)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                expand_values(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace each `${VAR}` with the variable's value.
fn expand_env_vars(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("unterminated variable reference in {s:?}");
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => bail!("environment variable {name} is not set"),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
