//! Config discovery.
//!
//! `firstcontact.{toml,yaml,yml,json}` is looked up in the `--config-dir`
//! override when one is set, otherwise in `./` and then
//! `~/.config/firstcontact/`. `settings.toml` lives next to it.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use {
    anyhow::Context,
    tracing::{debug, info, warn},
};

use crate::{env_subst::substitute_env, schema::FirstContactConfig};

const APP_DIR: &str = "firstcontact";
const CONFIG_STEM: &str = "firstcontact";
const SETTINGS_FILENAME: &str = "settings.toml";

static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Yaml,
    Json,
}

impl Format {
    /// Extensions tried during discovery, in order.
    const EXTENSIONS: [&'static str; 4] = ["toml", "yaml", "yml", "json"];

    fn from_path(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("toml") {
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unsupported config format: .{other}"),
        }
    }

    fn parse(self, raw: &str) -> anyhow::Result<FirstContactConfig> {
        Ok(match self {
            Self::Toml => toml::from_str(raw)?,
            Self::Yaml => serde_yaml::from_str(raw)?,
            Self::Json => serde_json::from_str(raw)?,
        })
    }
}

fn override_slot() -> MutexGuard<'static, Option<PathBuf>> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Restrict discovery to `path`; `./` and the user config dir are skipped.
pub fn set_config_dir(path: PathBuf) {
    *override_slot() = Some(path);
}

#[cfg(test)]
fn clear_config_dir() {
    *override_slot() = None;
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn user_config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join(APP_DIR))
}

/// Where config and settings are written: the override, else the user dir.
fn config_dir() -> PathBuf {
    override_slot()
        .clone()
        .or_else(user_config_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn search_dirs() -> Vec<PathBuf> {
    match override_slot().clone() {
        Some(dir) => vec![dir],
        None => std::iter::once(PathBuf::from("."))
            .chain(user_config_dir())
            .collect(),
    }
}

fn find_config_file() -> Option<PathBuf> {
    search_dirs()
        .into_iter()
        .flat_map(|dir| {
            Format::EXTENSIONS
                .iter()
                .map(move |ext| dir.join(format!("{CONFIG_STEM}.{ext}")))
        })
        .find(|path| path.is_file())
}

/// Read, `${ENV}`-expand and parse one config file.
pub fn load_config(path: &Path) -> anyhow::Result<FirstContactConfig> {
    let format = Format::from_path(path)?;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    format
        .parse(&substitute_env(&raw))
        .with_context(|| format!("failed to parse {}", path.display()))
}

/// Load the first config file found, falling back to defaults.
///
/// When no file exists the defaults are written out as TOML so the operator
/// has something to edit. A file that fails to parse is reported and
/// ignored, never overwritten.
pub fn discover_and_load() -> FirstContactConfig {
    let Some(path) = find_config_file() else {
        let config = FirstContactConfig::default();
        match write_default_config(&config) {
            Ok(path) => info!(path = %path.display(), "no config file found, wrote defaults"),
            Err(e) => warn!(error = %e, "no config file found and the default could not be written"),
        }
        return config;
    };
    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        FirstContactConfig::default()
    })
}

fn write_default_config(config: &FirstContactConfig) -> anyhow::Result<PathBuf> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{CONFIG_STEM}.toml"));
    let body = toml::to_string_pretty(config).context("failed to serialize default config")?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(body.as_bytes())?;
    Ok(path)
}

/// `~/.firstcontact/`, or `./.firstcontact/` without a home directory.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(format!(".{APP_DIR}")))
        .unwrap_or_else(|| PathBuf::from(format!(".{APP_DIR}")))
}

/// Location of `settings.toml`, next to the config file.
pub fn settings_path() -> PathBuf {
    config_dir().join(SETTINGS_FILENAME)
}
