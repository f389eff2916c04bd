//! Operator-editable greeting policy, stored as `settings.toml`.
//!
//! Read once at startup. Every update is written to disk before it becomes
//! visible in memory.

use std::{
    collections::BTreeSet,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
};

use {
    serde::{Deserialize, Serialize},
    tempfile::NamedTempFile,
    thiserror::Error,
    tracing::{debug, info},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Greet group conversations too.
    pub allow_groups: bool,
    /// Numbers (digits only) that never get greeted.
    pub blocked_numbers: BTreeSet<String>,
}

impl Settings {
    pub fn is_blocked(&self, number: &str) -> bool {
        self.blocked_numbers.contains(number)
    }

    fn normalized(self) -> Self {
        Self {
            allow_groups: self.allow_groups,
            blocked_numbers: self
                .blocked_numbers
                .iter()
                .filter_map(|n| normalize_number(n))
                .collect(),
        }
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsPatch {
    pub allow_groups: Option<bool>,
    pub blocked_numbers: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid blocked number {0:?}: expected a phone number")]
    InvalidNumber(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Strip everything but digits (`+55 11 99999-9999` → `5511999999999`).
pub fn normalize_number(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

/// File-backed [`Settings`] holder.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
    /// Serializes updates so each one merges onto the last persisted state.
    writer: Mutex<()>,
}

impl SettingsStore {
    /// Load settings from `path`, writing defaults when the file is missing.
    pub fn load(path: PathBuf) -> Result<Self, SettingsError> {
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            let parsed: Settings = toml::from_str(&raw).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), "loaded settings");
            parsed.normalized()
        } else {
            let defaults = Settings::default();
            write_settings(&path, &defaults)?;
            info!(path = %path.display(), "wrote default settings");
            defaults
        };
        Ok(Self {
            path,
            current: RwLock::new(settings),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge `patch`, persist, and return the result. On error nothing changes.
    ///
    /// Blocks on file I/O; async callers should run it on a blocking thread.
    pub fn update(&self, patch: SettingsPatch) -> Result<Settings, SettingsError> {
        let blocked = patch
            .blocked_numbers
            .map(|numbers| {
                numbers
                    .iter()
                    .map(|n| normalize_number(n).ok_or_else(|| SettingsError::InvalidNumber(n.clone())))
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.get();
        if let Some(allow) = patch.allow_groups {
            next.allow_groups = allow;
        }
        if let Some(blocked) = blocked {
            next.blocked_numbers = blocked;
        }
        write_settings(&self.path, &next)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        info!(
            allow_groups = next.allow_groups,
            blocked = next.blocked_numbers.len(),
            "settings updated"
        );
        Ok(next)
    }
}

/// Write through a temp file in the same directory and rename it over
/// `path`, so a crash leaves either the old file or the new one.
fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let write_err = |source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let raw = toml::to_string_pretty(settings)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(raw.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
