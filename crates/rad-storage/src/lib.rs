use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use toml::{Table, Value};

type Sections = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Two-level key/value store for display settings.
///
/// Reads never fail: a store answers from what it loaded. Writes are durable
/// before they return `Ok`, and a failed write leaves the store unchanged.
pub trait SettingsStore: Send + Sync {
    fn get(&self, section: &str, key: &str) -> Option<String>;

    fn set(&self, section: &str, key: &str, value: &str) -> Result<(), StorageError>;

    /// All keys of one section, sorted by key.
    fn entries(&self, section: &str) -> Vec<(String, String)>;
}

/// TOML-backed settings file. Each section is a table of string values:
///
/// ```toml
/// [HomeAssistant]
/// url = "http://hub.local:8123"
/// assist_entity = "assist_1"
/// ```
pub struct SettingsFile {
    path: Option<PathBuf>,
    sections: Mutex<Sections>,
}

impl SettingsFile {
    /// Loads `path`, treating a missing file as empty. The file is created on
    /// the first successful `set`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let sections = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
            parse_sections(&contents).map_err(|message| StorageError::Parse {
                path: path.clone(),
                message,
            })?
        } else {
            Sections::new()
        };
        Ok(Self {
            path: Some(path),
            sections: Mutex::new(sections),
        })
    }

    pub fn open_in_memory() -> Self {
        Self {
            path: None,
            sections: Mutex::new(Sections::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Sections> {
        self.sections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, sections: &Sections) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = toml::to_string_pretty(sections)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            StorageError::Io {
                path: path.clone(),
                source,
            }
        })
    }
}

impl SettingsStore for SettingsFile {
    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.lock()
            .get(section)
            .and_then(|values| values.get(key))
            .cloned()
    }

    fn set(&self, section: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let mut sections = self.lock();
        let mut next = sections.clone();
        next.entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        *sections = next;
        Ok(())
    }

    fn entries(&self, section: &str) -> Vec<(String, String)> {
        self.lock()
            .get(section)
            .map(|values| {
                values
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn parse_sections(contents: &str) -> Result<Sections, String> {
    let table: Table = contents.parse().map_err(|err: toml::de::Error| err.to_string())?;
    let mut sections = Sections::new();
    for (name, value) in table {
        let Value::Table(entries) = value else {
            continue;
        };
        let values = entries
            .into_iter()
            .filter_map(|(key, value)| scalar_text(value).map(|text| (key, text)))
            .collect();
        sections.insert(name, values);
    }
    Ok(sections)
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Integer(number) => Some(number.to_string()),
        Value::Float(number) => Some(number.to_string()),
        Value::Boolean(flag) => Some(flag.to_string()),
        Value::Datetime(stamp) => Some(stamp.to_string()),
        Value::Array(_) | Value::Table(_) => None,
    }
}
