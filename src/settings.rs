//! Persisted gateway host, read fresh each time an endpoint is needed.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::warn;

pub const SERVER_HOST_KEY: &str = "beacon_server_ip";
pub const DEFAULT_SERVER_HOST: &str = "192.168.61.162";
pub const SERVER_PORT: u16 = 5000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerEndpoint {
            host: host.into(),
            port,
        }
    }

    /// Endpoint on the fixed gateway port.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self::new(host, SERVER_PORT)
    }

    pub fn status_url(&self) -> String {
        format!("http://{}:{}/get_status", self.host, self.port)
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::with_host(DEFAULT_SERVER_HOST)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file {path} is not a JSON object: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("host must not be empty")]
    EmptyHost,
}

/// String key-value store. Writes are last-write-wins.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// Current gateway endpoint. Never fails: a missing, blank or unreadable
/// setting falls back to [`DEFAULT_SERVER_HOST`].
pub fn current_endpoint(store: &dyn SettingsStore) -> ServerEndpoint {
    match store.get(SERVER_HOST_KEY) {
        Ok(Some(host)) if !host.trim().is_empty() => ServerEndpoint::with_host(host.trim()),
        Ok(_) => ServerEndpoint::default(),
        Err(err) => {
            warn!("Could not read gateway host, using default: {}", err);
            ServerEndpoint::default()
        }
    }
}

pub fn save_host(store: &dyn SettingsStore, host: &str) -> Result<(), SettingsError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(SettingsError::EmptyHost);
    }
    store.set(SERVER_HOST_KEY, host)
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings kept as a flat JSON object on disk.
///
/// Every `get` re-reads the file. `set` writes a sibling temp file and renames
/// it over the original, so readers see either the old or the new contents.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSettingsStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, SettingsError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents).map_err(|source| SettingsError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self.load().unwrap_or_else(|err| {
            warn!("Discarding unreadable settings file: {}", err);
            HashMap::new()
        });
        values.insert(key.to_string(), value.to_string());

        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        let contents = serde_json::to_string_pretty(&values)
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let store = MemorySettingsStore::new();
        let endpoint = current_endpoint(&store);
        assert_eq!(endpoint.host, DEFAULT_SERVER_HOST);
        assert_eq!(endpoint.port, SERVER_PORT);
        assert_eq!(endpoint.status_url(), "http://192.168.61.162:5000/get_status");
    }

    #[test]
    fn test_saved_host_is_used() {
        let store = MemorySettingsStore::new();
        save_host(&store, " 10.0.0.7 ").unwrap();
        assert_eq!(current_endpoint(&store), ServerEndpoint::with_host("10.0.0.7"));

        save_host(&store, "10.0.0.8").unwrap();
        assert_eq!(current_endpoint(&store).host, "10.0.0.8");
    }

    #[test]
    fn test_blank_host_rejected_and_ignored() {
        let store = MemorySettingsStore::new();
        assert!(matches!(save_host(&store, "  "), Err(SettingsError::EmptyHost)));

        store.set(SERVER_HOST_KEY, "").unwrap();
        assert_eq!(current_endpoint(&store).host, DEFAULT_SERVER_HOST);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = FileSettingsStore::new(&path);
        assert_eq!(store.get(SERVER_HOST_KEY).unwrap(), None);
        save_host(&store, "gateway.local").unwrap();

        let reopened = FileSettingsStore::new(&path);
        assert_eq!(current_endpoint(&reopened).host, "gateway.local");
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn test_file_store_corrupt_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let store = FileSettingsStore::new(&path);
        assert!(matches!(
            store.get(SERVER_HOST_KEY),
            Err(SettingsError::Corrupt { .. })
        ));
        assert_eq!(current_endpoint(&store).host, DEFAULT_SERVER_HOST);

        save_host(&store, "10.1.1.1").unwrap();
        assert_eq!(current_endpoint(&store).host, "10.1.1.1");
    }
}
