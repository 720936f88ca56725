//! Secret storage for the UnpacMe API key.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use directories::BaseDirs;

/// Service the key is filed under
pub const SERVICE: &str = "unpacme";
/// Name of the API key secret
pub const API_KEY: &str = "api_key";

/// Errors raised by a credential store
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No home directory could be determined
    #[error("could not determine the user data directory")]
    NoDataDir,

    /// The secrets file could not be read or written
    #[error("credential store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The secrets file is corrupt
    #[error("credential store {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Get and set named secrets for one service.
pub trait CredentialStore {
    /// Secret `name`, `None` if it was never set
    fn get(&self, name: &str) -> Result<Option<String>, CredentialError>;

    /// Store `value` under `name`
    fn set(&self, name: &str, value: &str) -> Result<(), CredentialError>;
}

/// Secrets kept in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    secrets: RefCell<BTreeMap<String, String>>,
}

impl MemoryCredentialStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with an API key
    pub fn with_api_key(key: &str) -> Self {
        let store = Self::new();
        store.secrets.borrow_mut().insert(API_KEY.to_string(), key.to_string());
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, name: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.secrets.borrow().get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<(), CredentialError> {
        self.secrets.borrow_mut().insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Secrets in a JSON file under the user data directory.
///
/// The file is kept apart from the settings file and is created readable
/// by the owner only on Unix.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/unpacme/credentials.json`
    pub fn default_path() -> Result<PathBuf, CredentialError> {
        let dirs = BaseDirs::new().ok_or(CredentialError::NoDataDir)?;
        Ok(dirs.data_dir().join(SERVICE).join("credentials.json"))
    }

    /// Store at the default location
    pub fn open_default() -> Result<Self, CredentialError> {
        Ok(Self::new(Self::default_path()?))
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, CredentialError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| CredentialError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn write_all(&self, secrets: &BTreeMap<String, String>) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let contents = serde_json::to_string_pretty(secrets).map_err(|source| CredentialError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_private(&self.path, contents.as_bytes()).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: io::Error) -> CredentialError {
        CredentialError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, name: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.read_all()?.remove(name))
    }

    fn set(&self, name: &str, value: &str) -> Result<(), CredentialError> {
        let mut secrets = self.read_all()?;
        secrets.insert(name.to_string(), value.to_string());
        self.write_all(&secrets)
    }
}

/// Write `contents` to a file that is owner-only from the moment it exists.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    // The mode only applies on creation; an older file may be wider
    restrict_permissions(path)?;
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get(API_KEY).unwrap(), None);

        store.set(API_KEY, "k1").unwrap();
        assert_eq!(store.get(API_KEY).unwrap().as_deref(), Some("k1"));
        assert_eq!(
            MemoryCredentialStore::with_api_key("k2").get(API_KEY).unwrap().as_deref(),
            Some("k2")
        );
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("unpacme").join("credentials.json"));

        assert_eq!(store.get(API_KEY).unwrap(), None);
        store.set(API_KEY, "secret").unwrap();
        store.set("other", "x").unwrap();

        let reopened = FileCredentialStore::new(store.path());
        assert_eq!(reopened.get(API_KEY).unwrap().as_deref(), Some("secret"));
        assert_eq!(reopened.get("other").unwrap().as_deref(), Some("x"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        write_private(&path, b"{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let store = FileCredentialStore::new(&path);
        store.set(API_KEY, "secret").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.get(API_KEY).unwrap().as_deref(), Some("secret"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        FileCredentialStore::new(&path).set(API_KEY, "secret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "not json").unwrap();

        let store = FileCredentialStore::new(&path);
        assert!(matches!(store.get(API_KEY), Err(CredentialError::Corrupt { .. })));
    }
}
