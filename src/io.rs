use std::collections::HashMap;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored document `{name}` is unreadable: {message}")]
    Corrupt { name: String, message: String },

    #[error("Could not serialize `{name}`: {source}")]
    Serialization {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Flat, whole-document persistence. Every collection is read and written as one unit.
pub trait Storage: Send + Sync {
    fn read(&self, name: &str) -> Result<Option<String>, StorageError>;

    fn write(&self, name: &str, contents: &str) -> Result<(), StorageError>;

    fn remove(&self, name: &str) -> Result<(), StorageError>;
}

pub fn read_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    name: &str,
) -> Result<Option<T>, StorageError> {
    match storage.read(name)? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StorageError::Corrupt {
                name: name.to_string(),
                message: err.to_string(),
            }),
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    name: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string_pretty(value).map_err(|source| StorageError::Serialization {
        name: name.to_string(),
        source,
    })?;
    storage.write(name, &raw)
}

/// Documents stored as files below a single data directory.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn prepare<P: Into<PathBuf>>(root: P) -> Result<Self, StorageError> {
        let root = root.into();
        create_dir_all(&root).map_err(|source| StorageError::Io {
            name: root.display().to_string(),
            source,
        })?;
        log::info!("Using data directory {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Storage for FileStorage {
    fn read(&self, name: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_of(name);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|source| StorageError::Io {
                name: name.to_string(),
                source,
            })
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        let target = self.path_of(name);
        let staging = self.path_of(&format!(".{}.tmp", name));
        let io_err = |source| StorageError::Io {
            name: name.to_string(),
            source,
        };
        // rename is atomic on the same filesystem, so readers never see a torn file
        fs::write(&staging, contents).map_err(io_err)?;
        fs::rename(&staging, &target).map_err(io_err)
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path_of(name);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_file(path).map_err(|source| StorageError::Io {
            name: name.to_string(),
            source,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, name: &str) -> Result<Option<String>, StorageError> {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(documents.get(name).cloned())
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.remove(name);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("gradebook-test-{}", rand::random::<u32>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_lifecycle() {
        let dir = scratch_dir();
        let storage = FileStorage::prepare(&dir).unwrap();

        assert!(storage.read("students.json").unwrap().is_none());

        storage.write("students.json", "[]").unwrap();
        assert_eq!(storage.read("students.json").unwrap().as_deref(), Some("[]"));

        // Overwrite replaces the whole document
        storage.write("students.json", "[1]").unwrap();
        assert_eq!(storage.read("students.json").unwrap().as_deref(), Some("[1]"));
        assert!(!dir.join(".students.json.tmp").exists());

        storage.remove("students.json").unwrap();
        assert!(storage.read("students.json").unwrap().is_none());

        // Remove idempotent
        storage.remove("students.json").unwrap();

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_document_is_reported() {
        let storage = MemoryStorage::new();
        storage.write("logs.json", "{not json").unwrap();

        let result = read_json::<Vec<u32>>(&storage, "logs.json");
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_json_helpers() {
        let storage = MemoryStorage::new();
        assert!(read_json::<Vec<u32>>(&storage, "numbers.json")
            .unwrap()
            .is_none());

        write_json(&storage, "numbers.json", &vec![1u32, 2, 3]).unwrap();
        let numbers: Vec<u32> = read_json(&storage, "numbers.json").unwrap().unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
