//! Student, course and grade records behind a single administrator login.
//!
//! [`Gradebook`] wires the record repository, audit log, credential store and token store
//! onto one [`Storage`](io::Storage) backend.

pub mod audit;
pub mod auth;
pub mod cipher;
pub mod config;
pub mod io;
pub mod models;
pub mod repository;
pub mod util;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::audit::AuditLog;
use crate::auth::{AuthError, CredentialStore, TokenStore};
use crate::cipher::{FieldCipher, KeyError};
use crate::config::Config;
use crate::io::{FileStorage, MemoryStorage, Storage, StorageError};
use crate::repository::Repository;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub struct Gradebook {
    pub records: Repository,
    pub audit: Arc<AuditLog>,
    pub credentials: CredentialStore,
    pub tokens: TokenStore,
}

impl Gradebook {
    /// Opens the file-backed store under `config.data_dir`.
    pub fn open(config: &Config) -> Result<Self, OpenError> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::prepare(&config.data_dir)?);
        Self::with_storage(storage, config)
    }

    pub fn in_memory(config: &Config) -> Result<Self, OpenError> {
        Self::with_storage(Arc::new(MemoryStorage::new()), config)
    }

    /// Bootstraps the administrator and field key if missing.
    pub fn with_storage(storage: Arc<dyn Storage>, config: &Config) -> Result<Self, OpenError> {
        let credentials = CredentialStore::new(storage.clone());
        credentials.init()?;

        let cipher = FieldCipher::load_or_generate(&storage)?;
        let audit = Arc::new(AuditLog::new(storage.clone(), config.log_shift));
        let records = Repository::new(
            storage.clone(),
            cipher,
            audit.clone(),
            config.actor.clone(),
            config.keep_plain_identifier,
        );

        Ok(Self {
            records,
            audit,
            credentials,
            tokens: TokenStore::new(storage),
        })
    }

    /// Checks the credentials and issues a fresh token on success.
    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if !self.credentials.verify(username, password)? {
            return Err(AuthError::InvalidCredential);
        }
        Ok(self.tokens.issue()?)
    }

    /// Purges expired tokens.
    pub fn close(&self) -> Result<(), StorageError> {
        self.tokens.purge_expired(Utc::now())?;
        log::info!("Gradebook closed");
        Ok(())
    }
}
