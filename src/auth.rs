use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{Algorithm, Params, Pbkdf2};
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::io::{read_json, write_json, Storage, StorageError};
use crate::models::AdminCredential;

pub const ADMIN_DOCUMENT: &str = "admin.json";
pub const TOKEN_DOCUMENT: &str = "tokens.json";

pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "1234";

pub const PBKDF2_ROUNDS: u32 = 100_000;
pub const HASH_LENGTH: usize = 32;

pub fn token_ttl() -> Duration {
    Duration::hours(8)
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Provided credentials are invalid")]
    InvalidCredential,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<pbkdf2::password_hash::Error> for AuthError {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        AuthError::Hashing(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Eq, Ord, PartialOrd, PartialEq)]
pub enum AuthResult {
    Success,
    SessionExpired,
    InvalidSession,
}

/// PBKDF2-HMAC-SHA256 of `password` under `salt`, as the B64 hash output.
fn derive_hash(password: &str, salt: &SaltString) -> Result<String, AuthError> {
    let params = Params {
        rounds: PBKDF2_ROUNDS,
        output_length: HASH_LENGTH,
    };
    let hash = Pbkdf2.hash_password_customized(
        password.as_bytes(),
        Some(Algorithm::Pbkdf2Sha256.ident()),
        None,
        params,
        salt,
    )?;
    hash.hash
        .map(|output| output.to_string())
        .ok_or_else(|| AuthError::Hashing("hash output missing".to_string()))
}

fn credential_for(username: &str, password: &str) -> Result<AdminCredential, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(AdminCredential {
        username: username.to_string(),
        password_hash: derive_hash(password, &salt)?,
        salt: salt.as_str().to_string(),
    })
}

/// The single administrator identity.
pub struct CredentialStore {
    storage: Arc<dyn Storage>,
    gate: Mutex<()>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            gate: Mutex::new(()),
        }
    }

    /// Creates the default administrator when none has been stored yet.
    pub fn init(&self) -> Result<(), AuthError> {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if self.load()?.is_some() {
            return Ok(());
        }
        let credential = credential_for(DEFAULT_USERNAME, DEFAULT_PASSWORD)?;
        write_json(self.storage.as_ref(), ADMIN_DOCUMENT, &credential)?;
        log::info!(
            "Created default administrator `{}`; change its password",
            DEFAULT_USERNAME
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<AdminCredential>, AuthError> {
        Ok(read_json(self.storage.as_ref(), ADMIN_DOCUMENT)?)
    }

    /// The stored salt and hash reassembled as a PHC string.
    fn phc(credential: &AdminCredential) -> String {
        format!(
            "${}$i={},l={}${}${}",
            Algorithm::Pbkdf2Sha256.ident(),
            PBKDF2_ROUNDS,
            HASH_LENGTH,
            credential.salt,
            credential.password_hash
        )
    }

    fn matches(credential: &AdminCredential, password: &str) -> Result<bool, AuthError> {
        let phc = Self::phc(credential);
        let hash = PasswordHash::new(&phc)?;
        match Pbkdf2.verify_password(password.as_bytes(), &hash) {
            Ok(()) => Ok(true),
            Err(pbkdf2::password_hash::Error::Password) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Mismatches are `Ok(false)`; only storage or hashing faults are errors.
    pub fn verify(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        match self.load()? {
            Some(credential) if credential.username == username => {
                Self::matches(&credential, password)
            }
            _ => Ok(false),
        }
    }

    /// Replaces salt and hash together.
    pub fn change_password(&self, old: &str, new: &str) -> Result<(), AuthError> {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.load()?.ok_or(AuthError::InvalidCredential)?;
        if !Self::matches(&current, old)? {
            return Err(AuthError::InvalidCredential);
        }
        let rotated = credential_for(&current.username, new)?;
        write_json(self.storage.as_ref(), ADMIN_DOCUMENT, &rotated)?;
        log::info!("Password of `{}` changed", rotated.username);
        Ok(())
    }
}

/// Bearer tokens mapped to their expiry.
pub struct TokenStore {
    storage: Arc<dyn Storage>,
    gate: Mutex<()>,
}

fn new_token() -> String {
    let token_bytes: [u8; 32] = thread_rng().gen();

    let mut hasher: Sha256 = Digest::new();
    hasher.update(token_bytes);
    hex::encode(hasher.finalize())
}

impl TokenStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            gate: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, DateTime<Utc>>, StorageError> {
        Ok(read_json(self.storage.as_ref(), TOKEN_DOCUMENT)?.unwrap_or_default())
    }

    fn save(&self, tokens: &HashMap<String, DateTime<Utc>>) -> Result<(), StorageError> {
        write_json(self.storage.as_ref(), TOKEN_DOCUMENT, tokens)
    }

    pub fn issue(&self) -> Result<String, StorageError> {
        self.issue_at(Utc::now())
    }

    pub fn issue_at(&self, now: DateTime<Utc>) -> Result<String, StorageError> {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let mut tokens = self.load()?;
        let token = new_token();
        tokens.insert(token.clone(), now.add(token_ttl()));
        self.save(&tokens)?;
        Ok(token)
    }

    pub fn check(&self, token: &str) -> Result<AuthResult, StorageError> {
        self.check_at(token, Utc::now())
    }

    /// Expired tokens are dropped as a side effect of being checked.
    pub fn check_at(&self, token: &str, now: DateTime<Utc>) -> Result<AuthResult, StorageError> {
        if token.is_empty() {
            return Ok(AuthResult::InvalidSession);
        }
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let mut tokens = self.load()?;
        let expires_at = match tokens.get(token) {
            Some(expires_at) => *expires_at,
            None => return Ok(AuthResult::InvalidSession),
        };
        if now.gt(&expires_at) {
            tokens.remove(token);
            self.save(&tokens)?;
            return Ok(AuthResult::SessionExpired);
        }
        Ok(AuthResult::Success)
    }

    pub fn validate(&self, token: &str) -> Result<bool, StorageError> {
        Ok(self.check(token)? == AuthResult::Success)
    }

    pub fn revoke(&self, token: &str) -> Result<(), StorageError> {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let mut tokens = self.load()?;
        if tokens.remove(token).is_some() {
            self.save(&tokens)?;
        }
        Ok(())
    }

    /// Drops every expired token, returning how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let mut tokens = self.load()?;
        let before = tokens.len();
        tokens.retain(|_, expires_at| now.le(expires_at));
        let purged = before - tokens.len();
        if purged > 0 {
            self.save(&tokens)?;
            log::warn!("Purged {} expired tokens", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStorage;

    fn stores() -> (Arc<dyn Storage>, CredentialStore, TokenStore) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let credentials = CredentialStore::new(storage.clone());
        credentials.init().unwrap();
        (storage.clone(), credentials, TokenStore::new(storage))
    }

    #[test]
    fn test_default_admin_verifies() {
        let (storage, credentials, _) = stores();
        assert!(credentials.verify("admin", "1234").unwrap());
        assert!(!credentials.verify("admin", "wrong").unwrap());
        assert!(!credentials.verify("root", "1234").unwrap());

        let raw = storage.read(ADMIN_DOCUMENT).unwrap().unwrap();
        assert!(!raw.contains("1234\""));
    }

    #[test]
    fn test_verify_uses_stored_salt_and_hash() {
        let (storage, credentials, _) = stores();
        let mut stored: AdminCredential = read_json(storage.as_ref(), ADMIN_DOCUMENT)
            .unwrap()
            .unwrap();
        let salt = SaltString::new(&stored.salt).unwrap();
        assert_eq!(derive_hash("1234", &salt).unwrap(), stored.password_hash);

        stored.password_hash = derive_hash("other", &salt).unwrap();
        write_json(storage.as_ref(), ADMIN_DOCUMENT, &stored).unwrap();
        assert!(!credentials.verify("admin", "1234").unwrap());
        assert!(credentials.verify("admin", "other").unwrap());

        stored.salt = "not a salt!".to_string();
        write_json(storage.as_ref(), ADMIN_DOCUMENT, &stored).unwrap();
        assert!(matches!(
            credentials.verify("admin", "other"),
            Err(AuthError::Hashing(_))
        ));
    }

    #[test]
    fn test_init_keeps_existing_admin() {
        let (storage, credentials, _) = stores();
        credentials.change_password("1234", "s3cret").unwrap();
        let stored = storage.read(ADMIN_DOCUMENT).unwrap();

        credentials.init().unwrap();
        assert_eq!(storage.read(ADMIN_DOCUMENT).unwrap(), stored);
        assert!(credentials.verify("admin", "s3cret").unwrap());
    }

    #[test]
    fn test_change_password_rotates_salt() {
        let (storage, credentials, _) = stores();
        let before: AdminCredential = read_json(storage.as_ref(), ADMIN_DOCUMENT)
            .unwrap()
            .unwrap();

        credentials.change_password("1234", "nova_senha").unwrap();
        let after: AdminCredential = read_json(storage.as_ref(), ADMIN_DOCUMENT)
            .unwrap()
            .unwrap();

        assert_ne!(before.salt, after.salt);
        assert!(credentials.verify("admin", "nova_senha").unwrap());
        assert!(!credentials.verify("admin", "1234").unwrap());

        // same password again still gets a fresh salt
        credentials.change_password("nova_senha", "nova_senha").unwrap();
        let again: AdminCredential = read_json(storage.as_ref(), ADMIN_DOCUMENT)
            .unwrap()
            .unwrap();
        assert_ne!(after.salt, again.salt);
    }

    #[test]
    fn test_change_password_requires_old_password() {
        let (_, credentials, _) = stores();
        assert!(matches!(
            credentials.change_password("nope", "other"),
            Err(AuthError::InvalidCredential)
        ));
        assert!(credentials.verify("admin", "1234").unwrap());
    }

    #[test]
    fn test_token_lifecycle() {
        let (_, _, tokens) = stores();
        let token = tokens.issue().unwrap();
        assert_eq!(token.len(), 64);
        assert!(tokens.validate(&token).unwrap());

        tokens.revoke(&token).unwrap();
        assert!(!tokens.validate(&token).unwrap());

        // revoke is a no-op for unknown tokens
        tokens.revoke(&token).unwrap();
        assert!(!tokens.validate("").unwrap());
        assert!(!tokens.validate("not-a-token").unwrap());
    }

    #[test]
    fn test_expired_token_is_dropped_on_check() {
        let (storage, _, tokens) = stores();
        let issued_at = Utc::now();
        let token = tokens.issue_at(issued_at).unwrap();

        let almost = issued_at + token_ttl();
        assert_eq!(tokens.check_at(&token, almost).unwrap(), AuthResult::Success);

        let later = almost + Duration::seconds(1);
        assert_eq!(
            tokens.check_at(&token, later).unwrap(),
            AuthResult::SessionExpired
        );
        let remaining: HashMap<String, DateTime<Utc>> =
            read_json(storage.as_ref(), TOKEN_DOCUMENT).unwrap().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(
            tokens.check_at(&token, issued_at).unwrap(),
            AuthResult::InvalidSession
        );
    }

    #[test]
    fn test_purge_expired() {
        let (_, _, tokens) = stores();
        let now = Utc::now();
        let stale = tokens.issue_at(now - Duration::hours(9)).unwrap();
        let fresh = tokens.issue_at(now).unwrap();

        assert_eq!(tokens.purge_expired(now).unwrap(), 1);
        assert_eq!(tokens.check_at(&stale, now - Duration::hours(9)).unwrap(), AuthResult::InvalidSession);
        assert!(tokens.validate(&fresh).unwrap());
    }
}
