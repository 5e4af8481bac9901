//! At-rest obfuscation.
//!
//! [`FieldCipher`] protects the student identifier with AES-256-GCM under a key that is
//! generated once and persisted next to the data. [`rotate`] and [`unrotate`] are the
//! classical shift cipher applied to audit messages; they obscure text, nothing more.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::{thread_rng, Rng};
use thiserror::Error;

use crate::io::{Storage, StorageError};

pub const KEY_DOCUMENT: &str = "field.key";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("ciphered field is not valid hex: {0}")]
    Encoding(#[from] hex::FromHexError),

    #[error("ciphered field is missing its nonce")]
    Truncated,

    #[error("ciphered field failed authentication (tampered or foreign key)")]
    Authentication,

    #[error("deciphered field is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Error)]
#[error("field encryption failed")]
pub struct EncryptError;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("field key document is malformed: {0}")]
    Malformed(String),
}

/// Handles AES-256-GCM encryption of single string fields.
///
/// A ciphered field is `hex(nonce || ciphertext || tag)`.
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Loads the persisted key, generating and storing a fresh one on first use.
    pub fn load_or_generate(storage: &Arc<dyn Storage>) -> Result<Self, KeyError> {
        if let Some(raw) = storage.read(KEY_DOCUMENT)? {
            let bytes = hex::decode(raw.trim()).map_err(|e| KeyError::Malformed(e.to_string()))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|b: Vec<u8>| KeyError::Malformed(format!("expected 32 bytes, got {}", b.len())))?;
            return Ok(Self::new(&key));
        }

        let key: [u8; 32] = thread_rng().gen();
        storage.write(KEY_DOCUMENT, &hex::encode(key))?;
        log::info!("Generated new field key `{}`", KEY_DOCUMENT);
        Ok(Self::new(&key))
    }

    pub fn encrypt(&self, plain: &str) -> Result<String, EncryptError> {
        let nonce: [u8; NONCE_LEN] = thread_rng().gen();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
            .map_err(|_| EncryptError)?;

        let mut token = Vec::with_capacity(NONCE_LEN + sealed.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&sealed);
        Ok(hex::encode(token))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, DecryptError> {
        let bytes = hex::decode(token)?;
        if bytes.len() <= NONCE_LEN {
            return Err(DecryptError::Truncated);
        }
        let (nonce, sealed) = bytes.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| DecryptError::Authentication)?;
        Ok(String::from_utf8(plain)?)
    }
}

fn shift_char(c: char, shift: i32) -> char {
    let base = match c {
        'a'..='z' => b'a',
        'A'..='Z' => b'A',
        _ => return c,
    };
    let offset = (c as u8 - base) as i32;
    let rotated = ((offset + shift.rem_euclid(26)) % 26) as u8;
    (base + rotated) as char
}

/// Rotates every ASCII letter by `shift` positions, preserving case.
pub fn rotate(text: &str, shift: i32) -> String {
    text.chars().map(|c| shift_char(c, shift)).collect()
}

pub fn unrotate(text: &str, shift: i32) -> String {
    rotate(text, -(shift % 26))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStorage;

    #[test]
    fn test_field_roundtrip() {
        let cipher = FieldCipher::new(&[42u8; 32]);
        let token = cipher.encrypt("12345678900").unwrap();
        assert_ne!(token, "12345678900");
        assert_eq!(cipher.decrypt(&token).unwrap(), "12345678900");
    }

    #[test]
    fn test_tampered_field_fails() {
        let cipher = FieldCipher::new(&[42u8; 32]);
        let mut bytes = hex::decode(cipher.encrypt("2025A0001").unwrap()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(matches!(
            cipher.decrypt(&hex::encode(bytes)),
            Err(DecryptError::Authentication)
        ));
        assert!(matches!(cipher.decrypt("zz"), Err(DecryptError::Encoding(_))));
        assert!(matches!(cipher.decrypt("00ff"), Err(DecryptError::Truncated)));
    }

    #[test]
    fn test_foreign_key_fails() {
        let ours = FieldCipher::new(&[1u8; 32]);
        let theirs = FieldCipher::new(&[2u8; 32]);
        let token = theirs.encrypt("secret").unwrap();
        assert!(ours.decrypt(&token).is_err());
    }

    #[test]
    fn test_key_is_generated_once() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = FieldCipher::load_or_generate(&storage).unwrap();
        let stored = storage.read(KEY_DOCUMENT).unwrap().unwrap();

        let second = FieldCipher::load_or_generate(&storage).unwrap();
        assert_eq!(storage.read(KEY_DOCUMENT).unwrap().unwrap(), stored);
        assert_eq!(second.decrypt(&first.encrypt("abc").unwrap()).unwrap(), "abc");
    }

    #[test]
    fn test_malformed_key_is_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.write(KEY_DOCUMENT, "abcd").unwrap();
        assert!(matches!(
            FieldCipher::load_or_generate(&storage),
            Err(KeyError::Malformed(_))
        ));
    }

    #[test]
    fn test_rotation_roundtrip() {
        let text = "Aluno aprovado em Segurança! 42 - xyz";
        for shift in [-53, -26, -3, 0, 1, 5, 25, 26, 27, 1000] {
            let hidden = rotate(text, shift);
            assert_eq!(unrotate(&hidden, shift), text);
        }
        assert_ne!(rotate(text, 5), text);
    }

    #[test]
    fn test_rotation_preserves_case_and_symbols() {
        assert_eq!(rotate("Abc, XyZ!", 3), "Def, AbC!");
        assert_eq!(rotate("ç é 9 -", 7), "ç é 9 -");
    }
}
