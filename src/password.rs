//! One-way password hashing, treated as an opaque capability by the rest of
//! the crate. Hashes are PHC strings and are never inspected elsewhere.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use log::warn;

use crate::{NotesError, Result};

pub trait PasswordHashing: Send + Sync {
    fn hash(&self, password: &str) -> Result<String>;

    /// False for a wrong password and for an unparsable hash.
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Argon2id with the crate's default parameters.
#[derive(Default)]
pub struct Argon2Hashing {
    argon2: Argon2<'static>,
}

impl Argon2Hashing {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PasswordHashing for Argon2Hashing {
    fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| NotesError::PasswordHash {
                message: e.to_string(),
            })
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self
                .argon2
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!("Stored password hash could not be parsed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hasher = Argon2Hashing::new();
        let hash = hasher.hash("secret1").unwrap();

        assert!(!hash.contains("secret1"));
        assert!(hasher.verify("secret1", &hash));
        assert!(!hasher.verify("secret2", &hash));
        assert!(!hasher.verify("secret1", "not-a-phc-string"));
    }

    #[test]
    fn salts_differ() {
        let hasher = Argon2Hashing::new();
        assert_ne!(hasher.hash("pw").unwrap(), hasher.hash("pw").unwrap());
    }
}
