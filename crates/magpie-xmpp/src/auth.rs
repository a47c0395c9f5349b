//! Password provider contract.
//!
//! The TURN relay and the admin auth endpoint look up long-term credentials
//! through this trait. Implementations may be backed by a file, an HTTP
//! endpoint, or a SQL store; the core only sees the contract.

use async_trait::async_trait;
use md5::{Digest, Md5};

/// Failure categories for credential lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordError {
    /// The credentials were rejected. Callers must not reveal which part
    /// of {username, password, realm} was wrong.
    Authorization,
    /// The backend is temporarily unavailable; the client may retry.
    Temporary,
}

/// Provider of long-term credentials.
#[async_trait]
pub trait PasswordProvider: Send + Sync + 'static {
    /// Verify a plaintext password for `username@domain`.
    async fn check(&self, username: &str, domain: &str, password: &str)
        -> Result<(), PasswordError>;

    /// Fetch the MD5 HA1 digest (`MD5(user:realm:password)`) for
    /// `username@domain`.
    async fn digest(&self, username: &str, domain: &str) -> Result<[u8; 16], PasswordError>;
}

/// Compute the HA1 digest from its inputs.
pub fn compute_ha1(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// In-memory provider for tests and static deployments.
pub struct MemoryPasswords {
    users: std::collections::HashMap<(String, String), String>,
}

impl MemoryPasswords {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self {
            users: std::collections::HashMap::new(),
        }
    }

    /// Add a user credential.
    pub fn with_user(mut self, username: &str, domain: &str, password: &str) -> Self {
        self.users
            .insert((username.to_string(), domain.to_string()), password.to_string());
        self
    }
}

impl Default for MemoryPasswords {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasswordProvider for MemoryPasswords {
    async fn check(
        &self,
        username: &str,
        domain: &str,
        password: &str,
    ) -> Result<(), PasswordError> {
        match self.users.get(&(username.to_string(), domain.to_string())) {
            Some(stored) if stored == password => Ok(()),
            _ => Err(PasswordError::Authorization),
        }
    }

    async fn digest(&self, username: &str, domain: &str) -> Result<[u8; 16], PasswordError> {
        self.users
            .get(&(username.to_string(), domain.to_string()))
            .map(|password| compute_ha1(username, domain, password))
            .ok_or(PasswordError::Authorization)
    }
}
