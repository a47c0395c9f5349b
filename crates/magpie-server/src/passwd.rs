//! File-backed password provider.
//!
//! Reads `user:password` lines. The whole file is loaded at startup;
//! unreadable files fail the boot rather than locking every user out
//! silently.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use magpie_xmpp::auth::{compute_ha1, PasswordError, PasswordProvider};

/// Password provider backed by a flat file.
pub struct FilePasswords {
    users: HashMap<String, String>,
}

impl FilePasswords {
    /// Load a `user:password` file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut users = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, password)) = line.split_once(':') {
                users.insert(user.to_string(), password.to_string());
            }
        }
        Ok(Self { users })
    }

    /// An empty provider that rejects everyone.
    pub fn empty() -> Self {
        Self {
            users: HashMap::new(),
        }
    }
}

#[async_trait]
impl PasswordProvider for FilePasswords {
    async fn check(
        &self,
        username: &str,
        _domain: &str,
        password: &str,
    ) -> Result<(), PasswordError> {
        match self.users.get(username) {
            Some(stored) if stored == password => Ok(()),
            _ => Err(PasswordError::Authorization),
        }
    }

    async fn digest(&self, username: &str, domain: &str) -> Result<[u8; 16], PasswordError> {
        self.users
            .get(username)
            .map(|password| compute_ha1(username, domain, password))
            .ok_or(PasswordError::Authorization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> FilePasswords {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "wonder".to_string());
        FilePasswords { users }
    }

    #[tokio::test]
    async fn check_known_user() {
        let passwords = provider();
        assert!(passwords.check("alice", "example.com", "wonder").await.is_ok());
        assert_eq!(
            passwords.check("alice", "example.com", "nope").await,
            Err(PasswordError::Authorization)
        );
        assert_eq!(
            passwords.check("bob", "example.com", "wonder").await,
            Err(PasswordError::Authorization)
        );
    }

    #[tokio::test]
    async fn digest_matches_ha1() {
        let passwords = provider();
        let ha1 = passwords.digest("alice", "example.com").await.unwrap();
        assert_eq!(ha1, compute_ha1("alice", "example.com", "wonder"));
    }
}
