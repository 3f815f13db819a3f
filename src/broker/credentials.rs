//! Credential store
//!
//! Username/password pairs loaded once at startup and only read afterwards,
//! so the broker shares it without a lock.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later entries for the same username replace earlier ones.
    pub fn from_credentials<I>(credentials: I) -> Self
    where
        I: IntoIterator<Item = Credential>,
    {
        let users = credentials
            .into_iter()
            .map(|c| (c.username, c.password))
            .collect();
        Self { users }
    }

    /// Exact, case-sensitive match on both fields.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl FromIterator<Credential> for CredentialStore {
    fn from_iter<T: IntoIterator<Item = Credential>>(iter: T) -> Self {
        Self::from_credentials(iter)
    }
}
