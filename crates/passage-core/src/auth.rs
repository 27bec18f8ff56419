//! In-memory authentication.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::contract::{Auther, Credentials};

/// Map-backed user/password store.
///
/// Suitable for the fixed credential sets carried in service
/// configuration. SOCKS4 ident checks pass an empty password; a user
/// stored with an empty password therefore also serves as a plain
/// userid entry.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuther {
    users: HashMap<String, String>,
}

impl MemoryAuther {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_credentials<I>(creds: I) -> Self
    where
        I: IntoIterator<Item = Credentials>,
    {
        let users = creds
            .into_iter()
            .map(|c| (c.username, c.password))
            .collect();
        Self { users }
    }

    pub fn add(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Auther for MemoryAuther {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users.get(username).is_some_and(|p| p == password)
    }
}
