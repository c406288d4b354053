//! Per-endpoint cache of init tokens.
//!
//! Hosts that persist state across restarts implement [`TokenStore`] over
//! their own storage. [`MemoryTokenStore`] keeps tokens for the lifetime of
//! the process.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::protocol::codec::InitToken;

/// Get/set the last known init token for an endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait TokenStore: Send + Sync {
    /// Token cached for `address`, if any.
    fn get(&self, address: &str) -> Option<InitToken>;

    /// Remember `token` for `address`.
    fn set(&self, address: &str, token: InitToken);
}

/// In-memory [`TokenStore`].
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, InitToken>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with one token.
    pub fn with_token(address: &str, token: InitToken) -> Self {
        let store = Self::new();
        store.set(address, token);
        store
    }

    /// Forget the token for `address`.
    pub fn remove(&self, address: &str) -> Option<InitToken> {
        self.tokens.write().remove(&address.to_uppercase())
    }

    /// Number of cached tokens.
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether no tokens are cached.
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, address: &str) -> Option<InitToken> {
        self.tokens.read().get(&address.to_uppercase()).copied()
    }

    fn set(&self, address: &str, token: InitToken) {
        self.tokens.write().insert(address.to_uppercase(), token);
    }
}
