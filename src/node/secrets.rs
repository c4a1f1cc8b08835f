//! Client base-key lookup.
//!
//! The realtime decrypt phase resolves each slot's sender to the base key
//! that client registered with this node. The store is behind a trait so
//! tests and the production registry plug in the same way.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Resolves a client identity to its registered base key.
pub trait NodeSecrets: Send + Sync {
    /// The client's base key, or `None` for unregistered clients.
    fn client_base_key(&self, client_id: &[u8]) -> Option<Vec<u8>>;
}

/// A plain in-memory registry.
#[derive(Debug, Default)]
pub struct InMemorySecrets {
    keys: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: Vec<u8>, base_key: Vec<u8>) {
        self.keys.write().insert(client_id, base_key);
    }
}

impl NodeSecrets for InMemorySecrets {
    fn client_base_key(&self, client_id: &[u8]) -> Option<Vec<u8>> {
        self.keys.read().get(client_id).cloned()
    }
}
