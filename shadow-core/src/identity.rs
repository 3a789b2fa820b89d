//! Node identity: stable node ID, sanitization, persistence through a key-value store.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Key under which the node ID is persisted.
pub const IDENTITY_KEY: &str = "shadow-node-id";

/// Namespace tag for generated node IDs.
pub const NODE_ID_PREFIX: &str = "shadow-";

const SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Node ID. Short string, assumed unique among active peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sanitize `raw` to `[A-Za-z0-9_-]`. Returns None if nothing is left.
    pub fn sanitized(raw: &str) -> Option<Self> {
        let clean = sanitize(raw);
        if clean.is_empty() {
            None
        } else {
            Some(NodeId(clean))
        }
    }

    /// Generate `shadow-<9 base-36 chars>`.
    pub fn generate() -> Self {
        NodeId(format!("{}{}", NODE_ID_PREFIX, random_suffix()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Strip every character outside `[A-Za-z0-9_-]`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Random base-36 suffix used for node IDs, transfer IDs and message IDs.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Persistent key-value storage for the identity entry.
pub trait IdentityStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn store(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// In-memory store. Survives nothing; used by embedders without storage and by tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    values: HashMap<String, String>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: &str, value: &str) -> Self {
        let mut values = HashMap::new();
        values.insert(key.to_string(), value.to_string());
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.get(key).cloned())
    }

    fn store(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Where the node ID came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Read from the store (possibly sanitized).
    Loaded,
    /// Freshly generated and persisted.
    Generated,
    /// Store unreadable; generated for this process only.
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: NodeId,
    pub origin: IdentityOrigin,
}

/// Load the persisted node ID, or generate and persist one.
///
/// Never fails: an unreadable store yields an ephemeral ID and a failed write still
/// returns the generated ID.
pub fn ensure_identity<S: IdentityStore + ?Sized>(store: &mut S) -> Identity {
    let existing = match store.load(IDENTITY_KEY) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "identity store unreadable, using ephemeral node id");
            return Identity {
                id: NodeId::generate(),
                origin: IdentityOrigin::Ephemeral,
            };
        }
    };

    if let Some(raw) = existing {
        if let Some(id) = NodeId::sanitized(&raw) {
            if id.as_str() != raw {
                tracing::warn!(stored = %raw, sanitized = %id, "repairing persisted node id");
                persist(store, &id);
            }
            return Identity {
                id,
                origin: IdentityOrigin::Loaded,
            };
        }
        tracing::warn!(stored = %raw, "persisted node id unusable, regenerating");
    }

    let id = NodeId::generate();
    persist(store, &id);
    Identity {
        id,
        origin: IdentityOrigin::Generated,
    }
}

fn persist<S: IdentityStore + ?Sized>(store: &mut S, id: &NodeId) {
    if let Err(e) = store.store(IDENTITY_KEY, id.as_str()) {
        tracing::error!(error = %e, node_id = %id, "failed to persist node id");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    impl IdentityStore for BrokenStore {
        fn load(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }
        fn store(&mut self, _key: &str, _value: &str) -> Result<(), StoreError> {
            panic!("ephemeral identity must not be persisted");
        }
    }

    struct ReadOnlyStore;

    impl IdentityStore for ReadOnlyStore {
        fn load(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
        fn store(&mut self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("read-only".into()))
        }
    }

    #[test]
    fn generated_id_shape() {
        let id = NodeId::generate();
        assert!(id.as_str().starts_with(NODE_ID_PREFIX));
        assert_eq!(id.as_str().len(), NODE_ID_PREFIX.len() + SUFFIX_LEN);
        assert_eq!(sanitize(id.as_str()), id.as_str());
    }

    #[test]
    fn sanitize_strips_unsafe_chars() {
        assert_eq!(sanitize("shadow-a b/c!_d"), "shadow-abc_d");
        assert_eq!(sanitize("!!!"), "");
        assert!(NodeId::sanitized("$%^").is_none());
    }

    #[test]
    fn first_run_generates_and_persists() {
        let mut store = MemoryIdentityStore::new();
        let identity = ensure_identity(&mut store);
        assert_eq!(identity.origin, IdentityOrigin::Generated);
        assert_eq!(store.get(IDENTITY_KEY), Some(identity.id.as_str()));
    }

    #[test]
    fn second_run_returns_persisted_value() {
        let mut store = MemoryIdentityStore::new();
        let first = ensure_identity(&mut store);
        let second = ensure_identity(&mut store);
        assert_eq!(first.id, second.id);
        assert_eq!(second.origin, IdentityOrigin::Loaded);
    }

    #[test]
    fn corrupt_value_is_sanitized_and_written_back() {
        let mut store = MemoryIdentityStore::with_value(IDENTITY_KEY, "shadow-ab c!d");
        let identity = ensure_identity(&mut store);
        assert_eq!(identity.id.as_str(), "shadow-abcd");
        assert_eq!(identity.origin, IdentityOrigin::Loaded);
        assert_eq!(store.get(IDENTITY_KEY), Some("shadow-abcd"));
    }

    #[test]
    fn garbage_value_is_regenerated() {
        let mut store = MemoryIdentityStore::with_value(IDENTITY_KEY, "  ***  ");
        let identity = ensure_identity(&mut store);
        assert_eq!(identity.origin, IdentityOrigin::Generated);
        assert!(identity.id.as_str().starts_with(NODE_ID_PREFIX));
        assert_eq!(store.get(IDENTITY_KEY), Some(identity.id.as_str()));
    }

    #[test]
    fn unreadable_store_falls_back_to_ephemeral() {
        let identity = ensure_identity(&mut BrokenStore);
        assert_eq!(identity.origin, IdentityOrigin::Ephemeral);
        assert!(identity.id.as_str().starts_with(NODE_ID_PREFIX));
    }

    #[test]
    fn failed_write_still_returns_id() {
        let identity = ensure_identity(&mut ReadOnlyStore);
        assert_eq!(identity.origin, IdentityOrigin::Generated);
        assert!(!identity.id.is_empty());
    }
}
