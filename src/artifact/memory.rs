//! In-memory artifacts over a shared byte store.
//!
//! Useful for tests and embedded runs where durable storage is unwanted.
//! The store is a lock-free map from key to encoded bytes plus write time,
//! shared by cloning.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::ArtifactError;

use super::codec::{Codec, JSON};
use super::{ArcArtifact, Artifact};

/// A concurrent in-process byte store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, (Vec<u8>, SystemTime)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// An artifact stored under a key in a [`MemoryStore`].
pub struct InMemoryArtifact {
    key: String,
    store: MemoryStore,
    codec: Codec,
}

impl InMemoryArtifact {
    pub fn new(key: impl Into<String>, store: MemoryStore) -> Self {
        Self {
            key: key.into(),
            store,
            codec: JSON,
        }
    }

    pub fn shared(key: impl Into<String>, store: MemoryStore) -> ArcArtifact {
        Arc::new(Self::new(key, store))
    }
}

impl Artifact for InMemoryArtifact {
    fn describe(&self) -> String {
        format!("in-memory '{}'", self.key)
    }

    fn exists(&self) -> bool {
        self.store.contains(&self.key)
    }

    fn last_modified(&self) -> Option<SystemTime> {
        self.store
            .entries
            .get(&self.key)
            .map(|entry| entry.value().1)
    }

    fn size(&self) -> u64 {
        self.store
            .entries
            .get(&self.key)
            .map(|entry| entry.value().0.len() as u64)
            .unwrap_or(0)
    }

    fn load(&self) -> Result<Value, ArtifactError> {
        let entry = self
            .store
            .entries
            .get(&self.key)
            .ok_or_else(|| ArtifactError::Missing(self.describe()))?;
        (self.codec.read)(&mut entry.value().0.as_slice()).map_err(|source| {
            ArtifactError::Codec {
                artifact: self.describe(),
                source,
            }
        })
    }

    fn save(&self, value: &Value) -> Result<(), ArtifactError> {
        let mut buf = Vec::new();
        (self.codec.write)(value, &mut buf).map_err(|source| ArtifactError::Codec {
            artifact: self.describe(),
            source,
        })?;
        self.store
            .entries
            .insert(self.key.clone(), (buf, SystemTime::now()));
        Ok(())
    }
}
