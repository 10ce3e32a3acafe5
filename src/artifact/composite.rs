//! Artifact groups.

use std::time::SystemTime;

use serde_json::Value;

use crate::error::ArtifactError;

use super::{ArcArtifact, Artifact};

/// A sequence of artifacts treated as one.
///
/// Exists only when every child exists; freshness is the stalest child;
/// loading yields the children's values as a list. Saving is a no-op: each
/// child is owned and written by its own task.
pub struct CompositeArtifact {
    children: Vec<ArcArtifact>,
}

impl CompositeArtifact {
    pub fn new(children: Vec<ArcArtifact>) -> Self {
        Self { children }
    }

    pub fn shared(children: Vec<ArcArtifact>) -> ArcArtifact {
        std::sync::Arc::new(Self::new(children))
    }
}

impl Artifact for CompositeArtifact {
    fn describe(&self) -> String {
        format!("composite of {} artifacts", self.children.len())
    }

    fn exists(&self) -> bool {
        self.children.iter().all(|child| child.exists())
    }

    fn last_modified(&self) -> Option<SystemTime> {
        // The group is only as fresh as its stalest member; an unknown
        // child makes the whole group unknown (oldest).
        let mut oldest: Option<SystemTime> = None;
        for child in &self.children {
            match child.last_modified() {
                None => return None,
                Some(at) => {
                    oldest = Some(match oldest {
                        None => at,
                        Some(current) => current.min(at),
                    });
                }
            }
        }
        oldest
    }

    fn size(&self) -> u64 {
        self.children.iter().map(|child| child.size()).sum()
    }

    fn load(&self) -> Result<Value, ArtifactError> {
        let values: Result<Vec<_>, _> =
            self.children.iter().map(|child| child.load()).collect();
        Ok(Value::Array(values?))
    }

    fn save(&self, _value: &Value) -> Result<(), ArtifactError> {
        Ok(())
    }

    fn children(&self) -> Option<&[ArcArtifact]> {
        Some(&self.children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::memory::{InMemoryArtifact, MemoryStore};
    use serde_json::json;

    #[test]
    fn exists_iff_all_children_exist() {
        let store = MemoryStore::new();
        let a = InMemoryArtifact::shared("a", store.clone());
        let b = InMemoryArtifact::shared("b", store.clone());
        let group = CompositeArtifact::new(vec![a.clone(), b.clone()]);

        assert!(!group.exists());
        a.save(&json!(1)).unwrap();
        assert!(!group.exists());
        b.save(&json!(2)).unwrap();
        assert!(group.exists());
    }

    #[test]
    fn size_is_the_sum_and_load_collects_children() {
        let store = MemoryStore::new();
        let a = InMemoryArtifact::shared("a", store.clone());
        let b = InMemoryArtifact::shared("b", store.clone());
        a.save(&json!("left")).unwrap();
        b.save(&json!("right")).unwrap();

        let group = CompositeArtifact::new(vec![a.clone(), b.clone()]);
        assert_eq!(group.size(), a.size() + b.size());
        assert_eq!(group.load().unwrap(), json!(["left", "right"]));
    }

    #[test]
    fn empty_group_exists() {
        let group = CompositeArtifact::new(Vec::new());
        assert!(group.exists());
        assert_eq!(group.size(), 0);
    }
}
