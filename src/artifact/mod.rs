//! Artifacts: addressable cached task outputs.
//!
//! An artifact is a handle over durable storage. Its existence and
//! freshness gate whether a task's requirements are even expanded; its
//! `load`/`save` operations are how pruned tasks produce values and how
//! autosaved results persist. Concrete kinds:
//!
//! - [`local::LocalFilesystemArtifact`] — a file, decoded by a
//!   [`codec::Codec`] writer/reader pair,
//! - [`local::LocalStoreArtifact`] — same, with relative paths anchored at
//!   the configured local (or scratch) store root,
//! - [`memory::InMemoryArtifact`] — bytes in a shared in-process store,
//! - [`composite::CompositeArtifact`] — all-or-nothing group of children.

pub mod codec;
pub mod composite;
pub mod local;
pub mod memory;
pub mod report;

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;

use crate::error::ArtifactError;

pub use codec::Codec;
pub use composite::CompositeArtifact;
pub use local::{LocalFilesystemArtifact, LocalStoreArtifact};
pub use memory::{InMemoryArtifact, MemoryStore};

/// Shared handle to an artifact.
pub type ArcArtifact = Arc<dyn Artifact>;

/// A cached output handle.
pub trait Artifact: Send + Sync {
    /// Short human-readable description for logs and reports.
    fn describe(&self) -> String;

    /// Does the stored value exist?
    fn exists(&self) -> bool;

    /// When the stored value was last written. `None` means unknown and is
    /// treated as oldest by the cache gate.
    fn last_modified(&self) -> Option<SystemTime> {
        None
    }

    /// Stored size in bytes (sum over children for groups).
    fn size(&self) -> u64;

    /// Decode the stored value.
    fn load(&self) -> Result<Value, ArtifactError>;

    /// Encode and store a value.
    fn save(&self, value: &Value) -> Result<(), ArtifactError>;

    /// Child artifacts, for group kinds.
    fn children(&self) -> Option<&[ArcArtifact]> {
        None
    }

    /// Filesystem location, when the artifact is file-backed. Used by the
    /// CLI's `artifact ls` and `del` commands.
    fn path(&self) -> Option<&Path> {
        None
    }
}
