//! File-backed artifacts.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;
use tracing::debug;

use crate::context;
use crate::error::ArtifactError;

use super::codec::{self, Codec};
use super::{ArcArtifact, Artifact};

/// Environment variable naming the default local-store root.
pub const LOCAL_STORE_ENV: &str = "AQ_LOCAL_STORE";
/// Environment variable naming the default scratch-store root.
pub const SCRATCH_STORE_ENV: &str = "AQ_SCRATCH_STORE";

/// An artifact stored at an explicit filesystem path.
pub struct LocalFilesystemArtifact {
    path: PathBuf,
    codec: Codec,
}

impl LocalFilesystemArtifact {
    /// Create a handle; the codec is chosen from the path suffix.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let codec = codec::for_path(&path);
        Self { path, codec }
    }

    /// Create a handle with an explicit writer/reader pair.
    pub fn with_codec(path: impl Into<PathBuf>, codec: Codec) -> Self {
        Self {
            path: path.into(),
            codec,
        }
    }

    /// Shared-handle convenience.
    pub fn shared(path: impl Into<PathBuf>) -> ArcArtifact {
        std::sync::Arc::new(Self::new(path))
    }
}

impl Artifact for LocalFilesystemArtifact {
    fn describe(&self) -> String {
        format!("local file {}", self.path.display())
    }

    fn exists(&self) -> bool {
        self.path.is_file() || self.path.is_dir()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0)
    }

    fn load(&self) -> Result<Value, ArtifactError> {
        if !self.exists() {
            return Err(ArtifactError::Missing(self.describe()));
        }
        debug!(path = %self.path.display(), codec = self.codec.name, "loading artifact");
        let mut file = std::fs::File::open(&self.path)?;
        (self.codec.read)(&mut file).map_err(|source| ArtifactError::Codec {
            artifact: self.describe(),
            source,
        })
    }

    fn save(&self, value: &Value) -> Result<(), ArtifactError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %self.path.display(), codec = self.codec.name, "saving artifact");
        let mut file = std::fs::File::create(&self.path)?;
        (self.codec.write)(value, &mut file).map_err(|source| ArtifactError::Codec {
            artifact: self.describe(),
            source,
        })
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Like [`LocalFilesystemArtifact`], but relative paths are anchored at the
/// local-store root: the `aqueduct.local_store` config key, then the
/// `AQ_LOCAL_STORE` environment variable, then the working directory. With
/// `scratch` set the scratch-store root is used instead.
pub struct LocalStoreArtifact {
    inner: LocalFilesystemArtifact,
    original: PathBuf,
}

impl LocalStoreArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::anchored(path, false)
    }

    pub fn scratch(path: impl Into<PathBuf>) -> Self {
        Self::anchored(path, true)
    }

    pub fn shared(path: impl Into<PathBuf>) -> ArcArtifact {
        std::sync::Arc::new(Self::new(path))
    }

    fn anchored(path: impl Into<PathBuf>, scratch: bool) -> Self {
        let original: PathBuf = path.into();
        let resolved = if original.is_absolute() {
            original.clone()
        } else {
            store_root(scratch).join(&original)
        };
        Self {
            inner: LocalFilesystemArtifact::new(resolved),
            original,
        }
    }
}

fn store_root(scratch: bool) -> PathBuf {
    let (config_key, env_var) = if scratch {
        ("aqueduct.scratch_store", SCRATCH_STORE_ENV)
    } else {
        ("aqueduct.local_store", LOCAL_STORE_ENV)
    };

    if let Some(root) = context::current_config()
        .get(config_key)
        .and_then(|v| v.as_str().map(PathBuf::from))
    {
        return root;
    }
    if let Ok(root) = std::env::var(env_var) {
        return PathBuf::from(root);
    }
    PathBuf::from(".")
}

impl Artifact for LocalStoreArtifact {
    fn describe(&self) -> String {
        format!("store file {}", self.original.display())
    }

    fn exists(&self) -> bool {
        self.inner.exists()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        self.inner.last_modified()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn load(&self) -> Result<Value, ArtifactError> {
        self.inner.load()
    }

    fn save(&self, value: &Value) -> Result<(), ArtifactError> {
        self.inner.save(value)
    }

    fn path(&self) -> Option<&Path> {
        self.inner.path()
    }
}
