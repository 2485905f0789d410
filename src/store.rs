//! Artifact storage for captures and diff images.
//!
//! Every artifact gets a fresh name `<role>-<unix millis>-<sequence>.png`. The
//! sequence is a process-wide counter, so requests finishing in the same
//! millisecond still get distinct names. Nothing is ever expired here.

use crate::rendering::RenderedImage;
use crate::{ArtifactRole, Error, Result};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Opaque reference to a stored artifact: its public path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name part of the reference (everything after the last `/`).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactRef {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Where generated images go and how they come back
pub trait ArtifactStore: Send + Sync {
    /// Persist `image` as PNG and return its reference.
    fn store(&self, role: ArtifactRole, image: &RenderedImage) -> Result<ArtifactRef>;

    /// PNG bytes of a stored artifact.
    fn retrieve(&self, reference: &ArtifactRef) -> Result<Vec<u8>>;

    /// Delete a stored artifact. Missing artifacts are not an error.
    fn remove(&self, reference: &ArtifactRef) -> Result<()>;
}

/// A unique file name for an artifact of `role`.
pub fn artifact_name(role: ArtifactRole) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}.png", role, millis, seq)
}

/// Only names this store could have produced: no separators, no dot files.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn join_prefix(prefix: &str, name: &str) -> ArtifactRef {
    ArtifactRef::new(format!("{}/{}", prefix.trim_end_matches('/'), name))
}

/// PNG files in a directory
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
    prefix: String,
}

impl DirStore {
    /// Use `root` (created if missing); references are `<prefix>/<name>`.
    pub fn open(root: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            prefix: prefix.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, reference: &ArtifactRef) -> Result<PathBuf> {
        let name = reference.name();
        if !is_plain_name(name) {
            return Err(Error::NotFound(reference.to_string()));
        }
        Ok(self.root.join(name))
    }
}

impl ArtifactStore for DirStore {
    fn store(&self, role: ArtifactRole, image: &RenderedImage) -> Result<ArtifactRef> {
        let name = artifact_name(role);
        let png = image.to_png()?;
        write_atomically(&self.root.join(&name), &png)?;
        debug!("Stored {} ({} bytes)", name, png.len());
        Ok(join_prefix(&self.prefix, &name))
    }

    fn retrieve(&self, reference: &ArtifactRef) -> Result<Vec<u8>> {
        let path = self.resolve(reference)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, reference: &ArtifactRef) -> Result<()> {
        let path = self.resolve(reference)?;
        match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Write `bytes` under a hidden temporary name, then rename it into place.
///
/// Readers never observe a partial file; the temporary file is removed on failure.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InternalError(format!("Invalid artifact path {}", path.display())))?;
    let staging = path.with_file_name(format!(".{}.tmp", file_name));

    let written = fs::write(&staging, bytes).and_then(|()| fs::rename(&staging, path));
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&staging) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove {}: {}", staging.display(), cleanup);
            }
        }
        return Err(e.into());
    }
    Ok(())
}

/// In-process store, keyed by artifact name
#[derive(Debug, Default)]
pub struct MemoryStore {
    prefix: String,
    items: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryStore {
    fn store(&self, role: ArtifactRole, image: &RenderedImage) -> Result<ArtifactRef> {
        let name = artifact_name(role);
        let png = image.to_png()?;
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), png);
        Ok(join_prefix(&self.prefix, &name))
    }

    fn retrieve(&self, reference: &ArtifactRef) -> Result<Vec<u8>> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference.name())
            .cloned()
            .ok_or_else(|| Error::NotFound(reference.to_string()))
    }

    fn remove(&self, reference: &ArtifactRef) -> Result<()> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference.name());
        Ok(())
    }
}
