//! Content-addressed blob store for large text fields.
//!
//! Blobs live at `<run>/blobs/<blake3 hex>.md` and are referenced from the
//! state document as `blob:<hash>`. Identical text is written once, so
//! re-saving an unchanged solution costs nothing.
//!
//! The store also understands the `file:<relative path>` pointers written by
//! older releases; both kinds are resolved strictly inside the run directory.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::ArenaResult;

pub const BLOB_PREFIX: &str = "blob:";
pub const LEGACY_FILE_PREFIX: &str = "file:";
pub const BLOB_DIR: &str = "blobs";

/// Full blake3 hex digest of `content`.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Short content id used in archive file names.
pub fn content_uid(content: &str) -> String {
    content_hash(content)[..6].to_string()
}

/// Write `bytes` to `path` through a temp file in the same directory and an
/// atomic rename. Readers see either the old file or the new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> ArenaResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Blob store rooted at a run directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    run_dir: PathBuf,
}

impl BlobStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.run_dir.join(BLOB_DIR).join(format!("{hash}.md"))
    }

    /// Store `content` and return its pointer. Existing blobs are not rewritten.
    pub fn put(&self, content: &str) -> ArenaResult<String> {
        let hash = content_hash(content);
        let path = self.blob_path(&hash);
        if !path.exists() {
            write_atomic(&path, content.as_bytes())?;
            debug!(hash = &hash[..12], bytes = content.len(), "Wrote blob");
        }
        Ok(format!("{BLOB_PREFIX}{hash}"))
    }

    /// Whether `value` is a pointer this store can resolve.
    pub fn is_pointer(value: &str) -> bool {
        value.starts_with(BLOB_PREFIX) || value.starts_with(LEGACY_FILE_PREFIX)
    }

    /// Replace a pointer with the text it references.
    ///
    /// Plain values are returned unchanged. A pointer whose target is missing
    /// or escapes the run directory resolves to empty text with a warning.
    pub fn resolve(&self, value: &str) -> String {
        if let Some(hash) = value.strip_prefix(BLOB_PREFIX) {
            if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                warn!(pointer = value, "Rejected malformed blob pointer");
                return String::new();
            }
            return self.read_or_empty(&self.blob_path(hash));
        }
        if let Some(rel) = value.strip_prefix(LEGACY_FILE_PREFIX) {
            let rel_path = Path::new(rel);
            let contained = rel_path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !contained {
                warn!(pointer = value, "Path traversal blocked");
                return String::new();
            }
            return self.read_or_empty(&self.run_dir.join(rel_path));
        }
        value.to_string()
    }

    fn read_or_empty(&self, path: &Path) -> String {
        match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Externalized file missing; using empty text"
                );
                String::new()
            }
        }
    }
}
