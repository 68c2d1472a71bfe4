//! File-backed state store for a single run directory
//!
//! The run state lives in `<run>/state.yaml`. Large text fields are written
//! to the content-addressed [`BlobStore`] and replaced by pointers, so the
//! document itself stays small and diffable. Every write goes through a
//! temp file and an atomic rename.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::blob::{write_atomic, BlobStore};
use super::legacy;
use super::types::RunState;
use crate::error::{ArenaError, ArenaResult};

pub const STATE_FILE: &str = "state.yaml";
pub const LEGACY_STATE_FILE: &str = "state.json";

/// Version written by [`StateStore::save`].
pub const CURRENT_VERSION: u32 = 2;

const VERSION_KEY: &str = "version";

/// State store rooted at one run directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    run_dir: PathBuf,
    blobs: BlobStore,
}

impl StateStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        let run_dir = run_dir.into();
        Self {
            blobs: BlobStore::new(run_dir.clone()),
            run_dir,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.run_dir.join(STATE_FILE)
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Path of the document to load; the YAML file wins over legacy JSON.
    fn existing_document(&self) -> Option<PathBuf> {
        [STATE_FILE, LEGACY_STATE_FILE]
            .iter()
            .map(|name| self.run_dir.join(name))
            .find(|p| p.exists())
    }

    pub fn exists(&self) -> bool {
        self.existing_document().is_some()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Load the run state, or `None` when no document exists.
    ///
    /// Pointers are resolved back to inline text; missing blobs resolve to
    /// empty text with a warning.
    pub fn load(&self) -> ArenaResult<Option<RunState>> {
        let Some(path) = self.existing_document() else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(&path)?;
        // JSON is a subset of YAML, so one parser covers both formats.
        let value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let mut mapping = match value {
            serde_yaml::Value::Null => return Ok(None),
            serde_yaml::Value::Mapping(m) => m,
            other => {
                return Err(ArenaError::malformed(format!(
                    "{} must contain a mapping at the top level, found {}",
                    path.display(),
                    value_kind(&other)
                )))
            }
        };

        let version = match mapping.remove(VERSION_KEY) {
            None => 1,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| ArenaError::malformed("version must be a positive integer"))?,
        };

        let mut state = match version {
            1 => legacy::upgrade(serde_yaml::Value::Mapping(mapping))?,
            CURRENT_VERSION => serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))?,
            found if found > CURRENT_VERSION => {
                return Err(ArenaError::UnsupportedVersion {
                    found,
                    supported: CURRENT_VERSION,
                })
            }
            found => {
                return Err(ArenaError::malformed(format!(
                    "unknown state document version {found}"
                )))
            }
        };

        self.resolve_pointers(&mut state);
        debug!(path = %path.display(), version, round = state.round, phase = %state.phase, "Loaded state");
        Ok(Some(state))
    }

    /// Load the run state, failing with [`ArenaError::StateNotFound`] when absent.
    pub fn load_required(&self) -> ArenaResult<RunState> {
        self.load()?.ok_or_else(|| ArenaError::StateNotFound {
            path: self.run_dir.clone(),
        })
    }

    fn resolve_pointers(&self, state: &mut RunState) {
        for map in [
            &mut state.solutions,
            &mut state.analyses,
            &mut state.critiques,
        ] {
            for value in map.values_mut() {
                if BlobStore::is_pointer(value) {
                    *value = self.blobs.resolve(value);
                }
            }
        }
        for list in [&mut state.verdict_history, &mut state.verify_results] {
            for value in list.iter_mut() {
                if BlobStore::is_pointer(value) {
                    *value = self.blobs.resolve(value);
                }
            }
        }
        if let Some(value) = state.final_verdict.as_mut() {
            if BlobStore::is_pointer(value) {
                *value = self.blobs.resolve(value);
            }
        }
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Persist the run state atomically.
    ///
    /// Blobs are written before the document so a crash never leaves the
    /// document pointing at text that was not stored.
    pub fn save(&self, state: &RunState) -> ArenaResult<()> {
        std::fs::create_dir_all(&self.run_dir)?;

        let mut doc = state.clone();
        for map in [&mut doc.solutions, &mut doc.analyses, &mut doc.critiques] {
            for value in map.values_mut() {
                if !value.is_empty() {
                    *value = self.blobs.put(value)?;
                }
            }
        }
        for list in [&mut doc.verdict_history, &mut doc.verify_results] {
            for value in list.iter_mut() {
                if !value.is_empty() {
                    *value = self.blobs.put(value)?;
                }
            }
        }
        if let Some(value) = doc.final_verdict.as_mut() {
            if !value.is_empty() {
                *value = self.blobs.put(value)?;
            }
        }

        let body = match serde_yaml::to_value(&doc)? {
            serde_yaml::Value::Mapping(m) => m,
            _ => return Err(ArenaError::malformed("run state did not serialize to a mapping")),
        };
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert(VERSION_KEY.into(), CURRENT_VERSION.into());
        mapping.extend(body);

        let serialized = serde_yaml::to_string(&mapping)?;
        write_atomic(&self.state_path(), serialized.as_bytes())?;

        let legacy = self.run_dir.join(LEGACY_STATE_FILE);
        if legacy.exists() {
            if let Err(e) = std::fs::remove_file(&legacy) {
                warn!(path = %legacy.display(), error = %e, "Failed to remove superseded state.json");
            }
        }
        Ok(())
    }
}

fn value_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a sequence",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}
