//! Registry mapping user-supplied file paths to the stable logical names the
//! HTTP surface addresses them by.
//!
//! Invariants:
//! - logical names are unique within a running server;
//! - a path resolves to the same logical name for the whole process, a second
//!   registration only updates the stored config override;
//! - rejected registrations leave the registry untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;

use crate::config::ConverterConfig;

/// Suffix of raw recordings that need conversion before serving.
pub const RECORDING_SUFFIX: &str = ".jfr";
/// Suffix of artifacts that are already in the served format.
pub const ARTIFACT_SUFFIX: &str = ".json.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Raw recording, converted through the artifact cache on request.
    Recording,
    /// Already-converted artifact, streamed as-is.
    PreConverted,
}

#[derive(Debug, Clone)]
pub struct RegisteredFile {
    pub logical_name: String,
    pub path: PathBuf,
    pub kind: FileKind,
    pub config_override: Option<ConverterConfig>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported file suffix (expected {RECORDING_SUFFIX} or {ARTIFACT_SUFFIX}): {0}")]
    UnsupportedSuffix(PathBuf),
    #[error("cannot resolve path {path}: {source}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Default)]
struct Maps {
    by_name: HashMap<String, RegisteredFile>,
    by_path: HashMap<PathBuf, String>,
}

/// Both indices live behind one lock so a registration is atomic with
/// respect to concurrent request handlers resolving names.
pub struct FileRegistry {
    maps: RwLock<Maps>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Register `path` and return its logical name.
    ///
    /// Re-registering a known path updates the stored config override and
    /// returns the existing name. New paths get their file stem as the name,
    /// disambiguated with `_0`, `_1`, ... when another file already took it.
    pub fn register(
        &self,
        path: &Path,
        config: Option<ConverterConfig>,
    ) -> Result<String, RegistryError> {
        let abs = absolute(path)?;
        let mut maps = self.maps.write().unwrap();

        if let Some(name) = maps.by_path.get(&abs).cloned() {
            if let Some(existing) = maps.by_name.get_mut(&name) {
                if existing.kind == FileKind::Recording {
                    existing.config_override = config;
                }
            }
            return Ok(name);
        }

        let file_name = abs
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RegistryError::UnsupportedSuffix(abs.clone()))?;
        let (stem, kind) = split_suffix(file_name)
            .ok_or_else(|| RegistryError::UnsupportedSuffix(abs.clone()))?;

        let mut name = stem.to_string();
        let mut i = 0;
        while maps.by_name.contains_key(&name) {
            name = format!("{}_{}", stem, i);
            i += 1;
        }

        let record = RegisteredFile {
            logical_name: name.clone(),
            path: abs.clone(),
            kind,
            config_override: match kind {
                FileKind::Recording => config,
                FileKind::PreConverted => None,
            },
        };
        maps.by_name.insert(name.clone(), record);
        maps.by_path.insert(abs, name.clone());
        Ok(name)
    }

    pub fn resolve(&self, name: &str) -> Option<RegisteredFile> {
        self.maps.read().unwrap().by_name.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps.read().unwrap().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn split_suffix(file_name: &str) -> Option<(&str, FileKind)> {
    if let Some(stem) = file_name.strip_suffix(RECORDING_SUFFIX) {
        return Some((stem, FileKind::Recording));
    }
    if let Some(stem) = file_name.strip_suffix(ARTIFACT_SUFFIX) {
        return Some((stem, FileKind::PreConverted));
    }
    None
}

fn absolute(path: &Path) -> Result<PathBuf, RegistryError> {
    std::path::absolute(path).map_err(|source| RegistryError::Path {
        path: path.to_path_buf(),
        source,
    })
}
