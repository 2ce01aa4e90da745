//! On-demand conversion cache for profile artifacts.
//!
//! One gzipped JSON artifact lives on disk per (source path, config
//! fingerprint) key, produced lazily by the pluggable [`ProfileConverter`]
//! and served from a temp directory owned by the cache. The interesting
//! guarantees:
//! - at most one conversion runs per key, however many requests race on it;
//!   latecomers wait on the in-flight slot and observe its result;
//! - a failed conversion records nothing, so the next request retries; the
//!   offending input and a diagnostic trace are preserved next to it first;
//! - capacity sweeps evict least-recently-used entries but never one that an
//!   [`ArtifactGuard`] is still pinning for a response in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::{hex, ConverterConfig};

/// Matches the historical default of roughly 2 GB of converted artifacts.
pub const DEFAULT_CAPACITY: u64 = 2_000_000_000;

/// The conversion step. Implementations are externally owned; the cache only
/// requires the output to be the final servable bytes (gzipped JSON).
pub trait ProfileConverter: Send + Sync {
    fn convert(&self, source: &Path, config: &ConverterConfig) -> anyhow::Result<Vec<u8>>;
}

/// Built-in stand-in converter: emits a minimal gzipped profile envelope
/// describing the recording, so the server and its tests run without an
/// external converter wired in.
pub struct GzJsonConverter;

impl ProfileConverter for GzJsonConverter {
    fn convert(&self, source: &Path, config: &ConverterConfig) -> anyhow::Result<Vec<u8>> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let meta = std::fs::metadata(source)?;
        let profile = serde_json::json!({
            "meta": {
                "product": source.file_name().and_then(|n| n.to_str()),
                "sourceFile": source.display().to_string(),
                "recordingBytes": meta.len(),
                "sourceOpenUrl": config.source_open_url,
                "sourceFetchUrl": config.source_fetch_url,
                "markers": config.enable_markers,
            },
            "threads": [],
        });
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, &profile)?;
        encoder.flush()?;
        Ok(encoder.finish()?)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("conversion of {path} failed: {source}")]
    Convert {
        path: PathBuf,
        source: anyhow::Error,
    },
}

struct Entry {
    artifact_path: PathBuf,
    len: u64,
    source_mtime: SystemTime,
    last_used: u64,
    pin: Arc<()>,
}

struct CacheState {
    capacity: u64,
    total: u64,
    tick: u64,
    entries: HashMap<String, Entry>,
}

/// Pins a cache entry while its bytes are being served; the capacity sweep
/// skips pinned entries.
#[derive(Debug)]
pub struct ArtifactGuard {
    path: PathBuf,
    _pin: Arc<()>,
}

impl ArtifactGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

pub struct ArtifactCache {
    root: PathBuf,
    dir: StdMutex<Option<TempDir>>,
    converter: Arc<dyn ProfileConverter>,
    state: StdMutex<CacheState>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    pub fn new(converter: Arc<dyn ProfileConverter>, capacity: u64) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("profview-cache-").tempdir()?;
        Ok(Self {
            root: dir.path().to_path_buf(),
            dir: StdMutex::new(Some(dir)),
            converter,
            state: StdMutex::new(CacheState {
                capacity,
                total: 0,
                tick: 0,
                entries: HashMap::new(),
            }),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Return the artifact for `(source, config)`, converting it first if no
    /// fresh entry exists. Concurrent callers for the same key converge on a
    /// single conversion.
    pub async fn get(
        &self,
        source: &Path,
        config: &ConverterConfig,
    ) -> Result<ArtifactGuard, CacheError> {
        let key = self.key(source, config);
        let _slot = self.conversion_slot(&key).await;

        let mtime = tokio::fs::metadata(source)
            .await
            .and_then(|m| m.modified())
            .map_err(|source_err| CacheError::Io {
                path: source.to_path_buf(),
                source: source_err,
            })?;

        if let Some(guard) = self.fresh_guard(&key, mtime) {
            debug!(source = %source.display(), "artifact cache hit");
            return Ok(guard);
        }

        let bytes = {
            let converter = Arc::clone(&self.converter);
            let source = source.to_path_buf();
            let config = config.clone();
            tokio::task::spawn_blocking(move || converter.convert(&source, &config))
                .await
                .unwrap_or_else(|join_err| Err(anyhow::anyhow!(join_err)))
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                self.preserve_failure(source, &err);
                return Err(CacheError::Convert {
                    path: source.to_path_buf(),
                    source: err,
                });
            }
        };

        // write-then-rename, so a reader still holding the previous artifact
        // for this key never sees a truncated file
        let artifact_path = self.root.join(format!("{}.json.gz", key));
        let staging_path = self.root.join(format!("{}.json.gz.tmp", key));
        let write = async {
            tokio::fs::write(&staging_path, &bytes).await?;
            tokio::fs::rename(&staging_path, &artifact_path).await
        };
        write.await.map_err(|source_err| CacheError::Io {
            path: artifact_path.clone(),
            source: source_err,
        })?;

        let guard = {
            let mut state = self.state.lock().unwrap();
            state.tick += 1;
            let entry = Entry {
                artifact_path: artifact_path.clone(),
                len: bytes.len() as u64,
                source_mtime: mtime,
                last_used: state.tick,
                pin: Arc::new(()),
            };
            let guard = ArtifactGuard {
                path: artifact_path,
                _pin: Arc::clone(&entry.pin),
            };
            state.total += entry.len;
            state.entries.insert(key, entry);
            guard
        };
        self.enforce_capacity();
        Ok(guard)
    }

    pub fn set_capacity(&self, bytes: u64) {
        {
            let mut state = self.state.lock().unwrap();
            state.capacity = bytes;
        }
        info!(capacity = bytes, "artifact cache capacity changed");
        self.enforce_capacity();
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().unwrap().capacity
    }

    /// Bytes currently accounted to cached artifacts.
    pub fn usage(&self) -> u64 {
        self.state.lock().unwrap().total
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Drop all entries and remove the backing directory. Called from the
    /// process-exit path; later `get` calls will fail on the missing root.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.entries.clear();
            state.total = 0;
        }
        if let Some(dir) = self.dir.lock().unwrap().take() {
            if let Err(err) = dir.close() {
                warn!("failed to remove artifact cache directory: {}", err);
            }
        }
    }

    fn key(&self, source: &Path, config: &ConverterConfig) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_os_str().as_encoded_bytes());
        hasher.update([0]);
        hasher.update(config.fingerprint().as_bytes());
        hex(&hasher.finalize())
    }

    /// Per-key conversion slot; holding the guard makes this caller the only
    /// one probing or producing the key.
    async fn conversion_slot(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut in_flight = self.in_flight.lock().await;
            Arc::clone(
                in_flight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        slot.lock_owned().await
    }

    fn fresh_guard(&self, key: &str, mtime: SystemTime) -> Option<ArtifactGuard> {
        let mut state = self.state.lock().unwrap();
        state.tick += 1;
        let tick = state.tick;
        match state.entries.get_mut(key) {
            Some(entry) if entry.source_mtime >= mtime && entry.artifact_path.exists() => {
                entry.last_used = tick;
                Some(ArtifactGuard {
                    path: entry.artifact_path.clone(),
                    _pin: Arc::clone(&entry.pin),
                })
            }
            Some(_) => {
                // source changed under us (or the file vanished): forget the
                // entry and reconvert
                let entry = state.entries.remove(key).unwrap();
                state.total -= entry.len;
                None
            }
            None => None,
        }
    }

    fn enforce_capacity(&self) {
        let mut state = self.state.lock().unwrap();
        while state.total > state.capacity {
            let victim = state
                .entries
                .iter()
                .filter(|(_, entry)| Arc::strong_count(&entry.pin) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                // every remaining entry is mid-stream; the next sweep catches up
                break;
            };
            let entry = state.entries.remove(&key).unwrap();
            state.total -= entry.len;
            let _ = std::fs::remove_file(&entry.artifact_path);
            debug!(len = entry.len, "evicted cached artifact");
        }
    }

    /// Keep the failing input and its error trace next to the original for
    /// postmortem inspection. Best effort, the conversion error itself is
    /// what propagates.
    fn preserve_failure(&self, source: &Path, err: &anyhow::Error) {
        let (Some(parent), Some(name)) = (source.parent(), source.file_name().and_then(|n| n.to_str()))
        else {
            return;
        };
        let copy = parent.join(format!("err_{}", name));
        let diagnostic = parent.join(format!("err_{}.txt", name));
        let _ = std::fs::copy(source, &copy);
        let mut text = err.to_string();
        for cause in err.chain().skip(1) {
            text.push_str("\ncaused by: ");
            text.push_str(&cause.to_string());
        }
        text.push('\n');
        let _ = std::fs::write(&diagnostic, text);
        warn!(
            source = %source.display(),
            "conversion failed, input and diagnostics preserved as err_ files"
        );
    }
}
