//! Concurrency, failure and capacity behavior of the artifact cache.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use profview::{ArtifactCache, ConverterConfig, ProfileConverter};

/// Echoes the source bytes back as the "artifact" and counts invocations,
/// slowly enough that concurrent requests really overlap.
struct CountingConverter {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingConverter {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProfileConverter for CountingConverter {
    fn convert(&self, source: &Path, _config: &ConverterConfig) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(std::fs::read(source)?)
    }
}

/// Fails on the first call, succeeds afterwards.
struct FlakyConverter {
    calls: AtomicUsize,
}

impl ProfileConverter for FlakyConverter {
    fn convert(&self, source: &Path, _config: &ConverterConfig) -> anyhow::Result<Vec<u8>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow::anyhow!("unreadable chunk at offset 17"))
                .context("recording conversion exploded");
        }
        Ok(std::fs::read(source)?)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_converge_on_one_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("recording.jfr");
    std::fs::write(&source, b"payload").unwrap();

    let converter = CountingConverter::new(Duration::from_millis(50));
    let cache = Arc::new(
        ArtifactCache::new(converter.clone() as Arc<dyn ProfileConverter>, u64::MAX).unwrap(),
    );
    let config = ConverterConfig::default();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let source = source.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get(&source, &config)
                .await
                .unwrap()
                .read()
                .await
                .unwrap()
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        bodies.push(handle.await.unwrap());
    }

    assert_eq!(converter.calls(), 1);
    for body in &bodies {
        assert_eq!(body, b"payload");
    }
    assert_eq!(cache.entry_count(), 1);
}

#[tokio::test]
async fn distinct_configs_convert_independently() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("recording.jfr");
    std::fs::write(&source, b"payload").unwrap();

    let converter = CountingConverter::new(Duration::ZERO);
    let cache = ArtifactCache::new(converter.clone() as Arc<dyn ProfileConverter>, u64::MAX).unwrap();

    let plain = ConverterConfig::default();
    let markers = ConverterConfig {
        enable_markers: true,
        ..ConverterConfig::default()
    };
    cache.get(&source, &plain).await.unwrap();
    cache.get(&source, &markers).await.unwrap();
    cache.get(&source, &plain).await.unwrap();

    assert_eq!(converter.calls(), 2);
    assert_eq!(cache.entry_count(), 2);
}

#[tokio::test]
async fn failed_conversion_preserves_diagnostics_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("recording.jfr");
    std::fs::write(&source, b"broken recording").unwrap();

    let converter = Arc::new(FlakyConverter {
        calls: AtomicUsize::new(0),
    });
    let cache = ArtifactCache::new(converter.clone() as Arc<dyn ProfileConverter>, u64::MAX).unwrap();
    let config = ConverterConfig::default();

    cache.get(&source, &config).await.unwrap_err();

    // the offending input and its error trace sit next to the original
    let copy = dir.path().join("err_recording.jfr");
    let diagnostic = dir.path().join("err_recording.jfr.txt");
    assert_eq!(std::fs::read(&copy).unwrap(), b"broken recording");
    let trace = std::fs::read_to_string(&diagnostic).unwrap();
    assert!(trace.contains("recording conversion exploded"));
    assert!(trace.contains("caused by: unreadable chunk at offset 17"));

    // the key is not poisoned: the retry converts again and succeeds
    let guard = cache.get(&source, &config).await.unwrap();
    assert_eq!(guard.read().await.unwrap(), b"broken recording");
    assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn capacity_reduction_evicts_lru_but_never_pinned_entries() {
    let dir = tempfile::tempdir().unwrap();
    let sources: Vec<_> = ["a.jfr", "b.jfr", "c.jfr"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, vec![0u8; 1000]).unwrap();
            path
        })
        .collect();

    let converter = CountingConverter::new(Duration::ZERO);
    let cache = ArtifactCache::new(converter as Arc<dyn ProfileConverter>, u64::MAX).unwrap();
    let config = ConverterConfig::default();

    cache.get(&sources[0], &config).await.unwrap();
    cache.get(&sources[1], &config).await.unwrap();
    let pinned = cache.get(&sources[2], &config).await.unwrap();
    assert_eq!(cache.usage(), 3000);

    cache.set_capacity(1500);
    // the two least-recently-used entries go, the pinned one stays
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.usage(), 1000);

    // even a zero capacity never rips a streaming artifact away
    cache.set_capacity(0);
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(pinned.read().await.unwrap().len(), 1000);

    // once the stream is done the entry is fair game again
    drop(pinned);
    cache.set_capacity(0);
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.usage(), 0);
}

#[tokio::test]
async fn modified_source_triggers_reconversion() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("recording.jfr");
    std::fs::write(&source, b"v1").unwrap();

    let converter = CountingConverter::new(Duration::ZERO);
    let cache = ArtifactCache::new(converter.clone() as Arc<dyn ProfileConverter>, u64::MAX).unwrap();
    let config = ConverterConfig::default();

    assert_eq!(cache.get(&source, &config).await.unwrap().read().await.unwrap(), b"v1");
    assert_eq!(cache.get(&source, &config).await.unwrap().read().await.unwrap(), b"v1");
    assert_eq!(converter.calls(), 1);

    // rewrite the recording and push its mtime clearly past the cached one
    std::fs::write(&source, b"v2").unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&source).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
    drop(file);

    assert_eq!(cache.get(&source, &config).await.unwrap().read().await.unwrap(), b"v2");
    assert_eq!(converter.calls(), 2);
}
