//! Converter configuration shared between the CLI, the cache and the HTTP
//! layer.
//!
//! The config travels two ways: the caller hands it to the conversion step
//! untouched, and the server fills in the source-link fields advertised to
//! the profiler UI right before each conversion. Its fingerprint doubles as
//! half of the artifact-cache key, so two conversions of the same recording
//! with different settings never collide.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Knobs forwarded to the conversion step.
///
/// `source_open_url` / `source_fetch_url` are not user-supplied: the server
/// overwrites them per request depending on which navigation callbacks are
/// live, so the UI knows whether to POST a jump-to-source request, GET the
/// source text, or hide the source links entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Package prefixes treated as library code rather than project code.
    pub non_project_package_prefixes: Vec<String>,
    /// Upper bound on emitted stack depth, unlimited when absent.
    pub max_stack_depth: Option<u32>,
    /// Emit per-event markers alongside the sample data.
    pub enable_markers: bool,
    /// Endpoint the UI should POST jump-to-source requests to.
    pub source_open_url: Option<String>,
    /// Endpoint the UI should GET source text from.
    pub source_fetch_url: Option<String>,
}

impl ConverterConfig {
    /// Parse a CLI-supplied config string. Empty input means defaults,
    /// anything else must be a JSON object.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_json::from_str(input)?;
        Ok(config)
    }

    /// Stable hex fingerprint over the canonical JSON form, used as the
    /// config half of the artifact-cache key.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex(&hasher.finalize())
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
