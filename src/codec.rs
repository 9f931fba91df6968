//! Compression Codec (spec §4.2): transparent gzip of object bodies.
//! Grounded on `harborgrid-justin-caddy/src/database/backup.rs`'s
//! `GzEncoder`/`GzDecoder` usage, generalized to a read/write codec that
//! every adapter shares.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    pub compression: bool,
    /// zlib level, 1..9 (spec §6 `compressionLevel`).
    pub compression_level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: true,
            compression_level: 6,
        }
    }
}

/// Encodes/decodes object bodies and derives the logical-path <-> on-disk
/// filename mapping (`*.json` vs `*.json.gz`).
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> CodecConfig {
        self.config
    }

    /// Serialize + (optionally) gzip a JSON value.
    pub fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, StorageError> {
        let raw = serde_json::to_vec(value)?;
        if self.config.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.config.compression_level));
            encoder.write_all(&raw)?;
            Ok(encoder.finish()?)
        } else {
            Ok(raw)
        }
    }

    /// The filename suffix a fresh write should use for `logical_path`.
    pub fn write_suffix(&self) -> &'static str {
        if self.config.compression {
            ".gz"
        } else {
            ""
        }
    }

    /// Decodes bytes read from `physical_path`, auto-detecting gzip by
    /// the gzip magic number rather than trusting the file extension —
    /// this is what makes mixed-format reads work regardless of which
    /// instance (compression on or off) wrote the file.
    pub fn decode(&self, physical_path: &str, bytes: &[u8]) -> Result<serde_json::Value, StorageError> {
        let is_gzip = bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b;
        let raw: Vec<u8> = if is_gzip {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| StorageError::Corrupt {
                path: physical_path.to_string(),
                reason: format!("gzip decode failed: {e}"),
            })?;
            out
        } else {
            bytes.to_vec()
        };
        serde_json::from_slice(&raw).map_err(|e| StorageError::Corrupt {
            path: physical_path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Candidate physical paths to try on read, in preference order:
    /// compressed first, then the plain twin (spec §4.2).
    pub fn read_candidates(&self, logical_path: &str) -> Vec<String> {
        vec![format!("{logical_path}.gz"), logical_path.to_string()]
    }

    /// Collapses `path`, `path.gz`, `path.json.gz`-style duplicates from a
    /// raw directory/key listing into one logical path per entity, as
    /// `listObjectsUnderPath` must (spec §4.2, §4.7).
    pub fn dedup_logical_paths(physical_paths: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        for p in physical_paths {
            let logical = p.strip_suffix(".gz").unwrap_or(&p).to_string();
            seen.insert(logical);
        }
        seen.into_iter().collect()
    }
}
