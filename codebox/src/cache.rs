//! Memoization cache for deterministic analysis operations.
//!
//! Only tools on the configured allow-list are cached; the free-form execution
//! tool never is. Keys are a SHA-256 over the tool name and the canonical
//! (key-sorted) JSON of its arguments. Every entry remembers the fingerprint of
//! each dataset file its arguments referenced, and is never served once one
//! of those fingerprints changed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{EngineError, EngineResult};
use crate::quota::{CacheEntry, Conversation, DatasetRecord, Fingerprint};

/// Longest argument string still considered as a possible dataset path.
const MAX_PATH_ARG_LEN: usize = 4096;

/// Dataset metadata as reported by the loader after a successful load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub file_path: PathBuf,
    pub shape: (u64, u64),
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub dtypes: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct MemoizationCache {
    cacheable: HashSet<String>,
}

impl MemoizationCache {
    pub fn new(cacheable_tools: &[String]) -> Self {
        Self {
            cacheable: cacheable_tools.iter().cloned().collect(),
        }
    }

    pub fn is_cacheable(&self, tool_name: &str) -> bool {
        self.cacheable.contains(tool_name)
    }

    pub fn lookup(&self, conversation: &Conversation, tool_name: &str, args: &Value) -> Option<Value> {
        if !self.is_cacheable(tool_name) {
            return None;
        }
        let key = cache_key(tool_name, args);
        conversation.with_state(|state| {
            let entry = state.cache_get(&key)?;
            let stale = entry
                .dependencies
                .iter()
                .any(|(path, recorded)| fingerprint(path).ok().as_ref() != Some(recorded));
            if stale {
                tracing::debug!(
                    conversation_id = conversation.id(),
                    tool_name,
                    "Evicting stale cache entry"
                );
                state.cache_remove(&key);
                return None;
            }
            Some(entry.result.clone())
        })
    }

    /// Store `result`; returns false (and stores nothing) for tools that are not cacheable.
    pub fn store(&self, conversation: &Conversation, tool_name: &str, args: &Value, result: Value) -> bool {
        if !self.is_cacheable(tool_name) {
            return false;
        }
        let key = cache_key(tool_name, args);
        let dependencies = dataset_dependencies(args);
        conversation.with_state(|state| {
            state.cache_put(
                key,
                CacheEntry {
                    tool_name: tool_name.to_string(),
                    result,
                    timestamp: Utc::now(),
                    dependencies,
                },
            )
        });
        true
    }

    /// Record a dataset load. If the file changed since its previous load, every
    /// cache entry derived from it is evicted first.
    pub fn record_dataset_load(
        &self,
        conversation: &Conversation,
        report: DatasetReport,
    ) -> EngineResult<DatasetRecord> {
        let path = normalize(&report.file_path);
        let fingerprint = fingerprint(&path).map_err(|source| EngineError::Dataset {
            path: path.clone(),
            source,
        })?;
        let record = DatasetRecord {
            shape: report.shape,
            columns: report.columns,
            dtypes: report.dtypes,
            digest: fingerprint_digest(&fingerprint),
            fingerprint,
            loaded_at: Utc::now(),
        };
        let evicted = conversation.with_state(|state| state.record_dataset(path.clone(), record.clone()));
        if evicted > 0 {
            tracing::info!(
                conversation_id = conversation.id(),
                path = %path.display(),
                evicted,
                "Dataset changed, invalidated derived cache entries"
            );
        }
        Ok(record)
    }
}

/// Stable key for one call: hex SHA-256 of the tool name and canonical arguments.
pub fn cache_key(tool_name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(args).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Size and modification time of `path`.
pub fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified()?;
    let (mtime_secs, mtime_nanos) = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
    };
    Ok(Fingerprint {
        size: meta.len(),
        mtime_secs,
        mtime_nanos,
    })
}

pub fn fingerprint_digest(fingerprint: &Fingerprint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.size.to_le_bytes());
    hasher.update(fingerprint.mtime_secs.to_le_bytes());
    hasher.update(fingerprint.mtime_nanos.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Every string argument naming an existing file, with its current fingerprint.
fn dataset_dependencies(args: &Value) -> BTreeMap<PathBuf, Fingerprint> {
    let mut strings = Vec::new();
    collect_strings(args, &mut strings);
    strings
        .into_iter()
        .filter(|s| !s.is_empty() && s.len() <= MAX_PATH_ARG_LEN && !s.contains('\n'))
        .filter_map(|s| {
            let path = Path::new(s);
            if !path.is_file() {
                return None;
            }
            let path = normalize(path);
            fingerprint(&path).ok().map(|fp| (path, fp))
        })
        .collect()
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

/// JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
