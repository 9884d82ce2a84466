//! Per-conversation execution state
//!
//! One [`ConversationExecutionState`] exists per conversation id. It is only
//! ever touched while holding that conversation's lock, and counters only go
//! down through an explicit [`ConversationExecutionState::reset`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

use crate::outcome::OutcomeKind;

/// One executed (or rejected) snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub code: String,
    pub outcome_kind: OutcomeKind,
    pub referenced_variables: Vec<String>,
}

/// Cheap content-change proxy for a file: size plus modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

/// Metadata reported by the dataset loader, plus what the engine computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub shape: (u64, u64),
    pub columns: Vec<String>,
    pub dtypes: BTreeMap<String, String>,
    pub fingerprint: Fingerprint,
    /// Hex digest of the fingerprint
    pub digest: String,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tool_name: String,
    pub result: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Dataset paths the result was derived from, with their fingerprint at write time
    pub dependencies: BTreeMap<PathBuf, Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationExecutionState {
    total_executions: u32,
    per_tool_executions: HashMap<String, u32>,
    consecutive_failures: u32,
    history_cap: usize,
    code_history: VecDeque<HistoryEntry>,
    loaded_datasets: HashMap<PathBuf, DatasetRecord>,
    current_dataset: Option<PathBuf>,
    cache: HashMap<String, CacheEntry>,
    last_successful_code: Option<String>,
    active_variables: Vec<String>,
}

impl ConversationExecutionState {
    pub fn new(history_cap: usize) -> Self {
        Self {
            total_executions: 0,
            per_tool_executions: HashMap::new(),
            consecutive_failures: 0,
            history_cap: history_cap.max(1),
            code_history: VecDeque::new(),
            loaded_datasets: HashMap::new(),
            current_dataset: None,
            cache: HashMap::new(),
            last_successful_code: None,
            active_variables: Vec::new(),
        }
    }

    pub fn total_executions(&self) -> u32 {
        self.total_executions
    }

    pub fn tool_executions(&self, tool_name: &str) -> u32 {
        self.per_tool_executions.get(tool_name).copied().unwrap_or(0)
    }

    pub fn per_tool_executions(&self) -> &HashMap<String, u32> {
        &self.per_tool_executions
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.code_history
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    pub fn datasets(&self) -> &HashMap<PathBuf, DatasetRecord> {
        &self.loaded_datasets
    }

    pub fn dataset(&self, path: &Path) -> Option<&DatasetRecord> {
        self.loaded_datasets.get(path)
    }

    pub fn current_dataset(&self) -> Option<&Path> {
        self.current_dataset.as_deref()
    }

    pub fn last_successful_code(&self) -> Option<&str> {
        self.last_successful_code.as_deref()
    }

    pub fn active_variables(&self) -> &[String] {
        &self.active_variables
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Append to the code history, evicting the oldest entries past the cap.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.code_history.push_back(entry);
        while self.code_history.len() > self.history_cap {
            self.code_history.pop_front();
        }
    }

    /// Remember the last snippet that ran cleanly and the variables it defined.
    pub fn note_success(&mut self, code: &str, variables: &[String]) {
        self.last_successful_code = Some(code.to_string());
        for var in variables {
            if !self.active_variables.contains(var) {
                self.active_variables.push(var.clone());
            }
        }
    }

    pub(crate) fn charge(&mut self, tool_name: &str) {
        self.total_executions = self.total_executions.saturating_add(1);
        let count = self
            .per_tool_executions
            .entry(tool_name.to_string())
            .or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Update the failure streak and return its new value.
    pub(crate) fn record_result(&mut self, success: bool) -> u32 {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.consecutive_failures
    }

    /// Store dataset metadata; returns the number of cache entries evicted
    /// because the path's fingerprint changed.
    pub(crate) fn record_dataset(&mut self, path: PathBuf, record: DatasetRecord) -> usize {
        let changed = self
            .loaded_datasets
            .get(&path)
            .map(|previous| previous.fingerprint != record.fingerprint)
            .unwrap_or(false);
        let evicted = if changed {
            self.invalidate_path(&path)
        } else {
            0
        };
        self.loaded_datasets.insert(path.clone(), record);
        self.current_dataset = Some(path);
        evicted
    }

    /// Evict every cache entry derived from `path`.
    pub(crate) fn invalidate_path(&mut self, path: &Path) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| !entry.dependencies.contains_key(path));
        before - self.cache.len()
    }

    pub(crate) fn cache_get(&self, key: &str) -> Option<&CacheEntry> {
        self.cache.get(key)
    }

    pub(crate) fn cache_put(&mut self, key: String, entry: CacheEntry) {
        self.cache.insert(key, entry);
    }

    pub(crate) fn cache_remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.cache.remove(key)
    }

    /// Explicit reset: clears counters, the failure streak, history and cache.
    /// Dataset metadata survives since the files are still loaded.
    pub fn reset(&mut self) {
        self.total_executions = 0;
        self.per_tool_executions.clear();
        self.consecutive_failures = 0;
        self.code_history.clear();
        self.cache.clear();
        self.last_successful_code = None;
        self.active_variables.clear();
    }
}

/// A conversation's lane lock and its state.
#[derive(Debug)]
pub struct Conversation {
    id: String,
    lane: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<ConversationExecutionState>,
}

impl Conversation {
    fn new(id: &str, history_cap: usize) -> Self {
        Self {
            id: id.to_string(),
            lane: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(ConversationExecutionState::new(history_cap)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until no other request of this conversation is in flight.
    pub async fn enter(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lane).lock_owned().await
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ConversationExecutionState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn snapshot(&self) -> ConversationExecutionState {
        self.with_state(|state| state.clone())
    }
}

/// All live conversations, keyed by id.
#[derive(Debug)]
pub struct ConversationStore {
    conversations: DashMap<String, Arc<Conversation>>,
    history_cap: usize,
}

impl ConversationStore {
    pub fn new(history_cap: usize) -> Self {
        Self {
            conversations: DashMap::new(),
            history_cap,
        }
    }

    pub fn get_or_create(&self, conversation_id: &str) -> Arc<Conversation> {
        if let Some(existing) = self.conversations.get(conversation_id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Conversation::new(conversation_id, self.history_cap)));
        Arc::clone(entry.value())
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<Conversation>> {
        self.conversations
            .get(conversation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// True while `conversation` is still the live entry for its id.
    pub fn is_current(&self, conversation: &Arc<Conversation>) -> bool {
        self.conversations
            .get(conversation.id())
            .map(|entry| Arc::ptr_eq(entry.value(), conversation))
            .unwrap_or(false)
    }

    /// Remove the entry only if it is still `conversation`.
    pub fn remove_current(&self, conversation: &Arc<Conversation>) -> bool {
        self.conversations
            .remove_if(conversation.id(), |_, live| Arc::ptr_eq(live, conversation))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: &str) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            code: code.to_string(),
            outcome_kind: OutcomeKind::Success,
            referenced_variables: vec![],
        }
    }

    fn record(size: u64) -> DatasetRecord {
        DatasetRecord {
            shape: (10, 2),
            columns: vec!["a".to_string(), "b".to_string()],
            dtypes: BTreeMap::new(),
            fingerprint: Fingerprint {
                size,
                mtime_secs: 1,
                mtime_nanos: 0,
            },
            digest: String::new(),
            loaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut state = ConversationExecutionState::new(3);
        for i in 0..5 {
            state.push_history(entry(&format!("x = {}", i)));
        }
        assert_eq!(state.history().len(), 3);
        assert_eq!(state.history().front().unwrap().code, "x = 2");
        assert_eq!(state.history().back().unwrap().code, "x = 4");
    }

    #[test]
    fn test_failure_streak_resets_on_success() {
        let mut state = ConversationExecutionState::new(20);
        assert_eq!(state.record_result(false), 1);
        assert_eq!(state.record_result(false), 2);
        assert_eq!(state.record_result(true), 0);
    }

    #[test]
    fn test_changed_fingerprint_evicts_dependents() {
        let mut state = ConversationExecutionState::new(20);
        let path = PathBuf::from("a.csv");
        state.record_dataset(path.clone(), record(100));

        let mut deps = BTreeMap::new();
        deps.insert(path.clone(), record(100).fingerprint);
        state.cache_put(
            "k".to_string(),
            CacheEntry {
                tool_name: "get_column_info".to_string(),
                result: serde_json::json!({"rows": 10}),
                timestamp: Utc::now(),
                dependencies: deps,
            },
        );

        assert_eq!(state.record_dataset(path.clone(), record(100)), 0);
        assert_eq!(state.cache_len(), 1);
        assert_eq!(state.record_dataset(path.clone(), record(200)), 1);
        assert_eq!(state.cache_len(), 0);
        assert_eq!(state.current_dataset(), Some(path.as_path()));
    }

    #[test]
    fn test_reset_keeps_datasets() {
        let mut state = ConversationExecutionState::new(20);
        state.charge("execute_python_code");
        state.record_result(false);
        state.record_dataset(PathBuf::from("a.csv"), record(1));
        state.reset();
        assert_eq!(state.total_executions(), 0);
        assert_eq!(state.tool_executions("execute_python_code"), 0);
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.datasets().len(), 1);
    }

    #[test]
    fn test_store_reuses_conversation() {
        let store = ConversationStore::new(20);
        let a = store.get_or_create("c1");
        let b = store.get_or_create("c1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
        assert!(store.remove_current(&a));
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn test_replaced_conversation_is_not_current() {
        let store = ConversationStore::new(20);
        let old = store.get_or_create("c1");
        assert!(store.is_current(&old));
        assert!(store.remove_current(&old));

        let fresh = store.get_or_create("c1");
        assert!(!store.is_current(&old));
        assert!(!store.remove_current(&old));
        assert!(store.is_current(&fresh));
        assert_eq!(fresh.id(), "c1");
    }
}
