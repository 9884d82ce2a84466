//! Conversation quotas, failure streaks and per-conversation state.

pub mod coordinator;
pub mod state;

pub use coordinator::{Admission, QuotaCoordinator, QuotaDenial, Remaining};
pub use state::{
    CacheEntry, Conversation, ConversationExecutionState, ConversationStore, DatasetRecord,
    Fingerprint, HistoryEntry,
};
