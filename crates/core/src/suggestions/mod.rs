//! Suggestion construction: classify an agent draft against the dedup
//! index and persist the resulting record.

pub mod builder;
pub mod dedup;

pub use builder::{AgentDraft, SuggestionBuilder};
pub use dedup::{dedup_key_for_sender, DedupIndex, ExistingMatch, InMemoryDedupIndex};
