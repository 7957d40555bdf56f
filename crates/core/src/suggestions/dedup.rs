use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::errors::StoreError;

/// Best-effort pointer to an existing business record that a new
/// suggestion appears to duplicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExistingMatch {
    pub entity_id: String,
}

/// Lookup port against the external business-record index.
#[async_trait]
pub trait DedupIndex: Send + Sync {
    async fn find_duplicate(&self, dedup_key: &str) -> Result<Option<ExistingMatch>, StoreError>;
}

/// Derive the dedup key from a sender reference. Mail-style senders are
/// keyed by their lowercased domain so colleagues at the same company
/// collapse onto one key; anything else is keyed verbatim.
pub fn dedup_key_for_sender(sender_ref: &str) -> Option<String> {
    let sender = sender_ref.trim();
    if sender.is_empty() {
        return None;
    }

    match sender.rsplit_once('@') {
        Some((_, domain)) if !domain.trim().is_empty() => {
            Some(domain.trim().to_ascii_lowercase())
        }
        _ => Some(sender.to_ascii_lowercase()),
    }
}

/// Map-backed index used by tests and un-wired deployments.
#[derive(Clone, Default)]
pub struct InMemoryDedupIndex {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl InMemoryDedupIndex {
    fn guard(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, dedup_key: impl Into<String>, entity_id: impl Into<String>) {
        self.guard().insert(dedup_key.into(), entity_id.into());
    }
}

#[async_trait]
impl DedupIndex for InMemoryDedupIndex {
    async fn find_duplicate(&self, dedup_key: &str) -> Result<Option<ExistingMatch>, StoreError> {
        Ok(self.guard().get(dedup_key).map(|entity_id| ExistingMatch {
            entity_id: entity_id.clone(),
        }))
    }
}
