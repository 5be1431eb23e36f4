//! Recorded-state persistence seam.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::resource::{ObservedState, ParentRef};

/// Errors from a state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend rejected or failed the write.
    #[error("state store: {0}")]
    Backend(String),
}

/// Persistence for the last observed attachment state per parent.
///
/// The reconciler writes a checkpoint of the expected post-apply set
/// before waiting on in-flight actions, then the verified state after its
/// final re-read. Concurrent cycles may write the same parent;
/// implementations decide last-writer-wins or better.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Record the observed attachments for a parent.
    async fn record(&self, state: &ObservedState) -> Result<(), StoreError>;

    /// Remove the record of a parent that no longer exists.
    async fn clear(&self, parent: &ParentRef) -> Result<(), StoreError>;
}

/// In-memory store, last writer wins.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<ParentRef, ObservedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for a parent, if any.
    pub async fn get(&self, parent: &ParentRef) -> Option<ObservedState> {
        self.records.read().await.get(parent).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn record(&self, state: &ObservedState) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(state.parent, state.clone());
        Ok(())
    }

    async fn clear(&self, parent: &ParentRef) -> Result<(), StoreError> {
        self.records.write().await.remove(parent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{AttachmentSet, ChildRef};

    #[tokio::test]
    async fn record_then_clear_round_trip() {
        let store = MemoryStore::new();
        let parent = ParentRef::network(7);
        let attachments: AttachmentSet = [ChildRef::Server { id: 3 }].into_iter().collect();

        store
            .record(&ObservedState::now(parent, attachments.clone()))
            .await
            .unwrap();
        let got = store.get(&parent).await.unwrap();
        assert_eq!(got.attachments, attachments);

        store.clear(&parent).await.unwrap();
        assert!(store.get(&parent).await.is_none());
    }

    #[tokio::test]
    async fn later_record_replaces_earlier() {
        let store = MemoryStore::new();
        let parent = ParentRef::firewall(1);

        store
            .record(&ObservedState::now(
                parent,
                [ChildRef::Server { id: 1 }].into_iter().collect(),
            ))
            .await
            .unwrap();
        store
            .record(&ObservedState::now(parent, AttachmentSet::new()))
            .await
            .unwrap();

        assert!(store.get(&parent).await.unwrap().attachments.is_empty());
    }
}
