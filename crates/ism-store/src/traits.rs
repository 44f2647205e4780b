//! Store trait definitions

use ism_api::ManagedIndexMetaData;
use ism_config::{ManagedIndexConfig, Policy};
use ism_util::PolicyId;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{DocKind, HistoryEntry, LockDocument, StoreResult, Version, Versioned, WriteCondition};

/// Main store trait
pub trait Store: Send + Sync {
    // Versioned documents

    /// Read the JSON source of a document
    fn get_document(&self, kind: DocKind, id: &str) -> StoreResult<Option<Versioned<String>>>;

    /// Write a document if `condition` holds; returns the new version
    fn put_document(
        &self,
        kind: DocKind,
        id: &str,
        source: &str,
        condition: WriteCondition,
    ) -> StoreResult<Version>;

    /// Delete a document, optionally only at the expected version.
    /// Returns whether a document was deleted.
    fn delete_document(&self, kind: DocKind, id: &str, expected: Option<Version>)
    -> StoreResult<bool>;

    /// All documents of a kind, ordered by id
    fn list_documents(&self, kind: DocKind) -> StoreResult<Vec<(String, Versioned<String>)>>;

    // History

    /// Append a history entry; returns its assigned ID
    fn append_history(&self, entry: &HistoryEntry) -> StoreResult<i64>;

    /// Most recent history entries for an index, newest first
    fn recent_history(&self, index: &str, limit: usize) -> StoreResult<Vec<HistoryEntry>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Typed access to the documents ismd persists
pub trait DocumentStore: Store {
    fn get_typed<T: DeserializeOwned>(&self, kind: DocKind, id: &str) -> StoreResult<Option<Versioned<T>>> {
        match self.get_document(kind, id)? {
            Some(doc) => Ok(Some(Versioned {
                value: serde_json::from_str(&doc.value)?,
                version: doc.version,
            })),
            None => Ok(None),
        }
    }

    fn put_typed<T: Serialize>(
        &self,
        kind: DocKind,
        id: &str,
        value: &T,
        condition: WriteCondition,
    ) -> StoreResult<Version> {
        let source = serde_json::to_string(value)?;
        self.put_document(kind, id, &source, condition)
    }

    fn list_typed<T: DeserializeOwned>(&self, kind: DocKind) -> StoreResult<Vec<Versioned<T>>> {
        self.list_documents(kind)?
            .into_iter()
            .map(|(_, doc)| {
                Ok(Versioned {
                    value: serde_json::from_str(&doc.value)?,
                    version: doc.version,
                })
            })
            .collect()
    }

    // Policies

    fn get_policy(&self, policy_id: &PolicyId) -> StoreResult<Option<Versioned<Policy>>> {
        self.get_typed(DocKind::Policy, policy_id.as_str())
    }

    fn put_policy(&self, policy: &Policy, condition: WriteCondition) -> StoreResult<Version> {
        self.put_typed(DocKind::Policy, policy.policy_id.as_str(), policy, condition)
    }

    fn list_policies(&self) -> StoreResult<Vec<Versioned<Policy>>> {
        self.list_typed(DocKind::Policy)
    }

    // Managed index configs

    fn get_managed_config(&self, index: &str) -> StoreResult<Option<Versioned<ManagedIndexConfig>>> {
        self.get_typed(DocKind::ManagedConfig, index)
    }

    fn put_managed_config(
        &self,
        config: &ManagedIndexConfig,
        condition: WriteCondition,
    ) -> StoreResult<Version> {
        self.put_typed(DocKind::ManagedConfig, &config.index, config, condition)
    }

    fn list_managed_configs(&self) -> StoreResult<Vec<Versioned<ManagedIndexConfig>>> {
        self.list_typed(DocKind::ManagedConfig)
    }

    // Metadata

    fn get_metadata(&self, index: &str) -> StoreResult<Option<Versioned<ManagedIndexMetaData>>> {
        self.get_typed(DocKind::Metadata, index)
    }

    fn put_metadata(
        &self,
        metadata: &ManagedIndexMetaData,
        condition: WriteCondition,
    ) -> StoreResult<Version> {
        self.put_typed(DocKind::Metadata, &metadata.index, metadata, condition)
    }

    // Locks

    fn get_lock(&self, index: &str) -> StoreResult<Option<Versioned<LockDocument>>> {
        self.get_typed(DocKind::Lock, index)
    }

    fn put_lock(&self, lock: &LockDocument, condition: WriteCondition) -> StoreResult<Version> {
        self.put_typed(DocKind::Lock, &lock.index, lock, condition)
    }
}

impl<S: Store + ?Sized> DocumentStore for S {}
