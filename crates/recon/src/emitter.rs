//! Result emitter: the engine's idempotency boundary.
//!
//! The queue behind `ResultPublisher` delivers at least once, so every result
//! is checked against the result store by `unique_key` before it is published.
//! The lookup and the publish are two calls, not a transaction; two emitters
//! racing on one key can both publish. Results are reviewed by people, so that
//! window is tolerated.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::ReconError;
use crate::model::{
    DropReason, GroupKey, ReconciliationResult, ReconciliationSubType, ReconciliationType,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Point lookups against already-emitted results.
pub trait ResultStore: Send + Sync {
    fn exists(&self, unique_key: &str) -> Result<bool, StoreError>;
}

/// The downstream queue.
pub trait ResultPublisher: Send + Sync {
    fn publish(&self, message: &ResultMessage) -> Result<(), StoreError>;
}

/// Wire message for one result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub merchant_id: String,
    pub reconciliation_type: ReconciliationType,
    pub reconciliation_sub_type: ReconciliationSubType,
    pub reconciliation_data: ReconciliationData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationData {
    #[serde(flatten)]
    pub result: ReconciliationResult,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confidence_score: f64,
}

impl ResultMessage {
    pub fn new(tenant_id: &str, result: ReconciliationResult, now: DateTime<Utc>) -> Self {
        Self {
            merchant_id: tenant_id.to_string(),
            reconciliation_type: result.reconciliation_type,
            reconciliation_sub_type: result.reconciliation_sub_type,
            reconciliation_data: ReconciliationData {
                result,
                created_at: now,
                updated_at: now,
                confidence_score: 0.0,
            },
        }
    }

    pub fn unique_key(&self) -> &str {
        &self.reconciliation_data.result.unique_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    Published,
    Dropped(DropReason),
}

/// Deterministic result identity:
/// `{groupKey}_{date}_{channel}_{type}_{subType}`, absent segments omitted.
///
/// `date` is the group key's own date when it has one, otherwise the group's
/// transaction date. `channel` falls back the same way.
pub fn unique_key(
    group_key: &GroupKey,
    transaction_date: Option<NaiveDate>,
    channel: Option<&str>,
    reconciliation_type: ReconciliationType,
    sub_type: ReconciliationSubType,
) -> String {
    let date = group_key.date.or(transaction_date).map(|d| d.to_string());
    let channel = group_key.channel.as_deref().or(channel);
    let type_name = reconciliation_type.to_string();
    let sub_name = sub_type.to_string();

    [
        Some(group_key.key.as_str()),
        date.as_deref(),
        channel,
        Some(type_name.as_str()),
        Some(sub_name.as_str()),
    ]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join("_")
}

pub struct ResultEmitter<'a> {
    store: &'a dyn ResultStore,
    publisher: &'a dyn ResultPublisher,
}

impl<'a> ResultEmitter<'a> {
    pub fn new(store: &'a dyn ResultStore, publisher: &'a dyn ResultPublisher) -> Self {
        Self { store, publisher }
    }

    /// Publish unless a result with the same key already exists.
    pub fn emit(
        &self,
        tenant_id: &str,
        result: &ReconciliationResult,
    ) -> Result<EmitOutcome, ReconError> {
        let key = result.unique_key.as_str();
        let exists = self.store.exists(key).map_err(|e| ReconError::ResultStore {
            unique_key: key.to_string(),
            message: e.to_string(),
        })?;
        if exists {
            debug!(unique_key = key, "result already stored, dropping");
            return Ok(EmitOutcome::Dropped(DropReason::DuplicateKey));
        }

        let message = ResultMessage::new(tenant_id, result.clone(), Utc::now());
        self.publisher
            .publish(&message)
            .map_err(|e| ReconError::PublishFailure {
                unique_key: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(EmitOutcome::Published)
    }
}

/// In-process result store and queue. Published messages become visible to
/// `exists` immediately.
#[derive(Default)]
pub struct MemoryResultSink {
    messages: Mutex<BTreeMap<String, ResultMessage>>,
    rejected_keys: Mutex<HashSet<String>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish of `unique_key` fail.
    pub fn reject(&self, unique_key: impl Into<String>) {
        self.rejected_keys.lock().insert(unique_key.into());
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn get(&self, unique_key: &str) -> Option<ResultMessage> {
        self.messages.lock().get(unique_key).cloned()
    }

    pub fn messages(&self) -> Vec<ResultMessage> {
        self.messages.lock().values().cloned().collect()
    }
}

impl ResultStore for MemoryResultSink {
    fn exists(&self, unique_key: &str) -> Result<bool, StoreError> {
        Ok(self.messages.lock().contains_key(unique_key))
    }
}

impl ResultPublisher for MemoryResultSink {
    fn publish(&self, message: &ResultMessage) -> Result<(), StoreError> {
        if self.rejected_keys.lock().contains(message.unique_key()) {
            return Err(StoreError::Unavailable("queue refused message".into()));
        }
        self.messages
            .lock()
            .insert(message.unique_key().to_string(), message.clone());
        Ok(())
    }
}
