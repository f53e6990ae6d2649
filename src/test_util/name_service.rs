use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;

use crate::error::{SocketError, SocketException};
use crate::model::name_record::{NameQuery, NameRecord, NameRecordType};
use crate::provider::{LookupOutcome, NameService, NameServiceNotification, UpsertOutcome};

/// A registry that keeps records in memory, keyed by record id. Upserting a record that is not
///  connected removes it.
#[derive(Debug)]
pub struct InMemoryNameService {
    records: Mutex<FxHashMap<String, NameRecord>>,
    notifications: broadcast::Sender<NameServiceNotification>,
}

impl Default for InMemoryNameService {
    fn default() -> Self {
        InMemoryNameService::new()
    }
}

impl InMemoryNameService {
    pub fn new() -> InMemoryNameService {
        let (notifications, _) = broadcast::channel(64);
        InMemoryNameService {
            records: Default::default(),
            notifications,
        }
    }

    fn records(&self) -> MutexGuard<'_, FxHashMap<String, NameRecord>> {
        self.records.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a record without notifying subscribers
    pub fn insert(&self, record: NameRecord) {
        self.records().insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<NameRecord> {
        self.records().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn notify(&self, notification: NameServiceNotification) {
        // no subscribers is fine
        let _ = self.notifications.send(notification);
    }
}

#[async_trait]
impl NameService for InMemoryNameService {
    async fn query(&self, query: &NameQuery) -> anyhow::Result<Vec<NameRecord>> {
        let mut result = self.records().values()
            .filter(|r| r.connected && r.matches(query))
            .cloned()
            .collect::<Vec<_>>();
        if result.is_empty() {
            return Err(SocketException::new(SocketError::NotFound, format!("no record matches {:?}", query)).into());
        }
        result.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(result)
    }

    async fn lookup(&self, name: &str, record_type: NameRecordType) -> LookupOutcome {
        let query = NameQuery::ByName { name: name.to_string(), record_type };
        match self.query(&query).await {
            Ok(mut records) => LookupOutcome::Found(records.remove(0)),
            Err(_) => LookupOutcome::NotFound,
        }
    }

    async fn upsert(&self, record: NameRecord) -> anyhow::Result<UpsertOutcome> {
        if !record.connected {
            let removed = self.records().remove(&record.id);
            if let Some(removed) = removed {
                self.notify(NameServiceNotification::Removed(removed));
            }
            return Ok(UpsertOutcome::Removed);
        }

        let previous = self.records().insert(record.id.clone(), record.clone());
        self.notify(match previous {
            None => NameServiceNotification::Added(record.clone()),
            Some(p) if !p.connected => NameServiceNotification::Connected(record.clone()),
            Some(_) => NameServiceNotification::Updated(record.clone()),
        });
        Ok(UpsertOutcome::Stored(record))
    }

    fn subscribe(&self) -> broadcast::Receiver<NameServiceNotification> {
        self.notifications.subscribe()
    }
}
