//! In-process record store with a broadcast change feed.

use std::{
    cmp::Reverse,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::models::{ChangeEvent, TailFilter, TailRecord};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use super::{
    backlog::{BacklogError, BacklogPage, BacklogSource, RecordLookup},
    change_source::{ChangeSource, ChangeSourceError, ChangeStream},
};

/// Backs the `memory` storage backend and most tests.
#[derive(Debug)]
pub struct MemoryStore<R: TailRecord> {
    records: RwLock<Vec<R>>,
    changes: broadcast::Sender<ChangeEvent<R>>,
    live_enabled: AtomicBool,
}

impl<R: TailRecord> MemoryStore<R> {
    #[must_use]
    pub fn new(feed_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            records: RwLock::new(Vec::new()),
            changes,
            live_enabled: AtomicBool::new(true),
        }
    }

    /// Turn the change feed off so `watch` reports it unavailable.
    pub fn set_live_enabled(&self, enabled: bool) {
        self.live_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Store without notifying watchers.
    pub async fn seed(&self, record: R) {
        self.records.write().await.push(record);
    }

    pub async fn insert(&self, record: R) {
        self.records.write().await.push(record.clone());
        self.publish(ChangeEvent::insert(record));
    }

    /// Replace the stored record with the same id (or store it) and publish
    /// an update.
    pub async fn update(&self, record: R, changed_fields: Vec<String>) {
        {
            let mut records = self.records.write().await;
            match records.iter_mut().find(|existing| existing.id() == record.id()) {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
        }
        self.publish(ChangeEvent::update(record, changed_fields));
    }

    /// Re-deliver an event verbatim, as an at-least-once feed may.
    pub fn publish(&self, event: ChangeEvent<R>) -> usize {
        self.changes.send(event).unwrap_or(0)
    }

    pub fn watcher_count(&self) -> usize {
        self.changes.receiver_count()
    }
}

#[async_trait]
impl<R: TailRecord> BacklogSource<R> for MemoryStore<R> {
    async fn query(
        &self,
        filter: &TailFilter,
        skip: u64,
        limit: u64,
    ) -> Result<BacklogPage<R>, BacklogError> {
        let mut matching: Vec<R> = self
            .records
            .read()
            .await
            .iter()
            .filter(|record| record.matches(filter))
            .cloned()
            .collect();
        // Later insertions win timestamp ties.
        matching.reverse();
        matching.sort_by_key(|record| Reverse(record.timestamp()));

        let total = matching.len() as u64;
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let records = matching.into_iter().skip(skip).take(limit).collect();

        Ok(BacklogPage { records, total })
    }
}

#[async_trait]
impl<R: TailRecord> RecordLookup<R> for MemoryStore<R> {
    async fn find(&self, id: &str) -> Result<Option<R>, BacklogError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|record| record.id() == id)
            .cloned())
    }
}

#[async_trait]
impl<R: TailRecord> ChangeSource<R> for MemoryStore<R> {
    async fn watch(&self, _filter: &TailFilter) -> Result<ChangeStream<R>, ChangeSourceError> {
        if !self.live_enabled.load(Ordering::SeqCst) {
            return Err(ChangeSourceError::Unavailable(
                "in-memory change feed disabled".to_string(),
            ));
        }

        let stream = BroadcastStream::new(self.changes.subscribe()).map(|item| {
            item.map_err(|err: BroadcastStreamRecvError| ChangeSourceError::Stream(err.to_string()))
        });
        Ok(Box::pin(stream))
    }
}
