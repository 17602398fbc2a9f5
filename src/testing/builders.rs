//! Fluent builders for test source collections.

use crate::local::{LocalCollection, LocalCollectionConfig};
use crate::scheduler::TransactionScheduler;
use crate::source::SourceCollection;
use serde_json::Value;
use std::sync::Arc;

/// Start building a [`LocalCollection`] keyed by the top-level `id` field.
pub fn collection(id: impl Into<String>) -> CollectionBuilder {
    CollectionBuilder {
        config: LocalCollectionConfig::keyed_by_id(id),
        rows: Vec::new(),
        ready: false,
        scheduler: None,
    }
}

/// Builder returned by [`collection`].
pub struct CollectionBuilder {
    config: LocalCollectionConfig,
    rows: Vec<Value>,
    ready: bool,
    scheduler: Option<TransactionScheduler>,
}

impl CollectionBuilder {
    /// Key the collection by a different field path.
    pub fn key_path<S: Into<String>>(mut self, path: impl IntoIterator<Item = S>) -> Self {
        self.config.key_path = path.into_iter().map(Into::into).collect();
        self
    }

    /// Disable on-demand index creation.
    pub fn without_auto_index(mut self) -> Self {
        self.config.auto_index = false;
        self
    }

    /// Seed rows inserted before the collection is returned.
    pub fn rows(mut self, rows: impl IntoIterator<Item = Value>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// Mark the collection ready after seeding.
    pub fn ready(mut self) -> Self {
        self.ready = true;
        self
    }

    /// Flush transactions through a private scheduler.
    pub fn scheduler(mut self, scheduler: TransactionScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> LocalCollection {
        let collection = match self.scheduler {
            Some(scheduler) => LocalCollection::with_scheduler(self.config, scheduler),
            None => LocalCollection::new(self.config),
        };
        for row in self.rows {
            collection.insert(row).expect("seed row has a key");
        }
        if self.ready {
            collection.mark_ready();
        }
        collection
    }
}

/// Convenience conversion to the trait object live queries consume.
pub trait AsSource {
    fn as_source(&self) -> Arc<dyn SourceCollection>;
}

impl AsSource for LocalCollection {
    fn as_source(&self) -> Arc<dyn SourceCollection> {
        Arc::new(self.clone())
    }
}
