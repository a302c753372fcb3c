use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{ItemId, ItemUpdate, TrackedItemState};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Read/write contract of the external item store. Persistence details live
/// behind implementations of this trait.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Items whose next check time has passed, oldest first.
    async fn due_items(&self, now: DateTime<Utc>) -> Result<Vec<TrackedItemState>, StoreError>;

    async fn get(&self, item_id: &ItemId) -> Result<Option<TrackedItemState>, StoreError>;

    async fn apply_update(&self, update: &ItemUpdate) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: Mutex<BTreeMap<ItemId, TrackedItemState>>,
}

impl MemoryItemStore {
    pub fn new(items: impl IntoIterator<Item = TrackedItemState>) -> Self {
        Self {
            items: Mutex::new(
                items
                    .into_iter()
                    .map(|item| (item.item_id.clone(), item))
                    .collect(),
            ),
        }
    }

    pub async fn insert(&self, item: TrackedItemState) {
        self.items.lock().await.insert(item.item_id.clone(), item);
    }

    pub async fn snapshot(&self) -> Vec<TrackedItemState> {
        self.items.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn due_items(&self, now: DateTime<Utc>) -> Result<Vec<TrackedItemState>, StoreError> {
        let items = self.items.lock().await;
        let mut due = items
            .values()
            .filter(|item| item.is_due(now))
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|item| item.next_check_at);
        Ok(due)
    }

    async fn get(&self, item_id: &ItemId) -> Result<Option<TrackedItemState>, StoreError> {
        Ok(self.items.lock().await.get(item_id).cloned())
    }

    async fn apply_update(&self, update: &ItemUpdate) -> Result<(), StoreError> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(&update.item_id)
            .ok_or_else(|| StoreError::UnknownItem(update.item_id.clone()))?;
        item.price = update.price.clone();
        item.historical_low = update.historical_low.clone();
        item.in_stock = update.in_stock;
        item.title = update.title.clone();
        item.next_check_at = update.next_check_at;
        item.last_checked_at = Some(update.last_checked_at);
        Ok(())
    }
}
