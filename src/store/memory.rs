//! In-process record store. All state is lost when the process exits.

use super::{patch_matching, patch_one, select, RecordStore};
use crate::item::{Filter, Patch, ReviewableItem};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;

/// Items in a `BTreeMap` behind a `Mutex`; every call is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, ReviewableItem>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `items`; later duplicates replace earlier ones.
    #[must_use]
    pub fn with_items(items: impl IntoIterator<Item = ReviewableItem>) -> Self {
        let items = items
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        Self {
            items: Mutex::new(items),
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, ReviewableItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for MemoryStore {
    fn insert(&self, item: ReviewableItem) -> anyhow::Result<()> {
        let mut items = self.table();
        if items.contains_key(&item.id) {
            return Err(anyhow::anyhow!("item {} already exists", item.id));
        }
        items.insert(item.id.clone(), item);
        Ok(())
    }

    fn get(&self, id: &str) -> anyhow::Result<Option<ReviewableItem>> {
        Ok(self.table().get(id).cloned())
    }

    fn query(&self, filter: &Filter, limit: Option<usize>) -> anyhow::Result<Vec<ReviewableItem>> {
        Ok(select(self.table().values(), filter, limit))
    }

    fn count(&self, filter: &Filter) -> anyhow::Result<usize> {
        Ok(self.table().values().filter(|item| filter.matches(item)).count())
    }

    fn update_where(
        &self,
        id: &str,
        guard: &Filter,
        patch: &Patch,
        at: OffsetDateTime,
    ) -> anyhow::Result<usize> {
        Ok(patch_one(self.table().get_mut(id), guard, patch, at))
    }

    fn update_matching(
        &self,
        filter: &Filter,
        patch: &Patch,
        at: OffsetDateTime,
    ) -> anyhow::Result<usize> {
        Ok(patch_matching(self.table().values_mut(), filter, patch, at))
    }
}
