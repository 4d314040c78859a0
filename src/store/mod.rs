//! Record store abstraction.
//!
//! The reservation logic never touches storage directly; it issues reads and conditional
//! writes through [`RecordStore`]. A store must evaluate the guard of
//! [`RecordStore::update_where`] against the stored row atomically with the write: that is
//! what makes it the final arbiter between two reviewers racing for the same item.

mod file;
mod memory;

pub use file::{ItemTable, JsonFileStore};
pub use memory::MemoryStore;

use crate::item::{Filter, Patch, ReviewableItem};
use time::OffsetDateTime;

/// Queryable table of reviewable items.
pub trait RecordStore: Send + Sync {
    /// Add a new item.
    ///
    /// # Errors
    /// Returns an error if an item with the same id exists or the write fails.
    fn insert(&self, item: ReviewableItem) -> anyhow::Result<()>;

    /// Fetch one item by id.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn get(&self, id: &str) -> anyhow::Result<Option<ReviewableItem>>;

    /// Items matching `filter`, in id order, at most `limit` of them.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn query(&self, filter: &Filter, limit: Option<usize>) -> anyhow::Result<Vec<ReviewableItem>>;

    /// Number of items matching `filter`.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn count(&self, filter: &Filter) -> anyhow::Result<usize>;

    /// Apply `patch` to item `id` only if it currently satisfies `guard`.
    /// Returns the number of rows affected: 1, or 0 when the item is missing or the guard failed.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written.
    fn update_where(
        &self,
        id: &str,
        guard: &Filter,
        patch: &Patch,
        at: OffsetDateTime,
    ) -> anyhow::Result<usize>;

    /// Apply `patch` to every item matching `filter`; returns the number of rows affected.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written.
    fn update_matching(
        &self,
        filter: &Filter,
        patch: &Patch,
        at: OffsetDateTime,
    ) -> anyhow::Result<usize>;
}

fn select<'a>(
    items: impl Iterator<Item = &'a ReviewableItem>,
    filter: &Filter,
    limit: Option<usize>,
) -> Vec<ReviewableItem> {
    items
        .filter(|item| filter.matches(item))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

fn patch_one(
    item: Option<&mut ReviewableItem>,
    guard: &Filter,
    patch: &Patch,
    at: OffsetDateTime,
) -> usize {
    match item {
        Some(item) if guard.matches(item) => {
            item.apply(patch, at);
            1
        }
        _ => 0,
    }
}

fn patch_matching<'a>(
    items: impl Iterator<Item = &'a mut ReviewableItem>,
    filter: &Filter,
    patch: &Patch,
    at: OffsetDateTime,
) -> usize {
    let mut affected = 0_usize;
    for item in items {
        if filter.matches(item) {
            item.apply(patch, at);
            affected = affected.saturating_add(1);
        }
    }
    affected
}
