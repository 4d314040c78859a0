//! JSON file record store shared by every process pointed at the same directory.
//!
//! Layout (see [`crate::paths`]):
//! - `items.json`: the whole table
//! - `items.json.lock`: write lock held for each read/modify/write cycle
//!
//! Writers take the lock, re-read `items.json`, apply the change, and replace the file via
//! an atomic temp-file rename. Readers never take the lock: they always see a complete
//! table, either the one before or the one after a write. Where rename cannot overwrite
//! (Windows) the old table is removed first, so a reader that finds no table while the lock
//! is held waits briefly for the new one.

use super::{patch_matching, patch_one, select, RecordStore};
use crate::id;
use crate::item::{Filter, Patch, ReviewableItem};
use crate::lock::{self, LockConfig};
use crate::paths::{self, StorePaths};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread::sleep;
use time::OffsetDateTime;
use tracing::debug;

const SCHEMA_VERSION: &str = "1.0.0";
const READ_RETRIES: usize = 10;
const READ_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(20);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// On-disk shape of `items.json`.
pub struct ItemTable {
    /// Schema version string for `items.json`.
    pub schema_version: String,
    /// All items, kept sorted by id.
    pub items: Vec<ReviewableItem>,
}

impl Default for ItemTable {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            items: Vec::new(),
        }
    }
}

/// Record store backed by `items.json` in a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    paths: StorePaths,
    owner: String,
    lock: LockConfig,
}

impl JsonFileStore {
    /// Open (creating the directory if needed) the store in `store_dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or no owner id can be generated.
    pub fn open(store_dir: &Path) -> anyhow::Result<Self> {
        Self::open_with(store_dir, LockConfig::default())
    }

    /// Like [`JsonFileStore::open`] with explicit lock tuning.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or no owner id can be generated.
    pub fn open_with(store_dir: &Path, lock: LockConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(store_dir)
            .with_context(|| format!("create store dir {}", store_dir.display()))?;
        Ok(Self {
            paths: paths::store_paths(store_dir),
            owner: id::random_id8()?,
            lock,
        })
    }

    /// Full path of `items.json`.
    #[must_use]
    pub fn items_file(&self) -> &Path {
        &self.paths.items_file
    }

    /// Read the table as it is on disk; a store nobody has written to yet is empty.
    ///
    /// Does not take the lock. If `items.json` is missing while a writer holds the lock,
    /// the read is retried for a short while before the store is reported empty.
    ///
    /// # Errors
    /// Returns an error if `items.json` exists but cannot be read or parsed.
    pub fn load(&self) -> anyhow::Result<ItemTable> {
        for _ in 0..READ_RETRIES {
            if let Some(table) = self.read_table()? {
                return Ok(table);
            }
            if !self.paths.lock_file.exists() {
                return Ok(ItemTable::default());
            }
            sleep(READ_RETRY_DELAY);
        }
        // Lock held throughout: most likely the very first write is still in flight.
        Ok(self.read_table()?.unwrap_or_default())
    }

    fn read_table(&self) -> anyhow::Result<Option<ItemTable>> {
        let path = &self.paths.items_file;
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read items file {}", path.display()))
            }
        };
        let table: ItemTable =
            serde_json::from_str(&raw).with_context(|| format!("parse JSON {}", path.display()))?;
        if table.schema_version != SCHEMA_VERSION {
            return Err(anyhow::anyhow!(
                "unsupported items.json schema_version {} (expected {SCHEMA_VERSION})",
                table.schema_version
            ));
        }
        Ok(Some(table))
    }

    fn write_atomic(&self, table: &ItemTable) -> anyhow::Result<()> {
        let items_file = &self.paths.items_file;
        let tmp = paths::items_tmp_file(&self.paths.store_dir, &self.owner);
        let body = serde_json::to_string_pretty(table).context("serialize items JSON")? + "\n";
        fs::write(&tmp, body).with_context(|| format!("write temp items file {}", tmp.display()))?;

        // rename() replaces atomically on Unix; Windows refuses an existing destination.
        #[cfg(windows)]
        {
            if items_file.exists() {
                fs::remove_file(items_file).with_context(|| {
                    format!("remove existing items file {}", items_file.display())
                })?;
            }
        }

        fs::rename(&tmp, items_file).with_context(|| {
            format!(
                "replace items file {} via {}",
                items_file.display(),
                tmp.display()
            )
        })
    }

    /// Locked read/modify/write. `change` returns a result and whether it modified the
    /// table; untouched tables are not rewritten.
    fn mutate<R>(
        &self,
        change: impl FnOnce(&mut ItemTable) -> anyhow::Result<(R, bool)>,
    ) -> anyhow::Result<R> {
        let guard =
            lock::acquire_store_lock(&self.paths.store_dir, self.owner.clone(), self.lock)?;
        let mut table = self.read_table()?.unwrap_or_default();
        let (out, changed) = change(&mut table)?;
        if changed {
            guard.ensure_held()?;
            self.write_atomic(&table)?;
            debug!(
                owner = %guard.owner(),
                file = %self.paths.items_file.display(),
                "items file replaced"
            );
        }
        guard.release()?;
        Ok(out)
    }
}

impl RecordStore for JsonFileStore {
    fn insert(&self, item: ReviewableItem) -> anyhow::Result<()> {
        self.mutate(|table| {
            match table.items.binary_search_by(|row| row.id.cmp(&item.id)) {
                Ok(_) => Err(anyhow::anyhow!("item {} already exists", item.id)),
                Err(pos) => {
                    table.items.insert(pos, item);
                    Ok(((), true))
                }
            }
        })
    }

    fn get(&self, id: &str) -> anyhow::Result<Option<ReviewableItem>> {
        Ok(self.load()?.items.into_iter().find(|item| item.id == id))
    }

    fn query(&self, filter: &Filter, limit: Option<usize>) -> anyhow::Result<Vec<ReviewableItem>> {
        Ok(select(self.load()?.items.iter(), filter, limit))
    }

    fn count(&self, filter: &Filter) -> anyhow::Result<usize> {
        Ok(self
            .load()?
            .items
            .iter()
            .filter(|item| filter.matches(item))
            .count())
    }

    fn update_where(
        &self,
        id: &str,
        guard: &Filter,
        patch: &Patch,
        at: OffsetDateTime,
    ) -> anyhow::Result<usize> {
        self.mutate(|table| {
            let row = table.items.iter_mut().find(|item| item.id == id);
            let affected = patch_one(row, guard, patch, at);
            Ok((affected, affected > 0))
        })
    }

    fn update_matching(
        &self,
        filter: &Filter,
        patch: &Patch,
        at: OffsetDateTime,
    ) -> anyhow::Result<usize> {
        self.mutate(|table| {
            let affected = patch_matching(table.items.iter_mut(), filter, patch, at);
            Ok((affected, affected > 0))
        })
    }
}
