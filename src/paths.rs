use std::path::{Path, PathBuf};

/// Files that make up an on-disk record store.
#[derive(Debug, Clone)]
pub struct StorePaths {
    /// Directory holding the store.
    pub store_dir: PathBuf,
    /// `items.json`, the record table.
    pub items_file: PathBuf,
    /// `items.json.lock`, the write lock.
    pub lock_file: PathBuf,
}

/// Layout of a store rooted at `store_dir`.
#[must_use]
pub fn store_paths(store_dir: &Path) -> StorePaths {
    let items_file = store_dir.join("items.json");
    let lock_file = store_dir.join("items.json.lock");
    StorePaths {
        store_dir: store_dir.to_path_buf(),
        items_file,
        lock_file,
    }
}

/// Default store directory for a workspace root: `.local/catalog_review`.
#[must_use]
pub fn default_store_dir(root: &Path) -> PathBuf {
    root.join(".local").join("catalog_review")
}

/// Temp file used while replacing `items.json`; one per writer so concurrent
/// writers never clobber each other's half-written file.
#[must_use]
pub fn items_tmp_file(store_dir: &Path, owner: &str) -> PathBuf {
    store_dir.join(format!("items.json.tmp.{owner}"))
}

/// Where a stale `items.json.lock` is moved while it is being broken. `tag` must be unique
/// per attempt so two breakers never share a tombstone.
#[must_use]
pub fn stale_lock_file(store_dir: &Path, tag: &str) -> PathBuf {
    store_dir.join(format!("items.json.lock.stale.{tag}"))
}
