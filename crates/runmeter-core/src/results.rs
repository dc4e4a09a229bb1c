// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result object store seam.
//!
//! Workers upload a run's result after claiming it and before committing.
//! Reconcile asks the store whether an object exists to decide between
//! rolling a crashed success forward or failing it.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::ResultLocation;

/// Hex SHA-256 of `body`.
pub fn sha256_hex(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

/// Storage for run result objects.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store `body` under `key`, replacing any previous object.
    async fn put(&self, key: &str, body: &[u8]) -> Result<ResultLocation>;

    /// Location of the object at `key`, if present.
    async fn stat(&self, key: &str) -> Result<Option<ResultLocation>>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.stat(key).await?.is_some())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Result store backed by a map, with upload fault injection.
pub struct InMemoryResultStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl InMemoryResultStore {
    /// Create an empty store for `bucket`.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Make every `put` fail.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Object body at `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Delete the object at `key`.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().remove(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn location(&self, key: &str, body: &[u8]) -> ResultLocation {
        ResultLocation {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            sha256: sha256_hex(body),
        }
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, key: &str, body: &[u8]) -> Result<ResultLocation> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Error::ObjectStore(format!("upload of '{}' rejected", key)));
        }
        self.lock().insert(key.to_string(), body.to_vec());
        Ok(self.location(key, body))
    }

    async fn stat(&self, key: &str) -> Result<Option<ResultLocation>> {
        Ok(self.lock().get(key).map(|body| self.location(key, body)))
    }
}

// ============================================================================
// Filesystem store
// ============================================================================

/// Result store rooted in a local directory: objects live at
/// `<root>/<bucket>/<key>`.
///
/// Writes go to a temporary sibling and are renamed into place, so a reader
/// never observes a partial object.
pub struct LocalResultStore {
    root: PathBuf,
    bucket: String,
}

impl LocalResultStore {
    /// Create a store under `root` for `bucket`.
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::ObjectStore(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(&self.bucket).join(relative))
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    async fn put(&self, key: &str, body: &[u8]) -> Result<ResultLocation> {
        let path = self.object_path(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::ObjectStore(format!("invalid object key '{}'", key)))?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(".upload-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(ResultLocation {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            sha256: sha256_hex(body),
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<ResultLocation>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(ResultLocation {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                sha256: sha256_hex(&body),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_in_memory_put_and_stat() {
        let store = InMemoryResultStore::new("results");
        assert!(!store.exists("t1/run-1/result").await.unwrap());

        let location = store.put("t1/run-1/result", b"abc").await.unwrap();
        assert_eq!(location.bucket, "results");
        assert_eq!(location.sha256, sha256_hex(b"abc"));
        assert_eq!(
            store.stat("t1/run-1/result").await.unwrap(),
            Some(location)
        );
    }

    #[tokio::test]
    async fn test_in_memory_fault_injection() {
        let store = InMemoryResultStore::new("results");
        store.set_fail_puts(true);
        let err = store.put("k", b"x").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.get("k").is_none());
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResultStore::new(dir.path(), "results");

        let location = store.put("t1/run-1/result", b"{\"ok\":true}").await.unwrap();
        let on_disk = dir.path().join("results/t1/run-1/result");
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"{\"ok\":true}");
        assert_eq!(store.stat("t1/run-1/result").await.unwrap(), Some(location));
        assert!(!store.exists("t1/run-2/result").await.unwrap());

        // No temporary files are left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path().join("results/t1/run-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResultStore::new(dir.path(), "results");
        assert!(store.put("../outside", b"x").await.is_err());
        assert!(store.put("/etc/passwd", b"x").await.is_err());
        assert!(store.stat("").await.is_err());
    }
}
