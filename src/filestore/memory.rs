//! In-memory [`FileStore`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{FileStore, Shares};
use crate::error::{SyncError, SyncResult};

#[derive(Default)]
struct Contents {
    files: HashMap<String, Vec<u8>>,
    shares: HashMap<String, Shares>,
    unreachable: HashSet<String>,
    downloads: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryFileStore {
    inner: Mutex<Contents>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.lock().files.insert(normalise(path), bytes.into());
    }

    pub fn remove(&self, path: &str) {
        self.lock().files.remove(&normalise(path));
    }

    pub fn share(&self, path: &str, shares: Shares) {
        self.lock().shares.insert(normalise(path), shares);
    }

    /// Every request for `path` fails as if the store were down.
    pub fn make_unreachable(&self, path: &str) {
        self.lock().unreachable.insert(normalise(path));
    }

    /// Paths downloaded so far, in order.
    pub fn downloads(&self) -> Vec<String> {
        self.lock().downloads.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Contents> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, path: &str) -> SyncResult<()> {
        if self.lock().unreachable.contains(path) {
            return Err(SyncError::upstream(path, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn download(
        &self,
        path: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> SyncResult<u64> {
        let path = normalise(path);
        self.check(&path)?;
        let bytes = {
            let mut inner = self.lock();
            inner.downloads.push(path.clone());
            inner.files.get(&path).cloned()
        };
        let bytes = bytes.ok_or_else(|| SyncError::upstream(&path, "not found"))?;
        dest.write_all(&bytes)
            .await
            .map_err(|e| SyncError::upstream(&path, e))?;
        dest.flush().await.map_err(|e| SyncError::upstream(&path, e))?;
        Ok(bytes.len() as u64)
    }

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        let path = normalise(path);
        self.check(&path)?;
        Ok(self.lock().files.contains_key(&path))
    }

    async fn fetch_access(&self, path: &str) -> SyncResult<Shares> {
        let path = normalise(path);
        self.check(&path)?;
        Ok(self.lock().shares.get(&path).cloned().unwrap_or_default())
    }
}

fn normalise(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}
