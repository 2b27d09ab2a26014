//! Remote file store, read as the service account.

pub mod memory;
pub mod webdav;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::config::FileStoreConfig;
use crate::error::SyncResult;

/// Sharing state of a file as reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shares {
    /// Owning user, when the store reports one.
    pub owner: Option<String>,
    pub users: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Streams the file at `path` into `dest`, returning the byte count.
    ///
    /// A missing file is an [`UpstreamFetch`](crate::error::SyncError::UpstreamFetch) error.
    async fn download(
        &self,
        path: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> SyncResult<u64>;

    async fn exists(&self, path: &str) -> SyncResult<bool>;

    /// Current shares of `path`. Stores without a share API return
    /// [`Shares::default`].
    async fn fetch_access(&self, path: &str) -> SyncResult<Shares>;
}

pub fn from_config(config: &FileStoreConfig) -> Result<webdav::WebDavStore> {
    webdav::WebDavStore::new(config)
}
