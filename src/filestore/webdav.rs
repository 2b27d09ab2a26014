//! Nextcloud WebDAV for content, OCS share API for permissions.
//!
//! Files are addressed as `{url}/remote.php/dav/files/{user}/{path}` with
//! HTTP basic auth. Shares come from
//! `GET {url}/ocs/v2.php/apps/files_sharing/api/v1/shares?path=/{path}`,
//! where share type `0` grants a user and `1` grants a group.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{FileStore, Shares};
use crate::config::FileStoreConfig;
use crate::error::{SyncError, SyncResult};

const SHARE_TYPE_USER: i64 = 0;
const SHARE_TYPE_GROUP: i64 = 1;

pub struct WebDavStore {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    share_api: bool,
}

impl WebDavStore {
    pub fn new(config: &FileStoreConfig) -> Result<Self> {
        if config.url.is_empty() {
            bail!("filestore.url is not set");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build WebDAV HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            share_api: config.share_api,
        })
    }

    fn dav_url(&self, path: &str) -> String {
        format!(
            "{}/remote.php/dav/files/{}/{}",
            self.base_url,
            uri_encode(&self.user),
            encode_path(path)
        )
    }

    fn shares_url(&self) -> String {
        format!("{}/ocs/v2.php/apps/files_sharing/api/v1/shares", self.base_url)
    }

    async fn expect_ok(path: &str, resp: Response) -> SyncResult<Response> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(SyncError::upstream(path, "not found")),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(SyncError::upstream(path, format!("HTTP {}: {}", s, truncate(&body))))
            }
        }
    }
}

#[async_trait]
impl FileStore for WebDavStore {
    async fn download(
        &self,
        path: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> SyncResult<u64> {
        let resp = self
            .client
            .get(self.dav_url(path))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| SyncError::upstream(path, e))?;
        let mut resp = Self::expect_ok(path, resp).await?;

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|e| SyncError::upstream(path, e))? {
            dest.write_all(&chunk).await.map_err(|e| {
                SyncError::local_io(format!("write download of '{}': {}", path, e))
            })?;
            written += chunk.len() as u64;
        }
        dest.flush()
            .await
            .map_err(|e| SyncError::local_io(format!("flush download of '{}': {}", path, e)))?;

        debug!(path, bytes = written, "downloaded");
        Ok(written)
    }

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        let resp = self
            .client
            .head(self.dav_url(path))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| SyncError::upstream(path, e))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(SyncError::upstream(path, format!("HTTP {}", s))),
        }
    }

    async fn fetch_access(&self, path: &str) -> SyncResult<Shares> {
        if !self.share_api {
            return Ok(Shares::default());
        }

        let share_path = format!("/{}", path.trim_start_matches('/'));
        let resp = self
            .client
            .get(self.shares_url())
            .basic_auth(&self.user, Some(&self.password))
            .header("OCS-APIRequest", "true")
            .header("Accept", "application/json")
            .query(&[("path", share_path.as_str()), ("reshares", "true")])
            .send()
            .await
            .map_err(|e| SyncError::upstream(path, e))?;
        let resp = Self::expect_ok(path, resp).await?;

        let body: OcsResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::upstream(path, format!("invalid share response: {}", e)))?;
        Ok(parse_shares(body.ocs.data))
    }
}

#[derive(Debug, Deserialize)]
struct OcsResponse {
    ocs: OcsBody,
}

#[derive(Debug, Deserialize)]
struct OcsBody {
    #[serde(default)]
    data: Vec<OcsShare>,
}

#[derive(Debug, Deserialize)]
struct OcsShare {
    share_type: i64,
    #[serde(default)]
    share_with: Option<String>,
    #[serde(default)]
    uid_file_owner: Option<String>,
}

fn parse_shares(data: Vec<OcsShare>) -> Shares {
    let mut shares = Shares::default();
    for share in data {
        if shares.owner.is_none() {
            shares.owner = share.uid_file_owner.filter(|o| !o.is_empty());
        }
        let Some(with) = share.share_with.filter(|w| !w.is_empty()) else {
            continue;
        };
        match share.share_type {
            SHARE_TYPE_USER => {
                shares.users.insert(with);
            }
            SHARE_TYPE_GROUP => {
                shares.groups.insert(with);
            }
            // Links, federated and circle shares carry no local identity.
            _ => {}
        }
    }
    shares
}

/// Percent-encodes each segment, keeping the `/` separators.
fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// RFC 3986 unreserved characters pass through; everything else is `%XX`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((i, _)) => &body[..i],
        None => body,
    }
}
