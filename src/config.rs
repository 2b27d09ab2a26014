//! Configuration loading.
//!
//! Settings come from a TOML file and are then overridden by environment
//! variables, so secrets can be injected by the deployment without touching
//! the file. Every section has defaults; each command validates the sections
//! it actually needs before connecting to anything.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Slack a lease must keep over the job timeout, so a job that runs to its
/// deadline is nacked before its entry becomes visible to another consumer.
pub const LEASE_MARGIN_SECS: u64 = 60;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub filestore: FileStoreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_url")]
    pub url: String,
    #[serde(default = "default_content_queue")]
    pub content_queue: String,
    #[serde(default = "default_access_queue")]
    pub access_queue: String,
    #[serde(default = "default_pop_timeout")]
    pub pop_timeout_secs: u64,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: default_queue_url(),
            content_queue: default_content_queue(),
            access_queue: default_access_queue(),
            pop_timeout_secs: default_pop_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

fn default_queue_url() -> String {
    "sqlite:./data/queue.sqlite".to_string()
}
fn default_content_queue() -> String {
    "rag_content_queue".to_string()
}
fn default_access_queue() -> String {
    "rag_acl_queue".to_string()
}
fn default_pop_timeout() -> u64 {
    5
}
fn default_visibility_timeout() -> u64 {
    960
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_max() -> u64 {
    600
}
fn default_job_timeout() -> u64 {
    900
}

impl QueueConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HMAC key for `X-Signature-SHA256`.
    #[serde(default)]
    pub secret: String,
    /// Value expected in `X-Nextcloud-Token`; the secret is used when unset.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret: String::new(),
            token: None,
            source: default_source(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_source() -> String {
    "nextcloud".to_string()
}

impl GatewayConfig {
    pub fn effective_token(&self) -> &str {
        self.token.as_deref().unwrap_or(&self.secret)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_url")]
    pub url: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            url: default_metadata_url(),
        }
    }
}

fn default_metadata_url() -> String {
    "sqlite:./data/metadata.sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileStoreConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_filestore_timeout")]
    pub timeout_secs: u64,
    /// Query the share API for owners, users and groups.
    #[serde(default = "default_true")]
    pub share_api: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: String::new(),
            password: String::new(),
            timeout_secs: default_filestore_timeout(),
            share_api: true,
        }
    }
}

fn default_filestore_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_index_timeout")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            api_key: None,
            collection: default_collection(),
            timeout_secs: default_index_timeout(),
        }
    }
}

fn default_index_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "documents".to_string()
}
fn default_index_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

fn default_max_tokens() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            dims: default_dims(),
            api_key: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

fn default_embedding_url() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccessConfig {
    #[serde(default = "default_owner")]
    pub default_owner: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default)]
    pub owner_rules: Vec<OwnerRule>,
    #[serde(default)]
    pub group_rules: Vec<GroupRule>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            default_owner: default_owner(),
            reconcile_interval_secs: default_reconcile_interval(),
            owner_rules: Vec::new(),
            group_rules: Vec::new(),
        }
    }
}

fn default_owner() -> String {
    "admin".to_string()
}
fn default_reconcile_interval() -> u64 {
    600
}

impl AccessConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Paths matching `pattern` (case-insensitive glob) are owned by `owner`.
#[derive(Debug, Deserialize, Clone)]
pub struct OwnerRule {
    pub pattern: String,
    pub owner: String,
}

/// Paths matching `pattern` (case-insensitive glob) are readable by `group`.
#[derive(Debug, Deserialize, Clone)]
pub struct GroupRule {
    pub pattern: String,
    pub group: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// First segment of owner-relative notification paths.
    #[serde(default = "default_owner_prefix_root")]
    pub owner_prefix_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            owner_prefix_root: default_owner_prefix_root(),
        }
    }
}

fn default_owner_prefix_root() -> String {
    "files".to_string()
}

impl Config {
    /// Applies environment overrides through `lookup`.
    ///
    /// Takes a lookup function rather than reading `std::env` directly so the
    /// mapping can be tested without mutating process state.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let first = |names: &[&str]| names.iter().find_map(|n| lookup(n).filter(|v| !v.is_empty()));

        if let Some(v) = first(&["QUEUE_URL", "REDIS_URL"]) {
            self.queue.url = v;
        }
        if let Some(v) = first(&["NEXTCLOUD_WEBHOOK_SECRET"]) {
            self.gateway.secret = v;
        }
        if let Some(v) = first(&["NEXTCLOUD_WEBHOOK_TOKEN"]) {
            self.gateway.token = Some(v);
        }
        if let Some(v) = first(&["NEXTCLOUD_URL"]) {
            self.filestore.url = v;
        }
        if let Some(v) = first(&["WEBDAV_USER"]) {
            self.filestore.user = v;
        }
        if let Some(v) = first(&["WEBDAV_PASSWORD"]) {
            self.filestore.password = v;
        }
        if let Some(v) = first(&["QDRANT_URL"]) {
            self.index.url = v;
        }
        if let Some(v) = first(&["QDRANT_API_KEY"]) {
            self.index.api_key = Some(v);
        }
        if let Some(v) = first(&["METADATA_URL", "POSTGRES_URL"]) {
            self.metadata.url = v;
        }
        if let Some(v) = first(&["EMBEDDING_API_KEY", "OPENAI_API_KEY"]) {
            self.pipeline.embedding.api_key = Some(v);
        }
        if let Some(v) = first(&["RECONCILE_INTERVAL_SECS"]) {
            self.access.reconcile_interval_secs = v
                .parse()
                .with_context(|| format!("RECONCILE_INTERVAL_SECS is not a number: '{}'", v))?;
        }
        Ok(())
    }

    /// Checks settings shared by every command.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts < 1 {
            bail!("queue.max_attempts must be >= 1");
        }
        if self.queue.pop_timeout_secs < 1 {
            bail!("queue.pop_timeout_secs must be >= 1");
        }
        if self.queue.visibility_timeout_secs
            < self.queue.job_timeout_secs.saturating_add(LEASE_MARGIN_SECS)
        {
            bail!(
                "queue.visibility_timeout_secs ({}) must be at least queue.job_timeout_secs ({}) + {}",
                self.queue.visibility_timeout_secs,
                self.queue.job_timeout_secs,
                LEASE_MARGIN_SECS
            );
        }
        if self.queue.content_queue == self.queue.access_queue {
            bail!("queue.content_queue and queue.access_queue must differ");
        }
        if self.access.reconcile_interval_secs < 1 {
            bail!("access.reconcile_interval_secs must be >= 1");
        }
        if self.pipeline.max_tokens == 0 {
            bail!("pipeline.max_tokens must be > 0");
        }
        if self.pipeline.embedding.batch_size == 0 {
            bail!("pipeline.embedding.batch_size must be > 0");
        }
        Ok(())
    }

    pub fn validate_gateway(&self) -> Result<()> {
        if self.gateway.secret.is_empty() {
            bail!("gateway.secret (or NEXTCLOUD_WEBHOOK_SECRET) must be set");
        }
        Ok(())
    }

    pub fn validate_filestore(&self) -> Result<()> {
        if self.filestore.url.is_empty() || self.filestore.user.is_empty() {
            bail!("filestore.url and filestore.user (or NEXTCLOUD_URL / WEBDAV_USER) must be set");
        }
        Ok(())
    }
}

/// Reads the TOML file, applies environment overrides and validates.
///
/// A missing file is not an error: every section has defaults and a fully
/// environment-driven deployment is valid.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    config.apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}
