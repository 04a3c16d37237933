//! TOML configuration parsing and validation.
//!
//! Configuration is a single TOML file (default `./config/catalog-sync.toml`)
//! with three sections: `[source]` for the catalog, `[target]` for the index,
//! and `[sync]` for batching, permissions, and enabled entity kinds.
//!
//! API tokens may be given inline or through the `CATALOG_API_TOKEN` and
//! `INDEX_API_TOKEN` environment variables. The environment wins when both
//! are set, so the file can be committed without secrets.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::models::EntityKind;
use crate::permissions::DefaultPermissions;

/// Environment variable consulted for the catalog token.
pub const CATALOG_TOKEN_ENV: &str = "CATALOG_API_TOKEN";
/// Environment variable consulted for the index token.
pub const INDEX_TOKEN_ENV: &str = "INDEX_API_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub base_url: String,
    #[serde(default = "default_datasource")]
    pub datasource: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub default_permissions: DefaultPermissions,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_samples")]
    pub samples: usize,
    #[serde(default)]
    pub kinds: KindsConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            default_permissions: DefaultPermissions::default(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            strict: false,
            samples: default_samples(),
            kinds: KindsConfig::default(),
        }
    }
}

/// Per-kind enable flags. Everything is enabled unless switched off.
#[derive(Debug, Deserialize, Clone)]
pub struct KindsConfig {
    #[serde(default = "default_true")]
    pub users: bool,
    #[serde(default = "default_true")]
    pub groups: bool,
    #[serde(default = "default_true")]
    pub components: bool,
    #[serde(default = "default_true")]
    pub apis: bool,
    #[serde(default = "default_true")]
    pub systems: bool,
    #[serde(default = "default_true")]
    pub domains: bool,
    #[serde(default = "default_true")]
    pub resources: bool,
}

impl Default for KindsConfig {
    fn default() -> Self {
        Self {
            users: true,
            groups: true,
            components: true,
            apis: true,
            systems: true,
            domains: true,
            resources: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_page_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_datasource() -> String {
    "backstage".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_samples() -> usize {
    5
}

impl KindsConfig {
    pub fn is_enabled(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::User => self.users,
            EntityKind::Group => self.groups,
            EntityKind::Component => self.components,
            EntityKind::Api => self.apis,
            EntityKind::System => self.systems,
            EntityKind::Domain => self.domains,
            EntityKind::Resource => self.resources,
            EntityKind::Location => false,
        }
    }
}

impl SyncConfig {
    /// Enabled non-identity kinds, in sync order.
    pub fn entity_kinds(&self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|k| !k.is_identity() && self.kinds.is_enabled(*k))
            .collect()
    }

    /// Every enabled kind including users and groups.
    pub fn enabled_kinds(&self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|k| self.kinds.is_enabled(*k))
            .collect()
    }
}

impl SourceConfig {
    /// Token from `CATALOG_API_TOKEN`, else the file, else none.
    pub fn token(&self) -> Option<String> {
        token_from(CATALOG_TOKEN_ENV, &self.api_token)
    }
}

impl TargetConfig {
    /// Token from `INDEX_API_TOKEN`, else the file, else none.
    pub fn token(&self) -> Option<String> {
        token_from(INDEX_TOKEN_ENV, &self.api_token)
    }
}

fn token_from(env: &str, inline: &Option<String>) -> Option<String> {
    std::env::var(env)
        .ok()
        .or_else(|| inline.clone())
        .filter(|t| !t.trim().is_empty())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate source
    validate_url("source.base_url", &config.source.base_url)?;
    if !(1..=1000).contains(&config.source.page_size) {
        bail!("source.page_size must be between 1 and 1000");
    }

    // Validate target
    validate_url("target.base_url", &config.target.base_url)?;
    if config.target.datasource.trim().is_empty() {
        bail!("target.datasource must not be empty");
    }

    // Validate sync
    if !(1..=100).contains(&config.sync.batch_size) {
        bail!("sync.batch_size must be between 1 and 100");
    }
    if config.sync.concurrency == 0 {
        bail!("sync.concurrency must be >= 1");
    }
    if config.sync.max_attempts == 0 {
        bail!("sync.max_attempts must be >= 1");
    }

    Ok(config)
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{} must be set", field);
    }
    let url = reqwest::Url::parse(value).with_context(|| format!("{} is not a valid URL", field))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => bail!("{} must use http or https, got '{}'", field, other),
    }
}

/// Commented starter configuration written by `catalog-sync init`.
pub const SAMPLE_CONFIG: &str = r#"# catalog-sync configuration

[source]
# Base URL of the catalog (Backstage) instance.
base_url = "https://demo.backstage.io"
# Optional bearer token. Prefer the CATALOG_API_TOKEN environment variable.
# api_token = ""
page_size = 100
verify_ssl = true
timeout_secs = 30

[target]
# Base URL of the indexing API.
base_url = "https://index.example.com/api/index/v1"
datasource = "backstage"
# Prefer the INDEX_API_TOKEN environment variable.
# api_token = ""
verify_ssl = true
timeout_secs = 30

[sync]
# Documents per upload call (1..=100).
batch_size = 50
# Applied to entities without a resolvable owner:
#   "datasource-users" -> visible to anyone with catalog access (default)
#   "all-users"        -> visible to everyone
#   "owner"            -> visible only to a user owner with an email; otherwise nobody
#   "none"             -> visible to nobody
default_permissions = "datasource-users"
# Entity kinds synced in parallel.
concurrency = 4
# Attempts per page fetch or batch upload on transient errors.
max_attempts = 3
# Exit non-zero when any record is skipped or batch rejected.
strict = false
# Sample documents shown per kind in dry runs.
samples = 5

[sync.kinds]
users = true
groups = true
components = true
apis = true
systems = true
domains = true
resources = true
"#;
