//! Catalog access.
//!
//! [`CatalogSource`] is the seam between the engine and the catalog. The
//! engine only ever asks for one page of one kind at a time and follows
//! `next_cursor` until it is absent; [`fetch_all`] packages that loop for
//! callers that want every entity of a kind.
//!
//! [`HttpCatalogClient`] talks to a Backstage-style catalog:
//!
//! ```text
//! GET {base}/api/catalog/entities/by-query?filter=kind=<kind>&limit=<n>[&cursor=<c>]
//! → { "items": [...], "pageInfo": { "nextCursor": "..." } }
//! ```
//!
//! A bare JSON array (the older `/entities` shape) is accepted too and is
//! treated as the final page.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{EntityKind, SourceEntity};
use crate::retry::{source_status_error, RetryPolicy};

/// One page of catalog records of a single kind.
#[derive(Debug, Default)]
pub struct Page {
    pub entities: Vec<SourceEntity>,
    /// Records that failed to parse. Each was skipped and logged.
    pub malformed: Vec<SyncError>,
    pub next_cursor: Option<String>,
}

impl Page {
    /// Parse raw catalog items, keeping the good ones and collecting the rest.
    pub fn parse(
        kind: EntityKind,
        items: Vec<serde_json::Value>,
        next_cursor: Option<String>,
    ) -> Self {
        let mut page = Page {
            next_cursor: next_cursor.filter(|c| !c.is_empty()),
            ..Default::default()
        };
        for item in items {
            match SourceEntity::from_json(kind, item) {
                Ok(entity) => page.entities.push(entity),
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "skipping malformed catalog record");
                    page.malformed.push(e);
                }
            }
        }
        page
    }
}

/// Paginated, read-only access to the catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch one page of entities of `kind`, starting at `cursor`.
    async fn list_entities(&self, kind: EntityKind, cursor: Option<&str>) -> SyncResult<Page>;

    /// Check that the catalog is reachable and accepts our credentials.
    async fn test_connection(&self) -> SyncResult<()> {
        self.list_entities(EntityKind::Component, None).await.map(|_| ())
    }
}

/// Everything [`fetch_all`] managed to read for one kind.
#[derive(Debug, Default)]
pub struct Fetched {
    pub entities: Vec<SourceEntity>,
    pub malformed: Vec<SyncError>,
    pub pages: usize,
    /// Set when pagination stopped early. `entities` still holds the pages
    /// read before the failure.
    pub error: Option<SyncError>,
}

/// Cursor-following iterator over the pages of one kind.
///
/// Yields each page in order, then `None`. After an error (including
/// cancellation) it yields that error once and stops. A cursor the catalog
/// hands back twice is an error too: the page that carried it is yielded,
/// then pagination ends with [`SyncError::SourceUnavailable`] so the kind
/// counts as incompletely read.
pub struct Pager<'a> {
    source: &'a dyn CatalogSource,
    kind: EntityKind,
    cursor: Option<String>,
    pending: Option<SyncError>,
    done: bool,
}

impl<'a> Pager<'a> {
    pub fn new(source: &'a dyn CatalogSource, kind: EntityKind) -> Self {
        Self {
            source,
            kind,
            cursor: None,
            pending: None,
            done: false,
        }
    }

    pub async fn next_page(&mut self, cancel: &CancellationToken) -> Option<SyncResult<Page>> {
        if let Some(err) = self.pending.take() {
            self.done = true;
            return Some(Err(err));
        }
        if self.done {
            return None;
        }
        if cancel.is_cancelled() {
            self.done = true;
            return Some(Err(SyncError::Cancelled));
        }

        let page = match self.source.list_entities(self.kind, self.cursor.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        match &page.next_cursor {
            Some(next) if self.cursor.as_deref() == Some(next.as_str()) => {
                tracing::warn!(
                    kind = %self.kind,
                    cursor = %next,
                    "catalog returned the same cursor twice, stopping"
                );
                self.pending = Some(SyncError::SourceUnavailable {
                    message: format!("cursor loop while listing {} at '{}'", self.kind, next),
                    transient: false,
                });
            }
            Some(next) => self.cursor = Some(next.clone()),
            None => self.done = true,
        }
        Some(Ok(page))
    }
}

/// Read every page of `kind`. Stops early on error or cancellation and
/// reports what was fetched up to that point.
pub async fn fetch_all(
    source: &dyn CatalogSource,
    kind: EntityKind,
    cancel: &CancellationToken,
) -> Fetched {
    let mut fetched = Fetched::default();
    let mut pager = Pager::new(source, kind);

    while let Some(result) = pager.next_page(cancel).await {
        match result {
            Ok(page) => {
                fetched.pages += 1;
                fetched.entities.extend(page.entities);
                fetched.malformed.extend(page.malformed);
            }
            Err(e) => fetched.error = Some(e),
        }
    }

    tracing::debug!(
        kind = %kind,
        pages = fetched.pages,
        entities = fetched.entities.len(),
        malformed = fetched.malformed.len(),
        "fetched catalog kind"
    );
    fetched
}

// ============ HTTP client ============

/// [`CatalogSource`] backed by the Backstage catalog REST API.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    page_size: usize,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    Query {
        items: Vec<serde_json::Value>,
        #[serde(default, rename = "pageInfo")]
        page_info: PageInfo,
    },
    List(Vec<serde_json::Value>),
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    next_cursor: Option<String>,
}

impl HttpCatalogClient {
    pub fn new(config: &SourceConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = config.token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Catalog API token contains invalid characters")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .default_headers(headers)
            .user_agent(concat!("catalog-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build catalog HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            retry,
        })
    }

    async fn fetch_page(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> SyncResult<Page> {
        let url = format!("{}/api/catalog/entities/by-query", self.base_url);
        let filter = format!("kind={}", kind.slug());
        let limit = limit.to_string();

        let client = &self.client;
        let (url, filter, limit) = (&url, &filter, &limit);
        let body = self
            .retry
            .run("catalog page", move || async move {
                let mut request = client
                    .get(url)
                    .query(&[("filter", filter.as_str()), ("limit", limit.as_str())]);
                if let Some(cursor) = cursor {
                    request = request.query(&[("cursor", cursor)]);
                }

                let resp = request.send().await.map_err(transport_error)?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(source_status_error(status, &body));
                }

                let bytes = resp.bytes().await.map_err(transport_error)?;
                serde_json::from_slice::<PageBody>(&bytes).map_err(|e| {
                    SyncError::SourceUnavailable {
                        message: format!("undecodable {} page: {}", kind, e),
                        transient: false,
                    }
                })
            })
            .await?;

        Ok(match body {
            PageBody::Query { items, page_info } => Page::parse(kind, items, page_info.next_cursor),
            PageBody::List(items) => Page::parse(kind, items, None),
        })
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    SyncError::SourceUnavailable {
        message: e.to_string(),
        transient: true,
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogClient {
    async fn list_entities(&self, kind: EntityKind, cursor: Option<&str>) -> SyncResult<Page> {
        self.fetch_page(kind, cursor, self.page_size).await
    }

    async fn test_connection(&self) -> SyncResult<()> {
        self.fetch_page(EntityKind::Component, None, 1).await.map(|_| ())
    }
}
