//! Index access.
//!
//! [`IndexTarget`] is everything the engine needs from the search index:
//! upload a batch of documents or identities tagged with the run's
//! generation id, and mark the generation complete so the index can drop
//! documents that were not re-uploaded.
//!
//! Implementations make a single attempt per call. Retries live in the
//! uploader so every target, real or fake, gets the same policy.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use std::time::Duration;

use crate::config::TargetConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Document, IdentityRecord};
use crate::retry::truncate;

#[async_trait]
pub trait IndexTarget: Send + Sync {
    async fn upload_documents(&self, generation: &str, documents: &[Document]) -> SyncResult<()>;

    async fn upload_identities(
        &self,
        generation: &str,
        identities: &[IdentityRecord],
    ) -> SyncResult<()>;

    /// Signal that every document of `generation` has been uploaded.
    async fn complete_generation(&self, generation: &str) -> SyncResult<()>;

    /// Create the datasource if the index does not know it yet.
    async fn ensure_datasource(&self) -> SyncResult<()>;

    async fn test_connection(&self) -> SyncResult<()>;
}

/// [`IndexTarget`] speaking JSON over HTTP(S) with a bearer token.
///
/// | Call | Request |
/// |------|---------|
/// | documents | `POST {base}/documents` |
/// | identities | `POST {base}/identities` |
/// | complete | `POST {base}/generation/complete` |
/// | provision | `GET {base}/datasources/{datasource}`, then `POST {base}/datasources` on 404 |
/// | test | `GET {base}/datasources/{datasource}` |
pub struct HttpIndexClient {
    client: reqwest::Client,
    base_url: String,
    datasource: String,
}

#[derive(Serialize)]
struct UploadBody<'a, T: Serialize> {
    datasource: &'a str,
    generation: &'a str,
    #[serde(flatten)]
    items: T,
}

#[derive(Serialize)]
struct Documents<'a> {
    documents: &'a [Document],
}

#[derive(Serialize)]
struct Identities<'a> {
    identities: &'a [IdentityRecord],
}

#[derive(Serialize)]
struct CompleteBody<'a> {
    datasource: &'a str,
    generation: &'a str,
}

#[derive(Serialize)]
struct DatasourceBody<'a> {
    name: &'a str,
    display_name: &'a str,
}

impl HttpIndexClient {
    pub fn new(config: &TargetConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = config.token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Index API token contains invalid characters")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .default_headers(headers)
            .user_agent(concat!("catalog-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build index HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            datasource: config.datasource.clone(),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        items: usize,
    ) -> SyncResult<()> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::TargetUnavailable {
                message: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify(status, &text, items))
    }

    async fn get_datasource(&self) -> SyncResult<reqwest::Response> {
        let url = format!("{}/datasources/{}", self.base_url, self.datasource);
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::TargetUnavailable {
                message: e.to_string(),
            })
    }
}

/// Map a non-success index response onto the error taxonomy.
fn classify(status: reqwest::StatusCode, body: &str, items: usize) -> SyncError {
    let code = status.as_u16();
    let message = format!("HTTP {}: {}", status, truncate(body));
    match code {
        401 | 403 => SyncError::TargetAuth { status: code },
        429 => SyncError::TargetUnavailable { message },
        _ if status.is_server_error() => SyncError::TargetUnavailable { message },
        _ => SyncError::UploadRejected { items, message },
    }
}

#[async_trait]
impl IndexTarget for HttpIndexClient {
    async fn upload_documents(&self, generation: &str, documents: &[Document]) -> SyncResult<()> {
        let body = UploadBody {
            datasource: &self.datasource,
            generation,
            items: Documents { documents },
        };
        self.post("documents", &body, documents.len()).await
    }

    async fn upload_identities(
        &self,
        generation: &str,
        identities: &[IdentityRecord],
    ) -> SyncResult<()> {
        let body = UploadBody {
            datasource: &self.datasource,
            generation,
            items: Identities { identities },
        };
        self.post("identities", &body, identities.len()).await
    }

    async fn complete_generation(&self, generation: &str) -> SyncResult<()> {
        let body = CompleteBody {
            datasource: &self.datasource,
            generation,
        };
        self.post("generation/complete", &body, 0).await
    }

    async fn ensure_datasource(&self) -> SyncResult<()> {
        let resp = self.get_datasource().await?;
        let status = resp.status();
        if status.is_success() {
            tracing::debug!(datasource = %self.datasource, "datasource already exists");
            return Ok(());
        }
        if status != reqwest::StatusCode::NOT_FOUND {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify(status, &text, 0));
        }

        let body = DatasourceBody {
            name: &self.datasource,
            display_name: &self.datasource,
        };
        self.post("datasources", &body, 0).await?;
        tracing::info!(datasource = %self.datasource, "created datasource");
        Ok(())
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let resp = self.get_datasource().await?;
        let status = resp.status();
        // A missing datasource still proves the API is up and the token works.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify(status, &text, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn classify_statuses() {
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, "", 1),
            SyncError::TargetAuth { status: 403 }
        ));
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, "", 1).is_transient());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "", 1).is_transient());
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "bad doc", 4),
            SyncError::UploadRejected { items: 4, .. }
        ));
    }

    #[test]
    fn upload_body_is_flat() {
        let body = UploadBody {
            datasource: "backstage",
            generation: "g1",
            items: Documents { documents: &[] },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"datasource": "backstage", "generation": "g1", "documents": []})
        );
    }
}
