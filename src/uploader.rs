//! Batched uploads to the index.
//!
//! A [`BatchUploader`] buffers items and sends them to the target in
//! batches of at most `batch_size`. Each batch is one retry sequence:
//! transient failures are retried per the [`RetryPolicy`], and a batch that
//! still fails is counted as rejected so the next batch can proceed. Only
//! bad credentials ([`SyncError::TargetAuth`]) and cancellation are
//! returned to the caller.
//!
//! Every buffered item is part of exactly one flush attempt sequence, or
//! is counted as abandoned when the run is cancelled before its flush.

use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::models::{Document, IdentityRecord};
use crate::retry::RetryPolicy;
use crate::target::IndexTarget;

/// Something a [`BatchUploader`] can send, tied to the target call that
/// accepts it.
pub trait UploadItem: Sized + Serialize + Send + Sync + 'static {
    /// Name used in logs ("documents", "identities").
    const LABEL: &'static str;

    fn upload<'a>(
        target: &'a dyn IndexTarget,
        generation: &'a str,
        items: &'a [Self],
    ) -> BoxFuture<'a, SyncResult<()>>;
}

impl UploadItem for Document {
    const LABEL: &'static str = "documents";

    fn upload<'a>(
        target: &'a dyn IndexTarget,
        generation: &'a str,
        items: &'a [Self],
    ) -> BoxFuture<'a, SyncResult<()>> {
        target.upload_documents(generation, items)
    }
}

impl UploadItem for IdentityRecord {
    const LABEL: &'static str = "identities";

    fn upload<'a>(
        target: &'a dyn IndexTarget,
        generation: &'a str,
        items: &'a [Self],
    ) -> BoxFuture<'a, SyncResult<()>> {
        target.upload_identities(generation, items)
    }
}

/// Per-uploader counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub uploaded: usize,
    pub rejected: usize,
    pub batches: usize,
    pub rejected_batches: usize,
    /// Items dropped unsent because the run was cancelled.
    pub abandoned: usize,
}

impl UploadStats {
    pub fn merge(&mut self, other: &UploadStats) {
        self.uploaded += other.uploaded;
        self.rejected += other.rejected;
        self.batches += other.batches;
        self.rejected_batches += other.rejected_batches;
        self.abandoned += other.abandoned;
    }
}

pub struct BatchUploader<T: UploadItem> {
    target: Arc<dyn IndexTarget>,
    generation: String,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    buffer: Vec<T>,
    stats: UploadStats,
}

impl<T: UploadItem> BatchUploader<T> {
    pub fn new(
        target: Arc<dyn IndexTarget>,
        generation: &str,
        batch_size: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            target,
            generation: generation.to_string(),
            batch_size,
            retry,
            cancel,
            buffer: Vec::with_capacity(batch_size),
            stats: UploadStats::default(),
        }
    }

    /// Buffer one item, flushing when the buffer reaches `batch_size`.
    pub async fn add(&mut self, item: T) -> SyncResult<()> {
        self.buffer.push(item);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send everything buffered as one batch.
    pub async fn flush(&mut self) -> SyncResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            self.stats.abandoned += self.buffer.len();
            self.buffer.clear();
            return Err(SyncError::Cancelled);
        }

        let batch = std::mem::take(&mut self.buffer);
        let count = batch.len();
        let target = self.target.as_ref();
        let generation = self.generation.as_str();
        let items = batch.as_slice();
        let result = self
            .retry
            .run(T::LABEL, move || T::upload(target, generation, items))
            .await;

        self.stats.batches += 1;
        match result {
            Ok(()) => {
                self.stats.uploaded += count;
                tracing::debug!(label = T::LABEL, items = count, "batch uploaded");
                Ok(())
            }
            Err(err @ SyncError::TargetAuth { .. }) => {
                self.stats.rejected += count;
                self.stats.rejected_batches += 1;
                Err(err)
            }
            Err(err) => {
                let err = match err {
                    SyncError::TargetUnavailable { message } => SyncError::UploadRejected {
                        items: count,
                        message,
                    },
                    other => other,
                };
                self.stats.rejected += count;
                self.stats.rejected_batches += 1;
                tracing::warn!(
                    label = T::LABEL,
                    items = count,
                    error = %err,
                    "batch rejected, continuing"
                );
                Ok(())
            }
        }
    }

    /// Flush the remainder and return the final counters.
    pub async fn close(&mut self) -> SyncResult<UploadStats> {
        self.flush().await?;
        Ok(self.stats.clone())
    }

    /// Counters so far. Useful when `close` returned an error.
    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Tell the index the generation is complete, with retry.
///
/// Any failure other than bad credentials is reported as
/// [`SyncError::FinalizeFailed`].
/// Make sure the index has the datasource before anything is uploaded.
/// Any failure other than bad credentials becomes [`SyncError::DatasourceSetup`].
pub async fn provision(target: &dyn IndexTarget, retry: &RetryPolicy) -> SyncResult<()> {
    retry
        .run("datasource setup", move || target.ensure_datasource())
        .await
        .map_err(|e| match e {
            SyncError::TargetAuth { .. } => e,
            other => SyncError::DatasourceSetup {
                message: other.to_string(),
            },
        })
}

pub async fn finalize(
    target: &dyn IndexTarget,
    generation: &str,
    retry: &RetryPolicy,
) -> SyncResult<()> {
    retry
        .run("generation complete", move || target.complete_generation(generation))
        .await
        .map_err(|e| match e {
            SyncError::TargetAuth { .. } => e,
            other => SyncError::FinalizeFailed {
                message: other.to_string(),
            },
        })
}
