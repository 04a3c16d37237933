//! Sync orchestration.
//!
//! A run moves through an explicit state machine:
//!
//! ```text
//! Idle ──▶ SyncingIdentities ──▶ SyncingEntities ──▶ Finalizing ──▶ Completed
//!   │              │                    │   └──(dry run)──────────────▲
//!   └──────────────┴────────────────────┴──▶ Failed | Cancelled
//! ```
//!
//! Identities are always resolved to completion before the first entity
//! page is requested. The directory is then frozen behind an `Arc` and
//! shared with the entity workers, which run with bounded concurrency.
//! Within one kind, fetching runs one page ahead of mapping and uploading.
//!
//! The generation is only finalized when every enabled kind was read in
//! full. Finalizing after a partial read would let the index delete live
//! documents of the kind that failed.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::SyncError;
use crate::identity::{IdentityDirectory, IdentityStats};
use crate::mapper::{map_entity, MappingContext};
use crate::models::{Document, EntityKind, IdentityKind, IdentityRecord, Visibility};
use crate::permissions::DefaultPermissions;
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::retry::RetryPolicy;
use crate::source::{CatalogSource, HttpCatalogClient, Page, Pager};
use crate::target::{HttpIndexClient, IndexTarget};
use crate::uploader::{self, BatchUploader, UploadStats};

/// Orchestrator state. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    SyncingIdentities,
    SyncingEntities,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncState::Completed | SyncState::Failed | SyncState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (Idle, SyncingIdentities) | (Idle, SyncingEntities) => true,
            (SyncingIdentities, SyncingEntities) => true,
            (SyncingEntities, Finalizing) => true,
            // dry run
            (SyncingEntities, Completed) => true,
            (Finalizing, Completed) => true,
            (Finalizing, Failed) => true,
            (Idle | SyncingIdentities | SyncingEntities, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Engine settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub catalog_base_url: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub default_permissions: DefaultPermissions,
    pub sync_users: bool,
    pub sync_groups: bool,
    /// Non-identity kinds to sync, in order.
    pub entity_kinds: Vec<EntityKind>,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            catalog_base_url: config.source.base_url.clone(),
            batch_size: config.sync.batch_size,
            concurrency: config.sync.concurrency,
            retry: RetryPolicy::new(config.sync.max_attempts),
            default_permissions: config.sync.default_permissions,
            sync_users: config.sync.kinds.users,
            sync_groups: config.sync.kinds.groups,
            entity_kinds: config.sync.entity_kinds(),
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Fetch and map everything but upload nothing and skip finalize.
    pub dry_run: bool,
    /// Sample documents kept per kind in the report.
    pub samples: usize,
    /// Keep every mapped document and identity in the report, for export.
    pub collect_all: bool,
}

/// Per-run state passed to the workers. Nothing here is global.
#[derive(Debug)]
pub struct RunContext {
    pub generation: String,
    pub started_at: DateTime<Utc>,
    state: SyncState,
    transitions: Vec<SyncState>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            generation: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            state: SyncState::Idle,
            transitions: vec![SyncState::Idle],
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn advance(&mut self, next: SyncState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::info!(from = ?self.state, to = ?next, generation = %self.generation, "sync state");
        self.state = next;
        self.transitions.push(next);
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one entity kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub pages: usize,
    /// Records returned by the catalog, including malformed ones.
    pub fetched: usize,
    pub mapped: usize,
    /// `malformed + unmappable`.
    pub skipped: usize,
    pub malformed: usize,
    pub unmappable: usize,
    pub uploaded: usize,
    pub rejected: usize,
    pub abandoned: usize,
    /// Why the kind stopped early, if it did.
    pub error: Option<String>,
}

/// Identity phase counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub users: usize,
    pub groups: usize,
    pub users_without_email: usize,
    pub duplicate_emails: usize,
    pub unresolved_members: usize,
    pub malformed: usize,
    pub partial_kinds: Vec<EntityKind>,
    pub uploaded: usize,
    pub rejected: usize,
}

impl IdentitySummary {
    fn from_stats(directory: &IdentityDirectory, stats: &IdentityStats) -> Self {
        Self {
            users: directory.user_count(),
            groups: directory.group_count(),
            users_without_email: stats.users_without_email,
            duplicate_emails: stats.duplicate_emails,
            unresolved_members: stats.unresolved_members,
            malformed: stats.malformed,
            partial_kinds: stats.partial_kinds.clone(),
            ..Default::default()
        }
    }
}

/// Outcome of one run. Always produced, whatever the final state.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub generation: String,
    pub dry_run: bool,
    pub state: SyncState,
    pub transitions: Vec<SyncState>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub identities: IdentitySummary,
    pub kinds: BTreeMap<EntityKind, KindStats>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
    #[serde(skip)]
    pub samples: BTreeMap<EntityKind, Vec<Document>>,
    /// Every mapped document, when [`SyncOptions::collect_all`] is set.
    #[serde(skip)]
    pub documents: Vec<Document>,
    #[serde(skip)]
    pub identity_records: Vec<IdentityRecord>,
}

fn serialize_error<S: serde::Serializer>(err: &Option<SyncError>, s: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(e) => s.collect_str(e),
        None => s.serialize_none(),
    }
}

impl SyncReport {
    fn new(run: &RunContext, dry_run: bool) -> Self {
        Self {
            generation: run.generation.clone(),
            dry_run,
            state: run.state,
            transitions: run.transitions.clone(),
            started_at: run.started_at,
            duration_ms: 0,
            identities: IdentitySummary::default(),
            kinds: BTreeMap::new(),
            error: None,
            samples: BTreeMap::new(),
            documents: Vec::new(),
            identity_records: Vec::new(),
        }
    }

    /// Skipped records plus rejected items across all kinds and identities.
    pub fn issue_count(&self) -> usize {
        let kinds: usize = self.kinds.values().map(|k| k.skipped + k.rejected).sum();
        kinds + self.identities.rejected + self.identities.malformed
    }

    pub fn totals(&self) -> KindStats {
        let mut total = KindStats::default();
        for k in self.kinds.values() {
            total.pages += k.pages;
            total.fetched += k.fetched;
            total.mapped += k.mapped;
            total.skipped += k.skipped;
            total.malformed += k.malformed;
            total.unmappable += k.unmappable;
            total.uploaded += k.uploaded;
            total.rejected += k.rejected;
            total.abandoned += k.abandoned;
        }
        total
    }

    /// Process exit code: 0 on success, 1 on failure, 2 when `strict` and
    /// anything was skipped or rejected, 130 when cancelled.
    pub fn exit_code(&self, strict: bool) -> i32 {
        match self.state {
            SyncState::Completed if strict && self.issue_count() > 0 => 2,
            SyncState::Completed => 0,
            SyncState::Cancelled => 130,
            _ => 1,
        }
    }
}

/// What one kind worker produced.
struct KindOutcome {
    kind: EntityKind,
    stats: KindStats,
    samples: Vec<Document>,
    documents: Vec<Document>,
    error: Option<SyncError>,
}

/// Runs identity sync, entity sync and finalize against a source and target.
pub struct SyncOrchestrator {
    source: Arc<dyn CatalogSource>,
    target: Arc<dyn IndexTarget>,
    settings: SyncSettings,
    progress: Arc<dyn SyncProgressReporter>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        target: Arc<dyn IndexTarget>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            source,
            target,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    /// Orchestrator backed by the HTTP catalog and index clients.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let settings = SyncSettings::from_config(config);
        let source = HttpCatalogClient::new(&config.source, settings.retry.clone())?;
        let target = HttpIndexClient::new(&config.target)?;
        Ok(Self::new(Arc::new(source), Arc::new(target), settings))
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Execute one run. Never panics on collaborator failure; the returned
    /// report carries the final state and any fatal error.
    pub async fn run(&self, options: &SyncOptions, cancel: &CancellationToken) -> SyncReport {
        let clock = Instant::now();
        let mut run = RunContext::new();
        let mut report = SyncReport::new(&run, options.dry_run);

        tracing::info!(
            generation = %run.generation,
            dry_run = options.dry_run,
            kinds = ?self.settings.entity_kinds,
            "starting sync"
        );

        let outcome = self.execute(&mut run, &mut report, options, cancel).await;
        if let Err(err) = outcome {
            let terminal = if matches!(err, SyncError::Cancelled) {
                SyncState::Cancelled
            } else {
                SyncState::Failed
            };
            tracing::error!(error = %err, state = ?terminal, "sync did not complete");
            run.advance(terminal);
            report.error = Some(err);
        }

        report.state = run.state;
        report.transitions = run.transitions.clone();
        report.duration_ms = clock.elapsed().as_millis() as u64;
        tracing::info!(
            state = ?report.state,
            duration_ms = report.duration_ms,
            issues = report.issue_count(),
            "sync finished"
        );
        report
    }

    async fn execute(
        &self,
        run: &mut RunContext,
        report: &mut SyncReport,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if self.settings.entity_kinds.is_empty() {
            return Err(SyncError::NoKindsEnabled);
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !options.dry_run {
            uploader::provision(self.target.as_ref(), &self.settings.retry).await?;
        }

        // Identity barrier: the directory is complete before any entity page.
        let directory = if self.settings.sync_users || self.settings.sync_groups {
            run.advance(SyncState::SyncingIdentities);
            let directory = self.sync_identities(run, report, options, cancel).await?;
            Arc::new(directory)
        } else {
            tracing::info!("user and group sync disabled, owners will use default permissions");
            Arc::new(IdentityDirectory::default())
        };

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        run.advance(SyncState::SyncingEntities);

        let ctx = MappingContext::new(
            &self.settings.catalog_base_url,
            self.settings.default_permissions,
            run.started_at,
        );
        let ctx = &ctx;
        let generation = run.generation.as_str();
        let kinds = self.settings.entity_kinds.iter().copied();
        let mut outcomes: Vec<KindOutcome> = stream::iter(kinds)
            .map(move |kind| {
                self.sync_kind(kind, directory.clone(), ctx, generation, options, cancel)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.kind);

        let mut fatal = None;
        let mut cancelled = false;
        let mut incomplete = Vec::new();
        for outcome in outcomes {
            match outcome.error {
                Some(SyncError::Cancelled) => cancelled = true,
                Some(err) if err.is_fatal() => {
                    fatal.get_or_insert(err);
                }
                Some(_) => incomplete.push(outcome.kind.slug().to_string()),
                None => {}
            }
            report.kinds.insert(outcome.kind, outcome.stats);
            report.samples.insert(outcome.kind, outcome.samples);
            report.documents.extend(outcome.documents);
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        if cancelled || cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !incomplete.is_empty() {
            return Err(SyncError::IncompleteGeneration { kinds: incomplete });
        }

        if options.dry_run {
            run.advance(SyncState::Completed);
            return Ok(());
        }

        run.advance(SyncState::Finalizing);
        self.progress.report(SyncProgressEvent::Finalizing {
            generation: run.generation.clone(),
        });
        uploader::finalize(self.target.as_ref(), &run.generation, &self.settings.retry).await?;
        run.advance(SyncState::Completed);
        Ok(())
    }

    async fn sync_identities(
        &self,
        run: &RunContext,
        report: &mut SyncReport,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<IdentityDirectory, SyncError> {
        let (directory, stats) = IdentityDirectory::build(
            self.source.as_ref(),
            self.settings.sync_users,
            self.settings.sync_groups,
            cancel,
        )
        .await?;
        report.identities = IdentitySummary::from_stats(&directory, &stats);
        self.progress.report(SyncProgressEvent::Identities {
            users: directory.user_count(),
            groups: directory.group_count(),
        });

        // Users without an email cannot be granted access by the index.
        let uploadable: Vec<IdentityRecord> = directory
            .records()
            .filter(|r| r.kind == IdentityKind::Group || r.canonical_email.is_some())
            .cloned()
            .collect();

        if options.dry_run {
            if options.collect_all {
                report.identity_records = uploadable;
            }
            return Ok(directory);
        }

        let mut uploader: BatchUploader<IdentityRecord> = BatchUploader::new(
            self.target.clone(),
            &run.generation,
            self.settings.batch_size,
            self.settings.retry.clone(),
            cancel.clone(),
        );
        let mut result = Ok(());
        for record in uploadable {
            if let Err(e) = uploader.add(record).await {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = uploader.close().await.map(|_| ());
        }
        report.identities.uploaded = uploader.stats().uploaded;
        report.identities.rejected = uploader.stats().rejected;
        result.map(|_| directory)
    }

    /// Fetch, map and upload one kind. The fetch side runs one page ahead
    /// of the consumer through a channel of capacity one.
    async fn sync_kind(
        &self,
        kind: EntityKind,
        directory: Arc<IdentityDirectory>,
        ctx: &MappingContext,
        generation: &str,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> KindOutcome {
        let (tx, mut rx) = mpsc::channel::<Page>(1);
        let source = self.source.as_ref();

        let producer = async move {
            let mut pager = Pager::new(source, kind);
            while let Some(result) = pager.next_page(cancel).await {
                match result {
                    Ok(page) => {
                        if tx.send(page).await.is_err() {
                            // consumer stopped early
                            return None;
                        }
                    }
                    Err(e) => return Some(e),
                }
            }
            None
        };

        let consumer = async move {
            let mut stats = KindStats::default();
            let mut samples = Vec::new();
            let mut documents = Vec::new();
            let mut error = None;
            let mut uploader: Option<BatchUploader<Document>> = (!options.dry_run).then(|| {
                BatchUploader::new(
                    self.target.clone(),
                    generation,
                    self.settings.batch_size,
                    self.settings.retry.clone(),
                    cancel.clone(),
                )
            });

            'pages: while let Some(page) = rx.recv().await {
                stats.pages += 1;
                stats.fetched += page.entities.len() + page.malformed.len();
                stats.malformed += page.malformed.len();

                for entity in &page.entities {
                    let doc = match map_entity(entity, &directory, ctx) {
                        Ok(doc) => doc,
                        Err(e) => {
                            tracing::warn!(kind = %kind, error = %e, "skipping entity");
                            stats.unmappable += 1;
                            continue;
                        }
                    };
                    stats.mapped += 1;
                    if samples.len() < options.samples {
                        samples.push(doc.clone());
                    }
                    if options.collect_all {
                        documents.push(doc.clone());
                    }
                    if let Some(uploader) = uploader.as_mut() {
                        if let Err(e) = uploader.add(doc).await {
                            error = Some(e);
                            break 'pages;
                        }
                    }
                }

                self.progress.report(SyncProgressEvent::Kind {
                    kind,
                    fetched: stats.fetched,
                    mapped: stats.mapped,
                    uploaded: uploader.as_ref().map_or(0, |u| u.stats().uploaded),
                });
            }
            drop(rx);

            if let Some(uploader) = uploader.as_mut() {
                if error.is_none() {
                    if let Err(e) = uploader.close().await {
                        error = Some(e);
                    }
                }
                let upload: &UploadStats = uploader.stats();
                stats.uploaded = upload.uploaded;
                stats.rejected = upload.rejected;
                stats.abandoned = upload.abandoned + uploader.buffered();
            }
            (stats, samples, documents, error)
        };

        let (fetch_error, (mut stats, samples, documents, upload_error)) =
            tokio::join!(producer, consumer);

        stats.skipped = stats.malformed + stats.unmappable;
        // A failed upload stops the consumer, which in turn stops the
        // producer; report the upload failure as the cause.
        let error = upload_error.or(fetch_error);
        if let Some(err) = &error {
            tracing::warn!(kind = %kind, error = %err, "kind did not complete");
            stats.error = Some(err.to_string());
        }

        self.progress.report(SyncProgressEvent::KindDone {
            kind,
            mapped: stats.mapped,
            skipped: stats.skipped,
            rejected: stats.rejected,
        });

        KindOutcome {
            kind,
            stats,
            samples,
            documents,
            error,
        }
    }
}

/// Print a run report to stdout.
pub fn print_report(report: &SyncReport) {
    let mode = if report.dry_run { " (dry-run)" } else { "" };
    println!("sync{} generation {}", mode, report.generation);

    let ids = &report.identities;
    println!(
        "  identities: {} users, {} groups ({} uploaded, {} rejected)",
        ids.users, ids.groups, ids.uploaded, ids.rejected
    );
    if ids.users_without_email > 0 || ids.duplicate_emails > 0 || ids.unresolved_members > 0 {
        println!(
            "    without email: {}  duplicate emails: {}  unresolved members: {}",
            ids.users_without_email, ids.duplicate_emails, ids.unresolved_members
        );
    }

    println!(
        "  {:<10} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "KIND", "FETCHED", "MAPPED", "SKIPPED", "UPLOADED", "REJECTED"
    );
    for (kind, stats) in &report.kinds {
        println!(
            "  {:<10} {:>8} {:>8} {:>8} {:>8} {:>8}",
            kind.slug(),
            stats.fetched,
            stats.mapped,
            stats.skipped,
            stats.uploaded,
            stats.rejected
        );
        if let Some(err) = &stats.error {
            println!("    stopped early: {}", err);
        }
    }
    let total = report.totals();
    println!(
        "  {:<10} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "total", total.fetched, total.mapped, total.skipped, total.uploaded, total.rejected
    );

    println!("  duration: {:.1}s", report.duration_ms as f64 / 1000.0);
    match (&report.state, &report.error) {
        (SyncState::Completed, _) => println!("ok"),
        (state, Some(err)) => println!("{:?}: {}", state, err),
        (state, None) => println!("{:?}", state),
    }
}

/// Print sample documents collected during a dry run.
pub fn print_samples(report: &SyncReport) {
    for (kind, docs) in &report.samples {
        if docs.is_empty() {
            continue;
        }
        println!();
        println!("samples: {} ({} shown)", kind.slug(), docs.len());
        for doc in docs {
            println!("  {}  {}", doc.id, doc.title);
            println!("    url: {}", doc.url);
            println!("    visibility: {}", describe_visibility(&doc.visibility));
            if let Some(container) = &doc.container_id {
                println!("    container: {}", container);
            }
        }
    }
}

fn describe_visibility(v: &Visibility) -> String {
    match v {
        Visibility::Restricted(principals) if principals.is_empty() => "restricted (nobody)".into(),
        Visibility::Restricted(principals) => format!("restricted ({})", principals.join(", ")),
        Visibility::AllUsers => "all users".into(),
        Visibility::DatasourceUsers => "datasource users".into(),
        Visibility::None => "none".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use SyncState::*;
        assert!(Idle.can_transition_to(SyncingIdentities));
        assert!(Idle.can_transition_to(SyncingEntities));
        assert!(SyncingEntities.can_transition_to(Completed));
        assert!(Finalizing.can_transition_to(Failed));
        assert!(!Finalizing.can_transition_to(Cancelled));
        assert!(!SyncingEntities.can_transition_to(SyncingIdentities));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Finalizing));
    }

    #[test]
    fn terminal_states() {
        assert!(SyncState::Completed.is_terminal());
        assert!(SyncState::Cancelled.is_terminal());
        assert!(!SyncState::Finalizing.is_terminal());
    }

    #[test]
    fn exit_codes() {
        let mut run = RunContext::new();
        run.advance(SyncState::SyncingEntities);
        run.advance(SyncState::Completed);
        let mut report = SyncReport::new(&run, false);
        assert_eq!(report.exit_code(false), 0);
        assert_eq!(report.exit_code(true), 0);

        report.kinds.insert(
            EntityKind::Component,
            KindStats {
                skipped: 1,
                ..Default::default()
            },
        );
        assert_eq!(report.exit_code(false), 0);
        assert_eq!(report.exit_code(true), 2);

        report.state = SyncState::Failed;
        assert_eq!(report.exit_code(false), 1);
        report.state = SyncState::Cancelled;
        assert_eq!(report.exit_code(false), 130);
    }

    #[test]
    fn generation_ids_are_unique() {
        assert_ne!(RunContext::new().generation, RunContext::new().generation);
    }

    #[test]
    fn report_serializes_error_as_text() {
        let run = RunContext::new();
        let mut report = SyncReport::new(&run, true);
        report.error = Some(SyncError::NoKindsEnabled);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["error"], "no entity kinds are enabled for sync");
        assert_eq!(value["state"], "idle");
    }
}
