//! Export dry-run results as JSON.
//!
//! `catalog-sync dry-run --output-json <dir>` writes two files that show
//! exactly what a real sync would upload:
//!
//! - `identities_<timestamp>.json`: users and groups with member emails
//! - `documents_<timestamp>.json`: every mapped document
//!
//! Both carry the datasource and generation id so several runs can be
//! compared side by side.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::models::{Document, IdentityRecord};
use crate::sync::SyncReport;

#[derive(Serialize)]
struct IdentitiesFile<'a> {
    datasource: &'a str,
    generation: &'a str,
    identities: &'a [IdentityRecord],
}

#[derive(Serialize)]
struct DocumentsFile<'a> {
    datasource: &'a str,
    generation: &'a str,
    documents: &'a [Document],
}

/// Paths of the files written by [`write_dry_run_output`].
#[derive(Debug, Clone)]
pub struct ExportedFiles {
    pub identities: PathBuf,
    pub documents: PathBuf,
}

/// Write the identities and documents of a dry run into `dir`.
///
/// The report must have been produced with `collect_all` set, otherwise
/// the files are written with empty lists.
pub fn write_dry_run_output(
    dir: &Path,
    datasource: &str,
    report: &SyncReport,
) -> Result<ExportedFiles> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let stamp = report.started_at.format("%Y%m%d_%H%M%S");
    let files = ExportedFiles {
        identities: dir.join(format!("identities_{}.json", stamp)),
        documents: dir.join(format!("documents_{}.json", stamp)),
    };

    write_json(
        &files.identities,
        &IdentitiesFile {
            datasource,
            generation: &report.generation,
            identities: &report.identity_records,
        },
    )?;
    write_json(
        &files.documents,
        &DocumentsFile {
            datasource,
            generation: &report.generation,
            documents: &report.documents,
        },
    )?;

    eprintln!(
        "Exported {} identities, {} documents to {}",
        report.identity_records.len(),
        report.documents.len(),
        dir.display()
    );
    Ok(files)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}
