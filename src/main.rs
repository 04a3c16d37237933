//! # catalog-sync CLI
//!
//! The `catalog-sync` binary runs and inspects catalog → index syncs.
//!
//! ## Usage
//!
//! ```bash
//! catalog-sync --config ./config/catalog-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catalog-sync init` | Write a commented sample configuration |
//! | `catalog-sync show-config` | Print the effective configuration, secrets masked |
//! | `catalog-sync test-connection` | Check the catalog and the index |
//! | `catalog-sync show <kind>` | List catalog entities of one kind |
//! | `catalog-sync dry-run` | Fetch and map everything, upload nothing |
//! | `catalog-sync sync` | Run a full sync and finalize the generation |
//!
//! ## Exit codes
//!
//! `0` success, `1` failure, `2` completed with skipped or rejected records
//! under `--strict`, `130` cancelled with Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use catalog_sync::config::{self, Config};
use catalog_sync::error::SyncError;
use catalog_sync::export;
use catalog_sync::models::EntityKind;
use catalog_sync::progress::ProgressMode;
use catalog_sync::retry::RetryPolicy;
use catalog_sync::source::{CatalogSource, HttpCatalogClient, Pager};
use catalog_sync::sync::{self as engine, SyncOptions, SyncOrchestrator};
use catalog_sync::target::{HttpIndexClient, IndexTarget};

/// catalog-sync: synchronize a software catalog into a search index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Run `catalog-sync init` to create one.
#[derive(Parser)]
#[command(
    name = "catalog-sync",
    about = "Synchronize a software catalog (entities, users, groups) into a search index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catalog-sync.toml")]
    config: PathBuf,

    /// Enable debug logging. `RUST_LOG` takes precedence when set.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Progress output on stderr: `off`, `human`, or `json`.
    /// Defaults to `human` when stderr is a terminal.
    #[arg(long, global = true)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Check the catalog and the index with the configured credentials.
    TestConnection,

    /// Fetch and map every enabled kind without uploading anything.
    DryRun {
        /// Write identities and documents as JSON files into this directory.
        #[arg(long)]
        output_json: Option<PathBuf>,

        /// Sample documents to print per kind (defaults to `sync.samples`).
        #[arg(long)]
        samples: Option<usize>,
    },

    /// Upload identities and documents, then finalize the generation.
    Sync {
        /// Same as the `dry-run` command.
        #[arg(long)]
        dry_run: bool,

        /// Exit non-zero when any record is skipped or any batch rejected.
        #[arg(long)]
        strict: bool,
    },

    /// Print the effective configuration with secrets masked.
    ShowConfig,

    /// Write a commented sample configuration to `--config`.
    ///
    /// Refuses to overwrite an existing file.
    Init,

    /// List catalog entities of one kind.
    Show {
        /// Entity kind, singular or plural (`component`, `apis`, `users`, ...).
        kind: EntityKind,

        /// Maximum number of entities to list.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose {
            "catalog_sync=debug"
        } else {
            "catalog_sync=warn"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Commands that don't require config
    let command = match cli.command {
        Commands::Init => return init_config(&cli.config),
        command => command,
    };

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match command {
        Commands::Init => {}
        Commands::ShowConfig => show_config(&cli.config, &cfg),
        Commands::TestConnection => {
            let ok = test_connection(&cfg).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Show { kind, limit } => show_entities(&cfg, kind, limit).await?,
        Commands::DryRun {
            output_json,
            samples,
        } => {
            let code =
                run_sync(&cfg, progress, true, false, samples, output_json.as_deref()).await?;
            std::process::exit(code);
        }
        Commands::Sync { dry_run, strict } => {
            let code = run_sync(&cfg, progress, dry_run, strict, None, None).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "Config file already exists: {} (remove it first to regenerate)",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, config::SAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote sample configuration to {}", path.display());
    println!("Set CATALOG_API_TOKEN and INDEX_API_TOKEN, then run `catalog-sync test-connection`.");
    Ok(())
}

fn mask(token: Option<String>) -> String {
    match token {
        Some(t) if t.chars().count() > 8 => {
            let tail: String = t.chars().skip(t.chars().count() - 4).collect();
            format!("****{}", tail)
        }
        Some(_) => "****".to_string(),
        None => "(not set)".to_string(),
    }
}

fn show_config(path: &Path, cfg: &Config) {
    println!("Configuration: {}", path.display());
    println!();
    println!("[source]");
    println!("  base_url:     {}", cfg.source.base_url);
    println!("  api_token:    {}", mask(cfg.source.token()));
    println!("  page_size:    {}", cfg.source.page_size);
    println!("  verify_ssl:   {}", cfg.source.verify_ssl);
    println!("  timeout_secs: {}", cfg.source.timeout_secs);
    println!();
    println!("[target]");
    println!("  base_url:     {}", cfg.target.base_url);
    println!("  datasource:   {}", cfg.target.datasource);
    println!("  api_token:    {}", mask(cfg.target.token()));
    println!("  verify_ssl:   {}", cfg.target.verify_ssl);
    println!("  timeout_secs: {}", cfg.target.timeout_secs);
    println!();
    println!("[sync]");
    println!("  batch_size:          {}", cfg.sync.batch_size);
    println!("  default_permissions: {}", cfg.sync.default_permissions);
    println!("  concurrency:         {}", cfg.sync.concurrency);
    println!("  max_attempts:        {}", cfg.sync.max_attempts);
    println!("  strict:              {}", cfg.sync.strict);
    println!("  samples:             {}", cfg.sync.samples);
    let kinds: Vec<&str> = cfg.sync.enabled_kinds().iter().map(|k| k.slug()).collect();
    println!(
        "  enabled kinds:       {}",
        if kinds.is_empty() {
            "(none)".to_string()
        } else {
            kinds.join(", ")
        }
    );
}

fn status_line(result: &Result<(), SyncError>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("FAILED: {}", e),
    }
}

async fn test_connection(cfg: &Config) -> Result<bool> {
    let source = HttpCatalogClient::new(&cfg.source, RetryPolicy::new(1))?;
    let target = HttpIndexClient::new(&cfg.target)?;

    let (source_result, target_result) =
        tokio::join!(source.test_connection(), target.test_connection());

    println!("{:<8} {:<48} STATUS", "SERVICE", "URL");
    println!(
        "{:<8} {:<48} {}",
        "catalog",
        cfg.source.base_url,
        status_line(&source_result)
    );
    println!(
        "{:<8} {:<48} {}",
        "index",
        cfg.target.base_url,
        status_line(&target_result)
    );
    Ok(source_result.is_ok() && target_result.is_ok())
}

async fn show_entities(cfg: &Config, kind: EntityKind, limit: usize) -> Result<()> {
    let source = HttpCatalogClient::new(&cfg.source, RetryPolicy::new(cfg.sync.max_attempts))?;
    let cancel = CancellationToken::new();
    let mut pager = Pager::new(&source, kind);
    let mut shown = 0;
    let mut malformed = 0;

    println!("{:<32} {:<12} {:<24} TITLE", "NAME", "NAMESPACE", "OWNER");
    'pages: while let Some(page) = pager.next_page(&cancel).await {
        let page = page.with_context(|| format!("Failed to list {} entities", kind))?;
        malformed += page.malformed.len();
        for entity in page.entities {
            if shown >= limit {
                break 'pages;
            }
            println!(
                "{:<32} {:<12} {:<24} {}",
                entity.name,
                entity.namespace,
                entity.owner_label.as_deref().unwrap_or("-"),
                entity.title.as_deref().unwrap_or("")
            );
            shown += 1;
        }
        if shown >= limit {
            break;
        }
    }

    println!();
    println!("{} {} entities shown", shown, kind.slug());
    if malformed > 0 {
        println!("{} malformed records skipped", malformed);
    }
    Ok(())
}

async fn run_sync(
    cfg: &Config,
    progress: ProgressMode,
    dry_run: bool,
    strict: bool,
    samples: Option<usize>,
    output_json: Option<&Path>,
) -> Result<i32> {
    if !dry_run && cfg.target.token().is_none() {
        bail!(
            "No index API token configured. Set {} or target.api_token.",
            config::INDEX_TOKEN_ENV
        );
    }

    let orchestrator =
        SyncOrchestrator::from_config(cfg)?.with_progress(Arc::from(progress.reporter()));
    let options = SyncOptions {
        dry_run,
        samples: if dry_run {
            samples.unwrap_or(cfg.sync.samples)
        } else {
            0
        },
        collect_all: output_json.is_some(),
    };

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling: finishing in-flight uploads, no new pages will be fetched");
            on_ctrl_c.cancel();
        }
    });

    let report = orchestrator.run(&options, &cancel).await;

    if dry_run {
        engine::print_samples(&report);
        println!();
    }
    engine::print_report(&report);

    if let Some(dir) = output_json {
        export::write_dry_run_output(dir, &cfg.target.datasource, &report)?;
    }

    Ok(report.exit_code(strict || cfg.sync.strict))
}
