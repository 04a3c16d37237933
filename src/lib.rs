//! # catalog-sync
//!
//! Synchronizes a software catalog (Backstage-style: components, APIs,
//! systems, domains, resources, users, groups) into a search index.
//!
//! Catalog records are mapped into uniform documents with access-control
//! metadata derived from ownership, uploaded in batches under a fresh
//! generation id, and the generation is finally marked complete so the
//! index drops anything that was not re-uploaded.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────┐   ┌──────────┐   ┌──────────┐
//! │   Catalog   │──▶│  Identity  │──▶│  Mapper  │──▶│ Uploader │──▶ Index
//! │ users/groups│   │ directory  │   │ + perms  │   │ batches  │
//! │  entities   │──────────────────▶│          │   │          │
//! └─────────────┘   └────────────┘   └──────────┘   └──────────┘
//!                   └──────────── SyncOrchestrator ───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! catalog-sync init                    # write config/catalog-sync.toml
//! catalog-sync test-connection         # check catalog and index
//! catalog-sync dry-run --output-json out/
//! catalog-sync sync
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Sync error taxonomy |
//! | [`source`] | Catalog client and pagination |
//! | [`identity`] | User/group directory |
//! | [`permissions`] | Visibility resolution |
//! | [`mapper`] | Entity → document mapping |
//! | [`target`] | Index client |
//! | [`uploader`] | Batched uploads with retry |
//! | [`sync`] | Run orchestration |
//! | [`retry`] | Backoff policy |
//! | [`progress`] | Progress reporting on stderr |
//! | [`export`] | Dry-run JSON output |

pub mod config;
pub mod error;
pub mod export;
pub mod identity;
pub mod mapper;
pub mod models;
pub mod permissions;
pub mod progress;
pub mod retry;
pub mod source;
pub mod sync;
pub mod target;
pub mod uploader;
