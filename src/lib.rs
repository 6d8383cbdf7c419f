//! # filedex
//!
//! A file-indexing daemon: walks a directory tree, deduplicates files by
//! content hash, feeds a search index, and drives per-file enrichment
//! modules through a durable job queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ index root │──▶│ reconciliation│──▶│ by-id/by-path│
//! │  (files)   │   │  load/walk/   │   │  documents   │
//! └────────────┘   │  apply        │   └──────┬───────┘
//!                  └───────┬───────┘          │
//!                          ▼                  ▼
//!                  ┌───────────────┐   ┌──────────────┐
//!                  │ search index  │◀──│  dispatcher  │◀── done
//!                  └───────────────┘   └──────┬───────┘     ▲
//!                                             ▼             │
//!                                      <module>:check ──▶ workers
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`hasher`] | Content hashing with an mtime cache |
//! | [`store`] | Per-hash document persistence |
//! | [`links`] | `by-path` symlink mirror |
//! | [`archive`] | Archive drives and their status markers |
//! | [`scan`] | Filesystem walk |
//! | [`reconcile`] | The reconciliation engine |
//! | [`index_sync`] | Publishing documents to the search index |
//! | [`sqlite_index`] | SQLite FTS5 search index |
//! | [`broker`] | Queue broker trait, in-memory and SQLite brokers |
//! | [`queue`] | Queue keys and wire records |
//! | [`dispatcher`] | Enqueueing and completion merging |
//! | [`worker`] | Worker claim/ack protocol and timeout sweep |
//! | [`group`] | Resource-sharing rotation groups |
//! | [`module`] | Module trait and construction from config |
//! | [`modules`] | Built-in `text`, `scrape` and remote `http` modules |
//! | [`scheduler`] | Interval trigger for syncs |
//! | [`daemon`] | Service wiring |

pub mod archive;
pub mod broker;
pub mod config;
pub mod daemon;
pub mod db;
pub mod dispatcher;
pub mod get;
pub mod group;
pub mod hasher;
pub mod index_sync;
pub mod links;
pub mod logging;
pub mod migrate;
pub mod module;
pub mod modules;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod scan;
pub mod scheduler;
pub mod search;
pub mod sqlite_index;
pub mod stats;
pub mod store;
pub mod worker;
