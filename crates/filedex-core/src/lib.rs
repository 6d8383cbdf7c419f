//! # filedex core
//!
//! Storage-independent logic for filedex: the per-hash document model,
//! schema migrations, the module pipeline ordering, the text chunker, and
//! the search index abstraction with an in-memory implementation.
//!
//! This crate does no filesystem or database I/O; the daemon crate wires
//! these pieces to disk, SQLite and the job queue.

pub mod chunk;
pub mod index;
pub mod migrations;
pub mod models;
pub mod pipeline;
