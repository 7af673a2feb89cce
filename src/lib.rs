//! lilo - Log Ingest, Log Output
//!
//! Tails a paginated, eventually-consistent cloud log API into a local
//! SQLite file. Safe to stop and restart at any point: each pass resumes
//! from the stored high-watermark minus an overlap window, and duplicates
//! are absorbed by the store's unique `insertId` index.
//!
//! Flow of one pass:
//!
//! ```text
//! checkpoint::CheckpointManager -> QueryWindow
//!     -> paginator::Paginator (gcp::client::LoggingClient + auth::TokenCache)
//!     -> batches of gcp::LogEntry
//!     -> store::LogStore (one transaction per batch)
//! ```
//!
//! `ingest::Downloader` wires the pieces together for the `download` command.

pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod gcp;
pub mod ingest;
pub mod paginator;
pub mod store;

/// Crate version, stored with every run record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
