//! Chat Harness: a local-first archive and retrieval engine for a team chat
//! workspace.
//!
//! The pipeline pulls a rate-limited chat workspace into a local SQLite
//! database with a full-text index, keeps it current with live capture, and
//! answers queries without touching the network:
//!
//! - `api` — upstream protocol client and error classification
//! - `limiter` — shared request pacing across all workers
//! - `scheduler` — bounded-concurrency execution with fault isolation
//! - `store` — idempotent persistence and the full-text index
//! - `importer` — resumable bulk history backfill
//! - `listener` / `poller` / `capture` — push and pull live capture
//! - `query` — search, ask, recent, thread, context
//! - `server` — HTTP surface over the query layer

pub mod api;
pub mod capture;
pub mod config;
pub mod db;
pub mod importer;
pub mod limiter;
pub mod listener;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod poller;
pub mod query;
pub mod scheduler;
pub mod server;
pub mod stop;
pub mod store;
