//! Guitar image ingestion and cataloging.
//!
//! Searches third-party image APIs for guitar photos, downloads and
//! quality-checks the results, drops exact and near duplicates, and keeps the
//! survivors in a SQLite catalog backed by a content-addressed blob store.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod http;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod quality;
pub mod rate_limit;
pub mod retry;
pub mod sources;
pub mod storage;

#[cfg(test)]
mod testing;
