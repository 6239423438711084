//! Pipeline data model: transient candidates, persisted records, run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::error::Rejection;

/// A provider search result, normalized at the adapter boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateImage {
    pub provider: String,
    pub provider_native_id: String,
    pub source_url: String,
    pub query_tags: Vec<String>,
    pub search_query: String,
    /// Dimensions as reported by the provider, if any.
    pub declared_width: Option<u32>,
    pub declared_height: Option<u32>,
    pub discovered_at: DateTime<Utc>,
}

/// Raw bytes downloaded for a candidate.
#[derive(Debug, Clone)]
pub struct ImageContent {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub byte_len: usize,
}

impl ImageContent {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        let byte_len = bytes.len();
        Self {
            bytes,
            content_type: content_type.into(),
            byte_len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Electric,
    Acoustic,
    #[default]
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Electric => "electric",
            Label::Acoustic => "acoustic",
            Label::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "electric" => Ok(Label::Electric),
            "acoustic" => Ok(Label::Acoustic),
            "unknown" => Ok(Label::Unknown),
            other => Err(format!("unknown label: {}", other)),
        }
    }
}

/// Non-fatal observations recorded alongside an accepted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Decoded dimensions differ from what the provider declared.
    DeclaredDimensionMismatch,
    Grayscale,
    /// Within 10% of the configured dimension floor.
    NearDimensionFloor,
}

/// A cataloged image. The durable unit consumed by training and labeling tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
    pub record_id: String,
    pub provider: String,
    pub provider_native_id: String,
    pub content_hash: String,
    pub perceptual_hash: String,
    pub storage_path: String,
    pub width: u32,
    pub height: u32,
    pub label: Label,
    pub quality_flags: Vec<QualityFlag>,
    pub ingested_at: DateTime<Utc>,
    pub source_url: Option<String>,
    pub content_type: Option<String>,
    pub byte_size: Option<u64>,
    pub search_query: Option<String>,
    pub query_tags: Vec<String>,
}

/// Time-ordered, globally unique identifier (UUID v7).
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}

/// Outcome counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub rejected_duplicate: u64,
    pub rejected_quality: u64,
    pub rejected_error: u64,
    pub accepted: u64,
}

/// Live counters shared across pipeline threads, frozen into [`RunCounts`] at the end.
#[derive(Debug, Default)]
pub struct RunCounters {
    fetched: AtomicU64,
    rejected_duplicate: AtomicU64,
    rejected_quality: AtomicU64,
    rejected_error: AtomicU64,
    accepted: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetched(&self) {
        self.fetched.fetch_add(1, Ordering::SeqCst);
    }

    pub fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a page or record that was given up on after retries.
    pub fn error(&self) {
        self.rejected_error.fetch_add(1, Ordering::SeqCst);
    }

    pub fn rejected(&self, rejection: &Rejection) {
        let counter = match rejection {
            Rejection::Quality(_) => &self.rejected_quality,
            Rejection::Duplicate(_) => &self.rejected_duplicate,
            Rejection::Error(_) => &self.rejected_error,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RunCounts {
        RunCounts {
            fetched: self.fetched.load(Ordering::SeqCst),
            rejected_duplicate: self.rejected_duplicate.load(Ordering::SeqCst),
            rejected_quality: self.rejected_quality.load(Ordering::SeqCst),
            rejected_error: self.rejected_error.load(Ordering::SeqCst),
            accepted: self.accepted.load(Ordering::SeqCst),
        }
    }
}

/// Immutable report of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub cancelled: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        write!(
            f,
            "run {}: fetched {}, accepted {}, duplicate {}, quality {}, error {}{}",
            self.run_id,
            c.fetched,
            c.accepted,
            c.rejected_duplicate,
            c.rejected_quality,
            c.rejected_error,
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}
