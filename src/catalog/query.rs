use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use std::collections::VecDeque;

use super::{format_timestamp, Catalog};
use crate::error::StorageError;
use crate::model::{ImageRecord, Label};

/// Filters for reading the catalog. `since` is inclusive, `until` exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub label: Option<Label>,
    pub provider: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn label(mut self, label: Label) -> Self {
        self.label = Some(label);
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// SQL conditions (joined with AND) and their bound values.
    pub(crate) fn conditions(&self) -> (Vec<&'static str>, Vec<Value>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(label) = self.label {
            conditions.push("label = ?");
            values.push(Value::Text(label.as_str().to_string()));
        }
        if let Some(ref provider) = self.provider {
            conditions.push("provider = ?");
            values.push(Value::Text(provider.clone()));
        }
        if let Some(since) = self.since {
            conditions.push("ingested_at >= ?");
            values.push(Value::Text(format_timestamp(&since)));
        }
        if let Some(until) = self.until {
            conditions.push("ingested_at < ?");
            values.push(Value::Text(format_timestamp(&until)));
        }

        (conditions, values)
    }
}

/// Lazily pages through matching records in `record_id` order.
///
/// Each batch is a short keyset query, so the catalog lock is never held
/// while the caller processes records.
pub struct RecordIter<'a> {
    catalog: &'a Catalog,
    filter: RecordFilter,
    batch_size: usize,
    after: Option<String>,
    buffer: VecDeque<ImageRecord>,
    done: bool,
}

impl<'a> RecordIter<'a> {
    pub(crate) fn new(catalog: &'a Catalog, filter: RecordFilter, batch_size: usize) -> Self {
        Self {
            catalog,
            filter,
            batch_size: batch_size.max(1),
            after: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn fill(&mut self) -> Result<(), StorageError> {
        let batch = self
            .catalog
            .fetch_batch(&self.filter, self.after.as_deref(), self.batch_size)?;
        if batch.len() < self.batch_size {
            self.done = true;
        }
        if let Some(last) = batch.last() {
            self.after = Some(last.record_id.clone());
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<ImageRecord, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
