//! Violation report ingestion and aggregation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Longest string kept from any report field, in characters.
pub const MAX_FIELD_LEN: usize = 2048;

/// How many blocked URIs the summary ranks.
pub const TOP_BLOCKED_URIS: usize = 10;

/// One normalized browser violation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    /// When the report was received.
    pub timestamp: DateTime<Utc>,
    /// Directive that was violated.
    pub violated_directive: String,
    /// Resource that was blocked.
    pub blocked_uri: String,
    /// Page the violation happened on.
    pub document_uri: String,
    /// Script or stylesheet responsible, if reported.
    pub source_file: String,
    /// Line in `source_file`.
    pub line_number: Option<u64>,
    /// Column in `source_file`.
    pub column_number: Option<u64>,
    /// Reporting browser.
    pub user_agent: String,
}

impl ViolationRecord {
    /// Normalize a report body. Returns `None` unless it has a `csp-report`
    /// object.
    #[must_use]
    pub fn from_report(body: &Value, user_agent: Option<&str>) -> Option<Self> {
        let report = body.get("csp-report")?.as_object()?;
        let violated_directive = text(report, "violated-directive")
            .or_else(|| text(report, "effective-directive"))
            .unwrap_or_else(|| "unknown".to_string());

        Some(Self {
            timestamp: Utc::now(),
            violated_directive,
            blocked_uri: text(report, "blocked-uri").unwrap_or_default(),
            document_uri: text(report, "document-uri").unwrap_or_default(),
            source_file: text(report, "source-file").unwrap_or_default(),
            line_number: number(report, "line-number"),
            column_number: number(report, "column-number"),
            user_agent: user_agent.map(truncate).unwrap_or_default(),
        })
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(MAX_FIELD_LEN).collect()
}

fn text(report: &Map<String, Value>, key: &str) -> Option<String> {
    report
        .get(key)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(truncate)
}

fn number(report: &Map<String, Value>, key: &str) -> Option<u64> {
    match report.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Count of reports for one blocked URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedUriCount {
    /// The blocked resource.
    pub uri: String,
    /// How many buffered reports name it.
    pub count: usize,
}

/// Aggregate view over the buffered reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationSummary {
    /// Reports currently buffered.
    pub total: usize,
    /// Reports per violated directive.
    pub by_directive: BTreeMap<String, usize>,
    /// Most frequently blocked URIs, most frequent first.
    pub top_blocked_uris: Vec<BlockedUriCount>,
    /// Latest reports, newest first.
    pub recent: Vec<ViolationRecord>,
}

/// Bounded, thread-safe ring buffer of violation reports.
///
/// When full, each append evicts the oldest record under the same lock.
#[derive(Debug)]
pub struct ViolationLog {
    capacity: usize,
    records: Mutex<VecDeque<ViolationRecord>>,
}

impl ViolationLog {
    /// Empty log holding at most `capacity` records (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Append a record, evicting the oldest when full.
    pub fn push(&self, record: ViolationRecord) {
        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Drop every record and return how many there were.
    pub fn clear(&self) -> usize {
        let mut records = self.records.lock();
        let removed = records.len();
        records.clear();
        removed
    }

    /// Aggregate the buffer; `recent` caps the number of raw records returned.
    #[must_use]
    pub fn summarize(&self, recent: usize) -> ViolationSummary {
        let records = self.records.lock();

        let mut by_directive = BTreeMap::new();
        let mut by_uri: HashMap<&str, usize> = HashMap::new();
        for record in records.iter() {
            *by_directive
                .entry(record.violated_directive.clone())
                .or_insert(0) += 1;
            if !record.blocked_uri.is_empty() {
                *by_uri.entry(record.blocked_uri.as_str()).or_insert(0) += 1;
            }
        }

        let mut top_blocked_uris: Vec<BlockedUriCount> = by_uri
            .into_iter()
            .map(|(uri, count)| BlockedUriCount {
                uri: uri.to_string(),
                count,
            })
            .collect();
        top_blocked_uris.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.uri.cmp(&b.uri)));
        top_blocked_uris.truncate(TOP_BLOCKED_URIS);

        ViolationSummary {
            total: records.len(),
            by_directive,
            top_blocked_uris,
            recent: records.iter().rev().take(recent).cloned().collect(),
        }
    }
}
