//! The usage ledger: the ordered record of every counted action.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One recorded action. Created once per successful admission+record
/// pair and never mutated.
///
/// There is no record representing global usage; global counts are
/// derived by ignoring `scope` when counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// The end-user the action is attributed to.
    pub identity: String,
    /// The logical command the action belongs to.
    pub scope: String,
    /// When the action occurred.
    pub occurred_at: DateTime<Utc>,
}

/// In-memory ordered collection of usage records.
///
/// Safe for concurrent append and read-scan from simultaneously
/// dispatched commands; a single lock suffices at the expected write
/// rate of one append per completed external call.
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: RwLock<Vec<UsageRecord>>,
}

impl UsageLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger from previously persisted records.
    pub fn from_records(records: Vec<UsageRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Append a record.
    pub fn append(&self, record: UsageRecord) {
        self.records.write().push(record);
    }

    /// Count records for an identity within a scope since `since`.
    pub fn count_scoped(&self, identity: &str, scope: &str, since: DateTime<Utc>) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.identity == identity && r.scope == scope && r.occurred_at >= since)
            .count()
    }

    /// Count records for an identity across all scopes since `since`.
    pub fn count_identity(&self, identity: &str, since: DateTime<Utc>) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.identity == identity && r.occurred_at >= since)
            .count()
    }

    /// Drop every record older than `cutoff`, returning how many were
    /// removed.
    pub fn retain_newer_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.occurred_at >= cutoff);
        before - records.len()
    }

    /// Clone the full ledger contents for persistence.
    pub fn snapshot(&self) -> Vec<UsageRecord> {
        self.records.read().clone()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
