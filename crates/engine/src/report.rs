//! Per-entry outcomes of one executed plan, for exit status and operator
//! visibility. The report reflects the true external state reached; applied
//! entries are never rolled back or re-labelled by later failures.

use rekon_core::ResourceId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Skipped { reason: String },
    Failed { reason: String, attempts: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryReport {
    pub id: ResourceId,
    pub verb: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub entries: Vec<EntryReport>,
    pub started_ts: i64,
    pub took_ms: u64,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Applied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    /// False whenever any entry ended Failed; callers map this to a
    /// non-zero exit status.
    pub fn succeeded(&self) -> bool {
        self.failed() == 0
    }

    pub fn outcome_of(&self, id: &ResourceId) -> Option<&Outcome> {
        self.entries.iter().find(|e| &e.id == id).map(|e| &e.outcome)
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}
