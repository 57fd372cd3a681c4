//! Batch outcomes.
//!
//! One [`ItemOutcome`] per statement, in submission order, assembled into a
//! [`BatchResult`].
use std::{collections::VecDeque, fmt};

use crate::{batch::ColumnSpec, protocol::ServerError, row::Row};

/// What to do with the rest of a batch after one statement fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop at the first server-reported error; remaining items are not
    /// executed and the call fails with the partial outcomes attached.
    #[default]
    FailFast,
    /// Run every item in its own implicit transaction, record failures
    /// per-item, and keep going.
    BestEffort,
}

/// Outcome of one statement in a batch.
#[derive(Debug)]
pub enum ItemOutcome {
    /// Completed without returning rows.
    Affected(u64),
    /// Completed and handed rows back.
    Returned {
        rows_affected: u64,
        rows: RowStream,
    },
    /// The server rejected this statement.
    Failed(ServerError),
}

impl ItemOutcome {
    /// Rows the statement affected, [`None`] for a failed item.
    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            Self::Affected(n) => Some(*n),
            Self::Returned { rows_affected, .. } => Some(*rows_affected),
            Self::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Take the returned rows out of the outcome.
    pub fn into_rows(self) -> Option<RowStream> {
        match self {
            Self::Returned { rows, .. } => Some(rows),
            _ => None,
        }
    }
}

/// Returned rows of one statement.
///
/// Forward-only and single-pass: rows are handed out once, in server order,
/// and discarded as they go.
pub struct RowStream {
    spec: ColumnSpec,
    rows: VecDeque<Row>,
}

impl RowStream {
    pub(crate) fn new(spec: ColumnSpec, rows: Vec<Row>) -> Self {
        Self { spec, rows: rows.into() }
    }

    /// Next row, front to back.
    #[allow(clippy::should_implement_trait, reason = "Iterator is implemented too")]
    pub fn next(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// The column shape the request declared.
    pub fn column_spec(&self) -> &ColumnSpec {
        &self.spec
    }

    /// Rows not yet consumed.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Iterator for RowStream {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        RowStream::next(self)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.rows.len(), Some(self.rows.len()))
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.spec.len())
            .field("remaining", &self.rows.len())
            .finish()
    }
}

/// Outcomes of a whole batch, in submission order.
#[derive(Debug)]
pub struct BatchResult {
    outcomes: Vec<ItemOutcome>,
    success: bool,
}

impl BatchResult {
    pub(crate) fn new(outcomes: Vec<ItemOutcome>) -> Self {
        let success = !outcomes.iter().any(ItemOutcome::is_failed);
        Self { outcomes, success }
    }

    /// `true` when every item completed.
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcomes(&self) -> &[ItemOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<ItemOutcome> {
        self.outcomes
    }

    /// Rows affected by the item at `index`, [`None`] for failed or
    /// not-executed items.
    pub fn rows_affected(&self, index: usize) -> Option<u64> {
        self.outcomes.get(index).and_then(ItemOutcome::rows_affected)
    }
}

impl IntoIterator for BatchResult {
    type Item = ItemOutcome;
    type IntoIter = std::vec::IntoIter<ItemOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

/// A fail-fast batch stopped at a server-rejected statement.
///
/// Carries the outcomes of the items that completed before the failure.
pub struct BatchFailure {
    /// The statement error that stopped the batch.
    pub error: ServerError,
    /// Outcomes completed before the failure, in submission order.
    pub partial: Vec<ItemOutcome>,
}

impl std::error::Error for BatchFailure { }

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch stopped after {} completed item(s): {}",
            self.partial.len(),
            self.error,
        )
    }
}

impl fmt::Debug for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
