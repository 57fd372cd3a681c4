//! Batch data model.
//!
//! A [`Batch`] is an ordered sequence of [`StatementRequest`], executed
//! together over one connection. Order is significant: outcomes come back in
//! submission order.
use std::fmt;

use crate::encode::{Encode, Encoded};

/// One parameterized statement execution inside a batch.
///
/// Immutable once pushed into a [`Batch`].
#[derive(Debug)]
pub struct StatementRequest<'q> {
    sql: &'q str,
    params: Vec<Encoded<'q>>,
    expect: ResultExpectation,
}

impl<'q> StatementRequest<'q> {
    /// Create a request with no bound parameters, expecting no rows back.
    pub fn new(sql: &'q str) -> Self {
        Self { sql, params: Vec::new(), expect: ResultExpectation::None }
    }

    /// Bind the next positional parameter.
    pub fn bind<V: Encode<'q>>(mut self, value: V) -> Self {
        self.params.push(value.encode());
        self
    }

    /// Request the statement's result rows back, a `RETURNING` clause or
    /// generated key columns.
    pub fn returning(mut self, columns: ColumnSpec) -> Self {
        self.expect = ResultExpectation::Rows(columns);
        self
    }

    pub fn sql(&self) -> &'q str {
        self.sql
    }

    pub(crate) fn params(&self) -> &[Encoded<'q>] {
        &self.params
    }

    pub fn expectation(&self) -> &ResultExpectation {
        &self.expect
    }

    /// Total wire size of the bound parameter values in bytes.
    pub(crate) fn param_bytes(&self) -> usize {
        use bytes::Buf;
        self.params.iter().map(|p| p.remaining()).sum()
    }
}

/// Whether a statement execution is expected to hand rows back.
#[derive(Debug, Default)]
pub enum ResultExpectation {
    /// Only a completion tag is expected.
    #[default]
    None,
    /// The caller wants the statement's result rows.
    Rows(ColumnSpec),
}

impl ResultExpectation {
    pub fn expects_rows(&self) -> bool {
        matches!(self, Self::Rows(_))
    }
}

/// The declared shape of rows a statement hands back.
#[derive(Debug, Clone, Default)]
pub struct ColumnSpec {
    columns: Vec<ReturnColumn>,
}

impl ColumnSpec {
    pub fn new(columns: Vec<ReturnColumn>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ReturnColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Worst-case wire size of one returned row, [`None`] when any column is
    /// unbounded.
    pub(crate) fn row_bound(&self) -> Option<usize> {
        self.columns.iter().try_fold(0usize, |acc, col| match col.size {
            // 4-byte value length prefix per column
            SizeHint::Bounded(n) => Some(acc + n as usize + 4),
            SizeHint::Unbounded => None,
        })
    }
}

impl FromIterator<ReturnColumn> for ColumnSpec {
    fn from_iter<T: IntoIterator<Item = ReturnColumn>>(iter: T) -> Self {
        Self { columns: iter.into_iter().collect() }
    }
}

/// One requested result column.
#[derive(Debug, Clone)]
pub struct ReturnColumn {
    name: String,
    size: SizeHint,
}

impl ReturnColumn {
    /// A column whose wire size never exceeds `bytes`, a serial key for one.
    pub fn bounded(name: impl Into<String>, bytes: u32) -> Self {
        Self { name: name.into(), size: SizeHint::Bounded(bytes) }
    }

    /// A column with no useful size bound, `text` for one.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self { name: name.into(), size: SizeHint::Unbounded }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> SizeHint {
        self.size
    }
}

/// Caller declared bound on a returned column's wire size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHint {
    Bounded(u32),
    Unbounded,
}

/// An ordered group of statement executions submitted together.
#[derive(Debug, Default)]
pub struct Batch<'q> {
    items: Vec<StatementRequest<'q>>,
}

impl<'q> Batch<'q> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append a request; it keeps its position in the outcome sequence.
    pub fn push(&mut self, request: StatementRequest<'q>) -> &mut Self {
        self.items.push(request);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[StatementRequest<'q>] {
        &self.items
    }

    /// Caller misuse checks, run before any I/O.
    ///
    /// A batch is rejected when empty, or when two items share a statement
    /// text but bind a different number of parameters: the server prepares
    /// such a text once, so the counts cannot both be right.
    pub(crate) fn validate(&self) -> Result<(), UsageError> {
        if self.items.is_empty() {
            return Err(UsageError::EmptyBatch);
        }

        let mut seen: Vec<(&str, usize)> = Vec::new();
        for (index, item) in self.items.iter().enumerate() {
            match seen.iter().find(|(sql, _)| *sql == item.sql) {
                Some((_, len)) if *len != item.params.len() => {
                    return Err(UsageError::ParamCountMismatch {
                        index,
                        expected: *len,
                        found: item.params.len(),
                    });
                },
                Some(_) => { },
                None => seen.push((item.sql, item.params.len())),
            }
        }

        Ok(())
    }
}

impl<'q> Extend<StatementRequest<'q>> for Batch<'q> {
    fn extend<T: IntoIterator<Item = StatementRequest<'q>>>(&mut self, iter: T) {
        self.items.extend(iter);
    }
}

impl<'q> FromIterator<StatementRequest<'q>> for Batch<'q> {
    fn from_iter<T: IntoIterator<Item = StatementRequest<'q>>>(iter: T) -> Self {
        Self { items: Vec::from_iter(iter) }
    }
}

/// Caller misuse detected before any I/O.
///
/// The connection state is untouched when this is returned.
#[derive(PartialEq, Eq)]
pub enum UsageError {
    /// The batch contains no item.
    EmptyBatch,
    /// Two items share a statement text but bind different parameter counts.
    ParamCountMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
}

impl std::error::Error for UsageError { }

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBatch => write!(f, "batch is empty"),
            Self::ParamCountMismatch { index, expected, found } => write!(
                f,
                "statement {index} binds {found} parameters where an earlier \
                 item with the same text binds {expected}",
            ),
        }
    }
}

impl fmt::Debug for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_is_rejected() {
        assert_eq!(Batch::new().validate(), Err(UsageError::EmptyBatch));
    }

    #[test]
    fn param_count_mismatch_is_rejected() {
        let mut batch = Batch::new();
        batch.push(StatementRequest::new("INSERT INTO prep(a, b) VALUES ($1, $2)").bind(1).bind(2));
        batch.push(StatementRequest::new("INSERT INTO prep(a, b) VALUES ($1, $2)").bind(3));

        assert_eq!(
            batch.validate(),
            Err(UsageError::ParamCountMismatch { index: 1, expected: 2, found: 1 }),
        );
    }

    #[test]
    fn mixed_texts_are_legal() {
        let mut batch = Batch::new();
        batch.push(StatementRequest::new("INSERT INTO prep (a, b) VALUES (1,2)"));
        batch.push(StatementRequest::new("DELETE FROM prep WHERE a = 1"));
        batch.push(StatementRequest::new("CREATE TEMPORARY TABLE waffles(sauce text)"));

        assert!(batch.validate().is_ok());
    }

    #[test]
    fn row_bound_is_none_with_unbounded_column() {
        let bounded = ColumnSpec::new(vec![ReturnColumn::bounded("id", 8)]);
        assert_eq!(bounded.row_bound(), Some(12));

        let unbounded = ColumnSpec::new(vec![
            ReturnColumn::bounded("id", 8),
            ReturnColumn::unbounded("largetext"),
        ]);
        assert_eq!(unbounded.row_bound(), None);
    }
}
