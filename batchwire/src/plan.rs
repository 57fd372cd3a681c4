//! Batch planning.
//!
//! Picks the pipelining strategy for one batch: as few round trips as the
//! flow-control safety argument allows, lockstep when nothing else is safe.
use crate::batch::{Batch, ResultExpectation, UsageError};

/// How a batch is interleaved over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPlan {
    /// Write every request back-to-back, then drain every response.
    ///
    /// Safe only when each response is a small bounded completion tag: their
    /// aggregate stays under the receive buffer until draining starts.
    FullPipeline,
    /// Write one request, fully drain its response, then the next.
    ///
    /// At most one response is ever outstanding, so a flow-control deadlock
    /// is structurally impossible regardless of payload size.
    Lockstep,
    /// Pipeline inside fixed-size windows, fully drain between windows.
    ChunkedPipeline(usize),
}

/// Conservative wire assumptions driving the plan.
///
/// Socket buffer sizes are not observable, so the planner works from
/// configurable constants instead of introspecting the transport.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    buffer_budget: usize,
    reply_size_hint: usize,
    pipeline_ceiling: Option<usize>,
}

impl PlanConfig {
    /// Assumed size of the smaller of the two sides' socket buffers.
    ///
    /// Defaults to 64k, the historical server send buffer.
    pub fn buffer_budget(mut self, bytes: usize) -> Self {
        self.buffer_budget = bytes.max(1);
        self
    }

    /// Assumed wire size of a completion-only reply.
    pub fn reply_size_hint(mut self, bytes: usize) -> Self {
        self.reply_size_hint = bytes.max(1);
        self
    }

    /// Maximum number of requests written without an intervening drain.
    ///
    /// Defaults to `buffer_budget / reply_size_hint`.
    pub fn pipeline_ceiling(mut self, items: usize) -> Self {
        self.pipeline_ceiling = Some(items.max(1));
        self
    }

    pub(crate) fn ceiling(&self) -> usize {
        self.pipeline_ceiling
            .unwrap_or(self.buffer_budget / self.reply_size_hint)
            .max(1)
    }

    pub(crate) fn budget(&self) -> usize {
        self.buffer_budget
    }

    pub(crate) fn reply_hint(&self) -> usize {
        self.reply_size_hint
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            buffer_budget: 64 * 1024,
            reply_size_hint: 256,
            pipeline_ceiling: None,
        }
    }
}

/// Choose an [`ExecutionPlan`] for `batch`.
///
/// Planning is a pure function of the batch shape and config: the same batch
/// always receives the same plan.
///
/// Rules, in order:
/// 1. No item wants rows back: `FullPipeline`, degrading to
///    `ChunkedPipeline` above the pipeline ceiling.
/// 2. Any item wants rows of unbounded size back: `Lockstep`. Large
///    parameter payloads going out and large row payloads coming back can be
///    in flight at once, which is exactly the two-sided buffer overflow that
///    deadlocks.
/// 3. Items want rows back but every requested column is bounded: the
///    inbound side stays bounded, so pipeline within windows sized to the
///    buffer budget.
pub fn plan_batch(batch: &Batch<'_>, config: &PlanConfig) -> Result<ExecutionPlan, UsageError> {
    batch.validate()?;

    let mut max_param = 0usize;
    let mut max_reply = config.reply_hint();
    let mut any_rows = false;

    for item in batch.items() {
        max_param = max_param.max(item.param_bytes());
        if let ResultExpectation::Rows(spec) = item.expectation() {
            any_rows = true;
            match spec.row_bound() {
                None => return Ok(ExecutionPlan::Lockstep),
                Some(bound) => max_reply = max_reply.max(config.reply_hint() + bound),
            }
        }
    }

    let ceiling = config.ceiling();

    if !any_rows {
        return Ok(match batch.len() <= ceiling {
            true => ExecutionPlan::FullPipeline,
            false => ExecutionPlan::ChunkedPipeline(ceiling),
        });
    }

    match config.budget() / (max_param + max_reply) {
        0 => Ok(ExecutionPlan::Lockstep),
        k => Ok(ExecutionPlan::ChunkedPipeline(k.min(ceiling))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ColumnSpec, ReturnColumn, StatementRequest};

    const INSERT: &str = "INSERT INTO deadlock_demo2(id, largetext) VALUES ($1, $2)";

    fn batch_of<'q>(n: usize, make: impl Fn(usize) -> StatementRequest<'q>) -> Batch<'q> {
        (0..n).map(make).collect()
    }

    fn small_keys() -> ColumnSpec {
        ColumnSpec::new(vec![ReturnColumn::bounded("id", 8)])
    }

    fn large_columns() -> ColumnSpec {
        ColumnSpec::new(vec![
            ReturnColumn::bounded("id", 8),
            ReturnColumn::unbounded("largetext"),
        ])
    }

    #[test]
    fn no_rows_requested_pipelines_fully() {
        let batch = batch_of(32, |i| {
            StatementRequest::new(INSERT).bind(i as i32).bind("deadbeef")
        });
        let plan = plan_batch(&batch, &PlanConfig::default()).unwrap();
        assert_eq!(plan, ExecutionPlan::FullPipeline);
    }

    #[test]
    fn no_rows_above_ceiling_chunks() {
        let batch = batch_of(2000, |i| StatementRequest::new(INSERT).bind(i as i32).bind("x"));
        let config = PlanConfig::default().pipeline_ceiling(256);
        let plan = plan_batch(&batch, &config).unwrap();
        assert_eq!(plan, ExecutionPlan::ChunkedPipeline(256));
    }

    #[test]
    fn unbounded_returning_forces_lockstep() {
        let batch = batch_of(32, |i| {
            StatementRequest::new(INSERT)
                .bind(i as i32)
                .bind("deadbeef")
                .returning(large_columns())
        });
        let plan = plan_batch(&batch, &PlanConfig::default()).unwrap();
        assert_eq!(plan, ExecutionPlan::Lockstep);
    }

    #[test]
    fn bounded_returning_chunks_even_with_large_params() {
        // the padding dwarfs the window formula, but a bounded reply keeps
        // the inbound side safe: no lockstep required
        let padding = "deadbeef".repeat(512);
        let batch: Batch = (0..32)
            .map(|i| {
                StatementRequest::new(INSERT)
                    .bind(i as i32)
                    .bind(padding.as_str())
                    .returning(small_keys())
            })
            .collect();
        let plan = plan_batch(&batch, &PlanConfig::default()).unwrap();
        assert!(matches!(plan, ExecutionPlan::ChunkedPipeline(k) if k >= 1));
        assert_ne!(plan, ExecutionPlan::Lockstep);
    }

    #[test]
    fn bounded_returning_with_overwhelming_params_locksteps() {
        let padding = "deadbeef".repeat(16 * 1024);
        let batch: Batch = (0..4)
            .map(|i| {
                StatementRequest::new(INSERT)
                    .bind(i as i32)
                    .bind(padding.as_str())
                    .returning(small_keys())
            })
            .collect();
        // params alone exceed the whole budget
        let plan = plan_batch(&batch, &PlanConfig::default()).unwrap();
        assert_eq!(plan, ExecutionPlan::Lockstep);
    }

    #[test]
    fn mixed_expectation_is_planned_conservatively() {
        let mut batch = Batch::new();
        batch.push(StatementRequest::new(INSERT).bind(1).bind("x"));
        batch.push(StatementRequest::new(INSERT).bind(2).bind("y").returning(large_columns()));
        let plan = plan_batch(&batch, &PlanConfig::default()).unwrap();
        assert_eq!(plan, ExecutionPlan::Lockstep);
    }

    #[test]
    fn planning_is_idempotent() {
        let batch = batch_of(100, |i| {
            StatementRequest::new(INSERT).bind(i as i32).bind("blather").returning(small_keys())
        });
        let config = PlanConfig::default();
        let first = plan_batch(&batch, &config).unwrap();
        for _ in 0..10 {
            assert_eq!(plan_batch(&batch, &config).unwrap(), first);
        }
    }

    #[test]
    fn empty_batch_is_rejected_before_planning() {
        let err = plan_batch(&Batch::new(), &PlanConfig::default()).unwrap_err();
        assert_eq!(err, UsageError::EmptyBatch);
    }
}
