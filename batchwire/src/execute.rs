//! Batch execution.
//!
//! [`BatchStream`] is the pipeline executor: a poll state machine that drives
//! writes and reads against one transport according to the plan, yielding one
//! outcome per statement in submission order.
//!
//! The deadlock-avoidance invariant lives in the `Write` phase: whenever a
//! flush would block because the send buffer is full, the executor reads and
//! processes any response that is already available instead of parking on the
//! write alone.
use futures_core::Stream;
use std::{
    collections::{HashMap, VecDeque},
    hash::{DefaultHasher, Hash, Hasher},
    mem,
    pin::Pin,
    task::{
        Context,
        Poll::{self, *},
        ready,
    },
};

use crate::{
    Error, Result,
    batch::{Batch, ColumnSpec, ResultExpectation},
    common::{debug, verbose},
    encode::Encoded,
    error::ErrorKind,
    executor::Executor,
    outcome::{BatchFailure, BatchResult, FailurePolicy, ItemOutcome, RowStream},
    plan::{ExecutionPlan, PlanConfig, plan_batch},
    protocol::{BackendMessage, PgFormat, ProtocolError, ServerError, backend, frontend},
    row::Row,
    statement::StatementName,
    transport::BatchTransport,
};

/// Entrypoint of the batch API.
///
/// `exe` is anything that yields a [`BatchTransport`], a
/// `&mut BufStream<IO>` for one.
pub fn execute_batch<'q, Exe>(batch: &'q Batch<'q>, exe: Exe) -> BatchQuery<'q, Exe> {
    BatchQuery {
        batch,
        exe,
        policy: FailurePolicy::default(),
        config: PlanConfig::default(),
    }
}

/// The batch API.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct BatchQuery<'q, Exe> {
    batch: &'q Batch<'q>,
    exe: Exe,
    policy: FailurePolicy,
    config: PlanConfig,
}

impl<'q, Exe> BatchQuery<'q, Exe> {
    /// Select what happens to the rest of the batch after one statement
    /// fails.
    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the planner's wire assumptions.
    pub fn config(mut self, config: PlanConfig) -> Self {
        self.config = config;
        self
    }

    /// Yield outcomes one by one as they complete, in submission order.
    ///
    /// The returned `Stream` must be polled until completion, otherwise the
    /// connection is left mid-batch. Under [`FailurePolicy::FailFast`] the
    /// terminating error carries no partial outcomes: they were already
    /// yielded.
    pub fn stream(self) -> BatchStream<'q, Exe::Future, Exe::Transport>
    where
        Exe: Executor,
    {
        BatchStream::new(self.batch, self.exe.connection(), self.policy, self.config)
    }

    /// Execute the batch and collect every outcome.
    pub fn run(self) -> BatchExecute<'q, Exe::Future, Exe::Transport>
    where
        Exe: Executor,
    {
        BatchExecute { stream: self.stream(), outcomes: Vec::new() }
    }
}

impl<'q, Exe> IntoFuture for BatchQuery<'q, Exe>
where
    Exe: Executor,
{
    type Output = Result<BatchResult>;

    type IntoFuture = BatchExecute<'q, Exe::Future, Exe::Transport>;

    fn into_future(self) -> Self::IntoFuture {
        self.run()
    }
}

/// Bookkeeping recorded when an item is encoded, consumed when its responses
/// arrive.
#[derive(Debug)]
struct ItemMeta {
    sqlid: u64,
    stmt: StatementName,
    /// A `Parse` was sent for this item, expect `ParseComplete`.
    parsed: bool,
    /// A `Describe` was sent, expect `RowDescription` or `NoData`.
    described: bool,
    /// A `Sync` follows this item, expect `ReadyForQuery` after the terminal.
    synced: bool,
}

#[derive(Debug)]
enum Phase<ExeFut> {
    Connect { f: ExeFut },
    Plan,
    Write,
    Drain,
    Complete,
}

/// Receive cursor: what the next backend message must be for the item at
/// `recv_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    /// First response of the item, `ParseComplete` or `BindComplete`.
    Head,
    /// `BindComplete` after a consumed `ParseComplete`.
    Bind,
    /// `RowDescription` or `NoData`.
    Describe,
    /// `DataRow` until a terminal message.
    Data,
    /// `ReadyForQuery` for this item's or this window's `Sync`.
    Ready,
    /// Fail-fast abort: everything until `ReadyForQuery` is skipped.
    SkipReady,
}

/// The pipeline executor, yielding one [`ItemOutcome`] per statement.
#[must_use = "streams do nothing unless polled"]
pub struct BatchStream<'q, ExeFut, IO> {
    batch: &'q Batch<'q>,
    policy: FailurePolicy,
    config: PlanConfig,
    io: Option<IO>,
    phase: Phase<ExeFut>,

    // send cursor
    window: usize,
    window_end: usize,
    sync_per_item: bool,
    window_synced: bool,
    next_send: usize,
    stopped: bool,

    // receive cursor
    recv_at: usize,
    recv: RecvState,
    syncs_sent: usize,
    readys_got: usize,

    metas: Vec<ItemMeta>,
    /// Statements parsed earlier in this batch, reusable before their
    /// `ParseComplete` has even arrived: the server parses in order.
    parsed: HashMap<u64, StatementName>,

    // current item rows
    desc: Option<Row>,
    rows: Vec<Row>,

    failure: Option<ServerError>,
    out: VecDeque<Result<ItemOutcome>>,
}

impl<'q, ExeFut, IO> BatchStream<'q, ExeFut, IO> {
    fn new(
        batch: &'q Batch<'q>,
        exe: ExeFut,
        policy: FailurePolicy,
        config: PlanConfig,
    ) -> Self {
        Self {
            batch,
            policy,
            config,
            io: None,
            phase: Phase::Connect { f: exe },
            window: 0,
            window_end: 0,
            sync_per_item: false,
            window_synced: false,
            next_send: 0,
            stopped: false,
            recv_at: 0,
            recv: RecvState::Head,
            syncs_sent: 0,
            readys_got: 0,
            metas: Vec::new(),
            parsed: HashMap::new(),
            desc: None,
            rows: Vec::new(),
            failure: None,
            out: VecDeque::new(),
        }
    }
}

impl<ExeFut, IO> BatchStream<'_, ExeFut, IO>
where
    IO: BatchTransport + Unpin,
{
    /// Encode one request into the transport's send buffer.
    fn encode_next(&mut self) {
        use crate::ext::UsizeExt;

        let index = self.next_send;
        let item = &self.batch.items()[index];
        let io = self.io.as_mut().unwrap();

        let sql = item.sql().trim();
        let sqlid = {
            let mut buf = DefaultHasher::new();
            sql.hash(&mut buf);
            buf.finish()
        };

        let (stmt, parsed) = match io.get_stmt(sqlid) {
            Some(stmt) => (stmt, false),
            None => match self.parsed.get(&sqlid) {
                Some(stmt) => (stmt.clone(), false),
                None => {
                    let stmt = StatementName::next();
                    io.send(frontend::Parse {
                        prepare_name: stmt.as_str(),
                        sql,
                        oids_len: item.params().len().to_u16(),
                        oids: item.params().iter().map(Encoded::oid),
                    });
                    self.parsed.insert(sqlid, stmt.clone());
                    (stmt, true)
                },
            },
        };

        let params = item.params();
        io.send(frontend::Bind {
            portal_name: "",
            stmt_name: stmt.as_str(),
            param_formats_len: 1,
            param_formats: [PgFormat::Binary],
            params_len: params.len().to_u16(),
            params_size_hint: params
                .iter()
                .fold(0, |acc, n| acc + 4 + n.value().len().to_u32()),
            params: params.iter().cloned(),
            result_formats_len: 1,
            result_formats: [PgFormat::Binary],
        });

        let described = item.expectation().expects_rows();
        if described {
            io.send(frontend::Describe { kind: b'P', name: "" });
        }
        io.send(frontend::Execute { portal_name: "", max_row: 0 });

        let synced = self.sync_per_item || index + 1 == self.window_end;
        if synced {
            io.send(frontend::Sync);
            self.syncs_sent += 1;
            if index + 1 == self.window_end {
                self.window_synced = true;
            }
        }

        verbose!("item {index} encoded, stmt {stmt}, parsed {parsed}, synced {synced}");

        self.metas.push(ItemMeta { sqlid, stmt, parsed, described, synced });
        self.next_send += 1;
    }

    /// Column shape the item at `index` declared.
    fn column_spec(&self, index: usize) -> ColumnSpec {
        match self.batch.items()[index].expectation() {
            ResultExpectation::Rows(spec) => spec.clone(),
            ResultExpectation::None => ColumnSpec::default(),
        }
    }

    /// Move the receive cursor past the completed item at `recv_at`.
    fn finish_item(&mut self, outcome: ItemOutcome) {
        let synced = self.metas[self.recv_at].synced;
        self.desc = None;
        self.recv_at += 1;
        self.recv = match synced {
            true => RecvState::Ready,
            false => RecvState::Head,
        };
        self.out.push_back(Ok(outcome));
    }

    /// Handle a server rejected statement per the failure policy.
    fn on_server_error(&mut self, err: backend::ErrorResponse) {
        let mut server = ServerError::from(err);
        server.index = Some(self.recv_at.min(self.batch.len() - 1));
        debug!("statement rejected: {server}");

        match self.policy {
            FailurePolicy::BestEffort => {
                // the server discards the rest of this item's messages until
                // its own Sync, so the next inbound message is ReadyForQuery
                self.desc = None;
                self.rows.clear();
                self.recv_at += 1;
                self.recv = RecvState::Ready;
                self.out.push_back(Ok(ItemOutcome::Failed(server)));
            },
            FailurePolicy::FailFast => self.abort(server),
        }
    }

    /// Stop the batch at a server error: no more items are sent, everything
    /// inbound is skipped until the server reports ready.
    fn abort(&mut self, server: ServerError) {
        let io = self.io.as_mut().unwrap();
        if !self.window_synced && !self.sync_per_item {
            // the server discards messages until Sync; without one it would
            // never answer ReadyForQuery
            io.send(frontend::Sync);
            self.syncs_sent += 1;
            self.window_synced = true;
        }
        io.ready_request();
        self.stopped = true;
        self.failure = Some(server);
        self.recv = RecvState::SkipReady;
    }

    /// Feed one backend message through the receive cursor.
    fn on_message(&mut self, msg: BackendMessage) -> Result<()> {
        use BackendMessage::*;

        match self.recv {
            RecvState::Head | RecvState::Bind => {
                let Some(meta) = self.metas.get(self.recv_at) else {
                    return Err(msg.unexpected("no outstanding item").into());
                };
                match msg {
                    ParseComplete(_) if meta.parsed && self.recv == RecvState::Head => {
                        let (sqlid, stmt) = (meta.sqlid, meta.stmt.clone());
                        self.io.as_mut().unwrap().add_stmt(sqlid, stmt);
                        self.recv = RecvState::Bind;
                    },
                    BindComplete(_) if !(meta.parsed && self.recv == RecvState::Head) => {
                        self.recv = match meta.described {
                            true => RecvState::Describe,
                            false => RecvState::Data,
                        };
                    },
                    ErrorResponse(err) => self.on_server_error(err),
                    f => return Err(f.unexpected("binding item").into()),
                }
            },
            RecvState::Describe => match msg {
                RowDescription(rd) => {
                    self.desc = Some(Row::description(rd.field_len, rd.body));
                    self.recv = RecvState::Data;
                },
                NoData(_) => {
                    self.desc = None;
                    self.recv = RecvState::Data;
                },
                ErrorResponse(err) => self.on_server_error(err),
                f => return Err(f.unexpected("describing item").into()),
            },
            RecvState::Data => match msg {
                DataRow(dr) => match &self.desc {
                    Some(desc) => {
                        if dr.column_len != desc.len() {
                            return Err(ProtocolError::malformed("DataRow").into());
                        }
                        self.rows.push(desc.with_values(dr.body));
                    },
                    // rows the caller never asked for are drained and dropped
                    None => { },
                },
                CommandComplete(cmd) => {
                    let rows_affected = cmd.rows_affected();
                    let outcome = match self.metas[self.recv_at].described {
                        true => ItemOutcome::Returned {
                            rows_affected,
                            rows: RowStream::new(
                                self.column_spec(self.recv_at),
                                mem::take(&mut self.rows),
                            ),
                        },
                        false => ItemOutcome::Affected(rows_affected),
                    };
                    self.finish_item(outcome);
                },
                EmptyQueryResponse(_) => {
                    let outcome = match self.metas[self.recv_at].described {
                        true => ItemOutcome::Returned {
                            rows_affected: 0,
                            rows: RowStream::new(self.column_spec(self.recv_at), Vec::new()),
                        },
                        false => ItemOutcome::Affected(0),
                    };
                    self.rows.clear();
                    self.finish_item(outcome);
                },
                PortalSuspended(_) => {
                    // not reachable with an unlimited Execute, but it is a
                    // legal terminal: account the rows that did arrive
                    let rows_affected = self.rows.len() as u64;
                    let outcome = ItemOutcome::Returned {
                        rows_affected,
                        rows: RowStream::new(
                            self.column_spec(self.recv_at),
                            mem::take(&mut self.rows),
                        ),
                    };
                    self.finish_item(outcome);
                },
                ErrorResponse(err) => self.on_server_error(err),
                f => return Err(f.unexpected("fetching item result").into()),
            },
            RecvState::Ready => match msg {
                ReadyForQuery(_) => {
                    self.readys_got += 1;
                    self.recv = RecvState::Head;
                },
                // an error between a terminal and ReadyForQuery belongs to no
                // pending item (implicit commit failure): stop the batch
                ErrorResponse(err) => {
                    let mut server = ServerError::from(err);
                    server.index = Some(self.recv_at.min(self.batch.len() - 1));
                    self.abort(server);
                },
                f => return Err(f.unexpected("awaiting ready").into()),
            },
            RecvState::SkipReady => match msg {
                // the transport skips everything else after `ready_request`
                ReadyForQuery(_) => {
                    let error = self.failure.take().expect("skip without a failure");
                    self.out.push_back(Err(BatchFailure { error, partial: Vec::new() }.into()));
                    self.phase = Phase::Complete;
                },
                _ => { },
            },
        }

        Ok(())
    }

    /// Everything sent in the current window has been answered and synced.
    fn window_drained(&self) -> bool {
        self.recv_at >= self.next_send && self.readys_got == self.syncs_sent
    }
}

impl<'q, ExeFut, IO> Stream for BatchStream<'q, ExeFut, IO>
where
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: BatchTransport + Unpin,
{
    type Item = Result<ItemOutcome>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            if let Some(out) = me.out.pop_front() {
                return Ready(Some(out));
            }

            match &mut me.phase {
                Phase::Connect { f } => {
                    let io = ready!(Pin::new(f).poll(cx)?);
                    me.io = Some(io);
                    me.phase = Phase::Plan;
                },
                Phase::Plan => {
                    let plan = match plan_batch(me.batch, &me.config) {
                        Ok(plan) => plan,
                        Err(usage) => {
                            me.phase = Phase::Complete;
                            return Ready(Some(Err(ErrorKind::Usage(usage).into())));
                        },
                    };
                    me.window = match plan {
                        ExecutionPlan::FullPipeline => me.batch.len(),
                        ExecutionPlan::Lockstep => 1,
                        ExecutionPlan::ChunkedPipeline(k) => k,
                    };
                    me.sync_per_item =
                        matches!(me.policy, FailurePolicy::BestEffort) || me.window == 1;
                    me.window_end = me.window.min(me.batch.len());
                    debug!(
                        "executing batch of {} item(s) with {plan:?}, {:?}",
                        me.batch.len(),
                        me.policy,
                    );
                    me.phase = Phase::Write;
                },
                Phase::Write => {
                    match me.io.as_mut().unwrap().poll_flush(cx) {
                        Ready(Ok(())) => {
                            // send buffer fully accepted
                            if !me.stopped && me.next_send < me.window_end {
                                me.encode_next();
                                continue;
                            }
                            me.phase = Phase::Drain;
                        },
                        Ready(Err(e)) => {
                            me.phase = Phase::Complete;
                            return Ready(Some(Err(e.into())));
                        },
                        Pending => {
                            // the send buffer is full: drain whatever the
                            // server already answered instead of blocking,
                            // the flow-control invariant that breaks the
                            // write/write deadlock
                            match me.io.as_mut().unwrap().poll_recv::<BackendMessage>(cx) {
                                Ready(Ok(msg)) => {
                                    if let Err(err) = me.on_message(msg) {
                                        me.phase = Phase::Complete;
                                        return Ready(Some(Err(err)));
                                    }
                                },
                                Ready(Err(e)) => {
                                    me.phase = Phase::Complete;
                                    return Ready(Some(Err(e)));
                                },
                                Pending => return Pending,
                            }
                        },
                    }
                },
                Phase::Drain => {
                    if me.window_drained() {
                        if me.stopped || me.next_send >= me.batch.len() {
                            me.phase = Phase::Complete;
                            continue;
                        }
                        // window barrier: open the next window
                        me.window_end = (me.next_send + me.window).min(me.batch.len());
                        me.window_synced = false;
                        me.phase = Phase::Write;
                        continue;
                    }
                    match me.io.as_mut().unwrap().poll_recv::<BackendMessage>(cx) {
                        Ready(Ok(msg)) => {
                            if let Err(err) = me.on_message(msg) {
                                me.phase = Phase::Complete;
                                return Ready(Some(Err(err)));
                            }
                        },
                        Ready(Err(e)) => {
                            me.phase = Phase::Complete;
                            return Ready(Some(Err(e)));
                        },
                        Pending => return Pending,
                    }
                },
                Phase::Complete => return Ready(None),
            }
        }
    }
}

impl<ExeFut, IO> std::fmt::Debug for BatchStream<'_, ExeFut, IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStream")
            .field("items", &self.batch.len())
            .field("sent", &self.next_send)
            .field("drained", &self.recv_at)
            .finish()
    }
}

/// Future resolving to the collected [`BatchResult`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct BatchExecute<'q, ExeFut, IO> {
    stream: BatchStream<'q, ExeFut, IO>,
    outcomes: Vec<ItemOutcome>,
}

impl<ExeFut, IO> Future for BatchExecute<'_, ExeFut, IO>
where
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: BatchTransport + Unpin,
{
    type Output = Result<BatchResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(r) = ready!(Pin::new(&mut me.stream).poll_next(cx)) {
            match r {
                Ok(outcome) => me.outcomes.push(outcome),
                Err(err) => {
                    // a fail-fast abort carries the outcomes completed so far
                    let err = match err.into_kind() {
                        ErrorKind::Batch(mut failure) => {
                            failure.partial = mem::take(&mut me.outcomes);
                            Error::from(ErrorKind::Batch(failure))
                        },
                        kind => Error::from(kind),
                    };
                    return Ready(Err(err));
                },
            }
        }

        Ready(Ok(BatchResult::new(mem::take(&mut me.outcomes))))
    }
}
