//! The [`BatchTransport`] trait.
use std::{
    io,
    task::{Context, Poll},
};

use crate::{
    Result,
    protocol::{BackendProtocol, FrontendProtocol},
    statement::StatementName,
};

/// A buffered duplex stream which can send and receive postgres messages.
///
/// The engine owns the transport exclusively for the duration of one batch:
/// both buffer sides are finite and only their effects, a blocking write or a
/// blocking read, are observable through the two poll methods.
pub trait BatchTransport: Unpin {
    /// Poll to flush buffered messages into the underlying io.
    ///
    /// `Poll::Pending` here means the send buffer is full and the peer has
    /// not drained it yet, which is exactly the condition the executor
    /// answers by reading.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Implementor should handle `NoticeResponse` and should not return it:
    /// unsolicited notices of any size must be consumed to keep the receive
    /// buffer draining.
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Request implementor to ignore all backend messages until
    /// `ReadyForQuery`, which is then returned.
    fn ready_request(&mut self);

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: BatchTransport::poll_flush
    /// [2]: BatchTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Check for already prepared statement.
    fn get_stmt(&mut self, sql: u64) -> Option<StatementName>;

    /// Add new prepared statement.
    fn add_stmt(&mut self, sql: u64, id: StatementName);
}

impl<P> BatchTransport for &mut P where P: BatchTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn get_stmt(&mut self, sql: u64) -> Option<StatementName> {
        P::get_stmt(self, sql)
    }

    fn add_stmt(&mut self, sql: u64, id: StatementName) {
        P::add_stmt(self, sql, id);
    }
}

/// An extension trait to provide `Future` API for [`BatchTransport`].
pub trait BatchTransportExt: BatchTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }
}

impl<T> BatchTransportExt for T where T: BatchTransport { }
