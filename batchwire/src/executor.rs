//! The [`Executor`] trait.
use std::future::Ready;

use crate::{Result, transport::BatchTransport};

/// A type that can yield a [`BatchTransport`].
///
/// The transport is handed over by value for the duration of one batch, which
/// is what serializes batches on a connection: a second `execute_batch` on
/// the same connection cannot start until the `&mut` borrow is released.
pub trait Executor: Unpin {
    /// The yielded transport.
    type Transport: BatchTransport;

    /// Future that resolve to [`Executor::Transport`].
    type Future: Future<Output = Result<Self::Transport>> + Unpin;

    /// Acquire the transport.
    fn connection(self) -> Self::Future;
}

impl<T: BatchTransport> Executor for &mut T {
    type Transport = Self;

    type Future = Ready<Result<Self>>;

    fn connection(self) -> Self::Future {
        std::future::ready(Ok(self))
    }
}
