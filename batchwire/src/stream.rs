//! Buffered transport over a tokio io stream.
use std::{
    io,
    num::NonZeroUsize,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BufMut, BytesMut};
use lru::LruCache;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    Result,
    common::debug,
    protocol::{BackendProtocol, FrontendProtocol, ProtocolError, ServerNotice, backend, frontend},
    statement::StatementName,
    transport::BatchTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

const STMT_CACHE_CAPACITY: usize = 64;

/// Buffered [`BatchTransport`] over any tokio io stream.
///
/// The stream must already be connected and authenticated: startup belongs to
/// whatever established the connection.
#[derive(Debug)]
pub struct BufStream<IO> {
    io: IO,
    read_buf: BytesMut,
    write_buf: BytesMut,
    stmts: LruCache<u64, StatementName>,
    skip_until_ready: bool,
}

impl<IO> BufStream<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            stmts: LruCache::new(NonZeroUsize::new(STMT_CACHE_CAPACITY).unwrap()),
            skip_until_ready: false,
        }
    }

    /// Consume self into the underlying io.
    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl<IO> BatchTransport for BufStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        loop {
            // decode one frame when the header and full body are buffered
            if let Some(mut header) = self.read_buf.get(..5) {
                let msgtype = header.get_u8();
                let len = header.get_i32();

                if len < 4 {
                    return Poll::Ready(Err(ProtocolError::malformed("frame length").into()));
                }
                let len = len as usize;

                if self.read_buf.len() - 1/*msgtype*/ >= len {
                    self.read_buf.advance(5);
                    let body = self.read_buf.split_to(len - 4).freeze();

                    if msgtype == backend::NoticeResponse::MSGTYPE {
                        let _notice = ServerNotice::from(backend::NoticeResponse { body });
                        debug!("server notice, {}: {}", _notice.severity, _notice.message);
                        continue;
                    }

                    if self.skip_until_ready {
                        if msgtype != backend::ReadyForQuery::MSGTYPE {
                            continue;
                        }
                        self.skip_until_ready = false;
                    }

                    return Poll::Ready(Ok(B::decode(msgtype, body)?));
                }

                self.read_buf.reserve(1 + len);
            } else {
                self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            }

            // need more data
            let n = {
                let dst = self.read_buf.chunk_mut();
                let dst = unsafe { dst.as_uninit_slice_mut() };
                let mut buf = ReadBuf::uninit(dst);
                let ptr = buf.filled().as_ptr();
                ready!(Pin::new(&mut self.io).poll_read(cx, &mut buf)?);

                // Ensure the pointer does not change from under us
                assert_eq!(ptr, buf.filled().as_ptr());
                buf.filled().len()
            };

            if n == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }

            // Safety: This is guaranteed to be the number of initialized (and read)
            // bytes due to the invariants provided by `ReadBuf::filled`.
            unsafe {
                self.read_buf.advance_mut(n);
            }
        }
    }

    fn ready_request(&mut self) {
        self.skip_until_ready = true;
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn get_stmt(&mut self, sql: u64) -> Option<StatementName> {
        self.stmts.get(&sql).cloned()
    }

    fn add_stmt(&mut self, sql: u64, id: StatementName) {
        self.stmts.put(sql, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        protocol::{BackendMessage, backend},
        transport::BatchTransportExt,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn frame(msgtype: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![msgtype];
        buf.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[tokio::test]
    async fn send_then_flush_frames_messages() {
        let (client, mut server) = duplex(1024);
        let mut stream = BufStream::new(client);

        stream.send(frontend::Sync);
        stream.flush().await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [b'S', 0, 0, 0, 4]);
    }

    #[tokio::test]
    async fn recv_decodes_across_partial_reads() {
        let (client, mut server) = duplex(64);
        let mut stream = BufStream::new(client);

        let bytes = frame(b'C', b"INSERT 0 1\0");
        server.write_all(&bytes[..3]).await.unwrap();

        let (msg, _) = tokio::join!(stream.recv::<backend::CommandComplete>(), async {
            tokio::task::yield_now().await;
            server.write_all(&bytes[3..]).await.unwrap();
        });

        assert_eq!(msg.unwrap().rows_affected(), 1);
    }

    #[tokio::test]
    async fn notices_are_swallowed() {
        let (client, mut server) = duplex(256);
        let mut stream = BufStream::new(client);

        server.write_all(&frame(b'N', b"SWARNING\0Mbig noise\0\0")).await.unwrap();
        server.write_all(&frame(b'Z', &[b'I'])).await.unwrap();

        let msg: BackendMessage = stream.recv().await.unwrap();
        assert!(matches!(msg, BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn ready_request_skips_to_ready() {
        let (client, mut server) = duplex(256);
        let mut stream = BufStream::new(client);

        server.write_all(&frame(b'1', &[])).await.unwrap();
        server.write_all(&frame(b'2', &[])).await.unwrap();
        server.write_all(&frame(b'C', b"INSERT 0 1\0")).await.unwrap();
        server.write_all(&frame(b'Z', &[b'I'])).await.unwrap();

        stream.ready_request();
        let msg: BackendMessage = stream.recv().await.unwrap();
        assert!(matches!(msg, BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn eof_is_an_io_error() {
        let (client, server) = duplex(64);
        let mut stream = BufStream::new(client);
        drop(server);

        let err = stream.recv::<BackendMessage>().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }
}
