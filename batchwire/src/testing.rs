//! An in-process scripted backend for executor tests.
//!
//! Speaks just enough of the backend half of the protocol to answer the
//! engine, over a bounded [`tokio::io::duplex`] pipe so that full buffers
//! block exactly like full socket buffers do. Responses are written inline
//! while requests are being read, which reproduces the flow-control shape of
//! a real server.
use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::protocol::Oid;

/// Per-statement behavior, matched by exact statement text.
pub(crate) enum Behavior {
    /// Answer `CommandComplete` with this tag.
    Complete(&'static str),
    /// Echo the leading bound parameters back as one data row, then complete.
    EchoRow {
        columns: Vec<(&'static str, Oid)>,
        tag: &'static str,
    },
    /// Reject the statement.
    Fail {
        code: &'static str,
        message: &'static str,
    },
    /// Emit a notice of `bytes` payload before completing, a noisy trigger.
    Noise {
        bytes: usize,
        tag: &'static str,
    },
}

#[derive(Default)]
pub(crate) struct Script {
    behaviors: Vec<(&'static str, Behavior)>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, sql: &'static str, behavior: Behavior) -> Self {
        self.behaviors.push((sql, behavior));
        self
    }

    fn behavior(&self, sql: &str) -> &Behavior {
        self.behaviors
            .iter()
            .find(|(s, _)| *s == sql)
            .map(|(_, b)| b)
            .unwrap_or_else(|| panic!("no scripted behavior for {sql:?}"))
    }
}

/// What the backend observed, for asserting pipelining discipline.
#[derive(Debug, Default)]
pub(crate) struct ServerReport {
    /// Highest number of `Execute` requests seen before their `Sync` was
    /// answered: 1 means strict lockstep.
    pub max_pipelined: usize,
    /// `Parse` messages received.
    pub parses: usize,
    /// `Sync` messages received.
    pub syncs: usize,
}

fn read_cstr(buf: &mut &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).expect("missing nul");
    let s = String::from_utf8(buf[..end].to_vec()).expect("non utf8 string");
    *buf = &buf[end + 1..];
    s
}

async fn write_msg(io: &mut DuplexStream, msgtype: u8, body: &[u8]) {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(msgtype);
    buf.put_u32(body.len() as u32 + 4);
    buf.put(body);
    io.write_all(&buf).await.expect("backend write failed");
}

fn row_description(columns: &[(&str, Oid)]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(columns.len() as u16);
    for (name, oid) in columns {
        body.put(name.as_bytes());
        body.put_u8(0);
        body.put_u32(0); // table oid
        body.put_u16(0); // attribute
        body.put_u32(*oid);
        body.put_i16(-1); // type size
        body.put_i32(-1); // type modifier
        body.put_u16(1); // binary
    }
    body.to_vec()
}

fn data_row(values: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(values.len() as u16);
    for value in values {
        match value {
            Some(v) => {
                body.put_i32(v.len() as i32);
                body.put(&v[..]);
            },
            None => body.put_i32(-1),
        }
    }
    body.to_vec()
}

fn fields(pairs: &[(u8, &str)]) -> Vec<u8> {
    let mut body = BytesMut::new();
    for (field, value) in pairs {
        body.put_u8(*field);
        body.put(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    body.to_vec()
}

/// Drive the backend half of the pipe until the client hangs up.
pub(crate) async fn serve(mut io: DuplexStream, script: Script) -> ServerReport {
    let mut report = ServerReport::default();

    // stmt name -> statement text
    let mut prepared: HashMap<String, String> = HashMap::new();
    // unnamed portal: statement text + bound parameter values
    let mut bound: Option<(String, Vec<Option<Vec<u8>>>)> = None;
    // discarding until Sync after an ErrorResponse
    let mut failed = false;

    let mut executes = 0usize;
    let mut acked = 0usize;

    loop {
        let mut header = [0u8; 5];
        match io.read_exact(&mut header).await {
            Ok(_) => { },
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => panic!("backend read failed: {e}"),
        }
        let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        let mut body = vec![0u8; len - 4];
        io.read_exact(&mut body).await.expect("backend read failed");
        let mut buf = &body[..];

        match header[0] {
            // Parse
            b'P' => {
                report.parses += 1;
                if failed {
                    continue;
                }
                let name = read_cstr(&mut buf);
                let sql = read_cstr(&mut buf);
                prepared.insert(name, sql);
                write_msg(&mut io, b'1', &[]).await;
            },
            // Bind
            b'B' => {
                if failed {
                    continue;
                }
                let _portal = read_cstr(&mut buf);
                let stmt = read_cstr(&mut buf);
                let nfmt = buf.get_u16();
                for _ in 0..nfmt {
                    buf.get_u16();
                }
                let nparams = buf.get_u16();
                let mut params = Vec::with_capacity(nparams as usize);
                for _ in 0..nparams {
                    let vlen = buf.get_i32();
                    match vlen {
                        -1 => params.push(None),
                        vlen => {
                            params.push(Some(buf[..vlen as usize].to_vec()));
                            buf.advance(vlen as usize);
                        },
                    }
                }
                let sql = prepared.get(&stmt).expect("bind of unknown statement").clone();
                bound = Some((sql, params));
                write_msg(&mut io, b'2', &[]).await;
            },
            // Describe
            b'D' => {
                if failed {
                    continue;
                }
                let (sql, _) = bound.as_ref().expect("describe without bind");
                match script.behavior(sql) {
                    Behavior::EchoRow { columns, .. } => {
                        write_msg(&mut io, b'T', &row_description(columns)).await;
                    },
                    _ => write_msg(&mut io, b'n', &[]).await,
                }
            },
            // Execute
            b'E' => {
                if failed {
                    continue;
                }
                executes += 1;
                report.max_pipelined = report.max_pipelined.max(executes - acked);

                let (sql, params) = bound.as_ref().expect("execute without bind");
                match script.behavior(sql) {
                    Behavior::Complete(tag) => {
                        write_msg(&mut io, b'C', &fields_tag(tag)).await;
                    },
                    Behavior::EchoRow { columns, tag } => {
                        let n = columns.len().min(params.len());
                        write_msg(&mut io, b'D', &data_row(&params[..n])).await;
                        write_msg(&mut io, b'C', &fields_tag(tag)).await;
                    },
                    Behavior::Fail { code, message } => {
                        let body = fields(&[(b'S', "ERROR"), (b'C', *code), (b'M', *message)]);
                        write_msg(&mut io, b'E', &body).await;
                        failed = true;
                    },
                    Behavior::Noise { bytes, tag } => {
                        let blather = "abcdefgh".repeat(bytes / 8 + 1);
                        let body = fields(&[(b'S', "WARNING"), (b'M', &blather[..*bytes])]);
                        write_msg(&mut io, b'N', &body).await;
                        write_msg(&mut io, b'C', &fields_tag(tag)).await;
                    },
                }
            },
            // Sync
            b'S' => {
                report.syncs += 1;
                failed = false;
                acked = executes;
                write_msg(&mut io, b'Z', &[b'I']).await;
            },
            other => panic!("backend got unexpected message type {other:?}"),
        }
    }

    report
}

fn fields_tag(tag: &str) -> Vec<u8> {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    body
}
