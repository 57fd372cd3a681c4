//! Protocol level errors.
use std::fmt;

use super::backend::{BackendMessage, ErrorResponse, NoticeResponse};
use crate::{common::ByteStr, ext::BytesExt};

/// An error when translating buffer from postgres.
///
/// Always fatal: a malformed or out-of-sequence frame leaves the connection
/// in an unknown state and the batch is aborted.
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    Malformed {
        message: &'static str,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => {
                        write!(
                            f,
                            "Expected message `{}` found `{found}`",
                            BackendMessage::message_name(m),
                        )?
                    },
                    None => write!(f, "Unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::Malformed { message } => {
                write!(f, "Malformed `{message}` message")
            },
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn malformed(message: &'static str) -> ProtocolError {
        Self::Malformed { message }
    }
}

/// A decoded server reported error.
///
/// One statement in a batch was rejected. Depending on the failure policy this
/// surfaces inside the batch result or as the top level error.
#[derive(Clone)]
pub struct ServerError {
    severity: ByteStr,
    code: ByteStr,
    message: ByteStr,
    /// Index of the offending item in the submitted batch.
    pub(crate) index: Option<usize>,
}

impl ServerError {
    /// Error severity, `ERROR`, `FATAL`, or `PANIC`.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// The SQLSTATE code of the error.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Index of the batch item the server rejected.
    pub fn statement_index(&self) -> Option<usize> {
        self.index
    }
}

/// Decode the shared field layout of `ErrorResponse` and `NoticeResponse`.
///
/// Unrecognized field types are silently ignored, as the protocol requires.
fn decode_fields(mut body: bytes::Bytes) -> (ByteStr, ByteStr, ByteStr) {
    use bytes::Buf;

    let mut severity = ByteStr::default();
    let mut code = ByteStr::default();
    let mut message = ByteStr::default();

    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let Some(value) = body.get_nul_bytestr() else {
            break;
        };
        match field {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => { },
        }
    }

    (severity, code, message)
}

impl From<ErrorResponse> for ServerError {
    fn from(err: ErrorResponse) -> Self {
        let (severity, code, message) = decode_fields(err.body);
        Self { severity, code, message, index: None }
    }
}

impl std::error::Error for ServerError { }

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if !self.code.is_empty() {
            write!(f, " ({})", self.code)?;
        }
        if let Some(index) = self.index {
            write!(f, ", statement {index}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A decoded server notice.
pub(crate) struct ServerNotice {
    pub severity: ByteStr,
    pub message: ByteStr,
}

impl From<NoticeResponse> for ServerNotice {
    fn from(notice: NoticeResponse) -> Self {
        let (severity, _, message) = decode_fields(notice.body);
        Self { severity, message }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};

    use super::*;

    fn error_body(severity: &str, code: &str, message: &str) -> Bytes {
        let mut buf = BytesMut::new();
        for (field, value) in [(b'S', severity), (b'C', code), (b'M', message)] {
            buf.put_u8(field);
            buf.put(value.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        buf.freeze()
    }

    #[test]
    fn decode_error_fields() {
        let err = ServerError::from(ErrorResponse {
            body: error_body("ERROR", "23505", "duplicate key"),
        });
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "23505");
        assert_eq!(err.message(), "duplicate key");
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'X');
        buf.put(&b"whatever\0"[..]);
        buf.put_u8(b'M');
        buf.put(&b"boom\0"[..]);
        buf.put_u8(0);

        let err = ServerError::from(ErrorResponse { body: buf.freeze() });
        assert_eq!(err.message(), "boom");
        assert_eq!(err.code(), "");
    }
}
