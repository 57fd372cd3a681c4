//! Deadlock-free batched statement execution over the postgres wire protocol.
//!
//! Submit many parameterized statement executions as one batch over a single
//! connection and collect one outcome per statement, in order. The engine
//! plans how far requests may be pipelined ahead of their responses so that
//! the client and the server can never end up blocked writing into each
//! other's full buffers, then drives the wire accordingly.
//!
//! # Examples
//!
//! ```no_run
//! use batchwire::{Batch, ColumnSpec, FailurePolicy, ReturnColumn, StatementRequest};
//! use batchwire::stream::BufStream;
//!
//! # async fn app(socket: tokio::net::TcpStream) -> batchwire::Result<()> {
//! // an already connected and authenticated stream
//! let mut conn = BufStream::new(socket);
//!
//! let mut batch = Batch::new();
//! for i in 0..32 {
//!     batch.push(
//!         StatementRequest::new("INSERT INTO demo(id, largetext) VALUES ($1, $2)")
//!             .bind(i)
//!             .bind("deadbeef")
//!             .returning(ColumnSpec::new(vec![ReturnColumn::bounded("id", 8)])),
//!     );
//! }
//!
//! let result = batchwire::execute_batch(&batch, &mut conn)
//!     .policy(FailurePolicy::BestEffort)
//!     .await?;
//!
//! assert!(result.success());
//! assert_eq!(result.len(), 32);
//!
//! for outcome in result.into_outcomes() {
//!     let mut rows = outcome.into_rows().unwrap();
//!     let id = rows.next().unwrap().try_get::<_, i32>("id");
//!     println!("inserted {id:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;

// Protocol
pub mod protocol;

// Encoding
mod value;
pub mod encode;

// Component
pub mod statement;
pub mod batch;
pub mod row;
pub mod outcome;

// Operation
pub mod transport;
pub mod executor;
pub mod plan;
pub mod execute;

// Connection
#[cfg(feature = "tokio")]
pub mod stream;

mod error;

#[cfg(all(test, feature = "tokio"))]
mod testing;


pub use batch::{Batch, ColumnSpec, ResultExpectation, ReturnColumn, SizeHint, StatementRequest, UsageError};
pub use encode::Encode;
pub use row::{Decode, DecodeError, FromRow, Row};
pub use outcome::{BatchFailure, BatchResult, FailurePolicy, ItemOutcome, RowStream};
pub use plan::{ExecutionPlan, PlanConfig};
pub use protocol::ServerError;

pub use transport::{BatchTransport, BatchTransportExt};
pub use executor::Executor;
#[doc(inline)]
pub use execute::execute_batch;
#[cfg(feature = "tokio")]
pub use stream::BufStream;
pub use error::{Error, ErrorKind, Result};
