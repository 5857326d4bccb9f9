//! fpool - forking worker pool with a binary IPC protocol and automatic
//! crash recovery.
//!
//! The pool forks real child processes and talks to each over an
//! anonymous bidirectional channel using a fixed 32-byte header plus raw
//! payload. Dispatch is load-balanced and non-blocking; every scheduled
//! message's completion fires exactly once, with either the child's reply
//! or a header-only reply carrying a negative errno.
//!
//! The wire format is native-representation only: parent and child are
//! the same forked process image, so no byte-order or layout conversion
//! is performed. It is not a cross-machine protocol.
//!
//! # Example
//!
//! ```no_run
//! use fpool::{Controller, Message};
//!
//! let pool = Controller::new(4, |request: &Message| {
//!     let mut reply = Message::copy_header(request);
//!     reply.header.cmd = request.header.cmd + 1;
//!     reply
//! })?;
//!
//! let mut msg = Message::new();
//! msg.header.id = 1;
//! pool.schedule(
//!     msg,
//!     Box::new(|reply| {
//!         println!("status: {}", reply.header.status);
//!     }),
//! );
//! # Ok::<(), fpool::FpoolError>(())
//! ```

pub mod error;
pub mod logging;
pub mod pool;

pub use error::{FpoolError, Result};
pub use pool::{
    Callback, Completion, Controller, ControllerConfig, ControllerStats, HEADER_SIZE, Header,
    IoScheduler, Message, PROTOCOL_VERSION, Readiness, TerminationReason, Worker, WorkerConfig,
    WorkerState, analyze_wait_status,
};
