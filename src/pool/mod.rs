//! Forking worker pool with a binary IPC protocol and crash recovery.
//!
//! A fixed-size set of forked child processes, each driven over a private
//! `socketpair(2)` channel by a dedicated parent-side IO thread, behind a
//! single load-balanced dispatch entry point. A supervisor thread reaps
//! dead children and restarts their workers in place.
//!
//! # Architecture
//!
//! ```text
//!    caller ── schedule() ──► Controller
//!                                 │ argmin(queue_len)
//!               ┌─────────────────┼─────────────────┐
//!               │                 │                 │
//!         ┌─────▼─────┐     ┌─────▼─────┐     ┌─────▼─────┐
//!         │ Worker 0  │     │ Worker 1  │     │ Worker N  │
//!         │ IO thread │     │ IO thread │     │ IO thread │
//!         └─────┬─────┘     └─────┬─────┘     └─────┬─────┘
//!           socketpair        socketpair        socketpair
//!         ┌─────▼─────┐     ┌─────▼─────┐     ┌─────▼─────┐
//!         │  child 0  │     │  child 1  │     │  child N  │
//!         │ (process) │     │ (process) │     │ (process) │
//!         └───────────┘     └───────────┘     └───────────┘
//! ```
//!
//! Process isolation is the unit of failure containment: a child crash
//! cannot corrupt the parent, and the supervisor replaces the child
//! transparently. The only caller-visible effect of a crash is a
//! negative-status reply for the one message that was in flight.

mod controller;
mod message;
mod scheduler;
mod signals;
mod worker;

pub use controller::{Controller, ControllerConfig, ControllerStats};
pub use message::{HEADER_SIZE, Header, Message, PROTOCOL_VERSION};
pub use scheduler::{IoScheduler, Readiness};
pub use signals::{TerminationReason, analyze_wait_status};
pub use worker::{Callback, Completion, Worker, WorkerConfig, WorkerState};
