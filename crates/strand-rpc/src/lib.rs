//! Connection layer for the strand RPC protocol.
//!
//! A [`Connection`] runs the validation handshake, multiplexes two-way, one-way and batched
//! requests over one transport, correlates replies through an outstanding-request table,
//! dispatches incoming requests, and shuts down gracefully or forcefully. An
//! [`ActivityMonitor`] adds heartbeats and idle close on top.
//!
//! The transport, the readiness reactor and the timer are traits. [`tcp`] provides tokio
//! implementations; the `test-support` feature exposes deterministic in-memory ones.

mod acm;
mod batch;
mod connection;
mod error;
mod invocation;
mod message;
mod outstanding;
pub mod tcp;
mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use acm::{idle_close, should_heartbeat, AcmConfig, ActivityMonitor, ActivitySnapshot, IdleClose};
pub use batch::BatchQueue;
pub use connection::{
    CloseCallback, CloseMode, Connection, ConnectionContext, ConnectionOptions, HeartbeatCallback,
    Responder, Role, StartCallback, State,
};
pub use error::{InvocationError, LocalError};
pub use invocation::{
    Invocation, InvocationOptions, PendingReply, ReplyFuture, ReplyHandler, SendStatus,
};
pub use outstanding::OutstandingTable;
pub use transport::{
    Dispatcher, EventHandler, IoStatus, Reactor, Readiness, ReadyFuture, SocketOperation, Timer,
    TimerTask, TimerToken, Transceiver,
};
