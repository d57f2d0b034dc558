//! Collaborators the connection layer drives but does not implement: the byte transport, the
//! readiness reactor, the timer and the request dispatcher.

use std::fmt;
use std::future::Future;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use strand_proto::InputStream;
use tokio_util::sync::CancellationToken;

use crate::{LocalError, Responder};

/// A set of socket operations (readiness interest or readiness result).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SocketOperation(u8);

impl SocketOperation {
    pub const NONE: SocketOperation = SocketOperation(0);
    pub const READ: SocketOperation = SocketOperation(1);
    pub const WRITE: SocketOperation = SocketOperation(2);
    pub const CONNECT: SocketOperation = SocketOperation(4);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: SocketOperation) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: SocketOperation) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn without(self, other: SocketOperation) -> SocketOperation {
        SocketOperation(self.0 & !other.0)
    }

    #[must_use]
    pub fn intersection(self, other: SocketOperation) -> SocketOperation {
        SocketOperation(self.0 & other.0)
    }
}

impl BitOr for SocketOperation {
    type Output = SocketOperation;

    fn bitor(self, rhs: SocketOperation) -> SocketOperation {
        SocketOperation(self.0 | rhs.0)
    }
}

impl BitOrAssign for SocketOperation {
    fn bitor_assign(&mut self, rhs: SocketOperation) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SocketOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (op, name) in [
            (SocketOperation::READ, "READ"),
            (SocketOperation::WRITE, "WRITE"),
            (SocketOperation::CONNECT, "CONNECT"),
        ] {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Result of a non-blocking read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Ready(usize),
    WouldBlock,
}

pub type ReadyFuture<'a> = Pin<Box<dyn Future<Output = io::Result<SocketOperation>> + Send + 'a>>;

/// Something a reactor can wait on until it becomes readable or writable.
pub trait Readiness: Send + Sync {
    fn ready(&self, interest: SocketOperation) -> ReadyFuture<'_>;
}

/// A non-blocking byte pipe (a socket, a TLS session, a datagram channel).
pub trait Transceiver: Send {
    /// Finish connection establishment. Returns the operation to wait for, or
    /// `SocketOperation::NONE` once the transport is ready.
    fn initialize(&mut self) -> Result<SocketOperation, LocalError>;

    /// Read into `buf`. End of stream is an error. A datagram transport returns one whole
    /// datagram per call, truncated to `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<IoStatus, LocalError>;

    fn write(&mut self, buf: &[u8]) -> Result<IoStatus, LocalError>;

    /// Begin an orderly close. Returns the operation to wait for before the transport can be
    /// closed, or `NONE` to close right away.
    fn closing(&mut self, initiator: bool, cause: &LocalError) -> SocketOperation;

    /// Release the transport. Failures are logged by the implementation.
    fn close(&mut self);

    fn description(&self) -> String;

    fn is_datagram(&self) -> bool {
        false
    }

    /// Readiness source used by reactors that wait on the native handle.
    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        None
    }
}

/// Receives readiness notifications from a [`Reactor`].
pub trait EventHandler: Send + Sync {
    fn message(&self, ready: SocketOperation);

    /// Called once, after [`Reactor::finish`], when the reactor no longer references the
    /// handler.
    fn finished(&self, close_now: bool);

    fn description(&self) -> String;

    fn readiness(&self) -> Option<Arc<dyn Readiness>>;
}

/// Delivers readiness events to handlers.
///
/// Implementations must never call back into a handler from inside `register`, `unregister`
/// or `finish`; callers hold their own locks across these calls.
pub trait Reactor: Send + Sync {
    fn register(&self, handler: Arc<dyn EventHandler>, op: SocketOperation);

    fn unregister(&self, handler: Arc<dyn EventHandler>, op: SocketOperation);

    fn finish(&self, handler: Arc<dyn EventHandler>, close_now: bool);
}

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Cancels a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct TimerToken {
    cancel: CancellationToken,
}

impl TimerToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The underlying token, for timers that `select!` on cancellation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Schedules one-shot tasks.
///
/// `schedule` is called with connection locks held, so the task must never run before
/// `schedule` returns.
pub trait Timer: Send + Sync {
    /// Run `task` once after `delay` unless the returned token is cancelled first.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerToken;
}

/// Turns one decoded request into an application call.
///
/// `dispatch` consumes exactly one request from `request` before returning and answers
/// through `responder`, either immediately or later from another thread.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: &mut InputStream, responder: Responder);
}

impl<F> Dispatcher for F
where
    F: Fn(&mut InputStream, Responder) + Send + Sync,
{
    fn dispatch(&self, request: &mut InputStream, responder: Responder) {
        self(request, responder)
    }
}
