use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{InvocationError, LocalError};

/// Completion handle for a request.
///
/// Exactly one of `completed` or `failed` is called per request. Callbacks run without any
/// connection lock held and may call back into the connection.
pub trait ReplyHandler: Send + Sync {
    /// The request was fully written to the transport.
    fn sent(&self) {}

    /// The reply payload, starting with its status byte.
    fn completed(&self, reply: Bytes);

    fn failed(&self, error: InvocationError);
}

/// Whether a request went out immediately or was queued behind earlier messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Queued,
}

/// A request accepted by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    /// 0 for one-way requests.
    pub request_id: i32,
    pub status: SendStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationOptions {
    pub compress: bool,
    /// The operation may safely run more than once.
    pub idempotent: bool,
}

type ReplyResult = Result<Bytes, InvocationError>;

/// A [`ReplyHandler`] that forwards the outcome to a [`ReplyFuture`].
#[derive(Debug)]
pub struct PendingReply {
    sent: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<ReplyResult>>>,
}

impl PendingReply {
    pub fn new() -> (Arc<Self>, ReplyFuture) {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(Self {
            sent: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });
        (pending, ReplyFuture { rx })
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    fn resolve(&self, result: ReplyResult) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl ReplyHandler for PendingReply {
    fn sent(&self) {
        self.sent.store(true, Ordering::Release);
    }

    fn completed(&self, reply: Bytes) {
        self.resolve(Ok(reply));
    }

    fn failed(&self, error: InvocationError) {
        self.resolve(Err(error));
    }
}

/// The eventual reply to a two-way request.
#[derive(Debug)]
pub struct ReplyFuture {
    rx: oneshot::Receiver<ReplyResult>,
}

impl ReplyFuture {
    /// Block the current thread until the reply arrives. Must not be called from an async
    /// context.
    pub fn wait(self) -> ReplyResult {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(abandoned()))
    }
}

impl Future for ReplyFuture {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(abandoned())))
    }
}

fn abandoned() -> InvocationError {
    InvocationError::Fatal(LocalError::InvocationCanceled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_reply_resolves_once() {
        let (pending, future) = PendingReply::new();
        pending.sent();
        assert!(pending.is_sent());
        pending.completed(Bytes::from_static(b"\0ok"));
        pending.failed(InvocationError::Fatal(LocalError::ClosedByPeer));

        let reply = future.await.expect("reply");
        assert_eq!(&reply[..], b"\0ok");
    }

    #[tokio::test]
    async fn dropped_handler_surfaces_as_canceled() {
        let (pending, future) = PendingReply::new();
        drop(pending);
        assert_eq!(
            future.await,
            Err(InvocationError::Fatal(LocalError::InvocationCanceled))
        );
    }

    #[test]
    fn blocking_wait_sees_failures() {
        let (pending, future) = PendingReply::new();
        let worker = std::thread::spawn(move || {
            pending.failed(InvocationError::Retryable(LocalError::ConnectionNotValidated));
        });
        assert_eq!(
            future.wait(),
            Err(InvocationError::Retryable(LocalError::ConnectionNotValidated))
        );
        worker.join().expect("worker");
    }
}
