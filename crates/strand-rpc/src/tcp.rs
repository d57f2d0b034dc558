//! Tokio-backed transport, reactor and timer.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::{
    EventHandler, IoStatus, LocalError, Reactor, Readiness, ReadyFuture, SocketOperation, Timer,
    TimerTask, TimerToken, Transceiver,
};

fn to_interest(op: SocketOperation) -> Option<Interest> {
    let read = op.intersects(SocketOperation::READ | SocketOperation::CONNECT);
    let write = op.intersects(SocketOperation::WRITE | SocketOperation::CONNECT);
    match (read, write) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn io_status(result: io::Result<usize>) -> Result<IoStatus, LocalError> {
    match result {
        Ok(n) => Ok(IoStatus::Ready(n)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(IoStatus::WouldBlock),
        Err(err) => Err(LocalError::io(&err)),
    }
}

/// A connected TCP stream driven through `try_read`/`try_write`.
pub struct TcpTransceiver {
    stream: Option<Arc<TcpStream>>,
    description: String,
}

impl TcpTransceiver {
    pub fn new(stream: TcpStream) -> Self {
        let local = stream
            .local_addr()
            .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string());
        let remote = stream
            .peer_addr()
            .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string());
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(target = "strand.rpc.tcp", %err, "failed to set TCP_NODELAY");
        }
        Self {
            stream: Some(Arc::new(stream)),
            description: format!("local address = {local}\nremote address = {remote}"),
        }
    }

    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, LocalError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| LocalError::io(&err))?;
        Ok(Self::new(stream))
    }

    fn stream(&self) -> Result<&TcpStream, LocalError> {
        self.stream.as_deref().ok_or_else(|| LocalError::ConnectionLost {
            message: "socket closed".to_string(),
        })
    }
}

impl Transceiver for TcpTransceiver {
    fn initialize(&mut self) -> Result<SocketOperation, LocalError> {
        Ok(SocketOperation::NONE)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<IoStatus, LocalError> {
        io_status(self.stream()?.try_read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoStatus, LocalError> {
        io_status(self.stream()?.try_write(buf))
    }

    fn closing(&mut self, initiator: bool, _cause: &LocalError) -> SocketOperation {
        // The initiator waits for the peer to close first, which avoids TIME_WAIT on the
        // accepting side.
        if initiator {
            SocketOperation::READ
        } else {
            SocketOperation::NONE
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::trace!(target = "strand.rpc.tcp", connection = %self.description, "socket closed");
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        let stream = self.stream.as_ref()?;
        Some(Arc::new(TcpReadiness {
            stream: Arc::downgrade(stream),
        }))
    }
}

struct TcpReadiness {
    stream: Weak<TcpStream>,
}

impl Readiness for TcpReadiness {
    fn ready(&self, interest: SocketOperation) -> ReadyFuture<'_> {
        Box::pin(async move {
            let (Some(stream), Some(wanted)) = (self.stream.upgrade(), to_interest(interest))
            else {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            };
            let ready = stream.ready(wanted).await?;
            let mut op = SocketOperation::NONE;
            if ready.is_readable() || ready.is_read_closed() {
                op |= SocketOperation::READ;
            }
            if ready.is_writable() || ready.is_write_closed() {
                op |= SocketOperation::WRITE;
            }
            Ok(op)
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Interests {
    ops: SocketOperation,
    finish: Option<bool>,
}

fn handler_key(handler: &Arc<dyn EventHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// Runs one driver task per registered handler on a tokio runtime.
///
/// Handlers are called on runtime worker threads, so dispatchers should hand long-running
/// work off instead of blocking inside `dispatch`.
pub struct TokioReactor {
    runtime: Handle,
    drivers: Mutex<HashMap<usize, watch::Sender<Interests>>>,
}

impl TokioReactor {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            drivers: Mutex::new(HashMap::new()),
        })
    }

    /// Uses the runtime of the calling task. Panics outside a runtime.
    pub fn current() -> Arc<Self> {
        Self::new(Handle::current())
    }

    fn update(&self, handler: Arc<dyn EventHandler>, apply: impl FnOnce(&mut Interests)) {
        let key = handler_key(&handler);
        let mut drivers = self.drivers.lock();

        if let Some(tx) = drivers.get(&key) {
            let mut finishing = false;
            tx.send_modify(|interests| {
                apply(interests);
                finishing = interests.finish.is_some();
            });
            if finishing {
                drivers.remove(&key);
            }
            return;
        }

        let mut interests = Interests::default();
        apply(&mut interests);
        if let Some(close_now) = interests.finish {
            self.runtime.spawn(async move { handler.finished(close_now) });
            return;
        }
        let (tx, rx) = watch::channel(interests);
        drivers.insert(key, tx);
        self.runtime.spawn(drive(handler, rx));
    }
}

impl Reactor for TokioReactor {
    fn register(&self, handler: Arc<dyn EventHandler>, op: SocketOperation) {
        self.update(handler, |interests| interests.ops |= op);
    }

    fn unregister(&self, handler: Arc<dyn EventHandler>, op: SocketOperation) {
        self.update(handler, |interests| interests.ops = interests.ops.without(op));
    }

    fn finish(&self, handler: Arc<dyn EventHandler>, close_now: bool) {
        self.update(handler, |interests| interests.finish = Some(close_now));
    }
}

async fn drive(handler: Arc<dyn EventHandler>, mut rx: watch::Receiver<Interests>) {
    let readiness = handler.readiness();
    loop {
        let interests = *rx.borrow_and_update();
        if let Some(close_now) = interests.finish {
            handler.finished(close_now);
            return;
        }

        let wait = async {
            match &readiness {
                Some(readiness) if !interests.ops.is_empty() => {
                    readiness.ready(interests.ops).await
                }
                _ => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    // The reactor is gone; nobody can finish this handler anymore.
                    handler.finished(true);
                    return;
                }
            }
            ready = wait => match ready {
                Ok(op) => {
                    let op = op.intersection(interests.ops);
                    if !op.is_empty() {
                        handler.message(op);
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        target = "strand.rpc.tcp",
                        handler = %handler.description(),
                        %err,
                        "readiness wait failed"
                    );
                    // Let the transport report the failure on its next read or write.
                    handler.message(interests.ops);
                }
            }
        }
    }
}

/// A [`Timer`] that sleeps on a tokio runtime.
pub struct TokioTimer {
    runtime: Handle,
}

impl TokioTimer {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self { runtime })
    }

    pub fn current() -> Arc<Self> {
        Self::new(Handle::current())
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerToken {
        let token = TimerToken::new();
        let cancel = token.cancellation().clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => task(),
            }
        });
        token
    }
}
