//! Tokio TCP acceptor.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;
use strand_rpc::tcp::TcpTransceiver;
use strand_rpc::{LocalError, Readiness, ReadyFuture, SocketOperation, Transceiver};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;

use crate::Acceptor;

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

struct Shared {
    listener: TcpListener,
    // A connection picked up while waiting for readiness, handed out by the next `accept`.
    stash: Mutex<Option<TcpStream>>,
}

/// Accepts TCP connections on one address.
pub struct TcpAcceptor {
    addr: SocketAddr,
    bound: Option<std::net::TcpListener>,
    runtime: Handle,
    shared: Option<Arc<Shared>>,
}

impl TcpAcceptor {
    /// Bind `addr` when the listener starts accepting.
    pub fn new(addr: SocketAddr, runtime: Handle) -> Self {
        Self {
            addr,
            bound: None,
            runtime,
            shared: None,
        }
    }

    /// Listen on an already bound socket, for example one bound to port 0. A retry after a
    /// failure binds `local_addr` again.
    pub fn from_std(listener: std::net::TcpListener, runtime: Handle) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            addr,
            bound: Some(listener),
            runtime,
            shared: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn bind(&mut self) -> io::Result<TcpListener> {
        let listener = match self.bound.take() {
            Some(listener) => listener,
            None => std::net::TcpListener::bind(self.addr)?,
        };
        listener.set_nonblocking(true)?;
        let _guard = self.runtime.enter();
        TcpListener::from_std(listener)
    }
}

impl Acceptor for TcpAcceptor {
    fn listen(&mut self) -> Result<(), LocalError> {
        if self.shared.is_some() {
            return Ok(());
        }
        let listener = self.bind().map_err(|err| LocalError::io(&err))?;
        if let Ok(addr) = listener.local_addr() {
            self.addr = addr;
        }
        self.shared = Some(Arc::new(Shared {
            listener,
            stash: Mutex::new(None),
        }));
        Ok(())
    }

    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>, LocalError> {
        let Some(shared) = &self.shared else {
            return Ok(None);
        };
        if let Some(stream) = shared.stash.lock().take() {
            return Ok(Some(Box::new(TcpTransceiver::new(stream))));
        }

        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        match shared.listener.poll_accept(&mut cx) {
            Poll::Ready(Ok((stream, _))) => Ok(Some(Box::new(TcpTransceiver::new(stream)))),
            Poll::Ready(Err(err)) => Err(LocalError::io(&err)),
            Poll::Pending => Ok(None),
        }
    }

    fn close(&mut self) {
        if self.shared.take().is_some() {
            tracing::debug!(target = "strand.adapter", addr = %self.addr, "stopped listening");
        }
    }

    fn description(&self) -> String {
        format!("local address = {}", self.addr)
    }

    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        let shared = self.shared.as_ref()?;
        Some(Arc::new(AcceptReadiness {
            shared: Arc::downgrade(shared),
        }))
    }
}

struct AcceptReadiness {
    shared: Weak<Shared>,
}

impl Readiness for AcceptReadiness {
    fn ready(&self, _interest: SocketOperation) -> ReadyFuture<'_> {
        Box::pin(async move {
            let Some(shared) = self.shared.upgrade() else {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            };
            std::future::poll_fn(|cx| {
                let mut stash = shared.stash.lock();
                if stash.is_some() {
                    return Poll::Ready(Ok(SocketOperation::READ));
                }
                match shared.listener.poll_accept(cx) {
                    Poll::Ready(Ok((stream, _))) => {
                        *stash = Some(stream);
                        Poll::Ready(Ok(SocketOperation::READ))
                    }
                    Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                    Poll::Pending => Poll::Pending,
                }
            })
            .await
        })
    }
}
