//! Accepts incoming connections for one endpoint and keeps their lifecycle in step with the
//! adapter's.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strand_config::AdapterConfig;
use strand_rpc::{
    CloseMode, Connection, ConnectionContext, Dispatcher, EventHandler, LocalError, Readiness,
    Role, SocketOperation, State, TimerToken, Transceiver,
};
use tokio_util::sync::CancellationToken;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A listening endpoint that hands out connected transports.
pub trait Acceptor: Send {
    /// Bind and start listening. Called again on the retry interval after a failure.
    fn listen(&mut self) -> Result<(), LocalError>;

    /// Take one pending connection, or `None` if nothing is waiting.
    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>, LocalError>;

    fn close(&mut self);

    fn description(&self) -> String;

    /// Readiness source, available once listening.
    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenerState {
    Active,
    Holding,
    Closed,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Upper bound on live connections. `0` means unbounded.
    pub max_connections: usize,
    /// Delay before retrying a failed `listen`.
    pub retry_interval: Duration,
}

impl ListenerOptions {
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            retry_interval: config.retry_interval(),
        }
    }
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self::from_config(&AdapterConfig::default())
    }
}

struct Inner {
    state: ListenerState,
    acceptor: Option<Box<dyn Acceptor>>,
    listening: bool,
    registered: bool,
    retry: Option<TimerToken>,
    readiness: Option<Arc<dyn Readiness>>,
    connections: Vec<Arc<Connection>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

/// Owns the incoming connections of one endpoint.
///
/// A listener starts out holding. Connections it accepts are validated, then activated if
/// the listener is active at that point; `activate`, `hold` and `destroy` fan out to every
/// live connection.
///
/// Lock order is listener, then connection. Connection start callbacks take the listener
/// lock, so anything that can fail a starting connection runs after the lock is released.
pub struct Listener {
    this: Weak<Listener>,
    name: String,
    description: String,
    context: ConnectionContext,
    options: ListenerOptions,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Listener {
    pub fn new(
        name: impl Into<String>,
        acceptor: Box<dyn Acceptor>,
        options: ListenerOptions,
        context: ConnectionContext,
    ) -> Arc<Self> {
        let description = acceptor.description();
        Self::build(name.into(), description, Some(acceptor), Vec::new(), options, context)
    }

    /// A listener over one connectionless channel. The channel's connection is created and
    /// started right away; there is nothing to accept.
    pub fn datagram(
        name: impl Into<String>,
        transceiver: Box<dyn Transceiver>,
        context: ConnectionContext,
    ) -> Arc<Self> {
        let description = transceiver.description();
        let connection = Connection::new(transceiver, Role::Incoming, &context);
        let listener = Self::build(
            name.into(),
            description,
            None,
            vec![connection.clone()],
            ListenerOptions::default(),
            context,
        );
        listener.start_connection(&connection);
        listener
    }

    fn build(
        name: String,
        description: String,
        acceptor: Option<Box<dyn Acceptor>>,
        connections: Vec<Arc<Connection>>,
        options: ListenerOptions,
        context: ConnectionContext,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Listener {
            this: this.clone(),
            name,
            description,
            context,
            options,
            inner: Mutex::new(Inner {
                state: ListenerState::Holding,
                acceptor,
                listening: false,
                registered: false,
                retry: None,
                readiness: None,
                connections,
                dispatcher: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn state(&self) -> ListenerState {
        self.inner.lock().state
    }

    pub fn is_listening(&self) -> bool {
        self.inner.lock().listening
    }

    /// Dispatcher for requests on every current and future connection.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        let mut inner = self.inner.lock();
        for connection in &inner.connections {
            connection.set_dispatcher(dispatcher.clone());
        }
        inner.dispatcher = Some(dispatcher);
    }

    /// Start listening. Failures are logged and retried on `retry_interval`; calling this
    /// again while listening does nothing.
    pub fn start_accepting(&self) {
        let mut inner = self.inner.lock();
        self.listen(&mut inner);
    }

    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ListenerState::Holding {
            return;
        }
        self.set_state(&mut inner, ListenerState::Active);
        self.register(&mut inner);
        for connection in &inner.connections {
            connection.activate();
        }
    }

    pub fn hold(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ListenerState::Active {
            return;
        }
        self.set_state(&mut inner, ListenerState::Holding);
        self.unregister(&mut inner);
        for connection in &inner.connections {
            connection.hold();
        }
    }

    /// Stop accepting and close every connection gracefully with
    /// [`LocalError::AdapterDeactivated`].
    pub fn destroy(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.state >= ListenerState::Closed {
                return;
            }
            self.set_state(&mut inner, ListenerState::Closed);
            if let Some(retry) = inner.retry.take() {
                retry.cancel();
            }
            inner.registered = false;
            match self.handler() {
                Some(handler) if inner.listening => {
                    // `finished` releases the acceptor once the reactor lets go of it.
                    self.context.reactor.finish(handler, false);
                }
                _ => self.release_acceptor(&mut inner),
            }
            inner.connections.clone()
        };
        for connection in connections {
            connection.destroy(LocalError::AdapterDeactivated);
        }
    }

    /// Live connections, pruning the ones that finished.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        inner
            .connections
            .retain(|connection| connection.state() != State::Finished);
        inner.connections.clone()
    }

    /// Flush queued batch requests on every connection that can still send.
    pub fn flush_batch_requests(&self, compress: bool) {
        for connection in self.connections() {
            if !matches!(connection.state(), State::Active | State::Holding) {
                continue;
            }
            if let Err(err) = connection.flush_batch_requests(compress) {
                tracing::debug!(
                    target = "strand.adapter",
                    adapter = %self.name,
                    connection = %connection.description(),
                    error = %err,
                    "batch flush failed"
                );
            }
        }
    }

    /// Block until the listener is holding and every connection has finished its running
    /// dispatches.
    pub fn wait_until_holding(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        let connections = {
            let mut inner = self.inner.lock();
            while inner.state < ListenerState::Holding {
                if cancel.is_cancelled() {
                    return Err(LocalError::Interrupted);
                }
                self.cond.wait_for(&mut inner, WAIT_POLL_INTERVAL);
            }
            inner.connections.clone()
        };
        for connection in connections {
            connection.wait_until_holding(cancel)?;
        }
        Ok(())
    }

    /// Block until the acceptor is released and every connection finished.
    ///
    /// On cancellation the remaining connections are closed forcefully, so a later wait
    /// still completes.
    pub fn wait_until_finished(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        let waited = {
            let mut inner = self.inner.lock();
            loop {
                if inner.state == ListenerState::Finished {
                    break Ok(inner.connections.clone());
                }
                if cancel.is_cancelled() {
                    break Err(inner.connections.clone());
                }
                self.cond.wait_for(&mut inner, WAIT_POLL_INTERVAL);
            }
        };
        let connections = match waited {
            Ok(connections) => connections,
            Err(remaining) => {
                self.abort(&remaining);
                return Err(LocalError::Interrupted);
            }
        };

        for connection in &connections {
            if let Err(err) = connection.wait_until_finished(cancel) {
                self.abort(&connections);
                return Err(err);
            }
        }
        self.inner.lock().connections.clear();
        Ok(())
    }

    fn abort(&self, connections: &[Arc<Connection>]) {
        tracing::debug!(
            target = "strand.adapter",
            adapter = %self.name,
            count = connections.len(),
            "wait interrupted, aborting connections"
        );
        for connection in connections {
            connection.close(CloseMode::Forcefully);
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ListenerState) {
        tracing::debug!(
            target = "strand.adapter",
            adapter = %self.name,
            listener = %self.description,
            from = ?inner.state,
            to = ?state,
            "listener state change"
        );
        inner.state = state;
        self.cond.notify_all();
    }

    fn listen(&self, inner: &mut Inner) {
        if inner.listening || inner.state >= ListenerState::Closed {
            return;
        }
        let Some(acceptor) = inner.acceptor.as_mut() else {
            return;
        };
        match acceptor.listen() {
            Ok(()) => {
                inner.listening = true;
                inner.readiness = acceptor.readiness();
                tracing::debug!(
                    target = "strand.adapter",
                    adapter = %self.name,
                    listener = %self.description,
                    "accepting connections"
                );
                if inner.state == ListenerState::Active {
                    self.register(inner);
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "strand.adapter",
                    adapter = %self.name,
                    listener = %self.description,
                    error = %err,
                    retry_in = ?self.options.retry_interval,
                    "failed to listen"
                );
                if inner.retry.is_none() {
                    let listener = self.this.clone();
                    let token = self.context.timer.schedule(
                        self.options.retry_interval,
                        Box::new(move || {
                            if let Some(listener) = listener.upgrade() {
                                listener.retry_listen();
                            }
                        }),
                    );
                    inner.retry = Some(token);
                }
            }
        }
    }

    fn retry_listen(&self) {
        let mut inner = self.inner.lock();
        inner.retry = None;
        self.listen(&mut inner);
    }

    fn release_acceptor(&self, inner: &mut Inner) {
        if let Some(mut acceptor) = inner.acceptor.take() {
            acceptor.close();
        }
        inner.readiness = None;
        inner.listening = false;
        if inner.state == ListenerState::Closed {
            self.set_state(inner, ListenerState::Finished);
        }
    }

    fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.this
            .upgrade()
            .map(|listener| listener as Arc<dyn EventHandler>)
    }

    fn register(&self, inner: &mut Inner) {
        if inner.registered || !inner.listening {
            return;
        }
        if let Some(handler) = self.handler() {
            self.context.reactor.register(handler, SocketOperation::READ);
            inner.registered = true;
        }
    }

    fn unregister(&self, inner: &mut Inner) {
        if !inner.registered {
            return;
        }
        inner.registered = false;
        if let Some(handler) = self.handler() {
            self.context.reactor.unregister(handler, SocketOperation::READ);
        }
    }

    fn accept(&self, inner: &mut Inner) -> Option<Arc<Connection>> {
        inner
            .connections
            .retain(|connection| connection.state() != State::Finished);

        let acceptor = inner.acceptor.as_mut()?;
        let mut transceiver = match acceptor.accept() {
            Ok(Some(transceiver)) => transceiver,
            Ok(None) => return None,
            Err(err) => {
                if self.context.options.warn_connections {
                    tracing::warn!(
                        target = "strand.adapter",
                        adapter = %self.name,
                        listener = %self.description,
                        error = %err,
                        "accept failed"
                    );
                } else {
                    tracing::debug!(
                        target = "strand.adapter",
                        adapter = %self.name,
                        listener = %self.description,
                        error = %err,
                        "accept failed"
                    );
                }
                return None;
            }
        };

        let max = self.options.max_connections;
        if max > 0 && inner.connections.len() >= max {
            if self.context.options.warn_connections {
                tracing::warn!(
                    target = "strand.adapter",
                    adapter = %self.name,
                    connection = %transceiver.description(),
                    max_connections = max,
                    "rejecting connection, limit reached"
                );
            } else {
                tracing::debug!(
                    target = "strand.adapter",
                    adapter = %self.name,
                    connection = %transceiver.description(),
                    max_connections = max,
                    "rejecting connection, limit reached"
                );
            }
            transceiver.close();
            return None;
        }

        let connection = Connection::new(transceiver, Role::Incoming, &self.context);
        if let Some(dispatcher) = &inner.dispatcher {
            connection.set_dispatcher(dispatcher.clone());
        }
        inner.connections.push(connection.clone());
        Some(connection)
    }

    fn start_connection(&self, connection: &Arc<Connection>) {
        let listener = self.this.clone();
        connection.start(Some(Box::new(
            move |connection: &Arc<Connection>, result: Result<(), LocalError>| {
                if let Some(listener) = listener.upgrade() {
                    listener.connection_started(connection, result);
                }
            },
        )));
    }

    fn connection_started(&self, connection: &Arc<Connection>, result: Result<(), LocalError>) {
        match result {
            Ok(()) => {
                let inner = self.inner.lock();
                if inner.state == ListenerState::Active {
                    connection.activate();
                }
            }
            Err(err) => {
                if self.context.options.warn_connections {
                    tracing::warn!(
                        target = "strand.adapter",
                        adapter = %self.name,
                        connection = %connection.description(),
                        error = %err,
                        "connection validation failed"
                    );
                } else {
                    tracing::debug!(
                        target = "strand.adapter",
                        adapter = %self.name,
                        connection = %connection.description(),
                        error = %err,
                        "connection validation failed"
                    );
                }
            }
        }
    }
}

impl EventHandler for Listener {
    fn message(&self, _ready: SocketOperation) {
        let accepted = {
            let mut inner = self.inner.lock();
            if inner.state != ListenerState::Active {
                return;
            }
            self.accept(&mut inner)
        };
        if let Some(connection) = accepted {
            self.start_connection(&connection);
        }
    }

    fn finished(&self, _close_now: bool) {
        let mut inner = self.inner.lock();
        self.release_acceptor(&mut inner);
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        self.inner.lock().readiness.clone()
    }
}

#[cfg(test)]
mod tests;
