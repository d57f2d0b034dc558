//! The per-connection state machine.
//!
//! A [`Connection`] owns one transport and multiplexes requests, replies, batches and control
//! messages over it. All state lives behind one mutex. Anything that calls out of the
//! connection (reply handlers, dispatchers, lifecycle callbacks) is collected while the lock is
//! held and run after it is released; the dispatch counter stays raised until those calls
//! return so the connection cannot reach [`State::Finished`] underneath them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use strand_config::ConnectionConfig;
use strand_proto::{
    decode_body, encode_error_reply, Frame, Header, InputStream, MessageType, ReplyStatus,
    WireError, HEADER_SIZE,
};
use tokio_util::sync::CancellationToken;

use crate::acm::{self, AcmConfig, ActivityMonitor, ActivitySnapshot, IdleClose};
use crate::batch::BatchQueue;
use crate::message::OutgoingMessage;
use crate::outstanding::OutstandingTable;
use crate::{
    Dispatcher, EventHandler, Invocation, InvocationError, InvocationOptions, IoStatus,
    LocalError, Reactor, Readiness, ReplyFuture, ReplyHandler, PendingReply, SendStatus,
    SocketOperation, Timer, TimerToken, Transceiver,
};


const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Read buffer capacity kept between messages; larger buffers are released after use.
const READ_BUFFER_RETAIN: usize = 16 * 1024;

/// Connection lifecycle. States only move forward, except `Active` and `Holding`, which
/// alternate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Uninitialized,
    NotValidated,
    Active,
    Holding,
    Closing,
    ClosingPending,
    Closed,
    Finished,
}

/// Which side of the validation handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a listener; sends the validation message.
    Incoming,
    /// Established by this process; waits for the validation message.
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Fail everything in flight and drop the transport.
    Forcefully,
    /// Finish running dispatches, then exchange close messages. See also
    /// [`Connection::close_gracefully_with_wait`].
    Gracefully,
}

/// Per-connection tunables, usually derived from [`ConnectionConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub message_size_max: usize,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub compression_level: i32,
    pub batch_auto_flush_size: usize,
    pub warn_connections: bool,
    pub warn_datagrams: bool,
}

impl ConnectionOptions {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            message_size_max: config.message_size_max,
            timeout: config.timeout(),
            connect_timeout: config.connect_timeout(),
            close_timeout: config.close_timeout(),
            compression_level: config.effective_compression_level(),
            batch_auto_flush_size: config.batch_auto_flush_size,
            warn_connections: config.warn_connections,
            warn_datagrams: config.warn_datagrams,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// The shared services a connection runs on.
#[derive(Clone)]
pub struct ConnectionContext {
    pub reactor: Arc<dyn Reactor>,
    pub timer: Arc<dyn Timer>,
    pub monitor: Option<Arc<ActivityMonitor>>,
    pub options: ConnectionOptions,
}

impl ConnectionContext {
    pub fn new(reactor: Arc<dyn Reactor>, timer: Arc<dyn Timer>) -> Self {
        Self {
            reactor,
            timer,
            monitor: None,
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ActivityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("monitor", &self.monitor.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Called once with the outcome of [`Connection::start`].
pub type StartCallback = Box<dyn FnOnce(&Arc<Connection>, Result<(), LocalError>) + Send>;
/// Called for every validation message received after the handshake.
pub type HeartbeatCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Called once after the transport has been released.
pub type CloseCallback = Box<dyn FnOnce(&Connection) + Send>;

struct PendingRequest {
    handle: Arc<dyn ReplyHandler>,
    idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerSlot {
    Read,
    Write,
    Close,
}

#[derive(Default)]
struct Timers {
    read: Option<(u64, TimerToken)>,
    write: Option<(u64, TimerToken)>,
    close: Option<(u64, TimerToken)>,
    generation: u64,
}

impl Timers {
    fn slot_mut(&mut self, slot: TimerSlot) -> &mut Option<(u64, TimerToken)> {
        match slot {
            TimerSlot::Read => &mut self.read,
            TimerSlot::Write => &mut self.write,
            TimerSlot::Close => &mut self.close,
        }
    }

    fn cancel(&mut self, slot: TimerSlot) {
        if let Some((_, token)) = self.slot_mut(slot).take() {
            token.cancel();
        }
    }

    fn cancel_all(&mut self) {
        for slot in [TimerSlot::Read, TimerSlot::Write, TimerSlot::Close] {
            self.cancel(slot);
        }
    }

    /// Clears the slot if `generation` is still the armed one.
    fn take_if_current(&mut self, slot: TimerSlot, generation: u64) -> bool {
        let entry = self.slot_mut(slot);
        if matches!(entry, Some((armed, _)) if *armed == generation) {
            *entry = None;
            true
        } else {
            false
        }
    }
}

struct Inner {
    state: State,
    transceiver: Option<Box<dyn Transceiver>>,
    transport_released: bool,
    cause: Option<LocalError>,
    dispatcher: Option<Arc<dyn Dispatcher>>,

    outstanding: OutstandingTable<PendingRequest>,
    batch: BatchQueue,
    write_queue: VecDeque<OutgoingMessage<'static>>,
    /// Incoming connections: the validation message and how much of it was written.
    validation: Option<(Frame<'static>, usize)>,

    read_buf: Vec<u8>,
    read_pos: usize,
    /// Header of the message currently being read, once decoded.
    read_header: Option<Header>,

    dispatch_count: usize,
    registered: SocketOperation,
    shutdown_initiated: bool,
    last_activity: Instant,
    timers: Timers,

    start_callback: Option<StartCallback>,
    heartbeat_callback: Option<HeartbeatCallback>,
    close_callback: Option<CloseCallback>,
}

struct Dispatch {
    request_id: i32,
    count: i32,
    stream: InputStream,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

/// Calls collected under the lock and run after it is released.
#[derive(Default)]
struct Upcalls {
    start: Option<(StartCallback, Result<(), LocalError>)>,
    sent: Vec<Arc<dyn ReplyHandler>>,
    replies: Vec<(Arc<dyn ReplyHandler>, Bytes)>,
    failures: Vec<(Arc<dyn ReplyHandler>, InvocationError)>,
    /// Already counted individually in `dispatch_count`.
    dispatches: Vec<Dispatch>,
    heartbeat: Option<HeartbeatCallback>,
    close: Option<CloseCallback>,
    counted: bool,
}

impl Upcalls {
    fn needs_count(&self) -> bool {
        self.start.is_some()
            || !self.sent.is_empty()
            || !self.replies.is_empty()
            || !self.failures.is_empty()
            || self.heartbeat.is_some()
            || self.close.is_some()
    }
}

pub struct Connection {
    this: Weak<Connection>,
    description: String,
    role: Role,
    datagram: bool,
    readiness: Option<Arc<dyn Readiness>>,
    reactor: Arc<dyn Reactor>,
    timer: Arc<dyn Timer>,
    monitor: Option<Arc<ActivityMonitor>>,
    options: ConnectionOptions,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("description", &self.description)
            .field("role", &self.role)
            .field("datagram", &self.datagram)
            .finish_non_exhaustive()
    }
}

fn transport(
    slot: &mut Option<Box<dyn Transceiver>>,
) -> Result<&mut (dyn Transceiver + 'static), LocalError> {
    slot.as_deref_mut().ok_or_else(|| LocalError::ConnectionLost {
        message: "transport already released".to_string(),
    })
}

fn end_of_stream() -> LocalError {
    LocalError::ConnectionLost {
        message: "connection closed by the remote end".to_string(),
    }
}

/// The error a read, write or close timeout raises in `state`.
fn timeout_cause(state: State) -> Option<LocalError> {
    match state {
        State::Uninitialized | State::NotValidated => Some(LocalError::ConnectTimeout),
        State::Active | State::Holding => Some(LocalError::RequestTimeout),
        State::Closing | State::ClosingPending => Some(LocalError::CloseTimeout),
        State::Closed | State::Finished => None,
    }
}

/// Causes that are part of a normal shutdown and not worth a warning.
fn is_orderly(cause: &LocalError) -> bool {
    matches!(
        cause,
        LocalError::ManuallyClosed { .. }
            | LocalError::ClosedByPeer
            | LocalError::AdapterDeactivated
            | LocalError::RuntimeDestroyed
            | LocalError::IdleTimeout
    )
}

/// Write as much of `message` as the transport takes. Returns the number of bytes written.
fn write_message(
    transceiver: &mut dyn Transceiver,
    message: &mut OutgoingMessage<'_>,
) -> Result<usize, LocalError> {
    let mut total = 0;
    while !message.is_done() {
        match transceiver.write(message.remaining())? {
            IoStatus::Ready(0) | IoStatus::WouldBlock => break,
            IoStatus::Ready(n) => {
                message.written += n;
                total += n;
            }
        }
    }
    Ok(total)
}

/// Decode one datagram; it must hold exactly one complete message.
fn decode_datagram(buf: &[u8], message_size_max: usize) -> Result<(Header, Bytes), WireError> {
    if buf.len() < HEADER_SIZE {
        return Err(WireError::DatagramTruncated {
            declared: HEADER_SIZE,
            received: buf.len(),
        });
    }
    let header = Header::decode(buf, message_size_max)?;
    if buf.len() != header.size {
        return Err(WireError::DatagramTruncated {
            declared: header.size,
            received: buf.len(),
        });
    }
    let body = decode_body(&header, &buf[HEADER_SIZE..], message_size_max)?;
    Ok((header, Bytes::from(body)))
}

impl Connection {
    pub fn new(
        transceiver: Box<dyn Transceiver>,
        role: Role,
        context: &ConnectionContext,
    ) -> Arc<Self> {
        let description = transceiver.description();
        let datagram = transceiver.is_datagram();
        let readiness = transceiver.readiness();
        let options = context.options.clone();
        let batch = BatchQueue::new(options.batch_auto_flush_size);

        Arc::new_cyclic(|this| Connection {
            this: this.clone(),
            description,
            role,
            datagram,
            readiness,
            reactor: context.reactor.clone(),
            timer: context.timer.clone(),
            monitor: context.monitor.clone(),
            options,
            inner: Mutex::new(Inner {
                state: State::Uninitialized,
                transceiver: Some(transceiver),
                transport_released: false,
                cause: None,
                dispatcher: None,
                outstanding: OutstandingTable::new(),
                batch,
                write_queue: VecDeque::new(),
                validation: None,
                read_buf: Vec::new(),
                read_pos: 0,
                read_header: None,
                dispatch_count: 0,
                registered: SocketOperation::NONE,
                shutdown_initiated: false,
                last_activity: Instant::now(),
                timers: Timers::default(),
                start_callback: None,
                heartbeat_callback: None,
                close_callback: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// The first failure recorded, if any.
    pub fn cause(&self) -> Option<LocalError> {
        self.inner.lock().cause.clone()
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    pub fn dispatch_count(&self) -> usize {
        self.inner.lock().dispatch_count
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        self.inner.lock().dispatcher = Some(dispatcher);
    }

    pub fn set_heartbeat_callback(&self, callback: HeartbeatCallback) {
        self.inner.lock().heartbeat_callback = Some(callback);
    }

    /// Runs right away if the transport was already released.
    pub fn set_close_callback(&self, callback: CloseCallback) {
        {
            let mut inner = self.inner.lock();
            if !inner.transport_released {
                inner.close_callback = Some(callback);
                return;
            }
        }
        callback(self);
    }

    /// Initialize the transport and run the validation handshake.
    ///
    /// `callback` runs once the connection reaches `Holding`, or with the failure if it never
    /// does.
    pub fn start(&self, callback: Option<StartCallback>) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            if inner.state >= State::Closed {
                if let Some(callback) = callback {
                    let cause = inner.cause.clone().unwrap_or_else(end_of_stream);
                    up.start = Some((callback, Err(cause)));
                }
            } else {
                inner.start_callback = callback;
                match self.handshake(&mut inner, &mut up) {
                    Ok(true) => self.validated(&mut inner, &mut up),
                    Ok(false) => {}
                    Err(cause) => self.set_state(&mut inner, State::Closed, Some(cause), &mut up),
                }
            }
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    /// Start reading and dispatching requests. Ignored before validation completes.
    pub fn activate(&self) {
        self.transition(State::Active, None);
    }

    /// Stop reading new requests.
    pub fn hold(&self) {
        self.transition(State::Holding, None);
    }

    /// Graceful close on behalf of the adapter or runtime.
    pub fn destroy(&self, cause: LocalError) {
        self.transition(State::Closing, Some(cause));
    }

    pub fn close(&self, mode: CloseMode) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            match mode {
                CloseMode::Forcefully => {
                    let cause = LocalError::ManuallyClosed { graceful: false };
                    self.set_state(&mut inner, State::Closed, Some(cause), &mut up);
                }
                CloseMode::Gracefully => {
                    let cause = LocalError::ManuallyClosed { graceful: true };
                    self.set_state(&mut inner, State::Closing, Some(cause), &mut up);
                }
            }
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    /// Close gracefully once every outstanding two-way request has been answered.
    ///
    /// Cancellation leaves the connection as it is and returns [`LocalError::Interrupted`].
    pub fn close_gracefully_with_wait(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            while !inner.outstanding.is_empty() && inner.state < State::Closing {
                if cancel.is_cancelled() {
                    return Err(LocalError::Interrupted);
                }
                self.cond.wait_for(&mut inner, WAIT_POLL_INTERVAL);
            }
            let cause = LocalError::ManuallyClosed { graceful: true };
            self.set_state(&mut inner, State::Closing, Some(cause), &mut up);
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
        Ok(())
    }

    fn transition(&self, state: State, cause: Option<LocalError>) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            if cause.is_none() && inner.state <= State::NotValidated {
                return;
            }
            self.set_state(&mut inner, state, cause, &mut up);
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    /// Block until the connection is holding (or past it) and no dispatch is running.
    pub fn wait_until_holding(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        let mut inner = self.inner.lock();
        while inner.state < State::Holding || inner.dispatch_count > 0 {
            if cancel.is_cancelled() {
                return Err(LocalError::Interrupted);
            }
            self.cond.wait_for(&mut inner, WAIT_POLL_INTERVAL);
        }
        Ok(())
    }

    pub fn wait_until_finished(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        let mut inner = self.inner.lock();
        while inner.state < State::Finished {
            if cancel.is_cancelled() {
                return Err(LocalError::Interrupted);
            }
            self.cond.wait_for(&mut inner, WAIT_POLL_INTERVAL);
        }
        Ok(())
    }

    /// Send a request. Two-way iff `reply` is given; the handler hears exactly one of
    /// `completed` or `failed`, but not when this call itself returns an error.
    pub fn send_request(
        &self,
        payload: &[u8],
        reply: Option<Arc<dyn ReplyHandler>>,
        options: InvocationOptions,
    ) -> Result<Invocation, InvocationError> {
        let mut up = Upcalls::default();
        let result = {
            let mut inner = self.inner.lock();
            let result = self.send_request_locked(&mut inner, payload, reply, options, &mut up);
            self.settle(&mut inner, &mut up);
            result
        };
        self.run_upcalls(up);
        result
    }

    /// Send a two-way request and return a future for its reply.
    pub fn invoke(
        &self,
        payload: &[u8],
        options: InvocationOptions,
    ) -> Result<(Invocation, ReplyFuture), InvocationError> {
        let (pending, future) = PendingReply::new();
        let invocation = self.send_request(payload, Some(pending), options)?;
        Ok((invocation, future))
    }

    fn send_request_locked(
        &self,
        inner: &mut Inner,
        payload: &[u8],
        reply: Option<Arc<dyn ReplyHandler>>,
        options: InvocationOptions,
        up: &mut Upcalls,
    ) -> Result<Invocation, InvocationError> {
        self.check_usable(inner).map_err(InvocationError::Retryable)?;

        let request_id = if reply.is_some() {
            inner.outstanding.next_id()
        } else {
            0
        };
        if let Some(handle) = &reply {
            let pending = PendingRequest {
                handle: handle.clone(),
                idempotent: options.idempotent,
            };
            if inner.outstanding.register(request_id, pending).is_err() {
                return Err(InvocationError::Retryable(LocalError::ConnectionLost {
                    message: format!("request id {request_id} is still outstanding"),
                }));
            }
        }

        let message = OutgoingMessage::request(
            Frame::request(request_id, payload),
            reply,
            request_id,
            options.idempotent,
            options.compress,
        );
        match self.send_message(inner, message, up) {
            Ok(status) => Ok(Invocation { request_id, status }),
            Err((cause, written)) => {
                if request_id != 0 {
                    inner.outstanding.cancel(request_id);
                }
                self.set_state(inner, State::Closed, Some(cause.clone()), up);
                Err(InvocationError::classify(cause, written > 0, options.idempotent))
            }
        }
    }

    /// Append a one-way request to the batch. May send the previous batch if the auto-flush
    /// size would be exceeded.
    pub fn batch_request(&self, payload: &[u8]) -> Result<(), InvocationError> {
        let mut up = Upcalls::default();
        let result = {
            let mut inner = self.inner.lock();
            let enqueued = match self.check_usable(&inner) {
                Ok(()) => inner.batch.enqueue(payload),
                Err(cause) => Err(cause),
            };
            let result = match enqueued {
                Err(cause) => Err(InvocationError::Retryable(cause)),
                Ok(None) => Ok(()),
                Ok(Some((buf, count))) => self
                    .send_batch(&mut inner, buf, count, false, &mut up)
                    .map(|_| ()),
            };
            self.settle(&mut inner, &mut up);
            result
        };
        self.run_upcalls(up);
        result
    }

    /// Send the accumulated batch as one message. `None` if the batch was empty.
    pub fn flush_batch_requests(
        &self,
        compress: bool,
    ) -> Result<Option<SendStatus>, InvocationError> {
        let mut up = Upcalls::default();
        let result = {
            let mut inner = self.inner.lock();
            let result = match self.check_usable(&inner) {
                Err(cause) => Err(InvocationError::Retryable(cause)),
                Ok(()) if inner.batch.is_empty() => Ok(None),
                Ok(()) => {
                    let (buf, count) = inner.batch.swap_and_clear();
                    self.send_batch(&mut inner, buf, count, compress, &mut up)
                        .map(Some)
                }
            };
            self.settle(&mut inner, &mut up);
            result
        };
        self.run_upcalls(up);
        result
    }

    fn send_batch(
        &self,
        inner: &mut Inner,
        buf: Vec<u8>,
        count: i32,
        compress: bool,
        up: &mut Upcalls,
    ) -> Result<SendStatus, InvocationError> {
        let message = OutgoingMessage::new(Frame::batch(count, buf), compress);
        self.send_message(inner, message, up).map_err(|(cause, written)| {
            self.set_state(inner, State::Closed, Some(cause.clone()), up);
            InvocationError::classify(cause, written > 0, false)
        })
    }

    /// Send a validation message as a keep-alive.
    pub fn heartbeat(&self) -> Result<(), LocalError> {
        let mut up = Upcalls::default();
        let result = {
            let mut inner = self.inner.lock();
            let result = self
                .check_usable(&inner)
                .and_then(|()| self.send_heartbeat(&mut inner, &mut up));
            self.settle(&mut inner, &mut up);
            result
        };
        self.run_upcalls(up);
        result
    }

    fn send_heartbeat(&self, inner: &mut Inner, up: &mut Upcalls) -> Result<(), LocalError> {
        let message = OutgoingMessage::new(Frame::control(MessageType::ValidateConnection), false);
        if let Err((cause, _)) = self.send_message(inner, message, up) {
            self.set_state(inner, State::Closed, Some(cause.clone()), up);
            return Err(cause);
        }
        Ok(())
    }

    /// Abandon a two-way request. Returns whether the request was still pending.
    ///
    /// The handler fails with `error`. A request whose first bytes are already on the wire
    /// stays queued so the stream is not corrupted; its reply will be dropped.
    pub fn cancel(&self, request_id: i32, error: LocalError) -> bool {
        let mut up = Upcalls::default();
        let found = {
            let mut inner = self.inner.lock();
            let found = self.cancel_locked(&mut inner, request_id, error, &mut up);
            self.settle(&mut inner, &mut up);
            found
        };
        self.run_upcalls(up);
        found
    }

    fn cancel_locked(
        &self,
        inner: &mut Inner,
        request_id: i32,
        error: LocalError,
        up: &mut Upcalls,
    ) -> bool {
        if request_id == 0 {
            return false;
        }
        if let Some(index) = inner
            .write_queue
            .iter()
            .position(|message| message.request_id == request_id)
        {
            let unsent = inner.write_queue[index].written == 0;
            if unsent {
                inner.write_queue.remove(index);
            } else {
                inner.write_queue[index].handle = None;
            }
        }
        let Some(pending) = inner.outstanding.cancel(request_id) else {
            return false;
        };
        tracing::debug!(
            target = "strand.rpc.connection",
            connection = %self.description,
            request_id,
            %error,
            "request canceled"
        );
        up.failures
            .push((pending.handle, InvocationError::Fatal(error)));
        if inner.outstanding.is_empty() {
            self.cond.notify_all();
        }
        true
    }

    /// Evaluate heartbeat and idle-close policy at `now`.
    pub(crate) fn monitor(&self, now: Instant, config: &AcmConfig) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            if inner.state != State::Active {
                return;
            }

            if acm::should_heartbeat(now, &Self::snapshot(&inner), config) {
                tracing::trace!(
                    target = "strand.rpc.acm",
                    connection = %self.description,
                    "sending heartbeat"
                );
                // A failed heartbeat already closed the connection.
                let _ = self.send_heartbeat(&mut inner, &mut up);
            }

            if inner.state == State::Active {
                match acm::idle_close(now, &Self::snapshot(&inner), config) {
                    Some(IdleClose::Forceful) => {
                        tracing::debug!(
                            target = "strand.rpc.acm",
                            connection = %self.description,
                            "closing idle connection forcefully"
                        );
                        self.set_state(
                            &mut inner,
                            State::Closed,
                            Some(LocalError::IdleTimeout),
                            &mut up,
                        );
                    }
                    Some(IdleClose::Graceful) => {
                        tracing::debug!(
                            target = "strand.rpc.acm",
                            connection = %self.description,
                            "closing idle connection"
                        );
                        self.set_state(
                            &mut inner,
                            State::Closing,
                            Some(LocalError::IdleTimeout),
                            &mut up,
                        );
                    }
                    None => {}
                }
            }
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    fn snapshot(inner: &Inner) -> ActivitySnapshot {
        ActivitySnapshot {
            last_activity: inner.last_activity,
            write_pending: !inner.write_queue.is_empty(),
            read_in_progress: inner.read_pos > 0 || inner.read_header.is_some(),
            dispatch_count: inner.dispatch_count,
            batch_pending: !inner.batch.is_empty(),
            outstanding: inner.outstanding.len(),
        }
    }

    fn check_usable(&self, inner: &Inner) -> Result<(), LocalError> {
        if let Some(cause) = &inner.cause {
            return Err(cause.clone());
        }
        if inner.state < State::Active {
            return Err(LocalError::ConnectionNotValidated);
        }
        Ok(())
    }

    /// Drive transport initialization and the validation exchange. `Ok(true)` once validated.
    fn handshake(&self, inner: &mut Inner, up: &mut Upcalls) -> Result<bool, LocalError> {
        if inner.state == State::Uninitialized {
            let op = transport(&mut inner.transceiver)?.initialize()?;
            if !op.is_empty() {
                self.schedule_timeout(inner, op);
                self.register(inner, op);
                return Ok(false);
            }
            let registered = inner.registered;
            self.unregister(inner, registered);
            self.set_state(inner, State::NotValidated, None, up);
        }

        if self.datagram {
            return Ok(true);
        }

        match self.role {
            Role::Incoming => {
                if inner.validation.is_none() {
                    let mut frame = Frame::control(MessageType::ValidateConnection);
                    frame.prepare(false, self.options.compression_level)?;
                    inner.validation = Some((frame, 0));
                }
                while let Some((frame, written)) = inner.validation.as_mut() {
                    let chunk = frame.chunk(*written);
                    if chunk.is_empty() {
                        break;
                    }
                    let status = transport(&mut inner.transceiver)?.write(chunk)?;
                    match status {
                        IoStatus::Ready(n) if n > 0 => *written += n,
                        _ => {
                            self.schedule_timeout(inner, SocketOperation::WRITE);
                            self.register(inner, SocketOperation::WRITE);
                            return Ok(false);
                        }
                    }
                }
                inner.validation = None;
            }
            Role::Outgoing => {
                if inner.read_buf.len() < HEADER_SIZE {
                    inner.read_buf.resize(HEADER_SIZE, 0);
                }
                while inner.read_pos < HEADER_SIZE {
                    let pos = inner.read_pos;
                    let status = transport(&mut inner.transceiver)?
                        .read(&mut inner.read_buf[pos..HEADER_SIZE])?;
                    match status {
                        IoStatus::Ready(0) => return Err(end_of_stream()),
                        IoStatus::Ready(n) => inner.read_pos += n,
                        IoStatus::WouldBlock => {
                            self.schedule_timeout(inner, SocketOperation::READ);
                            self.register(inner, SocketOperation::READ);
                            return Ok(false);
                        }
                    }
                }
                let header =
                    Header::decode(&inner.read_buf[..HEADER_SIZE], self.options.message_size_max)?;
                inner.read_pos = 0;
                if header.message_type != MessageType::ValidateConnection {
                    return Err(LocalError::ConnectionNotValidated);
                }
                if header.size != HEADER_SIZE {
                    return Err(WireError::IllegalMessageSize {
                        size: header.size as i64,
                    }
                    .into());
                }
            }
        }

        inner.last_activity = Instant::now();
        let registered = inner.registered;
        self.unregister(inner, registered);
        Ok(true)
    }

    fn validated(&self, inner: &mut Inner, up: &mut Upcalls) {
        inner.timers.cancel(TimerSlot::Read);
        inner.timers.cancel(TimerSlot::Write);
        self.set_state(inner, State::Holding, None, up);
        if let Some(callback) = inner.start_callback.take() {
            up.start = Some((callback, Ok(())));
        }
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        state: State,
        cause: Option<LocalError>,
        up: &mut Upcalls,
    ) {
        if let Some(cause) = cause {
            debug_assert!(state >= State::Closing);
            if inner.state >= State::Closed {
                return;
            }
            if inner.cause.is_none() {
                if self.options.warn_connections && !is_orderly(&cause) {
                    tracing::warn!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        %cause,
                        "connection failed"
                    );
                } else {
                    tracing::debug!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        %cause,
                        "connection closing"
                    );
                }
                inner.cause = Some(cause);
            }
        }

        let mut state = state;
        // Nothing to negotiate with a peer that never validated or cannot answer.
        if state == State::Closing && (self.datagram || inner.state < State::Active) {
            state = State::Closed;
        }
        if inner.state == state {
            return;
        }

        match state {
            State::Uninitialized => return,
            State::NotValidated => {
                if inner.state != State::Uninitialized {
                    return;
                }
            }
            State::Active => {
                if !matches!(inner.state, State::Holding | State::NotValidated) {
                    return;
                }
                self.register(inner, SocketOperation::READ);
            }
            State::Holding => {
                if !matches!(inner.state, State::Active | State::NotValidated) {
                    return;
                }
                if inner.state == State::Active {
                    self.unregister(inner, SocketOperation::READ);
                }
            }
            State::Closing | State::ClosingPending => {
                if inner.state >= state {
                    return;
                }
                if inner.state == State::Holding {
                    self.register(inner, SocketOperation::READ);
                }
                if inner.timers.close.is_none() {
                    self.arm(inner, TimerSlot::Close, self.options.close_timeout);
                }
            }
            State::Closed => {
                if inner.state == State::Finished {
                    return;
                }
                let cause = inner.cause.clone().unwrap_or_else(end_of_stream);
                inner.cause.get_or_insert_with(|| cause.clone());
                inner.batch.destroy(cause.clone());
                self.fail_pending(inner, &cause, up);
                inner.timers.cancel_all();
                inner.validation = None;
                if let Some(callback) = inner.start_callback.take() {
                    up.start = Some((callback, Err(cause.clone())));
                }
                inner.registered = SocketOperation::NONE;
                if let Some(handler) = self.handler() {
                    let close_now = matches!(cause, LocalError::ManuallyClosed { graceful: false });
                    self.reactor.finish(handler, close_now);
                }
            }
            State::Finished => {
                debug_assert_eq!(inner.state, State::Closed);
                debug_assert_eq!(inner.dispatch_count, 0);
                debug_assert!(inner.transport_released);
                debug_assert!(inner.write_queue.is_empty());
                debug_assert!(inner.outstanding.is_empty());
            }
        }

        if let Some(monitor) = &self.monitor {
            if state == State::Active {
                if let Some(this) = self.this.upgrade() {
                    monitor.add(&this);
                }
            } else if inner.state == State::Active {
                monitor.remove(&self.this);
            }
        }

        tracing::debug!(
            target = "strand.rpc.connection",
            connection = %self.description,
            from = ?inner.state,
            to = ?state,
            "state change"
        );
        inner.state = state;
        self.cond.notify_all();

        if inner.state == State::Closing && inner.dispatch_count == 0 {
            if let Err(cause) = self.initiate_shutdown(inner, up) {
                self.set_state(inner, State::Closed, Some(cause), up);
            }
        }
    }

    /// Fail every queued and outstanding request with `cause`.
    fn fail_pending(&self, inner: &mut Inner, cause: &LocalError, up: &mut Upcalls) {
        for message in inner.write_queue.drain(..) {
            if message.request_id == 0 {
                continue;
            }
            if let Some(pending) = inner.outstanding.cancel(message.request_id) {
                let error =
                    InvocationError::classify(cause.clone(), message.written > 0, pending.idempotent);
                up.failures.push((pending.handle, error));
            }
        }
        for (_, pending) in inner.outstanding.fail_all() {
            let error = InvocationError::classify(cause.clone(), true, pending.idempotent);
            up.failures.push((pending.handle, error));
        }
    }

    /// Queue the close message once no dispatch is running.
    fn initiate_shutdown(&self, inner: &mut Inner, up: &mut Upcalls) -> Result<(), LocalError> {
        debug_assert_eq!(inner.state, State::Closing);
        debug_assert_eq!(inner.dispatch_count, 0);
        if inner.shutdown_initiated {
            return Ok(());
        }
        inner.shutdown_initiated = true;

        let message = OutgoingMessage::new(Frame::control(MessageType::CloseConnection), false);
        self.send_message(inner, message, up)
            .map(|_| ())
            .map_err(|(cause, _)| cause)
    }

    fn close_message_sent(&self, inner: &mut Inner, up: &mut Upcalls) -> Result<(), LocalError> {
        self.set_state(inner, State::ClosingPending, None, up);
        if inner.state >= State::Closed {
            return Ok(());
        }
        let cause = inner
            .cause
            .clone()
            .unwrap_or(LocalError::ManuallyClosed { graceful: true });
        let op = transport(&mut inner.transceiver)?.closing(true, &cause);
        if op.is_empty() {
            self.set_state(inner, State::Closed, None, up);
        } else {
            self.register(inner, op);
        }
        Ok(())
    }

    /// Write `message` now if nothing is queued ahead of it, else queue it behind the others.
    ///
    /// On failure, returns the cause and how many bytes of the message reached the transport.
    fn send_message(
        &self,
        inner: &mut Inner,
        mut message: OutgoingMessage<'_>,
        up: &mut Upcalls,
    ) -> Result<SendStatus, (LocalError, usize)> {
        if inner.state >= State::ClosingPending {
            let cause = inner.cause.clone().unwrap_or_else(end_of_stream);
            return Err((cause, 0));
        }
        if !inner.write_queue.is_empty() {
            inner.write_queue.push_back(message.adopt());
            return Ok(SendStatus::Queued);
        }

        message
            .prepare(self.options.compression_level)
            .map_err(|err| (LocalError::from(err), 0))?;
        let written = match transport(&mut inner.transceiver) {
            Ok(transceiver) => write_message(transceiver, &mut message),
            Err(cause) => Err(cause),
        };
        let written = match written {
            Ok(written) => written,
            Err(cause) => return Err((cause, message.written)),
        };
        if written > 0 && !message.is_heartbeat() {
            inner.last_activity = Instant::now();
        }

        if message.is_done() {
            let written = message.written;
            self.message_written(inner, message, up)
                .map_err(|cause| (cause, written))?;
            return Ok(SendStatus::Sent);
        }

        inner.write_queue.push_back(message.adopt());
        self.register(inner, SocketOperation::WRITE);
        self.schedule_timeout(inner, SocketOperation::WRITE);
        Ok(SendStatus::Queued)
    }

    fn message_written(
        &self,
        inner: &mut Inner,
        message: OutgoingMessage<'_>,
        up: &mut Upcalls,
    ) -> Result<(), LocalError> {
        if !message.is_heartbeat() {
            inner.last_activity = Instant::now();
        }
        let close = message.message_type() == MessageType::CloseConnection;
        if let Some(handle) = message.handle {
            up.sent.push(handle);
        }
        if close {
            self.close_message_sent(inner, up)?;
        }
        Ok(())
    }

    /// Continue writing queued messages in order.
    fn flush_queue(&self, inner: &mut Inner, up: &mut Upcalls) -> Result<(), LocalError> {
        while inner.state < State::Closed {
            let Some(message) = inner.write_queue.front_mut() else {
                break;
            };
            message.prepare(self.options.compression_level)?;
            let written = write_message(transport(&mut inner.transceiver)?, message)?;
            if written > 0 && !message.is_heartbeat() {
                inner.last_activity = Instant::now();
            }
            if !message.is_done() {
                self.schedule_timeout(inner, SocketOperation::WRITE);
                return Ok(());
            }
            if let Some(message) = inner.write_queue.pop_front() {
                self.message_written(inner, message, up)?;
            }
        }

        if inner.write_queue.is_empty() {
            self.unregister(inner, SocketOperation::WRITE);
            inner.timers.cancel(TimerSlot::Write);
        }
        Ok(())
    }

    fn process_io(
        &self,
        inner: &mut Inner,
        ready: SocketOperation,
        up: &mut Upcalls,
    ) -> Result<(), LocalError> {
        if ready.contains(SocketOperation::WRITE) {
            self.flush_queue(inner, up)?;
        }
        if ready.contains(SocketOperation::READ) {
            if self.datagram {
                self.read_datagrams(inner, up)?;
            } else {
                self.read_messages(inner, up)?;
            }
        }
        Ok(())
    }

    fn can_read(inner: &Inner) -> bool {
        inner.state != State::Holding && inner.state < State::Closed
    }

    fn read_messages(&self, inner: &mut Inner, up: &mut Upcalls) -> Result<(), LocalError> {
        let max = self.options.message_size_max;
        while Self::can_read(inner) {
            let target = inner.read_header.map_or(HEADER_SIZE, |header| header.size);
            if inner.read_buf.len() < target {
                let additional = target - inner.read_buf.len();
                inner
                    .read_buf
                    .try_reserve_exact(additional)
                    .map_err(|_| WireError::MemoryLimit { size: target, max })?;
                inner.read_buf.resize(target, 0);
            }

            while inner.read_pos < target {
                let pos = inner.read_pos;
                let status =
                    transport(&mut inner.transceiver)?.read(&mut inner.read_buf[pos..target])?;
                match status {
                    IoStatus::Ready(0) => return Err(end_of_stream()),
                    IoStatus::Ready(n) => {
                        inner.read_pos += n;
                        inner.last_activity = Instant::now();
                    }
                    IoStatus::WouldBlock => {
                        if inner.read_pos > 0 && inner.state < State::Closing {
                            self.schedule_timeout(inner, SocketOperation::READ);
                        }
                        return Ok(());
                    }
                }
            }

            let header = match inner.read_header.take() {
                Some(header) => header,
                None => {
                    let header = Header::decode(&inner.read_buf[..HEADER_SIZE], max)?;
                    if header.size > HEADER_SIZE {
                        inner.read_header = Some(header);
                        continue;
                    }
                    header
                }
            };
            let body = decode_body(&header, &inner.read_buf[HEADER_SIZE..header.size], max)?;
            inner.read_pos = 0;
            if inner.read_buf.capacity() > READ_BUFFER_RETAIN {
                inner.read_buf.truncate(HEADER_SIZE);
                inner.read_buf.shrink_to(READ_BUFFER_RETAIN);
            }
            inner.timers.cancel(TimerSlot::Read);
            self.parse_message(inner, header, Bytes::from(body), up)?;
        }
        Ok(())
    }

    /// Each read yields one datagram. Malformed datagrams are dropped without closing.
    fn read_datagrams(&self, inner: &mut Inner, up: &mut Upcalls) -> Result<(), LocalError> {
        let max = self.options.message_size_max;
        while Self::can_read(inner) {
            if inner.read_buf.len() < max {
                inner.read_buf.resize(max, 0);
            }
            let status = transport(&mut inner.transceiver)?.read(&mut inner.read_buf[..max])?;
            let n = match status {
                IoStatus::WouldBlock => return Ok(()),
                IoStatus::Ready(n) => n,
            };
            inner.last_activity = Instant::now();

            let parsed = decode_datagram(&inner.read_buf[..n], max)
                .map_err(LocalError::from)
                .and_then(|(header, body)| self.parse_message(inner, header, body, up));
            if let Err(err) = parsed {
                if self.options.warn_datagrams {
                    tracing::warn!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        %err,
                        "dropping malformed datagram"
                    );
                } else {
                    tracing::debug!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        %err,
                        "dropping malformed datagram"
                    );
                }
            }
        }
        Ok(())
    }

    fn parse_message(
        &self,
        inner: &mut Inner,
        header: Header,
        body: Bytes,
        up: &mut Upcalls,
    ) -> Result<(), LocalError> {
        match header.message_type {
            MessageType::CloseConnection => {
                if self.datagram {
                    tracing::warn!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        "ignoring close connection message on a datagram connection"
                    );
                    return Ok(());
                }
                self.set_state(
                    inner,
                    State::ClosingPending,
                    Some(LocalError::ClosedByPeer),
                    up,
                );
                if inner.state >= State::Closed {
                    return Ok(());
                }
                let cause = inner.cause.clone().unwrap_or(LocalError::ClosedByPeer);
                let op = transport(&mut inner.transceiver)?.closing(false, &cause);
                if op.is_empty() {
                    self.set_state(inner, State::Closed, Some(LocalError::ClosedByPeer), up);
                } else {
                    self.register(inner, op);
                }
            }
            MessageType::Request => {
                if inner.state >= State::Closing {
                    tracing::trace!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        "ignoring request received while closing"
                    );
                    return Ok(());
                }
                let mut stream = InputStream::new(body);
                let request_id = stream.read_i32()?;
                inner.dispatch_count += 1;
                up.dispatches.push(Dispatch {
                    request_id,
                    count: 1,
                    stream,
                    dispatcher: inner.dispatcher.clone(),
                });
            }
            MessageType::RequestBatch => {
                if inner.state >= State::Closing {
                    tracing::trace!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        "ignoring batch received while closing"
                    );
                    return Ok(());
                }
                let mut stream = InputStream::new(body);
                let count = stream.read_i32()?;
                if count < 0 {
                    return Err(WireError::NegativeSize { size: count }.into());
                }
                // Every batched request takes at least one byte.
                if count as usize > stream.remaining() {
                    return Err(WireError::Truncated {
                        needed: count as usize,
                        have: stream.remaining(),
                    }
                    .into());
                }
                if count > 0 {
                    inner.dispatch_count += count as usize;
                    up.dispatches.push(Dispatch {
                        request_id: 0,
                        count,
                        stream,
                        dispatcher: inner.dispatcher.clone(),
                    });
                }
            }
            MessageType::Reply => {
                let mut stream = InputStream::new(body);
                let request_id = stream.read_i32()?;
                match inner.outstanding.complete_and_remove(request_id) {
                    Some(pending) => {
                        up.replies.push((pending.handle, stream.rest()));
                        if inner.outstanding.is_empty() {
                            self.cond.notify_all();
                        }
                    }
                    None => tracing::trace!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        request_id,
                        "dropping reply for an unknown or canceled request"
                    ),
                }
            }
            MessageType::ValidateConnection => {
                if let Some(callback) = &inner.heartbeat_callback {
                    up.heartbeat = Some(callback.clone());
                }
            }
        }
        Ok(())
    }

    /// Called by a [`Responder`] once its dispatch is done, with the reply to send if any.
    pub(crate) fn dispatch_finished(&self, reply: Option<Frame<'_>>, compress: bool) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            if let Some(frame) = reply {
                if inner.state < State::Closed {
                    let message = OutgoingMessage::new(frame, compress);
                    if let Err((cause, _)) = self.send_message(&mut inner, message, &mut up) {
                        self.set_state(&mut inner, State::Closed, Some(cause), &mut up);
                    }
                }
            }
            self.release_dispatches(&mut inner, 1, &mut up);
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    /// A batch ran out of data before its declared count: close and release the rest.
    fn abandon_batch(&self, undispatched: usize) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            let cause = WireError::Truncated {
                needed: undispatched,
                have: 0,
            };
            self.set_state(&mut inner, State::Closed, Some(cause.into()), &mut up);
            self.release_dispatches(&mut inner, undispatched, &mut up);
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    fn release_dispatches(&self, inner: &mut Inner, n: usize, up: &mut Upcalls) {
        debug_assert!(inner.dispatch_count >= n);
        inner.dispatch_count = inner.dispatch_count.saturating_sub(n);
        if inner.dispatch_count > 0 {
            return;
        }
        self.cond.notify_all();
        if inner.state == State::Closing {
            if let Err(cause) = self.initiate_shutdown(inner, up) {
                self.set_state(inner, State::Closed, Some(cause), up);
            }
        }
    }

    /// Account for pending upcalls and finish the connection if nothing is left.
    fn settle(&self, inner: &mut Inner, up: &mut Upcalls) {
        if up.needs_count() && !up.counted {
            inner.dispatch_count += 1;
            up.counted = true;
        }
        if inner.state == State::Closed && inner.transport_released && inner.dispatch_count == 0 {
            self.set_state(inner, State::Finished, None, up);
        }
    }

    fn run_upcalls(&self, up: Upcalls) {
        let Upcalls {
            start,
            sent,
            replies,
            failures,
            dispatches,
            heartbeat,
            close,
            counted,
        } = up;
        let this = self.this.upgrade();

        if let Some((callback, result)) = start {
            if let Some(this) = &this {
                callback(this, result);
            }
        }
        for handle in sent {
            handle.sent();
        }
        for (handle, reply) in replies {
            handle.completed(reply);
        }
        for (handle, error) in failures {
            handle.failed(error);
        }
        for dispatch in dispatches {
            self.run_dispatch(this.as_ref(), dispatch);
        }
        if let Some(callback) = heartbeat {
            callback(self);
        }
        if let Some(callback) = close {
            callback(self);
        }
        if counted {
            self.dispatch_finished(None, false);
        }
    }

    fn run_dispatch(&self, this: Option<&Arc<Connection>>, dispatch: Dispatch) {
        let Dispatch {
            request_id,
            count,
            mut stream,
            dispatcher,
        } = dispatch;

        for index in 0..count {
            let Some(this) = this else {
                self.dispatch_finished(None, false);
                continue;
            };
            match &dispatcher {
                Some(dispatcher) if index == 0 || !stream.is_empty() => {
                    dispatcher.dispatch(&mut stream, Responder::new(this.clone(), request_id))
                }
                Some(_) => {
                    tracing::debug!(
                        target = "strand.rpc.connection",
                        connection = %self.description,
                        declared = count,
                        dispatched = index,
                        "batch ended before its declared request count"
                    );
                    self.abandon_batch((count - index) as usize);
                    return;
                }
                None => {
                    let responder = Responder::new(this.clone(), request_id);
                    if request_id == 0 {
                        tracing::debug!(
                            target = "strand.rpc.connection",
                            connection = %self.description,
                            "dropping one-way request: no dispatcher"
                        );
                    }
                    responder.send_error(ReplyStatus::ObjectNotExist, "no dispatcher");
                }
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.this
            .upgrade()
            .map(|connection| connection as Arc<dyn EventHandler>)
    }

    fn register(&self, inner: &mut Inner, op: SocketOperation) {
        let missing = op.without(inner.registered);
        if missing.is_empty() || inner.state >= State::Closed {
            return;
        }
        inner.registered |= missing;
        if let Some(handler) = self.handler() {
            self.reactor.register(handler, missing);
        }
    }

    fn unregister(&self, inner: &mut Inner, op: SocketOperation) {
        let present = op.intersection(inner.registered);
        if present.is_empty() {
            return;
        }
        inner.registered = inner.registered.without(present);
        if let Some(handler) = self.handler() {
            self.reactor.unregister(handler, present);
        }
    }

    /// Arm the read or write timeout that applies in the current state.
    fn schedule_timeout(&self, inner: &mut Inner, op: SocketOperation) {
        let timeout = if inner.state < State::Active {
            self.options.connect_timeout
        } else if inner.state < State::Closing {
            self.options.timeout
        } else {
            self.options.close_timeout
        };
        if op.intersects(SocketOperation::READ | SocketOperation::CONNECT) {
            self.arm(inner, TimerSlot::Read, timeout);
        }
        if op.contains(SocketOperation::WRITE) {
            self.arm(inner, TimerSlot::Write, timeout);
        }
    }

    fn arm(&self, inner: &mut Inner, slot: TimerSlot, timeout: Option<Duration>) {
        inner.timers.cancel(slot);
        let Some(delay) = timeout else {
            return;
        };
        inner.timers.generation += 1;
        let generation = inner.timers.generation;
        let this = self.this.clone();
        let token = self.timer.schedule(
            delay,
            Box::new(move || {
                if let Some(connection) = this.upgrade() {
                    connection.timed_out(slot, generation);
                }
            }),
        );
        *inner.timers.slot_mut(slot) = Some((generation, token));
    }

    fn timed_out(&self, slot: TimerSlot, generation: u64) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            if !inner.timers.take_if_current(slot, generation) {
                return;
            }
            let Some(cause) = timeout_cause(inner.state) else {
                return;
            };
            tracing::debug!(
                target = "strand.rpc.connection",
                connection = %self.description,
                ?slot,
                %cause,
                "timeout"
            );
            self.set_state(&mut inner, State::Closed, Some(cause), &mut up);
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }
}

impl EventHandler for Connection {
    fn message(&self, ready: SocketOperation) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            if inner.state >= State::Closed {
                return;
            }
            let result = if inner.state < State::Active {
                match self.handshake(&mut inner, &mut up) {
                    Ok(true) => {
                        self.validated(&mut inner, &mut up);
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(cause) => Err(cause),
                }
            } else {
                self.process_io(&mut inner, ready, &mut up)
            };
            if let Err(cause) = result {
                self.set_state(&mut inner, State::Closed, Some(cause), &mut up);
            }
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    fn finished(&self, close_now: bool) {
        let mut up = Upcalls::default();
        {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.state, State::Closed);
            if let Some(mut transceiver) = inner.transceiver.take() {
                transceiver.close();
            }
            inner.transport_released = true;
            inner.timers.cancel_all();
            up.close = inner.close_callback.take();
            tracing::debug!(
                target = "strand.rpc.connection",
                connection = %self.description,
                close_now,
                "transport released"
            );
            self.settle(&mut inner, &mut up);
        }
        self.run_upcalls(up);
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn readiness(&self) -> Option<Arc<dyn Readiness>> {
        self.readiness.clone()
    }
}

/// Answers one dispatched request.
///
/// Dropping a responder without answering a two-way request sends an `UnknownException`
/// reply.
pub struct Responder {
    connection: Arc<Connection>,
    request_id: i32,
    compress: bool,
    answered: bool,
}

impl Responder {
    pub(crate) fn new(connection: Arc<Connection>, request_id: i32) -> Self {
        Self {
            connection,
            request_id,
            compress: false,
            answered: false,
        }
    }

    /// 0 for one-way and batched requests.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn set_compress(&mut self, compress: bool) {
        self.compress = compress;
    }

    /// Send `payload` (reply status byte first). One-way requests just complete.
    pub fn send(mut self, payload: &[u8]) {
        self.answer(Some(payload));
    }

    pub fn send_error(self, status: ReplyStatus, message: &str) {
        let payload = encode_error_reply(status, message);
        self.send(&payload);
    }

    /// Complete without replying.
    pub fn discard(mut self) {
        self.answer(None);
    }

    fn answer(&mut self, payload: Option<&[u8]>) {
        self.answered = true;
        let frame = match payload {
            Some(payload) if !self.is_oneway() => Some(Frame::reply(self.request_id, payload)),
            _ => None,
        };
        self.connection.dispatch_finished(frame, self.compress);
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("connection", &self.connection.description)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        if self.is_oneway() {
            self.answer(None);
        } else {
            let payload = encode_error_reply(
                ReplyStatus::UnknownException,
                "request dropped without a reply",
            );
            self.answer(Some(&payload));
        }
    }
}
