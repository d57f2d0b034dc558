//! Deterministic in-memory transport, reactor and timer.
//!
//! Nothing here runs on its own: tests push bytes with [`MockHandle`], deliver readiness by
//! calling [`EventHandler::message`], complete `finish` requests with
//! [`MockReactor::run_pending`] and move time with [`ManualTimer::advance`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use strand_proto::{decode_message, Header, WireError};

use crate::{
    EventHandler, InvocationError, IoStatus, LocalError, Reactor, ReplyHandler, SocketOperation,
    Timer, TimerTask, TimerToken, Transceiver,
};

#[derive(Default)]
struct Wire {
    inbound: VecDeque<u8>,
    datagrams: VecDeque<Vec<u8>>,
    outbound: Vec<u8>,
    write_budget: Option<usize>,
    write_error: Option<LocalError>,
    eof: bool,
    closed: bool,
    initialize_ops: VecDeque<SocketOperation>,
    initialize_calls: usize,
    closing_calls: Vec<bool>,
}

/// The connection's end of a mock transport.
pub struct MockTransceiver {
    wire: Arc<Mutex<Wire>>,
    description: String,
    datagram: bool,
}

/// The test's end of a mock transport.
#[derive(Clone)]
pub struct MockHandle {
    wire: Arc<Mutex<Wire>>,
}

impl MockTransceiver {
    pub fn pair(description: impl Into<String>) -> (MockTransceiver, MockHandle) {
        Self::build(description.into(), false)
    }

    pub fn datagram(description: impl Into<String>) -> (MockTransceiver, MockHandle) {
        Self::build(description.into(), true)
    }

    fn build(description: String, datagram: bool) -> (MockTransceiver, MockHandle) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        (
            MockTransceiver {
                wire: wire.clone(),
                description,
                datagram,
            },
            MockHandle { wire },
        )
    }
}

impl Transceiver for MockTransceiver {
    fn initialize(&mut self) -> Result<SocketOperation, LocalError> {
        let mut wire = self.wire.lock();
        wire.initialize_calls += 1;
        Ok(wire.initialize_ops.pop_front().unwrap_or(SocketOperation::NONE))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<IoStatus, LocalError> {
        let mut wire = self.wire.lock();
        if self.datagram {
            return Ok(match wire.datagrams.pop_front() {
                Some(datagram) => {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    IoStatus::Ready(n)
                }
                None => IoStatus::WouldBlock,
            });
        }

        if wire.inbound.is_empty() {
            return Ok(if wire.eof {
                IoStatus::Ready(0)
            } else {
                IoStatus::WouldBlock
            });
        }
        let n = wire.inbound.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(wire.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(IoStatus::Ready(n))
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoStatus, LocalError> {
        let mut wire = self.wire.lock();
        if let Some(err) = &wire.write_error {
            return Err(err.clone());
        }
        let n = match wire.write_budget {
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if n == 0 {
            return Ok(IoStatus::WouldBlock);
        }
        if let Some(budget) = wire.write_budget.as_mut() {
            *budget -= n;
        }
        wire.outbound.extend_from_slice(&buf[..n]);
        Ok(IoStatus::Ready(n))
    }

    fn closing(&mut self, initiator: bool, _cause: &LocalError) -> SocketOperation {
        self.wire.lock().closing_calls.push(initiator);
        // The initiator waits for the peer to close its end.
        if initiator {
            SocketOperation::READ
        } else {
            SocketOperation::NONE
        }
    }

    fn close(&mut self) {
        self.wire.lock().closed = true;
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}

impl MockHandle {
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.wire.lock().inbound.extend(bytes.iter().copied());
    }

    pub fn push_datagram(&self, datagram: impl Into<Vec<u8>>) {
        self.wire.lock().datagrams.push_back(datagram.into());
    }

    /// Everything written since the last call.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.wire.lock().outbound)
    }

    /// Limit how many more bytes writes accept; `None` lifts the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.wire.lock().write_budget = budget;
    }

    pub fn fail_writes(&self, error: LocalError) {
        self.wire.lock().write_error = Some(error);
    }

    /// Reads report end of stream once the inbound buffer is drained.
    pub fn close_inbound(&self) {
        self.wire.lock().eof = true;
    }

    /// Make the next `initialize` call report that it must wait for `op`.
    pub fn push_initialize(&self, op: SocketOperation) {
        self.wire.lock().initialize_ops.push_back(op);
    }

    pub fn is_closed(&self) -> bool {
        self.wire.lock().closed
    }

    pub fn initialize_calls(&self) -> usize {
        self.wire.lock().initialize_calls
    }

    /// The `initiator` flag of every `closing` call.
    pub fn closing_calls(&self) -> Vec<bool> {
        self.wire.lock().closing_calls.clone()
    }
}

/// Split a byte stream into decoded messages.
pub fn split_messages(mut bytes: &[u8], message_size_max: usize) -> Result<Vec<(Header, Vec<u8>)>, WireError> {
    let mut messages = Vec::new();
    while !bytes.is_empty() {
        let (header, body) = decode_message(bytes, message_size_max)?;
        bytes = &bytes[header.size..];
        messages.push((header, body));
    }
    Ok(messages)
}

fn same_handler(a: &dyn EventHandler, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(
        a as *const dyn EventHandler as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Default)]
struct ReactorState {
    interest: Vec<(Arc<dyn EventHandler>, SocketOperation)>,
    pending_finish: Vec<(Arc<dyn EventHandler>, bool)>,
    finish_calls: usize,
}

/// Records interest; never delivers events by itself.
#[derive(Default)]
pub struct MockReactor {
    state: Mutex<ReactorState>,
}

impl MockReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn interest(&self, handler: &dyn EventHandler) -> SocketOperation {
        self.state
            .lock()
            .interest
            .iter()
            .find(|(registered, _)| same_handler(handler, registered))
            .map_or(SocketOperation::NONE, |(_, op)| *op)
    }

    pub fn finish_calls(&self) -> usize {
        self.state.lock().finish_calls
    }

    pub fn pending_finishes(&self) -> usize {
        self.state.lock().pending_finish.len()
    }

    /// Deliver `finished` to every handler that asked to finish.
    pub fn run_pending(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending_finish);
        for (handler, close_now) in pending {
            handler.finished(close_now);
        }
    }
}

impl Reactor for MockReactor {
    fn register(&self, handler: Arc<dyn EventHandler>, op: SocketOperation) {
        let mut state = self.state.lock();
        let existing = state
            .interest
            .iter()
            .position(|(registered, _)| same_handler(&*handler, registered));
        match existing {
            Some(index) => state.interest[index].1 |= op,
            None => state.interest.push((handler, op)),
        }
    }

    fn unregister(&self, handler: Arc<dyn EventHandler>, op: SocketOperation) {
        let mut state = self.state.lock();
        if let Some((_, registered)) = state
            .interest
            .iter_mut()
            .find(|(registered, _)| same_handler(&*handler, registered))
        {
            *registered = registered.without(op);
        }
    }

    fn finish(&self, handler: Arc<dyn EventHandler>, close_now: bool) {
        let mut state = self.state.lock();
        state.finish_calls += 1;
        state
            .interest
            .retain(|(registered, _)| !same_handler(&*handler, registered));
        state.pending_finish.push((handler, close_now));
    }
}

struct ScheduledTask {
    deadline: Duration,
    token: TimerToken,
    task: TimerTask,
}

#[derive(Default)]
struct TimerState {
    now: Duration,
    tasks: Vec<ScheduledTask>,
}

/// A timer driven by [`ManualTimer::advance`].
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<TimerState>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move time forward and run every task that came due, in deadline order.
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut state = self.state.lock();
            state.now += by;
            state.now
        };
        loop {
            let next = {
                let mut state = self.state.lock();
                state.tasks.retain(|scheduled| !scheduled.token.is_cancelled());
                let due = state
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, scheduled)| scheduled.deadline <= now)
                    .min_by_key(|(_, scheduled)| scheduled.deadline)
                    .map(|(index, _)| index);
                due.map(|index| state.tasks.swap_remove(index))
            };
            match next {
                Some(scheduled) => (scheduled.task)(),
                None => break,
            }
        }
    }

    /// Tasks scheduled and not cancelled.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|scheduled| !scheduled.token.is_cancelled())
            .count()
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerToken {
        let token = TimerToken::new();
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        state.tasks.push(ScheduledTask {
            deadline,
            token: token.clone(),
            task,
        });
        token
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    Sent,
    Completed(Bytes),
    Failed(InvocationError),
}

/// A [`ReplyHandler`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingReplyHandler {
    events: Mutex<Vec<ReplyEvent>>,
}

impl RecordingReplyHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ReplyEvent> {
        self.events.lock().clone()
    }

    /// Completions and failures, without `Sent`.
    pub fn outcomes(&self) -> Vec<ReplyEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| **event != ReplyEvent::Sent)
            .cloned()
            .collect()
    }
}

impl ReplyHandler for RecordingReplyHandler {
    fn sent(&self) {
        self.events.lock().push(ReplyEvent::Sent);
    }

    fn completed(&self, reply: Bytes) {
        self.events.lock().push(ReplyEvent::Completed(reply));
    }

    fn failed(&self, error: InvocationError) {
        self.events.lock().push(ReplyEvent::Failed(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_budget_limits_accepted_bytes() {
        let (mut transceiver, handle) = MockTransceiver::pair("mock");
        handle.set_write_budget(Some(3));
        assert_eq!(transceiver.write(b"hello").unwrap(), IoStatus::Ready(3));
        assert_eq!(transceiver.write(b"lo").unwrap(), IoStatus::WouldBlock);
        assert_eq!(handle.take_outbound(), b"hel");
    }

    #[test]
    fn stream_reads_report_eof_after_close() {
        let (mut transceiver, handle) = MockTransceiver::pair("mock");
        let mut buf = [0u8; 4];
        assert_eq!(transceiver.read(&mut buf).unwrap(), IoStatus::WouldBlock);
        handle.push_inbound(b"ab");
        handle.close_inbound();
        assert_eq!(transceiver.read(&mut buf).unwrap(), IoStatus::Ready(2));
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(transceiver.read(&mut buf).unwrap(), IoStatus::Ready(0));
    }

    #[test]
    fn datagram_reads_are_truncated_to_the_buffer() {
        let (mut transceiver, handle) = MockTransceiver::datagram("udp");
        handle.push_datagram(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(transceiver.read(&mut buf).unwrap(), IoStatus::Ready(3));
        assert_eq!(transceiver.read(&mut buf).unwrap(), IoStatus::WouldBlock);
    }

    #[test]
    fn manual_timer_runs_due_tasks_in_order_and_skips_cancelled() {
        let timer = ManualTimer::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, secs) in [("late", 5u64), ("early", 1), ("cancelled", 2)] {
            let log = log.clone();
            let token = timer.schedule(
                Duration::from_secs(secs),
                Box::new(move || log.lock().push(name)),
            );
            if name == "cancelled" {
                token.cancel();
            }
        }
        timer.advance(Duration::from_secs(3));
        assert_eq!(*log.lock(), vec!["early"]);
        assert_eq!(timer.pending(), 1);
        timer.advance(Duration::from_secs(3));
        assert_eq!(*log.lock(), vec!["early", "late"]);
    }
}
