use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strand_proto::{Frame, InputStream, MessageType, ReplyStatus, DEFAULT_MESSAGE_SIZE_MAX};
use strand_rpc::mock::{split_messages, ManualTimer, MockHandle, MockReactor, MockTransceiver};
use strand_rpc::{CloseMode, Responder};
use tokio_util::sync::CancellationToken;

use super::*;

#[derive(Default)]
struct AcceptorState {
    pending: VecDeque<Box<dyn Transceiver>>,
    listen_failures: usize,
    listen_calls: usize,
    closed: bool,
}

#[derive(Clone, Default)]
struct AcceptorHandle(Arc<Mutex<AcceptorState>>);

impl AcceptorHandle {
    fn push(&self, transceiver: MockTransceiver) {
        self.0.lock().pending.push_back(Box::new(transceiver));
    }

    fn fail_listens(&self, count: usize) {
        self.0.lock().listen_failures = count;
    }

    fn listen_calls(&self) -> usize {
        self.0.lock().listen_calls
    }

    fn is_closed(&self) -> bool {
        self.0.lock().closed
    }
}

struct MockAcceptor(AcceptorHandle);

impl Acceptor for MockAcceptor {
    fn listen(&mut self) -> Result<(), LocalError> {
        let mut state = self.0 .0.lock();
        state.listen_calls += 1;
        if state.listen_failures > 0 {
            state.listen_failures -= 1;
            return Err(LocalError::ConnectionLost {
                message: "address in use".to_string(),
            });
        }
        Ok(())
    }

    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>, LocalError> {
        Ok(self.0 .0.lock().pending.pop_front())
    }

    fn close(&mut self) {
        self.0 .0.lock().closed = true;
    }

    fn description(&self) -> String {
        "mock-acceptor".to_string()
    }
}

struct Harness {
    reactor: Arc<MockReactor>,
    timer: Arc<ManualTimer>,
    acceptor: AcceptorHandle,
    listener: Arc<Listener>,
    peers: usize,
}

impl Harness {
    fn new(max_connections: usize) -> Self {
        let reactor = MockReactor::new();
        let timer = ManualTimer::new();
        let acceptor = AcceptorHandle::default();
        let listener = Listener::new(
            "test",
            Box::new(MockAcceptor(acceptor.clone())),
            ListenerOptions {
                max_connections,
                retry_interval: Duration::from_secs(1),
            },
            ConnectionContext::new(reactor.clone(), timer.clone()),
        );
        Self {
            reactor,
            timer,
            acceptor,
            listener,
            peers: 0,
        }
    }

    /// Listening and active.
    fn active(max_connections: usize) -> Self {
        let harness = Self::new(max_connections);
        harness.listener.start_accepting();
        harness.listener.activate();
        harness
    }

    /// Queue one incoming transport and let the listener accept it.
    fn connect(&mut self) -> MockHandle {
        self.peers += 1;
        let (transceiver, handle) = MockTransceiver::pair(format!("peer-{}", self.peers));
        self.acceptor.push(transceiver);
        self.listener.message(SocketOperation::READ);
        handle
    }

    fn interest(&self) -> SocketOperation {
        self.reactor.interest(&*self.listener)
    }
}

#[test]
fn connections_beyond_the_limit_are_closed_before_becoming_connections() {
    let mut harness = Harness::active(2);
    assert_eq!(harness.interest(), SocketOperation::READ);

    let first = harness.connect();
    let second = harness.connect();
    let third = harness.connect();

    let connections = harness.listener.connections();
    assert_eq!(connections.len(), 2);
    assert!(connections
        .iter()
        .all(|connection| connection.state() == State::Active));
    assert!(!first.is_closed());
    assert!(!second.is_closed());
    assert!(!first.take_outbound().is_empty(), "validation sent");
    assert!(third.is_closed());
    assert!(third.take_outbound().is_empty());

    // A finished connection frees its slot.
    connections[0].close(CloseMode::Forcefully);
    harness.reactor.run_pending();
    assert_eq!(connections[0].state(), State::Finished);

    let fourth = harness.connect();
    assert!(!fourth.is_closed());
    assert_eq!(harness.listener.connections().len(), 2);
}

#[test]
fn unbounded_listener_accepts_everything() {
    let mut harness = Harness::active(0);
    let peers: Vec<_> = (0..5).map(|_| harness.connect()).collect();
    assert_eq!(harness.listener.connections().len(), 5);
    assert!(peers.iter().all(|peer| !peer.is_closed()));
}

#[test]
fn nothing_is_accepted_while_holding() {
    let mut harness = Harness::new(0);
    harness.listener.start_accepting();
    assert_eq!(harness.listener.state(), ListenerState::Holding);
    assert_eq!(harness.interest(), SocketOperation::NONE);

    let peer = harness.connect();
    assert!(harness.listener.connections().is_empty());
    assert!(!peer.is_closed());

    harness.listener.activate();
    assert_eq!(harness.interest(), SocketOperation::READ);
    harness.listener.message(SocketOperation::READ);
    assert_eq!(harness.listener.connections().len(), 1);
}

#[test]
fn hold_and_activate_fan_out_to_connections() {
    let mut harness = Harness::active(0);
    harness.connect();
    let connection = harness.listener.connections().remove(0);
    assert_eq!(connection.state(), State::Active);

    harness.listener.hold();
    assert_eq!(harness.listener.state(), ListenerState::Holding);
    assert_eq!(harness.interest(), SocketOperation::NONE);
    assert_eq!(connection.state(), State::Holding);
    assert_eq!(
        harness.listener.wait_until_holding(&CancellationToken::new()),
        Ok(())
    );

    harness.listener.activate();
    assert_eq!(harness.interest(), SocketOperation::READ);
    assert_eq!(connection.state(), State::Active);
}

#[test]
fn failed_listen_is_retried_on_the_timer() {
    let harness = Harness::new(0);
    harness.acceptor.fail_listens(2);

    harness.listener.start_accepting();
    assert!(!harness.listener.is_listening());
    assert_eq!(harness.timer.pending(), 1);

    // A second attempt fails too but does not stack another retry.
    harness.listener.start_accepting();
    assert_eq!(harness.acceptor.listen_calls(), 2);
    assert_eq!(harness.timer.pending(), 1);

    harness.listener.activate();
    assert_eq!(harness.interest(), SocketOperation::NONE);

    harness.timer.advance(Duration::from_secs(1));
    assert_eq!(harness.acceptor.listen_calls(), 3);
    assert!(harness.listener.is_listening());
    assert_eq!(harness.timer.pending(), 0);
    assert_eq!(harness.interest(), SocketOperation::READ);

    harness.listener.start_accepting();
    assert_eq!(harness.acceptor.listen_calls(), 3);
}

#[test]
fn destroy_cancels_a_pending_listen_retry() {
    let harness = Harness::new(0);
    harness.acceptor.fail_listens(1);
    harness.listener.start_accepting();
    assert_eq!(harness.timer.pending(), 1);

    harness.listener.destroy();
    assert_eq!(harness.timer.pending(), 0);
    assert_eq!(harness.listener.state(), ListenerState::Finished);
    assert!(harness.acceptor.is_closed());
    assert_eq!(harness.reactor.finish_calls(), 0);
}

#[test]
fn destroy_closes_connections_and_finishes_after_the_acceptor_is_released() {
    let mut harness = Harness::active(0);
    let peer = harness.connect();
    let connection = harness.listener.connections().remove(0);
    peer.take_outbound();

    harness.listener.destroy();
    assert_eq!(harness.listener.state(), ListenerState::Closed);
    assert!(!harness.acceptor.is_closed());
    assert!(connection.state() >= State::Closing);
    assert_eq!(connection.cause(), Some(LocalError::AdapterDeactivated));
    let sent = split_messages(&peer.take_outbound(), DEFAULT_MESSAGE_SIZE_MAX).expect("outbound");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.message_type, MessageType::CloseConnection);

    harness.reactor.run_pending();
    assert_eq!(harness.listener.state(), ListenerState::Finished);
    assert!(harness.acceptor.is_closed());

    // The peer answers the close by closing its end.
    peer.close_inbound();
    connection.message(SocketOperation::READ);
    harness.reactor.run_pending();
    assert_eq!(connection.state(), State::Finished);
    assert!(peer.is_closed());

    assert_eq!(
        harness.listener.wait_until_finished(&CancellationToken::new()),
        Ok(())
    );
    assert!(harness.listener.connections().is_empty());

    harness.listener.activate();
    assert_eq!(harness.listener.state(), ListenerState::Finished);
}

#[test]
fn interrupted_wait_aborts_remaining_connections() {
    let mut harness = Harness::active(0);
    harness.connect();
    let connection = harness.listener.connections().remove(0);

    harness.listener.destroy();
    harness.reactor.run_pending();
    assert_eq!(harness.listener.state(), ListenerState::Finished);
    assert!(connection.state() < State::Closed);

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(
        harness.listener.wait_until_finished(&cancel),
        Err(LocalError::Interrupted)
    );
    assert!(connection.state() >= State::Closed);

    harness.reactor.run_pending();
    assert_eq!(connection.state(), State::Finished);
    assert_eq!(
        harness.listener.wait_until_finished(&CancellationToken::new()),
        Ok(())
    );
}

#[test]
fn wait_until_holding_is_interruptible() {
    let harness = Harness::active(0);
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(
        harness.listener.wait_until_holding(&cancel),
        Err(LocalError::Interrupted)
    );
}

#[test]
fn accepted_connections_use_the_listener_dispatcher() {
    let mut harness = Harness::active(0);
    harness
        .listener
        .set_dispatcher(Arc::new(|request: &mut InputStream, responder: Responder| {
            let mut reply = vec![ReplyStatus::Ok.byte()];
            reply.extend_from_slice(&request.rest());
            responder.send(&reply);
        }));

    let peer = harness.connect();
    let connection = harness.listener.connections().remove(0);
    peer.take_outbound();

    let mut request = Frame::request(5, b"ping".to_vec());
    request.prepare(false, 1).expect("prepare");
    peer.push_inbound(&request.to_vec());
    connection.message(SocketOperation::READ);

    let sent = split_messages(&peer.take_outbound(), DEFAULT_MESSAGE_SIZE_MAX).expect("outbound");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.message_type, MessageType::Reply);
    assert_eq!(sent[0].1, [5, 0, 0, 0, 0, b'p', b'i', b'n', b'g']);
}

#[test]
fn datagram_listener_owns_one_connection() {
    let reactor = MockReactor::new();
    let timer = ManualTimer::new();
    let (transceiver, handle) = MockTransceiver::datagram("mock-udp");
    let listener = Listener::datagram(
        "udp",
        Box::new(transceiver),
        ConnectionContext::new(reactor.clone(), timer),
    );

    let connections = listener.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].state(), State::Holding);

    listener.start_accepting();
    assert!(!listener.is_listening());

    listener.activate();
    assert_eq!(connections[0].state(), State::Active);
    assert_eq!(reactor.interest(&*connections[0]), SocketOperation::READ);

    listener.destroy();
    assert_eq!(listener.state(), ListenerState::Finished);
    assert_eq!(connections[0].state(), State::Closed);

    reactor.run_pending();
    assert_eq!(connections[0].state(), State::Finished);
    assert!(handle.is_closed());
    assert_eq!(listener.wait_until_finished(&CancellationToken::new()), Ok(()));
}
