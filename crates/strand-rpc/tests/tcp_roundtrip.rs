use std::sync::Arc;
use std::time::Duration;

use strand_proto::{InputStream, OutputStream, ReplyStatus};
use strand_rpc::tcp::{TcpTransceiver, TokioReactor, TokioTimer};
use strand_rpc::{
    CloseMode, Connection, ConnectionContext, InvocationOptions, LocalError, Responder, Role,
    State,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

fn doubling_dispatcher(request: &mut InputStream, responder: Responder) {
    let value = request.read_i32().unwrap_or_default();
    let mut out = OutputStream::new();
    out.write_u8(ReplyStatus::Ok.byte());
    out.write_i32(value * 2);
    responder.send(out.as_slice());
}

async fn wait_finished(connection: Arc<Connection>) -> Result<(), LocalError> {
    tokio::time::timeout(
        TIMEOUT,
        tokio::task::spawn_blocking(move || {
            connection.wait_until_finished(&CancellationToken::new())
        }),
    )
    .await
    .expect("finished in time")
    .expect("join")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_reply_and_graceful_close_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (client, accepted) = tokio::join!(TcpTransceiver::connect(addr), listener.accept());
    let client = client.expect("connect");
    let (stream, _) = accepted.expect("accept");

    let context = ConnectionContext::new(TokioReactor::current(), TokioTimer::current());

    let server = Connection::new(Box::new(TcpTransceiver::new(stream)), Role::Incoming, &context);
    server.set_dispatcher(Arc::new(doubling_dispatcher));
    server.start(Some(Box::new(
        |connection: &Arc<Connection>, result: Result<(), LocalError>| {
            if result.is_ok() {
                connection.activate();
            }
        },
    )));

    let outgoing = Connection::new(Box::new(client), Role::Outgoing, &context);
    let (started_tx, started_rx) = oneshot::channel();
    outgoing.start(Some(Box::new(
        move |connection: &Arc<Connection>, result: Result<(), LocalError>| {
            if result.is_ok() {
                connection.activate();
            }
            let _ = started_tx.send(result);
        },
    )));
    tokio::time::timeout(TIMEOUT, started_rx)
        .await
        .expect("validated in time")
        .expect("callback")
        .expect("validation");
    assert_eq!(outgoing.state(), State::Active);

    let mut out = OutputStream::new();
    out.write_i32(21);
    let (invocation, reply) = outgoing
        .invoke(out.as_slice(), InvocationOptions::default())
        .expect("invoke");
    assert_eq!(invocation.request_id, 1);

    let reply = tokio::time::timeout(TIMEOUT, reply)
        .await
        .expect("reply in time")
        .expect("reply");
    let mut stream = InputStream::new(reply);
    assert_eq!(stream.read_u8().expect("status"), ReplyStatus::Ok.byte());
    assert_eq!(stream.read_i32().expect("value"), 42);

    outgoing.close(CloseMode::Gracefully);
    assert_eq!(wait_finished(outgoing.clone()).await, Ok(()));
    assert_eq!(wait_finished(server.clone()).await, Ok(()));
    assert_eq!(
        outgoing.cause(),
        Some(LocalError::ManuallyClosed { graceful: true })
    );
    assert_eq!(server.cause(), Some(LocalError::ClosedByPeer));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abrupt_peer_loss_fails_outstanding_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (client, accepted) = tokio::join!(TcpTransceiver::connect(addr), listener.accept());
    let client = client.expect("connect");
    let (stream, _) = accepted.expect("accept");

    let context = ConnectionContext::new(TokioReactor::current(), TokioTimer::current());
    let server = Connection::new(Box::new(TcpTransceiver::new(stream)), Role::Incoming, &context);
    // Never answers: the responder is leaked until the connection goes away.
    let (parked_tx, parked_rx) = std::sync::mpsc::channel::<Responder>();
    let parked_tx = parking_lot::Mutex::new(parked_tx);
    server.set_dispatcher(Arc::new(move |request: &mut InputStream, responder: Responder| {
        request.rest();
        let _ = parked_tx.lock().send(responder);
    }));
    server.start(Some(Box::new(
        |connection: &Arc<Connection>, result: Result<(), LocalError>| {
            if result.is_ok() {
                connection.activate();
            }
        },
    )));

    let outgoing = Connection::new(Box::new(client), Role::Outgoing, &context);
    let (started_tx, started_rx) = oneshot::channel();
    outgoing.start(Some(Box::new(
        move |connection: &Arc<Connection>, result: Result<(), LocalError>| {
            if result.is_ok() {
                connection.activate();
            }
            let _ = started_tx.send(result);
        },
    )));
    tokio::time::timeout(TIMEOUT, started_rx)
        .await
        .expect("validated in time")
        .expect("callback")
        .expect("validation");

    let (_, reply) = outgoing
        .invoke(b"\x01\x00\x00\x00", InvocationOptions::default())
        .expect("invoke");
    let parked = tokio::task::spawn_blocking(move || parked_rx.recv_timeout(TIMEOUT))
        .await
        .expect("join")
        .expect("dispatched");

    server.close(CloseMode::Forcefully);
    let err = tokio::time::timeout(TIMEOUT, reply)
        .await
        .expect("failure in time")
        .expect_err("no reply");
    assert!(!err.is_retryable());
    assert!(matches!(err.cause(), LocalError::ConnectionLost { .. }));

    drop(parked);
    assert_eq!(wait_finished(outgoing).await, Ok(()));
    assert_eq!(wait_finished(server).await, Ok(()));
}
