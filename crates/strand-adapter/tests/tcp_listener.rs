use std::sync::Arc;
use std::time::Duration;

use strand_adapter::tcp::TcpAcceptor;
use strand_adapter::{Listener, ListenerOptions, ListenerState};
use strand_proto::{InputStream, ReplyStatus};
use strand_rpc::tcp::{TcpTransceiver, TokioReactor, TokioTimer};
use strand_rpc::{
    Connection, ConnectionContext, InvocationOptions, LocalError, Responder, Role, State,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

fn echo(request: &mut InputStream, responder: Responder) {
    let mut reply = vec![ReplyStatus::Ok.byte()];
    reply.extend_from_slice(&request.rest());
    responder.send(&reply);
}

async fn connect(addr: std::net::SocketAddr, context: &ConnectionContext) -> Arc<Connection> {
    let transceiver = TcpTransceiver::connect(addr).await.expect("connect");
    let connection = Connection::new(Box::new(transceiver), Role::Outgoing, context);
    let (started_tx, started_rx) = oneshot::channel();
    connection.start(Some(Box::new(
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
    connection
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_serves_requests_and_shuts_down_its_connections() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let acceptor = TcpAcceptor::from_std(std_listener, Handle::current()).expect("acceptor");
    let addr = acceptor.local_addr();

    let context = ConnectionContext::new(TokioReactor::current(), TokioTimer::current());
    let listener = Listener::new(
        "echo",
        Box::new(acceptor),
        ListenerOptions::default(),
        context.clone(),
    );
    listener.set_dispatcher(Arc::new(echo));
    listener.start_accepting();
    listener.activate();
    assert!(listener.is_listening());

    let client = connect(addr, &context).await;
    let (_, reply) = client
        .invoke(b"hello", InvocationOptions::default())
        .expect("invoke");
    let reply = tokio::time::timeout(TIMEOUT, reply)
        .await
        .expect("reply in time")
        .expect("reply");
    assert_eq!(&reply[..], b"\x00hello");
    assert_eq!(listener.connections().len(), 1);

    listener.destroy();
    let waiting = listener.clone();
    tokio::time::timeout(
        TIMEOUT,
        tokio::task::spawn_blocking(move || {
            waiting.wait_until_finished(&CancellationToken::new())
        }),
    )
    .await
    .expect("listener finished in time")
    .expect("join")
    .expect("wait");
    assert_eq!(listener.state(), ListenerState::Finished);

    let closed = client.clone();
    tokio::time::timeout(
        TIMEOUT,
        tokio::task::spawn_blocking(move || closed.wait_until_finished(&CancellationToken::new())),
    )
    .await
    .expect("client finished in time")
    .expect("join")
    .expect("wait");
    assert_eq!(client.state(), State::Finished);
    assert_eq!(client.cause(), Some(LocalError::ClosedByPeer));

    // Nothing listens on the address anymore.
    assert!(TcpTransceiver::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_enforces_max_connections_over_tcp() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let acceptor = TcpAcceptor::from_std(std_listener, Handle::current()).expect("acceptor");
    let addr = acceptor.local_addr();

    let context = ConnectionContext::new(TokioReactor::current(), TokioTimer::current());
    let listener = Listener::new(
        "bounded",
        Box::new(acceptor),
        ListenerOptions {
            max_connections: 1,
            ..ListenerOptions::default()
        },
        context.clone(),
    );
    listener.start_accepting();
    listener.activate();

    let _first = connect(addr, &context).await;

    // The second transport is accepted and dropped before validation, so its handshake fails.
    let transceiver = TcpTransceiver::connect(addr).await.expect("connect");
    let rejected = Connection::new(Box::new(transceiver), Role::Outgoing, &context);
    let (started_tx, started_rx) = oneshot::channel();
    rejected.start(Some(Box::new(
        move |_connection: &Arc<Connection>, result: Result<(), LocalError>| {
            let _ = started_tx.send(result);
        },
    )));
    let result = tokio::time::timeout(TIMEOUT, started_rx)
        .await
        .expect("rejected in time")
        .expect("callback");
    assert!(matches!(result, Err(LocalError::ConnectionLost { .. })));
    assert_eq!(listener.connections().len(), 1);

    listener.destroy();
}
