//! Handshake, authentication, reconnection and server registry behavior

use bytes::Bytes;
use nexnet::transport::memory_listener;
use nexnet::{
    handler_fn, ClientConfig, ClientEvent, ConnectionState, DelaySequence, DisconnectReason,
    HandlerError, InvokeError, MethodId, MethodTable, NexusClient, NexusServer, ServerConfig,
    Session, SessionConfig, SessionError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ECHO: MethodId = 1;
const WHOAMI: MethodId = 2;
const NOTICE: MethodId = 3;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .try_init();
}

fn server_methods(hash: u64, calls: Arc<AtomicUsize>) -> MethodTable {
    MethodTable::new(hash)
        .with_handler(
            ECHO,
            handler_fn(move |ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(ctx.arguments().clone()))
                }
            }),
        )
        .with_handler(
            WHOAMI,
            handler_fn(|ctx| async move {
                match ctx.identity().principal.clone() {
                    Some(principal) => Ok(Some(Bytes::from(principal))),
                    None => Err(HandlerError::Unauthorized("anonymous".to_string())),
                }
            }),
        )
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_method_hash_mismatch_fails_both_sides() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let (a, b) = nexnet::transport::memory_pair(64 * 1024);

    let server_table = server_methods(0xB2, calls.clone());
    let accept = tokio::spawn(async move {
        Session::accept(Box::new(b), SessionConfig::default(), Arc::new(server_table), None).await
    });
    let client = Session::connect(
        Box::new(a),
        SessionConfig::default(),
        Arc::new(MethodTable::new(0xA1)),
    )
    .await;

    match client {
        Err(SessionError::HandshakeRejected { reason, .. }) => {
            assert_eq!(reason, DisconnectReason::MethodHashMismatch)
        }
        other => panic!("expected handshake rejection, got {:?}", other),
    }
    match accept.await.unwrap() {
        Err(SessionError::MethodHashMismatch { local, remote }) => {
            assert_eq!(local, 0xB2);
            assert_eq!(remote, 0xA1);
        }
        other => panic!("expected hash mismatch, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_authentication() {
    init_tracing();
    let (listener, connector) = memory_listener("auth");
    let config = ServerConfig::default().with_authenticator(|token: Option<&str>| match token {
        Some("secret") => Ok(Some("alice".to_string())),
        _ => Err("invalid token".to_string()),
    });
    let server = NexusServer::serve(
        listener,
        config,
        server_methods(7, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap();

    let rejected = NexusClient::connect(
        connector.clone(),
        ClientConfig::default().with_session(SessionConfig::default().with_auth_token("wrong")),
        MethodTable::new(7),
    )
    .await;
    match rejected {
        Err(SessionError::HandshakeRejected { reason, message }) => {
            assert_eq!(reason, DisconnectReason::Authentication);
            assert_eq!(message.as_deref(), Some("invalid token"));
        }
        other => panic!("expected authentication failure, got {:?}", other),
    }
    assert_eq!(server.registry().count(), 0);

    let client = NexusClient::connect(
        connector,
        ClientConfig::default().with_session(SessionConfig::default().with_auth_token("secret")),
        MethodTable::new(7),
    )
    .await
    .unwrap();
    let principal = client.invoke(WHOAMI, Bytes::new()).await.unwrap();
    assert_eq!(principal, Some(Bytes::from_static(b"alice")));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_reconnects_with_delay_sequence() {
    init_tracing();
    let (listener, connector) = memory_listener("reconnect");
    let calls = Arc::new(AtomicUsize::new(0));
    let server = NexusServer::serve(
        listener,
        ServerConfig::default(),
        server_methods(7, calls.clone()),
    )
    .unwrap();

    let policy = DelaySequence::new(vec![Duration::ZERO, Duration::from_millis(20)]).repeat_last();
    let client = NexusClient::connect(
        connector.clone(),
        ClientConfig::default().with_reconnect_policy(policy),
        MethodTable::new(7),
    )
    .await
    .unwrap();
    let mut events = client.subscribe();
    let mut state = client.state_changes();

    assert_eq!(
        client.invoke(ECHO, Bytes::from_static(b"one")).await.unwrap(),
        Some(Bytes::from_static(b"one"))
    );
    wait_until("server registration", || server.registry().count() == 1).await;

    // Drop the server side of the connection without a goodbye
    let first = server.registry().sessions().pop().unwrap();
    let first_id = first.id();
    first.abort();

    assert_eq!(
        events.recv().await.unwrap(),
        ClientEvent::Disconnected {
            reason: DisconnectReason::TransportError
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ClientEvent::Reconnecting { attempt: 1 }
    );
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Reconnected);
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    assert_eq!(
        client.invoke(ECHO, Bytes::from_static(b"two")).await.unwrap(),
        Some(Bytes::from_static(b"two"))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    wait_until("old session unregistered", || {
        server.registry().count() == 1 && server.registry().get(first_id).is_none()
    })
    .await;

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(
        client.invoke(ECHO, Bytes::new()).await,
        Err(InvokeError::NotConnected)
    );
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_broadcast_to_connected_clients() {
    init_tracing();
    let (listener, connector) = memory_listener("broadcast");
    let server = NexusServer::serve(
        listener,
        ServerConfig::default(),
        server_methods(7, Arc::new(AtomicUsize::new(0))),
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for index in 0..3usize {
        let tx = tx.clone();
        let methods = MethodTable::new(7).with_handler(
            NOTICE,
            handler_fn(move |ctx| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((index, ctx.arguments().clone()));
                    Ok(None)
                }
            }),
        );
        let client = NexusClient::connect(
            connector.clone(),
            ClientConfig::default().without_reconnect(),
            methods,
        )
        .await
        .unwrap();
        clients.push(client);
    }
    wait_until("three registrations", || server.registry().count() == 3).await;

    let delivered = server
        .registry()
        .broadcast(NOTICE, Bytes::from_static(b"maintenance"), None)
        .await;
    assert_eq!(delivered, 3);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (index, payload) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"maintenance"));
        seen.push(index);
    }
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2]);

    server.shutdown().await;
    for client in &clients {
        let mut state = client.state_changes();
        // Without a policy a server shutdown leaves the client disconnected
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    }
    wait_until("registry drained", || server.registry().count() == 0).await;
}
