//! End-to-end invocation tests over in-memory transports

use bytes::Bytes;
use nexnet::{
    handler_fn, typed_handler, Authorizer, BincodeCodec, ConnectionIdentity, HandlerError,
    InvokeError, MethodId, MethodTable, RemoteErrorKind, Session, SessionConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const HASH: u64 = 0xC0FFEE;

const ADD: MethodId = 1;
const FAIL_ON_SEVEN: MethodId = 2;
const HANG: MethodId = 3;
const PANIC: MethodId = 4;
const ADMIN: MethodId = 5;
const CALL_BACK: MethodId = 6;
const WHO_AM_I: MethodId = 7;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .try_init();
}

#[derive(Debug, Serialize, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

async fn connect_pair(
    client_methods: MethodTable,
    server_methods: MethodTable,
) -> (Arc<Session>, Arc<Session>) {
    let (a, b) = nexnet::transport::memory_pair(256 * 1024);
    let accept = tokio::spawn(async move {
        Session::accept(
            Box::new(b),
            SessionConfig::default(),
            Arc::new(server_methods),
            None,
        )
        .await
    });
    let client = Session::connect(Box::new(a), SessionConfig::default(), Arc::new(client_methods))
        .await
        .expect("client handshake");
    let server = accept.await.unwrap().expect("server handshake");
    (client, server)
}

struct AdminOnly;

impl Authorizer for AdminOnly {
    fn authorize(&self, method_id: MethodId, identity: &ConnectionIdentity) -> bool {
        method_id != ADMIN || identity.principal.as_deref() == Some("admin")
    }
}

fn server_methods(hang_started: Arc<Notify>, admin_calls: Arc<AtomicUsize>) -> MethodTable {
    MethodTable::new(HASH)
        .with_handler(
            ADD,
            typed_handler::<AddArgs, i64, BincodeCodec, _, _>(|args, _ctx| async move {
                Ok(args.a + args.b)
            }),
        )
        .with_handler(
            FAIL_ON_SEVEN,
            typed_handler::<u32, u32, BincodeCodec, _, _>(|n, _ctx| async move {
                if n == 7 {
                    Err(HandlerError::failed(format!("refusing {}", n)))
                } else {
                    Ok(n * 10)
                }
            }),
        )
        .with_handler(
            HANG,
            handler_fn(move |ctx| {
                let started = hang_started.clone();
                async move {
                    started.notify_one();
                    ctx.cancellation().cancelled().await;
                    Err(HandlerError::Cancelled)
                }
            }),
        )
        .with_handler(
            PANIC,
            handler_fn(|_ctx| async move {
                let missing: Option<Bytes> = None;
                Ok(Some(missing.expect("handler bug")))
            }),
        )
        .with_handler(
            ADMIN,
            handler_fn(move |_ctx| {
                let admin_calls = admin_calls.clone();
                async move {
                    admin_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        )
        .with_handler(
            CALL_BACK,
            handler_fn(|ctx| async move {
                let Some(session) = ctx.session() else {
                    return Err(HandlerError::failed("session gone"));
                };
                // Invoke the caller while its own invocation is still pending
                session
                    .invoke(WHO_AM_I, Bytes::new())
                    .await
                    .map_err(HandlerError::failed)
            }),
        )
        .with_authorizer(AdminOnly)
}

fn client_methods() -> MethodTable {
    MethodTable::new(HASH).with_handler(
        WHO_AM_I,
        handler_fn(|_ctx| async move { Ok(Some(Bytes::from_static(b"client"))) }),
    )
}

fn default_server() -> MethodTable {
    server_methods(Arc::new(Notify::new()), Arc::new(AtomicUsize::new(0)))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_typed_round_trip() {
    init_tracing();
    let (client, server) = connect_pair(client_methods(), default_server()).await;

    let sum: i64 = client
        .invoke_typed::<AddArgs, i64, BincodeCodec>(ADD, &AddArgs { a: 40, b: 2 })
        .await
        .unwrap();
    assert_eq!(sum, 42);
    assert_eq!(client.stats().invocations_sent, 1);
    assert_eq!(server.stats().invocations_received, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_error_is_isolated() {
    init_tracing();
    let (client, _server) = connect_pair(client_methods(), default_server()).await;

    for n in 1..=8u32 {
        let result = client
            .invoke_typed::<u32, u32, BincodeCodec>(FAIL_ON_SEVEN, &n)
            .await;
        if n == 7 {
            match result {
                Err(InvokeError::Remote { kind, message }) => {
                    assert_eq!(kind, RemoteErrorKind::HandlerFailed);
                    assert!(message.contains("refusing 7"), "{}", message);
                }
                other => panic!("expected remote failure, got {:?}", other),
            }
        } else {
            assert_eq!(result.unwrap(), n * 10);
        }
    }
    assert!(client.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_method_and_bad_arguments() {
    init_tracing();
    let (client, _server) = connect_pair(client_methods(), default_server()).await;

    match client.invoke(99, Bytes::new()).await {
        Err(InvokeError::Remote { kind, .. }) => assert_eq!(kind, RemoteErrorKind::MethodNotFound),
        other => panic!("expected MethodNotFound, got {:?}", other),
    }

    // Too short to be an AddArgs
    match client.invoke(ADD, Bytes::from_static(&[1, 2])).await {
        Err(InvokeError::Remote { kind, .. }) => {
            assert_eq!(kind, RemoteErrorKind::InvalidArguments)
        }
        other => panic!("expected InvalidArguments, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_handler_reports_error() {
    init_tracing();
    let (client, _server) = connect_pair(client_methods(), default_server()).await;

    match client.invoke(PANIC, Bytes::new()).await {
        Err(InvokeError::Remote { kind, message }) => {
            assert_eq!(kind, RemoteErrorKind::HandlerPanicked);
            assert!(message.contains("handler bug"), "{}", message);
        }
        other => panic!("expected HandlerPanicked, got {:?}", other),
    }

    // The session survives the panic
    let sum: i64 = client
        .invoke_typed::<AddArgs, i64, BincodeCodec>(ADD, &AddArgs { a: 1, b: 1 })
        .await
        .unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unauthorized_method_never_runs() {
    init_tracing();
    let admin_calls = Arc::new(AtomicUsize::new(0));
    let (client, _server) = connect_pair(
        client_methods(),
        server_methods(Arc::new(Notify::new()), admin_calls.clone()),
    )
    .await;

    match client.invoke(ADMIN, Bytes::new()).await {
        Err(InvokeError::Remote { kind, .. }) => assert_eq!(kind, RemoteErrorKind::Unauthorized),
        other => panic!("expected Unauthorized, got {:?}", other),
    }
    assert_eq!(admin_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_reaches_handler() {
    init_tracing();
    let started = Arc::new(Notify::new());
    let (client, server) = connect_pair(
        client_methods(),
        server_methods(started.clone(), Arc::new(AtomicUsize::new(0))),
    )
    .await;

    let cancel = CancellationToken::new();
    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.invoke_cancellable(HANG, Bytes::new(), &[], &cancel).await })
    };

    started.notified().await;
    assert_eq!(server.running_handlers(), 1);
    cancel.cancel();

    assert_eq!(call.await.unwrap(), Err(InvokeError::Cancelled));
    assert_eq!(client.pending_invocations(), 0);

    timeout(Duration::from_secs(5), async {
        while server.running_handlers() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("handler observed cancellation");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transport_loss_aborts_pending_invocations() {
    init_tracing();
    let started = Arc::new(Notify::new());
    let (client, server) = connect_pair(
        client_methods(),
        server_methods(started.clone(), Arc::new(AtomicUsize::new(0))),
    )
    .await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.invoke(HANG, Bytes::new()).await })
        })
        .collect();

    timeout(Duration::from_secs(5), async {
        while client.pending_invocations() != 3 || server.running_handlers() != 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("three invocations in flight");

    server.abort();

    for call in calls {
        assert_eq!(call.await.unwrap(), Err(InvokeError::ConnectionAborted));
    }
    assert_eq!(client.pending_invocations(), 0);
    assert_eq!(
        client.invoke(ADD, Bytes::new()).await,
        Err(InvokeError::ConnectionAborted)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_calls_back_into_caller() {
    init_tracing();
    let (client, _server) = connect_pair(client_methods(), default_server()).await;

    let reply = client.invoke(CALL_BACK, Bytes::new()).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"client")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oneway_invocation_runs_without_response() {
    init_tracing();
    let admin_calls = Arc::new(AtomicUsize::new(0));
    let server_table = MethodTable::new(HASH).with_handler(
        ADMIN,
        handler_fn({
            let admin_calls = admin_calls.clone();
            move |_ctx| {
                let admin_calls = admin_calls.clone();
                async move {
                    admin_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(Bytes::from_static(b"ignored")))
                }
            }
        }),
    );
    let (client, _server) = connect_pair(client_methods(), server_table).await;

    client.invoke_oneway(ADMIN, Bytes::new(), &[]).await.unwrap();
    assert_eq!(client.pending_invocations(), 0);

    timeout(Duration::from_secs(5), async {
        while admin_calls.load(Ordering::SeqCst) != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("one-way handler ran");
}
