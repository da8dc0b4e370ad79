//! Cross-crate scenarios: TCP multiplexing, broker RPC, pub/sub and
//! reconnect supervision.

use async_trait::async_trait;
use bytes::Bytes;
use muxbus::broker::{FrameHandler, MemoryBroker, ScopeTransport};
use muxbus::protocol::{headers_from_frame, Context, Frame, FrameProtocol};
use muxbus::transport::{
    attach, BackoffMonitor, BoxError, ClientRegistry, MonitorExit, MultiplexedTransport,
    MuxConfig, Processor, RequestTransport, ServerRegistry, StreamConnector, TcpConnector,
    Transport, TransportError, TransportMonitor,
};
use muxbus::{BrokerConfig, BrokerServer, BrokerTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Uppercases the payload and echoes the caller's `trace` header back.
struct Shout;

#[async_trait]
impl Processor for Shout {
    async fn process(&self, ctx: &Context, payload: Bytes) -> Result<Bytes, BoxError> {
        if let Some(trace) = ctx.request_header("trace") {
            ctx.add_response_header("trace", trace);
        }
        Ok(Bytes::from(payload.to_ascii_uppercase()))
    }
}

async fn call<T: RequestTransport + ?Sized>(
    transport: &T,
    payload: &[u8],
    trace: &str,
) -> Result<(Bytes, Option<String>), TransportError> {
    let protocol = FrameProtocol::new();
    let ctx = Context::new("");
    ctx.add_request_header("trace", trace);
    ctx.set_timeout(Duration::from_secs(2));

    let frame = protocol.encode_request(&ctx, payload)?;
    let reply = transport.request(&ctx, frame).await?;
    let body = protocol.decode_response(&ctx, &reply)?;
    Ok((body, ctx.response_header("trace")))
}

#[tokio::test]
async fn test_mux_rpc_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let transport = MultiplexedTransport::new(
            StreamConnector::<TcpStream>::new(stream),
            Arc::new(ServerRegistry::new(Arc::new(Shout), 0)),
            MuxConfig::default(),
        );
        transport.open().await.unwrap();
        let mut closed = transport.closed();
        closed.wait().await
    });

    let client = Arc::new(MultiplexedTransport::new(
        TcpConnector::new(addr.to_string()),
        Arc::new(ClientRegistry::new()),
        MuxConfig::default(),
    ));
    client.open().await.unwrap();

    let mut calls = Vec::new();
    for i in 0..16 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let trace = format!("t-{}", i);
            let (body, echoed) = call(client.as_ref(), format!("hello {}", i).as_bytes(), &trace)
                .await
                .unwrap();
            assert_eq!(body, Bytes::from(format!("HELLO {}", i)));
            assert_eq!(echoed.as_deref(), Some(trace.as_str()));
        }));
    }
    for c in calls {
        c.await.unwrap();
    }

    client.close().await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap();
    // The peer going away is never a clean close from the server's side
    assert!(matches!(reason, Some(r) if !r.is_clean()));
}

#[tokio::test]
async fn test_broker_rpc_with_queue_group() {
    let broker = MemoryBroker::new();
    let mut servers = Vec::new();
    for _ in 0..2 {
        let server = BrokerServer::new(
            Arc::new(broker.clone()),
            "shout",
            Arc::new(Shout),
            BrokerConfig::default(),
        )
        .with_queue("shouters");
        server.start().await.unwrap();
        servers.push(server);
    }

    let transport = BrokerTransport::new(
        Arc::new(broker.clone()),
        "shout",
        &BrokerConfig::default(),
    );
    transport.open().await.unwrap();

    for i in 0..4 {
        let (body, trace) = call(&transport, b"quiet", &i.to_string()).await.unwrap();
        assert_eq!(&body[..], b"QUIET");
        assert_eq!(trace, Some(i.to_string()));
    }

    // Each request reached exactly one member of the group
    let served: u64 = servers
        .iter()
        .map(|s| s.stats().unwrap().submitted())
        .sum();
    assert_eq!(served, 4);

    for server in &servers {
        server.stop().await.unwrap();
    }
    assert!(matches!(
        call(&transport, b"anyone?", "x").await,
        Err(TransportError::Timeout(_))
    ));
}

fn collector() -> (FrameHandler, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: FrameHandler = Arc::new(move |frame: Bytes| -> Result<(), BoxError> {
        tx.send(frame)?;
        Ok(())
    });
    (handler, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_scope_pubsub_with_topic_lock() {
    let broker = Arc::new(MemoryBroker::new());
    let publisher = ScopeTransport::new(broker.clone(), &BrokerConfig::default());
    let subscriber = ScopeTransport::new(broker.clone(), &BrokerConfig::default());
    publisher.open().await.unwrap();
    subscriber.open().await.unwrap();

    let (handler, mut rx) = collector();
    subscriber.subscribe("orders", None, handler).await.unwrap();

    // Header block and payload written separately, published as one frame
    let protocol = FrameProtocol::new();
    let ctx = Context::new("order-42");
    ctx.add_request_header("region", "eu");
    let header_block = protocol.request_header_block(&ctx);
    let payload = b"{\"qty\":3}";
    {
        let mut guard = publisher.lock_topic("orders").await.unwrap();
        guard.write(&header_block).unwrap();
        guard.write(payload).unwrap();
        guard.flush().await.unwrap();
    }

    let got = recv(&mut rx).await;
    let headers = headers_from_frame(&got).unwrap();
    assert_eq!(headers.get("region").map(String::as_str), Some("eu"));
    assert_eq!(headers.get("_cid").map(String::as_str), Some("order-42"));
    assert_eq!(&Frame::parse(&got).unwrap().payload[..], payload);
}

/// Records supervisor callbacks on top of a fast backoff policy.
struct Watching {
    inner: BackoffMonitor,
    events: Mutex<Vec<&'static str>>,
}

impl TransportMonitor for Watching {
    fn on_closed_uncleanly(&self, cause: &TransportError) -> Option<Duration> {
        self.events.lock().push("unclean");
        self.inner.on_closed_uncleanly(cause)
    }

    fn on_reopen_failed(&self, attempts: u32, last_wait: Duration) -> Option<Duration> {
        self.events.lock().push("failed");
        self.inner.on_reopen_failed(attempts, last_wait)
    }

    fn on_reopen_succeeded(&self) {
        self.events.lock().push("reopened");
    }

    fn on_closed_cleanly(&self) {
        self.events.lock().push("clean");
    }
}

#[tokio::test]
async fn test_monitor_restores_scope_after_broker_outage() {
    let broker = MemoryBroker::new();
    let transport = Arc::new(ScopeTransport::new(
        Arc::new(broker.clone()),
        &BrokerConfig::default(),
    ));
    transport.open().await.unwrap();

    let (handler, mut rx) = collector();
    transport.subscribe("alerts", None, handler).await.unwrap();

    let monitor = Arc::new(Watching {
        inner: BackoffMonitor::new(20, Duration::from_millis(5), Duration::from_millis(20)),
        events: Mutex::new(Vec::new()),
    });
    assert!(attach(&transport, monitor.clone()).is_none());

    broker.disconnect();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!transport.is_open());
    broker.reconnect();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !transport.is_open() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let frame = Frame::new(Bytes::from_static(b"disk full")).encode().unwrap();
    transport.publish("alerts", &frame).await.unwrap();
    let got = Frame::parse(&recv(&mut rx).await).unwrap();
    assert_eq!(&got.payload[..], b"disk full");

    transport.close().await.unwrap();
    let handle = transport.monitor_slot().take().unwrap();
    assert_eq!(handle.join().await, Some(MonitorExit::ClosedCleanly));

    let events = monitor.events.lock().clone();
    assert_eq!(events.first(), Some(&"unclean"));
    assert!(events.contains(&"reopened"));
    assert_eq!(events.last(), Some(&"clean"));
}
