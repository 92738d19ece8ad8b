use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use qos_core::{
    CoordinatorTransport, Lookup, LookupStatus, RecvOutcome, Resolver, SocketFactory,
    SocketOptions, TokioTime, TransportOptions,
};
use qos_tokio_network::{GrpcTransport, TokioResolver, TokioSockets};
use tokio::net::TcpListener;
use url::Url;

const POLL: Duration = Duration::from_millis(10);

async fn eventually<F: FnMut() -> bool>(mut done: F) -> bool {
    for _ in 0..500 {
        if done() {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_socket_queues_datagrams() -> anyhow::Result<()> {
    let sockets = TokioSockets::new(Arc::new(TokioTime::new()))?;
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();

    let options = SocketOptions {
        listen_port: 0,
        recv_buffer: 64 * 1024,
        send_buffer: 64 * 1024,
        packet_queue: 4,
    };
    let mut socket = sockets.open(
        &options,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )?;
    let port = socket.local_addr()?.port();
    assert_ne!(port, 0);

    let peer = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    peer.send_to(b"hello", (Ipv4Addr::LOCALHOST, port)).await?;

    assert!(eventually(|| notified.load(Ordering::SeqCst) >= 1).await);

    let datagram = socket.try_recv().ok_or_else(|| anyhow::anyhow!("nothing queued"))?;
    assert_eq!(&datagram.payload[..], b"hello");
    assert_eq!(datagram.from, peer.local_addr()?);
    assert!(socket.queue_high_water() >= 1);
    assert!(socket.try_recv().is_none());

    let sent = socket.send_to(b"back", peer.local_addr()?)?;
    assert_eq!(sent, 4);
    let mut buf = [0u8; 16];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..len], b"back");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolver_handles_literals() -> anyhow::Result<()> {
    let resolver = TokioResolver::new()?;
    let mut lookup = resolver.lookup("127.0.0.1")?;

    assert!(eventually(|| lookup.poll() != LookupStatus::Pending).await);

    // settled lookups keep reporting their outcome
    assert_eq!(
        lookup.poll(),
        LookupStatus::Resolved(IpAddr::V4(Ipv4Addr::LOCALHOST))
    );
    Ok(())
}

async fn echo(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let grpc = request
        .headers()
        .get("content-type")
        .is_some_and(|v| v == "application/grpc");
    let path = request.uri().path().to_string();
    let body = match request.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let status = if grpc && path == "/qos" { 200 } else { 400 };
    let response = Response::builder()
        .status(status)
        .header("content-type", "application/grpc")
        .header("grpc-status", "0")
        .body(Full::new(body));

    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

async fn h2c_server() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });

    Ok(addr)
}

async fn complete(transport: &mut GrpcTransport, buf: &mut [u8]) -> RecvOutcome {
    for _ in 0..500 {
        match transport.recv_all(buf) {
            RecvOutcome::Waiting => tokio::time::sleep(POLL).await,
            outcome => return outcome,
        }
    }
    RecvOutcome::Waiting
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_round_trips_over_h2c() -> anyhow::Result<()> {
    let addr = h2c_server().await?;
    let url = Url::parse(&format!("http://{addr}/qos"))?;

    let mut transport = GrpcTransport::new()?;
    transport.configure(&TransportOptions::default());

    let body: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
    let mut sent = transport.begin(&url, &body)?;
    while sent < body.len() {
        sent += transport.send(&body[sent..])?;
        tokio::task::yield_now().await;
    }
    transport.finish()?;

    let mut small = vec![0u8; 1024];
    assert_eq!(
        complete(&mut transport, &mut small).await,
        RecvOutcome::BufferTooSmall
    );

    let mut buf = vec![0u8; 64 * 1024];
    assert_eq!(
        transport.recv_all(&mut buf),
        RecvOutcome::Complete {
            status: 200,
            len: body.len()
        }
    );
    assert_eq!(&buf[..body.len()], &body[..]);
    assert_eq!(
        transport.local_addr().map(|a| a.ip()),
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    );

    transport.release();

    // the second call reuses the connection
    let local = transport.local_addr();
    let bad = Url::parse(&format!("http://{addr}/other"))?;
    transport.begin(&bad, b"x")?;
    transport.finish()?;
    assert_eq!(
        complete(&mut transport, &mut buf).await,
        RecvOutcome::Complete { status: 400, len: 1 }
    );
    assert_eq!(transport.local_addr(), local);

    transport.close(Some(Duration::ZERO));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connections_fail_the_call() -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut transport = GrpcTransport::new()?;
    transport.begin(&Url::parse(&format!("http://{addr}/qos"))?, b"body")?;
    transport.finish()?;

    let mut buf = vec![0u8; 64];
    assert_eq!(
        complete(&mut transport, &mut buf).await,
        RecvOutcome::Failed {
            code: qos_tokio_network::error_code::CONNECT
        }
    );
    Ok(())
}
