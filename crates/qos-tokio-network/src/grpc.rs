// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use boring::ssl::{SslConnector, SslMethod, SslVerifyMode};
use bytes::Bytes;
use http::{header, HeaderMap, Method, Request};
use http_body_util::{BodyExt, Limited};
use hyper::client::conn::http2;
use hyper_util::rt::TokioIo;
use qos_core::limits::{CONTENT_TYPE, MAX_RPC_BODY_SIZE};
use qos_core::{
    oneshot_result, CoordinatorTransport, OneshotResult, RecvOutcome, TransportError,
    TransportOptions,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};
use url::Url;

use crate::body::ChannelBody;
use crate::sockopt;

/// Codes reported through [`TransportError`] and [`RecvOutcome::Failed`].
pub mod error_code {
    /// The coordinator URL cannot be used.
    pub const URL: i16 = -1;
    /// The coordinator name did not resolve.
    pub const RESOLVE: i16 = -2;
    /// The TCP connection could not be established.
    pub const CONNECT: i16 = -3;
    /// The TLS handshake failed.
    pub const TLS: i16 = -4;
    /// The HTTP/2 handshake failed.
    pub const HANDSHAKE: i16 = -5;
    /// The request failed after the connection was up.
    pub const REQUEST: i16 = -6;
    /// The response body could not be read.
    pub const BODY: i16 = -7;
    /// No call is in progress.
    pub const NO_CALL: i16 = -8;
    /// Anything else.
    pub const UNKNOWN: i16 = -9;
}

/// Largest chunk handed to the request body at once.
const MAX_CHUNK: usize = 16 * 1024;

/// Chunks buffered ahead of the connection.
const BODY_DEPTH: usize = 8;

/// Responses larger than this are failed outright rather than reported as
/// not fitting the caller's buffer.
const RESPONSE_LIMIT: usize = 2 * MAX_RPC_BODY_SIZE;

/// A [`CoordinatorTransport`] making gRPC calls over HTTP/2.
///
/// `https` URLs are reached over BoringSSL with `h2` negotiated through ALPN,
/// `http` URLs with prior knowledge HTTP/2. The connection is kept between
/// calls to the same authority.
pub struct GrpcTransport {
    runtime: Handle,
    options: TransportOptions,
    call: Option<Call>,
    connection: Arc<Mutex<Option<Connection>>>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

struct Call {
    chunks: Option<mpsc::Sender<Bytes>>,
    response: OneshotResult<GrpcResponse>,
    done: Option<Result<GrpcResponse, i16>>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct GrpcResponse {
    status: u16,
    body: Bytes,
}

struct Connection {
    authority: String,
    tls: bool,
    sender: http2::SendRequest<ChannelBody>,
    /// A duplicate of the socket's descriptor, kept to set `SO_LINGER`.
    socket: std::net::TcpStream,
}

/// Where a call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    tls: bool,
}

impl Target {
    fn parse(url: &Url) -> Result<Self, TransportError> {
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            scheme => {
                return Err(TransportError::new(
                    error_code::URL,
                    format!("unsupported scheme {scheme}"),
                ))
            }
        };

        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(TransportError::new(error_code::URL, "url has no host")),
        };

        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::new(error_code::URL, "url has no port"))?;

        Ok(Self { host, port, tls })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl GrpcTransport {
    /// Creates a transport spawning calls onto the current runtime.
    pub fn new() -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("the transport needs a tokio runtime")?;

        Ok(Self {
            runtime,
            options: TransportOptions::default(),
            call: None,
            connection: Arc::new(Mutex::new(None)),
            local_addr: Arc::new(Mutex::new(None)),
        })
    }
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("options", &self.options)
            .field("in_call", &self.call.is_some())
            .field("local_addr", &*lock(&self.local_addr))
            .finish()
    }
}

impl CoordinatorTransport for GrpcTransport {
    fn configure(&mut self, options: &TransportOptions) {
        debug!(?options, "configured coordinator transport");
        self.options = *options;
    }

    #[tracing::instrument(skip(self, body), fields(len = body.len()))]
    fn begin(&mut self, url: &Url, body: &[u8]) -> Result<usize, TransportError> {
        self.release();

        let target = Target::parse(url)?;
        let (chunks, request_body) = ChannelBody::channel(BODY_DEPTH);
        let (tx, response) = oneshot_result();

        let call = CallContext {
            url: url.clone(),
            target,
            options: self.options,
            connection: self.connection.clone(),
            local_addr: self.local_addr.clone(),
        };

        let task = self.runtime.spawn(
            async move {
                let _ = tx.send(call.run(request_body).await);
            }
            .in_current_span(),
        );

        self.call = Some(Call {
            chunks: Some(chunks),
            response,
            done: None,
            task,
        });

        self.send(body)
    }

    fn send(&mut self, body: &[u8]) -> Result<usize, TransportError> {
        let call = self
            .call
            .as_mut()
            .ok_or_else(|| TransportError::new(error_code::NO_CALL, "no call in progress"))?;
        let chunks = call
            .chunks
            .as_ref()
            .ok_or_else(|| TransportError::new(error_code::REQUEST, "request already finished"))?;

        let len = body.len().min(MAX_CHUNK);
        if len == 0 {
            return Ok(0);
        }

        match chunks.try_send(Bytes::copy_from_slice(&body[..len])) {
            Ok(()) => Ok(len),
            Err(TrySendError::Full(_)) => Ok(0),
            // the call already ended; recv_all reports how
            Err(TrySendError::Closed(_)) => {
                debug!("request body closed early");
                Ok(len)
            }
        }
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        let call = self
            .call
            .as_mut()
            .ok_or_else(|| TransportError::new(error_code::NO_CALL, "no call in progress"))?;

        call.chunks = None;
        Ok(())
    }

    fn recv_all(&mut self, buf: &mut [u8]) -> RecvOutcome {
        let Some(call) = self.call.as_mut() else {
            return RecvOutcome::Failed {
                code: error_code::NO_CALL,
            };
        };

        if call.done.is_none() {
            call.done = match call.response.try_take() {
                None => return RecvOutcome::Waiting,
                Some(Ok(response)) => Some(Ok(response)),
                Some(Err(e)) => {
                    warn!("coordinator call failed: {e:#}");
                    Some(Err(failure_code(&e)))
                }
            };
        }

        match &call.done {
            Some(Ok(response)) if response.body.len() > buf.len() => RecvOutcome::BufferTooSmall,
            Some(Ok(response)) => {
                let len = response.body.len();
                buf[..len].copy_from_slice(&response.body);
                RecvOutcome::Complete {
                    status: response.status,
                    len,
                }
            }
            Some(Err(code)) => RecvOutcome::Failed { code: *code },
            None => RecvOutcome::Waiting,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    fn release(&mut self) {
        if let Some(call) = self.call.take() {
            call.task.abort();
        }
    }

    fn close(&mut self, linger: Option<Duration>) {
        self.release();

        let Some(connection) = lock(&self.connection).take() else {
            return;
        };

        if let Some(linger) = linger {
            if let Err(e) = sockopt::set_linger(&connection.socket, linger) {
                warn!(error = %e, "unable to set linger on coordinator connection");
            }
        }

        info!(authority = %connection.authority, "closing coordinator connection");
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn failure_code(e: &anyhow::Error) -> i16 {
    e.downcast_ref::<TransportError>()
        .map_or(error_code::UNKNOWN, |e| e.code)
}

fn fail(code: i16) -> impl FnOnce(String) -> anyhow::Error {
    move |message| anyhow::Error::new(TransportError::new(code, message))
}

/// Everything a spawned call needs.
struct CallContext {
    url: Url,
    target: Target,
    options: TransportOptions,
    connection: Arc<Mutex<Option<Connection>>>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl CallContext {
    #[tracing::instrument(skip(self, body), fields(url = %self.url))]
    async fn run(self, body: ChannelBody) -> anyhow::Result<GrpcResponse> {
        let mut sender = self.sender().await?;

        sender
            .ready()
            .await
            .map_err(|e| fail(error_code::REQUEST)(format!("connection not ready: {e}")))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.url.as_str())
            .header(header::CONTENT_TYPE, CONTENT_TYPE)
            .header(header::TE, "trailers")
            .body(body)
            .map_err(|e| fail(error_code::URL)(format!("unable to build request: {e}")))?;

        info!("sending coordinator request");
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| fail(error_code::REQUEST)(format!("request failed: {e}")))?;

        let status = response.status();
        log_grpc_status(response.headers());

        let collected = Limited::new(response.into_body(), RESPONSE_LIMIT)
            .collect()
            .await
            .map_err(|e| fail(error_code::BODY)(format!("unable to read response: {e}")))?;

        if let Some(trailers) = collected.trailers() {
            log_grpc_status(trailers);
        }

        let body = collected.to_bytes();
        debug!(%status, len = body.len(), "coordinator responded");

        Ok(GrpcResponse {
            status: status.as_u16(),
            body,
        })
    }

    /// Reuses the open connection to the target or establishes a new one.
    async fn sender(&self) -> anyhow::Result<http2::SendRequest<ChannelBody>> {
        let authority = self.target.authority();

        {
            let mut slot = lock(&self.connection);
            if let Some(conn) = slot.as_ref() {
                if conn.authority == authority
                    && conn.tls == self.target.tls
                    && !conn.sender.is_closed()
                {
                    trace!(%authority, "reusing coordinator connection");
                    return Ok(conn.sender.clone());
                }
            }
            *slot = None;
        }

        let connection = self.connect(authority).await?;
        let sender = connection.sender.clone();
        *lock(&self.connection) = Some(connection);

        Ok(sender)
    }

    async fn connect(&self, authority: String) -> anyhow::Result<Connection> {
        let remote = tokio::net::lookup_host((self.target.host.as_str(), self.target.port))
            .await
            .map_err(|e| fail(error_code::RESOLVE)(format!("{authority}: {e}")))?
            .next()
            .ok_or_else(|| fail(error_code::RESOLVE)(format!("{authority} has no addresses")))?;

        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| fail(error_code::CONNECT)(format!("{remote}: {e}")))?;
        stream.set_nodelay(true)?;

        let local = stream.local_addr()?;
        *lock(&self.local_addr) = Some(local);

        let std_stream = stream.into_std()?;
        let socket = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        debug!(%remote, %local, "connected to coordinator");

        let sender = if self.target.tls {
            let tls = tls_connection(&self.target.host, self.options, stream).await?;
            handshake(tls).await?
        } else {
            handshake(stream).await?
        };

        Ok(Connection {
            authority,
            tls: self.target.tls,
            sender,
            socket,
        })
    }
}

async fn tls_connection(
    domain: &str,
    options: TransportOptions,
    stream: TcpStream,
) -> anyhow::Result<tokio_boring::SslStream<TcpStream>> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| fail(error_code::TLS)(e.to_string()))?;

    if options.ignore_cert_errors {
        builder.set_verify(SslVerifyMode::NONE);
    } else {
        builder
            .cert_store_mut()
            .set_default_paths()
            .map_err(|e| fail(error_code::TLS)(e.to_string()))?;
        builder.set_verify(SslVerifyMode::PEER);
    }

    builder
        .set_alpn_protos(b"\x02h2")
        .map_err(|e| fail(error_code::TLS)(e.to_string()))?;

    let mut config = builder
        .build()
        .configure()
        .map_err(|e| fail(error_code::TLS)(e.to_string()))?;
    if options.ignore_cert_errors {
        config.set_verify_hostname(false);
    }

    let tls = tokio_boring::connect(config, domain, stream)
        .await
        .map_err(|e| fail(error_code::TLS)(format!("unable to create tls stream: {e}")))?;

    debug!("created tls connection");
    Ok(tls)
}

async fn handshake<T>(io: T) -> anyhow::Result<http2::SendRequest<ChannelBody>>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, connection) = http2::handshake(TokioExecutor, TokioIo::new(io))
        .await
        .map_err(|e| fail(error_code::HANDSHAKE)(format!("h2 handshake failed: {e}")))?;

    debug!("finished h2 handshake");

    tokio::spawn(
        async move {
            if let Err(e) = connection.await {
                error!(error = %e, "error running coordinator connection");
            }

            info!("coordinator connection finished");
        }
        .in_current_span(),
    );

    Ok(sender)
}

fn log_grpc_status(headers: &HeaderMap) {
    let Some(status) = headers.get("grpc-status") else {
        return;
    };

    if status.as_bytes() != b"0" {
        let message = headers
            .get("grpc-message")
            .and_then(|m| m.to_str().ok())
            .unwrap_or_default();
        warn!(?status, message, "coordinator returned a grpc error");
    }
}

#[derive(Clone)]
struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, future: F) {
        tokio::spawn(future);
    }
}
