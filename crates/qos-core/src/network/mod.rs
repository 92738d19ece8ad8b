// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The I/O boundary of the client.
//!
//! The engines never block, so every collaborator here is polled: sockets
//! queue received datagrams until they are drained, lookups and coordinator
//! calls are started once and then checked on each update.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::Timestamp;

/// A datagram received on a [`ProbeSocket`].
#[derive(Debug, Clone)]
pub struct Datagram {
    /// The payload as received.
    pub payload: Bytes,
    /// Who sent it.
    pub from: SocketAddr,
    /// When the socket layer received it. Round trips are measured against
    /// this rather than the time the datagram is processed.
    pub received: Timestamp,
}

/// Options applied when opening the probe socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Port to bind, 0 for an ephemeral port.
    pub listen_port: u16,
    /// `SO_RCVBUF` size in bytes.
    pub recv_buffer: usize,
    /// `SO_SNDBUF` size in bytes.
    pub send_buffer: usize,
    /// Number of datagrams the socket may hold before dropping.
    pub packet_queue: usize,
}

/// Invoked by the socket layer, possibly from another thread, whenever a
/// datagram has been queued.
pub type RecvNotify = Arc<dyn Fn() + Send + Sync>;

/// A bound UDP socket used to exchange probes with measurement sites.
pub trait ProbeSocket: Send {
    /// Sends a datagram. `Ok(0)` means the socket would block and the send
    /// should be retried later.
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// The address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Takes the oldest queued datagram, if any.
    fn try_recv(&mut self) -> Option<Datagram>;

    /// The largest number of datagrams that have been queued at once.
    fn queue_high_water(&self) -> usize;
}

/// Opens probe sockets.
pub trait SocketFactory: Send + Sync {
    /// Binds a socket with the given options. `notify` is called every time a
    /// datagram is queued.
    fn open(&self, options: &SocketOptions, notify: RecvNotify)
        -> anyhow::Result<Box<dyn ProbeSocket>>;
}

/// The state of an in-flight name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// Still resolving.
    Pending,
    /// Resolved to an address.
    Resolved(IpAddr),
    /// Finished without an address.
    Failed,
}

/// An in-flight name lookup. Dropping it abandons the lookup.
pub trait Lookup: Send {
    /// Checks the lookup without blocking.
    fn poll(&mut self) -> LookupStatus;
}

/// Starts name lookups.
pub trait Resolver: Send + Sync {
    /// Starts resolving `host`. An error means the lookup could not be
    /// started at all.
    fn lookup(&self, host: &str) -> anyhow::Result<Box<dyn Lookup>>;
}

/// Knobs forwarded to the coordinator transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportOptions {
    /// Logging verbosity of the transport.
    pub verbosity: i32,
    /// Proceed even when the coordinator's certificate does not verify.
    pub ignore_cert_errors: bool,
}

/// The outcome of polling for a coordinator response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The response has not fully arrived yet.
    Waiting,
    /// The response is larger than the buffer offered.
    BufferTooSmall,
    /// The response body was copied into the buffer.
    Complete {
        /// HTTP status of the response.
        status: u16,
        /// Number of body bytes written.
        len: usize,
    },
    /// The call failed.
    Failed {
        /// Transport error code.
        code: i16,
    },
}

/// A failure reported by a [`CoordinatorTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Transport specific error code, folded into the module result.
    pub code: i16,
    /// Human readable cause.
    pub message: String,
}

impl TransportError {
    /// Creates a new error.
    pub fn new(code: i16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

/// The reliable request/response channel to the coordinator.
///
/// A call is started with [`begin`](Self::begin), fed with
/// [`send`](Self::send) until the whole body is accepted, closed with
/// [`finish`](Self::finish) and then polled with
/// [`recv_all`](Self::recv_all). The send methods may accept fewer bytes
/// than offered and return how many they took.
pub trait CoordinatorTransport: Send {
    /// Applies logging and certificate options to later calls.
    fn configure(&mut self, options: &TransportOptions);

    /// Starts a POST to `url`, discarding any previous call, and offers the
    /// first part of the body.
    fn begin(&mut self, url: &Url, body: &[u8]) -> Result<usize, TransportError>;

    /// Offers more of the body.
    fn send(&mut self, body: &[u8]) -> Result<usize, TransportError>;

    /// Marks the end of the body.
    fn finish(&mut self) -> Result<(), TransportError>;

    /// Copies the complete response into `buf` if it has arrived and fits.
    fn recv_all(&mut self, buf: &mut [u8]) -> RecvOutcome;

    /// The local address of the connection to the coordinator, once known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Releases the current call.
    fn release(&mut self);

    /// Tears down the connection. `linger` is applied to the underlying
    /// socket when set.
    fn close(&mut self, linger: Option<Duration>);
}
