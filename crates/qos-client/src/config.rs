//! Tunables, the controls that change them and the status that reports them.

use std::time::Duration;

use qos_core::HResult;
use qos_rpc::{ProcessedResults, RawResults};

/// Port the probe socket binds to when none is requested.
pub const DEFAULT_LISTEN_PORT: u16 = 7673;

/// Every tunable of a [`QosClient`](crate::QosClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Port to bind the probe socket to. 0 picks [`DEFAULT_LISTEN_PORT`].
    pub listen_port: u16,
    /// UDP receive buffer size in bytes.
    pub recv_buffer: usize,
    /// UDP send buffer size in bytes.
    pub send_buffer: usize,
    /// Datagrams the probe socket may queue before dropping.
    pub packet_queue: usize,
    /// Gaps between updates at least this long are counted as stalls. Zero
    /// disables stall accounting.
    pub stall_window: Duration,
    /// Longest a cycle may run before it is abandoned.
    pub max_process_time: Duration,
    /// Verbosity forwarded to the coordinator transport.
    pub verbosity: i32,
    pub ignore_cert_errors: bool,
    pub use_https: bool,
    /// Linger applied when the coordinator connection is torn down.
    pub so_linger: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            recv_buffer: 16 * 1024,
            send_buffer: 16 * 1024,
            packet_queue: 12,
            stall_window: Duration::from_millis(500),
            max_process_time: Duration::from_secs(60),
            verbosity: 1,
            ignore_cert_errors: false,
            use_https: true,
            so_linger: None,
        }
    }
}

impl ClientConfig {
    /// The port to bind, substituting the default for 0.
    pub fn requested_listen_port(&self) -> u16 {
        if self.listen_port == 0 {
            DEFAULT_LISTEN_PORT
        } else {
            self.listen_port
        }
    }

    pub fn apply(&mut self, control: Control) {
        match control {
            Control::ListenPort(port) => self.listen_port = port,
            Control::MaxProcessTime(time) => self.max_process_time = time,
            Control::IgnoreCertErrors(ignore) => self.ignore_cert_errors = ignore,
            Control::PacketQueue(depth) => self.packet_queue = depth,
            Control::RecvBuffer(size) => self.recv_buffer = size,
            Control::SendBuffer(size) => self.send_buffer = size,
            Control::SoLinger(linger) => self.so_linger = linger,
            Control::Verbosity(level) => self.verbosity = level,
            Control::StallWindow(window) => self.stall_window = window,
            Control::UseHttps(https) => self.use_https = https,
        }
    }
}

/// A change to one tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    ListenPort(u16),
    MaxProcessTime(Duration),
    IgnoreCertErrors(bool),
    PacketQueue(usize),
    RecvBuffer(usize),
    SendBuffer(usize),
    SoLinger(Option<Duration>),
    Verbosity(i32),
    StallWindow(Duration),
    UseHttps(bool),
}

impl Control {
    /// Maps a coordinator control override, named by its four character
    /// selector, to a control. Unknown selectors give `None`.
    pub fn from_selector(selector: &str, value: i32) -> Option<Self> {
        let millis = || Duration::from_millis(value.max(0) as u64);
        let size = || value.max(0) as usize;

        let control = match selector {
            "lprt" => Control::ListenPort(u16::try_from(value).unwrap_or(0)),
            "maxt" => Control::MaxProcessTime(millis()),
            "ncrt" => Control::IgnoreCertErrors(value != 0),
            "pque" => Control::PacketQueue(size()),
            "rbuf" => Control::RecvBuffer(size()),
            "sbuf" => Control::SendBuffer(size()),
            "soli" => Control::SoLinger((value >= 0).then(|| Duration::from_secs(value as u64))),
            "spam" => Control::Verbosity(value),
            "stwi" => Control::StallWindow(millis()),
            "ussl" => Control::UseHttps(value != 0),
            _ => return None,
        };

        Some(control)
    }
}

/// What [`QosClient::status`](crate::QosClient::status) can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSelector {
    /// The port the probe socket is bound to, 0 when closed.
    CurrentListenPort,
    HResult,
    ListenPort,
    MaxProcessTime,
    IgnoreCertErrors,
    PacketQueue,
    RecvBuffer,
    SendBuffer,
    ProcessedResults,
    RawResults,
    /// The body of the last coordinator response.
    LastResponse,
    SoLinger,
    Verbosity,
    StallWindow,
    UseHttps,
}

/// A reported status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusValue {
    Port(u16),
    HResult(HResult),
    Duration(Duration),
    Linger(Option<Duration>),
    Flag(bool),
    Size(usize),
    Level(i32),
    ProcessedResults(ProcessedResults),
    RawResults(Vec<RawResults>),
    Bytes(Vec<u8>),
}
