//! In-memory sockets, resolvers and coordinator transports for driving a
//! [`QosClient`] against a [`ManualTime`] clock.
//!
//! The fakes share their state behind `Arc`s so a test can keep a handle,
//! give the client a clone, and inspect what the client did afterwards.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use qos_core::limits::{MIN_PACKET_SIZE, PROBE_DATA_SIZE};
use qos_core::{
    CoordinatorTransport, Datagram, HResult, Lookup, LookupStatus, ManualTime, ProbeSocket, QosAddr,
    RecvNotify, RecvOutcome, Resolver, SocketFactory, SocketOptions, Time, TransportError,
    TransportOptions,
};
use qos_probe::{ProbePacket, SecureKey};
use qos_rpc::wire::{Reader, WireError, Writer};
use qos_rpc::{frame, CoordinatorResponse, ProcessedResults, ScrubbedProbe};
use url::Url;

use crate::{ClientConfig, ClientIo, QosClient};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type DropRule = Box<dyn Fn(usize) -> bool + Send + Sync>;
type AddrRule = Box<dyn Fn(QosAddr) -> QosAddr + Send + Sync>;

/// How a simulated measurement site answers probes.
pub struct FakeSite {
    key: SecureKey,
    rtt: Duration,
    drop: Option<DropRule>,
    report_addr: Option<AddrRule>,
    tamper: bool,
    silent: bool,
}

impl FakeSite {
    /// A site answering every probe signed with `key` at once.
    pub fn new(key: SecureKey) -> Self {
        Self {
            key,
            rtt: Duration::ZERO,
            drop: None,
            report_addr: None,
            tamper: false,
            silent: false,
        }
    }

    /// Delays replies by `rtt`.
    pub fn rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }

    /// Loses the replies whose sequence number matches.
    pub fn drop_when(mut self, rule: impl Fn(usize) -> bool + Send + Sync + 'static) -> Self {
        self.drop = Some(Box::new(rule));
        self
    }

    /// Reports the client address `rule` returns for the declared one,
    /// instead of the address the probe came from.
    pub fn report_addr(mut self, rule: impl Fn(QosAddr) -> QosAddr + Send + Sync + 'static) -> Self {
        self.report_addr = Some(Box::new(rule));
        self
    }

    /// Corrupts the signature of every reply.
    pub fn tamper(mut self) -> Self {
        self.tamper = true;
        self
    }

    /// Never answers.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// What the next probe send does instead of going out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    WouldBlock,
    Short,
    /// Fails with the given OS error.
    Error(i32),
}

/// A probe the client sent.
#[derive(Debug, Clone)]
pub struct SentProbe {
    pub to: SocketAddr,
    pub len: usize,
    /// The probe, if the target is a known site and the signature verified.
    pub probe: Option<ProbePacket>,
}

#[derive(Default)]
struct NetState {
    sites: HashMap<SocketAddr, FakeSite>,
    opened: Vec<SocketOptions>,
    refused_ports: Vec<u16>,
    send_script: VecDeque<SendOutcome>,
    sent: Vec<SentProbe>,
    server_clock: u32,
    inboxes: Vec<(Weak<Mutex<VecDeque<Datagram>>>, RecvNotify)>,
}

impl NetState {
    fn replies(
        &mut self,
        buf: &[u8],
        target: SocketAddr,
        local: SocketAddr,
        now: qos_core::Timestamp,
    ) -> Vec<Datagram> {
        let probe = self
            .sites
            .get(&target)
            .and_then(|site| ProbePacket::deserialize(buf, &site.key).ok());
        self.sent.push(SentProbe {
            to: target,
            len: buf.len(),
            probe,
        });

        self.server_clock = self.server_clock.wrapping_add(10).max(1000);
        let server_time = self.server_clock;

        let (Some(site), Some(probe)) = (self.sites.get(&target), probe) else {
            return Vec::new();
        };
        if site.silent {
            return Vec::new();
        }

        let down = probe.probe_count_down.max(1);
        let client_addr = match &site.report_addr {
            Some(rule) => rule(probe.client_addr),
            None => QosAddr::from(local),
        };

        (0..down)
            .filter_map(|j| {
                let seq = if down == 1 { probe.probe_count_up } else { j };
                if site.drop.as_ref().is_some_and(|rule| rule(seq as usize)) {
                    return None;
                }

                let reply = ProbePacket {
                    server_receive_time: server_time,
                    server_send_delta: 1,
                    probe_count_down: seq,
                    client_addr,
                    ..probe
                };
                let mut payload = vec![0u8; (probe.probe_size_down as usize).max(MIN_PACKET_SIZE)];
                reply.serialize(&mut payload, &site.key).ok()?;
                if site.tamper {
                    payload[PROBE_DATA_SIZE] ^= 0xff;
                }

                Some(Datagram {
                    payload: payload.into(),
                    from: target,
                    received: now + site.rtt,
                })
            })
            .collect()
    }
}

/// A simulated network of measurement sites.
#[derive(Clone)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetState>>,
    time: Arc<dyn Time>,
}

impl FakeNetwork {
    pub fn new(time: Arc<dyn Time>) -> Self {
        Self {
            state: Default::default(),
            time,
        }
    }

    pub fn add_site(&self, addr: SocketAddr, site: FakeSite) {
        lock(&self.state).sites.insert(addr, site);
    }

    /// Makes binding `port` fail.
    pub fn refuse_port(&self, port: u16) {
        lock(&self.state).refused_ports.push(port);
    }

    /// Replaces the next probe sends with `outcomes`, in order.
    pub fn script_sends(&self, outcomes: impl IntoIterator<Item = SendOutcome>) {
        lock(&self.state).send_script.extend(outcomes);
    }

    pub fn sent(&self) -> Vec<SentProbe> {
        lock(&self.state).sent.clone()
    }

    /// Options of every socket opened so far.
    pub fn opened(&self) -> Vec<SocketOptions> {
        lock(&self.state).opened.clone()
    }

    /// Fires the receive notification of every open socket holding a reply
    /// that has arrived by now, the way a socket's receive task would.
    pub fn deliver_due(&self) {
        let now = self.time.now();
        let ready: Vec<RecvNotify> = lock(&self.state)
            .inboxes
            .iter()
            .filter(|(queue, _)| has_due(queue, now))
            .map(|(_, notify)| notify.clone())
            .collect();

        for notify in ready {
            notify();
        }
    }
}

fn has_due(queue: &Weak<Mutex<VecDeque<Datagram>>>, now: qos_core::Timestamp) -> bool {
    let Some(queue) = queue.upgrade() else {
        return false;
    };
    let due = lock(&queue).iter().any(|d| d.received <= now);
    due
}

impl SocketFactory for FakeNetwork {
    fn open(
        &self,
        options: &SocketOptions,
        notify: RecvNotify,
    ) -> anyhow::Result<Box<dyn ProbeSocket>> {
        let mut state = lock(&self.state);
        state.opened.push(*options);
        if state.refused_ports.contains(&options.listen_port) {
            anyhow::bail!("port {} is in use", options.listen_port);
        }

        let port = match options.listen_port {
            0 => 40000 + state.opened.len() as u16,
            port => port,
        };

        let queue = Arc::new(Mutex::new(VecDeque::new()));
        state.inboxes.push((Arc::downgrade(&queue), notify.clone()));

        Ok(Box::new(FakeSocket {
            network: self.clone(),
            local: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            notify,
            queue,
            high_water: 0,
        }))
    }
}

struct FakeSocket {
    network: FakeNetwork,
    local: SocketAddr,
    notify: RecvNotify,
    queue: Arc<Mutex<VecDeque<Datagram>>>,
    high_water: usize,
}

impl ProbeSocket for FakeSocket {
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let now = self.network.time.now();
        let replies = {
            let mut state = lock(&self.network.state);
            match state.send_script.pop_front() {
                Some(SendOutcome::WouldBlock) => return Ok(0),
                Some(SendOutcome::Short) => return Ok(buf.len().saturating_sub(1)),
                Some(SendOutcome::Error(code)) => return Err(io::Error::from_raw_os_error(code)),
                None => {}
            }
            state.replies(buf, target, self.local, now)
        };

        if !replies.is_empty() {
            let queued = {
                let mut queue = lock(&self.queue);
                queue.extend(replies);
                queue.len()
            };
            self.high_water = self.high_water.max(queued);
            (self.notify)();
        }

        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn try_recv(&mut self) -> Option<Datagram> {
        let now = self.network.time.now();
        let mut queue = lock(&self.queue);
        let due = queue.iter().position(|d| d.received <= now)?;
        queue.remove(due)
    }

    fn queue_high_water(&self) -> usize {
        self.high_water
    }
}

/// How a scripted lookup ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupScript {
    Resolve(IpAddr),
    Fail,
    /// The lookup cannot even be started.
    Refuse,
}

#[derive(Default)]
struct ResolverState {
    hosts: HashMap<String, LookupScript>,
    pending_polls: usize,
    lookups: Vec<String>,
}

/// Resolves address literals, and whatever else it is told to.
#[derive(Clone, Default)]
pub struct ScriptedResolver {
    state: Arc<Mutex<ResolverState>>,
}

impl ScriptedResolver {
    pub fn script(&self, host: &str, script: LookupScript) {
        lock(&self.state).hosts.insert(host.to_string(), script);
    }

    /// Keeps every later lookup pending for `polls` polls.
    pub fn pending_polls(&self, polls: usize) {
        lock(&self.state).pending_polls = polls;
    }

    pub fn lookups(&self) -> Vec<String> {
        lock(&self.state).lookups.clone()
    }
}

impl Resolver for ScriptedResolver {
    fn lookup(&self, host: &str) -> anyhow::Result<Box<dyn Lookup>> {
        let mut state = lock(&self.state);
        state.lookups.push(host.to_string());

        let script = state.hosts.get(host).copied().unwrap_or_else(|| match host.parse() {
            Ok(ip) => LookupScript::Resolve(ip),
            Err(_) => LookupScript::Fail,
        });
        let outcome = match script {
            LookupScript::Resolve(ip) => LookupStatus::Resolved(ip),
            LookupScript::Fail => LookupStatus::Failed,
            LookupScript::Refuse => anyhow::bail!("no lookup slots left"),
        };

        Ok(Box::new(ScriptedLookup {
            polls_left: state.pending_polls,
            outcome,
        }))
    }
}

struct ScriptedLookup {
    polls_left: usize,
    outcome: LookupStatus,
}

impl Lookup for ScriptedLookup {
    fn poll(&mut self) -> LookupStatus {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return LookupStatus::Pending;
        }
        self.outcome
    }
}

/// A scripted coordinator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A 200 with this body.
    Body(Vec<u8>),
    /// An empty response with this status.
    Status(u16),
    /// The call fails with this code.
    Fail(i16),
}

#[derive(Default)]
struct TransportState {
    responses: VecDeque<Response>,
    chunk: Option<usize>,
    local_addr: Option<SocketAddr>,
    options: Option<TransportOptions>,
    urls: Vec<Url>,
    body: Vec<u8>,
    finished: bool,
    submissions: Vec<Vec<u8>>,
    recv_sizes: Vec<usize>,
    releases: usize,
    closed: Option<Option<Duration>>,
}

impl TransportState {
    fn accept(&mut self, body: &[u8]) -> usize {
        let n = self.chunk.map_or(body.len(), |chunk| chunk.min(body.len()));
        self.body.extend_from_slice(&body[..n]);
        n
    }
}

/// A coordinator that answers from a script.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ScriptedTransport {
    /// Queues the answer to a later call.
    pub fn respond(&self, response: Response) {
        lock(&self.state).responses.push_back(response);
    }

    /// Accepts at most `chunk` body bytes per send.
    pub fn chunked(&self, chunk: usize) {
        lock(&self.state).chunk = Some(chunk);
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        lock(&self.state).local_addr = Some(addr);
    }

    /// Every complete request body, framed.
    pub fn submissions(&self) -> Vec<Vec<u8>> {
        lock(&self.state).submissions.clone()
    }

    /// Buffer sizes offered to `recv_all`, in order.
    pub fn recv_sizes(&self) -> Vec<usize> {
        lock(&self.state).recv_sizes.clone()
    }

    pub fn urls(&self) -> Vec<Url> {
        lock(&self.state).urls.clone()
    }

    pub fn options(&self) -> Option<TransportOptions> {
        lock(&self.state).options
    }

    pub fn releases(&self) -> usize {
        lock(&self.state).releases
    }

    /// The linger the transport was closed with, if it was.
    pub fn closed(&self) -> Option<Option<Duration>> {
        lock(&self.state).closed
    }
}

impl CoordinatorTransport for ScriptedTransport {
    fn configure(&mut self, options: &TransportOptions) {
        lock(&self.state).options = Some(*options);
    }

    fn begin(&mut self, url: &Url, body: &[u8]) -> Result<usize, TransportError> {
        let mut state = lock(&self.state);
        state.urls.push(url.clone());
        state.body.clear();
        state.finished = false;
        Ok(state.accept(body))
    }

    fn send(&mut self, body: &[u8]) -> Result<usize, TransportError> {
        Ok(lock(&self.state).accept(body))
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let body = std::mem::take(&mut state.body);
        state.submissions.push(body);
        state.finished = true;
        Ok(())
    }

    fn recv_all(&mut self, buf: &mut [u8]) -> RecvOutcome {
        let mut state = lock(&self.state);
        state.recv_sizes.push(buf.len());
        if !state.finished {
            return RecvOutcome::Waiting;
        }

        let outcome = match state.responses.front() {
            None => return RecvOutcome::Waiting,
            Some(Response::Body(body)) if body.len() > buf.len() => {
                return RecvOutcome::BufferTooSmall
            }
            Some(Response::Body(body)) => {
                buf[..body.len()].copy_from_slice(body);
                RecvOutcome::Complete {
                    status: 200,
                    len: body.len(),
                }
            }
            Some(Response::Status(status)) => RecvOutcome::Complete {
                status: *status,
                len: 0,
            },
            Some(Response::Fail(code)) => RecvOutcome::Failed { code: *code },
        };

        state.responses.pop_front();
        state.finished = false;
        outcome
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).local_addr
    }

    fn release(&mut self) {
        lock(&self.state).releases += 1;
    }

    fn close(&mut self, linger: Option<Duration>) {
        lock(&self.state).closed = Some(linger);
    }
}

/// Encodes `response` the way the coordinator sends it.
pub fn encode_response(response: &CoordinatorResponse) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::new(Vec::new(), usize::MAX);

    w.varint(2, response.service_id as u64)?;
    if response.client_addr_from_coordinator.is_known() {
        w.string(3, &response.client_addr_from_coordinator.to_string())?;
    }
    w.varint(4, response.firewall_type.raw())?;
    w.varint(5, response.time_till_retry.as_millis() as u64)?;
    if response.client_external_addr.is_known() {
        w.string(6, &response.client_external_addr.to_string())?;
    }

    for site in &response.sites {
        w.begin_message(7)?;
        w.string(1, &site.name)?;
        w.string(2, &site.addr)?;
        w.varint(3, site.port as u64)?;
        w.bytes(4, &site.key)?;
        w.varint(5, site.probe_version as u64)?;
        w.end_message()?;
    }
    for config in &response.control_configs {
        w.begin_message(8)?;
        w.string(1, &config.name)?;
        w.varint(2, config.value as i64 as u64)?;
        w.string(3, &config.text)?;
        w.end_message()?;
    }
    for test in &response.tests {
        w.begin_message(9)?;
        w.string(1, &test.name)?;
        w.string(2, &test.site)?;
        w.varint(3, test.probe_count_up as u64)?;
        w.varint(4, test.probe_count_down as u64)?;
        w.varint(5, test.probe_size_up as u64)?;
        w.varint(6, test.probe_size_down as u64)?;
        w.varint(7, test.timeout.as_millis() as u64)?;
        w.varint(8, test.min_time_between_probes.as_millis() as u64)?;
        w.varint(9, test.time_till_resend.as_millis() as u64)?;
        w.varint(10, test.resend_extra_probes as u64)?;
        w.varint(11, test.acceptable_lost_probes as u64)?;
        w.varint(12, test.init_sync_timeout.as_millis() as u64)?;
        w.end_message()?;
    }
    for result in &response.results {
        w.begin_message(10)?;
        w.string(1, &result.site)?;
        w.varint(2, result.rtt_ms as u64)?;
        w.varint(3, result.up_bps as u64)?;
        w.varint(4, result.down_bps as u64)?;
        w.varint(5, result.hresult.raw() as u64)?;
        w.end_message()?;
    }

    Ok(frame::wrap(w.finish()?))
}

/// The parts of a client submission tests look at.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub profile: String,
    pub service_id: u32,
    pub internal_addr: String,
    pub packet_queue_remaining: u64,
    pub stall_count_comm: u64,
    pub stall_count_probe: u64,
    pub hresult: HResult,
    pub results: Vec<SubmittedResult>,
}

#[derive(Debug, Clone)]
pub struct SubmittedResult {
    pub site: String,
    pub test: String,
    pub client_addr: String,
    pub hresult: HResult,
    pub probes: Vec<ScrubbedProbe>,
}

/// Decodes a framed client submission.
pub fn decode_submission(buf: &[u8]) -> Result<Submission, WireError> {
    let r = Reader::new(frame::unwrap(buf)?);
    let mut submission = Submission {
        profile: r.string(2)?.to_string(),
        service_id: r.varint(3)? as u32,
        ..Default::default()
    };

    if let Some(modifiers) = r.messages(5).next() {
        let m = modifiers?;
        submission.internal_addr = m.string(1)?.to_string();
        submission.packet_queue_remaining = m.varint(4)?;
        submission.stall_count_comm = m.varint(5)?;
        submission.stall_count_probe = m.varint(7)?;
        submission.hresult = HResult::from_raw(m.varint(9)? as u32);
    }

    for result in r.messages(1) {
        let result = result?;
        let mut probes = Vec::new();
        for probe in result.messages(1) {
            let probe = probe?;
            probes.push(ScrubbedProbe {
                client_send_time: probe.varint(1)? as u32,
                server_receive_time: probe.varint(2)? as u32,
                server_send_delta: probe.varint(3)? as u16,
                client_receive_delta: probe.varint(4)? as u16,
            });
        }

        submission.results.push(SubmittedResult {
            site: result.string(3)?.to_string(),
            test: result.string(4)?.to_string(),
            client_addr: result.string(2)?.to_string(),
            hresult: HResult::from_raw(result.varint(5)? as u32),
            probes,
        });
    }

    Ok(submission)
}

/// A client wired to fakes sharing one manual clock.
pub struct Harness {
    pub time: Arc<ManualTime>,
    pub network: FakeNetwork,
    pub resolver: ScriptedResolver,
    pub transport: ScriptedTransport,
    reports: Arc<Mutex<Vec<ProcessedResults>>>,
    updates: Arc<AtomicUsize>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        let time = Arc::new(ManualTime::new());
        Self {
            network: FakeNetwork::new(time.clone()),
            time,
            resolver: ScriptedResolver::default(),
            transport: ScriptedTransport::default(),
            reports: Default::default(),
            updates: Default::default(),
        }
    }

    pub fn io(&self) -> ClientIo {
        ClientIo {
            time: self.time.clone(),
            sockets: Arc::new(self.network.clone()),
            resolver: Arc::new(self.resolver.clone()),
            transport: Box::new(self.transport.clone()),
        }
    }

    /// A client whose reports are collected by the harness.
    pub fn client(&self, config: ClientConfig) -> QosClient {
        let reports = self.reports.clone();
        QosClient::new(
            config,
            self.io(),
            Box::new(move |results: &ProcessedResults| {
                lock(&reports).push(results.clone())
            }),
        )
    }

    pub fn reports(&self) -> Vec<ProcessedResults> {
        lock(&self.reports).clone()
    }

    /// Updates performed by [`run_until_report`](Self::run_until_report).
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }

    /// Updates `client` every `step` until it reports or `limit` has passed
    /// on the clock. True if it reported.
    pub fn run_until_report(&self, client: &QosClient, step: Duration, limit: Duration) -> bool {
        let reported = self.reports().len();
        let mut elapsed = Duration::ZERO;

        while elapsed <= limit {
            client.update();
            self.updates.fetch_add(1, Ordering::Relaxed);
            if self.reports().len() > reported {
                return true;
            }
            self.time.advance(step);
            elapsed += step;
        }

        false
    }
}
