// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The top level state machine.
//!
//! A cycle starts in [`ModuleState::InitCoordinatorComm`], alternates
//! between talking to the coordinator and probing the sites it names, and
//! ends in [`ModuleState::Report`] which hands the processed results to the
//! caller and returns to [`ModuleState::Idle`].

use std::net::SocketAddr;
use std::sync::Arc;

use qos_core::limits::PROBE_VERSION;
use qos_core::{
    Datagram, Facility, HResult, ModuleStatus, ProbeSocket, QosAddr, RecvNotify, SocketOptions,
    Timestamp, TransportOptions,
};
use qos_probe::peek_client_request_id;
use qos_rpc::{ClientRequest, FirewallType, ProcessedResults, Site, Test};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ClientConfig, Control, StatusSelector, StatusValue};
use crate::exchange::Exchange;
use crate::request::{Reply, Request, RequestState, StepContext};
use crate::stall::{StallPhase, StallTracker};
use crate::{ClientIo, ResultCallback};

/// Where a cycle is.
///
/// Failures are not states of their own. A recoverable error records its
/// `HResult` and lands in [`InitCoordinatorComm`](Self::InitCoordinatorComm)
/// so the next call tells the coordinator. A fatal one records its `HResult`
/// and lands in [`Report`](Self::Report). Either way the error is visible
/// through `StatusSelector::HResult` and in the reported results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Idle,
    InitCoordinatorComm,
    UpdateCoordinatorComm,
    Probe,
    Report,
}

/// Where the coordinator lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Coordinator {
    pub host: String,
    pub port: u16,
}

pub(crate) struct Module {
    pub(crate) config: ClientConfig,
    pub(crate) io: ClientIo,
    callback: ResultCallback,
    notify: RecvNotify,
    /// Zero of every millisecond tick sent to the coordinator.
    pub(crate) epoch: Timestamp,

    pub(crate) state: ModuleState,
    pub(crate) hresult: HResult,
    pub(crate) coordinator: Option<Coordinator>,
    /// The submission for the next coordinator call.
    pub(crate) request: ClientRequest,
    pub(crate) exchange: Exchange,
    pub(crate) results: ProcessedResults,
    pub(crate) results_received_at: Option<Timestamp>,
    pub(crate) client_addr_from_coordinator: QosAddr,
    pub(crate) init_sync_time: Option<Timestamp>,
    process_start: Option<Timestamp>,
    stalls: StallTracker,

    socket: Option<Box<dyn ProbeSocket>>,
    current_listen_port: u16,
    requests: Vec<Request>,
    next_request_id: u16,
}

impl Module {
    pub(crate) fn new(
        config: ClientConfig,
        io: ClientIo,
        callback: ResultCallback,
        notify: RecvNotify,
    ) -> Self {
        let epoch = io.time.now();
        Self {
            config,
            io,
            callback,
            notify,
            epoch,
            state: ModuleState::Idle,
            hresult: HResult::new(Facility::Qos, ModuleStatus::Init.code(), false),
            coordinator: None,
            request: ClientRequest::default(),
            exchange: Exchange::default(),
            results: ProcessedResults::default(),
            results_received_at: None,
            client_addr_from_coordinator: QosAddr::UNKNOWN,
            init_sync_time: None,
            process_start: None,
            stalls: StallTracker::default(),
            socket: None,
            current_listen_port: 0,
            requests: Vec::new(),
            next_request_id: 0,
        }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.io.time.now()
    }

    /// Moves to `to`, releasing whatever the state being left owned.
    pub(crate) fn enter(&mut self, to: ModuleState) {
        let from = self.state;
        if from == to {
            return;
        }

        if from == ModuleState::InitCoordinatorComm {
            self.exchange.release_send_buffer();
        }
        if from == ModuleState::Report {
            self.exchange.release_recv_buffer();
        }
        if from == ModuleState::Probe {
            self.purge_requests();
        }
        if to == ModuleState::Idle {
            self.close_socket();
        }

        debug!(?from, ?to, hresult = %self.hresult, "module transition");
        self.state = to;
    }

    /// Moves to `to`, recording `status`.
    pub(crate) fn goto(&mut self, to: ModuleState, status: ModuleStatus) {
        self.hresult = HResult::new(Facility::Qos, status.code(), status.is_error());
        self.enter(to);
    }

    /// Reports a recoverable failure to the coordinator on the next call.
    pub(crate) fn error(&mut self, hresult: HResult) {
        warn!(%hresult, state = ?self.state, "module error");
        self.hresult = hresult.into_error();
        self.enter(ModuleState::InitCoordinatorComm);
    }

    /// Gives up on the cycle and reports whatever is available.
    pub(crate) fn fatal(&mut self, hresult: HResult) {
        error!(%hresult, state = ?self.state, "module fatal");
        self.hresult = hresult.into_error();
        self.exchange.release_send_buffer();
        self.exchange.release_recv_buffer();
        self.purge_requests();
        self.state = ModuleState::Report;
    }

    pub(crate) fn status_error(&mut self, status: ModuleStatus) {
        self.error(HResult::new(Facility::Qos, status.code(), true));
    }

    pub(crate) fn status_fatal(&mut self, status: ModuleStatus) {
        self.fatal(HResult::new(Facility::Qos, status.code(), true));
    }

    pub(crate) fn start(&mut self, host: &str, port: u16, profile: &str) {
        if self.state != ModuleState::Idle {
            warn!(state = ?self.state, "start ignored while a cycle is running");
            return;
        }

        info!(coordinator = host, port, profile, "starting qos cycle");

        self.results = ProcessedResults::default();
        self.results_received_at = None;
        self.request.purge_results();
        self.exchange.reset();

        self.process_start = Some(self.now());
        self.request.profile = profile.to_string();
        self.request.probe_version = PROBE_VERSION;
        self.request.modifiers.platform = std::env::consts::OS.to_string();
        self.request.modifiers.internal_addr = self.internal_addr();
        self.coordinator = Some(Coordinator {
            host: host.to_string(),
            port,
        });

        self.io.transport.configure(&TransportOptions {
            verbosity: self.config.verbosity + 1,
            ignore_cert_errors: self.config.ignore_cert_errors,
        });

        self.goto(ModuleState::InitCoordinatorComm, ModuleStatus::ProcessStarted);
    }

    /// Advances the module once.
    pub(crate) fn update(&mut self) {
        let now = self.now();

        let phase = match self.state {
            ModuleState::InitCoordinatorComm | ModuleState::UpdateCoordinatorComm => {
                StallPhase::Coordinator
            }
            ModuleState::Probe => StallPhase::Probe,
            _ => StallPhase::Other,
        };
        if let Some(gap) =
            self.stalls
                .record(now, self.config.stall_window, phase, &mut self.request.modifiers)
        {
            debug!(gap_ms = gap.as_millis() as u64, ?phase, "update stalled");
        }

        if let Some(start) = self.process_start {
            if now.duration_since(start) > self.config.max_process_time {
                self.process_start = None;
                self.status_fatal(ModuleStatus::Timeout);
            }
        }

        match self.state {
            ModuleState::Idle => self.idle(now),
            ModuleState::InitCoordinatorComm => self.message_coordinator(),
            ModuleState::UpdateCoordinatorComm => self.update_coordinator(),
            ModuleState::Probe => self.probe(now),
            ModuleState::Report => self.report(),
        }
    }

    fn idle(&mut self, now: Timestamp) {
        let retry = self.results.time_till_retry;
        let Some(received_at) = self.results_received_at else {
            return;
        };
        if retry.is_zero() || now.duration_since(received_at) <= retry {
            return;
        }

        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let profile = self.request.profile.clone();
        info!(retry_ms = retry.as_millis() as u64, "retrying qos cycle");
        self.start(&coordinator.host, coordinator.port, &profile);
    }

    fn report(&mut self) {
        self.results.hresult = self.hresult;
        self.process_start = None;

        info!(
            hresult = %self.results.hresult,
            results = self.results.results.len(),
            "reporting qos results"
        );
        (self.callback)(&self.results);

        self.goto(ModuleState::Idle, ModuleStatus::ReportComplete);
    }

    /// Drains datagrams queued on the probe socket.
    pub(crate) fn drain_socket(&mut self) {
        while let Some(datagram) = self.socket.as_mut().and_then(|s| s.try_recv()) {
            self.process_datagram(datagram);
        }
    }

    fn process_datagram(&mut self, datagram: Datagram) {
        let Some(id) = peek_client_request_id(&datagram.payload) else {
            trace!(from = %datagram.from, len = datagram.payload.len(), "dropping runt datagram");
            return;
        };
        let Some(request) = self.requests.iter_mut().find(|r| r.id() == id) else {
            debug!(request_id = id, from = %datagram.from, "reply for unknown request");
            return;
        };

        if let Reply::AddressMismatch {
            addr,
            replace: true,
        } = request.accept(&datagram, self.epoch)
        {
            let site = request.site().clone();
            let test = request.test().clone();
            self.create_request(site, test, Some(addr), 1);
        }
    }

    fn probe(&mut self, now: Timestamp) {
        self.drain_socket();

        let any_in_init = self
            .requests
            .iter()
            .any(|r| r.state() == RequestState::Init);

        for index in 0..self.requests.len() {
            let cx = StepContext {
                now,
                epoch: self.epoch,
                resolver: self.io.resolver.as_ref(),
                socket: self.socket.as_mut(),
                any_in_init,
                init_sync_time: self.init_sync_time,
                coordinator_view: self.client_addr_from_coordinator,
            };

            if let Err(status) = self.requests[index].step(cx) {
                self.status_error(status);
                return;
            }

            // harvesting swaps the last request into `index`, so the rest
            // are stepped on the next update
            if self.requests[index].is_complete() {
                self.harvest(index);
                break;
            }
        }

        if self.requests.is_empty() {
            self.goto(ModuleState::InitCoordinatorComm, ModuleStatus::RawResultsReady);
        }
    }

    fn harvest(&mut self, index: usize) {
        let request = self.requests.swap_remove(index);
        debug!(
            request_id = request.id(),
            site = %request.site().name,
            test = %request.test().name,
            hresult = %request.hresult(),
            received = request.raw().probes_received,
            took_ms = request
                .completed_at()
                .map(|t| t.duration_since(self.epoch).as_millis() as u64),
            "request complete"
        );

        if let Err(raw) = self.request.push_result(request.into_results()) {
            warn!(site = %raw.site, test = %raw.test, "dropping raw results, submission is full");
        }
    }

    /// Fans the configuration out into one request per targeted site.
    pub(crate) fn create_requests(&mut self, sites: &[Site], tests: &[Test]) -> usize {
        let sites: Vec<Arc<Site>> = sites.iter().cloned().map(Arc::new).collect();
        let mut created = 0;

        for test in tests {
            let test = Arc::new(test.clone());
            for site in sites.iter().filter(|site| test.targets(site)) {
                if self.create_request(site.clone(), test.clone(), None, 0) {
                    created += 1;
                }
            }
        }

        created
    }

    fn create_request(
        &mut self,
        site: Arc<Site>,
        test: Arc<Test>,
        server_view: Option<QosAddr>,
        creation_count: u8,
    ) -> bool {
        if self.socket.is_none() && !self.open_socket() {
            return false;
        }

        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let request = Request::new(
            id,
            self.request.service_id,
            site,
            test,
            self.now(),
            server_view,
            creation_count,
        );
        debug!(
            request_id = id,
            site = %request.site().name,
            test = %request.test().name,
            creation_count,
            "created request"
        );
        self.requests.push(request);

        true
    }

    fn open_socket(&mut self) -> bool {
        let mut options = SocketOptions {
            listen_port: self.config.requested_listen_port(),
            recv_buffer: self.config.recv_buffer,
            send_buffer: self.config.send_buffer,
            packet_queue: self.config.packet_queue,
        };

        let socket = match self.io.sockets.open(&options, self.notify.clone()) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(port = options.listen_port, "failed to bind probe socket, trying any port: {e:#}");
                options.listen_port = 0;
                match self.io.sockets.open(&options, self.notify.clone()) {
                    Ok(socket) => socket,
                    Err(e) => {
                        error!("failed to open probe socket: {e:#}");
                        return false;
                    }
                }
            }
        };

        self.current_listen_port = socket.local_addr().map_or(0, |addr| addr.port());
        info!(port = self.current_listen_port, "opened probe socket");
        self.socket = Some(socket);
        self.request.modifiers.internal_addr = self.internal_addr();

        true
    }

    fn close_socket(&mut self) {
        if self.socket.take().is_some() {
            debug!(port = self.current_listen_port, "closed probe socket");
        }
        self.current_listen_port = 0;
    }

    pub(crate) fn purge_requests(&mut self) {
        for mut request in self.requests.drain(..) {
            request.cancel();
        }
    }

    /// The client's local address, reported with the probe listen port.
    pub(crate) fn internal_addr(&self) -> QosAddr {
        let local: Option<SocketAddr> = self
            .io
            .transport
            .local_addr()
            .or_else(|| self.socket.as_ref().and_then(|s| s.local_addr().ok()));

        local.map_or(QosAddr::UNKNOWN, |addr| {
            QosAddr::from(addr).with_port(self.current_listen_port)
        })
    }

    /// Queue slots the probe socket has never needed.
    pub(crate) fn packet_queue_remaining(&self) -> u32 {
        let remaining = match &self.socket {
            Some(socket) => self
                .config
                .packet_queue
                .saturating_sub(socket.queue_high_water()),
            None => self.config.packet_queue,
        };
        remaining as u32
    }

    /// Applies a firewall hint from the platform. None is available here.
    pub(crate) fn os_firewall(&self) -> FirewallType {
        FirewallType::Unknown
    }

    pub(crate) fn control(&mut self, control: Control) {
        debug!(?control, "control");
        self.config.apply(control);
    }

    pub(crate) fn status(&self, selector: StatusSelector) -> StatusValue {
        let config = &self.config;
        match selector {
            StatusSelector::CurrentListenPort => StatusValue::Port(self.current_listen_port),
            StatusSelector::HResult => StatusValue::HResult(self.hresult),
            StatusSelector::ListenPort => StatusValue::Port(config.listen_port),
            StatusSelector::MaxProcessTime => StatusValue::Duration(config.max_process_time),
            StatusSelector::IgnoreCertErrors => StatusValue::Flag(config.ignore_cert_errors),
            StatusSelector::PacketQueue => StatusValue::Size(config.packet_queue),
            StatusSelector::RecvBuffer => StatusValue::Size(config.recv_buffer),
            StatusSelector::SendBuffer => StatusValue::Size(config.send_buffer),
            StatusSelector::ProcessedResults => StatusValue::ProcessedResults(self.results.clone()),
            StatusSelector::RawResults => StatusValue::RawResults(self.request.results().to_vec()),
            StatusSelector::LastResponse => {
                StatusValue::Bytes(self.exchange.last_response().to_vec())
            }
            StatusSelector::SoLinger => StatusValue::Linger(config.so_linger),
            StatusSelector::Verbosity => StatusValue::Level(config.verbosity),
            StatusSelector::StallWindow => StatusValue::Duration(config.stall_window),
            StatusSelector::UseHttps => StatusValue::Flag(config.use_https),
        }
    }

    pub(crate) fn request_states(&self) -> Vec<RequestState> {
        self.requests.iter().map(|r| r.state()).collect()
    }

    pub(crate) fn destroy(&mut self) {
        info!("shutting down qos client");
        self.close_socket();
        self.io.transport.close(self.config.so_linger);
        self.exchange.release_send_buffer();
        self.exchange.release_recv_buffer();
        self.purge_requests();
    }
}
