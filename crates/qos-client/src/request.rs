// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! One measurement of a test against a site.
//!
//! A request resolves the site, waits for its siblings to finish resolving,
//! then sends signed probes and folds the site's replies into its
//! [`RawResults`]. Lost replies are made up for by sending more probes until
//! the loss is acceptable or the test times out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use qos_core::limits::{
    is_compatible_probe_version, MAX_PACKET_SIZE, MAX_PROBE_COUNT, MIN_PACKET_SIZE,
    PROBE_PROTOCOL_ID,
};
use qos_core::{
    Datagram, Facility, HResult, Lookup, LookupStatus, ModuleStatus, ProbeSocket, QosAddr,
    RequestStatus, Resolver, Timestamp,
};
use qos_probe::ProbePacket;
use qos_rpc::{RawResults, Site, Test};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Init,
    InitSync,
    Send,
    Receive,
    /// Finished, successfully or not. The request's result code tells which.
    Complete,
}

/// What a request borrows from the module for one step.
pub(crate) struct StepContext<'a> {
    pub now: Timestamp,
    /// Zero of the millisecond ticks recorded in probe results.
    pub epoch: Timestamp,
    pub resolver: &'a dyn Resolver,
    pub socket: Option<&'a mut Box<dyn ProbeSocket>>,
    /// Whether any request is still resolving its site.
    pub any_in_init: bool,
    /// When the coordinator configuration was processed.
    pub init_sync_time: Option<Timestamp>,
    /// The client's address as seen by the coordinator.
    pub coordinator_view: QosAddr,
}

/// The outcome of handing a datagram to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Rejected(RequestStatus),
    Saved,
    Completed,
    /// The site sees the client at another address. The request failed; a
    /// replacement declaring `addr` should be created if `replace` is set.
    AddressMismatch { addr: QosAddr, replace: bool },
}

/// What the receive step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveAction {
    Wait,
    SendNext,
    Resend { probes_to_send: usize },
    CompleteAcceptable,
}

/// Decides what a request in `Receive` does next.
pub(crate) fn receive_action(
    test: &Test,
    sent: usize,
    probes_to_send: usize,
    received: usize,
    since_last_send: Duration,
) -> ReceiveAction {
    if sent >= MAX_PROBE_COUNT {
        return ReceiveAction::Wait;
    }

    if sent < probes_to_send && since_last_send > test.min_time_between_probes {
        return ReceiveAction::SendNext;
    }

    let expected = test.expected_replies();
    if received < expected && since_last_send > test.time_till_resend {
        let missing = expected - received;
        if missing > test.acceptable_lost_probes as usize {
            let down = (test.probe_count_down as usize).max(1);
            let more = (missing / down).max(1) + test.resend_extra_probes as usize;
            return ReceiveAction::Resend {
                probes_to_send: probes_to_send + more,
            };
        }
        return ReceiveAction::CompleteAcceptable;
    }

    ReceiveAction::Wait
}

/// The code a timed out request reports.
pub(crate) fn timeout_status(received: usize, last_error: Option<RequestStatus>) -> RequestStatus {
    match last_error {
        Some(status) => status,
        None if received > 0 => RequestStatus::TimeoutPartial,
        None => RequestStatus::Timeout,
    }
}

fn site_is_valid(site: &Site) -> bool {
    site.port != 0
        && !site.name.is_empty()
        && !site.addr.is_empty()
        && is_compatible_probe_version(site.probe_version)
}

fn test_is_valid(test: &Test) -> bool {
    !test.name.is_empty()
        && !test.site.is_empty()
        && (test.probe_count_up == 1 || test.probe_count_down == 1)
}

fn socket_error(e: &io::Error) -> HResult {
    let code = e
        .raw_os_error()
        .map_or(-1, |code| -(code.clamp(0, i16::MAX as i32) as i16));
    HResult::new(Facility::Socket, code, true)
}

pub(crate) struct Request {
    id: u16,
    service_id: u32,
    site: Arc<Site>,
    test: Arc<Test>,
    state: RequestState,
    hresult: HResult,
    lookup: Option<Box<dyn Lookup>>,
    server_addr: Option<SocketAddr>,
    raw: RawResults,
    /// The address declared in outgoing probes.
    probe_addr: QosAddr,
    probes_to_send: usize,
    started: Timestamp,
    last_sent: Option<Timestamp>,
    completed: Option<Timestamp>,
    creation_count: u8,
    last_error: Option<RequestStatus>,
}

impl Request {
    /// Creates a request. Invalid sites and tests complete immediately with
    /// an error.
    pub(crate) fn new(
        id: u16,
        service_id: u32,
        site: Arc<Site>,
        test: Arc<Test>,
        now: Timestamp,
        server_view: Option<QosAddr>,
        creation_count: u8,
    ) -> Self {
        let mut raw = RawResults::new(&site.name, &test.name);
        if let Some(addr) = server_view {
            raw.client_addr_from_server = addr;
        }

        let mut request = Request {
            id,
            service_id,
            probes_to_send: test.probe_count_up as usize,
            site,
            test,
            state: RequestState::Init,
            hresult: HResult::new(Facility::Qos, RequestStatus::Init.code(), false),
            lookup: None,
            server_addr: None,
            raw,
            probe_addr: QosAddr::UNKNOWN,
            started: now,
            last_sent: None,
            completed: None,
            creation_count,
            last_error: None,
        };

        if !site_is_valid(&request.site) {
            request.fail(now, RequestStatus::SiteInvalid);
        } else if !test_is_valid(&request.test) {
            request.fail(now, RequestStatus::TestInvalid);
        }

        request
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == RequestState::Complete
    }

    pub(crate) fn site(&self) -> &Arc<Site> {
        &self.site
    }

    pub(crate) fn test(&self) -> &Arc<Test> {
        &self.test
    }

    pub(crate) fn raw(&self) -> &RawResults {
        &self.raw
    }

    /// Consumes the request, stamping its result code into its results.
    pub(crate) fn into_results(mut self) -> RawResults {
        self.raw.hresult = self.hresult;
        self.raw
    }

    fn goto(&mut self, now: Timestamp, state: RequestState, status: RequestStatus) {
        debug!(
            request_id = self.id,
            site = %self.site.name,
            test = %self.test.name,
            from = ?self.state,
            to = ?state,
            code = status.code(),
            "request transition"
        );

        self.state = state;
        self.hresult = HResult::new(Facility::Qos, status.code(), status.is_error());
        if state == RequestState::Complete {
            self.completed = Some(now);
        }
    }

    fn fail(&mut self, now: Timestamp, status: RequestStatus) {
        self.goto(now, RequestState::Complete, status);
        self.hresult = HResult::new(Facility::Qos, status.code(), true);
    }

    fn fail_with(&mut self, now: Timestamp, hresult: HResult) {
        debug!(request_id = self.id, site = %self.site.name, %hresult, "request failed");
        self.state = RequestState::Complete;
        self.hresult = hresult;
        self.completed = Some(now);
    }

    /// Advances the request once. An error asks the module to fail the
    /// whole cycle.
    pub(crate) fn step(&mut self, cx: StepContext<'_>) -> Result<(), ModuleStatus> {
        let now = cx.now;
        match self.state {
            RequestState::Init => self.init(cx),
            RequestState::InitSync => self.init_sync(cx),
            RequestState::Send => self.send(cx)?,
            RequestState::Receive => self.receive(now),
            RequestState::Complete => return Ok(()),
        }

        if self.state != RequestState::Complete
            && now.duration_since(self.started) > self.test.timeout
        {
            let status = timeout_status(self.raw.probes_received, self.last_error);
            self.fail(now, status);
        }

        Ok(())
    }

    fn init(&mut self, cx: StepContext<'_>) {
        if self.lookup.is_none() {
            match cx.resolver.lookup(&self.site.addr) {
                Ok(lookup) => self.lookup = Some(lookup),
                Err(e) => {
                    warn!(request_id = self.id, site = %self.site.name, "failed to start lookup: {e:#}");
                    self.fail(cx.now, RequestStatus::SocketLookupAlloc);
                    return;
                }
            }
        }

        let Some(lookup) = self.lookup.as_mut() else {
            return;
        };

        match lookup.poll() {
            LookupStatus::Pending => {}
            LookupStatus::Resolved(ip) => {
                self.lookup = None;
                self.server_addr = Some(SocketAddr::new(ip, self.site.port));
                self.goto(cx.now, RequestState::InitSync, RequestStatus::SocketLookupSuccess);
            }
            LookupStatus::Failed => {
                self.lookup = None;
                self.fail(cx.now, RequestStatus::SocketLookupUpdate);
            }
        }
    }

    fn init_sync(&mut self, cx: StepContext<'_>) {
        let waited_long_enough = cx
            .init_sync_time
            .map_or(true, |t| cx.now.duration_since(t) > self.test.init_sync_timeout);

        if waited_long_enough || !cx.any_in_init {
            self.goto(cx.now, RequestState::Send, RequestStatus::InitSyncSuccess);
        }
    }

    fn send(&mut self, cx: StepContext<'_>) -> Result<(), ModuleStatus> {
        let now = cx.now;
        let (Some(socket), Some(target)) = (cx.socket, self.server_addr) else {
            self.fail(now, RequestStatus::SiteInvalid);
            return Ok(());
        };

        self.probe_addr = if self.raw.client_addr_from_server.is_known() {
            self.raw.client_addr_from_server
        } else {
            cx.coordinator_view
        };

        let burst = if self.test.min_time_between_probes.is_zero() {
            self.probes_to_send.saturating_sub(self.raw.probes_sent)
        } else {
            1
        };

        let mut buf = vec![0u8; (self.test.probe_size_up as usize).clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE)];
        for _ in 0..burst {
            if self.raw.probes_sent >= MAX_PROBE_COUNT {
                self.last_sent = Some(now);
                self.goto(now, RequestState::Receive, RequestStatus::SentMaxProbes);
                return Ok(());
            }

            let probe = ProbePacket {
                service_request_id: self.service_id,
                client_request_id: self.id,
                probe_size_up: buf.len() as u16,
                probe_size_down: self.test.probe_size_down,
                probe_count_up: self.raw.probes_sent as u8,
                probe_count_down: self.test.probe_count_down,
                expected_probe_count_up: self.test.probe_count_up,
                client_addr: self.probe_addr,
                ..Default::default()
            };
            match probe.serialize(&mut buf, &self.site.key) {
                Ok(MIN_PACKET_SIZE) => {}
                _ => return Err(ModuleStatus::SerializedPacketUnexpectedSize),
            }

            match socket.send_to(&buf, target) {
                Ok(n) if n == buf.len() => {
                    let tick = now.ticks_since(cx.epoch);
                    // a single up probe fans out into many replies, so a
                    // resend may land on a slot a reply already filled
                    if let Some(slot) = self.raw.slot_mut(self.raw.probes_sent) {
                        if slot.server_receive_time.is_none() {
                            slot.client_send_time = Some(tick);
                        }
                    }
                    trace!(request_id = self.id, seq = self.raw.probes_sent, %target, "sent probe");
                    self.raw.probes_sent += 1;
                    self.last_sent = Some(now);
                    self.goto(now, RequestState::Receive, RequestStatus::SendSuccess);
                }
                Ok(0) => {
                    self.goto(now, RequestState::Receive, RequestStatus::SendTryAgain);
                    return Ok(());
                }
                Ok(n) => {
                    warn!(request_id = self.id, sent = n, len = buf.len(), "short probe send");
                    self.fail_with(now, HResult::new(Facility::Socket, -1, true));
                    return Ok(());
                }
                Err(e) => {
                    warn!(request_id = self.id, %target, "probe send failed: {e}");
                    self.fail_with(now, socket_error(&e));
                    return Ok(());
                }
            }
        }

        if burst == 0 {
            self.goto(now, RequestState::Receive, RequestStatus::SendSuccess);
        }

        Ok(())
    }

    fn receive(&mut self, now: Timestamp) {
        let since_last_send = now.duration_since(self.last_sent.unwrap_or(self.started));
        let action = receive_action(
            &self.test,
            self.raw.probes_sent,
            self.probes_to_send,
            self.raw.probes_received,
            since_last_send,
        );

        match action {
            ReceiveAction::Wait => {}
            ReceiveAction::SendNext => {
                self.goto(now, RequestState::Send, RequestStatus::SendNextProbe)
            }
            ReceiveAction::Resend { probes_to_send } => {
                debug!(
                    request_id = self.id,
                    received = self.raw.probes_received,
                    probes_to_send,
                    "resending lost probes"
                );
                self.probes_to_send = probes_to_send;
                self.goto(now, RequestState::Send, RequestStatus::SendLostProbes);
            }
            ReceiveAction::CompleteAcceptable => {
                self.goto(now, RequestState::Complete, RequestStatus::CompleteAcceptable)
            }
        }
    }

    /// Checks a decoded reply against this request.
    fn validate(&self, probe: &ProbePacket) -> Result<(), RequestStatus> {
        let sizes = MIN_PACKET_SIZE..=MAX_PACKET_SIZE;

        if probe.protocol != PROBE_PROTOCOL_ID {
            return Err(RequestStatus::ProbeProtocol);
        }
        if !is_compatible_probe_version(probe.version) {
            return Err(RequestStatus::ProbeVersion);
        }
        if (probe.probe_size_up as usize) < MIN_PACKET_SIZE {
            return Err(RequestStatus::ProbeUpTooSmall);
        }
        if (probe.probe_size_down as usize) < MIN_PACKET_SIZE {
            return Err(RequestStatus::ProbeDownTooSmall);
        }
        if !sizes.contains(&(probe.probe_size_up as usize)) {
            return Err(RequestStatus::ProbeUpTooLarge);
        }
        if !sizes.contains(&(probe.probe_size_down as usize)) {
            return Err(RequestStatus::ProbeDownTooLarge);
        }
        if !probe.client_addr.is_supported() {
            return Err(RequestStatus::ProbeMyAddress);
        }
        if probe.server_receive_time == 0 {
            return Err(RequestStatus::ProbeServerTime);
        }
        // the down counter indexes a result slot
        if probe.probe_count_down as usize >= MAX_PROBE_COUNT {
            return Err(RequestStatus::ProbeDownTooMany);
        }
        if probe.probe_count_up as usize > MAX_PROBE_COUNT {
            return Err(RequestStatus::ProbeUpTooMany);
        }
        if probe.service_request_id != self.service_id {
            return Err(RequestStatus::ProbeServiceRequestId);
        }
        if self.is_complete() {
            return Err(RequestStatus::ProbeAlreadyComplete);
        }
        let filled = self
            .raw
            .slot(probe.probe_count_down as usize)
            .is_some_and(|slot| slot.server_receive_time.is_some());
        if filled {
            return Err(RequestStatus::ProbeAlreadyReceived);
        }

        Ok(())
    }

    fn reject(&mut self, status: RequestStatus) -> Reply {
        debug!(request_id = self.id, site = %self.site.name, code = status.code(), "rejected probe reply");
        self.last_error = Some(status);
        Reply::Rejected(status)
    }

    /// Authenticates, validates and records a reply from the site.
    pub(crate) fn accept(&mut self, datagram: &Datagram, epoch: Timestamp) -> Reply {
        let probe = match ProbePacket::deserialize(&datagram.payload, &self.site.key) {
            Ok(probe) => probe,
            Err(e) => {
                trace!(request_id = self.id, from = %datagram.from, "{e}");
                return self.reject(RequestStatus::ProbeHmac);
            }
        };

        if let Err(status) = self.validate(&probe) {
            return self.reject(status);
        }

        let now = datagram.received;
        let seq = probe.probe_count_down as usize;
        let first_send = self.raw.slot(0).and_then(|slot| slot.client_send_time);
        let Some(slot) = self.raw.slot_mut(seq) else {
            return Reply::Rejected(RequestStatus::ProbeDownTooMany);
        };

        slot.server_receive_time = Some(probe.server_receive_time);
        slot.server_send_delta = probe.server_send_delta;
        if self.test.probe_count_up == 1 {
            slot.client_send_time = first_send;
        }
        let received_tick = now.ticks_since(epoch);
        slot.client_receive_delta = slot.client_send_time.map_or(0, |sent| {
            received_tick.wrapping_sub(sent).min(u16::MAX as u32) as u16
        });

        trace!(
            request_id = self.id,
            seq,
            rtt_ms = slot.client_receive_delta,
            "saved probe reply"
        );

        self.raw.client_addr_from_server = probe.client_addr;
        self.raw.probes_received += 1;
        self.raw.high_water = self.raw.high_water.max(seq);

        let needs_exact_addr = self.test.probe_count_down > 1
            || self.test.probe_size_down as usize > MIN_PACKET_SIZE;
        if needs_exact_addr && !probe.client_addr.same_host(&self.probe_addr) {
            warn!(
                request_id = self.id,
                site = %self.site.name,
                declared = %self.probe_addr,
                seen = %probe.client_addr,
                "site sees a different client address"
            );
            let replace = self.creation_count == 0;
            self.fail(now, RequestStatus::ExternalAddressMismatch);
            return Reply::AddressMismatch {
                addr: probe.client_addr,
                replace,
            };
        }

        if self.raw.probes_received >= self.test.expected_replies() {
            self.goto(now, RequestState::Complete, RequestStatus::Complete);
            return Reply::Completed;
        }

        Reply::Saved
    }

    /// Abandons any lookup in flight.
    pub(crate) fn cancel(&mut self) {
        self.lookup = None;
    }

    pub(crate) fn hresult(&self) -> HResult {
        self.hresult
    }

    pub(crate) fn completed_at(&self) -> Option<Timestamp> {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qos_core::{ManualTime, Time};
    use qos_probe::SecureKey;

    const KEY: SecureKey = *b"0123456789abcdef";

    fn site() -> Arc<Site> {
        Arc::new(Site {
            name: "iad".into(),
            addr: "iad.example.net".into(),
            port: 3659,
            key: KEY,
            probe_version: 0x0200,
        })
    }

    fn test(up: u8, down: u8) -> Test {
        Test {
            name: "latency".into(),
            probe_count_up: up,
            probe_count_down: down,
            time_till_resend: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn reply(request: &Request, seq: u8, from: QosAddr) -> Datagram {
        let probe = ProbePacket {
            service_request_id: request.service_id,
            client_request_id: request.id,
            server_receive_time: 1000 + seq as u32,
            server_send_delta: 1,
            probe_count_down: seq,
            client_addr: from,
            ..Default::default()
        };
        let mut buf = vec![0u8; MIN_PACKET_SIZE];
        probe.serialize(&mut buf, &KEY).unwrap();

        Datagram {
            payload: buf.into(),
            from: "192.0.2.1:3659".parse().unwrap(),
            received: ManualTime::new().now(),
        }
    }

    #[test]
    fn receive_sends_next_after_spacing() {
        let mut t = test(4, 1);
        t.min_time_between_probes = Duration::from_millis(50);

        assert_eq!(
            receive_action(&t, 1, 4, 0, Duration::from_millis(10)),
            ReceiveAction::Wait
        );
        assert_eq!(
            receive_action(&t, 1, 4, 0, Duration::from_millis(60)),
            ReceiveAction::SendNext
        );
    }

    #[test]
    fn receive_resends_missing_replies() {
        let mut t = test(1, 10);
        t.acceptable_lost_probes = 2;
        t.resend_extra_probes = 1;

        // 6 of 10 missing, one extra probe per round on top
        assert_eq!(
            receive_action(&t, 1, 1, 4, Duration::from_millis(250)),
            ReceiveAction::Resend { probes_to_send: 3 }
        );
        assert_eq!(
            receive_action(&t, 1, 1, 8, Duration::from_millis(250)),
            ReceiveAction::CompleteAcceptable
        );
        assert_eq!(
            receive_action(&t, 1, 1, 4, Duration::from_millis(150)),
            ReceiveAction::Wait
        );
    }

    #[test]
    fn receive_stops_at_probe_ceiling() {
        let t = test(1, 1);
        assert_eq!(
            receive_action(&t, MAX_PROBE_COUNT, 40, 0, Duration::from_secs(5)),
            ReceiveAction::Wait
        );
    }

    #[test]
    fn timeout_reflects_progress() {
        assert_eq!(timeout_status(0, None), RequestStatus::Timeout);
        assert_eq!(timeout_status(3, None), RequestStatus::TimeoutPartial);
        assert_eq!(
            timeout_status(3, Some(RequestStatus::ProbeHmac)),
            RequestStatus::ProbeHmac
        );
    }

    #[test]
    fn invalid_configuration_fails_at_creation() {
        let now = ManualTime::new().now();

        let mut bad_site = (*site()).clone();
        bad_site.port = 0;
        let request = Request::new(1, 9, Arc::new(bad_site), Arc::new(test(1, 1)), now, None, 0);
        assert!(request.is_complete());
        assert_eq!(request.hresult().code(), RequestStatus::SiteInvalid.code());
        assert!(request.hresult().is_error());

        let request = Request::new(2, 9, site(), Arc::new(test(2, 2)), now, None, 0);
        assert_eq!(request.hresult().code(), RequestStatus::TestInvalid.code());
    }

    #[test]
    fn replies_are_validated_before_saving() {
        let now = ManualTime::new().now();
        let me: QosAddr = "v4[203.0.113.9]:7673".parse().unwrap();
        let mut request = Request::new(3, 9, site(), Arc::new(test(1, 2)), now, None, 0);
        request.probe_addr = me;

        let mut tampered = reply(&request, 0, me).payload.to_vec();
        tampered[20] ^= 0x01;
        let tampered = Datagram {
            payload: tampered.into(),
            ..reply(&request, 0, me)
        };
        assert_eq!(
            request.accept(&tampered, now),
            Reply::Rejected(RequestStatus::ProbeHmac)
        );

        request.service_id = 10;
        let stale = reply(&request, 0, me);
        request.service_id = 9;
        assert_eq!(
            request.accept(&stale, now),
            Reply::Rejected(RequestStatus::ProbeServiceRequestId)
        );

        let unknown_family = reply(&request, 0, QosAddr::UNKNOWN);
        assert_eq!(
            request.accept(&unknown_family, now),
            Reply::Rejected(RequestStatus::ProbeMyAddress)
        );

        assert_eq!(request.accept(&reply(&request, 0, me), now), Reply::Saved);
        assert_eq!(request.last_error, Some(RequestStatus::ProbeMyAddress));
    }

    #[test]
    fn duplicate_slots_are_rejected_and_completion_counts_replies() {
        let now = ManualTime::new().now();
        let me: QosAddr = "v4[203.0.113.9]:7673".parse().unwrap();
        let mut request = Request::new(4, 9, site(), Arc::new(test(1, 2)), now, None, 0);
        request.probe_addr = me;
        request.state = RequestState::Receive;

        assert_eq!(request.accept(&reply(&request, 0, me), now), Reply::Saved);
        assert_eq!(
            request.accept(&reply(&request, 0, me), now),
            Reply::Rejected(RequestStatus::ProbeAlreadyReceived)
        );
        assert_eq!(request.accept(&reply(&request, 1, me), now), Reply::Completed);
        assert_eq!(
            request.accept(&reply(&request, 1, me), now),
            Reply::Rejected(RequestStatus::ProbeAlreadyComplete)
        );

        assert_eq!(request.raw().probes_received, 2);
        assert_eq!(request.raw().high_water, 1);
        assert_eq!(request.raw().client_addr_from_server, me);
    }

    #[test]
    fn address_mismatch_replaces_once() {
        let now = ManualTime::new().now();
        let declared: QosAddr = "v4[203.0.113.9]:7673".parse().unwrap();
        let seen: QosAddr = "v4[198.51.100.4]:40000".parse().unwrap();

        let mut original = Request::new(5, 9, site(), Arc::new(test(1, 2)), now, None, 0);
        original.probe_addr = declared;
        assert_eq!(
            original.accept(&reply(&original, 0, seen), now),
            Reply::AddressMismatch {
                addr: seen,
                replace: true
            }
        );
        assert!(original.is_complete());
        assert_eq!(
            original.hresult().code(),
            RequestStatus::ExternalAddressMismatch.code()
        );

        let mut replacement =
            Request::new(6, 9, site(), Arc::new(test(1, 2)), now, Some(seen), 1);
        replacement.probe_addr = declared;
        assert_eq!(
            replacement.accept(&reply(&replacement, 0, seen), now),
            Reply::AddressMismatch {
                addr: seen,
                replace: false
            }
        );
    }

    #[test]
    fn small_single_reply_tests_tolerate_address_changes() {
        let now = ManualTime::new().now();
        let declared: QosAddr = "v4[203.0.113.9]:7673".parse().unwrap();
        let seen: QosAddr = "v4[198.51.100.4]:40000".parse().unwrap();

        let mut request = Request::new(7, 9, site(), Arc::new(test(1, 1)), now, None, 0);
        request.probe_addr = declared;
        assert_eq!(request.accept(&reply(&request, 0, seen), now), Reply::Completed);
        assert!(!request.hresult().is_error());
    }
}
