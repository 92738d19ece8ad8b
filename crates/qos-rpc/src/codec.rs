//! Encoding of [`ClientRequest`] and decoding of [`CoordinatorResponse`].

use std::fmt;
use std::time::Duration;

use qos_core::limits::{
    MAX_ACCEPTABLE_LOST_PROBES, MAX_CONTROL_CONFIGS, MAX_INIT_SYNC_TIME, MAX_PACKET_SIZE,
    MAX_PROBE_COUNT, MAX_RESEND_EXTRA_PROBES, MAX_RESEND_TIME, MAX_SITES, MAX_TESTS,
    MAX_TIMEOUT, MAX_TIME_BETWEEN_PROBES, MIN_PACKET_SIZE, MIN_PROBE_COUNT, MIN_RESEND_TIME,
    MIN_TIMEOUT, SECURE_KEY_LENGTH,
};
use qos_core::HResult;

use crate::frame::{self, HEADER_LEN};
use crate::model::{
    ClientModifiers, ClientRequest, ControlConfig, CoordinatorResponse, FirewallType, RawResults,
    Site, Test, TestResult,
};
use crate::wire::{Reader, WireError, Writer};

/// Bytes reserved for everything but the raw results.
const BASE_ESTIMATE: usize = 1024;
/// Bytes reserved per raw result.
const RESULT_ESTIMATE: usize = 1024;

/// Why a request could not be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The encoded request does not fit the buffer limit.
    TooLarge,
    Wire(WireError),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::TooLarge => write!(f, "client request exceeds buffer limit"),
            EncodeError::Wire(e) => write!(f, "encoding client request: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<WireError> for EncodeError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Full => EncodeError::TooLarge,
            e => EncodeError::Wire(e),
        }
    }
}

/// Why a response could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Wire(WireError),
    /// A repeated field held more entries than the client accepts.
    TooMany { what: &'static str, max: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Wire(e) => write!(f, "decoding coordinator response: {e}"),
            DecodeError::TooMany { what, max } => {
                write!(f, "coordinator response has more than {max} {what}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<WireError> for DecodeError {
    fn from(e: WireError) -> Self {
        DecodeError::Wire(e)
    }
}

/// Size of the buffer to allocate for a request holding `results` raw
/// results.
pub fn estimate_encoded_size(results: usize) -> usize {
    BASE_ESTIMATE + RESULT_ESTIMATE * results
}

/// A probe slot as sent to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrubbedProbe {
    pub client_send_time: u32,
    pub server_receive_time: u32,
    pub server_send_delta: u16,
    pub client_receive_delta: u16,
}

/// Rebases the probe slots `0..=high_water` so the earliest client and
/// server times become 1, and marks unfilled values with all ones.
pub fn scrub(raw: &RawResults) -> Vec<ScrubbedProbe> {
    let probes = raw.probes();
    let slots = (raw.high_water + 1).min(probes.len());
    let probes = &probes[..slots];

    let min_send = probes.iter().filter_map(|p| p.client_send_time).min();
    let min_recv = probes.iter().filter_map(|p| p.server_receive_time).min();
    let rebase = |value: u32, min: Option<u32>| value.wrapping_sub(min.unwrap_or(1).wrapping_sub(1));

    probes
        .iter()
        .map(|probe| {
            let client_send_time = probe
                .client_send_time
                .map_or(u32::MAX, |t| rebase(t, min_send));

            match probe.server_receive_time {
                Some(t) => ScrubbedProbe {
                    client_send_time,
                    server_receive_time: rebase(t, min_recv),
                    server_send_delta: probe.server_send_delta,
                    client_receive_delta: probe.client_receive_delta,
                },
                None => ScrubbedProbe {
                    client_send_time,
                    server_receive_time: u32::MAX,
                    server_send_delta: u16::MAX,
                    client_receive_delta: u16::MAX,
                },
            }
        })
        .collect()
}

/// Encodes and frames `request`, reusing `buf`'s allocation. Fails when the
/// framed message would exceed `limit` bytes.
pub fn encode_client_request(
    request: &ClientRequest,
    buf: Vec<u8>,
    limit: usize,
) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::new(buf, limit.saturating_sub(HEADER_LEN));

    w.string(2, &request.profile)?;
    w.varint(3, request.service_id as u64)?;
    w.varint(4, request.probe_version as u64)?;
    encode_modifiers(&mut w, &request.modifiers)?;
    for result in request.results() {
        encode_raw_results(&mut w, result)?;
    }

    let body = w.finish()?;
    tracing::debug!(
        len = body.len(),
        results = request.results().len(),
        "encoded client request"
    );

    Ok(frame::wrap(body))
}

fn encode_modifiers(w: &mut Writer, m: &ClientModifiers) -> Result<(), WireError> {
    w.begin_message(5)?;
    w.string(1, &m.internal_addr.to_string())?;
    w.string(2, &m.platform)?;
    w.varint(3, m.os_firewall.raw())?;
    w.varint(4, m.packet_queue_remaining as u64)?;
    w.varint(5, m.stall_count_comm as u64)?;
    w.varint(7, m.stall_count_probe as u64)?;
    w.varint(6, m.stall_duration_comm.as_millis() as u64)?;
    w.varint(8, m.stall_duration_probe.as_millis() as u64)?;
    w.varint(9, m.hresult.raw() as u64)?;
    w.end_message()
}

fn encode_raw_results(w: &mut Writer, raw: &RawResults) -> Result<(), WireError> {
    w.begin_message(1)?;
    w.varint(5, raw.hresult.raw() as u64)?;
    w.string(3, &raw.site)?;
    w.string(4, &raw.test)?;
    w.string(2, &raw.client_addr_from_server.to_string())?;

    if raw.probes_received > 0 {
        for probe in scrub(raw) {
            w.begin_message(1)?;
            w.varint(1, probe.client_send_time as u64)?;
            w.varint(2, probe.server_receive_time as u64)?;
            w.varint(3, probe.server_send_delta as u64)?;
            w.varint(4, probe.client_receive_delta as u64)?;
            w.end_message()?;
        }
    }

    w.end_message()
}

/// Unframes and decodes a coordinator response.
pub fn decode_coordinator_response(buf: &[u8]) -> Result<CoordinatorResponse, DecodeError> {
    let r = Reader::new(frame::unwrap(buf)?);

    let mut response = CoordinatorResponse {
        service_id: r.varint(2)? as u32,
        client_addr_from_coordinator: r.string(3)?.parse().unwrap_or_default(),
        firewall_type: FirewallType::from_raw(r.varint(4)?),
        time_till_retry: Duration::from_millis(r.varint(5)?),
        client_external_addr: r.string(6)?.parse().unwrap_or_default(),
        ..Default::default()
    };

    for site in r.messages(7) {
        bounded_push(&mut response.sites, decode_site(&site?)?, MAX_SITES, "sites")?;
    }
    for config in r.messages(8) {
        let config = config?;
        let config = ControlConfig {
            name: config.string(1)?.to_string(),
            value: config.varint(2)? as i32,
            text: config.string(3)?.to_string(),
        };
        bounded_push(
            &mut response.control_configs,
            config,
            MAX_CONTROL_CONFIGS,
            "control configs",
        )?;
    }
    for test in r.messages(9) {
        bounded_push(&mut response.tests, decode_test(&test?)?, MAX_TESTS, "tests")?;
    }
    for result in r.messages(10) {
        bounded_push(
            &mut response.results,
            decode_test_result(&result?)?,
            MAX_SITES,
            "site results",
        )?;
    }

    tracing::debug!(
        service_id = response.service_id,
        sites = response.sites.len(),
        tests = response.tests.len(),
        results = response.results.len(),
        "decoded coordinator response"
    );

    Ok(response)
}

fn bounded_push<T>(
    list: &mut Vec<T>,
    item: T,
    max: usize,
    what: &'static str,
) -> Result<(), DecodeError> {
    if list.len() >= max {
        return Err(DecodeError::TooMany { what, max });
    }
    list.push(item);
    Ok(())
}

fn decode_site(r: &Reader<'_>) -> Result<Site, DecodeError> {
    let mut key = [0u8; SECURE_KEY_LENGTH];
    let raw_key = r.bytes(4)?;
    let len = raw_key.len().min(SECURE_KEY_LENGTH);
    key[..len].copy_from_slice(&raw_key[..len]);

    Ok(Site {
        name: r.string(1)?.to_string(),
        addr: r.string(2)?.to_string(),
        port: u16::try_from(r.varint(3)?).unwrap_or(0),
        key,
        probe_version: u16::try_from(r.varint(5)?).unwrap_or(0),
    })
}

fn clamp_count(value: u64, max: usize) -> u8 {
    value.clamp(MIN_PROBE_COUNT as u64, max as u64) as u8
}

fn clamp_size(value: u64) -> u16 {
    value.clamp(MIN_PACKET_SIZE as u64, MAX_PACKET_SIZE as u64) as u16
}

fn clamp_millis(value: u64, min: Duration, max: Duration) -> Duration {
    Duration::from_millis(value).clamp(min, max)
}

fn decode_test(r: &Reader<'_>) -> Result<Test, DecodeError> {
    Ok(Test {
        name: r.string(1)?.to_string(),
        site: r.string(2)?.to_string(),
        probe_count_up: clamp_count(r.varint(3)?, MAX_PROBE_COUNT),
        probe_count_down: clamp_count(r.varint(4)?, MAX_PROBE_COUNT),
        probe_size_up: clamp_size(r.varint(5)?),
        probe_size_down: clamp_size(r.varint(6)?),
        timeout: clamp_millis(r.varint(7)?, MIN_TIMEOUT, MAX_TIMEOUT),
        min_time_between_probes: clamp_millis(r.varint(8)?, Duration::ZERO, MAX_TIME_BETWEEN_PROBES),
        time_till_resend: clamp_millis(r.varint(9)?, MIN_RESEND_TIME, MAX_RESEND_TIME),
        resend_extra_probes: r.varint(10)?.min(MAX_RESEND_EXTRA_PROBES as u64) as u8,
        acceptable_lost_probes: r.varint(11)?.min(MAX_ACCEPTABLE_LOST_PROBES as u64) as u8,
        init_sync_timeout: clamp_millis(r.varint(12)?, Duration::ZERO, MAX_INIT_SYNC_TIME),
    })
}

fn decode_test_result(r: &Reader<'_>) -> Result<TestResult, DecodeError> {
    Ok(TestResult {
        site: r.string(1)?.to_string(),
        rtt_ms: r.varint(2)? as u32,
        up_bps: r.varint(3)? as u32,
        down_bps: r.varint(4)? as u32,
        hresult: HResult::from_raw(r.varint(5)? as u32),
    })
}
