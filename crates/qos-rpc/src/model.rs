//! Types exchanged with the coordinator: the sites and tests it hands down,
//! the raw probe timings the client collects, and the processed results it
//! sends back.

use std::time::Duration;

use qos_core::limits::{MAX_PROBE_COUNT, MAX_RESULTS, MIN_PACKET_SIZE, SECURE_KEY_LENGTH};
use qos_core::{HResult, QosAddr};
use serde::{Serialize, Serializer};

/// The value of [`Test::site`] which targets every site.
pub const ALL_SITES: &str = "ALL";

/// A measurement endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Site {
    pub name: String,
    /// Host name or address literal of the probe endpoint.
    pub addr: String,
    pub port: u16,
    /// Shared secret used to sign probes, zero padded.
    pub key: [u8; SECURE_KEY_LENGTH],
    pub probe_version: u16,
}

/// Parameters of one kind of measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Test {
    pub name: String,
    /// [`ALL_SITES`], or text naming the sites this test runs against.
    pub site: String,
    pub probe_count_up: u8,
    pub probe_count_down: u8,
    pub probe_size_up: u16,
    pub probe_size_down: u16,
    pub timeout: Duration,
    pub min_time_between_probes: Duration,
    pub time_till_resend: Duration,
    pub resend_extra_probes: u8,
    pub acceptable_lost_probes: u8,
    pub init_sync_timeout: Duration,
}

impl Default for Test {
    fn default() -> Self {
        Self {
            name: String::new(),
            site: ALL_SITES.to_string(),
            probe_count_up: 1,
            probe_count_down: 1,
            probe_size_up: MIN_PACKET_SIZE as u16,
            probe_size_down: MIN_PACKET_SIZE as u16,
            timeout: Duration::from_secs(7),
            min_time_between_probes: Duration::ZERO,
            time_till_resend: Duration::from_millis(200),
            resend_extra_probes: 0,
            acceptable_lost_probes: 0,
            init_sync_timeout: Duration::ZERO,
        }
    }
}

impl Test {
    /// Whether this test should run against `site`.
    pub fn targets(&self, site: &Site) -> bool {
        self.site == ALL_SITES || self.site.contains(site.name.as_str())
    }

    /// Replies needed for the test to complete without loss.
    pub fn expected_replies(&self) -> usize {
        self.probe_count_up as usize * self.probe_count_down as usize
    }
}

/// A coordinator supplied override of one client tunable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlConfig {
    /// Four character selector, e.g. `"stwi"`.
    pub name: String,
    pub value: i32,
    pub text: String,
}

/// The coordinator's classification of the client's NAT or firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallType {
    #[default]
    Unknown,
    Open,
    Moderate,
    Strict,
}

impl FirewallType {
    /// Maps a wire value, anything out of range is `Unknown`.
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            1 => FirewallType::Open,
            2 => FirewallType::Moderate,
            3 => FirewallType::Strict,
            _ => FirewallType::Unknown,
        }
    }

    pub fn raw(self) -> u64 {
        self as u64
    }
}

/// One site's processed measurement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TestResult {
    pub site: String,
    pub rtt_ms: u32,
    pub up_bps: u32,
    pub down_bps: u32,
    pub hresult: HResult,
}

/// The final output of a measurement cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ProcessedResults {
    pub results: Vec<TestResult>,
    pub client_external_addr: QosAddr,
    pub firewall_type: FirewallType,
    #[serde(rename = "time_till_retry_ms", serialize_with = "as_millis")]
    pub time_till_retry: Duration,
    pub hresult: HResult,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Timing of one probe slot. Times are millisecond ticks of the client's
/// epoch and the site's clock respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProbeResult {
    pub client_send_time: Option<u32>,
    pub server_receive_time: Option<u32>,
    pub server_send_delta: u16,
    pub client_receive_delta: u16,
}

/// Everything measured by one request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RawResults {
    pub site: String,
    pub test: String,
    /// The client's address as reported by the site.
    pub client_addr_from_server: QosAddr,
    pub hresult: HResult,
    pub probes_sent: usize,
    pub probes_received: usize,
    /// Highest slot filled by a reply.
    pub high_water: usize,
    probes: Vec<ProbeResult>,
}

impl RawResults {
    pub fn new(site: &str, test: &str) -> Self {
        Self {
            site: site.to_string(),
            test: test.to_string(),
            ..Default::default()
        }
    }

    /// Slots touched so far, in sequence order.
    pub fn probes(&self) -> &[ProbeResult] {
        &self.probes
    }

    pub fn slot(&self, index: usize) -> Option<&ProbeResult> {
        self.probes.get(index)
    }

    /// Returns slot `index`, growing the table as needed. `None` past
    /// [`MAX_PROBE_COUNT`].
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut ProbeResult> {
        if index >= MAX_PROBE_COUNT {
            return None;
        }
        if self.probes.len() <= index {
            self.probes.resize(index + 1, ProbeResult::default());
        }
        self.probes.get_mut(index)
    }
}

/// How the client describes itself to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientModifiers {
    pub internal_addr: QosAddr,
    pub platform: String,
    pub os_firewall: FirewallType,
    pub packet_queue_remaining: u32,
    pub stall_count_comm: u32,
    pub stall_duration_comm: Duration,
    pub stall_count_probe: u32,
    pub stall_duration_probe: Duration,
    pub hresult: HResult,
}

/// The body of every call to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientRequest {
    pub profile: String,
    pub service_id: u32,
    pub probe_version: u16,
    pub modifiers: ClientModifiers,
    pub(crate) results: Vec<RawResults>,
}

impl ClientRequest {
    pub fn results(&self) -> &[RawResults] {
        &self.results
    }

    /// Appends a request's results. Hands them back when [`MAX_RESULTS`]
    /// are already held.
    pub fn push_result(&mut self, result: RawResults) -> Result<(), RawResults> {
        if self.results.len() >= MAX_RESULTS {
            return Err(result);
        }
        self.results.push(result);
        Ok(())
    }

    /// Drops the raw results along with the stall counters that were
    /// collected while producing them.
    pub fn purge_results(&mut self) {
        self.results.clear();
        self.modifiers.stall_count_comm = 0;
        self.modifiers.stall_duration_comm = Duration::ZERO;
        self.modifiers.stall_count_probe = 0;
        self.modifiers.stall_duration_probe = Duration::ZERO;
    }
}

/// A decoded coordinator response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoordinatorResponse {
    pub service_id: u32,
    pub client_addr_from_coordinator: QosAddr,
    pub firewall_type: FirewallType,
    pub time_till_retry: Duration,
    pub client_external_addr: QosAddr,
    pub sites: Vec<Site>,
    pub control_configs: Vec<ControlConfig>,
    pub tests: Vec<Test>,
    pub results: Vec<TestResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tests_target_sites_by_name() {
        let site = Site {
            name: "iad".into(),
            ..Default::default()
        };
        let mut test = Test::default();
        assert!(test.targets(&site));

        test.site = "iad,sjc".into();
        assert!(test.targets(&site));

        test.site = "sjc".into();
        assert!(!test.targets(&site));
    }

    #[test]
    fn slots_are_bounded() {
        let mut raw = RawResults::new("iad", "latency");
        assert!(raw.slot_mut(3).is_some());
        assert_eq!(raw.probes().len(), 4);
        assert!(raw.slot_mut(MAX_PROBE_COUNT - 1).is_some());
        assert!(raw.slot_mut(MAX_PROBE_COUNT).is_none());
        assert_eq!(raw.probes().len(), MAX_PROBE_COUNT);
    }

    #[test]
    fn results_are_bounded_and_purged_with_stalls() {
        let mut req = ClientRequest::default();
        for _ in 0..MAX_RESULTS {
            req.push_result(RawResults::default()).unwrap();
        }
        assert!(req.push_result(RawResults::default()).is_err());

        req.modifiers.stall_count_probe = 3;
        req.modifiers.stall_duration_comm = Duration::from_secs(1);
        req.purge_results();

        assert!(req.results().is_empty());
        assert_eq!(req.modifiers.stall_count_probe, 0);
        assert_eq!(req.modifiers.stall_duration_comm, Duration::ZERO);
    }

    #[test]
    fn processed_results_serialize_to_json() {
        let results = ProcessedResults {
            results: vec![TestResult {
                site: "iad".into(),
                rtt_ms: 12,
                ..Default::default()
            }],
            firewall_type: FirewallType::Moderate,
            time_till_retry: Duration::from_secs(2),
            ..Default::default()
        };

        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["firewall_type"], "moderate");
        assert_eq!(json["time_till_retry_ms"], 2000);
        assert_eq!(json["client_external_addr"], "na[0]:0");
        assert_eq!(json["results"][0]["rtt_ms"], 12);
    }
}
