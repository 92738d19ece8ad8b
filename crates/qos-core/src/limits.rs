//! Protocol constants shared by the probe codec, the coordinator codec and
//! the engines.

use std::time::Duration;

/// Length of the probe signature (HMAC-SHA256).
pub const HMAC_SIZE: usize = 32;
/// Length of a site's shared secret.
pub const SECURE_KEY_LENGTH: usize = 16;
/// Length of the signed portion of a probe.
pub const PROBE_DATA_SIZE: usize = 45;
/// Smallest valid probe on the wire.
pub const MIN_PACKET_SIZE: usize = PROBE_DATA_SIZE + HMAC_SIZE;
/// Largest probe the client will send or accept.
pub const MAX_PACKET_SIZE: usize = 1264;

/// `"qos2"`, the first four bytes of every probe.
pub const PROBE_PROTOCOL_ID: u32 = u32::from_be_bytes(*b"qos2");
/// Probe version major byte. Versions with the same major are compatible.
pub const PROBE_VERSION_MAJOR: u8 = 2;
/// Probe version minor byte.
pub const PROBE_VERSION_MINOR: u8 = 0;
/// The combined probe version sent by this client.
pub const PROBE_VERSION: u16 = ((PROBE_VERSION_MAJOR as u16) << 8) | PROBE_VERSION_MINOR as u16;

/// Maximum number of probes a single request may send or receive.
pub const MAX_PROBE_COUNT: usize = 32;
/// Maximum number of sites in one coordinator response.
pub const MAX_SITES: usize = 32;
/// Maximum number of control overrides in one coordinator response.
pub const MAX_CONTROL_CONFIGS: usize = 6;
/// Maximum number of tests in one coordinator response.
pub const MAX_TESTS: usize = 4;
/// Maximum number of raw results held for one coordinator round trip.
pub const MAX_RESULTS: usize = MAX_SITES * MAX_TESTS;

/// Hard cap on coordinator message bodies, in either direction.
pub const MAX_RPC_BODY_SIZE: usize = 1024 * 200;
/// Initial receive buffer for coordinator responses.
pub const DEFAULT_RPC_BODY_SIZE: usize = MAX_RPC_BODY_SIZE / 10;

/// Path of the coordinator's client call.
pub const CLIENT_URL_PATH: &str = "/eadp.qoscoordinator.QOSCoordinator/ClientCall";
/// Content type of every coordinator message.
pub const CONTENT_TYPE: &str = "application/grpc";

/// Probe counts are clamped to `[MIN_PROBE_COUNT, MAX_PROBE_COUNT]`.
pub const MIN_PROBE_COUNT: usize = 1;
/// Shortest per-request timeout accepted from the coordinator.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(7000);
/// Longest per-request timeout accepted from the coordinator.
pub const MAX_TIMEOUT: Duration = Duration::from_millis(20000);
/// Longest spacing between probes accepted from the coordinator.
pub const MAX_TIME_BETWEEN_PROBES: Duration = Duration::from_millis(1000);
/// Shortest resend window accepted from the coordinator.
pub const MIN_RESEND_TIME: Duration = Duration::from_millis(200);
/// Longest resend window accepted from the coordinator.
pub const MAX_RESEND_TIME: Duration = MAX_TIMEOUT;
/// Upper bound on extra probes sent with a resend.
pub const MAX_RESEND_EXTRA_PROBES: usize = MAX_PROBE_COUNT;
/// Upper bound on the acceptable lost probe count.
pub const MAX_ACCEPTABLE_LOST_PROBES: usize = MAX_PROBE_COUNT;
/// Longest wait for sibling requests to finish resolving.
pub const MAX_INIT_SYNC_TIME: Duration = Duration::from_millis(5000);

/// Returns true if a probe version can interoperate with this client.
pub fn is_compatible_probe_version(version: u16) -> bool {
    (version >> 8) as u8 == PROBE_VERSION_MAJOR
}
