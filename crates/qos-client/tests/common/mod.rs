#![allow(dead_code)]

use std::time::Duration;

use qos_core::limits::PROBE_VERSION;
use qos_core::HResult;
use qos_rpc::{CoordinatorResponse, FirewallType, Site, Test, TestResult};

pub const KEY: [u8; 16] = *b"0123456789abcdef";
pub const SITE_ADDR: &str = "127.0.0.2:3659";
pub const COORDINATOR: &str = "coordinator.example.net";
pub const STEP: Duration = Duration::from_millis(10);

pub fn site() -> Site {
    Site {
        name: "iad".into(),
        addr: "127.0.0.2".into(),
        port: 3659,
        key: KEY,
        probe_version: PROBE_VERSION,
    }
}

pub fn latency_test() -> Test {
    Test {
        name: "latency".into(),
        ..Default::default()
    }
}

pub fn config_response(tests: Vec<Test>) -> CoordinatorResponse {
    CoordinatorResponse {
        service_id: 42,
        client_addr_from_coordinator: "v4[127.0.0.1]:7673".parse().unwrap(),
        sites: vec![site()],
        tests,
        ..Default::default()
    }
}

pub fn results_response() -> CoordinatorResponse {
    CoordinatorResponse {
        service_id: 42,
        firewall_type: FirewallType::Open,
        client_external_addr: "v4[203.0.113.7]:7673".parse().unwrap(),
        results: vec![TestResult {
            site: "iad".into(),
            rtt_ms: 20,
            up_bps: 0,
            down_bps: 0,
            hresult: HResult::default(),
        }],
        ..Default::default()
    }
}
