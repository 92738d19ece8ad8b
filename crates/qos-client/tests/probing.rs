mod common;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use qos_client::testing::{
    decode_submission, encode_response, FakeSite, Harness, LookupScript, Response, SendOutcome,
};
use qos_client::{ClientConfig, ModuleState, QosClient, RequestState, StatusSelector, StatusValue};
use qos_core::limits::MAX_PROBE_COUNT;
use qos_core::{Facility, QosAddr, RequestStatus};
use qos_rpc::Test;

use common::*;

type TestResult = Result<(), Box<dyn Error>>;

/// Starts a cycle whose configuration runs `test` against the one site.
async fn start_with(h: &Harness, test: Test, config: ClientConfig) -> Result<QosClient, Box<dyn Error>> {
    h.transport
        .respond(Response::Body(encode_response(&config_response(vec![test]))?));
    h.transport
        .respond(Response::Body(encode_response(&results_response())?));

    let client = h.client(config);
    client.start(COORDINATOR, 443, "default").await;
    Ok(client)
}

/// Updates until the module reaches `state`.
async fn run_until_state(h: &Harness, client: &QosClient, state: ModuleState) -> bool {
    for _ in 0..100 {
        client.update();
        if client.state().await == state {
            return true;
        }
        h.time.advance(STEP);
    }
    false
}

fn raw_results(h: &Harness) -> Result<Vec<qos_client::testing::SubmittedResult>, Box<dyn Error>> {
    let submissions = h.transport.submissions();
    let last = submissions.last().ok_or("nothing submitted")?;
    Ok(decode_submission(last)?.results)
}

#[tokio::test]
async fn lost_replies_are_made_up_for() -> TestResult {
    let h = Harness::new();
    h.network.add_site(
        SITE_ADDR.parse()?,
        FakeSite::new(KEY).drop_when(|seq| seq % 4 == 3),
    );

    let test = Test {
        name: "loss".into(),
        probe_count_up: 12,
        acceptable_lost_probes: 2,
        ..latency_test()
    };
    let client = start_with(&h, test, ClientConfig::default()).await?;
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(10)));

    // 12 probes, 3 replies lost, then 3 more probes which all come back
    assert_eq!(h.network.sent().len(), 15);

    let results = raw_results(&h)?;
    assert_eq!(results.len(), 1);
    let raw = &results[0];
    assert_eq!(raw.hresult.code(), RequestStatus::Complete.code());
    assert!(!raw.hresult.is_error());
    assert_eq!(raw.probes.len(), 15);
    for lost in [3, 7, 11] {
        assert_eq!(raw.probes[lost].server_receive_time, u32::MAX);
        assert_eq!(raw.probes[lost].client_receive_delta, u16::MAX);
        assert_ne!(raw.probes[lost].client_send_time, u32::MAX);
    }
    assert_ne!(raw.probes[14].server_receive_time, u32::MAX);
    Ok(())
}

#[tokio::test]
async fn resends_keep_filled_download_slots() -> TestResult {
    // the first probe loses its last two replies, the resend recovers them
    let calls = AtomicUsize::new(0);
    let h = Harness::new();
    h.network.add_site(
        SITE_ADDR.parse()?,
        FakeSite::new(KEY).drop_when(move |seq| calls.fetch_add(1, Ordering::SeqCst) < 4 && seq >= 2),
    );

    let test = Test {
        name: "download".into(),
        probe_count_up: 1,
        probe_count_down: 4,
        ..latency_test()
    };
    let client = start_with(&h, test, ClientConfig::default()).await?;
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(10)));

    assert_eq!(h.network.sent().len(), 2);

    let results = raw_results(&h)?;
    assert_eq!(results.len(), 1);
    let raw = &results[0];
    assert_eq!(raw.hresult.code(), RequestStatus::Complete.code());
    assert_eq!(raw.probes.len(), 4);

    let first_send = raw.probes[0].client_send_time;
    assert_ne!(first_send, u32::MAX);
    for (seq, probe) in raw.probes.iter().enumerate() {
        assert_eq!(probe.client_send_time, first_send, "slot {seq}");
        assert_ne!(probe.server_receive_time, u32::MAX, "slot {seq}");
    }
    assert_eq!(raw.probes[0].client_receive_delta, 0);
    assert_eq!(raw.probes[1].client_receive_delta, 0);
    // recovered replies are timed from the one up probe
    assert!(raw.probes[2].client_receive_delta >= 200);
    assert_eq!(raw.probes[2].client_receive_delta, raw.probes[3].client_receive_delta);
    Ok(())
}

#[tokio::test]
async fn late_replies_are_recorded_between_updates() -> TestResult {
    let h = Harness::new();
    h.network.add_site(
        SITE_ADDR.parse()?,
        FakeSite::new(KEY).rtt(Duration::from_millis(50)),
    );

    let client = start_with(&h, latency_test(), ClientConfig::default()).await?;
    let mut waiting = false;
    for _ in 0..100 {
        client.update();
        if client.request_states().await == [RequestState::Receive] {
            waiting = true;
            break;
        }
        h.time.advance(STEP);
    }
    assert!(waiting);

    // the reply lands but nobody has been told yet
    h.time.advance(Duration::from_millis(60));
    assert_eq!(client.request_states().await, [RequestState::Receive]);

    h.network.deliver_due();
    assert_eq!(client.request_states().await, [RequestState::Complete]);
    assert_eq!(h.network.sent().len(), 1);

    assert!(h.run_until_report(&client, STEP, Duration::from_secs(5)));
    let raw = &raw_results(&h)?[0];
    assert_eq!(raw.hresult.code(), RequestStatus::Complete.code());
    assert_eq!(raw.probes.len(), 1);
    assert_eq!(raw.probes[0].client_receive_delta, 50);
    Ok(())
}

#[tokio::test]
async fn finished_requests_are_collected_one_per_update() -> TestResult {
    let h = Harness::new();
    h.network.add_site(SITE_ADDR.parse()?, FakeSite::new(KEY));

    let second = Test {
        name: "latency-again".into(),
        ..latency_test()
    };
    h.transport.respond(Response::Body(encode_response(&config_response(vec![
        latency_test(),
        second,
    ]))?));
    h.transport
        .respond(Response::Body(encode_response(&results_response())?));
    let client = h.client(ClientConfig::default());
    client.start(COORDINATOR, 443, "default").await;

    let mut seen: Vec<Vec<RequestState>> = Vec::new();
    for _ in 0..100 {
        client.update();
        let states = client.request_states().await;
        if states.is_empty() && !seen.is_empty() {
            break;
        }
        if !states.is_empty() {
            seen.push(states);
        }
        h.time.advance(STEP);
    }

    // both replies are taken on one update, the second request waits a turn
    let n = seen.len();
    assert!(n >= 2);
    assert_eq!(seen[n - 2], [RequestState::Receive, RequestState::Receive]);
    assert_eq!(seen[n - 1], [RequestState::Complete]);

    assert!(h.run_until_report(&client, STEP, Duration::from_secs(5)));
    let results = raw_results(&h)?;
    assert_eq!(results.len(), 2);
    for raw in &results {
        assert_eq!(raw.hresult.code(), RequestStatus::Complete.code());
    }
    Ok(())
}

#[tokio::test]
async fn silent_site_times_out() -> TestResult {
    let h = Harness::new();
    h.network
        .add_site(SITE_ADDR.parse()?, FakeSite::new(KEY).silent());

    let client = start_with(&h, latency_test(), ClientConfig::default()).await?;

    let mut seen: Vec<RequestState> = Vec::new();
    let mut created = None;
    let mut finished = None;
    let mut elapsed = Duration::ZERO;
    while h.reports().is_empty() && elapsed < Duration::from_secs(10) {
        client.update();

        match client.request_states().await.first() {
            Some(&state) => {
                created.get_or_insert(elapsed);
                if seen.last() != Some(&state) {
                    seen.push(state);
                }
            }
            None if created.is_some() && finished.is_none() => finished = Some(elapsed),
            None => {}
        }

        h.time.advance(STEP);
        elapsed += STEP;
    }

    assert_eq!(
        &seen[..4],
        &[
            RequestState::Init,
            RequestState::InitSync,
            RequestState::Send,
            RequestState::Receive
        ]
    );
    assert!(seen[4..]
        .iter()
        .all(|s| matches!(s, RequestState::Send | RequestState::Receive)));

    let lived = finished.ok_or("request never finished")? - created.ok_or("never created")?;
    assert!(lived > Duration::from_secs(7));
    assert!(lived <= Duration::from_secs(7) + 3 * STEP);

    assert!(h.network.sent().len() <= MAX_PROBE_COUNT);
    let raw = &raw_results(&h)?[0];
    assert!(raw.hresult.is_error());
    assert_eq!(raw.hresult.code(), RequestStatus::Timeout.code());
    assert!(raw.probes.is_empty());
    Ok(())
}

#[tokio::test]
async fn forged_replies_are_ignored() -> TestResult {
    let h = Harness::new();
    h.network
        .add_site(SITE_ADDR.parse()?, FakeSite::new(KEY).tamper());

    let client = start_with(&h, latency_test(), ClientConfig::default()).await?;
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(10)));

    let raw = &raw_results(&h)?[0];
    assert_eq!(raw.hresult.code(), RequestStatus::ProbeHmac.code());
    assert!(raw.probes.is_empty());
    Ok(())
}

#[tokio::test]
async fn address_mismatch_is_retried_once() -> TestResult {
    let h = Harness::new();
    let counter = AtomicU8::new(0);
    h.network.add_site(
        SITE_ADDR.parse()?,
        FakeSite::new(KEY).report_addr(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            QosAddr::from(SocketAddr::from(([198, 51, 100, n], 40000)))
        }),
    );

    let test = Test {
        name: "bandwidth".into(),
        probe_count_down: 2,
        ..latency_test()
    };
    let client = start_with(&h, test, ClientConfig::default()).await?;
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(10)));

    let sent = h.network.sent();
    assert_eq!(sent.len(), 2);
    let declared: Vec<QosAddr> = sent
        .iter()
        .map(|s| s.probe.map(|p| p.client_addr).unwrap_or_default())
        .collect();
    assert_eq!(declared[0], "v4[127.0.0.1]:7673".parse()?);
    assert_eq!(declared[1], "v4[198.51.100.1]:40000".parse()?);

    let results = raw_results(&h)?;
    assert_eq!(results.len(), 2);
    for raw in &results {
        assert_eq!(
            raw.hresult.code(),
            RequestStatus::ExternalAddressMismatch.code()
        );
    }
    assert_eq!(h.resolver.lookups().len(), 2);
    Ok(())
}

#[tokio::test]
async fn probe_stalls_are_reported() -> TestResult {
    let h = Harness::new();
    h.network.add_site(SITE_ADDR.parse()?, FakeSite::new(KEY));

    let config = ClientConfig {
        stall_window: Duration::from_millis(500),
        ..Default::default()
    };
    let client = start_with(&h, latency_test(), config).await?;
    assert!(run_until_state(&h, &client, ModuleState::Probe).await);

    h.time.advance(Duration::from_millis(700));
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(5)));

    let submission = decode_submission(&h.transport.submissions()[1])?;
    assert_eq!(submission.stall_count_probe, 1);
    assert_eq!(submission.stall_count_comm, 0);
    Ok(())
}

#[tokio::test]
async fn busy_listen_port_falls_back_to_any_port() -> TestResult {
    let h = Harness::new();
    h.network.add_site(SITE_ADDR.parse()?, FakeSite::new(KEY));
    h.network.refuse_port(7673);

    let client = start_with(&h, latency_test(), ClientConfig::default()).await?;
    assert!(run_until_state(&h, &client, ModuleState::Probe).await);

    let ports: Vec<u16> = h.network.opened().iter().map(|o| o.listen_port).collect();
    assert_eq!(ports, vec![7673, 0]);
    match client.status(StatusSelector::CurrentListenPort).await {
        StatusValue::Port(port) => assert!(port != 0 && port != 7673),
        other => panic!("unexpected status {other:?}"),
    }

    assert!(h.run_until_report(&client, STEP, Duration::from_secs(5)));
    let raw = &raw_results(&h)?[0];
    assert_eq!(raw.hresult.code(), RequestStatus::Complete.code());
    Ok(())
}

#[tokio::test]
async fn unresolvable_site_fails_its_request() -> TestResult {
    let h = Harness::new();
    h.resolver.script("127.0.0.2", LookupScript::Fail);
    h.resolver.pending_polls(3);

    let client = start_with(&h, latency_test(), ClientConfig::default()).await?;
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(5)));

    let raw = &raw_results(&h)?[0];
    assert_eq!(raw.hresult.code(), RequestStatus::SocketLookupUpdate.code());
    assert!(h.network.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn send_errors_carry_the_os_code() -> TestResult {
    let h = Harness::new();
    h.network.add_site(SITE_ADDR.parse()?, FakeSite::new(KEY));
    h.network.script_sends([SendOutcome::Error(111)]);

    let client = start_with(&h, latency_test(), ClientConfig::default()).await?;
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(5)));

    let raw = &raw_results(&h)?[0];
    assert!(raw.hresult.is_error());
    assert_eq!(raw.hresult.facility(), Some(Facility::Socket));
    assert_eq!(raw.hresult.code(), -111);
    Ok(())
}

#[tokio::test]
async fn blocked_send_is_retried() -> TestResult {
    let h = Harness::new();
    h.network.add_site(SITE_ADDR.parse()?, FakeSite::new(KEY));
    h.network.script_sends([SendOutcome::WouldBlock]);

    let client = start_with(&h, latency_test(), ClientConfig::default()).await?;
    assert!(h.run_until_report(&client, STEP, Duration::from_secs(5)));

    let raw = &raw_results(&h)?[0];
    assert_eq!(raw.hresult.code(), RequestStatus::Complete.code());
    assert_eq!(h.network.sent().len(), 1);
    Ok(())
}
