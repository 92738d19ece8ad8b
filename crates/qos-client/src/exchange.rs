//! The coordinator side of the module: sending the submission, growing the
//! receive buffer until the response fits, and acting on the response.

use qos_core::limits::{CLIENT_URL_PATH, DEFAULT_RPC_BODY_SIZE, MAX_RPC_BODY_SIZE};
use qos_core::{Facility, HResult, ModuleStatus, RecvOutcome};
use qos_rpc::{
    decode_coordinator_response, encode_client_request, estimate_encoded_size, ProcessedResults,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::Control;
use crate::module::{Module, ModuleState};

/// Buffers and progress of the current coordinator call.
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    send_buf: Option<Vec<u8>>,
    send_cursor: usize,
    recv_buf: Vec<u8>,
    last_response: Vec<u8>,
    /// Consecutive responses that could not be used.
    error_count: u32,
}

impl Exchange {
    pub(crate) fn reset(&mut self) {
        self.release_send_buffer();
        self.error_count = 0;
    }

    pub(crate) fn release_send_buffer(&mut self) {
        self.send_buf = None;
        self.send_cursor = 0;
    }

    pub(crate) fn release_recv_buffer(&mut self) {
        self.recv_buf = Vec::new();
    }

    pub(crate) fn last_response(&self) -> &[u8] {
        &self.last_response
    }

    /// Resizes the receive buffer to `size` bytes. False if the memory
    /// could not be had.
    fn resize_recv_buffer(&mut self, size: usize) -> bool {
        let additional = size.saturating_sub(self.recv_buf.len());
        if self.recv_buf.try_reserve_exact(additional).is_err() {
            return false;
        }
        self.recv_buf.resize(size, 0);
        true
    }
}

impl Module {
    fn coordinator_url(&self) -> Option<Url> {
        let coordinator = self.coordinator.as_ref()?;
        let scheme = if self.config.use_https { "https" } else { "http" };
        let host = if coordinator.host.contains(':') && !coordinator.host.starts_with('[') {
            format!("[{}]", coordinator.host)
        } else {
            coordinator.host.clone()
        };

        Url::parse(&format!("{scheme}://{host}:{}{CLIENT_URL_PATH}", coordinator.port)).ok()
    }

    /// Sends the submission, resuming a partially sent body on later calls.
    pub(crate) fn message_coordinator(&mut self) {
        if self.exchange.send_buf.is_none() && !self.begin_coordinator_call() {
            return;
        }

        let Some(body) = self.exchange.send_buf.as_ref() else {
            return;
        };
        let len = body.len();

        if self.exchange.send_cursor < len {
            match self.io.transport.send(&body[self.exchange.send_cursor..]) {
                Ok(n) => self.exchange.send_cursor += n,
                Err(e) => {
                    warn!("sending to coordinator failed: {e}");
                    self.fatal(HResult::new(Facility::Http, e.code, true));
                    return;
                }
            }
        }

        trace!(sent = self.exchange.send_cursor, len, "coordinator send progress");
        if self.exchange.send_cursor < len {
            return;
        }

        if let Err(e) = self.io.transport.finish() {
            warn!("finishing coordinator request failed: {e}");
            self.fatal(HResult::new(Facility::Http, e.code, true));
            return;
        }

        self.enter(ModuleState::UpdateCoordinatorComm);
    }

    /// Encodes the submission and starts the call. False if the module moved
    /// on instead.
    fn begin_coordinator_call(&mut self) -> bool {
        let results = self.request.results().len();
        let estimate = estimate_encoded_size(results);

        if estimate > MAX_RPC_BODY_SIZE {
            warn!(results, estimate, "submission too large, discarding raw results");
            self.request.purge_results();
            self.status_error(ModuleStatus::SendBufferNeededTooLarge);
            return false;
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(estimate).is_err() {
            if results > 0 {
                self.request.purge_results();
                self.status_error(ModuleStatus::FailedAllocSendBuffer);
            } else {
                self.status_fatal(ModuleStatus::FailedAllocSendBufferFatal);
            }
            return false;
        }

        self.request.modifiers.packet_queue_remaining = self.packet_queue_remaining();
        self.request.modifiers.os_firewall = self.os_firewall();
        self.request.modifiers.hresult = self.hresult;

        let Some(url) = self.coordinator_url() else {
            warn!(coordinator = ?self.coordinator, "invalid coordinator address");
            self.status_fatal(ModuleStatus::RpcEncode);
            return false;
        };

        let body = match encode_client_request(&self.request, buf, estimate) {
            Ok(body) => body,
            Err(e) => {
                warn!("{e}");
                self.status_fatal(ModuleStatus::RpcEncode);
                return false;
            }
        };

        debug!(%url, len = body.len(), results, "calling coordinator");
        match self.io.transport.begin(&url, &body) {
            Ok(n) => self.exchange.send_cursor = n,
            Err(e) => {
                warn!(%url, "coordinator call failed: {e}");
                self.fatal(HResult::new(Facility::Http, e.code, true));
                return false;
            }
        }

        self.exchange.send_buf = Some(body);
        true
    }

    /// Polls for the coordinator's response.
    pub(crate) fn update_coordinator(&mut self) {
        self.request.modifiers.internal_addr = self.internal_addr();

        if self.exchange.recv_buf.len() < DEFAULT_RPC_BODY_SIZE
            && !self.exchange.resize_recv_buffer(DEFAULT_RPC_BODY_SIZE)
        {
            self.status_fatal(ModuleStatus::FailedAllocRecvBuffer);
            return;
        }

        match self.io.transport.recv_all(&mut self.exchange.recv_buf) {
            RecvOutcome::Waiting => trace!("waiting for coordinator"),
            RecvOutcome::BufferTooSmall => {
                let size = self.exchange.recv_buf.len() * 2;
                if size > MAX_RPC_BODY_SIZE {
                    warn!(size, "coordinator response exceeds receive limit");
                    self.status_fatal(ModuleStatus::RecvBufferNeededTooLarge);
                } else if !self.exchange.resize_recv_buffer(size) {
                    self.status_fatal(ModuleStatus::FailedAllocRecvBuffer);
                } else {
                    debug!(size, "grew coordinator receive buffer");
                }
            }
            RecvOutcome::Complete { status: 200, len } => {
                let len = len.min(self.exchange.recv_buf.len());
                self.exchange.last_response = self.exchange.recv_buf[..len].to_vec();

                if self.process_response(len) {
                    self.io.transport.release();
                    self.exchange.error_count = 0;
                } else {
                    self.response_failed();
                }
            }
            RecvOutcome::Complete { status, .. } => {
                warn!(status, "coordinator returned an error status");
                self.io.transport.release();
                self.error(HResult::new(Facility::Http, status as i16, true));
                self.response_failed();
            }
            RecvOutcome::Failed { code } => {
                warn!(code, "coordinator call failed");
                self.fatal(HResult::new(Facility::Http, code, true));
            }
        }
    }

    fn response_failed(&mut self) {
        self.exchange.error_count += 1;
        if self.exchange.error_count > 1 {
            self.status_fatal(ModuleStatus::UnrecoveredError);
        }
    }

    /// Acts on a complete response. False when the response could not be
    /// used, in which case the module is already headed back to the
    /// coordinator.
    fn process_response(&mut self, len: usize) -> bool {
        let now = self.now();
        self.init_sync_time = Some(now);

        let response = match decode_coordinator_response(&self.exchange.recv_buf[..len]) {
            Ok(response) => response,
            Err(e) => {
                warn!("{e}");
                self.status_error(ModuleStatus::RpcDecode);
                return false;
            }
        };

        if self.request.service_id != 0 && self.request.service_id != response.service_id {
            warn!(
                old = self.request.service_id,
                new = response.service_id,
                "coordinator changed service id"
            );
        }
        self.request.service_id = response.service_id;
        self.client_addr_from_coordinator = response.client_addr_from_coordinator;

        for config in &response.control_configs {
            match Control::from_selector(&config.name, config.value) {
                Some(control) => self.control(control),
                None => debug!(selector = %config.name, "ignoring unknown control override"),
            }
        }

        if !response.results.is_empty() {
            info!(results = response.results.len(), "received processed results");
            self.results = ProcessedResults {
                results: response.results,
                client_external_addr: response.client_external_addr,
                firewall_type: response.firewall_type,
                time_till_retry: response.time_till_retry,
                hresult: HResult::default(),
            };
            self.results_received_at = Some(now);
            self.goto(ModuleState::Report, ModuleStatus::ResultsReceived);
            return true;
        }

        if response.tests.is_empty() || response.sites.is_empty() {
            self.status_error(ModuleStatus::TestConfigUnusable);
            return false;
        }

        self.request.purge_results();
        let created = self.create_requests(&response.sites, &response.tests);
        info!(
            sites = response.sites.len(),
            tests = response.tests.len(),
            requests = created,
            "received test configuration"
        );

        if created == 0 {
            self.status_error(ModuleStatus::ConfigProducedNoRequests);
            return false;
        }

        self.goto(ModuleState::Probe, ModuleStatus::TestConfigReceived);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_buffer_grows_in_place() {
        let mut exchange = Exchange::default();
        assert!(exchange.resize_recv_buffer(DEFAULT_RPC_BODY_SIZE));
        exchange.recv_buf[0] = 7;
        assert!(exchange.resize_recv_buffer(DEFAULT_RPC_BODY_SIZE * 2));

        assert_eq!(exchange.recv_buf.len(), DEFAULT_RPC_BODY_SIZE * 2);
        assert_eq!(exchange.recv_buf[0], 7);

        exchange.release_recv_buffer();
        assert!(exchange.recv_buf.is_empty());
    }

    #[test]
    fn reset_clears_progress() {
        let mut exchange = Exchange {
            send_buf: Some(vec![1, 2, 3]),
            send_cursor: 2,
            error_count: 1,
            ..Default::default()
        };
        exchange.reset();

        assert!(exchange.send_buf.is_none());
        assert_eq!(exchange.send_cursor, 0);
        assert_eq!(exchange.error_count, 0);
    }
}
