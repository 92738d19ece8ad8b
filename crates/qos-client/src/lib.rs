// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The QoS client.
//!
//! A [`QosClient`] asks a coordinator which sites and tests to run, probes
//! those sites over UDP, submits the raw timings and hands the coordinator's
//! processed results to a callback. It never blocks: the caller drives it
//! by calling [`QosClient::update`] at a steady cadence.
//!
//! All I/O goes through the collaborators in [`ClientIo`], so the engine
//! runs the same against real sockets and against the in-memory fakes in
//! `testing`.

mod config;
mod exchange;
mod module;
mod request;
mod stall;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::{Arc, Weak};

use qos_core::{CoordinatorTransport, RecvNotify, Resolver, SocketFactory, Time};
use qos_rpc::ProcessedResults;
use tokio::sync::Mutex;

use crate::module::Module;

pub use crate::{
    config::{ClientConfig, Control, StatusSelector, StatusValue, DEFAULT_LISTEN_PORT},
    module::ModuleState,
    request::RequestState,
};

/// Invoked once per cycle with the processed results.
pub type ResultCallback = Box<dyn FnMut(&ProcessedResults) + Send>;

/// The collaborators a client performs its I/O with.
pub struct ClientIo {
    pub time: Arc<dyn Time>,
    pub sockets: Arc<dyn SocketFactory>,
    pub resolver: Arc<dyn Resolver>,
    pub transport: Box<dyn CoordinatorTransport>,
}

/// A handle to a QoS client. Clones share the same client.
#[derive(Clone)]
pub struct QosClient {
    inner: Arc<Mutex<Module>>,
}

impl QosClient {
    pub fn new(config: ClientConfig, io: ClientIo, callback: ResultCallback) -> Self {
        let inner = Arc::new_cyclic(|module: &Weak<Mutex<Module>>| {
            let module = module.clone();
            // runs on the socket's thread; replies are processed right away
            // unless an update holds the lock, which then drains them itself
            let notify: RecvNotify = Arc::new(move || {
                if let Some(module) = module.upgrade() {
                    if let Ok(mut module) = module.try_lock() {
                        module.drain_socket();
                    }
                }
            });

            Mutex::new(Module::new(config, io, callback, notify))
        });

        Self { inner }
    }

    /// Starts a cycle against the coordinator at `host:port`. Ignored unless
    /// the client is idle.
    pub async fn start(&self, host: &str, port: u16, profile: &str) {
        self.inner.lock().await.start(host, port, profile);
    }

    /// Advances the client. Returns false without doing anything if the
    /// client is busy on another thread.
    pub fn update(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut module) => {
                module.update();
                true
            }
            Err(_) => false,
        }
    }

    pub async fn control(&self, control: Control) {
        self.inner.lock().await.control(control);
    }

    pub async fn status(&self, selector: StatusSelector) -> StatusValue {
        self.inner.lock().await.status(selector)
    }

    pub async fn state(&self) -> ModuleState {
        self.inner.lock().await.state
    }

    /// States of the requests currently running.
    pub async fn request_states(&self) -> Vec<RequestState> {
        self.inner.lock().await.request_states()
    }

    /// Releases the socket, the coordinator connection and every request.
    pub async fn destroy(&self) {
        self.inner.lock().await.destroy();
    }
}
