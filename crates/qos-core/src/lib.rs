// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The core abstractions for the QoS client.
//!
//! Defines the main traits:
//! - [`Time`]: for abstracting over different implementations of time.
//! - [`ProbeSocket`] and [`SocketFactory`]: the UDP primitives probes travel over.
//! - [`Resolver`]: non-blocking name resolution for measurement sites.
//! - [`CoordinatorTransport`]: the reliable, chunked request/response
//!   channel to the coordinator.
//!
//! Along with the shared vocabulary every other crate speaks: [`QosAddr`],
//! [`HResult`] and the protocol [`limits`].

#![deny(missing_docs)]

mod addr;
mod hresult;
pub mod limits;
mod network;
mod time;
mod util;

pub use crate::{
    addr::{ParseQosAddrError, QosAddr, FAMILY_INET, FAMILY_INET6, FAMILY_UNSPEC},
    hresult::{Facility, HResult, ModuleStatus, RequestStatus},
    network::{
        CoordinatorTransport, Datagram, Lookup, LookupStatus, ProbeSocket, RecvNotify,
        RecvOutcome, Resolver, SocketFactory, SocketOptions, TransportError, TransportOptions,
    },
    time::{ManualTime, Time, Timestamp, TokioTime},
    util::{oneshot_result, OneshotResult},
};

pub use anyhow::Error;
pub use anyhow::Result;
