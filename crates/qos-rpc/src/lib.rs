// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Messages exchanged with the QoS coordinator.
//!
//! The coordinator speaks gRPC: every body is a protobuf message behind a
//! five byte frame header. [`wire`] holds a small protobuf writer and
//! reader, [`frame`] the framing, [`model`] the typed messages and results,
//! and [`codec`] the mapping between the two.

pub mod codec;
pub mod frame;
pub mod model;
pub mod wire;

pub use crate::{
    codec::{
        decode_coordinator_response, encode_client_request, estimate_encoded_size, scrub,
        DecodeError, EncodeError, ScrubbedProbe,
    },
    model::{
        ClientModifiers, ClientRequest, ControlConfig, CoordinatorResponse, FirewallType,
        ProbeResult, ProcessedResults, RawResults, Site, Test, TestResult, ALL_SITES,
    },
    wire::WireError,
};
