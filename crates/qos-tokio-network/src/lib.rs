// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Tokio implementations of the QoS client's I/O boundary.
//!
//! - [`TokioSockets`]: UDP probe sockets with a background receive task.
//! - [`TokioResolver`]: name lookups through `tokio::net::lookup_host`.
//! - [`GrpcTransport`]: the coordinator call as gRPC over HTTP/2, optionally
//!   over BoringSSL.
//!
//! Every type spawns onto the runtime that was current when it was created,
//! so the client can be pumped from synchronous code.

mod body;
mod grpc;
mod resolver;
mod sockopt;
mod udp;

pub use crate::{
    body::ChannelBody,
    grpc::{error_code, GrpcTransport},
    resolver::TokioResolver,
    udp::TokioSockets,
};
