// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The authenticated probe packet exchanged with measurement sites.
//!
//! A probe is a fixed 45 byte big-endian header followed by an HMAC-SHA256
//! over that header, keyed with the site's shared secret. Outgoing probes may
//! be padded with zeros after the signature to reach the size a test asks
//! for; the padding is not signed.

use std::fmt;

use bytes::{Buf, BufMut};
use qos_core::limits::{
    HMAC_SIZE, MIN_PACKET_SIZE, PROBE_DATA_SIZE, PROBE_PROTOCOL_ID, PROBE_VERSION,
    SECURE_KEY_LENGTH,
};
use qos_core::QosAddr;
use ring::hmac;

/// Offset of the client request id inside a serialized probe.
const CLIENT_REQUEST_ID_OFFSET: usize = 10;

/// The shared secret of a site.
pub type SecureKey = [u8; SECURE_KEY_LENGTH];

/// Why a buffer could not be turned into a probe, or a probe into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// The buffer is shorter than a probe.
    TooShort(usize),
    /// The signature does not match the header.
    BadSignature,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::TooShort(len) => {
                write!(f, "probe of {len} bytes is shorter than {MIN_PACKET_SIZE}")
            }
            ProbeError::BadSignature => write!(f, "probe signature did not verify"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// A decoded probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePacket {
    /// Always [`PROBE_PROTOCOL_ID`] for well formed probes.
    pub protocol: u32,
    /// `major << 8 | minor`.
    pub version: u16,
    /// Coordinator assigned id of the whole measurement.
    pub service_request_id: u32,
    /// Client assigned id of the request this probe belongs to.
    pub client_request_id: u16,
    /// Server tick when the probe arrived at the site; 0 from the client.
    pub server_receive_time: u32,
    /// How long the site held the probe before replying.
    pub server_send_delta: u16,
    /// Size the client pads its probes to.
    pub probe_size_up: u16,
    /// Size the site pads its replies to.
    pub probe_size_down: u16,
    /// Sequence number of this probe among the ones sent by the client.
    pub probe_count_up: u8,
    /// From the client, how many replies to send per probe. From the site,
    /// the sequence number of this reply.
    pub probe_count_down: u8,
    /// How many probes the client plans to send, without loss.
    pub expected_probe_count_up: u8,
    /// The address the client believes the site sees it at.
    pub client_addr: QosAddr,
}

impl Default for ProbePacket {
    fn default() -> Self {
        Self {
            protocol: PROBE_PROTOCOL_ID,
            version: PROBE_VERSION,
            service_request_id: 0,
            client_request_id: 0,
            server_receive_time: 0,
            server_send_delta: 0,
            probe_size_up: MIN_PACKET_SIZE as u16,
            probe_size_down: MIN_PACKET_SIZE as u16,
            probe_count_up: 0,
            probe_count_down: 0,
            expected_probe_count_up: 0,
            client_addr: QosAddr::UNKNOWN,
        }
    }
}

impl ProbePacket {
    /// Writes the header and signature to the front of `buf`, returning the
    /// number of bytes written. Bytes after the signature are left alone.
    pub fn serialize(&self, buf: &mut [u8], key: &SecureKey) -> Result<usize, ProbeError> {
        if buf.len() < MIN_PACKET_SIZE {
            return Err(ProbeError::TooShort(buf.len()));
        }

        let (data, rest) = buf.split_at_mut(PROBE_DATA_SIZE);
        let mut w = &mut data[..];
        w.put_u32(self.protocol);
        w.put_u16(self.version);
        w.put_u32(self.service_request_id);
        w.put_u16(self.client_request_id);
        w.put_u32(self.server_receive_time);
        w.put_u16(self.server_send_delta);
        w.put_u16(self.probe_size_up);
        w.put_u16(self.probe_size_down);
        w.put_u8(self.probe_count_up);
        w.put_u8(self.probe_count_down);
        w.put_u8(self.expected_probe_count_up);
        w.put_u16(self.client_addr.family);
        w.put_u16(self.client_addr.port);
        w.put_slice(&self.client_addr.addr);
        debug_assert!(w.is_empty());

        let tag = hmac::sign(&signing_key(key), data);
        rest[..HMAC_SIZE].copy_from_slice(tag.as_ref());

        Ok(MIN_PACKET_SIZE)
    }

    /// Verifies the signature and decodes the header. Nothing in the header
    /// is interpreted unless the signature checks out.
    pub fn deserialize(buf: &[u8], key: &SecureKey) -> Result<Self, ProbeError> {
        if buf.len() < MIN_PACKET_SIZE {
            return Err(ProbeError::TooShort(buf.len()));
        }

        let data = &buf[..PROBE_DATA_SIZE];
        let signature = &buf[PROBE_DATA_SIZE..MIN_PACKET_SIZE];
        hmac::verify(&signing_key(key), data, signature).map_err(|_| ProbeError::BadSignature)?;

        let mut r = data;
        let mut probe = ProbePacket {
            protocol: r.get_u32(),
            version: r.get_u16(),
            service_request_id: r.get_u32(),
            client_request_id: r.get_u16(),
            server_receive_time: r.get_u32(),
            server_send_delta: r.get_u16(),
            probe_size_up: r.get_u16(),
            probe_size_down: r.get_u16(),
            probe_count_up: r.get_u8(),
            probe_count_down: r.get_u8(),
            expected_probe_count_up: r.get_u8(),
            client_addr: QosAddr::UNKNOWN,
        };
        probe.client_addr.family = r.get_u16();
        probe.client_addr.port = r.get_u16();
        r.copy_to_slice(&mut probe.client_addr.addr);

        Ok(probe)
    }
}

/// Reads the client request id without verifying anything, so the key of
/// the owning request can be looked up.
pub fn peek_client_request_id(buf: &[u8]) -> Option<u16> {
    let bytes = buf.get(CLIENT_REQUEST_ID_OFFSET..CLIENT_REQUEST_ID_OFFSET + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn signing_key(key: &SecureKey) -> hmac::Key {
    hmac::Key::new(hmac::HMAC_SHA256, key)
}
