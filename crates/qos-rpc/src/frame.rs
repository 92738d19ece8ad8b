//! gRPC message framing: a compression flag byte and a big-endian length in
//! front of every message body.

use crate::wire::WireError;

/// Size of the frame header.
pub const HEADER_LEN: usize = 5;

/// Prefixes `body` with an uncompressed frame header, in place.
pub fn wrap(mut body: Vec<u8>) -> Vec<u8> {
    let mut header = [0u8; HEADER_LEN];
    header[1..].copy_from_slice(&(body.len() as u32).to_be_bytes());
    body.splice(0..0, header);
    body
}

/// Returns the body of the first message in `buf`. Compressed messages are
/// not supported.
pub fn unwrap(buf: &[u8]) -> Result<&[u8], WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    if buf[0] != 0 {
        return Err(WireError::Malformed);
    }

    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    buf[HEADER_LEN..]
        .get(..len)
        .ok_or(WireError::Truncated)
}
