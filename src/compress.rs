//! Zlib framing for tunneled IP packets
//!
//! Both directions may carry deflated packets; the raw-UDP transport always
//! does. Inflate is capped so a hostile peer cannot balloon a datagram into
//! an arbitrary allocation.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::{Result, TunnelError};

/// Upper bound on an inflated tunnel packet. Larger than any sane MTU.
pub const MAX_INFLATED_LEN: usize = 64 * 1024;

pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| TunnelError::Compression(format!("deflate: {}", e)))
}

pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(MAX_INFLATED_LEN as u64 + 1);
    let mut out = Vec::with_capacity(data.len() * 3);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| TunnelError::Compression(format!("inflate: {}", e)))?;
    if out.len() > MAX_INFLATED_LEN {
        return Err(TunnelError::Compression("inflated packet too large".into()));
    }
    Ok(out)
}
