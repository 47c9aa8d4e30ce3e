//! Visibility packet wire format
//!
//! Every datagram is an 8-byte big-endian header `[packet number, accumulation number]`
//! followed by a fixed-size payload of big-endian 32-bit words. The sender's IPv4
//! address identifies the X-engine: bits 4..6 of the last octet are the quadrant,
//! bits 0..2 the FID.

use std::net::{IpAddr, SocketAddr};

pub const HEADER_SIZE: usize = 8;
pub const WORD_SIZE: usize = 4;

/// Quadrant and FID are 3-bit fields of the sender address
pub const MAX_QUADRANTS: usize = 8;
pub const MAX_FIDS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub pkt_n: u32,
    pub acc_n: u32,
}

impl Header {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let pkt_n = bytes.get(0..4)?.try_into().ok().map(u32::from_be_bytes)?;
        let acc_n = bytes.get(4..8)?.try_into().ok().map(u32::from_be_bytes)?;
        Some(Self { pkt_n, acc_n })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.pkt_n.to_be_bytes());
        out[4..].copy_from_slice(&self.acc_n.to_be_bytes());
        out
    }
}

/// Build a full datagram, the inverse of what the capture stage parses
pub fn encode_packet(header: Header, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_SIZE + payload.len());
    datagram.extend_from_slice(&header.encode());
    datagram.extend_from_slice(payload);
    datagram
}

/// Decode (quadrant, FID) from the sender address. Only IPv4 senders exist.
pub fn sender_identity(addr: &SocketAddr) -> Option<(usize, usize)> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let last = ip.octets()[3];
            Some((((last >> 4) & 0x7) as usize, (last & 0x7) as usize))
        }
        IpAddr::V6(ip) => ip.to_ipv4_mapped().map(|v4| {
            let last = v4.octets()[3];
            (((last >> 4) & 0x7) as usize, (last & 0x7) as usize)
        }),
    }
}

/// Convert big-endian 32-bit integer words to float samples
pub fn words_to_samples(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(WORD_SIZE)
        .map(|w| i32::from_be_bytes([w[0], w[1], w[2], w[3]]) as f32)
        .collect()
}

/// Bitmask of packet indices received so far
#[derive(Clone, Debug)]
pub struct PacketMask {
    bits: Vec<u64>,
    len: usize,
    received: usize,
}

impl PacketMask {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
            received: 0,
        }
    }

    /// Mark `idx` as received. Returns false if it was out of range.
    pub fn set(&mut self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        let (word, bit) = (idx / 64, 1u64 << (idx % 64));
        if self.bits[word] & bit == 0 {
            self.bits[word] |= bit;
            self.received += 1;
        }
        true
    }

    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.len && self.bits[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_full(&self) -> bool {
        self.received == self.len
    }
}
