//! This module contains all the capture logic

// The capture thread will do one thing, as fast as possible: pull datagrams off
// the socket and stitch each FID's packets back into one blob per accumulation.
// Finished blobs go through a channel to the ordering thread, which does the
// heavy lifting.

use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::{
    slots::Slots,
    topology::Geometry,
    wire::{sender_identity, Header, PacketMask, HEADER_SIZE, MAX_FIDS, MAX_QUADRANTS},
};

/// One FID's complete contribution to one accumulation
#[derive(Debug, Clone)]
pub struct UnitBlob {
    pub qid: usize,
    pub fid: usize,
    pub acc_n: u32,
    /// When the first packet after the last full accumulation showed up
    pub scan_end: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Payload slots for one (qid, fid, acc_n), stored contiguously in packet order
#[derive(Debug)]
struct UnitBuffer {
    data: Vec<u8>,
    mask: PacketMask,
}

impl UnitBuffer {
    fn new(geometry: &Geometry) -> Self {
        Self {
            data: vec![0; geometry.blob_size()],
            mask: PacketMask::new(geometry.packets),
        }
    }
}

/// Reassembly state owned by the capture thread
pub struct Capturer {
    geometry: Geometry,
    /// Indexed by `qid * MAX_FIDS + fid`
    units: Vec<Slots<UnitBuffer>>,
    new_acc: Arc<AtomicBool>,
    scan_end: DateTime<Utc>,
}

impl Capturer {
    pub fn new(geometry: Geometry, new_acc: Arc<AtomicBool>, pending_limit: usize) -> Self {
        Self {
            geometry,
            units: (0..MAX_QUADRANTS * MAX_FIDS)
                .map(|_| Slots::new(pending_limit))
                .collect(),
            new_acc,
            scan_end: Utc::now(),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Feed one datagram. Returns the reassembled blob if this packet completed one.
    pub fn ingest(&mut self, sender: SocketAddr, datagram: &[u8]) -> Option<UnitBlob> {
        // Skip bad packets
        if datagram.len() != self.geometry.packet_size() {
            match Header::decode(datagram) {
                Some(h) => error!(
                    acc_n = h.acc_n,
                    pkt_n = h.pkt_n,
                    "Received packet is of wrong size, {} bytes",
                    datagram.len()
                ),
                None => error!("Received runt packet of {} bytes", datagram.len()),
            }
            return None;
        }
        let Some((qid, fid)) = sender_identity(&sender) else {
            warn!(%sender, "Ignoring packet from non-IPv4 sender");
            return None;
        };
        let Header { pkt_n, acc_n } = Header::decode(datagram)?;
        let pkt_n = pkt_n as usize;
        if pkt_n >= self.geometry.packets {
            warn!(qid, fid, acc_n, pkt_n, "Packet number out of range");
            return None;
        }

        if self.new_acc.swap(false, Ordering::AcqRel) {
            info!("First packet of new accumulation received");
            self.scan_end = Utc::now();
        }

        let geometry = self.geometry;
        let slots = &mut self.units[qid * MAX_FIDS + fid];
        let (buffer, evicted) = slots.entry(acc_n, || UnitBuffer::new(&geometry));
        if let Some(old) = evicted {
            warn!(qid, fid, acc_n = old, "Dropping incomplete accumulation to make room");
        }
        let start = pkt_n * geometry.payload_size;
        buffer.data[start..start + geometry.payload_size].copy_from_slice(&datagram[HEADER_SIZE..]);
        buffer.mask.set(pkt_n);
        if !buffer.mask.is_full() {
            return None;
        }

        let buffer = slots.remove(acc_n)?;
        debug!(qid, fid, acc_n, "All packets received");
        Some(UnitBlob {
            qid,
            fid,
            acc_n,
            scan_end: self.scan_end,
            data: buffer.data,
        })
    }

    /// Completeness of an accumulation still being collected
    pub fn mask(&self, qid: usize, fid: usize, acc_n: u32) -> Option<&PacketMask> {
        if qid >= MAX_QUADRANTS || fid >= MAX_FIDS {
            return None;
        }
        self.units[qid * MAX_FIDS + fid]
            .get(acc_n)
            .map(|buffer| &buffer.mask)
    }
}

/// Receive until `stop` is set. The socket must have a read timeout so the flag
/// gets checked.
pub fn capture_udp(
    socket: &UdpSocket,
    capturer: &mut Capturer,
    out: &Sender<UnitBlob>,
    stop: &AtomicBool,
) {
    // One byte of slack so oversized datagrams show up as the wrong size
    let mut buf = vec![0u8; capturer.geometry().packet_size() + 1];
    while !stop.load(Ordering::Acquire) {
        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                // Keep truckin
                warn!("Receive failed: {e}");
                continue;
            }
        };
        if let Some(blob) = capturer.ingest(addr, &buf[..n]) {
            if out.send(blob).is_err() {
                error!("Ordering queue is gone, stopping capture");
                break;
            }
        }
    }
}
