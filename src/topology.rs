//! Instrument topology: inputs, baselines, and the per-quadrant X-engine word order.
//!
//! The catcher never decides which inputs exist or how the X-engines order their
//! output words; it asks a [`Topology`] at construction time and treats the answer
//! as read-only.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    wire::{HEADER_SIZE, MAX_FIDS, MAX_QUADRANTS, WORD_SIZE},
};

/// One receiver/polarization channel of the instrument
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Input {
    pub antenna: u8,
    pub quadrant: u8,
    pub polarization: u8,
}

impl Input {
    pub fn new(antenna: u8, quadrant: u8, polarization: u8) -> Self {
        Self {
            antenna,
            quadrant,
            polarization,
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ant{}:q{}:p{}",
            self.antenna, self.quadrant, self.polarization
        )
    }
}

/// An ordered pair of inputs. `(a, b)` and `(b, a)` are distinct keys that
/// describe conjugates of the same correlation product.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Baseline {
    pub left: Input,
    pub right: Input,
}

impl Baseline {
    pub fn new(left: Input, right: Input) -> Self {
        Self { left, right }
    }

    pub fn auto(input: Input) -> Self {
        Self::new(input, input)
    }

    pub fn is_auto(&self) -> bool {
        self.left == self.right
    }

    /// The same product with its endpoints swapped
    pub fn conjugate(&self) -> Self {
        Self::new(self.right, self.left)
    }
}

impl fmt::Display for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.left, self.right)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sideband {
    Usb,
    Lsb,
}

impl Sideband {
    pub const ALL: [Sideband; 2] = [Sideband::Usb, Sideband::Lsb];

    /// Position of this sideband along the data package's second axis
    pub fn index(self) -> usize {
        match self {
            Sideband::Usb => 0,
            Sideband::Lsb => 1,
        }
    }
}

impl fmt::Display for Sideband {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sideband::Usb => write!(f, "USB"),
            Sideband::Lsb => write!(f, "LSB"),
        }
    }
}

/// What one transmitted word position carries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XengWord {
    pub baseline: Baseline,
    pub sideband: Sideband,
    pub imag: bool,
}

impl XengWord {
    pub fn new(baseline: Baseline, sideband: Sideband, imag: bool) -> Self {
        Self {
            baseline,
            sideband,
            imag,
        }
    }

    /// Offset of this word's samples within an interleaved [re, im] pair
    pub fn imag_offset(&self) -> usize {
        usize::from(self.imag)
    }
}

fn default_clock_rate() -> f64 {
    2.288e9
}

/// Fixed instrument constants shared by every stage
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Geometry {
    /// Spectral channels per sideband
    pub channels: usize,
    /// Contiguous channels an FID computes before the next FID takes over
    pub parallel_channels: usize,
    /// FID slots per quadrant, sets the interleave stride
    pub fids_per_quadrant: usize,
    /// Packets per FID per accumulation
    pub packets: usize,
    /// Payload bytes per packet, excluding the header
    pub payload_size: usize,
    /// ADC clock rate in Hz
    #[serde(default = "default_clock_rate")]
    pub clock_rate: f64,
}

impl Geometry {
    pub fn packet_size(&self) -> usize {
        HEADER_SIZE + self.payload_size
    }

    /// Bytes in one FID's reassembled accumulation
    pub fn blob_size(&self) -> usize {
        self.packets * self.payload_size
    }

    /// Channels each FID contributes per sideband
    pub fn fid_channels(&self) -> usize {
        self.channels / self.fids_per_quadrant
    }

    /// Channel stride between consecutive blocks of the same FID
    pub fn interleave_width(&self) -> usize {
        self.parallel_channels * self.fids_per_quadrant
    }

    /// Length of one (baseline, sideband) row: interleaved re/im per channel
    pub fn row_len(&self) -> usize {
        2 * self.channels
    }
}

/// Read-only view of the instrument the catcher is attached to
pub trait Topology: Send + Sync {
    fn geometry(&self) -> &Geometry;

    fn quadrants(&self) -> usize;

    fn fids_expected(&self, qid: usize) -> usize;

    /// Inputs digitized by one FID, in mapping order
    fn fid_inputs(&self, qid: usize, fid: usize) -> &[Input];

    /// Transmitted word offset to (baseline, sideband, real/imag) for one quadrant
    fn packet_order(&self, qid: usize) -> &[XengWord];

    /// Nominal integration time in seconds
    fn integration_time(&self) -> f64;

    fn is_valid(&self, baseline: &Baseline) -> bool {
        baseline.left.quadrant == baseline.right.quadrant
    }

    /// Beamformer phase (degrees) applied to this input's second sideband
    fn second_sideband_phase(&self, _input: &Input) -> f32 {
        0.0
    }

    /// Every input, quadrant by quadrant and FID by FID
    fn inputs(&self) -> Vec<Input> {
        (0..self.quadrants())
            .flat_map(|qid| (0..self.fids_expected(qid)).map(move |fid| (qid, fid)))
            .flat_map(|(qid, fid)| self.fid_inputs(qid, fid).iter().copied())
            .collect()
    }
}

/// Check that a topology's geometry and word orders describe packets the
/// capture and ordering stages can actually reassemble
pub fn validate(topology: &dyn Topology) -> Result<()> {
    let g = topology.geometry();
    if g.channels == 0
        || g.parallel_channels == 0
        || g.fids_per_quadrant == 0
        || g.packets == 0
        || g.payload_size == 0
    {
        return Err(Error::Config(format!("geometry has a zero size: {g:?}")));
    }
    if g.channels % g.interleave_width() != 0 {
        return Err(Error::Config(format!(
            "{} channels don't divide into blocks of {}",
            g.channels,
            g.interleave_width()
        )));
    }
    if g.payload_size % WORD_SIZE != 0 {
        return Err(Error::Config(format!(
            "payload of {} bytes is not whole words",
            g.payload_size
        )));
    }
    let quadrants = topology.quadrants();
    if quadrants == 0 || quadrants > MAX_QUADRANTS {
        return Err(Error::Config(format!(
            "need between 1 and {MAX_QUADRANTS} quadrants, got {quadrants}"
        )));
    }
    let max_fids = g.fids_per_quadrant.min(MAX_FIDS);
    for qid in 0..quadrants {
        let fids = topology.fids_expected(qid);
        if fids == 0 || fids > max_fids {
            return Err(Error::Config(format!(
                "quadrant {qid} needs between 1 and {max_fids} fids, got {fids}"
            )));
        }
        let words = topology.packet_order(qid).len() * g.fid_channels();
        if words * WORD_SIZE != g.blob_size() {
            return Err(Error::Config(format!(
                "quadrant {qid} sends {words} words per fid but {} packets of {} bytes hold {}",
                g.packets,
                g.payload_size,
                g.blob_size() / WORD_SIZE
            )));
        }
    }
    Ok(())
}
