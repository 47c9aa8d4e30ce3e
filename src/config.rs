//! TOML instrument description, the concrete [`Topology`] used by the binary
//!
//! ```toml
//! integration_time = 28.0
//!
//! [geometry]
//! channels = 16
//! parallel_channels = 2
//! fids_per_quadrant = 2
//! packets = 4
//! payload_size = 320
//!
//! [[quadrants]]
//! [[quadrants.fids]]
//! inputs = [{ antenna = 1, polarization = 0 }, { antenna = 1, polarization = 1 }]
//! [[quadrants.fids]]
//! inputs = [{ antenna = 2, polarization = 0 }, { antenna = 2, polarization = 1, sideband_phase = 12.5 }]
//! ```

use std::{collections::HashMap, fs, path::Path, str::FromStr};

use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{Error, Result},
    topology::{validate, Baseline, Geometry, Input, Sideband, Topology, XengWord},
    wire::MAX_QUADRANTS,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    integration_time: f64,
    geometry: Geometry,
    /// X-engines emit cross products as (right, left)
    #[serde(default)]
    swap_cross_order: bool,
    quadrants: Vec<RawQuadrant>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQuadrant {
    fids: Vec<RawFid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFid {
    inputs: Vec<RawInput>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInput {
    antenna: u8,
    #[serde(default)]
    polarization: u8,
    /// Second sideband beamformer phase, degrees
    #[serde(default)]
    sideband_phase: f32,
}

#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    geometry: Geometry,
    integration_time: f64,
    /// [qid][fid] -> inputs
    fids: Vec<Vec<Vec<Input>>>,
    /// [qid] -> word order
    orders: Vec<Vec<XengWord>>,
    phases: HashMap<Input, f32>,
}

impl InstrumentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        if !(raw.integration_time > 0.0) {
            return Err(Error::Config(format!(
                "integration time must be positive, got {}",
                raw.integration_time
            )));
        }
        if raw.quadrants.is_empty() || raw.quadrants.len() > MAX_QUADRANTS {
            return Err(Error::Config(format!(
                "need between 1 and {MAX_QUADRANTS} quadrants, got {}",
                raw.quadrants.len()
            )));
        }

        let mut fids = Vec::with_capacity(raw.quadrants.len());
        let mut phases = HashMap::new();
        for (qid, quad) in raw.quadrants.iter().enumerate() {
            let mut quad_inputs = Vec::with_capacity(quad.fids.len());
            for fid in &quad.fids {
                let mut fid_inputs = Vec::with_capacity(fid.inputs.len());
                for raw_input in &fid.inputs {
                    let input = Input::new(raw_input.antenna, qid as u8, raw_input.polarization);
                    if phases.insert(input, raw_input.sideband_phase).is_some() {
                        return Err(Error::Config(format!("input {input} listed twice")));
                    }
                    fid_inputs.push(input);
                }
                quad_inputs.push(fid_inputs);
            }
            fids.push(quad_inputs);
        }

        let orders = fids
            .iter()
            .map(|quad| xeng_order(&quad.concat(), raw.swap_cross_order))
            .collect();
        let config = Self {
            geometry: raw.geometry,
            integration_time: raw.integration_time,
            fids,
            orders,
            phases,
        };
        validate(&config)?;
        for qid in 0..config.quadrants() {
            debug!(qid, words = config.packet_order(qid).len(), "Built X-engine packet order");
        }
        Ok(config)
    }
}

impl FromStr for InstrumentConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_raw(toml::from_str(s)?)
    }
}

/// Word order of one quadrant's X-engines: autos, then crosses in combination
/// order; per baseline USB before LSB; per sideband real before imaginary.
fn xeng_order(inputs: &[Input], swap_cross: bool) -> Vec<XengWord> {
    let autos = inputs.iter().map(|&i| Baseline::auto(i));
    let crosses = inputs.iter().enumerate().flat_map(|(i, &left)| {
        inputs[i + 1..].iter().map(move |&right| {
            let baseline = Baseline::new(left, right);
            if swap_cross {
                baseline.conjugate()
            } else {
                baseline
            }
        })
    });
    autos
        .chain(crosses)
        .flat_map(|baseline| {
            Sideband::ALL.into_iter().flat_map(move |sideband| {
                [false, true]
                    .into_iter()
                    .map(move |imag| XengWord::new(baseline, sideband, imag))
            })
        })
        .collect()
}

impl Topology for InstrumentConfig {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn quadrants(&self) -> usize {
        self.fids.len()
    }

    fn fids_expected(&self, qid: usize) -> usize {
        self.fids.get(qid).map_or(0, Vec::len)
    }

    fn fid_inputs(&self, qid: usize, fid: usize) -> &[Input] {
        self.fids
            .get(qid)
            .and_then(|quad| quad.get(fid))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn packet_order(&self, qid: usize) -> &[XengWord] {
        self.orders.get(qid).map(Vec::as_slice).unwrap_or(&[])
    }

    fn integration_time(&self) -> f64 {
        self.integration_time
    }

    fn second_sideband_phase(&self, input: &Input) -> f32 {
        self.phases.get(input).copied().unwrap_or(0.0)
    }
}
