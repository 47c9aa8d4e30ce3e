//! Antenna-based gain and delay solutions for VLBI phasing
//!
//! For every channel the visibilities of one quadrant form a Hermitian
//! correlation matrix. Its leading eigenvector, scaled by the square root of the
//! eigenvalue, is the vector of complex antenna gains. Delays come from the peak
//! of each antenna's gain spectrum transformed to lag space.

use num_complex::Complex64;
use rustfft::FftPlanner;
use tracing::info;

use crate::{
    consumer::DataConsumer,
    package::DataPackage,
    topology::{Baseline, Input, Sideband, Topology},
};

const POWER_ITERATIONS: usize = 64;
const DEFAULT_PAD: usize = 16;

/// Leading eigenpair of a Hermitian matrix by power iteration
fn leading_eigen(matrix: &[Vec<Complex64>]) -> (f64, Vec<Complex64>) {
    let n = matrix.len();
    let mut v = vec![Complex64::new(1.0, 0.0); n];
    for _ in 0..POWER_ITERATIONS {
        let next: Vec<Complex64> = matrix
            .iter()
            .map(|row| row.iter().zip(&v).map(|(m, x)| m * x).sum())
            .collect();
        let norm = next.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt();
        if norm == 0.0 {
            return (0.0, vec![Complex64::default(); n]);
        }
        v = next.into_iter().map(|z| z / norm).collect();
    }
    // Rayleigh quotient, real for a Hermitian matrix
    let value = matrix
        .iter()
        .zip(&v)
        .map(|(row, vi)| vi.conj() * row.iter().zip(&v).map(|(m, x)| m * x).sum::<Complex64>())
        .sum::<Complex64>()
        .re;
    (value, v)
}

/// Complex gains from one channel's correlation matrix, phase-referenced so the
/// `reference` input has zero phase
pub fn solve_gains(matrix: &[Vec<Complex64>], reference: usize) -> Vec<Complex64> {
    let (value, vector) = leading_eigen(matrix);
    let scale = value.max(0.0).sqrt();
    let raw: Vec<Complex64> = vector.iter().map(|v| *v * scale).collect();
    let factor = match raw.get(reference) {
        Some(r) if r.norm() > 0.0 => r.conj() / r.norm(),
        _ => Complex64::new(1.0, 0.0),
    };
    raw.into_iter().map(|g| g * factor).collect()
}

/// Delay of each input from its gain spectrum. `gains[channel][input]`;
/// the returned delays are in units of `lag`.
pub fn solve_delays(gains: &[Vec<Complex64>], pad_by: usize, lag: f64) -> Vec<f64> {
    let Some(n_inputs) = gains.first().map(Vec::len) else {
        return vec![];
    };
    let fft_size = pad_by * gains.len();
    let ifft = FftPlanner::<f64>::new().plan_fft_inverse(fft_size);
    (0..n_inputs)
        .map(|i| {
            let mut buf = vec![Complex64::default(); fft_size];
            for (slot, channel) in buf.iter_mut().zip(gains) {
                *slot = channel[i];
            }
            ifft.process(&mut buf);
            let peak = buf
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.re.total_cmp(&b.1.re))
                .map_or(0, |(k, _)| k);
            // Upper half of the lag axis is negative delay
            let peak = if peak > fft_size / 2 {
                peak as f64 - fft_size as f64
            } else {
                peak as f64
            };
            peak / pad_by as f64 * lag
        })
        .collect()
}

/// Solves and logs per-input amplitude, delay and phase for one quadrant
pub struct CalibrateVlbi {
    quadrant: u8,
    sideband: Sideband,
    reference: Option<Input>,
    lag_ns: f64,
}

impl CalibrateVlbi {
    pub fn new(topology: &dyn Topology, quadrant: u8, reference: Option<Input>) -> Self {
        Self {
            quadrant,
            sideband: Sideband::Usb,
            reference,
            lag_ns: 1e9 / (topology.geometry().clock_rate * 8.0),
        }
    }
}

impl DataConsumer for CalibrateVlbi {
    fn name(&self) -> &str {
        "CalibrateVlbi"
    }

    fn consume(&mut self, data: &DataPackage) -> anyhow::Result<()> {
        let inputs: Vec<Input> = data
            .inputs()
            .iter()
            .copied()
            .filter(|i| i.quadrant == self.quadrant)
            .collect();
        if inputs.is_empty() {
            anyhow::bail!("no inputs in quadrant {}", self.quadrant);
        }
        let reference = match self.reference {
            Some(r) => inputs
                .iter()
                .position(|i| *i == r)
                .ok_or_else(|| anyhow::anyhow!("reference {r} is not in quadrant {}", self.quadrant))?,
            None => 0,
        };

        let n = inputs.len();
        let channels = data.channels();
        let mut corr = vec![vec![vec![Complex64::default(); n]; n]; channels];
        for left in 0..n {
            for right in left..n {
                let baseline = Baseline::new(inputs[left], inputs[right]);
                for (ch, z) in data.complex(&baseline, self.sideband)?.into_iter().enumerate() {
                    // Absent channels contribute nothing
                    let z = if z.re.is_nan() || z.im.is_nan() {
                        Complex64::default()
                    } else {
                        Complex64::new(z.re as f64, z.im as f64)
                    };
                    corr[ch][left][right] = z;
                    corr[ch][right][left] = z.conj();
                }
            }
        }

        let gains: Vec<Vec<Complex64>> = corr.iter().map(|m| solve_gains(m, reference)).collect();
        let delays = solve_delays(&gains, DEFAULT_PAD, self.lag_ns);
        for (i, input) in inputs.iter().enumerate() {
            let avg = gains.iter().map(|g| g[i]).sum::<Complex64>() / channels as f64;
            info!(
                "{input} : Amp={:>12.2e}, Delay={:>8.2} ns, Phase={:>8.2} deg",
                avg.norm(),
                delays[i],
                avg.arg().to_degrees()
            );
        }
        Ok(())
    }
}
