//! In this module, we implement the monitoring side of the catcher: per-baseline
//! amplitude, phase and correlation statistics logged for every accumulation.

use std::collections::HashMap;

use num_complex::Complex;
use tracing::{debug, info};

use crate::{
    consumer::DataConsumer,
    error::Result,
    package::DataPackage,
    topology::{Baseline, Input, Sideband},
};

/// Averages over the populated channels of one (baseline, sideband)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BaselineStats {
    /// Mean of |v|
    pub amplitude: f32,
    /// Phase of the mean visibility, degrees
    pub phase: f32,
    pub channels: usize,
}

/// Stats over the non-absent channels, or `None` if every channel is absent
pub fn baseline_stats(
    data: &DataPackage,
    baseline: &Baseline,
    sideband: Sideband,
) -> Result<Option<BaselineStats>> {
    let samples: Vec<Complex<f32>> = data
        .complex(baseline, sideband)?
        .into_iter()
        .filter(|z| !z.re.is_nan() && !z.im.is_nan())
        .collect();
    if samples.is_empty() {
        return Ok(None);
    }
    let n = samples.len() as f32;
    let amplitude = samples.iter().map(|z| z.norm()).sum::<f32>() / n;
    let mean = samples.iter().sum::<Complex<f32>>() / n;
    Ok(Some(BaselineStats {
        amplitude,
        phase: mean.arg().to_degrees(),
        channels: samples.len(),
    }))
}

/// Logs amplitude, phase and correlation coefficient for every baseline
pub struct LogStats {
    sideband: Sideband,
}

impl LogStats {
    pub fn new(sideband: Sideband) -> Self {
        Self { sideband }
    }
}

impl Default for LogStats {
    fn default() -> Self {
        Self::new(Sideband::Usb)
    }
}

impl DataConsumer for LogStats {
    fn name(&self) -> &str {
        "LogStats"
    }

    fn consume(&mut self, data: &DataPackage) -> anyhow::Result<()> {
        let sideband = self.sideband;
        let mut auto_amps: HashMap<Input, f32> = HashMap::new();
        // Autos come first in every package, so their amplitudes are known by the
        // time the crosses need them
        for baseline in data.baselines() {
            let Some(stats) = baseline_stats(data, baseline, sideband)? else {
                debug!(%baseline, "No data for baseline");
                continue;
            };
            let norm = if baseline.is_auto() {
                auto_amps.insert(baseline.left, stats.amplitude);
                stats.amplitude
            } else {
                let left = auto_amps.get(&baseline.left).copied().unwrap_or(1.0);
                let right = auto_amps.get(&baseline.right).copied().unwrap_or(1.0);
                (left * right).sqrt()
            };
            // Keep the normalisation away from zero
            let norm = norm.max(1.0);
            info!(
                "{baseline}[chunk={}].{sideband} : Amp(avg)={:>12.2e}, Phase(avg)={:>8.2} deg, Corr.={:>8.2}%",
                baseline.left.quadrant,
                stats.amplitude,
                stats.phase,
                100.0 * stats.amplitude / norm
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::small_config;
    use chrono::Utc;

    #[test]
    fn stats_skip_absent_channels() {
        let mut pkg = DataPackage::new(&small_config(), Utc::now(), 2.0);
        let bl = *pkg.cross_baselines().next().unwrap();
        assert_eq!(baseline_stats(&pkg, &bl, Sideband::Usb).unwrap(), None);

        pkg.set(&bl, Sideband::Usb, 0, &[0.0, 2.0, 0.0, 4.0]).unwrap();
        let stats = baseline_stats(&pkg, &bl, Sideband::Usb).unwrap().unwrap();
        assert_eq!(stats.channels, 2);
        assert!((stats.amplitude - 3.0).abs() < 1e-6);
        assert!((stats.phase - 90.0).abs() < 1e-4);

        // Reading the swapped orientation conjugates
        let swapped = baseline_stats(&pkg, &bl.conjugate(), Sideband::Usb)
            .unwrap()
            .unwrap();
        assert!((swapped.phase + 90.0).abs() < 1e-4);
    }

    #[test]
    fn logs_partial_packages() {
        let mut pkg = DataPackage::new(&small_config(), Utc::now(), 2.0);
        let auto = pkg.baselines()[0];
        pkg.set(&auto, Sideband::Usb, 0, &[5.0, 0.0]).unwrap();
        assert!(LogStats::default().consume(&pkg).is_ok());
    }
}
