//! The finished, per-accumulation visibility store

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
};

use bincode::Options;
use chrono::{DateTime, Utc};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    topology::{Baseline, Input, Sideband, Topology, XengWord},
};

/// Largest serialized package we produce or accept
pub const MAX_PACKAGE_BYTES: u64 = 1 << 32;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PACKAGE_BYTES)
}

/// Serialized form of a package. Field order is the wire order.
#[derive(Serialize)]
struct FrameRef<'a> {
    int_time_us: i64,
    int_length: f64,
    channels: usize,
    inputs: &'a [Input],
    baselines: &'a [Baseline],
    array: &'a [f32],
}

#[derive(Deserialize)]
struct Frame {
    int_time_us: i64,
    int_length: f64,
    channels: usize,
    inputs: Vec<Input>,
    baselines: Vec<Baseline>,
    array: Vec<f32>,
}

/// Visibilities for one accumulation, shaped `[baseline][sideband][2 * channel]`
/// with real and imaginary parts interleaved. Cells hold NaN until written.
///
/// Baselines are every auto-correlation first, then every valid cross-correlation
/// in combination order of the input list.
#[derive(Clone, Debug)]
pub struct DataPackage {
    int_time: DateTime<Utc>,
    int_length: f64,
    channels: usize,
    inputs: Vec<Input>,
    baselines: Vec<Baseline>,
    rows: HashMap<Baseline, usize>,
    array: Vec<f32>,
}

impl DataPackage {
    pub fn new(topology: &dyn Topology, int_time: DateTime<Utc>, int_length: f64) -> Self {
        let inputs = topology.inputs();
        let mut baselines: Vec<_> = inputs.iter().map(|&i| Baseline::auto(i)).collect();
        for (i, &left) in inputs.iter().enumerate() {
            for &right in &inputs[i + 1..] {
                let baseline = Baseline::new(left, right);
                if topology.is_valid(&baseline) {
                    baselines.push(baseline);
                }
            }
        }
        let channels = topology.geometry().channels;
        let array = vec![f32::NAN; baselines.len() * Sideband::ALL.len() * 2 * channels];
        Self::assemble(inputs, baselines, channels, int_time, int_length, array)
    }

    /// Build an empty package over an explicit baseline list. Every baseline must
    /// join inputs of the package and appear once.
    pub fn with_baselines(
        inputs: Vec<Input>,
        baselines: Vec<Baseline>,
        channels: usize,
        int_time: DateTime<Utc>,
        int_length: f64,
    ) -> Result<Self> {
        check_baselines(&inputs, &baselines)?;
        let len = baselines
            .len()
            .checked_mul(Sideband::ALL.len() * 2)
            .and_then(|n| n.checked_mul(channels))
            .ok_or_else(|| Error::Malformed(format!("{channels} channels is too many")))?;
        let array = vec![f32::NAN; len];
        Ok(Self::assemble(
            inputs, baselines, channels, int_time, int_length, array,
        ))
    }

    fn assemble(
        inputs: Vec<Input>,
        baselines: Vec<Baseline>,
        channels: usize,
        int_time: DateTime<Utc>,
        int_length: f64,
        array: Vec<f32>,
    ) -> Self {
        let rows = baselines.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        Self {
            int_time,
            int_length,
            channels,
            inputs,
            baselines,
            rows,
            array,
        }
    }

    pub fn int_time(&self) -> DateTime<Utc> {
        self.int_time
    }

    pub fn int_length(&self) -> f64 {
        self.int_length
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    pub fn auto_baselines(&self) -> impl Iterator<Item = &Baseline> {
        self.baselines.iter().filter(|b| b.is_auto())
    }

    pub fn cross_baselines(&self) -> impl Iterator<Item = &Baseline> {
        self.baselines.iter().filter(|b| !b.is_auto())
    }

    /// Row index of `baseline` exactly as given, without conjugate fallback
    pub fn baseline_index(&self, baseline: &Baseline) -> Option<usize> {
        self.rows.get(baseline).copied()
    }

    /// The whole backing array
    pub fn array(&self) -> &[f32] {
        &self.array
    }

    /// Samples per (baseline, sideband) row
    pub fn row_len(&self) -> usize {
        2 * self.channels
    }

    /// Row for `baseline`, falling back to its conjugate. The flag is true when
    /// the conjugate was used.
    fn resolve(&self, baseline: &Baseline) -> Result<(usize, bool)> {
        if let Some(&row) = self.rows.get(baseline) {
            return Ok((row, false));
        }
        self.rows
            .get(&baseline.conjugate())
            .map(|&row| (row, true))
            .ok_or(Error::UnknownBaseline(*baseline))
    }

    fn row_range(&self, row: usize, sideband: Sideband) -> Range<usize> {
        let start = (row * Sideband::ALL.len() + sideband.index()) * self.row_len();
        start..start + self.row_len()
    }

    /// Interleaved samples for one (baseline, sideband). A swapped baseline reads the
    /// stored orientation's row unchanged.
    pub fn get(&self, baseline: &Baseline, sideband: Sideband) -> Result<&[f32]> {
        let (row, _) = self.resolve(baseline)?;
        Ok(&self.array[self.row_range(row, sideband)])
    }

    pub fn get_mut(&mut self, baseline: &Baseline, sideband: Sideband) -> Result<&mut [f32]> {
        let (row, _) = self.resolve(baseline)?;
        let range = self.row_range(row, sideband);
        Ok(&mut self.array[range])
    }

    /// Write interleaved samples starting at `channel`
    pub fn set(
        &mut self,
        baseline: &Baseline,
        sideband: Sideband,
        channel: usize,
        samples: &[f32],
    ) -> Result<()> {
        let offset = 2 * channel;
        let row_len = self.row_len();
        if offset + samples.len() > row_len {
            return Err(Error::ChannelRange {
                offset,
                len: samples.len(),
                row_len,
            });
        }
        self.get_mut(baseline, sideband)?[offset..offset + samples.len()]
            .copy_from_slice(samples);
        Ok(())
    }

    /// Complex samples per channel, conjugated when `baseline` is the swapped
    /// orientation of the stored one
    pub fn complex(&self, baseline: &Baseline, sideband: Sideband) -> Result<Vec<Complex<f32>>> {
        let (row, conjugated) = self.resolve(baseline)?;
        Ok(self.array[self.row_range(row, sideband)]
            .chunks_exact(2)
            .map(|c| {
                let z = Complex::new(c[0], c[1]);
                if conjugated {
                    z.conj()
                } else {
                    z
                }
            })
            .collect())
    }

    /// Scatter one X-engine word's channel samples into place. `positions` are the
    /// real-part offsets within the row for the sending FID.
    ///
    /// Autos always get a zero imaginary part, whatever the word carried.
    pub fn set_word(&mut self, word: &XengWord, positions: &[usize], data: &[f32]) -> Result<()> {
        let (row, _) = self.resolve(&word.baseline)?;
        let range = self.row_range(row, word.sideband);
        if let Some(&last) = positions.last() {
            if last + 1 >= range.len() {
                return Err(Error::ChannelRange {
                    offset: last,
                    len: 2,
                    row_len: range.len(),
                });
            }
        }
        let cells = &mut self.array[range];
        if word.baseline.is_auto() {
            for (&p, &v) in positions.iter().zip(data) {
                if !word.imag {
                    cells[p] = v;
                }
                cells[p + 1] = 0.0;
            }
        } else {
            let imag = word.imag_offset();
            for (&p, &v) in positions.iter().zip(data) {
                cells[p + imag] = v;
            }
        }
        Ok(())
    }

    /// True once no cell holds the absent sentinel
    pub fn is_complete(&self) -> bool {
        !self.array.iter().any(|v| v.is_nan())
    }

    /// Copy with every baseline's `sideband` rotated by
    /// `exp(-i * (phase(left) - phase(right)))`, phases in degrees
    pub fn rephased(&self, phase_of: impl Fn(&Input) -> f32, sideband: Sideband) -> Self {
        let mut out = self.clone();
        for (row, baseline) in self.baselines.iter().enumerate() {
            let delta = (phase_of(&baseline.left) - phase_of(&baseline.right)).to_radians();
            let rotation = Complex::from_polar(1.0, -delta);
            let range = out.row_range(row, sideband);
            for pair in out.array[range].chunks_exact_mut(2) {
                let z = Complex::new(pair[0], pair[1]) * rotation;
                pair[0] = z.re;
                pair[1] = z.im;
            }
        }
        out
    }

    /// Binary form used for downstream publishing
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let frame = FrameRef {
            int_time_us: self.int_time.timestamp_micros(),
            int_length: self.int_length,
            channels: self.channels,
            inputs: &self.inputs,
            baselines: &self.baselines,
            array: &self.array,
        };
        Ok(codec().serialize(&frame)?)
    }

    /// Inverse of [`DataPackage::to_bytes`]. The claimed shape must match the
    /// samples actually present.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let frame: Frame = codec().deserialize(bytes)?;
        let expected = frame
            .baselines
            .len()
            .checked_mul(Sideband::ALL.len() * 2)
            .and_then(|n| n.checked_mul(frame.channels));
        if expected != Some(frame.array.len()) {
            return Err(Error::Malformed(format!(
                "{} baselines of {} channels don't fit {} samples",
                frame.baselines.len(),
                frame.channels,
                frame.array.len()
            )));
        }
        check_baselines(&frame.inputs, &frame.baselines)?;
        let int_time = DateTime::from_timestamp_micros(frame.int_time_us).ok_or_else(|| {
            Error::Malformed(format!("timestamp {} out of range", frame.int_time_us))
        })?;
        Ok(Self::assemble(
            frame.inputs,
            frame.baselines,
            frame.channels,
            int_time,
            frame.int_length,
            frame.array,
        ))
    }
}

fn check_baselines(inputs: &[Input], baselines: &[Baseline]) -> Result<()> {
    let known: HashSet<&Input> = inputs.iter().collect();
    let mut seen = HashSet::with_capacity(baselines.len());
    for baseline in baselines {
        if !known.contains(&baseline.left) || !known.contains(&baseline.right) {
            return Err(Error::Malformed(format!(
                "baseline {baseline} joins an input outside the package"
            )));
        }
        if !seen.insert(baseline) {
            return Err(Error::Malformed(format!("baseline {baseline} listed twice")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::small_config;

    fn package() -> DataPackage {
        DataPackage::new(&small_config(), Utc::now(), 2.0)
    }

    #[test]
    fn autos_then_valid_crosses() {
        let pkg = package();
        // 8 inputs over two quadrants, crosses only within a quadrant
        assert_eq!(pkg.inputs().len(), 8);
        assert_eq!(pkg.auto_baselines().count(), 8);
        assert_eq!(pkg.cross_baselines().count(), 12);
        assert!(pkg.baselines()[..8].iter().all(|b| b.is_auto()));
        assert!(pkg
            .cross_baselines()
            .all(|b| b.left.quadrant == b.right.quadrant));
    }

    #[test]
    fn absent_until_written() {
        let mut pkg = package();
        let bl = pkg.baselines()[9];
        assert!(pkg.get(&bl, Sideband::Lsb).unwrap().iter().all(|v| v.is_nan()));
        pkg.set(&bl, Sideband::Lsb, 3, &[1.0, -2.0, 3.0, -4.0]).unwrap();
        let row = pkg.get(&bl, Sideband::Lsb).unwrap();
        assert_eq!(&row[6..10], &[1.0, -2.0, 3.0, -4.0]);
        assert!(row[..6].iter().chain(&row[10..]).all(|v| v.is_nan()));
        // Other sideband untouched
        assert!(pkg.get(&bl, Sideband::Usb).unwrap().iter().all(|v| v.is_nan()));
        assert!(!pkg.is_complete());
    }

    #[test]
    fn unknown_baseline_is_an_error() {
        let mut pkg = package();
        let stranger = Baseline::new(Input::new(9, 0, 0), Input::new(1, 0, 0));
        assert!(matches!(
            pkg.get(&stranger, Sideband::Usb),
            Err(Error::UnknownBaseline(b)) if b == stranger
        ));
        // Cross-quadrant products were never valid
        let inputs = pkg.inputs().to_vec();
        let cross_quad = Baseline::new(inputs[0], inputs[7]);
        assert!(pkg.set(&cross_quad, Sideband::Usb, 0, &[0.0, 0.0]).is_err());
        let bl = pkg.baselines()[0];
        assert!(matches!(
            pkg.set(&bl, Sideband::Usb, 15, &[0.0; 4]),
            Err(Error::ChannelRange { .. })
        ));
    }

    #[test]
    fn swapped_baseline_falls_back_to_conjugate() {
        let mut pkg = package();
        let bl = *pkg.cross_baselines().next().unwrap();
        assert!(pkg.baseline_index(&bl.conjugate()).is_none());
        pkg.set(&bl, Sideband::Usb, 0, &[1.0, 2.0]).unwrap();
        assert_eq!(&pkg.get(&bl.conjugate(), Sideband::Usb).unwrap()[..2], &[1.0, 2.0]);
        assert_eq!(pkg.complex(&bl, Sideband::Usb).unwrap()[0], Complex::new(1.0, 2.0));
        assert_eq!(
            pkg.complex(&bl.conjugate(), Sideband::Usb).unwrap()[0],
            Complex::new(1.0, -2.0)
        );
        pkg.set(&bl.conjugate(), Sideband::Usb, 1, &[5.0, 6.0]).unwrap();
        assert_eq!(&pkg.get(&bl, Sideband::Usb).unwrap()[2..4], &[5.0, 6.0]);
    }

    #[test]
    fn auto_words_never_fill_imaginary() {
        let mut pkg = package();
        let auto = pkg.baselines()[0];
        let positions = [0, 2, 8, 10];
        let data = [7.0, 8.0, 9.0, 10.0];
        pkg.set_word(&XengWord::new(auto, Sideband::Usb, false), &positions, &data)
            .unwrap();
        pkg.set_word(&XengWord::new(auto, Sideband::Usb, true), &positions, &data)
            .unwrap();
        let row = pkg.get(&auto, Sideband::Usb).unwrap();
        for (&p, &v) in positions.iter().zip(&data) {
            assert_eq!(row[p], v);
            assert_eq!(row[p + 1], 0.0);
        }
        let cross = *pkg.cross_baselines().next().unwrap();
        pkg.set_word(&XengWord::new(cross, Sideband::Lsb, true), &positions, &data)
            .unwrap();
        let row = pkg.get(&cross, Sideband::Lsb).unwrap();
        assert_eq!(row[3], 8.0);
        assert!(row[2].is_nan());
    }

    #[test]
    fn rephase_rotates_requested_sideband() {
        let mut pkg = package();
        let bl = *pkg.cross_baselines().next().unwrap();
        pkg.set(&bl, Sideband::Lsb, 0, &[1.0, 0.0]).unwrap();
        pkg.set(&bl, Sideband::Usb, 0, &[1.0, 0.0]).unwrap();
        let left = bl.left;
        let rotated = pkg.rephased(|i| if *i == left { 90.0 } else { 0.0 }, Sideband::Lsb);
        let z = rotated.complex(&bl, Sideband::Lsb).unwrap()[0];
        assert!(z.re.abs() < 1e-6);
        assert!((z.im + 1.0).abs() < 1e-6);
        assert_eq!(rotated.complex(&bl, Sideband::Usb).unwrap()[0], Complex::new(1.0, 0.0));
        // The original is left alone
        assert_eq!(pkg.complex(&bl, Sideband::Lsb).unwrap()[0], Complex::new(1.0, 0.0));
    }

    #[test]
    fn serialized_package_reads_back() {
        let mut pkg = package();
        let bl = pkg.baselines()[12];
        pkg.set(&bl, Sideband::Usb, 2, &[0.5, -0.25]).unwrap();
        let bytes = pkg.to_bytes().unwrap();
        let back = DataPackage::from_bytes(&bytes).unwrap();
        assert_eq!(back.baselines(), pkg.baselines());
        assert_eq!(back.inputs(), pkg.inputs());
        assert_eq!(back.int_time().timestamp_micros(), pkg.int_time().timestamp_micros());
        assert_eq!(&back.get(&bl, Sideband::Usb).unwrap()[4..6], &[0.5, -0.25]);
        assert!(back.get(&bl, Sideband::Usb).unwrap()[0].is_nan());
        assert!(DataPackage::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    fn frame_bytes(channels: usize, array: &[f32]) -> Vec<u8> {
        let input = Input::new(1, 0, 0);
        codec()
            .serialize(&FrameRef {
                int_time_us: 0,
                int_length: 1.0,
                channels,
                inputs: &[input],
                baselines: &[Baseline::auto(input)],
                array,
            })
            .unwrap()
    }

    #[test]
    fn claimed_shape_must_match_samples() {
        // A tiny frame claiming a huge channel count is refused, not allocated
        let bytes = frame_bytes(u32::MAX as usize, &[]);
        assert!(bytes.len() < 64);
        assert!(matches!(
            DataPackage::from_bytes(&bytes),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            DataPackage::from_bytes(&frame_bytes(usize::MAX, &[])),
            Err(Error::Malformed(_))
        ));
        let back = DataPackage::from_bytes(&frame_bytes(1, &[1.0, 0.0, 2.0, 0.0])).unwrap();
        assert!(back.is_complete());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            DataPackage::from_bytes(&[0xff; 40]),
            Err(Error::Codec(_) | Error::Malformed(_))
        ));
        assert!(DataPackage::from_bytes(&[]).is_err());
    }

    #[test]
    fn explicit_baselines_must_join_known_inputs() {
        let a = Input::new(1, 0, 0);
        let b = Input::new(2, 0, 0);
        let ok = DataPackage::with_baselines(
            vec![a, b],
            vec![Baseline::auto(a), Baseline::new(a, b)],
            4,
            Utc::now(),
            1.0,
        )
        .unwrap();
        assert_eq!(ok.array().len(), 2 * 2 * 2 * 4);
        // Round trips now that every endpoint is known
        assert!(DataPackage::from_bytes(&ok.to_bytes().unwrap()).is_ok());

        let foreign = Baseline::new(a, Input::new(3, 0, 0));
        assert!(matches!(
            DataPackage::with_baselines(vec![a, b], vec![foreign], 4, Utc::now(), 1.0),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            DataPackage::with_baselines(
                vec![a],
                vec![Baseline::auto(a), Baseline::auto(a)],
                4,
                Utc::now(),
                1.0
            ),
            Err(Error::Malformed(_))
        ));
    }
}
