//! Aggregation across FIDs and reordering into a [`DataPackage`]
//!
//! The ordering thread collects one blob per (qid, fid) for each accumulation
//! number. Once nothing is missing it runs the raw consumers, unpacks every blob
//! and hands the finished package to the dispatch queue.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info};

use crate::{
    capture::UnitBlob,
    consumer::{isolated, RawAccumulation, RawConsumer},
    error::{Error, Result},
    package::DataPackage,
    slots::Slots,
    topology::{Geometry, Topology},
    wire::{words_to_samples, WORD_SIZE},
};

/// How long the ordering and dispatch loops sleep on an empty queue
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A reordered accumulation on its way to the data consumers
#[derive(Debug, Clone)]
pub struct Finished {
    pub acc_n: u32,
    pub scan_end: DateTime<Utc>,
    pub package: DataPackage,
}

/// Channel permutation shared by every FID.
///
/// Each FID computes `parallel_channels` contiguous channels, then the next FID
/// takes over; the pattern repeats every `parallel_channels * fids_per_quadrant`
/// channels. `index` holds FID 0's real-part offsets within a row.
#[derive(Debug, Clone)]
pub struct Interleave {
    index: Vec<usize>,
    fid_stride: usize,
}

impl Interleave {
    pub fn new(geometry: &Geometry) -> Self {
        let index = (0..geometry.channels)
            .step_by(geometry.interleave_width().max(1))
            .flat_map(|outer| (0..geometry.parallel_channels).map(move |j| 2 * (outer + j)))
            .collect();
        Self {
            index,
            fid_stride: 2 * geometry.parallel_channels,
        }
    }

    /// Real-part row offsets of each channel `fid` transmits, in transmit order
    pub fn positions(&self, fid: usize) -> Vec<usize> {
        self.index.iter().map(|i| i + fid * self.fid_stride).collect()
    }
}

/// Lay out words the way an X-engine transmits them: channel-major, each channel
/// carrying `words_per_channel` words. `word(offset, channel)` gives the value.
pub fn interleave_words(
    words_per_channel: usize,
    channels: usize,
    mut word: impl FnMut(usize, usize) -> i32,
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(words_per_channel * channels * WORD_SIZE);
    for channel in 0..channels {
        for offset in 0..words_per_channel {
            blob.extend_from_slice(&word(offset, channel).to_be_bytes());
        }
    }
    blob
}

/// Unpack every FID's blob into a fresh package
pub fn reorder(
    topology: &dyn Topology,
    interleave: &Interleave,
    raw: &RawAccumulation,
    int_time: DateTime<Utc>,
) -> Result<DataPackage> {
    let fid_channels = topology.geometry().fid_channels();
    let mut pkg = DataPackage::new(topology, int_time, topology.integration_time());
    for (qid, fids) in raw.blobs().iter().enumerate() {
        let order = topology.packet_order(qid);
        if order.is_empty() {
            continue;
        }
        for (fid, blob) in fids.iter().enumerate() {
            let expected = order.len() * fid_channels * WORD_SIZE;
            if blob.len() != expected {
                return Err(Error::BlobSize {
                    qid,
                    fid,
                    got: blob.len(),
                    expected,
                });
            }
            let samples = words_to_samples(blob);
            let positions = interleave.positions(fid);
            let mut channel_data = Vec::with_capacity(fid_channels);
            for (offset, word) in order.iter().enumerate() {
                if !topology.is_valid(&word.baseline) {
                    continue;
                }
                channel_data.clear();
                channel_data.extend(samples[offset..].iter().step_by(order.len()));
                pkg.set_word(word, &positions, &channel_data)?;
            }
        }
    }
    Ok(pkg)
}

/// Blobs collected so far for one accumulation, `[qid][fid]`
struct Pending {
    blobs: Vec<Vec<Option<Vec<u8>>>>,
}

impl Pending {
    fn new(topology: &dyn Topology) -> Self {
        Self {
            blobs: (0..topology.quadrants())
                .map(|qid| vec![None; topology.fids_expected(qid)])
                .collect(),
        }
    }

    fn is_full(&self) -> bool {
        self.blobs.iter().flatten().all(Option::is_some)
    }

    fn into_raw(self, acc_n: u32) -> RawAccumulation {
        RawAccumulation::new(
            acc_n,
            self.blobs
                .into_iter()
                .map(|quad| quad.into_iter().flatten().collect())
                .collect(),
        )
    }
}

/// State owned by the ordering thread
pub struct Orderer {
    topology: Arc<dyn Topology>,
    interleave: Interleave,
    pending: Slots<Pending>,
    rawbacks: Vec<Box<dyn RawConsumer>>,
    new_acc: Arc<AtomicBool>,
    last_acc: Vec<Vec<Option<Instant>>>,
}

impl Orderer {
    pub fn new(
        topology: Arc<dyn Topology>,
        new_acc: Arc<AtomicBool>,
        rawbacks: Vec<Box<dyn RawConsumer>>,
        pending_limit: usize,
    ) -> Self {
        let last_acc = (0..topology.quadrants())
            .map(|qid| vec![None; topology.fids_expected(qid)])
            .collect();
        Self {
            interleave: Interleave::new(topology.geometry()),
            topology,
            pending: Slots::new(pending_limit),
            rawbacks,
            new_acc,
            last_acc,
        }
    }

    /// Accumulations still waiting on at least one FID
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// File one FID's blob. Returns the finished package when this was the last
    /// missing piece of its accumulation.
    pub fn insert(&mut self, blob: UnitBlob) -> Option<Finished> {
        let UnitBlob {
            qid,
            fid,
            acc_n,
            scan_end,
            data,
        } = blob;
        if qid >= self.topology.quadrants() || fid >= self.topology.fids_expected(qid) {
            info!(
                acc_n,
                "Ignoring data from unexpected quadrant (qid #{qid}) or F-engine (fid #{fid})"
            );
            return None;
        }
        let expected = self.topology.packet_order(qid).len()
            * self.topology.geometry().fid_channels()
            * WORD_SIZE;
        if data.len() != expected {
            error!(
                qid,
                fid,
                acc_n,
                "Ignoring blob of {} bytes, expected {expected}",
                data.len()
            );
            return None;
        }

        let topology = self.topology.as_ref();
        let (pending, evicted) = self.pending.entry(acc_n, || Pending::new(topology));
        if let Some(old) = evicted {
            error!(acc_n = old, "Dropping incomplete accumulation to make room");
        }
        pending.blobs[qid][fid] = Some(data);
        let full = pending.is_full();

        let members = topology
            .fid_inputs(qid, fid)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let now = Instant::now();
        match self.last_acc[qid][fid].replace(now) {
            Some(last) => info!(
                "Received full accumulation #{acc_n:<4} from qid #{qid}, fid #{fid}: [{members}] ({:.4} secs since last)",
                (now - last).as_secs_f64()
            ),
            None => info!(
                "Received full accumulation #{acc_n:<4} from qid #{qid}, fid #{fid}: [{members}]"
            ),
        }

        if !full {
            return None;
        }
        let raw = self.pending.remove(acc_n)?.into_raw(acc_n);

        // Let the capture side timestamp the next scan
        self.new_acc.store(true, Ordering::Release);
        info!("Received full accumulation #{acc_n:<4}");

        for rawback in &mut self.rawbacks {
            let name = rawback.name().to_owned();
            isolated("rawback", &name, acc_n, || rawback.consume(&raw));
        }
        info!("Processed all rawbacks for accumulation #{acc_n:<4}");

        match reorder(self.topology.as_ref(), &self.interleave, &raw, scan_end) {
            Ok(package) => {
                info!("Reordered accumulation #{acc_n:<4}");
                Some(Finished {
                    acc_n,
                    scan_end,
                    package,
                })
            }
            Err(e) => {
                error!("Failed to reorder accumulation #{acc_n:<4}, dropping it: {e}");
                None
            }
        }
    }
}

/// Pull blobs until `stop` is set, pushing finished packages to `out`
pub fn order_loop(
    orderer: &mut Orderer,
    input: &Receiver<UnitBlob>,
    out: &Sender<Finished>,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        let blob = match input.try_recv() {
            Ok(blob) => blob,
            Err(TryRecvError::Empty) => {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(TryRecvError::Disconnected) => {
                error!("Capture queue is gone, stopping ordering");
                break;
            }
        };
        if let Some(finished) = orderer.insert(blob) {
            if out.send(finished).is_err() {
                error!("Dispatch queue is gone, stopping ordering");
                break;
            }
        }
    }
    debug!(pending = orderer.pending(), "Ordering loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{tests::small_config, tests::SMALL, InstrumentConfig},
        topology::{Baseline, Input, Sideband, XengWord},
    };
    use std::sync::{
        atomic::AtomicUsize,
        Arc, Mutex,
    };

    /// Distinct, exactly representable value per word
    fn value(qid: usize, fid: usize, offset: usize, channel: usize) -> i32 {
        (qid * 100_000 + fid * 10_000 + offset * 100 + channel) as i32 + 1
    }

    fn unit(topology: &dyn Topology, qid: usize, fid: usize, acc_n: u32) -> UnitBlob {
        let words = topology.packet_order(qid).len();
        UnitBlob {
            qid,
            fid,
            acc_n,
            scan_end: Utc::now(),
            data: interleave_words(words, topology.geometry().fid_channels(), |offset, ch| {
                value(qid, fid, offset, ch)
            }),
        }
    }

    fn orderer(topology: Arc<dyn Topology>, rawbacks: Vec<Box<dyn RawConsumer>>) -> Orderer {
        Orderer::new(topology, Arc::new(AtomicBool::new(false)), rawbacks, 4)
    }

    fn feed_all(orderer: &mut Orderer, topology: &dyn Topology, acc_n: u32) -> Vec<Finished> {
        let mut out = vec![];
        for qid in 0..topology.quadrants() {
            for fid in 0..topology.fids_expected(qid) {
                out.extend(orderer.insert(unit(topology, qid, fid, acc_n)));
            }
        }
        out
    }

    #[test]
    fn interleave_splits_channels_between_fids() {
        let geometry = *small_config().geometry();
        let il = Interleave::new(&geometry);
        assert_eq!(il.positions(0), vec![0, 2, 8, 10, 16, 18, 24, 26]);
        assert_eq!(il.positions(1), vec![4, 6, 12, 14, 20, 22, 28, 30]);
    }

    #[test]
    fn publishes_once_every_unit_arrived() {
        let topology: Arc<dyn Topology> = Arc::new(small_config());
        let mut ord = orderer(topology.clone(), vec![]);
        let done = feed_all(&mut ord, topology.as_ref(), 5);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].acc_n, 5);
        assert!(done[0].package.is_complete());
        assert_eq!(ord.pending(), 0);
    }

    #[test]
    fn samples_land_on_their_baseline_and_channel() {
        let cfg = small_config();
        let topology: Arc<dyn Topology> = Arc::new(cfg.clone());
        let mut ord = orderer(topology.clone(), vec![]);
        let pkg = feed_all(&mut ord, topology.as_ref(), 1).remove(0).package;

        // Word 16 of quadrant 1 is the first cross, USB, real; word 19 is its LSB imag
        let word = cfg.packet_order(1)[16];
        let il = Interleave::new(cfg.geometry());
        for fid in 0..2 {
            let usb = pkg.get(&word.baseline, Sideband::Usb).unwrap();
            let lsb = pkg.get(&word.baseline, Sideband::Lsb).unwrap();
            for (ch, &p) in il.positions(fid).iter().enumerate() {
                assert_eq!(usb[p], value(1, fid, 16, ch) as f32);
                assert_eq!(usb[p + 1], value(1, fid, 17, ch) as f32);
                assert_eq!(lsb[p + 1], value(1, fid, 19, ch) as f32);
            }
        }
    }

    #[test]
    fn autos_have_zero_imaginary() {
        let topology: Arc<dyn Topology> = Arc::new(small_config());
        let mut ord = orderer(topology.clone(), vec![]);
        let pkg = feed_all(&mut ord, topology.as_ref(), 1).remove(0).package;
        for auto in pkg.auto_baselines() {
            for sideband in Sideband::ALL {
                let row = pkg.get(auto, sideband).unwrap();
                assert!(row.chunks(2).all(|c| c[0] != 0.0 && c[1] == 0.0));
            }
        }
    }

    #[test]
    fn missing_unit_never_publishes() {
        let topology: Arc<dyn Topology> = Arc::new(small_config());
        let mut ord = orderer(topology.clone(), vec![]);
        for (qid, fid) in [(0, 0), (0, 1), (1, 1)] {
            assert!(ord.insert(unit(topology.as_ref(), qid, fid, 9)).is_none());
        }
        // Repeats of the same unit don't stand in for the missing one
        assert!(ord.insert(unit(topology.as_ref(), 1, 1, 9)).is_none());
        assert_eq!(ord.pending(), 1);
    }

    #[test]
    fn unexpected_units_are_ignored() {
        let topology: Arc<dyn Topology> = Arc::new(small_config());
        let mut ord = orderer(topology.clone(), vec![]);
        let mut stray = unit(topology.as_ref(), 0, 0, 2);
        stray.qid = 3;
        assert!(ord.insert(stray).is_none());
        let mut stray = unit(topology.as_ref(), 0, 0, 2);
        stray.fid = 2;
        assert!(ord.insert(stray).is_none());
        let mut short = unit(topology.as_ref(), 0, 0, 2);
        short.data.truncate(100);
        assert!(ord.insert(short).is_none());
        assert_eq!(ord.pending(), 0);
    }

    #[test]
    fn swapped_cross_order_uses_conjugate_rows() {
        let cfg: InstrumentConfig = SMALL
            .replace("integration_time = 2.0", "integration_time = 2.0\nswap_cross_order = true")
            .parse()
            .unwrap();
        let topology: Arc<dyn Topology> = Arc::new(cfg);
        let mut ord = orderer(topology.clone(), vec![]);
        let done = feed_all(&mut ord, topology.as_ref(), 3);
        assert_eq!(done.len(), 1);
        assert!(done[0].package.is_complete());
    }

    #[test]
    fn full_accumulation_sets_boundary_flag() {
        let topology: Arc<dyn Topology> = Arc::new(small_config());
        let flag = Arc::new(AtomicBool::new(false));
        let mut ord = Orderer::new(topology.clone(), flag.clone(), vec![], 4);
        ord.insert(unit(topology.as_ref(), 0, 0, 1));
        assert!(!flag.load(Ordering::Acquire));
        feed_all(&mut ord, topology.as_ref(), 1);
        assert!(flag.load(Ordering::Acquire));
    }

    struct Failing;

    impl RawConsumer for Failing {
        fn consume(&mut self, _raw: &RawAccumulation) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    struct Panicking;

    impl RawConsumer for Panicking {
        fn consume(&mut self, raw: &RawAccumulation) -> anyhow::Result<()> {
            panic!("bad accumulation {}", raw.acc_n())
        }
    }

    struct Counting(Arc<AtomicUsize>, Arc<Mutex<Vec<usize>>>);

    impl RawConsumer for Counting {
        fn consume(&mut self, raw: &RawAccumulation) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1
                .lock()
                .unwrap()
                .extend(raw.blobs().iter().flatten().map(Vec::len));
            Ok(())
        }
    }

    #[test]
    fn rawback_failures_are_isolated() {
        let topology: Arc<dyn Topology> = Arc::new(small_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(vec![]));
        let rawbacks: Vec<Box<dyn RawConsumer>> = vec![
            Box::new(Failing),
            Box::new(Panicking),
            Box::new(Counting(calls.clone(), sizes.clone())),
        ];
        let mut ord = orderer(topology.clone(), rawbacks);
        assert_eq!(feed_all(&mut ord, topology.as_ref(), 1).len(), 1);
        assert_eq!(feed_all(&mut ord, topology.as_ref(), 2).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sizes.lock().unwrap(), vec![1280; 16]);
    }

    /// Claims a word for an input no package knows about
    struct Inconsistent {
        inner: InstrumentConfig,
        order: Vec<XengWord>,
    }

    impl Topology for Inconsistent {
        fn geometry(&self) -> &Geometry {
            self.inner.geometry()
        }
        fn quadrants(&self) -> usize {
            self.inner.quadrants()
        }
        fn fids_expected(&self, qid: usize) -> usize {
            self.inner.fids_expected(qid)
        }
        fn fid_inputs(&self, qid: usize, fid: usize) -> &[Input] {
            self.inner.fid_inputs(qid, fid)
        }
        fn packet_order(&self, qid: usize) -> &[XengWord] {
            if qid == 0 {
                &self.order
            } else {
                self.inner.packet_order(qid)
            }
        }
        fn integration_time(&self) -> f64 {
            self.inner.integration_time()
        }
    }

    #[test]
    fn baseline_missing_both_ways_drops_accumulation() {
        let inner = small_config();
        let mut order = inner.packet_order(0).to_vec();
        order[16].baseline = Baseline::new(Input::new(9, 0, 0), Input::new(1, 0, 0));
        let topology: Arc<dyn Topology> = Arc::new(Inconsistent { inner, order });
        let mut ord = orderer(topology.clone(), vec![]);
        assert!(feed_all(&mut ord, topology.as_ref(), 1).is_empty());
        // The pipeline keeps going
        assert_eq!(ord.pending(), 0);
    }
}
