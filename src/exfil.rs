//! This module is responsible for exfilling accumulations out of the catcher

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tracing::{debug, info};

use crate::{
    consumer::{DataConsumer, RawAccumulation, RawConsumer},
    error::{Error, Result},
    package::{DataPackage, MAX_PACKAGE_BYTES},
    topology::{Sideband, Topology},
};

/// Writes every package to `sink` as a little-endian u64 length followed by
/// [`DataPackage::to_bytes`]
pub struct Publisher<W> {
    sink: W,
    rephase: Option<Arc<dyn Topology>>,
}

impl<W: Write + Send> Publisher<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            rephase: None,
        }
    }

    /// Rotate the second sideband by the topology's beamformer phases before
    /// publishing
    pub fn with_rephase(mut self, topology: Arc<dyn Topology>) -> Self {
        self.rephase = Some(topology);
        self
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write + Send> DataConsumer for Publisher<W> {
    fn name(&self) -> &str {
        "Publisher"
    }

    fn consume(&mut self, data: &DataPackage) -> anyhow::Result<()> {
        let bytes = match &self.rephase {
            Some(topology) => data
                .rephased(|input| topology.second_sideband_phase(input), Sideband::Lsb)
                .to_bytes()?,
            None => data.to_bytes()?,
        };
        self.sink
            .write_all(&(bytes.len() as u64).to_le_bytes())
            .and_then(|_| self.sink.write_all(&bytes))
            .and_then(|_| self.sink.flush())
            .context("writing package to subscriber")?;
        debug!(bytes = bytes.len(), "Published package");
        Ok(())
    }
}

/// Read one frame written by [`Publisher`]
pub fn read_published(mut source: impl Read) -> Result<DataPackage> {
    let mut len = [0u8; 8];
    source.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_PACKAGE_BYTES {
        return Err(Error::Malformed(format!("frame of {len} bytes")));
    }
    let mut frame = vec![0u8; len as usize];
    source.read_exact(&mut frame)?;
    DataPackage::from_bytes(&frame)
}

/// Dumps every raw blob to `<dir>/acc-<n>-q<qid>-f<fid>.bin`
pub struct RawDump {
    dir: PathBuf,
}

impl RawDump {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "Dumping raw accumulations");
        Ok(Self { dir })
    }

    pub fn path_for(&self, acc_n: u32, qid: usize, fid: usize) -> PathBuf {
        self.dir.join(format!("acc-{acc_n}-q{qid}-f{fid}.bin"))
    }
}

impl RawConsumer for RawDump {
    fn name(&self) -> &str {
        "RawDump"
    }

    fn consume(&mut self, raw: &RawAccumulation) -> anyhow::Result<()> {
        for (qid, quadrant) in raw.blobs().iter().enumerate() {
            for (fid, blob) in quadrant.iter().enumerate() {
                let path = self.path_for(raw.acc_n(), qid, fid);
                let mut file =
                    File::create(&path).with_context(|| format!("creating {}", path.display()))?;
                file.write_all(blob)?;
            }
        }
        Ok(())
    }
}
