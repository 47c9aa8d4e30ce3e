//! Consumer contracts for raw and finished accumulations
//!
//! Consumers are registered once, before the pipeline starts, through
//! [`crate::catcher::PipelineBuilder`]. Every invocation runs behind an isolation
//! boundary: an `Err` or a panic is logged with the consumer's name and the
//! pipeline moves on to the next consumer.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use tracing::error;

use crate::package::DataPackage;

/// Every FID's reassembled blob for one accumulation, indexed `[qid][fid]`
#[derive(Debug, Clone)]
pub struct RawAccumulation {
    acc_n: u32,
    blobs: Vec<Vec<Vec<u8>>>,
}

impl RawAccumulation {
    pub fn new(acc_n: u32, blobs: Vec<Vec<Vec<u8>>>) -> Self {
        Self { acc_n, blobs }
    }

    pub fn acc_n(&self) -> u32 {
        self.acc_n
    }

    pub fn blobs(&self) -> &[Vec<Vec<u8>>] {
        &self.blobs
    }

    pub fn blob(&self, qid: usize, fid: usize) -> Option<&[u8]> {
        self.blobs.get(qid)?.get(fid).map(Vec::as_slice)
    }
}

/// Sees the raw blobs of a fully collected accumulation, before reordering
pub trait RawConsumer: Send {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn consume(&mut self, raw: &RawAccumulation) -> anyhow::Result<()>;
}

/// Sees each finished data package, in registration order
pub trait DataConsumer: Send {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn consume(&mut self, data: &DataPackage) -> anyhow::Result<()>;
}

/// Registry entry for either kind of consumer
pub enum Consumer {
    Raw(Box<dyn RawConsumer>),
    Data(Box<dyn DataConsumer>),
}

impl Consumer {
    pub fn raw(consumer: impl RawConsumer + 'static) -> Self {
        Self::Raw(Box::new(consumer))
    }

    pub fn data(consumer: impl DataConsumer + 'static) -> Self {
        Self::Data(Box::new(consumer))
    }

    pub fn name(&self) -> &str {
        match self {
            Consumer::Raw(c) => c.name(),
            Consumer::Data(c) => c.name(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// Run one consumer invocation, logging instead of propagating its failure.
/// Returns whether it succeeded.
pub(crate) fn isolated(
    kind: &str,
    name: &str,
    acc_n: u32,
    f: impl FnOnce() -> anyhow::Result<()>,
) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(consumer = name, acc_n, "Exception from {kind}: {e:#}");
            false
        }
        Err(payload) => {
            error!(
                consumer = name,
                acc_n,
                "Panic from {kind}: {}",
                panic_message(payload.as_ref())
            );
            false
        }
    }
}
