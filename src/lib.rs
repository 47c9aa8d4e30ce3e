//! Catcher for correlator visibility data
//!
//! X-engine FIDs stream their accumulations over UDP. The capture thread
//! reassembles each FID's packets, the ordering thread waits for every FID of an
//! accumulation and reorders the words into a [`DataPackage`], and a [`Handler`]
//! hands finished packages to the registered consumers.

pub mod calibrate;
pub mod capture;
pub mod catcher;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod exfil;
pub mod monitoring;
pub mod order;
pub mod package;
pub mod slots;
pub mod topology;
pub mod wire;

pub use catcher::{Catcher, PipelineBuilder};
pub use config::InstrumentConfig;
pub use consumer::{Consumer, DataConsumer, RawAccumulation, RawConsumer};
pub use dispatch::Handler;
pub use error::{Error, Result};
pub use package::DataPackage;
pub use topology::{Baseline, Geometry, Input, Sideband, Topology};
