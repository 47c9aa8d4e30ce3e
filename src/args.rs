//! Argument parsing for running from the command line

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use vis_slurper::catcher::{DEFAULT_PENDING_LIMIT, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// TOML description of the instrument (geometry, quadrants, inputs)
    #[clap(short, long)]
    pub config: PathBuf,
    /// Address to bind the capture socket on
    #[clap(long, default_value = "0.0.0.0")]
    pub host: String,
    /// Port to capture X-engine UDP data from
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Accumulations tracked at once before the oldest is evicted
    #[clap(long, default_value_t = DEFAULT_PENDING_LIMIT as u64)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub pending_limit: u64,
    /// Log per-baseline amplitude, phase and correlation for every accumulation
    #[clap(long)]
    pub stats: bool,
    /// Solve antenna gains and delays for this quadrant
    #[clap(long)]
    pub calibrate: Option<u8>,
    /// Stream finished packages to a subscriber listening on this address
    #[clap(long)]
    pub publish: Option<SocketAddr>,
    /// Apply the beamformer second-sideband phases before publishing
    #[clap(long, requires = "publish")]
    pub rephase: bool,
    /// Write every FID's raw blob to this directory
    #[clap(long)]
    pub dump_raw: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
