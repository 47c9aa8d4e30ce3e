use std::{
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use vis_slurper::{
    calibrate::CalibrateVlbi,
    exfil::{Publisher, RawDump},
    monitoring::LogStats,
    InstrumentConfig, PipelineBuilder, Topology,
};

mod args;

fn main() -> anyhow::Result<()> {
    // Get the CLI options
    let cli = args::Args::parse();
    // Setup logging
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(cli.verbose.log_level_filter()))
        .init();
    info!("Starting visibility catcher!");

    let config = InstrumentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let topology: Arc<dyn Topology> = Arc::new(config);

    let mut builder = PipelineBuilder::new(topology.clone())
        .host(cli.host.as_str())
        .port(cli.port)
        .pending_limit(cli.pending_limit as usize);
    if let Some(dir) = &cli.dump_raw {
        builder = builder.rawback(RawDump::new(dir)?);
    }
    if cli.stats {
        builder = builder.callback(LogStats::default());
    }
    if let Some(quadrant) = cli.calibrate {
        builder = builder.callback(CalibrateVlbi::new(topology.as_ref(), quadrant, None));
    }
    if let Some(addr) = cli.publish {
        let stream =
            TcpStream::connect(addr).with_context(|| format!("connecting to subscriber {addr}"))?;
        info!(%addr, "Publishing packages");
        let publisher = Publisher::new(stream);
        builder = if cli.rephase {
            builder.callback(publisher.with_rephase(topology.clone()))
        } else {
            builder.callback(publisher)
        };
    }
    let (mut catcher, mut handler) = builder.build()?;

    // Stop dispatching on Ctrl-C, then tear the threads down
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::Release))?;

    catcher.start()?;
    handler.run(&interrupt);
    catcher.stop();
    info!("Goodbye!");
    Ok(())
}
