use std::io::{self, Write};
use std::process;

use anyhow::{bail, Result};
use clap::Parser;
use log::debug;

use mmu_sim::cli::{Algorithm, Cli, TraceOptions};
use mmu_sim::constants::MAX_FRAMES;
use mmu_sim::io::{RandomStream, Workload};
use mmu_sim::pager::Pager;
use mmu_sim::report;
use mmu_sim::sim::Simulation;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.frames == 0 || cli.frames > MAX_FRAMES {
        bail!("frame count {} out of range 1..={}", cli.frames, MAX_FRAMES);
    }
    let algorithm = Algorithm::from_letter(&cli.algorithm)?;
    let opts = TraceOptions::parse(&cli.options)?;

    let workload = Workload::from_file(&cli.inputfile)?;
    let rng = match &cli.randomfile {
        Some(path) => RandomStream::from_file(path)?,
        None if algorithm.needs_random_file() => {
            bail!("the random algorithm requires a random file")
        }
        None => RandomStream::default(),
    };
    debug!(
        "{} processes, {} instructions, {} frames",
        workload.processes.len(),
        workload.instructions.len(),
        cli.frames
    );

    let mut sim = Simulation::new(
        workload.processes,
        cli.frames,
        Pager::new(algorithm),
        rng,
        opts,
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    sim.run(&workload.instructions, &mut out)?;
    report::write_report(&mut out, &sim)?;
    out.flush()?;
    Ok(())
}
