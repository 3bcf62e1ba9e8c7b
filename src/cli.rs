use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

/// Deterministic virtual-memory MMU simulator.
#[derive(Debug, Parser)]
#[command(name = "mmu")]
pub struct Cli {
    /// Number of physical frames to simulate (1..=128)
    #[arg(short = 'f', value_name = "NUM")]
    pub frames: usize,

    /// Replacement algorithm: f=FIFO r=Random c=Clock e=NRU a=Aging w=Working-Set
    #[arg(short = 'a', value_name = "ALGO")]
    pub algorithm: String,

    /// Output options, any of OPFSxyfa
    #[arg(short = 'o', value_name = "OPTS", default_value = "")]
    pub options: String,

    /// Process and instruction trace file
    pub inputfile: PathBuf,

    /// Deterministic random-value file (required by the Random algorithm)
    pub randomfile: Option<PathBuf>,
}

/// Page-replacement policy selected with `-a`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Fifo,
    Random,
    Clock,
    Nru,
    Aging,
    WorkingSet,
}

impl Algorithm {
    pub fn from_letter(letter: &str) -> Result<Self> {
        match letter {
            "f" => Ok(Algorithm::Fifo),
            "r" => Ok(Algorithm::Random),
            "c" => Ok(Algorithm::Clock),
            "e" => Ok(Algorithm::Nru),
            "a" => Ok(Algorithm::Aging),
            "w" => Ok(Algorithm::WorkingSet),
            _ => bail!("unknown replacement algorithm: {}", letter),
        }
    }

    /// Whether the policy draws from the random stream.
    pub fn needs_random_file(self) -> bool {
        matches!(self, Algorithm::Random)
    }
}

/// Output sections and debug dumps selected by the `-o` option string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceOptions {
    /// `O`: per-instruction operation trace.
    pub trace: bool,
    /// `P`: final page tables.
    pub page_tables: bool,
    /// `F`: final frame table.
    pub frame_table: bool,
    /// `S`: per-process and total statistics.
    pub stats: bool,
    /// `x`: current process's page table after every instruction.
    pub cur_pt: bool,
    /// `y`: every page table after every instruction.
    pub all_pt: bool,
    /// `f`: frame table after every instruction.
    pub cur_ft: bool,
    /// `a`: per-selection pager diagnostics (ASELECT lines).
    pub aging: bool,
}

impl TraceOptions {
    pub fn parse(options: &str) -> Result<Self> {
        let mut opts = TraceOptions::default();
        for letter in options.chars() {
            match letter {
                'O' => opts.trace = true,
                'P' => opts.page_tables = true,
                'F' => opts.frame_table = true,
                'S' => opts.stats = true,
                'x' => opts.cur_pt = true,
                'y' => opts.all_pt = true,
                'f' => opts.cur_ft = true,
                'a' => opts.aging = true,
                _ => bail!("error in options - {}", options),
            }
        }
        Ok(opts)
    }
}
