use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::constants::MAX_VPAGES;
use crate::memory::{Process, Vma};
use crate::sim::Instruction;

/// Deterministic pseudo-random stream backed by a pre-loaded value file.
/// Draws walk the loaded sequence with a monotone offset, wrapping at the
/// end, so identical inputs always produce identical victim choices.
#[derive(Debug, Default)]
pub struct RandomStream {
    values: Vec<u64>,
    ofs: usize,
}

impl RandomStream {
    pub fn new(values: Vec<u64>) -> Self {
        RandomStream { values, ofs: 0 }
    }

    /// Load a random-value file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read random file {}", path.as_ref().display())
        })?;

        Self::parse(&content)
    }

    /// Parse the random-value format: a count, then that many integers.
    /// Values beyond the declared count are ignored; fewer is an error.
    pub fn parse(content: &str) -> Result<Self> {
        let mut tokens = content.split_whitespace();

        let count = tokens
            .next()
            .context("random file is empty")?
            .parse::<usize>()
            .context("invalid random value count")?;
        if count == 0 {
            bail!("random file declares no values");
        }

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let token = tokens
                .next()
                .context("random file is shorter than its declared count")?;
            let value = token
                .parse::<u64>()
                .with_context(|| format!("invalid random value: {}", token))?;
            values.push(value);
        }

        Ok(RandomStream::new(values))
    }

    /// Draw the next value reduced modulo `bound`, advancing the offset.
    pub fn next(&mut self, bound: usize) -> usize {
        let value = self.values[self.ofs % self.values.len()] as usize % bound;
        self.ofs += 1;
        value
    }
}

/// Parsed contents of the simulation input file: the process table and the
/// instruction trace.
#[derive(Debug)]
pub struct Workload {
    pub processes: Vec<Process>,
    pub instructions: Vec<Instruction>,
}

impl Workload {
    /// Load an input file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read input file {}", path.as_ref().display())
        })?;

        Self::parse(&content)
    }

    /// Parse the input format: a process count, per-process VMA blocks,
    /// then instruction lines. Lines starting with `#` are comments and are
    /// ignored wherever they appear.
    pub fn parse(content: &str) -> Result<Self> {
        let mut tokens = content
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .flat_map(str::split_whitespace);

        let num_procs = next_int(&mut tokens, "process count")?;

        let mut processes = Vec::with_capacity(num_procs);
        for pid in 0..num_procs {
            let num_vmas = next_int(&mut tokens, "VMA count")?;
            let mut vmas = Vec::with_capacity(num_vmas);
            for _ in 0..num_vmas {
                let start_page = next_int(&mut tokens, "VMA start page")?;
                let end_page = next_int(&mut tokens, "VMA end page")?;
                let write_protected = next_int(&mut tokens, "VMA write-protect flag")? != 0;
                let file_mapped = next_int(&mut tokens, "VMA file-map flag")? != 0;

                if start_page > end_page || end_page >= MAX_VPAGES {
                    bail!(
                        "process {}: invalid VMA range {}:{}",
                        pid,
                        start_page,
                        end_page
                    );
                }

                vmas.push(Vma {
                    start_page,
                    end_page,
                    write_protected,
                    file_mapped,
                });
            }
            processes.push(Process::new(vmas));
        }

        let mut instructions = Vec::new();
        while let Some(opcode) = tokens.next() {
            let target = next_int(&mut tokens, "instruction target")?;
            let instruction = Instruction::new(opcode, target)?;
            if let Instruction::ContextSwitch(pid) | Instruction::Exit(pid) = instruction {
                if pid >= processes.len() {
                    bail!("instruction references unknown process {}", pid);
                }
            }
            instructions.push(instruction);
        }

        Ok(Workload {
            processes,
            instructions,
        })
    }
}

fn next_int<'a>(tokens: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<usize> {
    let token = tokens
        .next()
        .with_context(|| format!("input ended while reading {}", what))?;
    token
        .parse()
        .with_context(|| format!("invalid {}: {}", what, token))
}
