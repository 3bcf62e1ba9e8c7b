use std::io::{self, Write};

use crate::memory::{FrameTable, Process, Pte, PteFlags};
use crate::sim::Simulation;

/// `PT[pid]:` line, one cell per virtual page. Present pages show their
/// reference/modified/swapped bits; non-present pages show `#` once they
/// have been swapped out and `*` otherwise.
pub fn write_page_table(out: &mut impl Write, pid: usize, process: &Process) -> io::Result<()> {
    write!(out, "PT[{}]:", pid)?;
    for (vpage, pte) in process.page_table.iter().enumerate() {
        if pte.flags.contains(PteFlags::PRESENT) {
            write!(
                out,
                " {}:{}{}{}",
                vpage,
                flag(pte, PteFlags::REFERENCED, 'R'),
                flag(pte, PteFlags::MODIFIED, 'M'),
                flag(pte, PteFlags::PAGED_OUT, 'S'),
            )?;
        } else if pte.flags.contains(PteFlags::PAGED_OUT) {
            write!(out, " #")?;
        } else {
            write!(out, " *")?;
        }
    }
    writeln!(out)
}

fn flag(pte: &Pte, bit: PteFlags, letter: char) -> char {
    if pte.flags.contains(bit) {
        letter
    } else {
        '-'
    }
}

/// `FT:` line: `pid:vpage` per mapped frame, `*` per free frame.
pub fn write_frame_table(out: &mut impl Write, frames: &FrameTable) -> io::Result<()> {
    write!(out, "FT:")?;
    for frame in frames.iter() {
        match frame.mapping {
            Some((pid, vpage)) => write!(out, " {}:{}", pid, vpage)?,
            None => write!(out, " *")?,
        }
    }
    writeln!(out)
}

/// Per-process counter lines followed by the `TOTALCOST` summary.
pub fn write_summary(out: &mut impl Write, sim: &Simulation) -> io::Result<()> {
    for (pid, process) in sim.processes().iter().enumerate() {
        let s = &process.stats;
        writeln!(
            out,
            "PROC[{}]: U={} M={} I={} O={} FI={} FO={} Z={} SV={} SP={}",
            pid, s.unmaps, s.maps, s.ins, s.outs, s.fins, s.fouts, s.zeros, s.segv, s.segprot
        )?;
    }
    writeln!(
        out,
        "TOTALCOST {} {} {} {} {}",
        sim.instructions_executed(),
        sim.ctx_switches(),
        sim.process_exits(),
        sim.cost(),
        std::mem::size_of::<Pte>()
    )
}

/// Print the report sections selected on the command line, in their fixed
/// order: page tables, frame table, statistics.
pub fn write_report(out: &mut impl Write, sim: &Simulation) -> io::Result<()> {
    let opts = sim.options();
    if opts.page_tables {
        for (pid, process) in sim.processes().iter().enumerate() {
            write_page_table(out, pid, process)?;
        }
    }
    if opts.frame_table {
        write_frame_table(out, sim.frames())?;
    }
    if opts.stats {
        write_summary(out, sim)?;
    }
    Ok(())
}
