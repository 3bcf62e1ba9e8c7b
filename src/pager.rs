use std::io::Write;

use anyhow::Result;
use log::debug;

use crate::cli::Algorithm;
use crate::constants::{NRU_RESET_CYCLE, WS_TAU};
use crate::io::RandomStream;
use crate::memory::{FrameTable, Process, Pte, PteFlags};

/// Reverse map: the page table entry behind a mapped frame. Pagers only run
/// when every frame holds a mapping.
fn pte_mut<'a>(frames: &FrameTable, procs: &'a mut [Process], frame_id: usize) -> &'a mut Pte {
    let (pid, vpage) = frames[frame_id]
        .mapping
        .expect("pager scanned an unmapped frame");
    &mut procs[pid].page_table[vpage]
}

/// The hand sweeps the frame table one slot per eviction, ignoring
/// reference bits.
#[derive(Debug, Default)]
pub struct Fifo {
    hand: usize,
}

impl Fifo {
    fn select_victim(&mut self, frames: &FrameTable) -> usize {
        let victim = self.hand;
        self.hand = (self.hand + 1) % frames.len();
        victim
    }
}

/// Second-chance scan: referenced frames get their bit cleared and are
/// passed over; the first unreferenced frame is the victim.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    fn select_victim(
        &mut self,
        frames: &FrameTable,
        procs: &mut [Process],
        aselect: bool,
        out: &mut impl Write,
    ) -> Result<usize> {
        let start = self.hand;
        let mut scanned = 0;
        loop {
            let hand = self.hand;
            scanned += 1;
            let pte = pte_mut(frames, procs, hand);
            if pte.flags.contains(PteFlags::REFERENCED) {
                pte.flags.remove(PteFlags::REFERENCED);
                self.hand = (hand + 1) % frames.len();
            } else {
                self.hand = (hand + 1) % frames.len();
                if aselect {
                    writeln!(out, "ASELECT {} {}", start, scanned)?;
                }
                return Ok(hand);
            }
        }
    }
}

/// Not-Recently-Used: frames fall into classes `2*R + M`; the victim is the
/// first frame of the lowest populated class. Every `NRU_RESET_CYCLE`
/// instructions the scan also clears all reference bits, and classes are
/// recorded before the clear.
#[derive(Debug, Default)]
pub struct Nru {
    hand: usize,
    last_reset: u64,
}

impl Nru {
    fn select_victim(
        &mut self,
        frames: &FrameTable,
        procs: &mut [Process],
        clock: u64,
        aselect: bool,
        out: &mut impl Write,
    ) -> Result<usize> {
        let n = frames.len();
        let reset = clock >= self.last_reset + NRU_RESET_CYCLE;
        let start = self.hand;

        let mut class_frame: [Option<usize>; 4] = [None; 4];
        let mut scanned = 0;
        let mut shortcut = None;
        for i in 0..n {
            let fid = (start + i) % n;
            scanned += 1;
            let pte = pte_mut(frames, procs, fid);
            let class = 2 * pte.flags.contains(PteFlags::REFERENCED) as usize
                + pte.flags.contains(PteFlags::MODIFIED) as usize;
            if class_frame[class].is_none() {
                class_frame[class] = Some(fid);
            }
            if reset {
                pte.flags.remove(PteFlags::REFERENCED);
            } else if class == 0 {
                shortcut = Some(fid);
                break;
            }
        }

        let (victim, class) = match shortcut {
            Some(fid) => (fid, 0),
            None => class_frame
                .iter()
                .enumerate()
                .find_map(|(class, fid)| fid.map(|fid| (fid, class)))
                .expect("scan visited at least one mapped frame"),
        };

        self.hand = (victim + 1) % n;
        if reset {
            self.last_reset = clock;
        }
        if aselect {
            writeln!(
                out,
                "ASELECT {} {} | {} {} {}",
                start, reset as u8, class, victim, scanned
            )?;
        }
        Ok(victim)
    }
}

/// Aging: every selection halves each frame's bit register, ORs the top bit
/// in for referenced frames, and evicts the smallest register. Ties go to
/// the frame seen first from the hand.
#[derive(Debug, Default)]
pub struct Aging {
    hand: usize,
}

impl Aging {
    fn select_victim(
        &mut self,
        frames: &mut FrameTable,
        procs: &mut [Process],
        aselect: bool,
        out: &mut impl Write,
    ) -> Result<usize> {
        let n = frames.len();
        let start = self.hand;
        let mut victim = start;
        let mut ages = Vec::new();

        for i in 0..n {
            let fid = (start + i) % n;
            let pte = pte_mut(frames, procs, fid);
            let mut age = frames[fid].age >> 1;
            if pte.flags.contains(PteFlags::REFERENCED) {
                age |= 0x8000_0000;
                pte.flags.remove(PteFlags::REFERENCED);
            }
            frames[fid].age = age;
            if age < frames[victim].age {
                victim = fid;
            }
            if aselect {
                ages.push(format!("{}:{:x}", fid, age));
            }
        }

        self.hand = (victim + 1) % n;
        if aselect {
            writeln!(
                out,
                "ASELECT {}-{} | {} | {}",
                start,
                (start + n - 1) % n,
                ages.join(" "),
                victim
            )?;
        }
        Ok(victim)
    }
}

/// Working-Set: a frame's `age` holds the instruction count of its last
/// known reference. The first unreferenced frame older than tau is evicted;
/// failing that, the oldest frame is.
#[derive(Debug, Default)]
pub struct WorkingSet {
    hand: usize,
}

impl WorkingSet {
    fn select_victim(
        &mut self,
        frames: &mut FrameTable,
        procs: &mut [Process],
        clock: u64,
        aselect: bool,
        out: &mut impl Write,
    ) -> Result<usize> {
        let n = frames.len();
        let start = self.hand;
        let mut aged_out = None;
        let mut oldest: Option<usize> = None;
        let mut scanned = 0;

        for i in 0..n {
            let fid = (start + i) % n;
            scanned += 1;
            let pte = pte_mut(frames, procs, fid);
            if pte.flags.contains(PteFlags::REFERENCED) {
                frames[fid].age = clock;
                pte.flags.remove(PteFlags::REFERENCED);
            } else if clock > frames[fid].age + WS_TAU {
                aged_out = Some(fid);
                break;
            }
            match oldest {
                Some(o) if frames[fid].age >= frames[o].age => {}
                _ => oldest = Some(fid),
            }
        }

        let victim = aged_out
            .or(oldest)
            .expect("scan visited at least one mapped frame");
        self.hand = (victim + 1) % n;
        if aselect {
            writeln!(
                out,
                "ASELECT {}-{} | {} {}",
                start,
                (start + n - 1) % n,
                victim,
                scanned
            )?;
        }
        Ok(victim)
    }
}

/// Page-replacement policy, selected on the command line. Policies differ
/// in the state they keep between selections, not in interface, so they
/// live behind one tagged enum rather than trait objects.
#[derive(Debug)]
pub enum Pager {
    Fifo(Fifo),
    Random,
    Clock(Clock),
    Nru(Nru),
    Aging(Aging),
    WorkingSet(WorkingSet),
}

impl Pager {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Fifo => Pager::Fifo(Fifo::default()),
            Algorithm::Random => Pager::Random,
            Algorithm::Clock => Pager::Clock(Clock::default()),
            Algorithm::Nru => Pager::Nru(Nru::default()),
            Algorithm::Aging => Pager::Aging(Aging::default()),
            Algorithm::WorkingSet => Pager::WorkingSet(WorkingSet::default()),
        }
    }

    /// Choose the frame the next mapping will displace. Runs only when the
    /// free list is empty, so every frame holds a mapping. Mutating the
    /// chosen frame is the fault handler's job.
    pub fn select_victim(
        &mut self,
        frames: &mut FrameTable,
        procs: &mut [Process],
        rng: &mut RandomStream,
        clock: u64,
        aselect: bool,
        out: &mut impl Write,
    ) -> Result<usize> {
        let victim = match self {
            Pager::Fifo(pager) => pager.select_victim(frames),
            Pager::Random => rng.next(frames.len()),
            Pager::Clock(pager) => pager.select_victim(frames, procs, aselect, out)?,
            Pager::Nru(pager) => pager.select_victim(frames, procs, clock, aselect, out)?,
            Pager::Aging(pager) => pager.select_victim(frames, procs, aselect, out)?,
            Pager::WorkingSet(pager) => {
                pager.select_victim(frames, procs, clock, aselect, out)?
            }
        };
        debug!("selected victim frame {}", victim);
        Ok(victim)
    }

    /// Reinitialize policy age state for a freshly mapped frame.
    pub fn reset_age(&mut self, frames: &mut FrameTable, frame_id: usize, clock: u64) {
        match self {
            Pager::Aging(_) => frames[frame_id].age = 0,
            Pager::WorkingSet(_) => frames[frame_id].age = clock,
            _ => {}
        }
    }
}
