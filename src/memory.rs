use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::constants::MAX_VPAGES;

/// A contiguous range of virtual pages with uniform protection attributes.
/// Ranges are inclusive on both ends. A process's VMAs may overlap; lookup
/// is first-match in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start_page: usize,
    pub end_page: usize,
    pub write_protected: bool,
    pub file_mapped: bool,
}

impl Vma {
    #[inline]
    pub fn contains(&self, vpage: usize) -> bool {
        self.start_page <= vpage && vpage <= self.end_page
    }
}

bitflags! {
    /// Flag half of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PteFlags: u16 {
        /// A physical frame currently backs this page.
        const PRESENT = 1 << 0;
        /// The page was accessed since the bit was last cleared.
        const REFERENCED = 1 << 1;
        /// The page was written since it was last mapped or written back.
        const MODIFIED = 1 << 2;
        /// Cached from the owning VMA on the first fault.
        const WRITE_PROTECTED = 1 << 3;
        /// The page has been swapped out at least once (anonymous pages only).
        const PAGED_OUT = 1 << 4;
        /// Cached from the owning VMA on the first fault.
        const FILE_MAPPED = 1 << 5;
        /// The VMA lookup already ran for this page; the two cached bits
        /// above are meaningful only while this is set.
        const VMA_CHECKED = 1 << 6;
    }
}

/// Page table entry: a u16 of flags plus a 7-bit frame index, padded by the
/// compiler to four bytes. `frame` is meaningful only while `PRESENT` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte {
    pub flags: PteFlags,
    frame: u8,
}

impl Pte {
    #[inline]
    pub fn frame(&self) -> usize {
        self.frame as usize
    }

    #[inline]
    pub fn set_frame(&mut self, frame: usize) {
        self.frame = frame as u8;
    }
}

/// Per-process operation counters, reported at the end of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStats {
    pub unmaps: u64,
    pub maps: u64,
    pub ins: u64,
    pub outs: u64,
    pub fins: u64,
    pub fouts: u64,
    pub zeros: u64,
    pub segv: u64,
    pub segprot: u64,
}

/// A simulated process: its VMA list, a fixed 64-entry page table, and its
/// operation counters. The pid is the process's index in the process table.
#[derive(Debug)]
pub struct Process {
    pub vmas: Vec<Vma>,
    pub page_table: [Pte; MAX_VPAGES],
    pub stats: ProcStats,
}

impl Process {
    pub fn new(vmas: Vec<Vma>) -> Self {
        Process {
            vmas,
            page_table: [Pte::default(); MAX_VPAGES],
            stats: ProcStats::default(),
        }
    }

    /// First VMA covering `vpage`, in insertion order.
    pub fn find_vma(&self, vpage: usize) -> Option<&Vma> {
        self.vmas.iter().find(|vma| vma.contains(vpage))
    }
}

/// One physical frame slot. `mapping` is the reverse map to the page the
/// frame currently backs, `(pid, vpage)`. `age` belongs to the pager: a bit
/// register under Aging, a last-reference instruction count under
/// Working-Set, unused otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    pub mapping: Option<(usize, usize)>,
    pub age: u64,
}

/// Fixed-capacity frame pool with a FIFO free list. A frame is either on
/// the free list or mapped, never both.
#[derive(Debug)]
pub struct FrameTable {
    frames: Vec<Frame>,
    free: VecDeque<usize>,
}

impl FrameTable {
    pub fn new(num_frames: usize) -> Self {
        FrameTable {
            frames: vec![Frame::default(); num_frames],
            free: (0..num_frames).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Pop the next free frame, if any.
    pub fn alloc_free(&mut self) -> Option<usize> {
        self.free.pop_front()
    }

    /// Clear a frame's mapping and return it to the tail of the free list.
    pub fn release(&mut self, frame_id: usize) {
        self.frames[frame_id] = Frame::default();
        self.free.push_back(frame_id);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }
}

impl Index<usize> for FrameTable {
    type Output = Frame;

    #[inline]
    fn index(&self, frame_id: usize) -> &Frame {
        &self.frames[frame_id]
    }
}

impl IndexMut<usize> for FrameTable {
    #[inline]
    fn index_mut(&mut self, frame_id: usize) -> &mut Frame {
        &mut self.frames[frame_id]
    }
}
