/// Virtual pages per process page table.
pub const MAX_VPAGES: usize = 64;

/// Upper bound on the physical frame pool.
pub const MAX_FRAMES: usize = 128;

/// NRU clears every reference bit once this many instructions have passed
/// since the last reset.
pub const NRU_RESET_CYCLE: u64 = 48;

/// Working-Set age threshold (tau), in instruction-counter units.
pub const WS_TAU: u64 = 49;

// Simulated cost of each operation, in abstract time units.
pub const CTX_SWITCH_TIME: u64 = 130;
pub const PROC_EXIT_TIME: u64 = 1230;
pub const LD_ST_TIME: u64 = 1;
pub const MAPS_TIME: u64 = 350;
pub const UNMAPS_TIME: u64 = 410;
pub const INS_TIME: u64 = 3200;
pub const OUTS_TIME: u64 = 2750;
pub const FINS_TIME: u64 = 2350;
pub const FOUTS_TIME: u64 = 2800;
pub const ZEROS_TIME: u64 = 150;
pub const SEGV_TIME: u64 = 440;
pub const SEGPROT_TIME: u64 = 410;
