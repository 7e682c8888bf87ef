//! Boot-time Kernel Configuration
//!
//! Only sizing knobs live here. The address-space layout is fixed at
//! compile time in `memlayout`.

use log::LevelFilter;

use crate::error::{KResult, KernelError};
use crate::logging;
use crate::memlayout::{MAX_PHYS_MEM, PGSIZE};

/// Smallest machine that can boot and run one forking process.
pub const MIN_FRAMES: usize = 16;

/// Sizing of the emulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical frames, including the reserved frame 0.
    pub nframes: usize,
    /// Translation cache capacity.
    pub tlb_entries: usize,
    /// Level handed to `logging::init` by the embedder.
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            nframes: 1024,
            tlb_entries: 64,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    pub fn with_frames(mut self, nframes: usize) -> Self {
        self.nframes = nframes;
        self
    }

    pub fn with_tlb_entries(mut self, entries: usize) -> Self {
        self.tlb_entries = entries;
        self
    }

    /// Set the log level from a name such as `"debug"`; unknown or
    /// missing names select `Info`.
    pub fn with_log_level(mut self, name: Option<&str>) -> Self {
        self.log_level = logging::parse_level(name);
        self
    }

    /// Reject configurations the layout cannot hold.
    pub fn validate(&self) -> KResult<()> {
        if self.nframes < MIN_FRAMES || self.nframes > MAX_PHYS_MEM / PGSIZE {
            return Err(KernelError::Inval);
        }
        if self.tlb_entries == 0 {
            return Err(KernelError::Inval);
        }
        Ok(())
    }
}
