//! Guess whether tiling pays off for a pass.
//!
//! Tiling costs a load and a store of every attachment per tile, rendering directly to memory
//! costs the traffic of every draw. For tiny passes with few draws the latter is often cheaper.
use core::ops::AddAssign;

use crate::command::Rectangle;
use crate::device::Capabilities;

/// Passes with more draws than this always prefer tiling.
const MAX_BYPASS_DRAWS: u32 = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AutotuneMode {
    #[default]
    Heuristic,
    PreferGmem,
    PreferSysmem,
}

/// Draw statistics collected while recording a pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PassStats {
    pub draw_count: u32,
    /// Bytes each draw moves per sample through attachments, summed over all draws.
    pub bandwidth_per_sample: u64,
}

/// The fixed costs of a pass, independent of its draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PassCost {
    /// Bytes per pixel loaded into and stored from tile memory.
    pub gmem_bytes_per_pixel: u32,
    /// Some attachment is cleared or loaded at the start of the pass.
    pub clears_or_loads: bool,
    pub samples: u32,
}

#[derive(Clone, Debug, Default)]
pub struct Autotune {
    mode: AutotuneMode,
}

impl Autotune {
    pub fn new(mode: AutotuneMode) -> Self {
        Autotune { mode }
    }

    /// Whether rendering directly to memory is expected to be faster.
    pub fn prefer_sysmem(
        &self,
        caps: &Capabilities,
        area: Rectangle,
        cost: &PassCost,
        stats: &PassStats,
    ) -> bool {
        match self.mode {
            AutotuneMode::PreferGmem => return false,
            AutotuneMode::PreferSysmem => return true,
            AutotuneMode::Heuristic => {}
        }

        let pixels = u64::from(area.width()) * u64::from(area.height());

        // Less than one aligned tile: all the tiling setup is pure overhead.
        let (align_w, align_h) = caps.tile_align();
        if pixels < u64::from(align_w) * u64::from(align_h) {
            return true;
        }

        if stats.draw_count > MAX_BYPASS_DRAWS || cost.clears_or_loads {
            return false;
        }

        let samples = u64::from(cost.samples.max(1));
        let sysmem = stats.bandwidth_per_sample * samples * pixels;
        let gmem = u64::from(cost.gmem_bytes_per_pixel) * pixels;

        log::trace!("Estimated bandwidth: sysmem {} gmem {}", sysmem, gmem);
        sysmem <= gmem
    }
}

impl AddAssign for PassStats {
    fn add_assign(&mut self, other: PassStats) {
        self.draw_count += other.draw_count;
        self.bandwidth_per_sample += other.bandwidth_per_sample;
    }
}
