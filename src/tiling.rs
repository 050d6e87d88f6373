//! Partition a render pass into tiles that fit tile memory.
//!
//! Tile memory is shared by all attachments that a pass renders to. It is carved into blocks,
//! handed out in proportion to the bytes per pixel of each attachment, and the smallest share
//! decides how many pixels a tile may have. The grid of tiles is then grouped into pipes, each
//! of which collects the visibility of its tiles during the binning pre-pass.
use crate::autotune::{Autotune, PassCost, PassStats};
use crate::command::Rectangle;
use crate::device::{Capabilities, DebugFlags};
use crate::util::{align_down, align_npot};

/// Tile memory block granularity, in units of aligned tiles. As a shift.
const BLOCK_ALIGN_SHIFT: u32 = 3;
/// Pixel budget of a pass without attachments in tile memory.
const NO_ATTACHMENT_PIXELS: u32 = 1024 * 1024;

/// Computes tiling plans for one device.
pub struct Planner<'caps> {
    caps: &'caps Capabilities,
}

/// The way tile memory is shared with the color cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GmemLayout {
    /// All of tile memory holds attachments.
    Full,
    /// The tail of tile memory is left to the color cache, which resolves and unaligned stores
    /// use in its tile memory configuration.
    AvoidCcu,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// The per-pixel cost of one attachment in tile memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileFootprint {
    /// Bytes per pixel of the main plane, all samples.
    pub cpp: u32,
    /// Bytes per pixel of a separate stencil plane, zero if there is none.
    pub stencil_cpp: u32,
}

/// Where an attachment lives in tile memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GmemOffset {
    pub offset: u32,
    pub stencil: Option<u32>,
}

/// The assignment of tile memory to attachments.
#[derive(Clone, Debug, PartialEq, Eq)]
struct GmemConfig {
    tile_align_w: u32,
    /// Pixels per tile, zero if the attachments can not be placed at all.
    pixels: u32,
    offsets: Vec<Option<GmemOffset>>,
}

/// The tile geometry of one render pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TilingPlan {
    pub layout: GmemLayout,
    pub render_area: Rectangle,
    /// Top-left corner of the first tile.
    pub origin: (u32, u32),
    /// Size of every tile.
    pub tile: Extent,
    pub tile_count: Extent,
    /// Size of a pipe, in tiles.
    pub pipe: Extent,
    pub pipe_count: Extent,
    /// The attachments fit tile memory.
    pub possible: bool,
    /// The visibility of all tiles fits the pipes.
    pub binning_possible: bool,
    /// The largest number of pixels a tile may have.
    pub gmem_pixels: u32,
    pub tile_align_w: u32,
    offsets: Vec<Option<GmemOffset>>,
}

/// One tile of a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tile {
    /// Column in the tile grid.
    pub x: u32,
    /// Row in the tile grid.
    pub y: u32,
    /// The pixels covered, in framebuffer coordinates.
    pub rect: Rectangle,
    pub pipe: u32,
    /// Index of the tile within its pipe.
    pub slot: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderingMode {
    /// Render directly to the attachments in memory.
    Sysmem,
    /// Render each tile in tile memory, then store it.
    Gmem,
}

/// Why a pass is rendered to memory, most important first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SysmemReason {
    DebugForced,
    /// The attachments do not fit tile memory.
    NotPossible,
    MultipleLayers,
    EmptyRenderArea,
    Tessellation,
    /// A feedback loop or a barrier that can not be ordered per tile.
    GmemDisabled,
    Autotune,
}

/// What the recorded contents of a pass require of its rendering mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderConditions {
    pub layers: u32,
    pub has_tessellation: bool,
    pub disable_gmem: bool,
    pub xfb_used: bool,
    pub prim_query_used: bool,
    pub stats: PassStats,
    pub cost: PassCost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderDecision {
    pub mode: RenderingMode,
    pub binning: bool,
    pub reason: Option<SysmemReason>,
}

impl<'caps> Planner<'caps> {
    pub fn new(caps: &'caps Capabilities) -> Self {
        Planner { caps }
    }

    /// Plan the tiles of a pass.
    ///
    /// `attachments` has an entry for every attachment of the pass, `None` for those that do not
    /// live in tile memory. `samples` is used to size passes without any such attachments.
    pub fn plan(
        &self,
        attachments: &[Option<TileFootprint>],
        render_area: Rectangle,
        samples: u32,
        layout: GmemLayout,
    ) -> TilingPlan {
        let config = self.gmem_config(attachments, samples, layout);

        let mut plan = TilingPlan {
            layout,
            render_area,
            origin: (0, 0),
            tile: Extent::default(),
            tile_count: Extent {
                width: 1,
                height: 1,
            },
            pipe: Extent {
                width: 1,
                height: 1,
            },
            pipe_count: Extent {
                width: 1,
                height: 1,
            },
            possible: false,
            binning_possible: false,
            gmem_pixels: config.pixels,
            tile_align_w: config.tile_align_w,
            offsets: config.offsets,
        };

        plan.update_tile_layout(self.caps);
        if plan.possible {
            plan.update_pipe_layout(self.caps);
        }

        plan
    }

    /// Carve tile memory into per-attachment shares.
    fn gmem_config(
        &self,
        attachments: &[Option<TileFootprint>],
        samples: u32,
        layout: GmemLayout,
    ) -> GmemConfig {
        let caps = self.caps;
        let mut tile_align_w = caps.tile_align_w;
        let mut block_align_shift = BLOCK_ALIGN_SHIFT;
        let gmem_align = (1 << BLOCK_ALIGN_SHIFT) * caps.tile_align_w * caps.tile_align_h;

        let mut cpp_total = 0;
        for footprint in attachments.iter().flatten() {
            cpp_total += footprint.cpp + footprint.stencil_cpp;

            let cpp1 = footprint.cpp == 1 || footprint.stencil_cpp == 1;
            // Single byte attachments are read back as textures, whose pitch must be aligned to
            // 64 pixels.
            if cpp1 && tile_align_w % 64 != 0 {
                tile_align_w *= 2;
                block_align_shift = block_align_shift.saturating_sub(1);
            }
        }

        let mut offsets = vec![None; attachments.len()];

        if cpp_total == 0 {
            return GmemConfig {
                tile_align_w,
                pixels: NO_ATTACHMENT_PIXELS / samples.max(1),
                offsets,
            };
        }

        let budget = match layout {
            GmemLayout::Full => caps.gmem_bytes,
            GmemLayout::AvoidCcu => caps.ccu_offset_gmem,
        };

        let mut blocks = budget / gmem_align;
        let mut offset = 0;
        let mut pixels = u32::MAX;

        // Hand out a share of the remaining blocks, proportional to the remaining cost.
        let mut allocate = |cpp: u32, cpp_total: &mut u32| -> Option<u32> {
            if cpp == 0 {
                return Some(offset);
            }

            let align = (cpp >> block_align_shift).max(1);
            let share = u64::from(blocks) * u64::from(cpp) / u64::from(*cpp_total);
            let share = u32::try_from(share).ok()?;
            let nblocks = (share & !(align - 1)).max(align);

            if nblocks > blocks {
                return None;
            }

            let start = offset;
            blocks -= nblocks;
            *cpp_total -= cpp;
            offset += nblocks * gmem_align;
            pixels = pixels.min(nblocks * gmem_align / cpp);

            Some(start)
        };

        for (idx, footprint) in attachments.iter().enumerate() {
            let Some(footprint) = footprint else {
                continue;
            };

            let Some(main) = allocate(footprint.cpp, &mut cpp_total) else {
                return GmemConfig {
                    tile_align_w,
                    pixels: 0,
                    offsets: vec![None; attachments.len()],
                };
            };

            let stencil = if footprint.stencil_cpp > 0 {
                match allocate(footprint.stencil_cpp, &mut cpp_total) {
                    Some(start) => Some(start),
                    None => {
                        return GmemConfig {
                            tile_align_w,
                            pixels: 0,
                            offsets: vec![None; attachments.len()],
                        }
                    }
                }
            } else {
                None
            };

            offsets[idx] = Some(GmemOffset {
                offset: main,
                stencil,
            });
        }

        GmemConfig {
            tile_align_w,
            pixels,
            offsets,
        }
    }

    /// Whether storing an attachment of the given size needs the slow path.
    ///
    /// The fast path writes whole blocks of `gmem_align_w x gmem_align_h` pixels. Overshooting
    /// at the right and bottom edge of the image only writes into padding, except for the bottom
    /// edge of linear images which have none.
    pub fn store_is_unaligned(&self, render_area: Rectangle, image: Extent, linear: bool) -> bool {
        let (align_w, align_h) = (self.caps.gmem_align_w, self.caps.gmem_align_h);
        let Rectangle { x, y, max_x, max_y } = render_area;

        let need_y2_align = max_y != image.height || linear;

        x % align_w != 0
            || (max_x % align_w != 0 && max_x != image.width)
            || y % align_h != 0
            || (max_y % align_h != 0 && need_y2_align)
    }
}

impl TilingPlan {
    /// Find the largest tiles that fit the pixel budget.
    fn update_tile_layout(&mut self, caps: &Capabilities) {
        let align_w = self.tile_align_w;
        let align_h = caps.tile_align_h;
        let area = self.render_area;

        self.origin = (align_down(area.x, align_w), align_down(area.y, align_h));
        let width = area.x - self.origin.0 + area.width();
        let height = area.y - self.origin.1 + area.height();

        // An empty area still gets one aligned tile, it is never rendered to tile memory.
        let tile_width = |count: u32| align_npot(width.div_ceil(count), align_w).max(align_w);
        let tile_height = |count: u32| align_npot(height.div_ceil(count), align_h).max(align_h);

        self.tile_count = Extent {
            width: 1,
            height: 1,
        };

        if self.gmem_pixels == 0 {
            self.possible = false;
            return;
        }

        if caps.debug.contains(DebugFlags::FORCE_BIN) {
            self.tile_count = Extent {
                width: 2,
                height: 2,
            };
        }

        self.tile = Extent {
            width: tile_width(self.tile_count.width),
            height: tile_height(self.tile_count.height),
        };

        while self.tile.width > caps.max_tile_width {
            self.tile_count.width += 1;
            self.tile.width = tile_width(self.tile_count.width);
        }

        while self.tile.height > caps.max_tile_height {
            self.tile_count.height += 1;
            self.tile.height = tile_height(self.tile_count.height);
        }

        while u64::from(self.tile.width) * u64::from(self.tile.height)
            > u64::from(self.gmem_pixels)
        {
            if self.tile.width > align_w.max(self.tile.height) {
                self.tile_count.width += 1;
                self.tile.width = tile_width(self.tile_count.width);
            } else if self.tile.height > align_h {
                self.tile_count.height += 1;
                self.tile.height = tile_height(self.tile_count.height);
            } else {
                // Even the smallest aligned tile does not fit.
                self.possible = false;
                return;
            }
        }

        // Aligning up may leave trailing tiles that cover nothing.
        self.tile_count = Extent {
            width: width.div_ceil(self.tile.width).max(1),
            height: height.div_ceil(self.tile.height).max(1),
        };

        self.possible = true;
    }

    /// Group the tiles into as few pipes as the hardware has.
    fn update_pipe_layout(&mut self, caps: &Capabilities) {
        self.pipe = Extent {
            width: 1,
            height: 1,
        };
        self.pipe_count = self.tile_count;

        while self.pipe_count.width * self.pipe_count.height > caps.max_vsc_pipes {
            if self.pipe.width < self.pipe.height {
                self.pipe.width += 1;
                self.pipe_count.width = self.tile_count.width.div_ceil(self.pipe.width);
            } else {
                self.pipe.height += 1;
                self.pipe_count.height = self.tile_count.height.div_ceil(self.pipe.height);
            }
        }

        self.binning_possible = self.pipe_count.width * self.pipe_count.height
            <= caps.max_vsc_pipes
            && self.pipe.width * self.pipe.height <= caps.max_pipe_slots;
    }

    pub fn tile_total(&self) -> u32 {
        self.tile_count.width * self.tile_count.height
    }

    pub fn pipe_total(&self) -> u32 {
        self.pipe_count.width * self.pipe_count.height
    }

    /// The tile memory offset of an attachment, if it lives there.
    pub fn gmem_offset(&self, attachment: usize) -> Option<GmemOffset> {
        self.offsets.get(attachment).copied().flatten()
    }

    /// The rectangle of the tile at a grid position.
    pub fn tile_rect(&self, x: u32, y: u32) -> Rectangle {
        let min_x = self.origin.0 + x * self.tile.width;
        let min_y = self.origin.1 + y * self.tile.height;

        Rectangle {
            x: min_x,
            y: min_y,
            max_x: min_x + self.tile.width,
            max_y: min_y + self.tile.height,
        }
    }

    /// The rectangle covered by every pipe, in units of tiles.
    pub fn pipes(&self) -> Vec<Rectangle> {
        let mut pipes = Vec::with_capacity(self.pipe_total() as usize);

        for py in 0..self.pipe_count.height {
            for px in 0..self.pipe_count.width {
                pipes.push(self.pipe_rect(px, py));
            }
        }

        pipes
    }

    fn pipe_rect(&self, px: u32, py: u32) -> Rectangle {
        let x = px * self.pipe.width;
        let y = py * self.pipe.height;

        Rectangle {
            x,
            y,
            max_x: (x + self.pipe.width).min(self.tile_count.width),
            max_y: (y + self.pipe.height).min(self.tile_count.height),
        }
    }

    /// All tiles in row-major order.
    pub fn tiles(&self) -> Vec<Tile> {
        let mut tiles = self.serpentine();
        tiles.sort_by_key(|tile| (tile.y, tile.x));
        tiles
    }

    /// All tiles in the order they are rendered.
    ///
    /// Pipes are visited row by row, alternating direction with each row, and the tiles within a
    /// pipe likewise. Consecutive pipes are thus always neighbours, which keeps texture caches
    /// warm across pipe boundaries.
    pub fn serpentine(&self) -> Vec<Tile> {
        let mut tiles = Vec::with_capacity(self.tile_total() as usize);

        for py in 0..self.pipe_count.height {
            let pipe_row = py * self.pipe_count.width;

            for pipe_row_i in 0..self.pipe_count.width {
                let px = if py & 1 == 1 {
                    self.pipe_count.width - 1 - pipe_row_i
                } else {
                    pipe_row_i
                };

                let pipe = pipe_row + px;
                let bounds = self.pipe_rect(px, py);
                let stride = bounds.width();
                let mut slot_row = 0;

                for ty in bounds.y..bounds.max_y {
                    for tile_row_i in 0..stride {
                        let tx = if ty & 1 == 1 {
                            stride - 1 - tile_row_i
                        } else {
                            tile_row_i
                        };

                        let x = bounds.x + tx;
                        tiles.push(Tile {
                            x,
                            y: ty,
                            rect: self.tile_rect(x, ty),
                            pipe,
                            slot: slot_row + tx,
                        });
                    }

                    slot_row += stride;
                }
            }
        }

        tiles
    }

    /// Choose the rendering mode, and whether to bin, for the recorded contents of the pass.
    pub fn decide(
        &self,
        caps: &Capabilities,
        cond: &RenderConditions,
        autotune: &Autotune,
    ) -> RenderDecision {
        match self.sysmem_reason(caps, cond, autotune) {
            Some(reason) => RenderDecision {
                mode: RenderingMode::Sysmem,
                binning: false,
                reason: Some(reason),
            },
            None => RenderDecision {
                mode: RenderingMode::Gmem,
                binning: self.use_binning(caps, cond),
                reason: None,
            },
        }
    }

    fn sysmem_reason(
        &self,
        caps: &Capabilities,
        cond: &RenderConditions,
        autotune: &Autotune,
    ) -> Option<SysmemReason> {
        if caps.debug.contains(DebugFlags::SYSMEM) {
            return Some(SysmemReason::DebugForced);
        }

        if !self.possible {
            return Some(SysmemReason::NotPossible);
        }

        if cond.layers > 1 {
            return Some(SysmemReason::MultipleLayers);
        }

        if self.render_area.width() == 0 || self.render_area.height() == 0 {
            return Some(SysmemReason::EmptyRenderArea);
        }

        if cond.has_tessellation {
            return Some(SysmemReason::Tessellation);
        }

        if cond.disable_gmem {
            return Some(SysmemReason::GmemDisabled);
        }

        if caps.debug.contains(DebugFlags::GMEM) {
            return None;
        }

        if autotune.prefer_sysmem(caps, self.render_area, &cond.cost, &cond.stats) {
            return Some(SysmemReason::Autotune);
        }

        None
    }

    fn use_binning(&self, caps: &Capabilities, cond: &RenderConditions) -> bool {
        // A binned replay would count primitives of the binning pass as well.
        let counts_primitives = cond.xfb_used || cond.prim_query_used;

        if !self.binning_possible || counts_primitives || caps.debug.contains(DebugFlags::NO_BIN)
        {
            return false;
        }

        caps.debug.contains(DebugFlags::FORCE_BIN) || self.tile_total() > 1
    }
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Extent { width, height }
    }
}

impl RenderDecision {
    pub fn is_gmem(&self) -> bool {
        self.mode == RenderingMode::Gmem
    }
}
