//! Describes the tiler we produce command streams for.
//!
//! Every decision that differs between hardware generations is expressed as a field here. The
//! policy code never asks which chip it runs on, only what the chip can do.
use bitflags::bitflags;

/// The capabilities of one device.
///
/// The defaults resemble a mid-range tiler with 1 MiB of tile memory and no hardware tracking of
/// the hierarchical-depth direction.
#[derive(Clone, Debug)]
pub struct Capabilities {
    /// Total bytes of on-chip tile memory.
    pub gmem_bytes: u32,
    /// Bytes of tile memory usable when the tail is reserved for the CCU.
    ///
    /// Resolves and unaligned stores that go through the 3D path use the color cache in its tile
    /// memory configuration, which lives at this offset.
    pub ccu_offset_gmem: u32,
    /// Horizontal alignment of a tile, in pixels.
    pub tile_align_w: u32,
    /// Vertical alignment of a tile, in pixels.
    pub tile_align_h: u32,
    /// Horizontal alignment of regions that may be stored by the fast blit path.
    pub gmem_align_w: u32,
    /// Vertical alignment of regions that may be stored by the fast blit path.
    pub gmem_align_h: u32,
    pub max_tile_width: u32,
    pub max_tile_height: u32,
    /// Number of visibility stream pipes.
    pub max_vsc_pipes: u32,
    /// Number of tiles a single pipe can hold visibility data for.
    pub max_pipe_slots: u32,
    /// The GPU records the depth direction in the LRZ buffer itself and disables LRZ on a
    /// mismatch.
    pub has_lrz_dir_tracking: bool,
    /// The LRZ buffer has fast-clear metadata.
    pub has_lrz_fast_clear: bool,
    /// An upper bound on the instructions of any single stream.
    ///
    /// Exceeding it is reported exactly like a failed allocation.
    pub stream_limit: Option<usize>,
    pub debug: DebugFlags,
}

bitflags! {
    /// Debug switches overriding the policy decisions.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Always render directly to system memory.
        const SYSMEM = 1 << 0;
        /// Render to tile memory whenever it is possible at all.
        const GMEM = 1 << 1;
        /// Never run the binning pre-pass.
        const NO_BIN = 1 << 2;
        /// Run the binning pre-pass whenever it is possible.
        const FORCE_BIN = 1 << 3;
        /// Flush and invalidate everything before every command.
        const FLUSH_ALL = 1 << 4;
        /// Never trust the hierarchical depth buffer.
        const NO_LRZ = 1 << 5;
    }
}

bitflags! {
    /// The aspects of a format or a clear.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Aspects: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Facts about a pixel format, provided by the format tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FormatInfo {
    /// Bytes per pixel of a single sample, for depth/stencil of the depth plane.
    pub block_size: u32,
    pub aspects: Aspects,
    /// The stencil aspect lives in its own one byte plane.
    pub separate_stencil: bool,
    /// A resolve from this format can be performed by the blit engine.
    pub blit_resolvable: bool,
}

impl Capabilities {
    /// Horizontal and vertical alignment of a tile.
    pub fn tile_align(&self) -> (u32, u32) {
        (self.tile_align_w, self.tile_align_h)
    }

    /// Capabilities with the given debug flags.
    #[must_use]
    pub fn with_debug(self, debug: DebugFlags) -> Self {
        Capabilities { debug, ..self }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            gmem_bytes: 0x10_0000,
            ccu_offset_gmem: 0xf_8000,
            tile_align_w: 32,
            tile_align_h: 16,
            gmem_align_w: 16,
            gmem_align_h: 4,
            max_tile_width: 1024,
            max_tile_height: 1008,
            max_vsc_pipes: 32,
            max_pipe_slots: 32,
            has_lrz_dir_tracking: false,
            has_lrz_fast_clear: true,
            stream_limit: None,
            debug: DebugFlags::empty(),
        }
    }
}

impl DebugFlags {
    /// The name of the environment variable read by [`DebugFlags::from_env`].
    pub const ENV: &'static str = "TBDR_DEBUG";

    /// Parse a comma separated list of flag names, such as `sysmem,nobin`.
    ///
    /// Unknown names are ignored with a warning.
    pub fn parse(list: &str) -> Self {
        let mut flags = DebugFlags::empty();

        for name in list.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            flags |= match name {
                "sysmem" => DebugFlags::SYSMEM,
                "gmem" => DebugFlags::GMEM,
                "nobin" => DebugFlags::NO_BIN,
                "forcebin" => DebugFlags::FORCE_BIN,
                "flushall" => DebugFlags::FLUSH_ALL,
                "nolrz" => DebugFlags::NO_LRZ,
                other => {
                    log::warn!("Ignoring unknown debug flag {:?}", other);
                    DebugFlags::empty()
                }
            };
        }

        flags
    }

    /// Read the flags from `TBDR_DEBUG`, empty if it is unset.
    pub fn from_env() -> Self {
        match std::env::var(Self::ENV) {
            Ok(list) => Self::parse(&list),
            Err(_) => DebugFlags::empty(),
        }
    }
}

impl FormatInfo {
    /// A color format with the given bytes per pixel.
    pub const fn color(block_size: u32) -> Self {
        FormatInfo {
            block_size,
            aspects: Aspects::COLOR,
            separate_stencil: false,
            blit_resolvable: true,
        }
    }

    /// A depth-only format.
    pub const fn depth(block_size: u32) -> Self {
        FormatInfo {
            block_size,
            aspects: Aspects::DEPTH,
            separate_stencil: false,
            blit_resolvable: true,
        }
    }

    /// A packed depth/stencil format, such as 24-bit depth with 8-bit stencil.
    pub const fn depth_stencil(block_size: u32) -> Self {
        FormatInfo {
            block_size,
            aspects: Aspects::DEPTH.union(Aspects::STENCIL),
            separate_stencil: false,
            blit_resolvable: true,
        }
    }

    /// A depth format with a separate stencil plane, such as 32-bit float depth with 8-bit
    /// stencil.
    pub const fn depth_separate_stencil(block_size: u32) -> Self {
        FormatInfo {
            block_size,
            aspects: Aspects::DEPTH.union(Aspects::STENCIL),
            separate_stencil: true,
            blit_resolvable: true,
        }
    }

    /// Mark the format as not resolvable by the blit engine.
    #[must_use]
    pub const fn without_blit_resolve(self) -> Self {
        FormatInfo {
            blit_resolvable: false,
            ..self
        }
    }

    pub fn has_stencil(&self) -> bool {
        self.aspects.contains(Aspects::STENCIL)
    }

    pub fn is_color(&self) -> bool {
        self.aspects.contains(Aspects::COLOR)
    }
}
