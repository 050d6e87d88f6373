use std::sync::Arc;

use crate::autotune::PassStats;
use crate::cache::CcuMode;
use crate::command::Rectangle;
use crate::device::Aspects;
use crate::lrz::LrzDraw;
use crate::pass::ClearValue;
use crate::patch::PatchPoint;
use crate::pool::ResourceKey;

pub(crate) mod stream;

/// A finished, self-contained command recording.
///
/// The instructions are split into streams. The first stream is the entry point, all others are
/// only reached through [`Low::Call`]. The recorded commands of a render pass, for example, live
/// in one stream that is called once per tile.
#[derive(Clone, Debug)]
pub struct Recording {
    /// All streams, the entry point first.
    pub(crate) streams: Vec<Arc<[Low]>>,
    /// Memory that instructions read from and per-tile writes patch.
    pub(crate) binary_data: Vec<u8>,
    /// Deferred per-tile patches of a recording that continues a render pass.
    pub(crate) patches: Vec<PatchPoint>,
    /// What the recording did, as far as the context executing it needs to know.
    pub(crate) summary: Summary,
}

/// Facts about a finished recording that survive into the context executing it.
#[derive(Clone, Debug, Default)]
pub(crate) struct Summary {
    /// The hierarchical depth buffer was invalidated by the recorded draws.
    pub(crate) lrz_invalidated: bool,
    /// Draw statistics for the autotuner.
    pub(crate) stats: PassStats,
    pub(crate) has_tessellation: bool,
    pub(crate) disable_gmem: bool,
    pub(crate) xfb_used: bool,
    /// The cache configuration at the end of the recording, if known.
    pub(crate) ccu: Option<CcuMode>,
}

/// Identifies one stream of a recording, by an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamRef(pub(crate) usize);

/// The streams a context records into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// The primary stream of commands.
    Main,
    /// Commands recorded within a render pass, replayed per tile.
    Draw,
    /// Commands to run once after all tiles of a render pass.
    Epilogue,
    /// Loads of attachments into tile memory, for one subpass.
    TileLoad,
    /// Stores of tile memory back to the attachments.
    TileStore,
}

/// The deferred failure status of a recording.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("ran out of memory for the {0:?} command stream")]
    OutOfMemory(StreamKind),
    #[error("internal recording error at line {0}")]
    Internal(u32),
}

/// Low level instruction.
///
/// Each corresponds to one command packet or hardware event. The policy of this crate decides
/// which instructions are emitted and in which order; their binary encoding is up to the
/// consumer of the recording.
#[derive(Clone, Debug, PartialEq)]
pub enum Low {
    // Cache maintenance and ordering.
    Event(Event),
    /// Wait until memory writes of the command processor landed.
    WaitMemWrites,
    /// Drain the whole pipeline.
    WaitForIdle,
    /// Stop the prefetcher until the command processor caught up.
    WaitForMe,
    /// Program the configuration of the color and depth caches.
    SetCcuMode(CcuMode),

    // Render mode and tile state.
    Marker(Marker),
    /// The window in which rasterization happens, in framebuffer coordinates.
    WindowScissor(Rectangle),
    /// Offset subtracted from framebuffer coordinates, such that the tile starts at zero.
    WindowOffset {
        x: u32,
        y: u32,
    },
    BinSize {
        width: u32,
        height: u32,
        binning: bool,
    },
    /// Ignore the visibility stream and draw everything.
    VisibilityOverride(bool),
    /// Configure the pipes of the visibility stream, as rectangles in units of tiles.
    VscPipes(Vec<Rectangle>),
    /// Point the draws at the visibility stream of a tile.
    BinData {
        pipe: u32,
        slot: u32,
    },
    /// Mark all tiles as having geometry, when the binning pass does not run.
    MarkAllVisible {
        pipes: u32,
    },
    /// Check whether the visibility streams overflowed.
    CheckVscOverflow,
    /// Set the predicate to whether the tile had any geometry.
    TestVisibility {
        pipe: u32,
        slot: u32,
    },
    /// Execute the instructions up to the matching `EndCondExec` only if the predicate holds.
    CondExec(Predicate),
    EndCondExec,
    /// A write of the command processor into recording memory.
    MemWrite {
        offset: usize,
        data: Vec<u8>,
    },
    /// Execute another stream, then continue here.
    Call(StreamRef),

    // Attachment traffic.
    /// Load an attachment into tile memory.
    Load {
        attachment: usize,
        aspects: Aspects,
        gmem_offset: u32,
    },
    /// Store tile memory of `src` into the image of `dst`.
    ///
    /// Both are the same attachment, unless this resolves.
    Store {
        src: usize,
        dst: usize,
        aspects: Aspects,
        gmem_offset: u32,
        path: StorePath,
    },
    GmemClear {
        attachment: usize,
        aspects: Aspects,
        gmem_offset: u32,
        value: ClearValue,
    },
    SysmemClear {
        attachment: usize,
        aspects: Aspects,
        rect: Rectangle,
        value: ClearValue,
    },
    SysmemResolve {
        src: usize,
        dst: usize,
        rect: Rectangle,
    },
    /// A clear drawn as geometry, within the window of the current tile or pass.
    ClearRect {
        attachment: usize,
        aspects: Aspects,
        rect: Rectangle,
        value: ClearValue,
    },

    // Work.
    Blit(BlitOp),
    Draw(DrawOp),
    Dispatch {
        groups: [u32; 3],
        indirect: bool,
    },
    /// Load the scissor of every view from recording memory.
    LoadScissor {
        offset: usize,
        views: u32,
    },
    Lrz(LrzCommand),
    Query {
        index: u32,
        begin: bool,
    },
    StreamOut(bool),
}

/// A hardware event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    CcuFlushColor,
    CcuFlushDepth,
    CcuInvalidateColor,
    CcuInvalidateDepth,
    CacheFlush,
    CacheInvalidate,
    BindlessInvalidate,
    /// Write back the cache of the blit engine.
    BlitCacheFlush,
    LrzFlush,
}

/// Markers of the render mode, consumed by conditional execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Rendering directly to system memory.
    Bypass,
    Binning,
    Gmem,
    /// The draws of a binned tile are done.
    EndVisibility,
    /// Tile memory is stored.
    Resolve,
}

/// Conditions of conditional execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// Rendering directly to system memory.
    Sysmem,
    /// Rendering a tile.
    Gmem,
    /// The last `TestVisibility` found geometry.
    Visible,
}

/// How tile memory is written back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorePath {
    /// The blit engine, for regions aligned to the store granularity.
    Fast,
    /// Draws through the color cache, for everything else.
    Unaligned,
}

/// Fixed-function operations implemented with prebuilt draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlitKind {
    CopyBuffer,
    CopyImage,
    CopyBufferToImage,
    CopyImageToBuffer,
    BlitImage,
    ResolveImage,
    ClearColorImage,
    ClearDepthStencilImage,
    FillBuffer,
    UpdateBuffer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlitOp {
    pub kind: BlitKind,
    pub src: Option<ResourceKey>,
    pub dst: ResourceKey,
    pub region: Rectangle,
    pub clear: Option<ClearValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DrawOp {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub indirect: bool,
}

/// Commands of the hierarchical depth buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrzCommand {
    /// Attach the buffer of a depth attachment, or detach it for the pass.
    Buffer(Option<usize>),
    Clear { fast: bool, depth: f32 },
    /// Record in the buffer that its contents can not be trusted.
    MarkInvalid,
    /// Per-draw control.
    Control(LrzDraw),
}

impl Recording {
    /// The instructions of the entry stream.
    pub fn entry(&self) -> &[Low] {
        self.streams.first().map_or(&[], |stream| &stream[..])
    }

    pub fn stream(&self, StreamRef(idx): StreamRef) -> Option<&[Low]> {
        self.streams.get(idx).map(|stream| &stream[..])
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn binary_data(&self) -> &[u8] {
        &self.binary_data
    }

    /// Whether the recorded draws invalidated the hierarchical depth buffer.
    pub fn lrz_invalidated(&self) -> bool {
        self.summary.lrz_invalidated
    }

    /// Number of draws recorded, including those of executed recordings.
    pub fn draw_count(&self) -> u32 {
        self.summary.stats.draw_count
    }
}

/// Moves references from one base to another, as when streams or memory are appended to a
/// different recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Relocation {
    pub(crate) from: usize,
    pub(crate) to: usize,
}

impl Relocation {
    /// Move references starting at zero to start at `base`.
    pub(crate) fn append(base: usize) -> Self {
        Relocation { from: 0, to: base }
    }

    pub(crate) fn apply(self, value: usize) -> usize {
        value - self.from + self.to
    }
}

impl Low {
    /// The same instruction with stream and memory references relocated.
    #[must_use]
    pub(crate) fn relocate(&self, streams: Relocation, data: Relocation) -> Low {
        match self {
            Low::Call(StreamRef(idx)) => Low::Call(StreamRef(streams.apply(*idx))),
            Low::MemWrite { offset, data: bytes } => Low::MemWrite {
                offset: data.apply(*offset),
                data: bytes.clone(),
            },
            Low::LoadScissor { offset, views } => Low::LoadScissor {
                offset: data.apply(*offset),
                views: *views,
            },
            other => other.clone(),
        }
    }
}
