//! Record commands for a tiler.
//!
//! A [`CommandBuffer`] collects commands much like an encoder: it keeps a model of the device
//! state the commands will execute in (cache contents, cache configuration, the render pass and
//! the hierarchical depth buffer) and emits the low level instructions that keep that state
//! consistent alongside every command.
use std::sync::Arc;

use crate::autotune::Autotune;
use crate::cache::access::{
    self, dispatch_footprint, footprint, AccessFlags, Destination, Footprint, PipelineStages,
};
use crate::cache::{AccessMask, CacheState, CcuMode, FlushFlags};
use crate::device::{Aspects, Capabilities, DebugFlags};
use crate::lrz::LrzState;
use crate::pass::ClearValue;
use crate::patch::PatchPoint;
use crate::pool::{LayoutSource, ResourceKey, ResourceLayout};
use crate::program::stream::CommandStream;
use crate::program::{
    BlitKind, BlitOp, Low, RecordError, Recording, Relocation, StreamKind, StreamRef, Summary,
};
use crate::tiling::RenderDecision;
use crate::util::ExtendOne;

mod render;

pub use render::{Inheritance, RenderPassBegin, SuspendedPass};

/// Records commands into a [`Recording`].
///
/// Failures to allocate instruction storage do not interrupt recording. They are remembered and
/// reported once, by [`CommandBuffer::finish`].
pub struct CommandBuffer {
    caps: Capabilities,
    autotune: Autotune,
    /// Commands executed once, in order.
    main: CommandStream,
    /// The commands of the current render pass, replayed per tile.
    draw: CommandStream,
    /// Commands of the current render pass to run once after all tiles.
    epilogue: CommandStream,
    /// Finished streams other than `main`, `StreamRef(idx + 1)` refers to `streams[idx]`.
    streams: Vec<Arc<[Low]>>,
    /// Recording memory.
    binary_data: Vec<u8>,
    /// Cache bookkeeping of commands outside of render passes.
    cache: CacheState,
    /// Cache bookkeeping of the commands within the current render pass.
    renderpass_cache: CacheState,
    /// The configuration the caches are known to be in.
    ccu: Option<CcuMode>,
    lrz: LrzState,
    pass: Option<render::PassState>,
    /// Set for secondaries that continue a render pass of the primary executing them.
    continuation: Option<render::Continuation>,
    phase: PassPhase,
    /// The rendering mode chosen for the last finished pass.
    decision: Option<RenderDecision>,
    /// Transform feedback was started outside of a render pass.
    xfb_active: bool,
    /// A primitive counting query was started outside of a render pass.
    prim_query_active: bool,
    /// Facts accumulated from executed secondaries and finished passes.
    summary: Summary,
    /// The first failure outside of the streams themselves.
    error: Option<RecordError>,
}

/// Where a recording is within a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassPhase {
    NotStarted,
    /// Commands of a pass are being recorded, the rendering mode is not fixed yet.
    Planning,
    SysmemActive,
    GmemActive,
    Ended,
}

/// A dependency between the accesses before and after it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MemoryBarrier {
    pub src_access: AccessFlags,
    pub src_stages: PipelineStages,
    pub dst_access: AccessFlags,
    pub dst_stages: PipelineStages,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    #[default]
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub test: bool,
    /// The stencil operations have side effects before the depth test decides visibility.
    pub writes_before_depth: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareOp,
    pub stencil: StencilState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enable: bool,
    /// Blending or logic operations read the current color of the attachment.
    pub reads_dest: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Draw {
    pub vertex_count: u32,
    pub instance_count: u32,
    /// The arguments are read from memory by the command processor.
    pub indirect: bool,
    /// The bound pipeline tessellates.
    pub tessellation: bool,
}

/// A clear of part of an attachment, within a render pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearAttachment {
    pub attachment: usize,
    pub aspects: Aspects,
    pub rect: Rectangle,
    pub value: ClearValue,
}

/// A rectangle in `u32` space.
/// It's describe by minimum and maximum coordinates, inclusive and exclusive respectively. Any
/// rectangle where the order is not correct is interpreted as empty. This has the advantage of
/// simplifying certain operations that would otherwise need to check for correctness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl CommandBuffer {
    pub fn new(caps: Capabilities) -> Self {
        let limit = caps.stream_limit;

        CommandBuffer {
            autotune: Autotune::default(),
            main: CommandStream::new(StreamKind::Main, limit),
            draw: CommandStream::new(StreamKind::Draw, limit),
            epilogue: CommandStream::new(StreamKind::Epilogue, limit),
            streams: vec![],
            binary_data: vec![],
            cache: CacheState::new(),
            renderpass_cache: CacheState::new(),
            ccu: None,
            lrz: LrzState::new(&caps),
            pass: None,
            continuation: None,
            phase: PassPhase::NotStarted,
            decision: None,
            xfb_active: false,
            prim_query_active: false,
            summary: Summary::default(),
            error: None,
            caps,
        }
    }

    /// Use a different autotuner for rendering mode decisions.
    #[must_use]
    pub fn with_autotune(self, autotune: Autotune) -> Self {
        CommandBuffer { autotune, ..self }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// The bookkeeping of commands outside of render passes.
    pub fn cache(&self) -> &CacheState {
        &self.cache
    }

    /// The bookkeeping of commands within the current render pass.
    pub fn renderpass_cache(&self) -> &CacheState {
        &self.renderpass_cache
    }

    pub fn ccu_mode(&self) -> Option<CcuMode> {
        self.ccu
    }

    pub fn lrz(&self) -> &LrzState {
        &self.lrz
    }

    pub fn phase(&self) -> PassPhase {
        self.phase
    }

    /// How the last finished render pass was rendered.
    pub fn last_decision(&self) -> Option<RenderDecision> {
        self.decision
    }

    /// Whether commands are currently recorded into a render pass.
    pub fn in_pass(&self) -> bool {
        self.pass.is_some() || self.continuation.is_some()
    }

    /// Copy between buffers and images, choosing the copy by the kinds of both.
    pub fn record_copy(
        &mut self,
        pool: &impl LayoutSource,
        src: ResourceKey,
        dst: ResourceKey,
        region: Rectangle,
    ) {
        let (Some(src_layout), Some(dst_layout)) = (pool.layout_of(src), pool.layout_of(dst))
        else {
            return self.fail(RecordError::Internal(line!()));
        };

        let kind = match (src_layout.is_image(), dst_layout.is_image()) {
            (false, false) => BlitKind::CopyBuffer,
            (false, true) => BlitKind::CopyBufferToImage,
            (true, false) => BlitKind::CopyImageToBuffer,
            (true, true) => BlitKind::CopyImage,
        };

        let target = destination(dst_layout);
        let coherent = !dst_layout.mutable_format;
        self.record_blit_op(
            BlitOp {
                kind,
                src: Some(src),
                dst,
                region,
                clear: None,
            },
            target,
            coherent,
        );
    }

    /// Scale one image into another, or resolve a multisampled image.
    pub fn record_blit(
        &mut self,
        pool: &impl LayoutSource,
        src: ResourceKey,
        dst: ResourceKey,
        region: Rectangle,
        resolve: bool,
    ) {
        let Some(dst_layout) = pool.layout_of(dst) else {
            return self.fail(RecordError::Internal(line!()));
        };

        let kind = if resolve {
            BlitKind::ResolveImage
        } else {
            BlitKind::BlitImage
        };

        let target = destination(dst_layout);
        let coherent = !dst_layout.mutable_format;
        self.record_blit_op(
            BlitOp {
                kind,
                src: Some(src),
                dst,
                region,
                clear: None,
            },
            target,
            coherent,
        );
    }

    /// Clear part of an image outside of a render pass.
    pub fn record_clear(
        &mut self,
        pool: &impl LayoutSource,
        dst: ResourceKey,
        region: Rectangle,
        value: ClearValue,
    ) {
        let Some(dst_layout) = pool.layout_of(dst) else {
            return self.fail(RecordError::Internal(line!()));
        };

        let kind = match value {
            ClearValue::Color(_) => BlitKind::ClearColorImage,
            ClearValue::DepthStencil { .. } => BlitKind::ClearDepthStencilImage,
        };

        let target = destination(dst_layout);
        let coherent = !dst_layout.mutable_format;
        self.record_blit_op(
            BlitOp {
                kind,
                src: None,
                dst,
                region,
                clear: Some(value),
            },
            target,
            coherent,
        );
    }

    /// Fill a range of a buffer with a repeated word.
    pub fn record_fill(&mut self, dst: ResourceKey, offset: u32, size: u32) {
        self.record_blit_op(
            BlitOp {
                kind: BlitKind::FillBuffer,
                src: None,
                dst,
                region: buffer_range(offset, size),
                clear: None,
            },
            Destination::Buffer,
            true,
        );
    }

    /// Write a small range of a buffer from recording memory.
    pub fn record_update(&mut self, dst: ResourceKey, offset: u32, size: u32) {
        self.record_blit_op(
            BlitOp {
                kind: BlitKind::UpdateBuffer,
                src: None,
                dst,
                region: buffer_range(offset, size),
                clear: None,
            },
            Destination::Buffer,
            true,
        );
    }

    pub fn record_dispatch(&mut self, groups: [u32; 3], indirect: bool) {
        if self.in_pass() {
            return self.fail(RecordError::Internal(line!()));
        }

        let Footprint { reads, writes } = dispatch_footprint(indirect);
        self.cache.record_access(AccessMask::empty(), reads | writes);

        if indirect {
            // The command processor reads the arguments.
            self.cache.pull_pending(FlushFlags::WAIT_FOR_ME);
        }

        flush_into(&mut self.cache, &self.caps, &mut self.main);
        self.main.emit(Low::Dispatch { groups, indirect });
        self.cache.record_access(writes, AccessMask::empty());
    }

    /// Record a fixed-function operation.
    ///
    /// Writes to images with a mutable format may be performed with the layout of any view.
    fn record_blit_op(&mut self, op: BlitOp, dst: Destination, coherent: bool) {
        if self.in_pass() {
            return self.fail(RecordError::Internal(line!()));
        }

        let mut touched = footprint(op.kind, dst);
        if !coherent {
            touched = touched.incoherent();
        }

        let Footprint { reads, writes } = touched;
        let ccu = AccessMask::COLOR_CCU_WRITE
            | AccessMask::COLOR_CCU_INCOHERENT_WRITE
            | AccessMask::DEPTH_CCU_WRITE
            | AccessMask::DEPTH_CCU_INCOHERENT_WRITE;

        // The fixed-function draws render through the caches in their memory configuration.
        let switched = writes.intersects(ccu)
            && self.cache.prepare_ccu_switch(self.ccu, CcuMode::Sysmem);

        self.cache.record_access(AccessMask::empty(), reads | writes);
        flush_into(&mut self.cache, &self.caps, &mut self.main);

        if switched {
            log::trace!("Switching caches to system memory mode for {:?}", op.kind);
            self.main.emit(Low::SetCcuMode(CcuMode::Sysmem));
            self.ccu = Some(CcuMode::Sysmem);
        }

        self.main.emit(Low::Blit(op));
        self.cache.record_access(writes, AccessMask::empty());
    }

    /// Record a memory dependency.
    ///
    /// Within a render pass this must only involve stages that execute per pixel, other
    /// dependencies can not be ordered per tile and force the pass to render to memory.
    pub fn record_barrier(&mut self, barrier: MemoryBarrier) {
        self.barrier(barrier, AccessMask::empty(), false);
    }

    /// Record a dependency that also transitions an image.
    ///
    /// When the previous contents are discarded, the memory may still have dirty lines of
    /// another resource in the color or depth cache. Those must be written back before they
    /// could overwrite the image later.
    ///
    /// Transfers write each layer of an image with the same address and format, so their
    /// writes are coherent with each other. Not so for images viewed with formats of different
    /// layout.
    pub fn record_image_barrier(
        &mut self,
        pool: &impl LayoutSource,
        image: ResourceKey,
        barrier: MemoryBarrier,
        old_layout_undefined: bool,
    ) {
        let Some(layout) = pool.layout_of(image) else {
            return self.fail(RecordError::Internal(line!()));
        };

        let mut garbage = AccessMask::empty();
        if old_layout_undefined {
            garbage = if destination(layout) == Destination::DepthImage {
                AccessMask::DEPTH_CCU_INCOHERENT_WRITE
            } else {
                AccessMask::COLOR_CCU_INCOHERENT_WRITE
            };
        }

        let image_only = !layout.mutable_format;
        if !image_only {
            log::debug!("Barrier on an image with mutable format, treating writes as incoherent");
        }

        self.barrier(barrier, garbage, image_only);
    }

    /// Memory is reinterpreted with a different layout, such as through an image view of a
    /// format with another block layout. Nothing cached can be trusted afterwards.
    pub fn record_memory_alias_barrier(&mut self) {
        let all = FlushFlags::ALL_FLUSH | FlushFlags::ALL_INVALIDATE | FlushFlags::WAIT_FOR_IDLE;

        if self.in_pass() {
            self.renderpass_cache.require(all);
        } else {
            self.cache.require(all);
        }
    }

    fn barrier(&mut self, barrier: MemoryBarrier, extra_src: AccessMask, image_only: bool) {
        let in_pass = self.in_pass();
        // Attachments of a tiled pass were already written back by the tile stores.
        let gmem = !in_pass && self.ccu == Some(CcuMode::Gmem);

        if in_pass
            && (access::leaves_framebuffer_space(access::sanitize_src(barrier.src_stages))
                || access::leaves_framebuffer_space(access::sanitize_dst(barrier.dst_stages)))
        {
            log::debug!("Barrier outside of framebuffer space, rendering the pass to memory");
            if let Some(state) = self.draw_state_mut() {
                state.disable_gmem = true;
            }
        }

        let cache = if in_pass {
            &mut self.renderpass_cache
        } else {
            &mut self.cache
        };

        apply_barrier(cache, &barrier, extra_src, AccessMask::empty(), image_only, gmem);
    }

    /// Execute secondary recordings.
    ///
    /// Their effect on the caches is opaque to us, so afterwards any cache may hold anything.
    pub fn execute_commands(&mut self, recordings: &[Recording]) {
        if self.pass.is_some() {
            return self.execute_in_pass(recordings);
        }

        self.cache.flush_all_pending();
        flush_into(&mut self.cache, &self.caps, &mut self.main);

        for recording in recordings {
            let entry = self.import(recording);
            self.main.emit(Low::Call(entry));
            self.summary.stats += recording.summary.stats;

            if recording.summary.ccu.is_some() {
                self.ccu = recording.summary.ccu;
            }
        }

        self.cache.reset();
    }

    /// Append the streams and memory of a recording, returning its entry point.
    fn import(&mut self, recording: &Recording) -> StreamRef {
        let streams = Relocation::append(self.streams.len() + 1);
        let data = Relocation::append(self.binary_data.len());

        for stream in &recording.streams {
            let relocated: Vec<Low> = stream
                .iter()
                .map(|low| low.relocate(streams, data))
                .collect();
            self.streams.push(relocated.into());
        }

        if self.binary_data.try_reserve(recording.binary_data.len()).is_err() {
            self.fail(RecordError::OutOfMemory(StreamKind::Main));
        } else {
            self.binary_data.extend_from_slice(&recording.binary_data);
        }

        StreamRef(streams.apply(0))
    }

    /// Finish recording.
    ///
    /// Any failure during recording is reported here, the first one encountered.
    pub fn finish(mut self) -> Result<Recording, RecordError> {
        if self.pass.is_some() {
            return Err(RecordError::Internal(line!()));
        }

        if self.continuation.is_some() {
            self.renderpass_cache.flush_all_pending();
            flush_into(&mut self.renderpass_cache, &self.caps, &mut self.main);
        } else {
            // We can not know whether the next recording reads our results through the
            // caches, so everything goes back to memory.
            self.cache.flush_all_pending();
            self.cache
                .require(FlushFlags::CCU_FLUSH_COLOR | FlushFlags::CCU_FLUSH_DEPTH);
            flush_into(&mut self.cache, &self.caps, &mut self.main);
        }

        if let Some(err) = self.error.take() {
            return Err(err);
        }

        let entry = self.main.take()?;
        let mut streams = Vec::with_capacity(self.streams.len() + 1);
        streams.push(entry);
        streams.append(&mut self.streams);

        let mut summary = self.summary;
        summary.ccu = self.ccu;

        let mut patches = vec![];
        if let Some(continuation) = self.continuation.take() {
            let state = continuation.draw_state;
            summary.lrz_invalidated = !self.lrz.is_valid();
            summary.stats += state.stats;
            summary.has_tessellation |= state.has_tessellation;
            summary.disable_gmem |= state.disable_gmem;
            summary.xfb_used |= state.xfb_used;
            patches = continuation.patches;
        }

        Ok(Recording {
            streams,
            binary_data: self.binary_data,
            patches,
            summary,
        })
    }

    /// Remember the first failure.
    fn fail(&mut self, err: RecordError) {
        log::debug!("Recording failed: {}", err);
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn push_stream(&mut self, stream: Arc<[Low]>) -> StreamRef {
        self.streams.push(stream);
        StreamRef(self.streams.len())
    }

    /// Take a slot for a stream whose contents are only known later.
    fn reserve_stream(&mut self) -> StreamRef {
        self.push_stream(Vec::new().into())
    }

    fn fill_stream(&mut self, StreamRef(idx): StreamRef, stream: Arc<[Low]>) {
        match idx.checked_sub(1).and_then(|idx| self.streams.get_mut(idx)) {
            Some(slot) => *slot = stream,
            None => self.fail(RecordError::Internal(line!())),
        }
    }

    /// Append bytes to recording memory, returning their offset.
    fn push_data(&mut self, bytes: &[u8]) -> Option<usize> {
        let offset = self.binary_data.len();

        if self.binary_data.try_reserve(bytes.len()).is_err() {
            self.fail(RecordError::OutOfMemory(StreamKind::Main));
            return None;
        }

        self.binary_data.extend_from_slice(bytes);
        Some(offset)
    }

    /// Remember a per-tile patch of the current pass.
    fn push_patch(&mut self, patch: PatchPoint) {
        if let Some(pass) = self.pass.as_mut() {
            pass.patches.push(patch);
        } else if let Some(continuation) = self.continuation.as_mut() {
            continuation.patches.push(patch);
        }
    }
}

/// Record the dependency of a barrier into a cache tracker.
///
/// `image_only` barriers only guard images written by transfers.
fn apply_barrier(
    cache: &mut CacheState,
    barrier: &MemoryBarrier,
    extra_src: AccessMask,
    extra_dst: AccessMask,
    image_only: bool,
    gmem: bool,
) {
    let src_stages = access::sanitize_src(barrier.src_stages);
    let dst_stages = access::sanitize_dst(barrier.dst_stages);
    let src = access::classify(barrier.src_access, src_stages, image_only, gmem) | extra_src;
    let dst = access::classify(barrier.dst_access, dst_stages, image_only, gmem) | extra_dst;

    cache.record_access(src, dst);

    let region_local = access::is_framebuffer_space(src_stages) && access::is_framebuffer_space(dst_stages);
    cache.flush_for_stage(
        access::src_stage(src_stages),
        access::dst_stage(dst_stages),
        region_local,
    );
}

/// Emit everything a tracker owes.
fn flush_into(cache: &mut CacheState, caps: &Capabilities, out: &mut dyn ExtendOne<Low>) {
    if caps.debug.contains(DebugFlags::FLUSH_ALL) {
        cache.require(FlushFlags::ALL_FLUSH | FlushFlags::ALL_INVALIDATE);
    }

    cache.materialize(out);
}

/// What a blit writes to, from the layout of the destination.
fn destination(layout: &ResourceLayout) -> Destination {
    if !layout.is_image() {
        Destination::Buffer
    } else if layout.aspects().contains(Aspects::COLOR) {
        Destination::ColorImage
    } else {
        Destination::DepthImage
    }
}

fn buffer_range(offset: u32, size: u32) -> Rectangle {
    Rectangle {
        x: offset,
        y: 0,
        max_x: offset.saturating_add(size),
        max_y: 1,
    }
}

impl Rectangle {
    /// A rectangle at the origin with given width (x) and height (y).
    pub fn with_width_height(width: u32, height: u32) -> Self {
        Rectangle {
            x: 0,
            y: 0,
            max_x: width,
            max_y: height,
        }
    }

    /// A rectangle at the given position with given width (x) and height (y).
    pub fn with_offset_extent(x: u32, y: u32, width: u32, height: u32) -> Self {
        Rectangle {
            x,
            y,
            max_x: x.saturating_add(width),
            max_y: y.saturating_add(height),
        }
    }

    /// The apparent width.
    pub fn width(self) -> u32 {
        self.max_x.saturating_sub(self.x)
    }

    /// The apparent height.
    pub fn height(self) -> u32 {
        self.max_y.saturating_sub(self.y)
    }

    pub fn is_empty(self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Return true if this rectangle fully contains `other`.
    pub fn contains(self, other: Self) -> bool {
        self.x <= other.x && self.y <= other.y && {
            // Offsets are surely non-wrapping.
            let offset_x = other.x - self.x;
            let offset_y = other.y - self.y;
            let rel_width = self.width().checked_sub(offset_x);
            let rel_height = self.height().checked_sub(offset_y);
            rel_width >= Some(other.width()) && rel_height >= Some(other.height())
        }
    }

    /// Bring the rectangle into normalized form where minimum and maximum form a true interval.
    #[must_use]
    pub fn normalize(self) -> Rectangle {
        Rectangle {
            x: self.x,
            y: self.y,
            max_x: self.x + self.width(),
            max_y: self.y + self.height(),
        }
    }

    /// A rectangle that the overlap of the two.
    #[must_use]
    pub fn meet(self, other: Self) -> Rectangle {
        Rectangle {
            x: self.x.max(other.x),
            y: self.y.max(other.y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }

    /// A rectangle that contains both.
    #[must_use]
    pub fn join(self, other: Self) -> Rectangle {
        Rectangle {
            x: self.x.min(other.x),
            y: self.y.min(other.y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}
