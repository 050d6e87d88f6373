//! Recording and sequencing of render passes.
//!
//! The commands within a pass are recorded into the draw stream without knowing how the pass
//! will be rendered. Only when the pass ends do we know enough to decide, and then the main
//! stream gets either a single replay of the draw stream against memory or a loop over all
//! tiles, each of which loads, replays the draw stream and stores.
use std::sync::Arc;

use super::{
    apply_barrier, flush_into, BlendState, ClearAttachment, CommandBuffer, DepthStencilState,
    Draw, MemoryBarrier, PassPhase, Rectangle,
};
use crate::autotune::{PassCost, PassStats};
use crate::cache::access;
use crate::cache::{AccessMask, CacheState, CcuMode, FlushFlags};
use crate::device::{Aspects, Capabilities};
use crate::lrz::{LrzAttachment, LrzLoad, LrzState};
use crate::pass::{
    AttachmentDesc, AttachmentUsage, ClearValue, Framebuffer, RenderPassDesc, SubpassBarrier,
    SubpassDesc,
};
use crate::patch::{scissor_bytes, tile_scissor, PatchPoint};
use crate::pool::{LayoutSource, ResourceKey, TileMode};
use crate::program::stream::CommandStream;
use crate::program::{
    DrawOp, Event, Low, LrzCommand, Marker, Predicate, RecordError, Recording, Relocation,
    StorePath, StreamKind, StreamRef,
};
use crate::tiling::{
    Extent, GmemLayout, GmemOffset, Planner, RenderConditions, RenderDecision, RenderingMode,
    TileFootprint, TilingPlan,
};
use crate::util::ExtendOne;

/// The arguments of [`CommandBuffer::begin_render_pass`].
#[derive(Clone, Debug)]
pub struct RenderPassBegin {
    pub pass: Arc<RenderPassDesc>,
    pub framebuffer: Arc<Framebuffer>,
    pub render_area: Rectangle,
    /// Indexed by attachment, only read for attachments that are cleared.
    pub clear_values: Vec<ClearValue>,
}

/// The pass a secondary recording continues.
#[derive(Clone, Debug)]
pub struct Inheritance {
    pub pass: Arc<RenderPassDesc>,
    pub subpass: usize,
}

/// A render pass whose recording was split off, to be continued elsewhere.
pub struct SuspendedPass {
    state: PassState,
    /// The streams owned by the pass, in order.
    streams: Vec<Arc<[Low]>>,
    binary_data: Vec<u8>,
    draw: Arc<[Low]>,
    epilogue: Arc<[Low]>,
    lrz: LrzState,
    renderpass_cache: CacheState,
}

/// Per-recording state of a render pass between begin and end.
pub(crate) struct PassState {
    desc: Arc<RenderPassDesc>,
    framebuffer: Arc<Framebuffer>,
    render_area: Rectangle,
    plan: TilingPlan,
    attachments: Vec<AttachmentState>,
    subpass: usize,
    /// Per subpass, the loads into tile memory. Filled when the pass ends.
    load_streams: Vec<StreamRef>,
    /// Stores of tile memory, filled when the pass ends.
    store_stream: StreamRef,
    pub(crate) draw_state: DrawState,
    pub(crate) patches: Vec<PatchPoint>,
    /// The first of the streams owned by the pass.
    first_stream: usize,
    /// The start of the recording memory owned by the pass.
    first_data: usize,
}

/// A secondary recording that continues a pass of its executor.
pub(crate) struct Continuation {
    inheritance: Inheritance,
    pub(crate) draw_state: DrawState,
    pub(crate) patches: Vec<PatchPoint>,
}

struct AttachmentState {
    resource: ResourceKey,
    desc: AttachmentDesc,
    usage: AttachmentUsage,
    gmem: Option<GmemOffset>,
    clear_value: Option<ClearValue>,
    /// Loading may be skipped for tiles without geometry.
    cond_load_allowed: bool,
    /// Storing may be skipped for tiles without geometry.
    cond_store_allowed: bool,
    /// The stored region is not aligned to the fast path.
    unaligned_store: bool,
}

/// What the draws of a pass did so far.
#[derive(Clone, Debug, Default)]
pub(crate) struct DrawState {
    pub(crate) stats: PassStats,
    pub(crate) has_tessellation: bool,
    pub(crate) disable_gmem: bool,
    pub(crate) xfb_used: bool,
    pub(crate) prim_query_used: bool,
    depth_stencil: DepthStencilState,
    blend: BlendState,
}

impl CommandBuffer {
    /// A secondary recording.
    ///
    /// With an inheritance it continues a render pass of the recording that executes it, all of
    /// its commands are then draw stream commands of that pass.
    pub fn new_secondary(caps: Capabilities, inherit: Option<Inheritance>) -> Self {
        let mut this = CommandBuffer::new(caps);

        if let Some(inheritance) = inherit {
            let depth = inheritance
                .pass
                .subpasses
                .get(inheritance.subpass)
                .and_then(|subpass| subpass.depth_stencil);

            this.lrz.begin_secondary(&this.caps, depth);
            this.phase = PassPhase::Planning;
            this.continuation = Some(Continuation {
                inheritance,
                draw_state: DrawState::default(),
                patches: vec![],
            });
        }

        this
    }

    pub fn begin_render_pass(&mut self, pool: &impl LayoutSource, begin: RenderPassBegin) {
        if self.in_pass() {
            return self.fail(RecordError::Internal(line!()));
        }

        let RenderPassBegin {
            pass: desc,
            framebuffer,
            render_area,
            clear_values,
        } = begin;

        if desc.attachments.len() != framebuffer.attachments.len() || desc.subpasses.is_empty() {
            return self.fail(RecordError::Internal(line!()));
        }

        let render_area = render_area.meet(framebuffer.rect()).normalize();
        let usage = desc.usage();
        let caps = self.caps.clone();
        let planner = Planner::new(&caps);

        let mut attachments = Vec::with_capacity(desc.attachments.len());
        let bound = desc.attachments.iter().zip(&framebuffer.attachments);
        for (idx, (att, &resource)) in bound.enumerate() {
            let Some(layout) = pool.layout_of(resource) else {
                return self.fail(RecordError::Internal(line!()));
            };

            let (width, height) = layout
                .extent()
                .unwrap_or((framebuffer.width, framebuffer.height));
            let store = !att.store_aspects().is_empty();
            let clear = !att.clear_aspects().is_empty();
            let load = !att.load_aspects().is_empty();

            let clear_value = if clear {
                let value = clear_values.get(idx).copied();
                if value.is_none() {
                    self.fail(RecordError::Internal(line!()));
                }
                value
            } else {
                None
            };

            attachments.push(AttachmentState {
                resource,
                desc: att.clone(),
                usage: usage[idx],
                gmem: None,
                clear_value,
                cond_load_allowed: load && !clear && !usage[idx].resolve_target,
                cond_store_allowed: store && !clear,
                unaligned_store: store
                    && planner.store_is_unaligned(
                        render_area,
                        Extent::new(width, height),
                        layout.tile_mode == TileMode::Linear,
                    ),
            });
        }

        // Stores and resolves through the 3D path use the color cache in tile memory.
        let mut needs_ccu = attachments
            .iter()
            .any(|att| att.usage.gmem && att.unaligned_store);
        for (src, _) in desc.subpasses.iter().flat_map(SubpassDesc::resolves) {
            let Some(att) = desc.attachments.get(src) else {
                return self.fail(RecordError::Internal(line!()));
            };

            needs_ccu |= !att.format.blit_resolvable;
        }

        let layout = if needs_ccu {
            GmemLayout::AvoidCcu
        } else {
            GmemLayout::Full
        };

        let footprints: Vec<_> = attachments
            .iter()
            .map(|att| {
                att.usage.gmem.then(|| TileFootprint {
                    cpp: att.desc.cpp(),
                    stencil_cpp: att.desc.stencil_cpp(),
                })
            })
            .collect();

        let samples = desc
            .attachments
            .iter()
            .map(|att| att.samples)
            .max()
            .unwrap_or(1);

        let plan = planner.plan(&footprints, render_area, samples, layout);
        log::debug!(
            "Planned {}x{} tiles of {}x{} for {:?} (layout {:?}, possible {})",
            plan.tile_count.width,
            plan.tile_count.height,
            plan.tile.width,
            plan.tile.height,
            render_area,
            layout,
            plan.possible,
        );

        for (idx, att) in attachments.iter_mut().enumerate() {
            att.gmem = plan.gmem_offset(idx);
        }

        let lrz_attachment = desc.subpasses[0].depth_stencil.and_then(|idx| {
            let att = attachments.get(idx)?;
            let lrz = pool.layout_of(att.resource)?.lrz;

            let load = match (att.clear_value, att.desc.clear_aspects().contains(Aspects::DEPTH)) {
                (Some(value), true) => LrzLoad::Clear(value.depth().unwrap_or(1.0)),
                _ if att.desc.load_aspects().contains(Aspects::DEPTH) => LrzLoad::Load,
                _ => LrzLoad::DontCare,
            };

            Some(LrzAttachment {
                attachment: idx,
                has_buffer: lrz.is_some(),
                has_fast_clear: lrz.is_some_and(|lrz| lrz.fast_clear_size > 0),
                load,
            })
        });

        self.lrz.begin_pass(&self.caps, lrz_attachment);

        // The dependency on everything before the pass is tracked outside, where the commands
        // it depends on were recorded. The pass inherits whatever is left pending.
        apply_subpass_barrier(&mut self.cache, &desc.subpasses[0].start_barrier, false);
        self.renderpass_cache.inherit_pending(&self.cache);

        let first_stream = self.streams.len();
        let first_data = self.binary_data.len();
        let load_streams = desc.subpasses.iter().map(|_| self.reserve_stream()).collect();
        let store_stream = self.reserve_stream();

        let draw_state = DrawState {
            xfb_used: self.xfb_active,
            prim_query_used: self.prim_query_active,
            ..DrawState::default()
        };

        self.pass = Some(PassState {
            desc,
            framebuffer,
            render_area,
            plan,
            attachments,
            subpass: 0,
            load_streams,
            store_stream,
            draw_state,
            patches: vec![],
            first_stream,
            first_data,
        });

        self.phase = PassPhase::Planning;
        self.subpass_begin();
    }

    /// Start rendering the current subpass: bring its attachments into tile memory, or clear
    /// them in memory.
    fn subpass_begin(&mut self) {
        let Some(pass) = self.pass.as_ref() else {
            return;
        };

        let idx = pass.subpass;
        let first_use: Vec<(usize, &AttachmentState)> = pass
            .attachments
            .iter()
            .enumerate()
            .filter(|(_, att)| att.usage.gmem && att.usage.first_subpass == Some(idx))
            .collect();

        self.draw.emit(Low::CondExec(Predicate::Gmem));
        if let Some(&load) = pass.load_streams.get(idx) {
            self.draw.emit(Low::Call(load));
        }

        for &(attachment, att) in &first_use {
            let (Some(value), Some(gmem)) = (att.clear_value, att.gmem) else {
                continue;
            };

            self.draw.emit(Low::GmemClear {
                attachment,
                aspects: att.desc.clear_aspects(),
                gmem_offset: gmem.offset,
                value,
            });
        }
        self.draw.emit(Low::EndCondExec);

        self.draw.emit(Low::CondExec(Predicate::Sysmem));
        let mut flushes = FlushFlags::empty();
        for &(attachment, att) in &first_use {
            let Some(value) = att.clear_value else {
                continue;
            };

            self.draw.emit(Low::SysmemClear {
                attachment,
                aspects: att.desc.clear_aspects(),
                rect: pass.render_area,
                value,
            });

            // The clear blits through the color cache, the draws access the attachment
            // differently.
            flushes |= if att.desc.format.is_color() {
                FlushFlags::CCU_FLUSH_COLOR | FlushFlags::CCU_INVALIDATE_COLOR
            } else {
                FlushFlags::CCU_FLUSH_COLOR
                    | FlushFlags::CCU_FLUSH_DEPTH
                    | FlushFlags::CCU_INVALIDATE_DEPTH
            };
        }

        if !flushes.is_empty() {
            self.draw.extend((flushes | FlushFlags::WAIT_FOR_IDLE).lower());
        }
        self.draw.emit(Low::EndCondExec);

        let subpass = &pass.desc.subpasses[idx];
        if subpass.feedback_loop {
            log::debug!("Subpass {} samples its own attachments, rendering to memory", idx);
            self.renderpass_cache.require(FlushFlags::CACHE_INVALIDATE);
        }

        let feedback_loop = subpass.feedback_loop;
        if let Some(pass) = self.pass.as_mut() {
            pass.draw_state.disable_gmem |= feedback_loop;
        }
    }

    /// Move to the next subpass of the current pass.
    pub fn next_subpass(&mut self) {
        let Some(pass) = self.pass.as_ref() else {
            return self.fail(RecordError::Internal(line!()));
        };

        let ending = pass.subpass;
        let next = ending + 1;
        let Some(next_desc) = pass.desc.subpasses.get(next) else {
            return self.fail(RecordError::Internal(line!()));
        };

        self.lrz.next_subpass(next_desc.depth_stencil);
        let barrier = next_desc.start_barrier;

        flush_into(&mut self.renderpass_cache, &self.caps, &mut self.draw);

        // Resolves into tile memory attachments are stored and loaded again.
        let mut malformed = false;
        self.draw.emit(Low::CondExec(Predicate::Gmem));
        for (src, dst) in pass.desc.subpasses[ending].resolves() {
            let (Some(store), Some(target)) = (pass.resolve_store(src, dst), pass.attachments.get(dst))
            else {
                malformed = true;
                break;
            };

            self.draw.emit(store);
            if let Some(gmem) = target.gmem {
                self.draw.emit(Low::Event(Event::CcuFlushColor));
                self.draw.emit(Low::Load {
                    attachment: dst,
                    aspects: target.desc.format.aspects,
                    gmem_offset: gmem.offset,
                });
            }
        }
        self.draw.emit(Low::EndCondExec);

        emit_sysmem_resolves(pass, ending, &mut self.draw);
        if malformed {
            return self.fail(RecordError::Internal(line!()));
        }

        let fb_local = !access::leaves_framebuffer_space(barrier.src_stages)
            && !access::leaves_framebuffer_space(barrier.dst_stages);
        apply_subpass_barrier(&mut self.renderpass_cache, &barrier, false);

        if let Some(pass) = self.pass.as_mut() {
            if !fb_local {
                log::debug!("Subpass dependency outside of framebuffer space, rendering to memory");
                pass.draw_state.disable_gmem = true;
            }

            pass.subpass = next;
        }

        self.subpass_begin();
    }

    pub fn set_depth_stencil(&mut self, state: DepthStencilState) {
        if let Some(draw) = self.draw_state_mut() {
            draw.depth_stencil = state;
        }
    }

    pub fn set_blend(&mut self, state: BlendState) {
        if let Some(draw) = self.draw_state_mut() {
            draw.blend = state;
        }
    }

    /// Restrict rendering to a rectangle.
    ///
    /// The scissor is written to recording memory and patched per tile, with the part that
    /// overlaps the tile.
    pub fn set_scissor(&mut self, scissor: Rectangle) {
        let Some(views) = self.pass_desc().map(|desc| desc.view_count.max(1)) else {
            return self.fail(RecordError::Internal(line!()));
        };

        let bytes: Vec<u8> = (0..views).flat_map(|_| scissor_bytes(scissor)).collect();
        let Some(offset) = self.push_data(&bytes) else {
            return;
        };

        self.push_patch(PatchPoint::new(offset, views, tile_scissor(scissor)));
        self.emit_pass(Low::LoadScissor { offset, views });
    }

    pub fn draw(&mut self, draw: Draw) {
        let Some(desc) = self.pass_desc() else {
            return self.fail(RecordError::Internal(line!()));
        };

        let subpass = self.current_subpass();
        let Some(state) = self.draw_state_mut() else {
            return;
        };

        let bandwidth = draw_bandwidth(&desc, subpass, &state.depth_stencil, &state.blend);
        state.stats.draw_count += 1;
        state.stats.bandwidth_per_sample += bandwidth;
        state.has_tessellation |= draw.tessellation;

        let (depth_stencil, blend) = (state.depth_stencil, state.blend);
        let lrz = self.lrz.evaluate(&depth_stencil, blend.reads_dest);
        let control = self.lrz.changed(lrz);

        if draw.indirect {
            // The command processor reads the arguments.
            self.renderpass_cache.pull_pending(FlushFlags::WAIT_FOR_ME);
        }

        self.flush_pass();

        if let Some(control) = control {
            self.emit_pass(Low::Lrz(LrzCommand::Control(control)));
        }

        self.emit_pass(Low::Draw(DrawOp {
            vertex_count: draw.vertex_count,
            instance_count: draw.instance_count,
            indirect: draw.indirect,
        }));
    }

    /// Clear parts of attachments within the pass.
    ///
    /// Afterwards the contents of the cleared attachments depend on every tile, loads and stores
    /// of them may no longer be skipped.
    pub fn clear_attachments(&mut self, clears: &[ClearAttachment]) {
        if !self.in_pass() {
            return self.fail(RecordError::Internal(line!()));
        }

        self.flush_pass();

        for clear in clears {
            if clear.aspects.contains(Aspects::DEPTH)
                && self.lrz.depth_attachment() == Some(clear.attachment)
            {
                self.lrz.depth_cleared();
            }

            if let Some(att) = self
                .pass
                .as_mut()
                .and_then(|pass| pass.attachments.get_mut(clear.attachment))
            {
                att.cond_load_allowed = false;
                att.cond_store_allowed = false;
            }

            self.emit_pass(Low::ClearRect {
                attachment: clear.attachment,
                aspects: clear.aspects,
                rect: clear.rect,
                value: clear.value,
            });
        }
    }

    pub fn begin_transform_feedback(&mut self) {
        match self.draw_state_mut() {
            Some(state) => state.xfb_used = true,
            None => self.xfb_active = true,
        }

        self.emit_pass(Low::StreamOut(true));
    }

    pub fn end_transform_feedback(&mut self) {
        if !self.in_pass() {
            self.xfb_active = false;
        }

        self.emit_pass(Low::StreamOut(false));
    }

    /// Start counting generated primitives.
    pub fn begin_primitives_query(&mut self, index: u32) {
        match self.draw_state_mut() {
            Some(state) => state.prim_query_used = true,
            None => self.prim_query_active = true,
        }

        self.emit_pass(Low::Query { index, begin: true });
    }

    /// Stop counting generated primitives.
    ///
    /// Within a pass the query ends once, after all tiles.
    pub fn end_primitives_query(&mut self, index: u32) {
        let end = Low::Query { index, begin: false };

        if self.pass.is_some() {
            self.epilogue.emit(end);
        } else {
            self.prim_query_active = false;
            self.emit_pass(end);
        }
    }

    /// Secondaries executed within a pass become part of the draw stream.
    pub(super) fn execute_in_pass(&mut self, recordings: &[Recording]) {
        self.renderpass_cache.flush_all_pending();
        flush_into(&mut self.renderpass_cache, &self.caps, &mut self.draw);

        for recording in recordings {
            let data = Relocation::append(self.binary_data.len());
            let entry = self.import(recording);
            self.draw.emit(Low::Call(entry));

            let summary = &recording.summary;
            self.lrz.execute_secondary(summary.lrz_invalidated);

            if let Some(pass) = self.pass.as_mut() {
                pass.patches
                    .extend(recording.patches.iter().map(|patch| patch.relocate(data)));

                let state = &mut pass.draw_state;
                state.stats += summary.stats;
                state.has_tessellation |= summary.has_tessellation;
                state.disable_gmem |= summary.disable_gmem;
                state.xfb_used |= summary.xfb_used;
            }
        }

        self.renderpass_cache.reset();
    }

    /// End the current pass and sequence its rendering.
    pub fn end_render_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            return self.fail(RecordError::Internal(line!()));
        };

        emit_sysmem_resolves(&pass, pass.subpass, &mut self.draw);
        flush_into(&mut self.renderpass_cache, &self.caps, &mut self.draw);

        let decision = pass.plan.decide(&self.caps, &pass.conditions(), &self.autotune);
        log::debug!(
            "Rendering {:?} as {:?} (binning {}, reason {:?})",
            pass.render_area,
            decision.mode,
            decision.binning,
            decision.reason,
        );

        for (idx, &slot) in pass.load_streams.iter().enumerate() {
            let mut loads = CommandStream::new(StreamKind::TileLoad, self.caps.stream_limit);
            loads.extend(pass.tile_loads(idx));
            self.fill_tile_stream(slot, loads);
        }

        let mut stores = CommandStream::new(StreamKind::TileStore, self.caps.stream_limit);
        match pass.tile_stores() {
            Some(tile_stores) => stores.extend(tile_stores),
            None => self.fail(RecordError::Internal(line!())),
        }
        self.fill_tile_stream(pass.store_stream, stores);

        let draw = self.take_stream(StreamSlot::Draw);
        let draw = self.push_stream(draw);
        let epilogue = self.take_stream(StreamSlot::Epilogue);
        let epilogue = self.push_stream(epilogue);

        // Whatever the pass depends on is owed before it starts.
        flush_into(&mut self.cache, &self.caps, &mut self.main);

        match decision.mode {
            RenderingMode::Sysmem => {
                self.phase = PassPhase::SysmemActive;
                self.emit_sysmem(&pass, draw, epilogue);
            }
            RenderingMode::Gmem => {
                self.phase = PassPhase::GmemActive;
                self.emit_gmem(&pass, &decision, draw, epilogue);
            }
        }

        self.cache.merge_pending(&self.renderpass_cache);
        // Attachments of a tiled pass are written back by the tile stores, not the caches.
        let gmem = decision.is_gmem();
        apply_subpass_barrier(&mut self.cache, &pass.desc.end_barrier, gmem);

        self.summary.stats += pass.draw_state.stats;

        self.lrz.reset(&self.caps);
        self.decision = Some(decision);
        self.phase = PassPhase::Ended;
    }

    fn emit_sysmem(&mut self, pass: &PassState, draw: StreamRef, epilogue: StreamRef) {
        self.lrz.emit_begin(&mut self.main);
        self.switch_ccu(CcuMode::Sysmem);

        let area = pass.render_area;
        self.main.emit(Low::WindowScissor(area));
        self.main.emit(Low::WindowOffset { x: 0, y: 0 });
        self.main.emit(Low::Marker(Marker::Bypass));
        self.main.emit(Low::VisibilityOverride(true));

        emit_patches(&pass.patches, area, &mut self.main);
        self.main.emit(Low::Call(draw));
        self.main.emit(Low::Call(epilogue));

        self.lrz.emit_end(&mut self.main);
    }

    fn emit_gmem(
        &mut self,
        pass: &PassState,
        decision: &RenderDecision,
        draw: StreamRef,
        epilogue: StreamRef,
    ) {
        let plan = &pass.plan;

        self.lrz.emit_begin(&mut self.main);
        self.switch_ccu(CcuMode::Gmem);

        self.main.emit(Low::BinSize {
            width: plan.tile.width,
            height: plan.tile.height,
            binning: decision.binning,
        });

        if decision.binning {
            let area = pass.render_area;
            self.main.emit(Low::WindowScissor(area));
            self.main.emit(Low::WindowOffset { x: 0, y: 0 });
            self.main.emit(Low::Marker(Marker::Binning));
            self.main.emit(Low::VisibilityOverride(true));
            self.main.emit(Low::WaitForIdle);
            self.main.emit(Low::VscPipes(plan.pipes()));

            emit_patches(&pass.patches, area, &mut self.main);
            self.main.emit(Low::Call(draw));

            self.main.emit(Low::Event(Event::CacheFlush));
            self.main.emit(Low::WaitForIdle);
            self.main.emit(Low::WaitForMe);
            self.main.emit(Low::CheckVscOverflow);
            self.main.emit(Low::VisibilityOverride(false));
        } else if plan.binning_possible {
            self.main.emit(Low::MarkAllVisible {
                pipes: plan.pipe_total(),
            });
        }

        for tile in plan.serpentine() {
            self.main.emit(Low::Marker(Marker::Gmem));
            self.main.emit(Low::WindowScissor(tile.rect));
            self.main.emit(Low::WindowOffset {
                x: tile.rect.x,
                y: tile.rect.y,
            });

            if decision.binning {
                self.main.emit(Low::WaitForMe);
                self.main.emit(Low::BinData {
                    pipe: tile.pipe,
                    slot: tile.slot,
                });
            }

            if plan.binning_possible {
                self.main.emit(Low::TestVisibility {
                    pipe: tile.pipe,
                    slot: tile.slot,
                });
            }

            self.main.emit(Low::VisibilityOverride(!decision.binning));
            emit_patches(&pass.patches, tile.rect, &mut self.main);
            self.main.emit(Low::Call(draw));

            if decision.binning {
                self.main.emit(Low::Marker(Marker::EndVisibility));
            }

            self.main.emit(Low::Call(pass.store_stream));
        }

        self.main.emit(Low::Call(epilogue));
        self.lrz.emit_end(&mut self.main);
        self.main.emit(Low::Event(Event::BlitCacheFlush));
    }

    /// Program the cache configuration, if it differs.
    fn switch_ccu(&mut self, mode: CcuMode) {
        if !self.cache.prepare_ccu_switch(self.ccu, mode) {
            return;
        }

        log::trace!("Switching caches from {:?} to {:?}", self.ccu, mode);
        flush_into(&mut self.cache, &self.caps, &mut self.main);
        self.main.emit(Low::SetCcuMode(mode));
        self.ccu = Some(mode);
    }

    /// Split off the current pass, to be finished by [`CommandBuffer::resume_render_pass`],
    /// possibly in another recording.
    pub fn suspend_render_pass(&mut self) -> Option<SuspendedPass> {
        let Some(state) = self.pass.take() else {
            self.fail(RecordError::Internal(line!()));
            return None;
        };

        flush_into(&mut self.renderpass_cache, &self.caps, &mut self.draw);

        let draw = self.take_stream(StreamSlot::Draw);
        let epilogue = self.take_stream(StreamSlot::Epilogue);
        let streams = self.streams.split_off(state.first_stream.min(self.streams.len()));
        let binary_data = self.binary_data.split_off(state.first_data.min(self.binary_data.len()));

        let lrz = self.lrz.suspend();
        self.lrz.reset(&self.caps);
        self.phase = PassPhase::NotStarted;

        Some(SuspendedPass {
            state,
            streams,
            binary_data,
            draw,
            epilogue,
            lrz,
            renderpass_cache: core::mem::take(&mut self.renderpass_cache),
        })
    }

    /// Continue recording a suspended pass.
    pub fn resume_render_pass(&mut self, suspended: SuspendedPass) {
        if self.in_pass() {
            return self.fail(RecordError::Internal(line!()));
        }

        let SuspendedPass {
            mut state,
            streams,
            binary_data,
            draw,
            epilogue,
            lrz,
            renderpass_cache,
        } = suspended;

        let stream_move = Relocation {
            from: state.first_stream + 1,
            to: self.streams.len() + 1,
        };
        let data_move = Relocation {
            from: state.first_data,
            to: self.binary_data.len(),
        };

        let relocate = |stream: &[Low]| -> Vec<Low> {
            stream
                .iter()
                .map(|low| low.relocate(stream_move, data_move))
                .collect()
        };

        for stream in &streams {
            self.streams.push(relocate(&stream[..]).into());
        }

        if self.binary_data.try_reserve(binary_data.len()).is_err() {
            return self.fail(RecordError::OutOfMemory(StreamKind::Draw));
        }
        self.binary_data.extend_from_slice(&binary_data);

        self.draw.extend(relocate(&draw[..]));
        self.epilogue.extend(relocate(&epilogue[..]));

        let moved = |StreamRef(idx): StreamRef| StreamRef(stream_move.apply(idx));
        state.load_streams = state.load_streams.iter().copied().map(moved).collect();
        state.store_stream = moved(state.store_stream);
        state.patches = state
            .patches
            .iter()
            .map(|patch| patch.relocate(data_move))
            .collect();
        state.first_stream = stream_move.to - 1;
        state.first_data = data_move.to;

        self.lrz.resume(lrz);
        self.renderpass_cache = renderpass_cache;
        self.pass = Some(state);
        self.phase = PassPhase::Planning;
    }

    /// The draw state of the pass being recorded, if any.
    pub(super) fn draw_state_mut(&mut self) -> Option<&mut DrawState> {
        if let Some(pass) = self.pass.as_mut() {
            return Some(&mut pass.draw_state);
        }

        self.continuation
            .as_mut()
            .map(|continuation| &mut continuation.draw_state)
    }

    fn pass_desc(&self) -> Option<Arc<RenderPassDesc>> {
        if let Some(pass) = self.pass.as_ref() {
            return Some(pass.desc.clone());
        }

        self.continuation
            .as_ref()
            .map(|continuation| continuation.inheritance.pass.clone())
    }

    fn current_subpass(&self) -> usize {
        match (&self.pass, &self.continuation) {
            (Some(pass), _) => pass.subpass,
            (None, Some(continuation)) => continuation.inheritance.subpass,
            (None, None) => 0,
        }
    }

    /// Emit into the stream that holds the commands of the pass.
    fn emit_pass(&mut self, low: Low) {
        if self.pass.is_some() {
            self.draw.emit(low);
        } else {
            self.main.emit(low);
        }
    }

    /// Emit what the commands of the pass owe so far.
    fn flush_pass(&mut self) {
        if self.pass.is_some() {
            flush_into(&mut self.renderpass_cache, &self.caps, &mut self.draw);
        } else {
            flush_into(&mut self.renderpass_cache, &self.caps, &mut self.main);
        }
    }

    /// Fill a reserved stream with the per-tile commands of a pass.
    fn fill_tile_stream(&mut self, slot: StreamRef, mut stream: CommandStream) {
        match stream.take() {
            Ok(stream) => self.fill_stream(slot, stream),
            Err(err) => self.fail(err),
        }
    }

    fn take_stream(&mut self, slot: StreamSlot) -> Arc<[Low]> {
        let stream = match slot {
            StreamSlot::Draw => &mut self.draw,
            StreamSlot::Epilogue => &mut self.epilogue,
        };

        match stream.take() {
            Ok(stream) => stream,
            Err(err) => {
                self.fail(err);
                Vec::new().into()
            }
        }
    }
}

#[derive(Clone, Copy)]
enum StreamSlot {
    Draw,
    Epilogue,
}

impl PassState {
    fn conditions(&self) -> RenderConditions {
        let mut cost = PassCost {
            samples: 1,
            ..PassCost::default()
        };

        for att in self.attachments.iter().filter(|att| att.usage.gmem) {
            let load = !att.desc.load_aspects().is_empty();
            let store = !att.desc.store_aspects().is_empty();
            let per_pixel = att.desc.cpp() + att.desc.stencil_cpp();

            cost.clears_or_loads |= load || !att.desc.clear_aspects().is_empty();
            cost.gmem_bytes_per_pixel += per_pixel * (u32::from(load) + u32::from(store));
            cost.samples = cost.samples.max(att.desc.samples);
        }

        let state = &self.draw_state;
        RenderConditions {
            layers: self.framebuffer.layers,
            has_tessellation: state.has_tessellation,
            disable_gmem: state.disable_gmem,
            xfb_used: state.xfb_used,
            prim_query_used: state.prim_query_used,
            stats: state.stats,
            cost,
        }
    }

    /// The loads of the attachments first used by a subpass.
    fn tile_loads(&self, subpass: usize) -> Vec<Low> {
        let mut loads = vec![];

        for (attachment, att) in self.attachments.iter().enumerate() {
            let aspects = att.desc.load_aspects();
            let Some(gmem) = att.gmem else {
                continue;
            };

            if att.usage.first_subpass != Some(subpass) || aspects.is_empty() {
                continue;
            }

            let load = Low::Load {
                attachment,
                aspects,
                gmem_offset: gmem.offset,
            };

            if att.cond_load_allowed && self.plan.binning_possible {
                loads.extend([Low::CondExec(Predicate::Visible), load, Low::EndCondExec]);
            } else {
                loads.push(load);
            }
        }

        loads
    }

    /// The stores of every tile, including the resolves of the last subpass.
    ///
    /// `None` if a resolve names an attachment the pass does not have.
    fn tile_stores(&self) -> Option<Vec<Low>> {
        let mut stores = vec![Low::Marker(Marker::Resolve)];

        for (attachment, att) in self.attachments.iter().enumerate() {
            let aspects = att.desc.store_aspects();
            let Some(gmem) = att.gmem else {
                continue;
            };

            if aspects.is_empty() {
                continue;
            }

            let store = Low::Store {
                src: attachment,
                dst: attachment,
                aspects,
                gmem_offset: gmem.offset,
                path: if att.unaligned_store {
                    StorePath::Unaligned
                } else {
                    StorePath::Fast
                },
            };

            if att.cond_store_allowed && self.plan.binning_possible {
                stores.extend([Low::CondExec(Predicate::Visible), store, Low::EndCondExec]);
            } else {
                stores.push(store);
            }
        }

        if let Some(last) = self.desc.subpasses.get(self.subpass) {
            for (src, dst) in last.resolves() {
                stores.push(self.resolve_store(src, dst)?);
            }
        }

        Some(stores)
    }

    /// Store tile memory of `src` into the resolve target `dst`.
    fn resolve_store(&self, src: usize, dst: usize) -> Option<Low> {
        let src_att = self.attachments.get(src)?;
        let dst_att = self.attachments.get(dst)?;
        let path = if dst_att.unaligned_store || !src_att.desc.format.blit_resolvable {
            StorePath::Unaligned
        } else {
            StorePath::Fast
        };

        Some(Low::Store {
            src,
            dst,
            aspects: dst_att.desc.format.aspects,
            gmem_offset: src_att.gmem.map_or(0, |gmem| gmem.offset),
            path,
        })
    }
}

/// Resolves of a subpass rendered directly to memory.
fn emit_sysmem_resolves(pass: &PassState, subpass: usize, out: &mut dyn ExtendOne<Low>) {
    let Some(desc) = pass.desc.subpasses.get(subpass) else {
        return;
    };

    let mut resolves = desc.resolves().peekable();
    if resolves.peek().is_none() {
        return;
    }

    out.extend_one(Low::CondExec(Predicate::Sysmem));
    // The resolve reads the source through the unified cache.
    let flushes = FlushFlags::CCU_FLUSH_COLOR
        | FlushFlags::CCU_FLUSH_DEPTH
        | FlushFlags::CACHE_INVALIDATE
        | FlushFlags::WAIT_FOR_IDLE;
    out.extend_iter(&mut flushes.lower());

    for (src, dst) in resolves {
        out.extend_one(Low::SysmemResolve {
            src,
            dst,
            rect: pass.render_area,
        });
    }
    out.extend_one(Low::EndCondExec);
}

/// Write the per-tile operands, and wait for the writes to land before they are read.
fn emit_patches(patches: &[PatchPoint], tile: Rectangle, out: &mut dyn ExtendOne<Low>) {
    if patches.is_empty() {
        return;
    }

    for patch in patches {
        out.extend_one(patch.resolve(tile));
    }

    out.extend_one(Low::WaitMemWrites);
    out.extend_one(Low::WaitForMe);
}

/// Record a dependency of a render pass description.
fn apply_subpass_barrier(cache: &mut CacheState, barrier: &SubpassBarrier, gmem: bool) {
    let mut extra = AccessMask::empty();

    if barrier.incoherent_color {
        extra |= AccessMask::COLOR_CCU_INCOHERENT_WRITE;
    }

    if barrier.incoherent_depth {
        extra |= AccessMask::DEPTH_CCU_INCOHERENT_WRITE;
    }

    let memory = MemoryBarrier {
        src_access: barrier.src_access,
        src_stages: barrier.src_stages,
        dst_access: barrier.dst_access,
        dst_stages: barrier.dst_stages,
    };

    apply_barrier(cache, &memory, extra, AccessMask::empty(), false, gmem);
}

/// Bytes a draw moves per sample through the attachments of a subpass.
fn draw_bandwidth(
    desc: &RenderPassDesc,
    subpass: usize,
    depth_stencil: &DepthStencilState,
    blend: &BlendState,
) -> u64 {
    let Some(subpass) = desc.subpasses.get(subpass) else {
        return 0;
    };

    let per_sample = |idx: usize| {
        desc.attachments
            .get(idx)
            .map_or(0, |att| u64::from(att.format.block_size))
    };

    let blend_factor = if blend.enable { 2 } else { 1 };
    let mut bandwidth: u64 = subpass
        .color
        .iter()
        .flatten()
        .map(|&idx| per_sample(idx) * blend_factor)
        .sum();

    if let Some(depth) = subpass.depth_stencil {
        if depth_stencil.depth_test {
            let factor = if depth_stencil.depth_write { 2 } else { 1 };
            bandwidth += per_sample(depth) * factor;
        }

        if depth_stencil.stencil.test {
            bandwidth += 2;
        }
    }

    bandwidth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FormatInfo;
    use crate::pass::{LoadOp, StoreOp};

    #[test]
    fn bandwidth_counts_blending_and_depth_writes() {
        let desc = RenderPassDesc::single(
            vec![
                AttachmentDesc::color(FormatInfo::color(4), LoadOp::Clear, StoreOp::Store),
                AttachmentDesc::depth(FormatInfo::depth_stencil(4), LoadOp::Clear, StoreOp::Store),
            ],
            SubpassDesc::with_color([0]).with_depth_stencil(1),
        );

        let plain = draw_bandwidth(&desc, 0, &DepthStencilState::default(), &BlendState::default());
        assert_eq!(plain, 4);

        let depth = DepthStencilState {
            depth_test: true,
            depth_write: true,
            ..DepthStencilState::default()
        };
        let blend = BlendState {
            enable: true,
            reads_dest: true,
        };
        assert_eq!(draw_bandwidth(&desc, 0, &depth, &blend), 8 + 8);
    }
}
