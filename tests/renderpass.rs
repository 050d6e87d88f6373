use std::sync::Arc;

use tbdr_sequencer::autotune::{Autotune, AutotuneMode};
use tbdr_sequencer::cache::access::{AccessFlags, PipelineStages};
use tbdr_sequencer::cache::CcuMode;
use tbdr_sequencer::command::{
    ClearAttachment, CommandBuffer, CompareOp, Draw, MemoryBarrier, PassPhase, Rectangle,
    RenderPassBegin,
};
use tbdr_sequencer::device::{Aspects, Capabilities, DebugFlags, FormatInfo};
use tbdr_sequencer::pass::{
    AttachmentDesc, ClearValue, Framebuffer, LoadOp, RenderPassDesc, StoreOp, SubpassBarrier,
    SubpassDesc,
};
use tbdr_sequencer::program::{DrawOp, Event, Low, Marker, RecordError, Recording, StorePath, StreamKind};
use tbdr_sequencer::run::Replay;
use tbdr_sequencer::tiling::{
    GmemLayout, Planner, RenderDecision, RenderingMode, SysmemReason, Tile, TileFootprint,
};

#[path = "util.rs"]
mod util;

/// Record one pass, with the commands of `body` inside of it.
fn record(
    commands: &mut CommandBuffer,
    target: &util::Target,
    begin: RenderPassBegin,
    body: impl FnOnce(&mut CommandBuffer),
) -> RenderDecision {
    commands.begin_render_pass(&target.pool, begin);
    assert_eq!(commands.phase(), PassPhase::Planning);

    body(commands);

    commands.end_render_pass();
    assert_eq!(commands.phase(), PassPhase::Ended);
    commands.last_decision().expect("No decision")
}

fn record_full_hd(
    caps: Capabilities,
    color_load: LoadOp,
    depth_load: LoadOp,
    body: impl FnOnce(&mut CommandBuffer),
) -> (Recording, RenderDecision) {
    let target = util::target(1920, 1080);
    let mut commands = CommandBuffer::new(caps);
    let begin = util::begin(&target, util::color_depth_pass(color_load, depth_load));

    let decision = record(&mut commands, &target, begin, body);
    let recording = commands.finish().expect("Recording failed");
    (recording, decision)
}

fn one_draw(commands: &mut CommandBuffer) {
    commands.set_depth_stencil(util::depth_test(CompareOp::LessOrEqual));
    commands.draw(util::triangles(1));
}

/// The tiles of a full HD color/depth pass, in rendering order.
fn full_hd_tiles(caps: &Capabilities) -> Vec<Tile> {
    let footprint = Some(TileFootprint {
        cpp: 4,
        stencil_cpp: 0,
    });

    Planner::new(caps)
        .plan(
            &[footprint, footprint],
            Rectangle::with_width_height(1920, 1080),
            1,
            GmemLayout::Full,
        )
        .serpentine()
}

/// Split executed instructions into the parts rendering each tile.
fn tile_segments(executed: &[Low]) -> Vec<&[Low]> {
    let starts: Vec<usize> = executed
        .iter()
        .enumerate()
        .filter(|(_, low)| **low == Low::Marker(Marker::Gmem))
        .map(|(idx, _)| idx)
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(executed.len());
            &executed[start..end]
        })
        .collect()
}

fn is_load(low: &Low) -> bool {
    matches!(low, Low::Load { .. })
}

fn is_store(low: &Low) -> bool {
    matches!(low, Low::Store { .. })
}

#[test]
fn tiny_pass_renders_to_memory() {
    util::init();

    let target = util::target(1, 1);
    let mut commands = CommandBuffer::new(Capabilities::default());
    let begin = util::begin(&target, util::color_depth_pass(LoadOp::Clear, LoadOp::Clear));

    let decision = record(&mut commands, &target, begin, one_draw);
    assert_eq!(decision.mode, RenderingMode::Sysmem);
    assert_eq!(decision.reason, Some(SysmemReason::Autotune));
    assert_eq!(commands.ccu_mode(), Some(CcuMode::Sysmem));

    let recording = commands.finish().expect("Recording failed");
    let trace = util::replay(&recording);

    assert_eq!(trace.count(|low| *low == Low::Marker(Marker::Bypass)), 1);
    assert_eq!(trace.count(|low| *low == Low::Marker(Marker::Gmem)), 0);
    assert_eq!(trace.count(|low| matches!(low, Low::SysmemClear { .. })), 2);
    assert_eq!(trace.count(|low| matches!(low, Low::GmemClear { .. })), 0);
    assert_eq!(trace.count(is_load), 0);
    assert_eq!(trace.count(is_store), 0);
    assert_eq!(trace.count(util::is_draw), 1);

    let rect = Rectangle::with_width_height(1, 1);
    let ccu = trace
        .position(|low| *low == Low::SetCcuMode(CcuMode::Sysmem))
        .expect("Caches not configured");
    let window = trace
        .position(|low| *low == Low::WindowScissor(rect))
        .expect("No window");
    let bypass = trace
        .position(|low| *low == Low::Marker(Marker::Bypass))
        .expect("No bypass");
    let clear = trace
        .position(|low| matches!(low, Low::SysmemClear { .. }))
        .expect("No clear");
    let draw = trace.position(util::is_draw).expect("No draw");

    assert!(ccu < window && window < bypass && bypass < clear && clear < draw);

    // The depth clear went through the color cache, the draws use the depth cache.
    assert!(trace.executed[clear..draw].contains(&Low::Event(Event::CcuInvalidateDepth)));
}

#[test]
fn tile_loop_structure() {
    let caps = Capabilities::default().with_debug(DebugFlags::NO_BIN);
    let tiles = full_hd_tiles(&caps);
    assert_eq!(tiles.len(), 18);

    let (recording, decision) = record_full_hd(caps, LoadOp::Clear, LoadOp::Clear, one_draw);
    assert_eq!(decision.mode, RenderingMode::Gmem);
    assert!(!decision.binning);

    let trace = util::replay(&recording);
    assert!(trace.executed.contains(&Low::BinSize {
        width: 320,
        height: 368,
        binning: false,
    }));
    assert!(trace.executed.contains(&Low::MarkAllVisible { pipes: 18 }));
    assert_eq!(trace.count(|low| *low == Low::Marker(Marker::Binning)), 0);

    let ccu = trace
        .position(|low| *low == Low::SetCcuMode(CcuMode::Gmem))
        .expect("Caches not configured");
    let first_tile = trace
        .position(|low| *low == Low::Marker(Marker::Gmem))
        .expect("No tiles");
    assert!(ccu < first_tile);

    let windows: Vec<Rectangle> = trace
        .executed
        .iter()
        .filter_map(|low| match low {
            Low::WindowScissor(rect) => Some(*rect),
            _ => None,
        })
        .collect();
    let expected: Vec<Rectangle> = tiles.iter().map(|tile| tile.rect).collect();
    assert_eq!(windows, expected);

    let segments = tile_segments(&trace.executed);
    assert_eq!(segments.len(), 18);

    for (segment, tile) in segments.iter().zip(&tiles) {
        let find = |pred: &dyn Fn(&Low) -> bool| segment.iter().position(pred);

        let offset = find(&|low| {
            *low == Low::WindowOffset {
                x: tile.rect.x,
                y: tile.rect.y,
            }
        });
        let clear = find(&|low| matches!(low, Low::GmemClear { .. }));
        let draw = find(&util::is_draw);
        let resolve = find(&|low| *low == Low::Marker(Marker::Resolve));
        let store = find(&is_store);

        assert!(offset.is_some() && clear.is_some());
        assert!(offset < clear && clear < draw && draw < resolve && resolve < store);
        assert_eq!(segment.iter().filter(|low| is_store(low)).count(), 2);
        assert!(!segment.iter().any(|low| matches!(low, Low::SysmemClear { .. })));
    }

    let blit_flush = trace
        .executed
        .iter()
        .rposition(|low| *low == Low::Event(Event::BlitCacheFlush))
        .expect("Blit cache not flushed");
    let last_store = trace
        .executed
        .iter()
        .rposition(is_store)
        .expect("No stores");
    assert!(last_store < blit_flush);
}

#[test]
fn binning_pass() {
    let caps = Capabilities::default();
    let (recording, decision) = record_full_hd(caps.clone(), LoadOp::Clear, LoadOp::Clear, one_draw);
    assert!(decision.is_gmem());
    assert!(decision.binning);

    let trace = util::replay(&recording);
    let binning = trace
        .position(|low| *low == Low::Marker(Marker::Binning))
        .expect("No binning pass");
    let first_tile = trace
        .position(|low| *low == Low::Marker(Marker::Gmem))
        .expect("No tiles");
    assert!(binning < first_tile);

    // The binning pass draws, but neither clears nor stores.
    let prepass = &trace.executed[binning..first_tile];
    assert_eq!(prepass.iter().filter(|low| util::is_draw(low)).count(), 1);
    assert!(!prepass.iter().any(|low| matches!(low, Low::GmemClear { .. })));
    assert!(!prepass.iter().any(is_store));
    assert!(prepass.contains(&Low::CheckVscOverflow));

    let footprint = Some(TileFootprint {
        cpp: 4,
        stencil_cpp: 0,
    });
    let plan = Planner::new(&caps).plan(
        &[footprint, footprint],
        Rectangle::with_width_height(1920, 1080),
        1,
        GmemLayout::Full,
    );
    assert!(prepass.contains(&Low::VscPipes(plan.pipes())));

    assert_eq!(trace.count(util::is_draw), 1 + 18);
    assert_eq!(trace.count(|low| matches!(low, Low::BinData { .. })), 18);
    assert_eq!(trace.count(|low| *low == Low::Marker(Marker::EndVisibility)), 18);
    assert_eq!(trace.count(|low| matches!(low, Low::GmemClear { .. })), 36);
    assert_eq!(trace.count(|low| matches!(low, Low::MarkAllVisible { .. })), 0);

    for (segment, tile) in tile_segments(&trace.executed).iter().zip(plan.serpentine()) {
        let wait = segment.iter().position(|low| *low == Low::WaitForMe);
        let bin = segment.iter().position(|low| {
            *low == Low::BinData {
                pipe: tile.pipe,
                slot: tile.slot,
            }
        });

        assert!(wait.is_some() && wait < bin);
        assert!(segment.contains(&Low::VisibilityOverride(false)));
    }
}

#[test]
fn conditional_loads() {
    let (recording, decision) =
        record_full_hd(Capabilities::default(), LoadOp::Load, LoadOp::Load, one_draw);
    assert!(decision.binning);

    // Everything visible by default.
    let trace = util::replay(&recording);
    assert_eq!(trace.count(is_load), 36);
    assert_eq!(trace.count(is_store), 36);

    let trace = Replay::new(&recording)
        .with_visibility(|pipe, _| pipe % 2 == 0)
        .run()
        .expect("Replay failed");
    assert_eq!(trace.count(|low| matches!(low, Low::TestVisibility { .. })), 18);
    assert_eq!(trace.count(is_load), 18);
    assert_eq!(trace.count(is_store), 18);
    // The tiles are still rendered.
    assert_eq!(trace.count(util::is_draw), 19);

    let nothing = Replay::new(&recording)
        .with_visibility(|_, _| false)
        .run()
        .expect("Replay failed");
    assert_eq!(nothing.count(is_load), 0);
}

#[test]
fn loads_without_binning() {
    let caps = Capabilities::default().with_debug(DebugFlags::NO_BIN);
    let (recording, decision) = record_full_hd(caps, LoadOp::Load, LoadOp::Load, one_draw);
    assert!(!decision.binning);

    // Every tile counts as visible without a binning pass.
    let trace = Replay::new(&recording)
        .with_visibility(|_, _| false)
        .run()
        .expect("Replay failed");
    assert_eq!(trace.count(is_load), 36);
    assert_eq!(trace.count(is_store), 36);
}

#[test]
fn cleared_in_pass_loads_every_tile() {
    let (recording, _) = record_full_hd(
        Capabilities::default(),
        LoadOp::Load,
        LoadOp::Load,
        |commands| {
            one_draw(commands);
            commands.clear_attachments(&[ClearAttachment {
                attachment: 0,
                aspects: Aspects::COLOR,
                rect: Rectangle::with_offset_extent(10, 10, 20, 20),
                value: ClearValue::Color([0.0, 0.0, 1.0, 1.0]),
            }]);
        },
    );

    let trace = Replay::new(&recording)
        .with_visibility(|_, _| false)
        .run()
        .expect("Replay failed");

    let color_loads = trace.count(|low| matches!(low, Low::Load { attachment: 0, .. }));
    let depth_loads = trace.count(|low| matches!(low, Low::Load { attachment: 1, .. }));
    assert_eq!(color_loads, 18);
    assert_eq!(depth_loads, 0);

    assert_eq!(trace.count(|low| matches!(low, Low::ClearRect { .. })), 19);
}

#[test]
fn scissor_per_tile() {
    let caps = Capabilities::default();
    let scissor = Rectangle {
        x: 100,
        y: 100,
        max_x: 700,
        max_y: 500,
    };

    let (recording, _) = record_full_hd(caps.clone(), LoadOp::Clear, LoadOp::Clear, |commands| {
        commands.set_scissor(scissor);
        one_draw(commands);
    });

    let trace = util::replay(&recording);
    let mut expected = vec![scissor];
    expected.extend(full_hd_tiles(&caps).iter().map(|tile| scissor.meet(tile.rect)));
    assert_eq!(trace.scissors, expected);

    // Operands are written before the commands reading them.
    let write = trace
        .position(|low| matches!(low, Low::MemWrite { .. }))
        .expect("No patches");
    let load = trace
        .position(|low| matches!(low, Low::LoadScissor { .. }))
        .expect("No scissor");
    assert!(write < load);
    assert!(trace.executed[write..load].contains(&Low::WaitMemWrites));
}

#[test]
fn scissor_per_view() {
    let target = util::target(1920, 1080);
    let mut desc = (*util::color_depth_pass(LoadOp::Clear, LoadOp::Clear)).clone();
    desc.view_count = 2;

    let scissor = Rectangle::with_offset_extent(5, 6, 7, 8);
    let mut commands = CommandBuffer::new(Capabilities::default())
        .with_autotune(Autotune::new(AutotuneMode::PreferSysmem));
    let decision = record(
        &mut commands,
        &target,
        util::begin(&target, Arc::new(desc)),
        |commands| {
            commands.set_scissor(scissor);
            one_draw(commands);
        },
    );
    assert_eq!(decision.reason, Some(SysmemReason::Autotune));

    let recording = commands.finish().expect("Recording failed");
    let trace = util::replay(&recording);
    assert_eq!(trace.scissors, [scissor, scissor]);
}

#[test]
fn barrier_outside_framebuffer_space() {
    let (_, decision) = record_full_hd(
        Capabilities::default(),
        LoadOp::Clear,
        LoadOp::Clear,
        |commands| {
            one_draw(commands);
            commands.record_barrier(MemoryBarrier {
                src_access: AccessFlags::SHADER_WRITE,
                src_stages: PipelineStages::VERTEX_SHADER,
                dst_access: AccessFlags::SHADER_READ,
                dst_stages: PipelineStages::FRAGMENT_SHADER,
            });
            one_draw(commands);
        },
    );

    assert_eq!(decision.mode, RenderingMode::Sysmem);
    assert_eq!(decision.reason, Some(SysmemReason::GmemDisabled));

    let (_, decision) = record_full_hd(
        Capabilities::default(),
        LoadOp::Clear,
        LoadOp::Clear,
        |commands| {
            one_draw(commands);
            commands.record_barrier(MemoryBarrier {
                src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
                src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                dst_access: AccessFlags::INPUT_ATTACHMENT_READ,
                dst_stages: PipelineStages::FRAGMENT_SHADER,
            });
            one_draw(commands);
        },
    );

    assert_eq!(decision.mode, RenderingMode::Gmem);
}

#[test]
fn feedback_loop() {
    let target = util::target(1920, 1080);
    let mut desc = (*util::color_depth_pass(LoadOp::Clear, LoadOp::Clear)).clone();
    desc.subpasses[0].feedback_loop = true;

    let mut commands = CommandBuffer::new(Capabilities::default());
    let decision = record(
        &mut commands,
        &target,
        util::begin(&target, Arc::new(desc)),
        one_draw,
    );
    assert_eq!(decision.reason, Some(SysmemReason::GmemDisabled));

    let recording = commands.finish().expect("Recording failed");
    let trace = util::replay(&recording);
    let invalidate = trace
        .position(|low| *low == Low::Event(Event::CacheInvalidate))
        .expect("Texture cache not invalidated");
    assert!(invalidate < trace.position(util::is_draw).expect("No draw"));
}

/// Two subpasses: the first renders attachment 0, the second renders attachment 1 and reads 0.
fn two_subpasses(barrier: SubpassBarrier) -> Arc<RenderPassDesc> {
    let first = SubpassDesc::with_color([0]);
    let second = SubpassDesc {
        input: vec![0],
        start_barrier: barrier,
        ..SubpassDesc::with_color([1])
    };

    Arc::new(RenderPassDesc {
        attachments: vec![
            AttachmentDesc::color(util::RGBA8, LoadOp::Clear, StoreOp::DontCare),
            AttachmentDesc::color(util::RGBA8, LoadOp::Load, StoreOp::Store),
        ],
        subpasses: vec![first, second],
        end_barrier: SubpassBarrier::default(),
        view_count: 1,
    })
}

fn record_two_subpasses(barrier: SubpassBarrier) -> (Recording, RenderDecision) {
    let mut target = util::target(1920, 1080);
    let second = target
        .pool
        .declare_image(0x5000_0000, 1920, 1080, util::RGBA8)
        .expect("Image too large")
        .key();

    let begin = RenderPassBegin {
        pass: two_subpasses(barrier),
        framebuffer: Arc::new(Framebuffer {
            width: 1920,
            height: 1080,
            layers: 1,
            attachments: vec![target.color, second],
        }),
        render_area: Rectangle::with_width_height(1920, 1080),
        clear_values: vec![ClearValue::Color([0.0; 4]), ClearValue::Color([0.0; 4])],
    };

    let mut commands = CommandBuffer::new(Capabilities::default());
    let decision = record(&mut commands, &target, begin, |commands| {
        commands.draw(util::triangles(1));
        commands.next_subpass();
        commands.draw(util::triangles(2));
    });

    (commands.finish().expect("Recording failed"), decision)
}

#[test]
fn subpass_loads() {
    let (recording, decision) = record_two_subpasses(SubpassBarrier {
        src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
        src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        dst_access: AccessFlags::INPUT_ATTACHMENT_READ,
        dst_stages: PipelineStages::FRAGMENT_SHADER,
        ..SubpassBarrier::default()
    });
    assert!(decision.is_gmem());

    let trace = util::replay(&recording);
    for segment in tile_segments(&trace.executed) {
        let clear = segment
            .iter()
            .position(|low| matches!(low, Low::GmemClear { attachment: 0, .. }));
        let first = segment.iter().position(|low| {
            *low == Low::Draw(DrawOp {
                vertex_count: 3,
                instance_count: 1,
                indirect: false,
            })
        });
        let load = segment
            .iter()
            .position(|low| matches!(low, Low::Load { attachment: 1, .. }));
        let second = segment.iter().position(|low| {
            matches!(low, Low::Draw(op) if op.vertex_count == 6)
        });

        assert!(clear.is_some() && clear < first && first < load && load < second);

        // Only the second attachment is stored.
        let stores: Vec<&Low> = segment.iter().filter(|low| is_store(low)).collect();
        assert_eq!(stores.len(), 1);
        assert!(matches!(stores[0], Low::Store { src: 1, dst: 1, .. }));
    }
}

#[test]
fn subpass_dependency_outside_framebuffer() {
    let (_, decision) = record_two_subpasses(SubpassBarrier {
        src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
        src_stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        dst_access: AccessFlags::SHADER_READ,
        dst_stages: PipelineStages::VERTEX_SHADER,
        ..SubpassBarrier::default()
    });

    assert_eq!(decision.reason, Some(SysmemReason::GmemDisabled));
}

#[test]
fn tessellation_and_layers() {
    let (_, decision) = record_full_hd(
        Capabilities::default(),
        LoadOp::Clear,
        LoadOp::Clear,
        |commands| {
            commands.draw(Draw {
                tessellation: true,
                ..util::triangles(1)
            });
        },
    );
    assert_eq!(decision.reason, Some(SysmemReason::Tessellation));

    let target = util::target(1920, 1080);
    let mut begin = util::begin(&target, util::color_depth_pass(LoadOp::Clear, LoadOp::Clear));
    begin.framebuffer = Arc::new(Framebuffer {
        layers: 2,
        ..(*begin.framebuffer).clone()
    });

    let mut commands = CommandBuffer::new(Capabilities::default());
    let decision = record(&mut commands, &target, begin, one_draw);
    assert_eq!(decision.reason, Some(SysmemReason::MultipleLayers));
}

#[test]
fn transform_feedback_disables_binning() {
    let (recording, decision) = record_full_hd(
        Capabilities::default(),
        LoadOp::Clear,
        LoadOp::Clear,
        |commands| {
            commands.begin_transform_feedback();
            one_draw(commands);
            commands.end_transform_feedback();
        },
    );

    assert!(decision.is_gmem());
    assert!(!decision.binning);

    let trace = util::replay(&recording);
    assert_eq!(trace.count(|low| *low == Low::StreamOut(true)), 18);
}

#[test]
fn primitives_query_ends_once() {
    let (recording, decision) = record_full_hd(
        Capabilities::default(),
        LoadOp::Clear,
        LoadOp::Clear,
        |commands| {
            commands.begin_primitives_query(3);
            one_draw(commands);
            commands.end_primitives_query(3);
        },
    );

    assert!(!decision.binning);

    let trace = util::replay(&recording);
    let begins = trace.count(|low| *low == Low::Query { index: 3, begin: true });
    let ends = trace.count(|low| *low == Low::Query { index: 3, begin: false });
    assert_eq!(begins, 18);
    assert_eq!(ends, 1);

    let last_store = trace.executed.iter().rposition(is_store).expect("No stores");
    let end = trace
        .position(|low| *low == Low::Query { index: 3, begin: false })
        .expect("Query not ended");
    assert!(last_store < end);
}

/// A multisampled color attachment resolved into attachment 1.
fn resolve_pass(format: FormatInfo) -> (util::Target, RenderPassBegin) {
    let mut target = util::target(1920, 1080);
    let resolved = target
        .pool
        .declare_image(0x6000_0000, 1920, 1080, util::RGBA8)
        .expect("Image too large")
        .key();

    let pass = RenderPassDesc::single(
        vec![
            AttachmentDesc::color(format, LoadOp::Clear, StoreOp::DontCare).with_samples(4),
            AttachmentDesc::color(util::RGBA8, LoadOp::DontCare, StoreOp::Store),
        ],
        SubpassDesc::with_color([0]).with_resolve([Some(1)]),
    );

    let begin = RenderPassBegin {
        pass: Arc::new(pass),
        framebuffer: Arc::new(Framebuffer {
            width: 1920,
            height: 1080,
            layers: 1,
            attachments: vec![target.color, resolved],
        }),
        render_area: Rectangle::with_width_height(1920, 1080),
        clear_values: vec![ClearValue::Color([0.0; 4]), ClearValue::Color([0.0; 4])],
    };

    (target, begin)
}

#[test]
fn resolves() {
    let (target, begin) = resolve_pass(util::RGBA8);
    let mut commands = CommandBuffer::new(Capabilities::default());
    let decision = record(&mut commands, &target, begin.clone(), |commands| {
        commands.draw(util::triangles(1));
    });
    assert!(decision.is_gmem());

    let trace = util::replay(&commands.finish().expect("Recording failed"));
    let resolves = trace.count(|low| {
        matches!(
            low,
            Low::Store {
                src: 0,
                dst: 1,
                path: StorePath::Fast,
                ..
            }
        )
    });
    assert_eq!(resolves, trace.count(|low| *low == Low::Marker(Marker::Gmem)));
    // The multisampled attachment itself is never stored.
    assert_eq!(trace.count(|low| matches!(low, Low::Store { dst: 0, .. })), 0);

    let mut commands = CommandBuffer::new(Capabilities::default())
        .with_autotune(Autotune::new(AutotuneMode::PreferSysmem));
    record(&mut commands, &target, begin, |commands| {
        commands.draw(util::triangles(1));
    });

    let trace = util::replay(&commands.finish().expect("Recording failed"));
    assert!(trace.executed.contains(&Low::SysmemResolve {
        src: 0,
        dst: 1,
        rect: Rectangle::with_width_height(1920, 1080),
    }));
    assert_eq!(trace.count(is_store), 0);
}

#[test]
fn resolve_through_draws() {
    let (target, begin) = resolve_pass(util::RGBA8.without_blit_resolve());
    let mut commands = CommandBuffer::new(Capabilities::default());
    let decision = record(&mut commands, &target, begin, |commands| {
        commands.draw(util::triangles(1));
    });
    assert!(decision.is_gmem());

    let trace = util::replay(&commands.finish().expect("Recording failed"));
    assert!(trace.count(|low| {
        matches!(
            low,
            Low::Store {
                path: StorePath::Unaligned,
                ..
            }
        )
    }) > 0);
    assert_eq!(
        trace.count(|low| matches!(low, Low::Store { path: StorePath::Fast, .. })),
        0
    );
}

#[test]
fn unaligned_render_area() {
    let target = util::target(1920, 1080);
    let mut begin = util::begin(&target, util::color_depth_pass(LoadOp::Clear, LoadOp::Clear));
    begin.render_area = Rectangle::with_offset_extent(3, 3, 500, 500);

    let mut commands = CommandBuffer::new(Capabilities::default());
    let decision = record(&mut commands, &target, begin, one_draw);
    assert!(decision.is_gmem());

    let trace = util::replay(&commands.finish().expect("Recording failed"));
    assert!(trace.count(is_store) > 0);
    assert_eq!(
        trace.count(|low| matches!(low, Low::Store { path: StorePath::Fast, .. })),
        0
    );

    // The first tile starts at the aligned origin.
    let segments = tile_segments(&trace.executed);
    let first = segments[0]
        .iter()
        .find_map(|low| match low {
            Low::WindowScissor(rect) => Some(*rect),
            _ => None,
        })
        .expect("No window");
    assert_eq!((first.x, first.y), (0, 0));
}

#[test]
fn cache_mode_between_passes() {
    let target = util::target(1920, 1080);
    let mut commands = CommandBuffer::new(Capabilities::default());

    let begin = util::begin(&target, util::color_depth_pass(LoadOp::Clear, LoadOp::Clear));
    record(&mut commands, &target, begin, one_draw);
    assert_eq!(commands.ccu_mode(), Some(CcuMode::Gmem));

    commands.record_clear(
        &target.pool,
        target.color,
        Rectangle::with_width_height(64, 64),
        ClearValue::Color([1.0; 4]),
    );
    assert_eq!(commands.ccu_mode(), Some(CcuMode::Sysmem));

    let recording = commands.finish().expect("Recording failed");
    let modes: Vec<CcuMode> = recording
        .entry()
        .iter()
        .filter_map(|low| match low {
            Low::SetCcuMode(mode) => Some(*mode),
            _ => None,
        })
        .collect();
    assert_eq!(modes, [CcuMode::Gmem, CcuMode::Sysmem]);
}

#[test]
fn allocation_failure_is_sticky() {
    let caps = Capabilities {
        stream_limit: Some(8),
        ..Capabilities::default()
    };

    let target = util::target(1920, 1080);
    let mut commands = CommandBuffer::new(caps);
    let begin = util::begin(&target, util::color_depth_pass(LoadOp::Clear, LoadOp::Clear));
    record(&mut commands, &target, begin, |commands| {
        for _ in 0..20 {
            one_draw(commands);
        }
    });

    // Recording goes on, the failure is only reported at the end.
    commands.record_dispatch([1, 1, 1], false);
    assert!(matches!(
        commands.finish(),
        Err(RecordError::OutOfMemory(StreamKind::Draw))
    ));

    let caps = Capabilities {
        stream_limit: Some(2),
        ..Capabilities::default()
    };
    let mut commands = CommandBuffer::new(caps);
    for _ in 0..5 {
        commands.record_dispatch([1, 1, 1], false);
    }
    assert!(matches!(
        commands.finish(),
        Err(RecordError::OutOfMemory(StreamKind::Main))
    ));
}

#[test]
fn tile_streams_have_their_own_limit() {
    util::init();

    let caps = Capabilities {
        stream_limit: Some(1),
        ..Capabilities::default()
    };
    let target = util::target(1920, 1080);

    // Cleared attachments are not loaded, but still stored.
    let cases = [
        (LoadOp::Clear, StreamKind::TileStore),
        (LoadOp::Load, StreamKind::TileLoad),
    ];

    for (load, kind) in cases {
        let mut commands = CommandBuffer::new(caps.clone());
        commands.begin_render_pass(
            &target.pool,
            util::begin(&target, util::color_depth_pass(load, load)),
        );
        commands.end_render_pass();

        assert_eq!(commands.finish().err(), Some(RecordError::OutOfMemory(kind)));
    }
}

#[test]
fn misuse_is_reported() {
    let mut commands = CommandBuffer::new(Capabilities::default());
    commands.draw(util::triangles(1));
    commands.record_dispatch([1, 1, 1], false);
    assert!(matches!(commands.finish(), Err(RecordError::Internal(_))));

    let target = util::target(64, 64);
    let mut commands = CommandBuffer::new(Capabilities::default());
    commands.begin_render_pass(
        &target.pool,
        util::begin(&target, util::color_depth_pass(LoadOp::Clear, LoadOp::Clear)),
    );
    commands.record_dispatch([1, 1, 1], false);
    commands.end_render_pass();
    assert!(matches!(commands.finish(), Err(RecordError::Internal(_))));

    // Still within a pass.
    let mut commands = CommandBuffer::new(Capabilities::default());
    commands.begin_render_pass(
        &target.pool,
        util::begin(&target, util::color_depth_pass(LoadOp::Clear, LoadOp::Clear)),
    );
    assert!(commands.finish().is_err());
}

#[test]
fn resolve_of_unknown_attachment() {
    util::init();

    let unknown_target = SubpassDesc::with_color([0]).with_resolve([Some(2)]);
    let unknown_source = SubpassDesc::with_color([3]).with_resolve([Some(1)]);

    for subpass in [unknown_target, unknown_source] {
        let (target, mut begin) = resolve_pass(util::RGBA8);
        let mut desc = RenderPassDesc::clone(&begin.pass);
        desc.subpasses = vec![subpass];
        begin.pass = Arc::new(desc);

        let mut commands = CommandBuffer::new(Capabilities::default());
        commands.begin_render_pass(&target.pool, begin);
        commands.draw(util::triangles(1));
        commands.end_render_pass();
        assert!(matches!(commands.finish(), Err(RecordError::Internal(_))));
    }

    // Resolved when leaving the first subpass.
    let mut desc = RenderPassDesc::clone(&two_subpasses(SubpassBarrier::default()));
    desc.subpasses[0] = SubpassDesc::with_color([0]).with_resolve([Some(5)]);

    let mut target = util::target(64, 64);
    let second = target
        .pool
        .declare_image(0x5000_0000, 64, 64, util::RGBA8)
        .expect("Image too large")
        .key();
    let begin = RenderPassBegin {
        pass: Arc::new(desc),
        framebuffer: Arc::new(Framebuffer {
            width: 64,
            height: 64,
            layers: 1,
            attachments: vec![target.color, second],
        }),
        render_area: Rectangle::with_width_height(64, 64),
        clear_values: vec![ClearValue::Color([0.0; 4]), ClearValue::Color([0.0; 4])],
    };

    let mut commands = CommandBuffer::new(Capabilities::default());
    commands.begin_render_pass(&target.pool, begin);
    commands.draw(util::triangles(1));
    commands.next_subpass();
    commands.draw(util::triangles(1));
    commands.end_render_pass();
    assert!(matches!(commands.finish(), Err(RecordError::Internal(_))));
}

#[test]
fn pass_size_limits() {
    let caps = Capabilities {
        gmem_bytes: 0x800,
        ccu_offset_gmem: 0x400,
        ..Capabilities::default()
    };

    let (_, decision) = record_full_hd(caps, LoadOp::Clear, LoadOp::Clear, one_draw);
    assert_eq!(decision.reason, Some(SysmemReason::NotPossible));
}
