// This is almost certainly not all used in all tests.
#![allow(dead_code)]
use std::sync::Arc;

use tbdr_sequencer::command::{
    CommandBuffer, CompareOp, DepthStencilState, Draw, Rectangle, RenderPassBegin,
};
use tbdr_sequencer::device::{Capabilities, FormatInfo};
use tbdr_sequencer::pass::{
    AttachmentDesc, ClearValue, Framebuffer, LoadOp, RenderPassDesc, StoreOp, SubpassDesc,
};
use tbdr_sequencer::pool::{LrzLayout, ResourceKey, ResourcePool};
use tbdr_sequencer::program::{Low, Recording};
use tbdr_sequencer::run::{Replay, Trace};

pub const RGBA8: FormatInfo = FormatInfo::color(4);
pub const D24S8: FormatInfo = FormatInfo::depth_stencil(4);

/// A color and a depth image of the same size.
pub struct Target {
    pub pool: ResourcePool,
    pub color: ResourceKey,
    pub depth: ResourceKey,
    pub width: u32,
    pub height: u32,
}

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn target(width: u32, height: u32) -> Target {
    let mut pool = ResourcePool::new();
    let color = pool
        .declare_image(0x1000_0000, width, height, RGBA8)
        .expect("Image too large")
        .key();
    let depth = pool
        .declare_image(0x2000_0000, width, height, D24S8)
        .expect("Image too large")
        .with_lrz(LrzLayout {
            device_va: 0x3000_0000,
            fast_clear_size: 512,
        })
        .key();

    Target {
        pool,
        color,
        depth,
        width,
        height,
    }
}

/// One subpass rendering to a color attachment 0 and a depth attachment 1.
pub fn color_depth_pass(color_load: LoadOp, depth_load: LoadOp) -> Arc<RenderPassDesc> {
    Arc::new(RenderPassDesc::single(
        vec![
            AttachmentDesc::color(RGBA8, color_load, StoreOp::Store),
            AttachmentDesc::depth(D24S8, depth_load, StoreOp::Store),
        ],
        SubpassDesc::with_color([0]).with_depth_stencil(1),
    ))
}

pub fn framebuffer(target: &Target) -> Arc<Framebuffer> {
    Arc::new(Framebuffer {
        width: target.width,
        height: target.height,
        layers: 1,
        attachments: vec![target.color, target.depth],
    })
}

pub fn begin(target: &Target, pass: Arc<RenderPassDesc>) -> RenderPassBegin {
    RenderPassBegin {
        pass,
        framebuffer: framebuffer(target),
        render_area: Rectangle::with_width_height(target.width, target.height),
        clear_values: vec![
            ClearValue::Color([0.0; 4]),
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
        ],
    }
}

pub fn depth_test(compare: CompareOp) -> DepthStencilState {
    DepthStencilState {
        depth_test: true,
        depth_write: true,
        compare,
        ..DepthStencilState::default()
    }
}

pub fn triangles(count: u32) -> Draw {
    Draw {
        vertex_count: 3 * count,
        instance_count: 1,
        ..Draw::default()
    }
}

/// Record a cleared color/depth pass with a number of draws.
pub fn record_pass(caps: Capabilities, target: &Target, draws: u32) -> Recording {
    let mut commands = CommandBuffer::new(caps);
    commands.begin_render_pass(
        &target.pool,
        begin(target, color_depth_pass(LoadOp::Clear, LoadOp::Clear)),
    );

    commands.set_depth_stencil(depth_test(CompareOp::LessOrEqual));
    for _ in 0..draws {
        commands.draw(triangles(1));
    }

    commands.end_render_pass();
    commands.finish().expect("Recording failed")
}

pub fn replay(recording: &Recording) -> Trace {
    Replay::new(recording).run().expect("Replay failed")
}

pub fn is_draw(low: &Low) -> bool {
    matches!(low, Low::Draw(_))
}
