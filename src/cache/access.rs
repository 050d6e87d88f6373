//! Classify API level accesses into the cache domains they go through.
use bitflags::bitflags;

use super::{AccessMask, Stage};
use crate::program::BlitKind;

bitflags! {
    /// Kinds of memory access, as named by the recording API.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const INPUT_ATTACHMENT_READ = 1 << 4;
        const SHADER_READ = 1 << 5;
        const SHADER_WRITE = 1 << 6;
        const COLOR_ATTACHMENT_READ = 1 << 7;
        const COLOR_ATTACHMENT_WRITE = 1 << 8;
        const DEPTH_STENCIL_ATTACHMENT_READ = 1 << 9;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 10;
        const TRANSFER_READ = 1 << 11;
        const TRANSFER_WRITE = 1 << 12;
        const HOST_READ = 1 << 13;
        const HOST_WRITE = 1 << 14;
        const MEMORY_READ = 1 << 15;
        const MEMORY_WRITE = 1 << 16;
        const DESCRIPTOR_BUFFER_READ = 1 << 17;
        const CONDITIONAL_RENDERING_READ = 1 << 18;
        const TRANSFORM_FEEDBACK_WRITE = 1 << 19;
        const TRANSFORM_FEEDBACK_COUNTER_READ = 1 << 20;
        const TRANSFORM_FEEDBACK_COUNTER_WRITE = 1 << 21;
    }
}

bitflags! {
    /// Pipeline stages, as named by the recording API.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const TESSELLATION_SHADER = 1 << 4;
        const GEOMETRY_SHADER = 1 << 5;
        const FRAGMENT_SHADER = 1 << 6;
        const EARLY_FRAGMENT_TESTS = 1 << 7;
        const LATE_FRAGMENT_TESTS = 1 << 8;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 9;
        const COMPUTE_SHADER = 1 << 10;
        const TRANSFER = 1 << 11;
        const BOTTOM_OF_PIPE = 1 << 12;
        const HOST = 1 << 13;
        const CONDITIONAL_RENDERING = 1 << 14;
        const TRANSFORM_FEEDBACK = 1 << 15;
        const ALL_GRAPHICS = 1 << 16;
        const ALL_COMMANDS = 1 << 17;

        const SHADERS = Self::VERTEX_SHADER.bits()
            | Self::TESSELLATION_SHADER.bits()
            | Self::GEOMETRY_SHADER.bits()
            | Self::FRAGMENT_SHADER.bits()
            | Self::COMPUTE_SHADER.bits();
        /// Stages that only ever touch the pixel they execute for.
        const FRAMEBUFFER_SPACE = Self::FRAGMENT_SHADER.bits()
            | Self::EARLY_FRAGMENT_TESTS.bits()
            | Self::LATE_FRAGMENT_TESTS.bits()
            | Self::COLOR_ATTACHMENT_OUTPUT.bits();
        const GRAPHICS = Self::DRAW_INDIRECT.bits()
            | Self::VERTEX_INPUT.bits()
            | Self::VERTEX_SHADER.bits()
            | Self::TESSELLATION_SHADER.bits()
            | Self::GEOMETRY_SHADER.bits()
            | Self::FRAGMENT_SHADER.bits()
            | Self::EARLY_FRAGMENT_TESTS.bits()
            | Self::LATE_FRAGMENT_TESTS.bits()
            | Self::COLOR_ATTACHMENT_OUTPUT.bits()
            | Self::CONDITIONAL_RENDERING.bits()
            | Self::TRANSFORM_FEEDBACK.bits();
    }
}

/// The static cache footprint of an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Footprint {
    pub reads: AccessMask,
    pub writes: AccessMask,
}

impl Footprint {
    /// The same footprint, with its color and depth cache writes aliasing differently than
    /// other writes to the memory.
    pub fn incoherent(self) -> Footprint {
        let mut writes = self.writes;

        if writes.contains(AccessMask::COLOR_CCU_WRITE) {
            writes.remove(AccessMask::COLOR_CCU_WRITE);
            writes.insert(AccessMask::COLOR_CCU_INCOHERENT_WRITE);
        }

        if writes.contains(AccessMask::DEPTH_CCU_WRITE) {
            writes.remove(AccessMask::DEPTH_CCU_WRITE);
            writes.insert(AccessMask::DEPTH_CCU_INCOHERENT_WRITE);
        }

        Footprint { writes, ..self }
    }
}

/// What a blit operation writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Buffer,
    ColorImage,
    DepthImage,
}

/// Whether any stage of `stages` may perform `access`.
fn performs(
    access: AccessFlags,
    stages: PipelineStages,
    kinds: AccessFlags,
    generic: AccessFlags,
    in_stages: PipelineStages,
) -> bool {
    access.intersects(kinds | generic) && stages.intersects(in_stages)
}

fn reads(access: AccessFlags, stages: PipelineStages, kinds: AccessFlags, in_stages: PipelineStages) -> bool {
    performs(access, stages, kinds, AccessFlags::MEMORY_READ, in_stages)
}

fn writes(access: AccessFlags, stages: PipelineStages, kinds: AccessFlags, in_stages: PipelineStages) -> bool {
    performs(access, stages, kinds, AccessFlags::MEMORY_WRITE, in_stages)
}

/// Replace the catch-all stages by the stages they stand for.
pub fn expand(stages: PipelineStages) -> PipelineStages {
    let mut expanded = stages;

    if stages.contains(PipelineStages::ALL_COMMANDS) {
        expanded |= PipelineStages::all();
    }

    if stages.contains(PipelineStages::ALL_GRAPHICS) {
        expanded |= PipelineStages::GRAPHICS;
    }

    expanded
}

/// Map an access to the caches it goes through.
///
/// `image_only` declares that transfer writes only target images, which are always written
/// through the color cache the same way. `gmem` declares that attachments are resolved through
/// tile memory: then the caches are bypassed and the attachment is read and written in memory.
pub fn classify(access: AccessFlags, stages: PipelineStages, image_only: bool, gmem: bool) -> AccessMask {
    let stages = expand(stages);
    let mut mask = AccessMask::empty();

    if reads(
        access,
        stages,
        AccessFlags::INDIRECT_COMMAND_READ
            | AccessFlags::CONDITIONAL_RENDERING_READ
            | AccessFlags::TRANSFORM_FEEDBACK_COUNTER_READ,
        PipelineStages::DRAW_INDIRECT
            | PipelineStages::CONDITIONAL_RENDERING
            | PipelineStages::TRANSFORM_FEEDBACK,
    ) {
        mask |= AccessMask::SYSMEM_READ;
    }

    if writes(
        access,
        stages,
        AccessFlags::TRANSFORM_FEEDBACK_COUNTER_WRITE,
        PipelineStages::TRANSFORM_FEEDBACK,
    ) {
        mask |= AccessMask::CP_WRITE;
    }

    if reads(access, stages, AccessFlags::HOST_READ, PipelineStages::HOST) {
        mask |= AccessMask::SYSMEM_READ;
    }

    if writes(access, stages, AccessFlags::HOST_WRITE, PipelineStages::HOST) {
        mask |= AccessMask::SYSMEM_WRITE;
    }

    if reads(
        access,
        stages,
        AccessFlags::INDEX_READ
            | AccessFlags::VERTEX_ATTRIBUTE_READ
            | AccessFlags::UNIFORM_READ
            | AccessFlags::INPUT_ATTACHMENT_READ
            | AccessFlags::SHADER_READ,
        PipelineStages::VERTEX_INPUT | PipelineStages::SHADERS,
    ) {
        mask |= AccessMask::UNIFIED_READ;
    }

    if reads(
        access,
        stages,
        AccessFlags::DESCRIPTOR_BUFFER_READ,
        PipelineStages::SHADERS,
    ) {
        mask |= AccessMask::UNIFIED_READ | AccessMask::BINDLESS_DESCRIPTOR_READ;
    }

    if writes(
        access,
        stages,
        AccessFlags::SHADER_WRITE,
        PipelineStages::SHADERS,
    ) || writes(
        access,
        stages,
        AccessFlags::TRANSFORM_FEEDBACK_WRITE,
        PipelineStages::TRANSFORM_FEEDBACK,
    ) {
        mask |= AccessMask::UNIFIED_WRITE;
    }

    if reads(
        access,
        stages,
        AccessFlags::COLOR_ATTACHMENT_READ,
        PipelineStages::COLOR_ATTACHMENT_OUTPUT,
    ) {
        mask |= if gmem {
            AccessMask::SYSMEM_READ
        } else {
            AccessMask::COLOR_CCU_INCOHERENT_READ
        };
    }

    if writes(
        access,
        stages,
        AccessFlags::COLOR_ATTACHMENT_WRITE,
        PipelineStages::COLOR_ATTACHMENT_OUTPUT,
    ) {
        mask |= if gmem {
            AccessMask::SYSMEM_WRITE
        } else {
            AccessMask::COLOR_CCU_INCOHERENT_WRITE
        };
    }

    let depth_tests = PipelineStages::EARLY_FRAGMENT_TESTS | PipelineStages::LATE_FRAGMENT_TESTS;

    if reads(
        access,
        stages,
        AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        depth_tests,
    ) {
        mask |= if gmem {
            AccessMask::SYSMEM_READ
        } else {
            AccessMask::DEPTH_CCU_INCOHERENT_READ
        };
    }

    if writes(
        access,
        stages,
        AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        depth_tests,
    ) {
        mask |= if gmem {
            AccessMask::SYSMEM_WRITE
        } else {
            AccessMask::DEPTH_CCU_INCOHERENT_WRITE
        };
    }

    if reads(access, stages, AccessFlags::TRANSFER_READ, PipelineStages::TRANSFER) {
        mask |= AccessMask::UNIFIED_READ;
    }

    if writes(access, stages, AccessFlags::TRANSFER_WRITE, PipelineStages::TRANSFER) {
        mask |= if gmem {
            AccessMask::SYSMEM_WRITE
        } else if image_only {
            AccessMask::COLOR_CCU_WRITE
        } else {
            AccessMask::COLOR_CCU_INCOHERENT_WRITE
        };
    }

    mask
}

fn stage_of(stage: PipelineStages, dst: bool) -> Stage {
    if stage == PipelineStages::DRAW_INDIRECT || stage == PipelineStages::CONDITIONAL_RENDERING {
        // Parsed by the command processor ahead of any draw.
        return Stage::Cp;
    }

    if stage == PipelineStages::ALL_GRAPHICS || stage == PipelineStages::ALL_COMMANDS {
        return if dst { Stage::Cp } else { Stage::Gpu };
    }

    if stage == PipelineStages::HOST {
        return if dst { Stage::Bottom } else { Stage::Cp };
    }

    Stage::Gpu
}

/// The stages a source scope waits for.
///
/// Nothing waits for the top of the pipe, while waiting for the bottom waits for everything.
pub fn sanitize_src(stages: PipelineStages) -> PipelineStages {
    if stages.contains(PipelineStages::BOTTOM_OF_PIPE) {
        return PipelineStages::ALL_COMMANDS;
    }

    stages - PipelineStages::TOP_OF_PIPE
}

/// The stages a destination scope blocks, the mirror image of [`sanitize_src`].
pub fn sanitize_dst(stages: PipelineStages) -> PipelineStages {
    if stages.contains(PipelineStages::TOP_OF_PIPE) {
        return PipelineStages::ALL_COMMANDS;
    }

    stages - PipelineStages::BOTTOM_OF_PIPE
}

/// The latest stage of the source scope.
pub fn src_stage(stages: PipelineStages) -> Stage {
    sanitize_src(stages)
        .iter()
        .map(|stage| stage_of(stage, false))
        .fold(Stage::Cp, Stage::max)
}

/// The earliest stage of the destination scope.
pub fn dst_stage(stages: PipelineStages) -> Stage {
    sanitize_dst(stages)
        .iter()
        .map(|stage| stage_of(stage, true))
        .fold(Stage::Bottom, Stage::min)
}

/// Whether every stage touches only the pixel it executes for.
pub fn is_framebuffer_space(stages: PipelineStages) -> bool {
    let stages = stages - (PipelineStages::TOP_OF_PIPE | PipelineStages::BOTTOM_OF_PIPE);
    !stages.is_empty() && PipelineStages::FRAMEBUFFER_SPACE.contains(stages)
}

/// Whether some stage may touch other pixels than the one it executes for.
///
/// Dependencies on such stages cannot be ordered per tile.
pub fn leaves_framebuffer_space(stages: PipelineStages) -> bool {
    let stages = stages - (PipelineStages::TOP_OF_PIPE | PipelineStages::BOTTOM_OF_PIPE);
    !PipelineStages::FRAMEBUFFER_SPACE.contains(stages)
}

/// The static footprint of a fixed-function operation.
pub fn footprint(kind: BlitKind, dst: Destination) -> Footprint {
    let target = match dst {
        Destination::ColorImage => AccessMask::COLOR_CCU_WRITE,
        Destination::DepthImage => AccessMask::DEPTH_CCU_WRITE,
        Destination::Buffer => AccessMask::COLOR_CCU_INCOHERENT_WRITE,
    };

    match kind {
        BlitKind::CopyBuffer
        | BlitKind::CopyImage
        | BlitKind::CopyBufferToImage
        | BlitKind::CopyImageToBuffer
        | BlitKind::BlitImage
        | BlitKind::ResolveImage => Footprint {
            reads: AccessMask::UNIFIED_READ,
            writes: target,
        },
        BlitKind::ClearColorImage | BlitKind::ClearDepthStencilImage => Footprint {
            reads: AccessMask::empty(),
            writes: target,
        },
        BlitKind::FillBuffer => Footprint {
            reads: AccessMask::empty(),
            writes: AccessMask::COLOR_CCU_INCOHERENT_WRITE,
        },
        BlitKind::UpdateBuffer => Footprint {
            reads: AccessMask::empty(),
            writes: AccessMask::CP_WRITE,
        },
    }
}

/// The static footprint of a compute dispatch.
pub fn dispatch_footprint(indirect: bool) -> Footprint {
    let mut reads = AccessMask::UNIFIED_READ;
    if indirect {
        reads |= AccessMask::SYSMEM_READ;
    }

    Footprint {
        reads,
        writes: AccessMask::UNIFIED_WRITE,
    }
}
