//! Render pass descriptions.
//!
//! A description is created once and shared by every recording that begins it. The per-recording
//! state of each attachment, such as its place in tile memory, is derived when a pass begins.
use crate::cache::access::{AccessFlags, PipelineStages};
use crate::command::Rectangle;
use crate::device::{Aspects, FormatInfo};
use crate::pool::ResourceKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// One attachment of a render pass.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentDesc {
    pub format: FormatInfo,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
}

/// A dependency at the boundary of a subpass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubpassBarrier {
    pub src_access: AccessFlags,
    pub src_stages: PipelineStages,
    pub dst_access: AccessFlags,
    pub dst_stages: PipelineStages,
    /// Attachments of the previous subpass were written with a different view of the same
    /// color memory.
    pub incoherent_color: bool,
    pub incoherent_depth: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubpassDesc {
    pub color: Vec<Option<usize>>,
    /// Resolve targets, one per color attachment.
    pub resolve: Vec<Option<usize>>,
    pub depth_stencil: Option<usize>,
    pub input: Vec<usize>,
    /// A shader samples an attachment this subpass renders to.
    pub feedback_loop: bool,
    /// Dependency on everything before the subpass.
    pub start_barrier: SubpassBarrier,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
    /// Dependency of everything after the pass on the pass.
    pub end_barrier: SubpassBarrier,
    /// Number of views rendered by every draw.
    pub view_count: u32,
}

/// The images bound to the attachments of a pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub attachments: Vec<ResourceKey>,
}

/// How a pass uses one attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentUsage {
    /// The attachment is rendered to or read as input, and thus lives in tile memory.
    pub gmem: bool,
    pub first_subpass: Option<usize>,
    /// The attachment is the resolve target of some subpass.
    pub resolve_target: bool,
}

impl AttachmentDesc {
    /// A single sampled color attachment.
    pub fn color(format: FormatInfo, load_op: LoadOp, store_op: StoreOp) -> Self {
        AttachmentDesc {
            format,
            samples: 1,
            load_op,
            store_op,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
        }
    }

    /// A single sampled depth/stencil attachment, treating stencil like depth.
    pub fn depth(format: FormatInfo, load_op: LoadOp, store_op: StoreOp) -> Self {
        let has_stencil = format.has_stencil();
        AttachmentDesc {
            format,
            samples: 1,
            load_op,
            store_op,
            stencil_load_op: if has_stencil { load_op } else { LoadOp::DontCare },
            stencil_store_op: if has_stencil { store_op } else { StoreOp::DontCare },
        }
    }

    #[must_use]
    pub fn with_samples(self, samples: u32) -> Self {
        AttachmentDesc { samples, ..self }
    }

    /// Bytes per pixel in tile memory of the main plane.
    pub fn cpp(&self) -> u32 {
        self.format.block_size * self.samples
    }

    /// Bytes per pixel in tile memory of a separate stencil plane.
    pub fn stencil_cpp(&self) -> u32 {
        if self.format.separate_stencil {
            self.samples
        } else {
            0
        }
    }

    /// The aspects cleared by the load operations.
    pub fn clear_aspects(&self) -> Aspects {
        let mut aspects = Aspects::empty();

        if self.load_op == LoadOp::Clear {
            aspects |= self.format.aspects - Aspects::STENCIL;
        }

        if self.format.has_stencil() && self.stencil_load_op == LoadOp::Clear {
            aspects |= Aspects::STENCIL;
        }

        aspects
    }

    /// The aspects loaded from memory.
    pub fn load_aspects(&self) -> Aspects {
        let mut aspects = Aspects::empty();

        if self.load_op == LoadOp::Load {
            aspects |= self.format.aspects - Aspects::STENCIL;
        }

        if self.format.has_stencil() && self.stencil_load_op == LoadOp::Load {
            aspects |= Aspects::STENCIL;
        }

        aspects
    }

    /// The aspects stored back to memory.
    pub fn store_aspects(&self) -> Aspects {
        let mut aspects = Aspects::empty();

        if self.store_op == StoreOp::Store {
            aspects |= self.format.aspects - Aspects::STENCIL;
        }

        if self.format.has_stencil() && self.stencil_store_op == StoreOp::Store {
            aspects |= Aspects::STENCIL;
        }

        aspects
    }
}

impl SubpassDesc {
    /// A subpass rendering to the given color attachments.
    pub fn with_color(color: impl IntoIterator<Item = usize>) -> Self {
        SubpassDesc {
            color: color.into_iter().map(Some).collect(),
            ..SubpassDesc::default()
        }
    }

    #[must_use]
    pub fn with_depth_stencil(self, attachment: usize) -> Self {
        SubpassDesc {
            depth_stencil: Some(attachment),
            ..self
        }
    }

    #[must_use]
    pub fn with_resolve(self, resolve: impl IntoIterator<Item = Option<usize>>) -> Self {
        SubpassDesc {
            resolve: resolve.into_iter().collect(),
            ..self
        }
    }

    /// Attachments rendered to or read by this subpass, resolve targets excluded.
    pub fn used_attachments(&self) -> impl Iterator<Item = usize> + '_ {
        self.color
            .iter()
            .flatten()
            .copied()
            .chain(self.depth_stencil)
            .chain(self.input.iter().copied())
    }

    /// Pairs of resolve source and target.
    pub fn resolves(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.color
            .iter()
            .zip(&self.resolve)
            .filter_map(|(src, dst)| Some(((*src)?, (*dst)?)))
    }
}

impl RenderPassDesc {
    /// A pass with a single subpass.
    pub fn single(attachments: Vec<AttachmentDesc>, subpass: SubpassDesc) -> Self {
        RenderPassDesc {
            attachments,
            subpasses: vec![subpass],
            end_barrier: SubpassBarrier::default(),
            view_count: 1,
        }
    }

    /// Derive how each attachment is used across the subpasses.
    pub fn usage(&self) -> Vec<AttachmentUsage> {
        let mut usage = vec![
            AttachmentUsage {
                gmem: false,
                first_subpass: None,
                resolve_target: false,
            };
            self.attachments.len()
        ];

        for (idx, subpass) in self.subpasses.iter().enumerate() {
            for attachment in subpass.used_attachments() {
                let Some(entry) = usage.get_mut(attachment) else {
                    continue;
                };

                entry.gmem = true;
                entry.first_subpass.get_or_insert(idx);
            }

            for (_, dst) in subpass.resolves() {
                if let Some(entry) = usage.get_mut(dst) {
                    entry.resolve_target = true;
                    entry.first_subpass.get_or_insert(idx);
                }
            }
        }

        usage
    }
}

impl Framebuffer {
    /// The whole framebuffer as a rectangle.
    pub fn rect(&self) -> Rectangle {
        Rectangle::with_width_height(self.width, self.height)
    }
}

impl ClearValue {
    pub fn depth(&self) -> Option<f32> {
        match self {
            ClearValue::DepthStencil { depth, .. } => Some(*depth),
            ClearValue::Color(_) => None,
        }
    }
}
