//! Validity of the hierarchical depth buffer.
//!
//! The low resolution depth buffer (LRZ) rejects hidden geometry before it is rasterized. It
//! only stays conservative while every depth write of the pass moves in the same direction and
//! no side effect happens before the depth test. We track both while recording and give up on
//! the buffer for the rest of the pass as soon as either can not be guaranteed.
use crate::command::{CompareOp, DepthStencilState};
use crate::device::{Capabilities, DebugFlags};
use crate::program::{Event, Low, LrzCommand};
use crate::util::ExtendOne;

/// The direction depth values move in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LrzDirection {
    LessEqual,
    GreaterEqual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LrzInvalidReason {
    NoDepthAttachment,
    /// The depth image was created without a buffer.
    NoLrzBuffer,
    /// The depth attachment is neither cleared nor loaded with tracked contents.
    NotCleared,
    LoadedWithoutTracking,
    DirectionChanged,
    /// A depth compare operation without a direction, while depth is written.
    CompareOp,
    BlendReadsDest,
    EarlyStencilWrite,
    DepthAttachmentChanged,
    SecondaryCommandBuffer,
    InvalidatedBySecondary,
    SuspendedWithoutTracking,
    DepthClearedInRenderPass,
    DebugDisabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LrzStatus {
    Invalid(LrzInvalidReason),
    ValidUnknownDirection,
    ValidDirection(LrzDirection),
}

/// How a pass starts out with its depth attachment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrzLoad {
    Clear(f32),
    Load,
    DontCare,
}

/// The depth attachment of a pass, as far as the buffer is concerned.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LrzAttachment {
    pub attachment: usize,
    /// The image has a buffer at all.
    pub has_buffer: bool,
    /// The buffer has fast-clear metadata.
    pub has_fast_clear: bool,
    pub load: LrzLoad,
}

/// The per-draw control of the buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LrzDraw {
    /// Test against the buffer.
    pub enable: bool,
    /// Update the buffer.
    pub write: bool,
    pub direction: Option<LrzDirection>,
    /// The GPU records that the buffer can not be trusted from now on.
    pub invalidate_on_gpu: bool,
    pub fast_clear: bool,
}

/// The state of the buffer for one render pass.
#[derive(Clone, Debug, PartialEq)]
pub struct LrzState {
    status: LrzStatus,
    fast_clear: bool,
    gpu_dir_tracking: bool,
    depth_attachment: Option<usize>,
    has_buffer: bool,
    /// The clear at the start of the pass, if any.
    clear: Option<f32>,
    /// The control of the last draw, to avoid emitting it again.
    prev: Option<LrzDraw>,
}

impl LrzStatus {
    pub fn is_valid(self) -> bool {
        !matches!(self, LrzStatus::Invalid(_))
    }
}

impl CompareOp {
    /// The direction of depth values that pass this test.
    pub fn direction(self) -> Option<LrzDirection> {
        match self {
            CompareOp::Less | CompareOp::LessOrEqual => Some(LrzDirection::LessEqual),
            CompareOp::Greater | CompareOp::GreaterOrEqual => Some(LrzDirection::GreaterEqual),
            CompareOp::Never | CompareOp::Equal | CompareOp::NotEqual | CompareOp::Always => None,
        }
    }
}

impl LrzDraw {
    const DISABLED: LrzDraw = LrzDraw {
        enable: false,
        write: false,
        direction: None,
        invalidate_on_gpu: false,
        fast_clear: false,
    };
}

impl LrzState {
    /// The state outside of any pass.
    pub fn new(caps: &Capabilities) -> Self {
        LrzState {
            status: LrzStatus::Invalid(LrzInvalidReason::NoDepthAttachment),
            fast_clear: false,
            gpu_dir_tracking: caps.has_lrz_dir_tracking,
            depth_attachment: None,
            has_buffer: false,
            clear: None,
            prev: None,
        }
    }

    pub fn status(&self) -> LrzStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }

    pub fn fast_clear(&self) -> bool {
        self.fast_clear
    }

    pub fn depth_attachment(&self) -> Option<usize> {
        self.depth_attachment
    }

    /// Forget the pass.
    pub fn reset(&mut self, caps: &Capabilities) {
        *self = LrzState::new(caps);
    }

    /// Give up on the buffer for the rest of the pass. The first reason sticks.
    pub fn invalidate(&mut self, reason: LrzInvalidReason) {
        if let LrzStatus::Invalid(_) = self.status {
            return;
        }

        log::debug!("LRZ invalidated: {:?}", reason);
        self.status = LrzStatus::Invalid(reason);
    }

    /// Start a render pass with the given depth attachment.
    pub fn begin_pass(&mut self, caps: &Capabilities, depth: Option<LrzAttachment>) {
        self.reset(caps);

        let Some(depth) = depth else {
            return;
        };

        self.depth_attachment = Some(depth.attachment);
        self.has_buffer = depth.has_buffer;

        self.status = if caps.debug.contains(DebugFlags::NO_LRZ) {
            LrzStatus::Invalid(LrzInvalidReason::DebugDisabled)
        } else if !depth.has_buffer {
            LrzStatus::Invalid(LrzInvalidReason::NoLrzBuffer)
        } else {
            match depth.load {
                LrzLoad::Clear(value) => {
                    self.clear = Some(value);
                    // Fast clear metadata only encodes the two extreme depths.
                    self.fast_clear = depth.has_fast_clear
                        && caps.has_lrz_fast_clear
                        && (value == 0.0 || value == 1.0);
                    LrzStatus::ValidUnknownDirection
                }
                // Only the GPU knows the direction the stored contents were written with.
                _ if self.gpu_dir_tracking => LrzStatus::ValidUnknownDirection,
                LrzLoad::Load => LrzStatus::Invalid(LrzInvalidReason::LoadedWithoutTracking),
                LrzLoad::DontCare => LrzStatus::Invalid(LrzInvalidReason::NotCleared),
            }
        };

        log::trace!("LRZ at pass begin: {:?}", self.status);
    }

    /// Start a secondary recording that continues a pass we can not see.
    pub fn begin_secondary(&mut self, caps: &Capabilities, depth_attachment: Option<usize>) {
        self.reset(caps);
        self.depth_attachment = depth_attachment;

        if depth_attachment.is_none() {
            return;
        }

        // Optimistic, the GPU itself checks that the directions agree.
        self.status = if caps.debug.contains(DebugFlags::NO_LRZ) {
            LrzStatus::Invalid(LrzInvalidReason::DebugDisabled)
        } else if self.gpu_dir_tracking {
            self.has_buffer = true;
            LrzStatus::ValidUnknownDirection
        } else {
            LrzStatus::Invalid(LrzInvalidReason::SecondaryCommandBuffer)
        };
    }

    /// Account for a secondary recording executed within the pass.
    pub fn execute_secondary(&mut self, invalidated: bool) {
        if !self.gpu_dir_tracking {
            self.invalidate(LrzInvalidReason::SecondaryCommandBuffer);
        } else if invalidated {
            self.invalidate(LrzInvalidReason::InvalidatedBySecondary);
        } else if self.is_valid() {
            // The secondary may have written in either direction.
            self.status = LrzStatus::ValidUnknownDirection;
        }

        self.prev = None;
    }

    /// Move to a subpass that uses `depth_attachment`.
    pub fn next_subpass(&mut self, depth_attachment: Option<usize>) {
        if depth_attachment != self.depth_attachment {
            self.invalidate(LrzInvalidReason::DepthAttachmentChanged);
        }
    }

    /// The depth attachment was cleared by a draw-time clear.
    pub fn depth_cleared(&mut self) {
        self.invalidate(LrzInvalidReason::DepthClearedInRenderPass);
    }

    /// Split the pass, the state continues in another recording.
    pub fn suspend(&mut self) -> LrzState {
        if !self.gpu_dir_tracking {
            self.invalidate(LrzInvalidReason::SuspendedWithoutTracking);
        }

        self.clone()
    }

    /// Continue a pass that was suspended.
    pub fn resume(&mut self, saved: LrzState) {
        *self = LrzState { prev: None, ..saved };
    }

    /// Decide how a draw may use the buffer, updating the state of the pass.
    pub fn evaluate(&mut self, ds: &DepthStencilState, blend_reads_dest: bool) -> LrzDraw {
        if !self.is_valid() || !ds.depth_test {
            return LrzDraw::DISABLED;
        }

        let write = ds.depth_write;

        // Side effects of a rejected fragment would be lost.
        if write && blend_reads_dest {
            return self.suppress_or_invalidate(LrzInvalidReason::BlendReadsDest);
        }

        if ds.stencil.test && ds.stencil.writes_before_depth {
            return self.suppress_or_invalidate(LrzInvalidReason::EarlyStencilWrite);
        }

        let Some(direction) = ds.compare.direction() else {
            if write {
                return self.suppress_or_invalidate(LrzInvalidReason::CompareOp);
            }

            return LrzDraw::DISABLED;
        };

        match self.status {
            LrzStatus::ValidUnknownDirection if write => {
                self.status = LrzStatus::ValidDirection(direction);
            }
            LrzStatus::ValidDirection(prev) if prev != direction => {
                if !write {
                    return LrzDraw::DISABLED;
                }

                self.invalidate(LrzInvalidReason::DirectionChanged);
                return LrzDraw {
                    invalidate_on_gpu: self.gpu_dir_tracking,
                    ..LrzDraw::DISABLED
                };
            }
            _ => {}
        }

        LrzDraw {
            enable: true,
            write,
            direction: Some(direction),
            invalidate_on_gpu: false,
            fast_clear: self.fast_clear,
        }
    }

    /// Skip the buffer for one draw when the GPU tracks validity itself, otherwise for good.
    fn suppress_or_invalidate(&mut self, reason: LrzInvalidReason) -> LrzDraw {
        if self.gpu_dir_tracking {
            log::trace!("LRZ disabled for draw: {:?}", reason);
            return LrzDraw::DISABLED;
        }

        self.invalidate(reason);
        LrzDraw::DISABLED
    }

    /// The control to emit for a draw, if it differs from the last one.
    pub fn changed(&mut self, draw: LrzDraw) -> Option<LrzDraw> {
        if self.prev == Some(draw) {
            return None;
        }

        self.prev = Some(draw);
        Some(draw)
    }

    /// Bind the buffer at the start of rendering the pass.
    ///
    /// This is emitted after all draws were recorded. A pass that ended up invalid does not
    /// use the buffer at all, not even for the draws before the invalidation.
    pub(crate) fn emit_begin(&self, out: &mut dyn ExtendOne<Low>) {
        let Some(attachment) = self.depth_attachment.filter(|_| self.is_valid()) else {
            out.extend_one(Low::Lrz(LrzCommand::Buffer(None)));
            return;
        };

        out.extend_one(Low::Lrz(LrzCommand::Buffer(Some(attachment))));

        if let Some(depth) = self.clear {
            out.extend_one(Low::Lrz(LrzCommand::Clear {
                fast: self.fast_clear,
                depth,
            }));
        }
    }

    /// Finish rendering the pass.
    pub(crate) fn emit_end(&self, out: &mut dyn ExtendOne<Low>) {
        if self.is_valid() && self.depth_attachment.is_some() {
            out.extend_one(Low::Event(Event::LrzFlush));
        } else if self.gpu_dir_tracking && self.has_buffer {
            // Later passes loading the depth attachment must not trust the buffer.
            out.extend_one(Low::Lrz(LrzCommand::MarkInvalid));
        }
    }
}
