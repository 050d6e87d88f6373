//! Replay a recording in software.
//!
//! This walks the streams of a [`Recording`] the way the command processor would: it follows
//! calls into other streams, skips conditionally executed blocks whose predicate does not hold
//! and applies writes to recording memory. What remains is the flat sequence of instructions
//! the hardware would have performed, which is what all ordering properties are stated over.
use crate::command::Rectangle;
use crate::patch::read_scissor;
use crate::program::{Low, Marker, Predicate, Recording, StreamRef};

/// Upper bound on nested calls, the hardware only supports a few levels of indirection.
const MAX_CALL_DEPTH: usize = 8;

/// Decides whether a tile saw geometry during binning, by pipe and slot.
pub type VisibilityFn<'rec> = dyn Fn(u32, u32) -> bool + 'rec;

/// A software replay of a recording.
pub struct Replay<'rec> {
    recording: &'rec Recording,
    visibility: Box<VisibilityFn<'rec>>,
}

/// The effect of replaying a recording.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    /// Executed instructions, without calls and conditional blocks.
    pub executed: Vec<Low>,
    /// Every scissor loaded from recording memory, per view, in order.
    pub scissors: Vec<Rectangle>,
    /// Recording memory after all writes.
    pub binary_data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
#[error("replay failed with {kind:?} at instruction {instruction_pointer} of stream {stream}")]
pub struct ReplayError {
    pub kind: ReplayErrorKind,
    pub stream: usize,
    pub instruction_pointer: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayErrorKind {
    NoSuchStream,
    /// A conditional block has no end.
    UnbalancedCondition,
    /// A memory access outside of recording memory.
    BadMemoryAccess,
    CallDepth,
}

struct Frame<'rec> {
    stream: usize,
    instructions: &'rec [Low],
    instruction_pointer: usize,
}

/// The render mode, as selected by the last marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Direct,
    Bypass,
    Binning,
    Gmem,
}

struct Machine<'rec> {
    frames: Vec<Frame<'rec>>,
    mode: Mode,
    all_visible: bool,
    /// The result of the last visibility test.
    visible: bool,
    trace: Trace,
}

impl<'rec> Replay<'rec> {
    /// Replay with every tile visible.
    pub fn new(recording: &'rec Recording) -> Self {
        Replay {
            recording,
            visibility: Box::new(|_, _| true),
        }
    }

    /// Decide per tile whether it saw geometry during binning.
    #[must_use]
    pub fn with_visibility(self, visibility: impl Fn(u32, u32) -> bool + 'rec) -> Self {
        Replay {
            visibility: Box::new(visibility),
            ..self
        }
    }

    pub fn run(&self) -> Result<Trace, ReplayError> {
        let mut machine = Machine {
            frames: vec![Frame {
                stream: 0,
                instructions: self.recording.entry(),
                instruction_pointer: 0,
            }],
            mode: Mode::Direct,
            all_visible: false,
            visible: true,
            trace: Trace {
                binary_data: self.recording.binary_data().to_vec(),
                ..Trace::default()
            },
        };

        while let Some(frame) = machine.frames.last() {
            let (stream, instruction_pointer) = (frame.stream, frame.instruction_pointer);

            if let Err(kind) = self.step(&mut machine) {
                return Err(ReplayError {
                    kind,
                    stream,
                    instruction_pointer,
                });
            }
        }

        Ok(machine.trace)
    }

    fn step(&self, machine: &mut Machine<'rec>) -> Result<(), ReplayErrorKind> {
        let Some(frame) = machine.frames.last_mut() else {
            return Ok(());
        };

        let instructions = frame.instructions;
        let Some(low) = instructions.get(frame.instruction_pointer) else {
            machine.frames.pop();
            return Ok(());
        };

        frame.instruction_pointer += 1;

        match low {
            &Low::Call(StreamRef(idx)) => {
                if machine.frames.len() >= MAX_CALL_DEPTH {
                    return Err(ReplayErrorKind::CallDepth);
                }

                let instructions = self
                    .recording
                    .stream(StreamRef(idx))
                    .ok_or(ReplayErrorKind::NoSuchStream)?;

                machine.frames.push(Frame {
                    stream: idx,
                    instructions,
                    instruction_pointer: 0,
                });

                return Ok(());
            }
            Low::CondExec(predicate) => {
                if !machine.holds(*predicate) {
                    if let Some(frame) = machine.frames.last_mut() {
                        frame.skip_block()?;
                    }
                }

                return Ok(());
            }
            Low::EndCondExec => return Ok(()),
            Low::Marker(marker) => {
                machine.mode = match marker {
                    Marker::Bypass => Mode::Bypass,
                    Marker::Binning => Mode::Binning,
                    Marker::Gmem => Mode::Gmem,
                    Marker::EndVisibility | Marker::Resolve => machine.mode,
                };
            }
            Low::MarkAllVisible { .. } => machine.all_visible = true,
            &Low::TestVisibility { pipe, slot } => {
                machine.visible = machine.all_visible || (self.visibility)(pipe, slot);
            }
            Low::MemWrite { offset, data } => {
                let target = offset
                    .checked_add(data.len())
                    .and_then(|end| machine.trace.binary_data.get_mut(*offset..end))
                    .ok_or(ReplayErrorKind::BadMemoryAccess)?;
                target.copy_from_slice(data);
            }
            &Low::LoadScissor { offset, views } => {
                for view in 0..views as usize {
                    let scissor = machine
                        .trace
                        .binary_data
                        .get(offset + 16 * view..)
                        .and_then(read_scissor)
                        .ok_or(ReplayErrorKind::BadMemoryAccess)?;
                    machine.trace.scissors.push(scissor);
                }
            }
            _ => {}
        }

        machine.trace.executed.push(low.clone());
        Ok(())
    }
}

impl Machine<'_> {
    fn holds(&self, predicate: Predicate) -> bool {
        match predicate {
            Predicate::Sysmem => self.mode == Mode::Bypass,
            Predicate::Gmem => self.mode == Mode::Gmem,
            Predicate::Visible => self.visible,
        }
    }
}

impl Frame<'_> {
    /// Move past the `EndCondExec` matching the block just entered.
    fn skip_block(&mut self) -> Result<(), ReplayErrorKind> {
        let mut depth = 1u32;

        while let Some(low) = self.instructions.get(self.instruction_pointer) {
            self.instruction_pointer += 1;

            match low {
                Low::CondExec(_) => depth += 1,
                Low::EndCondExec => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        Err(ReplayErrorKind::UnbalancedCondition)
    }
}

impl Trace {
    /// The number of executed instructions matching a predicate.
    pub fn count(&self, pred: impl Fn(&Low) -> bool) -> usize {
        self.executed.iter().filter(|low| pred(low)).count()
    }

    /// The index of the first executed instruction matching a predicate.
    pub fn position(&self, pred: impl Fn(&Low) -> bool) -> Option<usize> {
        self.executed.iter().position(pred)
    }
}
