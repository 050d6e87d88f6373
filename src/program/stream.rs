//! Collect a stream of `Low` instructions while validating its structure.
use std::sync::Arc;

use crate::program::{Low, RecordError, StreamKind};

/// A stream of instructions under construction.
///
/// Failures do not interrupt recording. The first one is kept and every later instruction is
/// dropped, the failure is reported once the stream is finished.
pub(crate) struct CommandStream {
    instructions: Vec<Low>,
    kind: StreamKind,
    /// Upper bound on the number of instructions.
    limit: Option<usize>,

    // Additional validation properties.
    /// Nesting depth of conditional execution.
    cond_depth: u32,
    /// The first failure, sticky.
    error: Option<RecordError>,
}

impl CommandStream {
    pub(crate) fn new(kind: StreamKind, limit: Option<usize>) -> Self {
        CommandStream {
            instructions: vec![],
            kind,
            limit,
            cond_depth: 0,
            error: None,
        }
    }

    /// Append one instruction, remembering a failure instead of returning it.
    pub(crate) fn emit(&mut self, low: Low) {
        if self.error.is_some() {
            return;
        }

        if let Err(err) = self.push(low) {
            log::debug!("Recording into {:?} stream failed: {}", self.kind, err);
            self.error = Some(err);
        }
    }

    fn push(&mut self, low: Low) -> Result<(), RecordError> {
        match &low {
            Low::CondExec(_) => self.cond_depth += 1,
            Low::EndCondExec => {
                if self.cond_depth == 0 {
                    return Err(RecordError::Internal(line!()));
                }

                self.cond_depth -= 1;
            }
            _ => {}
        }

        if let Some(limit) = self.limit {
            if self.instructions.len() >= limit {
                return Err(RecordError::OutOfMemory(self.kind));
            }
        }

        self.instructions
            .try_reserve(1)
            .map_err(|_| RecordError::OutOfMemory(self.kind))?;
        self.instructions.push(low);

        Ok(())
    }

    /// Finish the stream, leaving an empty stream of the same kind.
    pub(crate) fn take(&mut self) -> Result<Arc<[Low]>, RecordError> {
        let fresh = CommandStream::new(self.kind, self.limit);
        let stream = core::mem::replace(self, fresh);

        if let Some(err) = stream.error {
            return Err(err);
        }

        if stream.cond_depth != 0 {
            return Err(RecordError::Internal(line!()));
        }

        Ok(stream.instructions.into())
    }
}

impl Extend<Low> for CommandStream {
    fn extend<T: IntoIterator<Item = Low>>(&mut self, iter: T) {
        for low in iter {
            self.emit(low);
        }
    }
}
