//! Commands whose contents depend on the tile they are replayed for.
//!
//! Such commands read their operands from recording memory. While recording we remember where
//! and how to compute them; the tile loop then writes the operands for each tile before replaying
//! the commands.
use std::sync::Arc;

use crate::command::Rectangle;
use crate::program::{Low, Relocation};

/// Computes the bytes of one view for a tile.
pub(crate) type PatchFn = dyn Fn(Rectangle, u32) -> Vec<u8> + Send + Sync;

/// A deferred write into recording memory.
#[derive(Clone)]
pub(crate) struct PatchPoint {
    /// Byte offset in recording memory.
    pub(crate) offset: usize,
    /// Number of views, each gets its own bytes appended in order.
    pub(crate) views: u32,
    pub(crate) apply: Arc<PatchFn>,
}

impl PatchPoint {
    pub(crate) fn new(offset: usize, views: u32, apply: Arc<PatchFn>) -> Self {
        PatchPoint {
            offset,
            views,
            apply,
        }
    }

    /// The write performed for a tile.
    pub(crate) fn resolve(&self, tile: Rectangle) -> Low {
        let mut data = vec![];
        for view in 0..self.views {
            data.extend((self.apply)(tile, view));
        }

        Low::MemWrite {
            offset: self.offset,
            data,
        }
    }

    #[must_use]
    pub(crate) fn relocate(&self, data: Relocation) -> Self {
        PatchPoint {
            offset: data.apply(self.offset),
            ..self.clone()
        }
    }
}

impl core::fmt::Debug for PatchPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PatchPoint")
            .field("offset", &self.offset)
            .field("views", &self.views)
            .finish_non_exhaustive()
    }
}

/// The bytes of a scissor rectangle in recording memory.
pub(crate) fn scissor_bytes(rect: Rectangle) -> Vec<u8> {
    let words: [u32; 4] = [rect.x, rect.y, rect.max_x, rect.max_y];
    bytemuck::cast_slice(&words).to_vec()
}

/// Read back a scissor written by [`scissor_bytes`].
pub(crate) fn read_scissor(data: &[u8]) -> Option<Rectangle> {
    let bytes = data.get(..16)?;
    let [x, y, max_x, max_y]: [u32; 4] = bytemuck::pod_read_unaligned(bytes);
    Some(Rectangle { x, y, max_x, max_y })
}

/// The patch of a scissor: restricted to the tile it is replayed for.
pub(crate) fn tile_scissor(scissor: Rectangle) -> Arc<PatchFn> {
    Arc::new(move |tile: Rectangle, _view: u32| scissor_bytes(scissor.meet(tile)))
}
