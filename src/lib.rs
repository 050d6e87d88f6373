//! ## Quick guide
//!
//! 1. Describe the device with [`device::Capabilities`]
//! 2. Declare the images and buffers in a [`pool::ResourcePool`]
//! 3. Record commands and render passes into a [`command::CommandBuffer`]
//! 4. Finish it into a [`program::Recording`]
//! 5. Encode the instructions of the recording for the hardware, or replay them with
//!    [`run::Replay`] to inspect what would execute
//!
//! The crate decides the policy of the recording: which flushes are needed between two
//! commands, whether a render pass is rendered tile by tile, and when the hierarchical depth
//! buffer can be trusted. The binary encoding of each instruction is up to the consumer.
pub mod autotune;
pub mod cache;
pub mod command;
pub mod device;
pub mod lrz;
pub mod pass;
mod patch;
pub mod pool;
pub mod program;
pub mod run;
pub mod tiling;
mod util;

pub use command::CommandBuffer;
pub use program::{RecordError, Recording};
