//! Software coherence for the caches of a tiler.
//!
//! None of the caches are coherent with each other or with memory. Each recording context keeps
//! a [`CacheState`] that remembers which flushes a later consumer may need and which are already
//! owed to the next command.
use bitflags::bitflags;

use crate::program::{Event, Low};
use crate::util::ExtendOne;

pub mod access;

/// A memory domain with its own flush and invalidate primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheDomain {
    SysMem,
    /// The L2-class cache shared by all shader stages.
    UnifiedCache,
    /// Front-end cache of the color read-modify-write path.
    ColorCcu,
    /// Front-end cache of the depth/stencil read-modify-write path.
    DepthCcu,
}

bitflags! {
    /// Which caches an operation reads or writes through.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        const SYSMEM_READ = 1 << 0;
        const SYSMEM_WRITE = 1 << 1;
        const UNIFIED_READ = 1 << 2;
        const UNIFIED_WRITE = 1 << 3;
        const COLOR_CCU_READ = 1 << 4;
        const COLOR_CCU_WRITE = 1 << 5;
        /// Access through the color cache that may alias differently than other accesses to
        /// the same memory.
        const COLOR_CCU_INCOHERENT_READ = 1 << 6;
        const COLOR_CCU_INCOHERENT_WRITE = 1 << 7;
        const DEPTH_CCU_READ = 1 << 8;
        const DEPTH_CCU_WRITE = 1 << 9;
        const DEPTH_CCU_INCOHERENT_READ = 1 << 10;
        const DEPTH_CCU_INCOHERENT_WRITE = 1 << 11;
        /// Reading descriptors through the bindless descriptor cache.
        const BINDLESS_DESCRIPTOR_READ = 1 << 12;
        /// A write performed by the command processor, which goes straight to memory.
        const CP_WRITE = 1 << 13;

        const READ = Self::SYSMEM_READ.bits()
            | Self::UNIFIED_READ.bits()
            | Self::COLOR_CCU_READ.bits()
            | Self::COLOR_CCU_INCOHERENT_READ.bits()
            | Self::DEPTH_CCU_READ.bits()
            | Self::DEPTH_CCU_INCOHERENT_READ.bits()
            | Self::BINDLESS_DESCRIPTOR_READ.bits();
        const WRITE = Self::SYSMEM_WRITE.bits()
            | Self::UNIFIED_WRITE.bits()
            | Self::COLOR_CCU_WRITE.bits()
            | Self::COLOR_CCU_INCOHERENT_WRITE.bits()
            | Self::DEPTH_CCU_WRITE.bits()
            | Self::DEPTH_CCU_INCOHERENT_WRITE.bits()
            | Self::CP_WRITE.bits();
    }
}

bitflags! {
    /// Cache maintenance and ordering operations.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FlushFlags: u32 {
        const CCU_FLUSH_COLOR = 1 << 0;
        const CCU_FLUSH_DEPTH = 1 << 1;
        const CCU_INVALIDATE_COLOR = 1 << 2;
        const CCU_INVALIDATE_DEPTH = 1 << 3;
        const CACHE_FLUSH = 1 << 4;
        const CACHE_INVALIDATE = 1 << 5;
        const BINDLESS_DESCRIPTOR_INVALIDATE = 1 << 6;
        /// Wait for memory writes of the command processor to land.
        const WAIT_MEM_WRITES = 1 << 7;
        /// Drain the whole pipeline.
        const WAIT_FOR_IDLE = 1 << 8;
        /// Let the command processor catch up with the prefetcher.
        const WAIT_FOR_ME = 1 << 9;

        /// Everything that writes data back. The write queue of the command processor counts
        /// as a cache here, waiting for it is its flush.
        const ALL_FLUSH = Self::CCU_FLUSH_COLOR.bits()
            | Self::CCU_FLUSH_DEPTH.bits()
            | Self::CACHE_FLUSH.bits()
            | Self::WAIT_MEM_WRITES.bits();
        const ALL_INVALIDATE = Self::CCU_INVALIDATE_COLOR.bits()
            | Self::CCU_INVALIDATE_DEPTH.bits()
            | Self::CACHE_INVALIDATE.bits()
            | Self::BINDLESS_DESCRIPTOR_INVALIDATE.bits();
    }
}

/// Coarse ordering of where an operation executes.
///
/// Work is issued in order, but a later stage only observes the effects of an earlier one once
/// the pipeline in between has drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Executed by the command processor while it parses the stream.
    Cp,
    /// Executed by shader, raster or render backend units.
    Gpu,
    /// Completion, as observed by the host.
    Bottom,
}

/// The configuration of the color and depth caches.
///
/// In the tile-memory configuration the caches are carved out of tile memory and must not be
/// used for system memory accesses, and vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CcuMode {
    Sysmem,
    Gmem,
}

/// Flush bookkeeping of one recording context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheState {
    /// Operations that must be emitted before the next command executes.
    owed: FlushFlags,
    /// Operations that a later access may still need.
    pending: FlushFlags,
}

impl CacheDomain {
    /// The domains backed by an actual cache.
    pub const CACHED: [CacheDomain; 3] = [
        CacheDomain::UnifiedCache,
        CacheDomain::ColorCcu,
        CacheDomain::DepthCcu,
    ];

    pub fn flush_flag(self) -> FlushFlags {
        match self {
            CacheDomain::SysMem => FlushFlags::empty(),
            CacheDomain::UnifiedCache => FlushFlags::CACHE_FLUSH,
            CacheDomain::ColorCcu => FlushFlags::CCU_FLUSH_COLOR,
            CacheDomain::DepthCcu => FlushFlags::CCU_FLUSH_DEPTH,
        }
    }

    pub fn invalidate_flag(self) -> FlushFlags {
        match self {
            CacheDomain::SysMem => FlushFlags::empty(),
            CacheDomain::UnifiedCache => FlushFlags::CACHE_INVALIDATE,
            CacheDomain::ColorCcu => FlushFlags::CCU_INVALIDATE_COLOR,
            CacheDomain::DepthCcu => FlushFlags::CCU_INVALIDATE_DEPTH,
        }
    }

    /// Accesses that hit the cache the same way as every other access of the same kind.
    fn coherent(self) -> (AccessMask, AccessMask) {
        match self {
            CacheDomain::SysMem => (AccessMask::SYSMEM_READ, AccessMask::SYSMEM_WRITE),
            CacheDomain::UnifiedCache => (AccessMask::UNIFIED_READ, AccessMask::UNIFIED_WRITE),
            CacheDomain::ColorCcu => (AccessMask::COLOR_CCU_READ, AccessMask::COLOR_CCU_WRITE),
            CacheDomain::DepthCcu => (AccessMask::DEPTH_CCU_READ, AccessMask::DEPTH_CCU_WRITE),
        }
    }

    fn incoherent(self) -> (AccessMask, AccessMask) {
        match self {
            CacheDomain::ColorCcu => (
                AccessMask::COLOR_CCU_INCOHERENT_READ,
                AccessMask::COLOR_CCU_INCOHERENT_WRITE,
            ),
            CacheDomain::DepthCcu => (
                AccessMask::DEPTH_CCU_INCOHERENT_READ,
                AccessMask::DEPTH_CCU_INCOHERENT_WRITE,
            ),
            _ => (AccessMask::empty(), AccessMask::empty()),
        }
    }

    /// Flushes of all other domains, the ones a consumer in this domain may race with.
    fn foreign_flushes(self) -> FlushFlags {
        FlushFlags::ALL_FLUSH - self.flush_flag()
    }

    fn foreign_invalidates(self) -> FlushFlags {
        FlushFlags::ALL_INVALIDATE - self.invalidate_flag()
    }
}

impl FlushFlags {
    /// Lower the set into instructions, in the order the hardware requires.
    ///
    /// The color and depth caches are always flushed before they are invalidated, invalidating
    /// dirty lines would lose them.
    pub fn lower(self) -> impl Iterator<Item = Low> {
        let mut out = Vec::with_capacity(10);

        if self.intersects(FlushFlags::CCU_FLUSH_COLOR | FlushFlags::CCU_INVALIDATE_COLOR) {
            out.push(Low::Event(Event::CcuFlushColor));
        }
        if self.intersects(FlushFlags::CCU_FLUSH_DEPTH | FlushFlags::CCU_INVALIDATE_DEPTH) {
            out.push(Low::Event(Event::CcuFlushDepth));
        }
        if self.contains(FlushFlags::CCU_INVALIDATE_COLOR) {
            out.push(Low::Event(Event::CcuInvalidateColor));
        }
        if self.contains(FlushFlags::CCU_INVALIDATE_DEPTH) {
            out.push(Low::Event(Event::CcuInvalidateDepth));
        }
        if self.contains(FlushFlags::CACHE_FLUSH) {
            out.push(Low::Event(Event::CacheFlush));
        }
        if self.contains(FlushFlags::CACHE_INVALIDATE) {
            out.push(Low::Event(Event::CacheInvalidate));
        }
        if self.contains(FlushFlags::BINDLESS_DESCRIPTOR_INVALIDATE) {
            out.push(Low::Event(Event::BindlessInvalidate));
        }
        if self.contains(FlushFlags::WAIT_MEM_WRITES) {
            out.push(Low::WaitMemWrites);
        }
        if self.contains(FlushFlags::WAIT_FOR_IDLE) {
            out.push(Low::WaitForIdle);
        }
        if self.contains(FlushFlags::WAIT_FOR_ME) {
            out.push(Low::WaitForMe);
        }

        out.into_iter()
    }
}

impl CacheState {
    /// The state of a fresh context: nothing is owed, but any cache may hold stale lines.
    pub fn new() -> Self {
        CacheState {
            owed: FlushFlags::empty(),
            pending: FlushFlags::ALL_INVALIDATE,
        }
    }

    /// Forget everything we know, as after executing opaque commands.
    pub fn reset(&mut self) {
        *self = CacheState::new();
    }

    pub fn owed(&self) -> FlushFlags {
        self.owed
    }

    pub fn pending(&self) -> FlushFlags {
        self.pending
    }

    /// Record a dependency between earlier accesses `src` and later accesses `dst`.
    ///
    /// Writes in `src` become pending flushes, plus invalidation of every other domain that
    /// could observe them. Accesses in `dst` then move whatever they depend on from pending to
    /// owed. Either mask may be empty, which records a write or a consumer on its own.
    pub fn record_access(&mut self, src: AccessMask, dst: AccessMask) {
        let mut owed = FlushFlags::empty();

        if src.contains(AccessMask::SYSMEM_WRITE) {
            self.pending |= FlushFlags::ALL_INVALIDATE;
        }

        if src.contains(AccessMask::CP_WRITE) {
            // The command processor writes around every cache and does not wait for itself.
            self.pending |= FlushFlags::WAIT_MEM_WRITES | FlushFlags::ALL_INVALIDATE;
        }

        for domain in CacheDomain::CACHED {
            let (_, write) = domain.coherent();
            let (_, incoherent_write) = domain.incoherent();

            if src.intersects(write) {
                self.pending |= domain.flush_flag() | domain.foreign_invalidates();
            }

            if src.intersects(incoherent_write) {
                owed |= domain.flush_flag();
                self.pending |= domain.foreign_invalidates();
            }
        }

        if dst.intersects(AccessMask::SYSMEM_READ | AccessMask::SYSMEM_WRITE) {
            owed |= self.pending & FlushFlags::ALL_FLUSH;
        }

        for domain in CacheDomain::CACHED {
            let (read, write) = domain.coherent();
            let (incoherent_read, incoherent_write) = domain.incoherent();

            if dst.intersects(read | write) {
                owed |= self.pending & (domain.invalidate_flag() | domain.foreign_flushes());
            }

            if dst.intersects(incoherent_read | incoherent_write) {
                owed |= domain.invalidate_flag() | (self.pending & domain.foreign_flushes());
            }
        }

        if dst.contains(AccessMask::BINDLESS_DESCRIPTOR_READ) {
            owed |= FlushFlags::BINDLESS_DESCRIPTOR_INVALIDATE;
        }

        self.require(owed);
    }

    /// Order the stages of a dependency.
    ///
    /// `region_local` dependencies only involve framebuffer-space stages of the same pixel and
    /// are ordered by the render backend itself.
    pub fn flush_for_stage(&mut self, mut src: Stage, dst: Stage, region_local: bool) {
        // The command processor may run ahead into an invalidation that the rest of the GPU has
        // not performed yet.
        if src == Stage::Cp && self.owed.intersects(FlushFlags::ALL_INVALIDATE) {
            src = Stage::Gpu;
        }

        if src >= dst && !region_local {
            self.require(FlushFlags::WAIT_FOR_IDLE);
            if dst == Stage::Cp {
                self.pending |= FlushFlags::WAIT_FOR_ME;
            }
        }
    }

    /// Make `flags` owed unconditionally.
    ///
    /// Invalidating a color or depth cache always brings its flush along.
    pub fn require(&mut self, mut flags: FlushFlags) {
        if flags.contains(FlushFlags::CCU_INVALIDATE_COLOR) {
            flags |= FlushFlags::CCU_FLUSH_COLOR;
        }
        if flags.contains(FlushFlags::CCU_INVALIDATE_DEPTH) {
            flags |= FlushFlags::CCU_FLUSH_DEPTH;
        }

        self.owed |= flags;
        self.pending -= flags;
    }

    /// Move the pending operations among `flags` into the owed set.
    pub fn pull_pending(&mut self, flags: FlushFlags) {
        let pulled = self.pending & flags;
        self.require(pulled);
    }

    /// Everything pending that writes back data becomes owed.
    pub fn flush_all_pending(&mut self) {
        self.pull_pending(FlushFlags::ALL_FLUSH);
    }

    /// Inherit the pending operations of another tracker.
    pub fn merge_pending(&mut self, other: &CacheState) {
        self.pending |= other.pending;
    }

    /// Start tracking the same pending operations as `other`, with nothing owed.
    pub fn inherit_pending(&mut self, other: &CacheState) {
        self.owed = FlushFlags::empty();
        self.pending = other.pending;
    }

    /// Prepare a change of the color/depth cache configuration.
    ///
    /// Returns whether the configuration needs to be reprogrammed at all. Lines cached in the
    /// system memory configuration must be written back, and in any case both caches start out
    /// empty after the switch, which is only safe once the pipeline drained.
    pub fn prepare_ccu_switch(&mut self, from: Option<CcuMode>, to: CcuMode) -> bool {
        if from == Some(to) {
            return false;
        }

        if from != Some(CcuMode::Gmem) {
            self.require(FlushFlags::CCU_FLUSH_COLOR | FlushFlags::CCU_FLUSH_DEPTH);
        }

        self.require(
            FlushFlags::CCU_INVALIDATE_COLOR
                | FlushFlags::CCU_INVALIDATE_DEPTH
                | FlushFlags::WAIT_FOR_IDLE,
        );

        true
    }

    /// Take the owed operations, leaving nothing owed.
    pub fn take_owed(&mut self) -> FlushFlags {
        core::mem::take(&mut self.owed)
    }

    /// Emit every owed operation.
    pub(crate) fn materialize(&mut self, out: &mut dyn ExtendOne<Low>) -> FlushFlags {
        let owed = self.take_owed();
        out.extend_iter(&mut owed.lower());
        owed
    }
}

impl Default for CacheState {
    fn default() -> Self {
        CacheState::new()
    }
}
