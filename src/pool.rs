use slotmap::{DefaultKey, SlotMap};

use crate::device::{Aspects, FormatInfo};

/// Holds the images and buffers a recording may reference, with their memory layout.
///
/// The layout itself is computed elsewhere; the pool only hands out stable keys and answers
/// lookups by key.
#[derive(Default)]
pub struct ResourcePool {
    items: SlotMap<DefaultKey, Resource>,
}

/// A stable handle to a resource in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey(DefaultKey);

/// A handle on a resource inside the pool.
pub struct PoolResource<'pool> {
    /// The key of the slot map referring to this entry.
    key: DefaultKey,
    /// The resource inside the pool.
    resource: &'pool mut Resource,
}

struct Resource {
    layout: ResourceLayout,
}

/// Memory layout facts of one resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceLayout {
    pub kind: ResourceKind,
    /// The device virtual address, stable for the whole recording.
    pub device_va: u64,
    pub tile_mode: TileMode,
    pub compression: bool,
    /// Row pitch, in bytes, of each mip level.
    pub mip_pitch: Vec<u32>,
    /// Bytes between array layers, per mip level.
    pub layer_stride: Vec<u64>,
    /// The hierarchical depth buffer that belongs to a depth image.
    pub lrz: Option<LrzLayout>,
    /// The image may be viewed with formats of different layout.
    pub mutable_format: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer { size: u64 },
    Image { width: u32, height: u32, format: FormatInfo },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TileMode {
    Linear,
    Tiled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LrzLayout {
    pub device_va: u64,
    /// Size of the fast-clear metadata, zero if the buffer has none.
    pub fast_clear_size: u32,
}

/// Answers `layout_of` for resources referenced by commands.
pub trait LayoutSource {
    fn layout_of(&self, key: ResourceKey) -> Option<&ResourceLayout>;
}

impl ResourcePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        ResourcePool::default()
    }

    /// Get a mutable handle of a resource in the pool.
    pub fn entry(&mut self, ResourceKey(key): ResourceKey) -> Option<PoolResource<'_>> {
        Some(PoolResource {
            key,
            resource: self.items.get_mut(key)?,
        })
    }

    /// Declare a resource with a precomputed layout.
    pub fn insert(&mut self, layout: ResourceLayout) -> PoolResource<'_> {
        let key = self.items.insert(Resource { layout });

        PoolResource {
            key,
            resource: &mut self.items[key],
        }
    }

    /// Declare a tiled image with a single mip level and layer.
    ///
    /// Returns `None` if a row of the image is too large to be addressed.
    pub fn declare_image(
        &mut self,
        device_va: u64,
        width: u32,
        height: u32,
        format: FormatInfo,
    ) -> Option<PoolResource<'_>> {
        let Some(pitch) = width.checked_mul(format.block_size) else {
            log::warn!("Row pitch of a {width}x{height} image overflows");
            return None;
        };

        Some(self.insert(ResourceLayout {
            kind: ResourceKind::Image {
                width,
                height,
                format,
            },
            device_va,
            tile_mode: TileMode::Tiled,
            compression: false,
            mip_pitch: vec![pitch],
            layer_stride: vec![u64::from(pitch) * u64::from(height)],
            lrz: None,
            mutable_format: false,
        }))
    }

    /// Declare a linear buffer.
    pub fn declare_buffer(&mut self, device_va: u64, size: u64) -> PoolResource<'_> {
        self.insert(ResourceLayout {
            kind: ResourceKind::Buffer { size },
            device_va,
            tile_mode: TileMode::Linear,
            compression: false,
            mip_pitch: vec![],
            layer_stride: vec![],
            lrz: None,
            mutable_format: false,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl LayoutSource for ResourcePool {
    fn layout_of(&self, ResourceKey(key): ResourceKey) -> Option<&ResourceLayout> {
        Some(&self.items.get(key)?.layout)
    }
}

impl PoolResource<'_> {
    pub fn key(&self) -> ResourceKey {
        ResourceKey(self.key)
    }

    pub fn layout(&self) -> &ResourceLayout {
        &self.resource.layout
    }

    /// Attach a hierarchical depth buffer.
    pub fn with_lrz(self, lrz: LrzLayout) -> Self {
        self.resource.layout.lrz = Some(lrz);
        self
    }

    /// Store the image linearly instead of tiled.
    pub fn linear(self) -> Self {
        self.resource.layout.tile_mode = TileMode::Linear;
        self
    }

    pub fn compressed(self) -> Self {
        self.resource.layout.compression = true;
        self
    }

    /// Allow views with formats of a different layout.
    pub fn mutable_format(self) -> Self {
        self.resource.layout.mutable_format = true;
        self
    }
}

impl ResourceLayout {
    pub fn is_image(&self) -> bool {
        matches!(self.kind, ResourceKind::Image { .. })
    }

    /// The aspects of an image, empty for buffers.
    pub fn aspects(&self) -> Aspects {
        match self.kind {
            ResourceKind::Image { format, .. } => format.aspects,
            ResourceKind::Buffer { .. } => Aspects::empty(),
        }
    }

    /// Width and height of an image, `None` for buffers.
    pub fn extent(&self) -> Option<(u32, u32)> {
        match self.kind {
            ResourceKind::Image { width, height, .. } => Some((width, height)),
            ResourceKind::Buffer { .. } => None,
        }
    }
}
