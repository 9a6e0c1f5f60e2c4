//! Image descriptions and layout tracking state.

use bitflags::bitflags;

use crate::device::RawImageHandle;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImageFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Depth32Float,
}

impl ImageFormat {
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rg8Unorm => 2,
            ImageFormat::Rgba8Unorm | ImageFormat::Rgba8Srgb => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::R32Float | ImageFormat::Depth32Float => 4,
            ImageFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, ImageFormat::Depth32Float)
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ImageFlags: u32 {
        /// Image can be rendered into.
        const RENDER_TARGET = 1 << 0;
        /// Image can be sampled from shaders.
        const SAMPLED = 1 << 1;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ImageDescription {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub layers: u32,
    pub mips: u32,
    pub format: ImageFormat,
    pub flags: ImageFlags,
}

impl ImageDescription {
    /// Cube sampling is only possible with exactly six layers.
    pub fn cube_compatible(&self) -> bool {
        self.layers == 6
    }

    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        )
    }

    /// Tightly packed byte size of one layer's mip level.
    pub fn mip_size_bytes(&self, mip: u32) -> u64 {
        let (width, height, depth) = self.mip_extent(mip);
        width as u64 * height as u64 * depth as u64 * self.format.bytes_per_texel()
    }
}

/// Last known layout of one image layer, updated when schedules execute.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImageLayout {
    Undefined,
    TransferSource,
    TransferDestination,
    ShaderRead,
    Attachment,
}

pub(crate) struct ImageRecord {
    pub description: ImageDescription,
    pub raw: RawImageHandle,
    pub layer_layouts: Vec<ImageLayout>,
    pub tracking_name: kiln_memory::InternedString,
}

/// Region of one mip level used by partial uploads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ImageRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(layers: u32) -> ImageDescription {
        ImageDescription {
            width: 16,
            height: 8,
            depth: 1,
            layers,
            mips: 3,
            format: ImageFormat::Rgba8Unorm,
            flags: ImageFlags::SAMPLED,
        }
    }

    #[test]
    fn cube_compatibility_requires_six_layers() {
        assert!(!description(1).cube_compatible());
        assert!(description(6).cube_compatible());
        assert!(!description(7).cube_compatible());
    }

    #[test]
    fn mip_extents_clamp_to_one() {
        let description = description(1);
        assert_eq!(description.mip_extent(0), (16, 8, 1));
        assert_eq!(description.mip_extent(2), (4, 2, 1));
        assert_eq!(description.mip_extent(5), (1, 1, 1));
        assert_eq!(description.mip_size_bytes(1), 8 * 4 * 4);
    }
}
