//! Device seam between the resource layer and the GPU driver.
//!
//! The backend manipulates raw handles through the [`Device`] trait; the
//! production implementation wraps the platform graphics API, while
//! [`HeadlessDevice`] keeps everything in host memory so the full
//! lifecycle is exercisable in tests and tooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::buffer::BufferUsage;
use crate::image::{ImageDescription, ImageFormat, ImageRegion};

macro_rules! raw_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub u64);

        impl $name {
            pub const INVALID: $name = $name(0);

            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }
    };
}

raw_handle!(
    /// Driver-side buffer object.
    RawBufferHandle
);
raw_handle!(
    /// Driver-side image object.
    RawImageHandle
);
raw_handle!(
    /// Driver-side descriptor set layout.
    RawSetLayoutHandle
);
raw_handle!(
    /// Driver-side pipeline layout.
    RawPipelineLayoutHandle
);

/// How the device exposes its memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceMemoryClass {
    /// One heap, host visible, explicit flushes required.
    Unified,
    /// One heap, host visible and coherent.
    UnifiedCoherent,
    /// Distinct device-local and host-visible heaps.
    Separate,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryLocation {
    DeviceLocal,
    HostVisibleSequential,
    HostVisibleRandom,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device is out of memory")]
    OutOfMemory,
    #[error("invalid raw handle")]
    InvalidHandle,
    #[error("device failure: {0}")]
    Failed(String),
}

#[derive(Clone, Copy, Debug)]
pub struct RawBufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

/// A created buffer plus its persistent mapping, when host visible.
#[derive(Clone, Copy, Debug)]
pub struct RawBufferAllocation {
    pub handle: RawBufferHandle,
    pub mapped: Option<*mut u8>,
}

/// One descriptor binding of a set layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    CombinedImageSampler,
}

/// Raw GPU object lifecycle and transfer execution.
///
/// Creation returning `Err` is a recoverable device error; the backend
/// logs it and surfaces an invalid handle to the caller.
pub trait Device: Send + Sync {
    fn memory_class(&self) -> DeviceMemoryClass;

    fn create_buffer(&self, desc: &RawBufferDesc) -> Result<RawBufferAllocation, DeviceError>;
    fn destroy_buffer(&self, buffer: RawBufferHandle);
    /// Makes host writes through the mapping visible to the device.
    fn flush_mapped(&self, buffer: RawBufferHandle, offset: u64, size: u64);

    fn create_image(&self, description: &ImageDescription) -> Result<RawImageHandle, DeviceError>;
    fn destroy_image(&self, image: RawImageHandle);

    fn create_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
    ) -> Result<RawSetLayoutHandle, DeviceError>;
    fn destroy_set_layout(&self, layout: RawSetLayoutHandle);

    fn create_pipeline_layout(
        &self,
        push_constant_size: u32,
        set_layouts: &[RawSetLayoutHandle],
    ) -> Result<RawPipelineLayoutHandle, DeviceError>;
    fn destroy_pipeline_layout(&self, layout: RawPipelineLayoutHandle);

    fn copy_buffer(
        &self,
        source: RawBufferHandle,
        source_offset: u64,
        target: RawBufferHandle,
        target_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError>;

    fn copy_buffer_to_image(
        &self,
        source: RawBufferHandle,
        source_offset: u64,
        image: RawImageHandle,
        layer: u32,
        mip: u32,
        region: Option<ImageRegion>,
    ) -> Result<(), DeviceError>;

    fn clear_image(
        &self,
        image: RawImageHandle,
        layer: u32,
        color: [f32; 4],
    ) -> Result<(), DeviceError>;

    fn copy_image(
        &self,
        source: RawImageHandle,
        source_layer: u32,
        source_mip: u32,
        target: RawImageHandle,
        target_layer: u32,
        target_mip: u32,
    ) -> Result<(), DeviceError>;

    fn generate_mips(
        &self,
        image: RawImageHandle,
        layer: u32,
        first_mip: u32,
        last_mip: u32,
    ) -> Result<(), DeviceError>;
}

// ---------------------------------------------------------------------
// Headless device
// ---------------------------------------------------------------------

struct HeadlessBuffer {
    data: Box<[u8]>,
    mapped: bool,
}

struct HeadlessImage {
    description: ImageDescription,
    /// Indexed by layer, then mip.
    subresources: Vec<Vec<Vec<u8>>>,
}

/// Host-memory device used by tests and offline tooling. Transfers are
/// plain memory copies, so every scheduled operation is observable.
pub struct HeadlessDevice {
    class: DeviceMemoryClass,
    next_handle: AtomicU64,
    buffers: Mutex<HashMap<u64, HeadlessBuffer>>,
    images: Mutex<HashMap<u64, HeadlessImage>>,
    set_layouts: Mutex<HashMap<u64, Vec<SetLayoutBinding>>>,
    pipeline_layouts: Mutex<HashMap<u64, (u32, Vec<RawSetLayoutHandle>)>>,
}

impl HeadlessDevice {
    pub fn new(class: DeviceMemoryClass) -> Self {
        HeadlessDevice {
            class,
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            set_layouts: Mutex::new(HashMap::new()),
            pipeline_layouts: Mutex::new(HashMap::new()),
        }
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Test access to buffer contents.
    pub fn buffer_bytes(&self, buffer: RawBufferHandle) -> Option<Vec<u8>> {
        self.buffers
            .lock()
            .unwrap()
            .get(&buffer.0)
            .map(|entry| entry.data.to_vec())
    }

    /// Test access to one image subresource.
    pub fn image_bytes(&self, image: RawImageHandle, layer: u32, mip: u32) -> Option<Vec<u8>> {
        self.images
            .lock()
            .unwrap()
            .get(&image.0)
            .and_then(|entry| entry.subresources.get(layer as usize))
            .and_then(|mips| mips.get(mip as usize))
            .cloned()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn live_pipeline_layout_count(&self) -> usize {
        self.pipeline_layouts.lock().unwrap().len()
    }

    pub fn live_set_layout_count(&self) -> usize {
        self.set_layouts.lock().unwrap().len()
    }
}

impl Device for HeadlessDevice {
    fn memory_class(&self) -> DeviceMemoryClass {
        self.class
    }

    fn create_buffer(&self, desc: &RawBufferDesc) -> Result<RawBufferAllocation, DeviceError> {
        let handle = self.next();
        let mut data = vec![0u8; desc.size as usize].into_boxed_slice();
        let mapped = match desc.location {
            MemoryLocation::DeviceLocal => None,
            _ => Some(data.as_mut_ptr()),
        };
        self.buffers.lock().unwrap().insert(
            handle,
            HeadlessBuffer {
                data,
                mapped: mapped.is_some(),
            },
        );
        Ok(RawBufferAllocation {
            handle: RawBufferHandle(handle),
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: RawBufferHandle) {
        self.buffers.lock().unwrap().remove(&buffer.0);
    }

    fn flush_mapped(&self, buffer: RawBufferHandle, _offset: u64, _size: u64) {
        debug_assert!(self
            .buffers
            .lock()
            .unwrap()
            .get(&buffer.0)
            .map(|entry| entry.mapped)
            .unwrap_or(false));
    }

    fn create_image(&self, description: &ImageDescription) -> Result<RawImageHandle, DeviceError> {
        let handle = self.next();
        let subresources = (0..description.layers)
            .map(|_| {
                (0..description.mips)
                    .map(|mip| vec![0u8; description.mip_size_bytes(mip) as usize])
                    .collect()
            })
            .collect();
        self.images.lock().unwrap().insert(
            handle,
            HeadlessImage {
                description: *description,
                subresources,
            },
        );
        Ok(RawImageHandle(handle))
    }

    fn destroy_image(&self, image: RawImageHandle) {
        self.images.lock().unwrap().remove(&image.0);
    }

    fn create_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
    ) -> Result<RawSetLayoutHandle, DeviceError> {
        let handle = self.next();
        self.set_layouts
            .lock()
            .unwrap()
            .insert(handle, bindings.to_vec());
        Ok(RawSetLayoutHandle(handle))
    }

    fn destroy_set_layout(&self, layout: RawSetLayoutHandle) {
        self.set_layouts.lock().unwrap().remove(&layout.0);
    }

    fn create_pipeline_layout(
        &self,
        push_constant_size: u32,
        set_layouts: &[RawSetLayoutHandle],
    ) -> Result<RawPipelineLayoutHandle, DeviceError> {
        let handle = self.next();
        self.pipeline_layouts
            .lock()
            .unwrap()
            .insert(handle, (push_constant_size, set_layouts.to_vec()));
        Ok(RawPipelineLayoutHandle(handle))
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayoutHandle) {
        self.pipeline_layouts.lock().unwrap().remove(&layout.0);
    }

    fn copy_buffer(
        &self,
        source: RawBufferHandle,
        source_offset: u64,
        target: RawBufferHandle,
        target_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        let mut buffers = self.buffers.lock().unwrap();
        let bytes = {
            let source = buffers.get(&source.0).ok_or(DeviceError::InvalidHandle)?;
            source.data[source_offset as usize..(source_offset + size) as usize].to_vec()
        };
        let target = buffers.get_mut(&target.0).ok_or(DeviceError::InvalidHandle)?;
        target.data[target_offset as usize..(target_offset + size) as usize]
            .copy_from_slice(&bytes);
        Ok(())
    }

    fn copy_buffer_to_image(
        &self,
        source: RawBufferHandle,
        source_offset: u64,
        image: RawImageHandle,
        layer: u32,
        mip: u32,
        region: Option<ImageRegion>,
    ) -> Result<(), DeviceError> {
        let buffers = self.buffers.lock().unwrap();
        let source = buffers.get(&source.0).ok_or(DeviceError::InvalidHandle)?;

        let mut images = self.images.lock().unwrap();
        let entry = images.get_mut(&image.0).ok_or(DeviceError::InvalidHandle)?;
        let description = entry.description;
        let texel = description.format.bytes_per_texel() as usize;
        let (mip_width, _, _) = description.mip_extent(mip);
        let data = entry
            .subresources
            .get_mut(layer as usize)
            .and_then(|mips| mips.get_mut(mip as usize))
            .ok_or(DeviceError::InvalidHandle)?;

        match region {
            None => {
                let size = data.len();
                data.copy_from_slice(
                    &source.data[source_offset as usize..source_offset as usize + size],
                );
            }
            Some(region) => {
                let row_bytes = region.width as usize * texel;
                for row in 0..region.height {
                    let source_begin = source_offset as usize + row as usize * row_bytes;
                    let target_begin = ((region.y + row) as usize * mip_width as usize
                        + region.x as usize)
                        * texel;
                    data[target_begin..target_begin + row_bytes]
                        .copy_from_slice(&source.data[source_begin..source_begin + row_bytes]);
                }
            }
        }
        Ok(())
    }

    fn clear_image(
        &self,
        image: RawImageHandle,
        layer: u32,
        color: [f32; 4],
    ) -> Result<(), DeviceError> {
        let mut images = self.images.lock().unwrap();
        let entry = images.get_mut(&image.0).ok_or(DeviceError::InvalidHandle)?;
        let texel_bytes = texel_from_color(entry.description.format, color);

        let mips = entry
            .subresources
            .get_mut(layer as usize)
            .ok_or(DeviceError::InvalidHandle)?;
        for data in mips.iter_mut() {
            for chunk in data.chunks_exact_mut(texel_bytes.len()) {
                chunk.copy_from_slice(&texel_bytes);
            }
        }
        Ok(())
    }

    fn copy_image(
        &self,
        source: RawImageHandle,
        source_layer: u32,
        source_mip: u32,
        target: RawImageHandle,
        target_layer: u32,
        target_mip: u32,
    ) -> Result<(), DeviceError> {
        let mut images = self.images.lock().unwrap();
        let bytes = images
            .get(&source.0)
            .and_then(|entry| entry.subresources.get(source_layer as usize))
            .and_then(|mips| mips.get(source_mip as usize))
            .cloned()
            .ok_or(DeviceError::InvalidHandle)?;

        let entry = images.get_mut(&target.0).ok_or(DeviceError::InvalidHandle)?;
        let data = entry
            .subresources
            .get_mut(target_layer as usize)
            .and_then(|mips| mips.get_mut(target_mip as usize))
            .ok_or(DeviceError::InvalidHandle)?;
        if data.len() != bytes.len() {
            return Err(DeviceError::Failed("image copy extent mismatch".to_owned()));
        }
        data.copy_from_slice(&bytes);
        Ok(())
    }

    fn generate_mips(
        &self,
        image: RawImageHandle,
        layer: u32,
        first_mip: u32,
        last_mip: u32,
    ) -> Result<(), DeviceError> {
        let mut images = self.images.lock().unwrap();
        let entry = images.get_mut(&image.0).ok_or(DeviceError::InvalidHandle)?;
        let description = entry.description;
        let texel = description.format.bytes_per_texel() as usize;

        for mip in first_mip.max(1)..=last_mip {
            let (source_width, _, _) = description.mip_extent(mip - 1);
            let (width, height, _) = description.mip_extent(mip);

            let mips = entry
                .subresources
                .get_mut(layer as usize)
                .ok_or(DeviceError::InvalidHandle)?;
            if mip as usize >= mips.len() {
                return Err(DeviceError::InvalidHandle);
            }

            // Nearest-sample downscale: enough to observe mip data flow.
            let source = mips[mip as usize - 1].clone();
            let target = &mut mips[mip as usize];
            for y in 0..height {
                for x in 0..width {
                    let source_index =
                        ((y * 2) as usize * source_width as usize + (x * 2) as usize) * texel;
                    let target_index = (y as usize * width as usize + x as usize) * texel;
                    target[target_index..target_index + texel]
                        .copy_from_slice(&source[source_index..source_index + texel]);
                }
            }
        }
        Ok(())
    }
}

fn texel_from_color(format: ImageFormat, color: [f32; 4]) -> Vec<u8> {
    let to_byte = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        ImageFormat::R8Unorm => vec![to_byte(color[0])],
        ImageFormat::Rg8Unorm => vec![to_byte(color[0]), to_byte(color[1])],
        ImageFormat::Rgba8Unorm | ImageFormat::Rgba8Srgb => vec![
            to_byte(color[0]),
            to_byte(color[1]),
            to_byte(color[2]),
            to_byte(color[3]),
        ],
        ImageFormat::Rgba16Float => {
            let mut bytes = Vec::with_capacity(8);
            for channel in color {
                bytes.extend_from_slice(&half_bits(channel).to_le_bytes());
            }
            bytes
        }
        ImageFormat::R32Float | ImageFormat::Depth32Float => color[0].to_le_bytes().to_vec(),
        ImageFormat::Rgba32Float => {
            let mut bytes = Vec::with_capacity(16);
            for channel in color {
                bytes.extend_from_slice(&channel.to_le_bytes());
            }
            bytes
        }
    }
}

/// Minimal f32 -> f16 conversion for clear colors.
fn half_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32 - 127 + 15;
    let mantissa = ((bits >> 13) & 0x3ff) as u16;
    if exponent <= 0 {
        sign
    } else if exponent >= 0x1f {
        sign | 0x7c00
    } else {
        sign | ((exponent as u16) << 10) | mantissa
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageFlags;

    #[test]
    fn headless_buffer_copies_are_observable() {
        let device = HeadlessDevice::new(DeviceMemoryClass::Separate);
        let source = device
            .create_buffer(&RawBufferDesc {
                size: 8,
                usage: BufferUsage::TRANSFER_SRC,
                location: MemoryLocation::HostVisibleSequential,
            })
            .unwrap();
        let target = device
            .create_buffer(&RawBufferDesc {
                size: 8,
                usage: BufferUsage::TRANSFER_DST,
                location: MemoryLocation::DeviceLocal,
            })
            .unwrap();

        unsafe {
            std::ptr::copy_nonoverlapping(b"abcdefgh".as_ptr(), source.mapped.unwrap(), 8);
        }
        device
            .copy_buffer(source.handle, 2, target.handle, 0, 4)
            .unwrap();
        assert_eq!(&device.buffer_bytes(target.handle).unwrap()[..4], b"cdef");
    }

    #[test]
    fn headless_mip_generation_downsamples() {
        let device = HeadlessDevice::new(DeviceMemoryClass::Separate);
        let image = device
            .create_image(&ImageDescription {
                width: 2,
                height: 2,
                depth: 1,
                layers: 1,
                mips: 2,
                format: ImageFormat::R8Unorm,
                flags: ImageFlags::SAMPLED,
            })
            .unwrap();

        let staging = device
            .create_buffer(&RawBufferDesc {
                size: 4,
                usage: BufferUsage::TRANSFER_SRC,
                location: MemoryLocation::HostVisibleSequential,
            })
            .unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping([7u8, 1, 2, 3].as_ptr(), staging.mapped.unwrap(), 4);
        }
        device
            .copy_buffer_to_image(staging.handle, 0, image, 0, 0, None)
            .unwrap();
        device.generate_mips(image, 0, 1, 1).unwrap();
        assert_eq!(device.image_bytes(image, 0, 1).unwrap(), vec![7]);
    }
}
