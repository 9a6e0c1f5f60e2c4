//! Render backend resource layer for Kiln.
//!
//! Owns the device-side object lifecycle: buffers, images, descriptor
//! set layouts, pipeline layouts and the frame-lifetime allocators that
//! recycle transient GPU memory across frames in flight. The GPU driver
//! itself sits behind the [`Device`] trait; [`HeadlessDevice`] is the
//! host-memory implementation used by tests and tooling.

mod buffer;
mod device;
mod frame_alloc;
mod image;
mod layout;
mod schedule;
mod system;

use slotmap::new_key_type;

new_key_type! {
    /// Key for buffers owned by the backend.
    pub struct BufferKey;
    /// Key for images owned by the backend.
    pub struct ImageKey;
    /// Key for deduplicated descriptor set layouts.
    pub struct SetLayoutKey;
    /// Key for deduplicated pipeline layouts.
    pub struct PipelineLayoutKey;
    /// Key for user-created frame-lifetime allocators.
    pub struct AllocatorKey;
}

pub use buffer::{BufferFamily, BufferType, BufferUsage};
pub use device::{
    DescriptorType, Device, DeviceError, DeviceMemoryClass, HeadlessDevice, MemoryLocation,
    RawBufferAllocation, RawBufferDesc, RawBufferHandle, RawImageHandle, RawPipelineLayoutHandle,
    RawSetLayoutHandle, SetLayoutBinding,
};
pub use image::{ImageDescription, ImageFlags, ImageFormat, ImageLayout, ImageRegion};
pub use system::{
    AllocatedSlice, BufferPatch, BufferRead, RenderBackend, RenderBackendConfig, RenderError,
};
