//! The render backend system: lifecycle, schedules and frame cycling.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use kiln_memory::InternedString;
use slotmap::SlotMap;
use thiserror::Error;

use crate::buffer::{derive_memory, derive_usage, needs_flush, BufferFamily, BufferRecord, BufferType};
use crate::device::{Device, DeviceError, DeviceMemoryClass, RawBufferDesc, SetLayoutBinding};
use crate::frame_alloc::FrameLifetimeAllocator;
use crate::image::{ImageDescription, ImageLayout, ImageRecord, ImageRegion};
use crate::layout::LayoutCache;
use crate::schedule::{BufferFlushTransfer, FrameSchedule, ImageOperation, MappedFlush};
use crate::{AllocatorKey, BufferKey, ImageKey, PipelineLayoutKey, SetLayoutKey};

/// Alignment of staging sub-allocations.
const STAGING_ALLOCATION_ALIGNMENT: u64 = 16;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("buffer handle is stale or invalid")]
    InvalidBuffer,
    #[error("image handle is stale or invalid")]
    InvalidImage,
    #[error("range {offset}..{end} is outside the buffer of size {size}")]
    OutOfBounds { offset: u64, end: u64, size: u64 },
    #[error("buffer is not a read-back buffer")]
    NotReadable,
    #[error(
        "frame-lifetime allocation of {size} bytes exceeds the page size {page_size} of \"{name}\""
    )]
    OversizedAllocation {
        size: u64,
        page_size: u64,
        name: InternedString,
    },
    #[error("upload data of {provided} bytes does not match the subresource size {expected}")]
    UploadSizeMismatch { provided: u64, expected: u64 },
}

#[derive(Clone, Copy, Debug)]
pub struct RenderBackendConfig {
    pub frames_in_flight: u32,
    pub staging_page_size: u64,
}

impl Default for RenderBackendConfig {
    fn default() -> Self {
        RenderBackendConfig {
            frames_in_flight: 2,
            staging_page_size: 4 * 1024 * 1024,
        }
    }
}

/// A sub-allocation inside a frame-lifetime allocator page.
#[derive(Clone, Copy, Debug)]
pub struct AllocatedSlice {
    pub buffer: BufferKey,
    pub offset: u64,
}

/// Writable window returned by [`RenderBackend::patch_buffer`]. Writes
/// land either in the mapped buffer itself or in staging memory whose
/// transfer is already scheduled.
pub struct BufferPatch<'a> {
    pointer: *mut u8,
    size: usize,
    _backend: PhantomData<&'a RenderBackend>,
}

impl BufferPatch<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the window was validated against the buffer range and
        // the mapping outlives the borrow of the backend.
        unsafe { std::slice::from_raw_parts_mut(self.pointer, self.size) }
    }

    pub fn copy_from_slice(&mut self, bytes: &[u8]) {
        self.as_mut_slice().copy_from_slice(bytes);
    }
}

/// Readable view over a read-back buffer's mapping.
pub struct BufferRead<'a> {
    pointer: *const u8,
    size: usize,
    _backend: PhantomData<&'a RenderBackend>,
}

impl BufferRead<'_> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: same argument as BufferPatch.
        unsafe { std::slice::from_raw_parts(self.pointer, self.size) }
    }
}

struct BackendState {
    config: RenderBackendConfig,
    current_frame: u32,
    buffers: SlotMap<BufferKey, BufferRecord>,
    images: SlotMap<ImageKey, ImageRecord>,
    staging: FrameLifetimeAllocator,
    allocators: SlotMap<AllocatorKey, FrameLifetimeAllocator>,
    schedules: Vec<FrameSchedule>,
    layouts: LayoutCache,
}

/// Device-side resource lifecycle manager.
///
/// All mutation is funneled through one internal lock; the public
/// handles are plain copyable keys so they can travel across threads
/// freely.
pub struct RenderBackend {
    device: Arc<dyn Device>,
    state: Mutex<BackendState>,
}

impl RenderBackend {
    pub fn new(device: Arc<dyn Device>, config: RenderBackendConfig) -> Self {
        assert!(config.frames_in_flight >= 1);
        let schedules = (0..config.frames_in_flight)
            .map(|_| FrameSchedule::default())
            .collect();
        RenderBackend {
            device,
            state: Mutex::new(BackendState {
                config,
                current_frame: 0,
                buffers: SlotMap::with_key(),
                images: SlotMap::with_key(),
                staging: FrameLifetimeAllocator::new(
                    BufferFamily::Staging,
                    BufferType::Storage,
                    config.staging_page_size,
                    InternedString::intern("staging"),
                ),
                allocators: SlotMap::with_key(),
                schedules,
                layouts: LayoutCache::default(),
            }),
        }
    }

    pub fn memory_class(&self) -> DeviceMemoryClass {
        self.device.memory_class()
    }

    pub fn current_frame_in_flight(&self) -> u32 {
        self.state.lock().unwrap().current_frame
    }

    // -----------------------------------------------------------------
    // Buffers
    // -----------------------------------------------------------------

    fn create_buffer_record(
        device: &dyn Device,
        state: &mut BackendState,
        family: BufferFamily,
        buffer_type: BufferType,
        size: u64,
        tracking_name: InternedString,
    ) -> Result<BufferKey, RenderError> {
        let class = device.memory_class();
        let location = derive_memory(class, family, buffer_type);
        let usage = derive_usage(family, buffer_type);

        let allocation = device.create_buffer(&RawBufferDesc {
            size,
            usage,
            location,
        })?;

        if location != crate::device::MemoryLocation::DeviceLocal && allocation.mapped.is_none() {
            // The buffer declared itself mapped; running on without the
            // mapping would corrupt every later patch.
            log::error!(
                target: "render",
                "device returned no mapping for host-visible buffer \"{}\"",
                tracking_name
            );
            panic!("render backend: mapping a host-visible buffer failed");
        }

        Ok(state.buffers.insert(BufferRecord {
            family,
            buffer_type,
            size,
            raw: allocation.handle,
            mapped: allocation.mapped,
            needs_flush: needs_flush(class, location),
            tracking_name,
        }))
    }

    /// Creates a user-owned (resource family) buffer.
    pub fn create_buffer(
        &self,
        buffer_type: BufferType,
        size: u64,
        tracking_name: InternedString,
    ) -> Result<BufferKey, RenderError> {
        let mut state = self.state.lock().unwrap();
        Self::create_buffer_record(
            &*self.device,
            &mut state,
            BufferFamily::Resource,
            buffer_type,
            size,
            tracking_name,
        )
    }

    /// Schedules the buffer for destruction once the current frame has
    /// fully retired.
    pub fn destroy_buffer(&self, buffer: BufferKey) {
        let mut state = self.state.lock().unwrap();
        let frame = state.current_frame as usize;
        state.schedules[frame].destroy_buffers.push(buffer);
    }

    pub fn buffer_size(&self, buffer: BufferKey) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(buffer)
            .map(|record| record.size)
    }

    pub fn buffer_raw(&self, buffer: BufferKey) -> Option<crate::device::RawBufferHandle> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(buffer)
            .map(|record| record.raw)
    }

    /// Opens a writable window over `size` bytes at `offset`.
    ///
    /// Mapped buffers are written in place (with a flush scheduled when
    /// the memory is not coherent); device-local buffers go through
    /// staging memory and a scheduled flush transfer.
    pub fn patch_buffer(
        &self,
        buffer: BufferKey,
        offset: u64,
        size: u64,
    ) -> Result<BufferPatch<'_>, RenderError> {
        let mut state = self.state.lock().unwrap();
        let record = state.buffers.get(buffer).ok_or(RenderError::InvalidBuffer)?;
        if offset + size > record.size {
            return Err(RenderError::OutOfBounds {
                offset,
                end: offset + size,
                size: record.size,
            });
        }

        if let Some(mapped) = record.mapped {
            let needs_flush = record.needs_flush;
            let pointer = unsafe { mapped.add(offset as usize) };
            if needs_flush {
                let frame = state.current_frame as usize;
                state.schedules[frame].mapped_flushes.push(MappedFlush {
                    buffer,
                    offset,
                    size,
                });
            }
            return Ok(BufferPatch {
                pointer,
                size: size as usize,
                _backend: PhantomData,
            });
        }

        // Device-local target: stage the bytes and schedule the copy.
        let (staging_buffer, staging_offset) = Self::allocate_staging(&*self.device, &mut state, size)?;
        let frame = state.current_frame as usize;
        state.schedules[frame].mapped_flushes.push(MappedFlush {
            buffer: staging_buffer,
            offset: staging_offset,
            size,
        });
        state.schedules[frame]
            .buffer_transfers
            .push(BufferFlushTransfer {
                source: staging_buffer,
                source_offset: staging_offset,
                target: buffer,
                target_offset: offset,
                size,
            });

        let staging_record = &state.buffers[staging_buffer];
        let mapped = staging_record
            .mapped
            .expect("staging memory is always mapped");
        Ok(BufferPatch {
            pointer: unsafe { mapped.add(staging_offset as usize) },
            size: size as usize,
            _backend: PhantomData,
        })
    }

    /// Maps a read-back buffer for reading. Valid only after the frame
    /// that wrote it has completed.
    pub fn read_buffer(&self, buffer: BufferKey) -> Result<BufferRead<'_>, RenderError> {
        let state = self.state.lock().unwrap();
        let record = state.buffers.get(buffer).ok_or(RenderError::InvalidBuffer)?;
        if record.buffer_type != BufferType::ReadBackStorage {
            return Err(RenderError::NotReadable);
        }
        let mapped = record.mapped.ok_or(RenderError::NotReadable)?;
        Ok(BufferRead {
            pointer: mapped,
            size: record.size as usize,
            _backend: PhantomData,
        })
    }

    /// Schedules a raw copy between two buffers, e.g. into a read-back
    /// buffer.
    pub fn copy_buffer_data(
        &self,
        source: BufferKey,
        source_offset: u64,
        target: BufferKey,
        target_offset: u64,
        size: u64,
    ) -> Result<(), RenderError> {
        let mut state = self.state.lock().unwrap();
        if !state.buffers.contains_key(source) || !state.buffers.contains_key(target) {
            return Err(RenderError::InvalidBuffer);
        }
        let frame = state.current_frame as usize;
        state.schedules[frame]
            .buffer_transfers
            .push(BufferFlushTransfer {
                source,
                source_offset,
                target,
                target_offset,
                size,
            });
        Ok(())
    }

    /// Staging allocation: frame-lifetime pages for ordinary sizes, a
    /// one-shot buffer (already scheduled for destruction) for oversized
    /// requests.
    fn allocate_staging(
        device: &dyn Device,
        state: &mut BackendState,
        size: u64,
    ) -> Result<(BufferKey, u64), RenderError> {
        let current_frame = state.current_frame;
        if size <= state.staging.page_size {
            if let Some(allocation) =
                state
                    .staging
                    .allocate_on_existing(size, STAGING_ALLOCATION_ALIGNMENT, current_frame)
            {
                return Ok(allocation);
            }

            let page_size = state.staging.page_size;
            let buffer_type = state.staging.buffer_type;
            let name = state.staging.buffer_tracking_name;
            let page = Self::create_buffer_record(
                device,
                state,
                BufferFamily::Staging,
                buffer_type,
                page_size,
                name,
            )?;
            let offset = state
                .staging
                .add_page_and_allocate(page, size, STAGING_ALLOCATION_ALIGNMENT, current_frame)
                .expect("fresh page fits any in-budget allocation");
            return Ok((page, offset));
        }

        log::debug!(
            target: "render",
            "oversized staging request of {} bytes gets a one-shot buffer",
            size
        );
        let buffer = Self::create_buffer_record(
            device,
            state,
            BufferFamily::Staging,
            BufferType::Storage,
            size,
            InternedString::intern("temporary_staging_buffer"),
        )?;
        let frame = state.current_frame as usize;
        state.schedules[frame].destroy_buffers.push(buffer);
        Ok((buffer, 0))
    }

    // -----------------------------------------------------------------
    // Frame-lifetime allocators
    // -----------------------------------------------------------------

    pub fn create_frame_lifetime_allocator(
        &self,
        buffer_type: BufferType,
        page_size: u64,
        on_device: bool,
        tracking_name: InternedString,
    ) -> AllocatorKey {
        // Frame-lifetime read-back would be destroyed right after the
        // data lands, so it is not a thing.
        assert_ne!(buffer_type, BufferType::ReadBackStorage);
        let family = if on_device {
            BufferFamily::DeviceFrameLifetime
        } else {
            BufferFamily::HostFrameLifetime
        };
        let mut state = self.state.lock().unwrap();
        state.allocators.insert(FrameLifetimeAllocator::new(
            family,
            buffer_type,
            page_size,
            tracking_name,
        ))
    }

    pub fn allocate_frame_lifetime(
        &self,
        allocator: AllocatorKey,
        size: u64,
        alignment: u64,
    ) -> Result<AllocatedSlice, RenderError> {
        let mut state = self.state.lock().unwrap();
        let current_frame = state.current_frame;
        let Some(entry) = state.allocators.get_mut(allocator) else {
            return Err(RenderError::InvalidBuffer);
        };

        if size > entry.page_size {
            let error = RenderError::OversizedAllocation {
                size,
                page_size: entry.page_size,
                name: entry.tracking_name,
            };
            log::error!(target: "render", "{}", error);
            return Err(error);
        }

        if let Some((buffer, offset)) = entry.allocate_on_existing(size, alignment, current_frame)
        {
            return Ok(AllocatedSlice { buffer, offset });
        }

        let family = entry.family;
        let buffer_type = entry.buffer_type;
        let page_size = entry.page_size;
        let name = entry.buffer_tracking_name;
        let page = Self::create_buffer_record(
            &*self.device,
            &mut state,
            family,
            buffer_type,
            page_size,
            name,
        )?;
        let offset = state
            .allocators
            .get_mut(allocator)
            .expect("checked above")
            .add_page_and_allocate(page, size, alignment, current_frame)
            .expect("fresh page fits any in-budget allocation");
        Ok(AllocatedSlice { buffer: page, offset })
    }

    /// Schedules the allocator (and its pages) for deferred destruction.
    pub fn destroy_frame_lifetime_allocator(&self, allocator: AllocatorKey) {
        let mut state = self.state.lock().unwrap();
        let frame = state.current_frame as usize;
        state.schedules[frame].destroy_allocators.push(allocator);
    }

    /// Releases pages that hold no live allocations.
    pub fn clean_empty_pages(&self, allocator: AllocatorKey) {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.allocators.get_mut(allocator) else {
            return;
        };
        let pages = entry.take_empty_pages();
        for page in pages {
            if let Some(record) = state.buffers.remove(page) {
                self.device.destroy_buffer(record.raw);
            }
        }
    }

    // -----------------------------------------------------------------
    // Images
    // -----------------------------------------------------------------

    pub fn create_image(
        &self,
        description: ImageDescription,
        tracking_name: InternedString,
    ) -> Result<ImageKey, RenderError> {
        let raw = self.device.create_image(&description)?;
        let mut state = self.state.lock().unwrap();
        Ok(state.images.insert(ImageRecord {
            description,
            raw,
            layer_layouts: vec![ImageLayout::Undefined; description.layers as usize],
            tracking_name,
        }))
    }

    pub fn destroy_image(&self, image: ImageKey) {
        let mut state = self.state.lock().unwrap();
        let frame = state.current_frame as usize;
        state.schedules[frame].destroy_images.push(image);
    }

    pub fn image_raw(&self, image: ImageKey) -> Option<crate::device::RawImageHandle> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(image)
            .map(|record| record.raw)
    }

    pub fn image_layer_layout(&self, image: ImageKey, layer: u32) -> Option<ImageLayout> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(image)
            .and_then(|record| record.layer_layouts.get(layer as usize))
            .copied()
    }

    pub fn clear_color(&self, image: ImageKey, layer: u32, color: [f32; 4]) -> Result<(), RenderError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(image) {
            return Err(RenderError::InvalidImage);
        }
        let frame = state.current_frame as usize;
        state.schedules[frame]
            .image_operations
            .push(ImageOperation::Clear { image, layer, color });
        Ok(())
    }

    /// Uploads a whole subresource. Repeated uploads of the same
    /// (image, layer, mip) within a frame merge: the last data wins.
    pub fn upload_data(
        &self,
        image: ImageKey,
        layer: u32,
        mip: u32,
        data: &[u8],
    ) -> Result<(), RenderError> {
        self.upload_internal(image, layer, mip, None, data)
    }

    /// Uploads a region of a subresource; `data` is tightly packed rows.
    pub fn upload_data_region(
        &self,
        image: ImageKey,
        layer: u32,
        mip: u32,
        region: ImageRegion,
        data: &[u8],
    ) -> Result<(), RenderError> {
        self.upload_internal(image, layer, mip, Some(region), data)
    }

    fn upload_internal(
        &self,
        image: ImageKey,
        layer: u32,
        mip: u32,
        region: Option<ImageRegion>,
        data: &[u8],
    ) -> Result<(), RenderError> {
        let mut state = self.state.lock().unwrap();
        let record = state.images.get(image).ok_or(RenderError::InvalidImage)?;
        let expected = match region {
            None => record.description.mip_size_bytes(mip),
            Some(region) => {
                region.width as u64 * region.height as u64
                    * record.description.format.bytes_per_texel()
            }
        };
        if expected != data.len() as u64 {
            return Err(RenderError::UploadSizeMismatch {
                provided: data.len() as u64,
                expected,
            });
        }

        let (staging, staging_offset) =
            Self::allocate_staging(&*self.device, &mut state, data.len() as u64)?;
        let mapped = state.buffers[staging]
            .mapped
            .expect("staging memory is always mapped");
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.add(staging_offset as usize),
                data.len(),
            );
        }

        let frame = state.current_frame as usize;
        state.schedules[frame].mapped_flushes.push(MappedFlush {
            buffer: staging,
            offset: staging_offset,
            size: data.len() as u64,
        });
        state.schedules[frame].push_upload(image, layer, mip, region, staging, staging_offset);
        Ok(())
    }

    pub fn copy_image_data(
        &self,
        source: ImageKey,
        source_layer: u32,
        source_mip: u32,
        target: ImageKey,
        target_layer: u32,
        target_mip: u32,
    ) -> Result<(), RenderError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(source) || !state.images.contains_key(target) {
            return Err(RenderError::InvalidImage);
        }
        let frame = state.current_frame as usize;
        state.schedules[frame]
            .image_operations
            .push(ImageOperation::Copy {
                source,
                source_layer,
                source_mip,
                target,
                target_layer,
                target_mip,
            });
        Ok(())
    }

    /// Schedules generation of mips `first_mip..=last_mip` of a layer
    /// from the level above `first_mip`.
    pub fn request_mip_generation(
        &self,
        image: ImageKey,
        layer: u32,
        first_mip: u32,
        last_mip: u32,
    ) -> Result<(), RenderError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(image) {
            return Err(RenderError::InvalidImage);
        }
        let frame = state.current_frame as usize;
        state.schedules[frame]
            .image_operations
            .push(ImageOperation::GenerateMips {
                image,
                layer,
                first_mip,
                last_mip,
            });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Layout registries
    // -----------------------------------------------------------------

    pub fn register_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
    ) -> Result<SetLayoutKey, RenderError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.layouts.register_set_layout(&*self.device, bindings)?)
    }

    pub fn release_set_layout(&self, layout: SetLayoutKey) {
        let mut state = self.state.lock().unwrap();
        state.layouts.release_set_layout(&*self.device, layout);
    }

    pub fn register_pipeline_layout(
        &self,
        push_constant_size: u32,
        set_layouts: &[Option<SetLayoutKey>],
    ) -> Result<PipelineLayoutKey, RenderError> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .layouts
            .register_pipeline_layout(&*self.device, push_constant_size, set_layouts)?)
    }

    pub fn release_pipeline_layout(&self, layout: PipelineLayoutKey) {
        let mut state = self.state.lock().unwrap();
        state.layouts.release_pipeline_layout(&*self.device, layout);
    }

    pub fn pipeline_layout_usage(&self, layout: PipelineLayoutKey) -> Option<u32> {
        self.state.lock().unwrap().layouts.pipeline_layout_usage(layout)
    }

    pub fn pipeline_layout_raw(
        &self,
        layout: PipelineLayoutKey,
    ) -> Option<crate::device::RawPipelineLayoutHandle> {
        self.state.lock().unwrap().layouts.pipeline_layout_raw(layout)
    }

    // -----------------------------------------------------------------
    // Frame cycle
    // -----------------------------------------------------------------

    /// Submits the current frame's scheduled work, advances the
    /// frame-in-flight index, retires frame-lifetime chunks tagged with
    /// the new index and performs its deferred destructions.
    pub fn next_frame(&self) -> Result<(), RenderError> {
        let mut state = self.state.lock().unwrap();
        self.execute_current_schedule(&mut state)?;

        state.current_frame = (state.current_frame + 1) % state.config.frames_in_flight;
        let new_frame = state.current_frame;

        state.staging.retire(new_frame);
        for (_, allocator) in state.allocators.iter_mut() {
            allocator.retire(new_frame);
        }

        self.perform_deferred_destruction(&mut state, new_frame);
        Ok(())
    }

    fn execute_current_schedule(&self, state: &mut BackendState) -> Result<(), RenderError> {
        let frame = state.current_frame as usize;
        let flushes = std::mem::take(&mut state.schedules[frame].mapped_flushes);
        let transfers = std::mem::take(&mut state.schedules[frame].buffer_transfers);
        let image_operations = std::mem::take(&mut state.schedules[frame].image_operations);

        for flush in flushes {
            if let Some(record) = state.buffers.get(flush.buffer) {
                self.device.flush_mapped(record.raw, flush.offset, flush.size);
            }
        }

        for transfer in transfers {
            let (Some(source), Some(target)) = (
                state.buffers.get(transfer.source),
                state.buffers.get(transfer.target),
            ) else {
                log::error!(target: "render", "flush transfer references a destroyed buffer");
                continue;
            };
            self.device.copy_buffer(
                source.raw,
                transfer.source_offset,
                target.raw,
                transfer.target_offset,
                transfer.size,
            )?;
        }

        for operation in image_operations {
            self.execute_image_operation(state, operation)?;
        }
        Ok(())
    }

    fn execute_image_operation(
        &self,
        state: &mut BackendState,
        operation: ImageOperation,
    ) -> Result<(), RenderError> {
        match operation {
            ImageOperation::Upload {
                image,
                layer,
                mip,
                region,
                staging,
                staging_offset,
            } => {
                let (Some(record), Some(staging_record)) =
                    (state.images.get(image), state.buffers.get(staging))
                else {
                    log::error!(target: "render", "upload references a destroyed object");
                    return Ok(());
                };
                self.device.copy_buffer_to_image(
                    staging_record.raw,
                    staging_offset,
                    record.raw,
                    layer,
                    mip,
                    region,
                )?;
                state.images[image].layer_layouts[layer as usize] =
                    ImageLayout::TransferDestination;
            }
            ImageOperation::Clear { image, layer, color } => {
                let Some(record) = state.images.get(image) else {
                    return Ok(());
                };
                self.device.clear_image(record.raw, layer, color)?;
                state.images[image].layer_layouts[layer as usize] =
                    ImageLayout::TransferDestination;
            }
            ImageOperation::Copy {
                source,
                source_layer,
                source_mip,
                target,
                target_layer,
                target_mip,
            } => {
                let (Some(source_record), Some(target_record)) =
                    (state.images.get(source), state.images.get(target))
                else {
                    return Ok(());
                };
                self.device.copy_image(
                    source_record.raw,
                    source_layer,
                    source_mip,
                    target_record.raw,
                    target_layer,
                    target_mip,
                )?;
                state.images[source].layer_layouts[source_layer as usize] =
                    ImageLayout::TransferSource;
                state.images[target].layer_layouts[target_layer as usize] =
                    ImageLayout::TransferDestination;
            }
            ImageOperation::GenerateMips {
                image,
                layer,
                first_mip,
                last_mip,
            } => {
                let Some(record) = state.images.get(image) else {
                    return Ok(());
                };
                self.device
                    .generate_mips(record.raw, layer, first_mip, last_mip)?;
                state.images[image].layer_layouts[layer as usize] = ImageLayout::ShaderRead;
            }
        }
        Ok(())
    }

    fn perform_deferred_destruction(&self, state: &mut BackendState, frame: u32) {
        let frame = frame as usize;
        let buffers = std::mem::take(&mut state.schedules[frame].destroy_buffers);
        let images = std::mem::take(&mut state.schedules[frame].destroy_images);
        let allocators = std::mem::take(&mut state.schedules[frame].destroy_allocators);

        for allocator in allocators {
            if let Some(mut entry) = state.allocators.remove(allocator) {
                for page in entry.take_all_pages() {
                    if let Some(record) = state.buffers.remove(page) {
                        self.device.destroy_buffer(record.raw);
                    }
                }
            }
        }

        for buffer in buffers {
            if let Some(record) = state.buffers.remove(buffer) {
                log::trace!(target: "render", "destroying buffer \"{}\"", record.tracking_name);
                self.device.destroy_buffer(record.raw);
            }
        }

        for image in images {
            if let Some(record) = state.images.remove(image) {
                log::trace!(target: "render", "destroying image \"{}\"", record.tracking_name);
                self.device.destroy_image(record.raw);
            }
        }
    }
}

impl Drop for RenderBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for page in state.staging.take_all_pages() {
            if let Some(record) = state.buffers.remove(page) {
                self.device.destroy_buffer(record.raw);
            }
        }
        let allocator_keys: Vec<AllocatorKey> =
            state.allocators.iter().map(|(key, _)| key).collect();
        for key in allocator_keys {
            let mut entry = state.allocators.remove(key).expect("just listed");
            for page in entry.take_all_pages() {
                if let Some(record) = state.buffers.remove(page) {
                    self.device.destroy_buffer(record.raw);
                }
            }
        }
        for (_, record) in state.buffers.drain() {
            self.device.destroy_buffer(record.raw);
        }
        for (_, record) in state.images.drain() {
            self.device.destroy_image(record.raw);
        }
        state.layouts.teardown(&*self.device);
    }
}
