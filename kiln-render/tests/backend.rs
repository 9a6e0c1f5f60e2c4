use std::sync::Arc;

use kiln_memory::InternedString;
use kiln_render::{
    BufferType, DescriptorType, DeviceMemoryClass, HeadlessDevice, ImageDescription, ImageFlags,
    ImageFormat, ImageRegion, RenderBackend, RenderBackendConfig, RenderError, SetLayoutBinding,
};

fn backend(class: DeviceMemoryClass) -> (Arc<HeadlessDevice>, RenderBackend) {
    let device = Arc::new(HeadlessDevice::new(class));
    let backend = RenderBackend::new(
        device.clone(),
        RenderBackendConfig {
            frames_in_flight: 2,
            staging_page_size: 64 * 1024,
        },
    );
    (device, backend)
}

fn name(text: &str) -> InternedString {
    InternedString::intern(text)
}

#[test]
fn patch_reaches_device_local_buffers_through_staging() {
    let (device, backend) = backend(DeviceMemoryClass::Separate);
    let buffer = backend
        .create_buffer(BufferType::Storage, 64, name("patched_storage"))
        .unwrap();
    let raw = backend.buffer_raw(buffer).unwrap();

    let payload = [7u8; 16];
    backend
        .patch_buffer(buffer, 8, 16)
        .unwrap()
        .copy_from_slice(&payload);

    // Nothing lands before the frame is submitted.
    assert_eq!(&device.buffer_bytes(raw).unwrap()[8..24], &[0u8; 16]);
    backend.next_frame().unwrap();
    assert_eq!(&device.buffer_bytes(raw).unwrap()[8..24], &payload);
}

#[test]
fn patch_writes_mapped_buffers_in_place() {
    let (device, backend) = backend(DeviceMemoryClass::UnifiedCoherent);
    let buffer = backend
        .create_buffer(BufferType::Uniform, 32, name("unified_uniform"))
        .unwrap();
    let raw = backend.buffer_raw(buffer).unwrap();

    backend
        .patch_buffer(buffer, 0, 4)
        .unwrap()
        .copy_from_slice(&[1, 2, 3, 4]);

    // Unified memory needs no transfer; the bytes are already there.
    assert_eq!(&device.buffer_bytes(raw).unwrap()[..4], &[1, 2, 3, 4]);
}

#[test]
fn patch_rejects_out_of_bounds_ranges() {
    let (_, backend) = backend(DeviceMemoryClass::Separate);
    let buffer = backend
        .create_buffer(BufferType::Storage, 16, name("small"))
        .unwrap();
    assert!(matches!(
        backend.patch_buffer(buffer, 8, 16),
        Err(RenderError::OutOfBounds { .. })
    ));
}

#[test]
fn read_back_flows_through_a_scheduled_copy() {
    let (_, backend) = backend(DeviceMemoryClass::Separate);
    let storage = backend
        .create_buffer(BufferType::Storage, 32, name("source_storage"))
        .unwrap();
    let read_back = backend
        .create_buffer(BufferType::ReadBackStorage, 32, name("read_back"))
        .unwrap();

    let words: [u32; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    let payload: &[u8] = bytemuck::cast_slice(&words);
    backend
        .patch_buffer(storage, 0, 32)
        .unwrap()
        .copy_from_slice(payload);
    backend.copy_buffer_data(storage, 0, read_back, 0, 32).unwrap();
    backend.next_frame().unwrap();

    let view = backend.read_buffer(read_back).unwrap();
    assert_eq!(bytemuck::cast_slice::<u8, u32>(view.as_slice()), &words);
}

#[test]
fn only_read_back_buffers_are_readable() {
    let (_, backend) = backend(DeviceMemoryClass::Separate);
    let storage = backend
        .create_buffer(BufferType::Storage, 16, name("not_readable"))
        .unwrap();
    assert!(matches!(
        backend.read_buffer(storage),
        Err(RenderError::NotReadable)
    ));
}

#[test]
fn frame_lifetime_allocations_recycle_when_their_frame_returns() {
    let (_, backend) = backend(DeviceMemoryClass::Separate);
    let allocator =
        backend.create_frame_lifetime_allocator(BufferType::Uniform, 4096, false, name("per_frame"));

    // Frame 0.
    let first = backend.allocate_frame_lifetime(allocator, 1024, 16).unwrap();
    assert_eq!(first.offset, 0);

    // Frame 1: the frame-0 region is still in flight, so a new region
    // is used.
    backend.next_frame().unwrap();
    let second = backend.allocate_frame_lifetime(allocator, 1024, 16).unwrap();
    assert_eq!(second.buffer, first.buffer);
    assert_eq!(second.offset, 1024);

    // Frame index 0 again (two frames in flight): the frame-0 chunk
    // retires and the same offset is reused.
    backend.next_frame().unwrap();
    let third = backend.allocate_frame_lifetime(allocator, 1024, 16).unwrap();
    assert_eq!(third.buffer, first.buffer);
    assert_eq!(third.offset, 0);

    // No two live allocations overlap: frame 1's region is untouched.
    assert_ne!(third.offset, second.offset);
}

#[test]
fn destruction_is_deferred_until_the_frame_cycles_back() {
    let (device, backend) = backend(DeviceMemoryClass::Separate);
    let buffer = backend
        .create_buffer(BufferType::Storage, 16, name("doomed"))
        .unwrap();
    assert_eq!(device.live_buffer_count(), 1);

    backend.destroy_buffer(buffer);
    assert_eq!(device.live_buffer_count(), 1);

    backend.next_frame().unwrap();
    // One frame later the GPU may still be using it.
    assert_eq!(device.live_buffer_count(), 1);

    backend.next_frame().unwrap();
    assert_eq!(device.live_buffer_count(), 0);
}

#[test]
fn image_uploads_merge_and_execute_in_order() {
    let (device, backend) = backend(DeviceMemoryClass::Separate);
    let image = backend
        .create_image(
            ImageDescription {
                width: 4,
                height: 4,
                depth: 1,
                layers: 1,
                mips: 1,
                format: ImageFormat::R8Unorm,
                flags: ImageFlags::SAMPLED,
            },
            name("merged_target"),
        )
        .unwrap();
    let raw = backend.image_raw(image).unwrap();

    backend.upload_data(image, 0, 0, &[1u8; 16]).unwrap();
    // The second whole-subresource upload supersedes the first.
    backend.upload_data(image, 0, 0, &[2u8; 16]).unwrap();
    backend.next_frame().unwrap();

    assert_eq!(device.image_bytes(raw, 0, 0).unwrap(), vec![2u8; 16]);
}

#[test]
fn region_uploads_touch_only_their_rectangle() {
    let (device, backend) = backend(DeviceMemoryClass::Separate);
    let image = backend
        .create_image(
            ImageDescription {
                width: 4,
                height: 2,
                depth: 1,
                layers: 1,
                mips: 1,
                format: ImageFormat::R8Unorm,
                flags: ImageFlags::SAMPLED,
            },
            name("region_target"),
        )
        .unwrap();
    let raw = backend.image_raw(image).unwrap();

    backend
        .upload_data_region(
            image,
            0,
            0,
            ImageRegion {
                x: 2,
                y: 1,
                width: 2,
                height: 1,
            },
            &[9u8, 8],
        )
        .unwrap();
    backend.next_frame().unwrap();

    assert_eq!(
        device.image_bytes(raw, 0, 0).unwrap(),
        vec![0, 0, 0, 0, 0, 0, 9, 8]
    );
}

#[test]
fn clear_and_mip_generation_are_scheduled() {
    let (device, backend) = backend(DeviceMemoryClass::Separate);
    let image = backend
        .create_image(
            ImageDescription {
                width: 2,
                height: 2,
                depth: 1,
                layers: 1,
                mips: 2,
                format: ImageFormat::Rgba8Unorm,
                flags: ImageFlags::SAMPLED,
            },
            name("cleared"),
        )
        .unwrap();
    let raw = backend.image_raw(image).unwrap();

    backend.clear_color(image, 0, [1.0, 0.0, 0.0, 1.0]).unwrap();
    backend.request_mip_generation(image, 0, 1, 1).unwrap();
    backend.next_frame().unwrap();

    assert_eq!(
        device.image_bytes(raw, 0, 0).unwrap(),
        vec![255, 0, 0, 255, 255, 0, 0, 255, 255, 0, 0, 255, 255, 0, 0, 255]
    );
    assert_eq!(device.image_bytes(raw, 0, 1).unwrap(), vec![255, 0, 0, 255]);
}

#[test]
fn upload_size_must_match_the_subresource() {
    let (_, backend) = backend(DeviceMemoryClass::Separate);
    let image = backend
        .create_image(
            ImageDescription {
                width: 4,
                height: 4,
                depth: 1,
                layers: 1,
                mips: 1,
                format: ImageFormat::Rgba8Unorm,
                flags: ImageFlags::SAMPLED,
            },
            name("size_checked"),
        )
        .unwrap();
    assert!(matches!(
        backend.upload_data(image, 0, 0, &[0u8; 3]),
        Err(RenderError::UploadSizeMismatch { .. })
    ));
}

#[test]
fn pipeline_layout_cache_deduplicates() {
    let (device, backend) = backend(DeviceMemoryClass::Separate);
    let bindings = [
        SetLayoutBinding {
            binding: 0,
            descriptor_type: DescriptorType::UniformBuffer,
            count: 1,
        },
        SetLayoutBinding {
            binding: 1,
            descriptor_type: DescriptorType::CombinedImageSampler,
            count: 1,
        },
    ];

    let set_a = backend.register_set_layout(&bindings).unwrap();
    let set_b = backend.register_set_layout(&bindings).unwrap();
    assert_eq!(set_a, set_b);
    assert_eq!(device.live_set_layout_count(), 1);

    let first = backend
        .register_pipeline_layout(16, &[Some(set_a), None])
        .unwrap();
    let second = backend
        .register_pipeline_layout(16, &[Some(set_a), None])
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.pipeline_layout_usage(first), Some(2));
    // One real pipeline layout; the None slot used the shared empty
    // set layout.
    assert_eq!(device.live_pipeline_layout_count(), 1);

    let different = backend.register_pipeline_layout(32, &[Some(set_a), None]).unwrap();
    assert_ne!(first, different);
    assert_eq!(device.live_pipeline_layout_count(), 2);

    backend.release_pipeline_layout(first);
    assert_eq!(backend.pipeline_layout_usage(first), Some(1));
    backend.release_pipeline_layout(second);
    assert_eq!(backend.pipeline_layout_usage(first), None);
    assert_eq!(device.live_pipeline_layout_count(), 1);

    backend.release_pipeline_layout(different);
    assert_eq!(device.live_pipeline_layout_count(), 0);
}

#[test]
fn oversized_frame_lifetime_allocations_are_refused() {
    let (_, backend) = backend(DeviceMemoryClass::Separate);
    let allocator =
        backend.create_frame_lifetime_allocator(BufferType::Uniform, 1024, false, name("tiny"));
    assert!(matches!(
        backend.allocate_frame_lifetime(allocator, 4096, 16),
        Err(RenderError::OversizedAllocation { .. })
    ));
}

#[test]
fn oversized_patches_use_a_one_shot_staging_buffer() {
    let (device, backend) = backend(DeviceMemoryClass::Separate);
    let big = 128 * 1024u64; // Twice the configured staging page size.
    let buffer = backend
        .create_buffer(BufferType::Storage, big, name("huge_target"))
        .unwrap();
    let raw = backend.buffer_raw(buffer).unwrap();

    let payload = vec![5u8; big as usize];
    backend
        .patch_buffer(buffer, 0, big)
        .unwrap()
        .copy_from_slice(&payload);
    backend.next_frame().unwrap();
    assert_eq!(device.buffer_bytes(raw).unwrap(), payload);

    // The one-shot staging buffer dies when its frame cycles back.
    let before = device.live_buffer_count();
    backend.next_frame().unwrap();
    assert_eq!(device.live_buffer_count(), before - 1);
}
