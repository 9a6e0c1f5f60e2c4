//! Per-frame-in-flight operation schedules.
//!
//! Every category keeps its own list and executes in insertion order;
//! lists of different categories are independent. Destruction lists are
//! performed only when their frame-in-flight index cycles back, which is
//! when the GPU is provably done with the objects.

use crate::image::ImageRegion;
use crate::{AllocatorKey, BufferKey, ImageKey};

/// Flush of a mapped range written by the host.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MappedFlush {
    pub buffer: BufferKey,
    pub offset: u64,
    pub size: u64,
}

/// Copy of staged bytes into their destination buffer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BufferFlushTransfer {
    pub source: BufferKey,
    pub source_offset: u64,
    pub target: BufferKey,
    pub target_offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum ImageOperation {
    Upload {
        image: ImageKey,
        layer: u32,
        mip: u32,
        region: Option<ImageRegion>,
        staging: BufferKey,
        staging_offset: u64,
    },
    Clear {
        image: ImageKey,
        layer: u32,
        color: [f32; 4],
    },
    Copy {
        source: ImageKey,
        source_layer: u32,
        source_mip: u32,
        target: ImageKey,
        target_layer: u32,
        target_mip: u32,
    },
    GenerateMips {
        image: ImageKey,
        layer: u32,
        first_mip: u32,
        last_mip: u32,
    },
}

#[derive(Default)]
pub(crate) struct FrameSchedule {
    pub mapped_flushes: Vec<MappedFlush>,
    pub buffer_transfers: Vec<BufferFlushTransfer>,
    pub image_operations: Vec<ImageOperation>,
    pub destroy_buffers: Vec<BufferKey>,
    pub destroy_images: Vec<ImageKey>,
    pub destroy_allocators: Vec<AllocatorKey>,
}

impl FrameSchedule {
    /// Queues an upload, merging with a previous whole-subresource
    /// upload of the same (image, layer, mip): the later data wins.
    pub fn push_upload(
        &mut self,
        image: ImageKey,
        layer: u32,
        mip: u32,
        region: Option<ImageRegion>,
        staging: BufferKey,
        staging_offset: u64,
    ) {
        if region.is_none() {
            for operation in &mut self.image_operations {
                if let ImageOperation::Upload {
                    image: existing_image,
                    layer: existing_layer,
                    mip: existing_mip,
                    region: None,
                    staging: existing_staging,
                    staging_offset: existing_offset,
                } = operation
                {
                    if *existing_image == image && *existing_layer == layer && *existing_mip == mip
                    {
                        *existing_staging = staging;
                        *existing_offset = staging_offset;
                        return;
                    }
                }
            }
        }

        self.image_operations.push(ImageOperation::Upload {
            image,
            layer,
            mip,
            region,
            staging,
            staging_offset,
        });
    }
}
