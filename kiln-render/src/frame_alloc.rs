//! Frame-lifetime page and chunk bookkeeping.
//!
//! Pages are buffers split into offset-ordered chunks. Each chunk is
//! either free or owned by the frame-in-flight index that allocated it;
//! chunks retire (become free and coalesce) when their frame index comes
//! around again. The frame index is the only coordination signal, so
//! transient per-frame uploads share memory without reference counting.

use kiln_memory::InternedString;

use crate::buffer::{BufferFamily, BufferType};
use crate::BufferKey;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkOwner {
    Free,
    Frame(u32),
}

#[derive(Clone, Copy, Debug)]
struct Chunk {
    offset: u64,
    size: u64,
    owner: ChunkOwner,
}

struct Page {
    buffer: BufferKey,
    /// Offset-ordered, jointly covering the whole page.
    chunks: Vec<Chunk>,
}

pub(crate) struct FrameLifetimeAllocator {
    pub family: BufferFamily,
    pub buffer_type: BufferType,
    pub page_size: u64,
    pub tracking_name: InternedString,
    /// Name stamped on page buffers.
    pub buffer_tracking_name: InternedString,
    pages: Vec<Page>,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

impl FrameLifetimeAllocator {
    pub fn new(
        family: BufferFamily,
        buffer_type: BufferType,
        page_size: u64,
        tracking_name: InternedString,
    ) -> Self {
        debug_assert!(matches!(
            family,
            BufferFamily::Staging
                | BufferFamily::HostFrameLifetime
                | BufferFamily::DeviceFrameLifetime
        ));
        FrameLifetimeAllocator {
            family,
            buffer_type,
            page_size,
            tracking_name,
            buffer_tracking_name: InternedString::intern(&format!("fla::{}", tracking_name)),
            pages: Vec::new(),
        }
    }

    /// Attempts a sub-allocation on existing pages.
    pub fn allocate_on_existing(
        &mut self,
        size: u64,
        alignment: u64,
        current_frame: u32,
    ) -> Option<(BufferKey, u64)> {
        for page in &mut self.pages {
            if let Some(offset) = allocate_on_page(page, size, alignment, current_frame) {
                return Some((page.buffer, offset));
            }
        }
        None
    }

    /// Adds a fresh page buffer holding one free chunk.
    pub fn add_page(&mut self, buffer: BufferKey) {
        self.pages.push(Page {
            buffer,
            chunks: vec![Chunk {
                offset: 0,
                size: self.page_size,
                owner: ChunkOwner::Free,
            }],
        });
    }

    /// Adds a fresh page buffer holding one free chunk, then allocates
    /// from it.
    pub fn add_page_and_allocate(
        &mut self,
        buffer: BufferKey,
        size: u64,
        alignment: u64,
        current_frame: u32,
    ) -> Option<u64> {
        self.add_page(buffer);
        let page = self.pages.last_mut().expect("just pushed");
        allocate_on_page(page, size, alignment, current_frame)
    }

    /// Frees every chunk owned by `current_frame` and coalesces free
    /// neighbours. Called when the frame-in-flight index cycles back.
    pub fn retire(&mut self, current_frame: u32) {
        for page in &mut self.pages {
            for chunk in &mut page.chunks {
                if chunk.owner == ChunkOwner::Frame(current_frame) {
                    chunk.owner = ChunkOwner::Free;
                }
            }

            let mut merged: Vec<Chunk> = Vec::with_capacity(page.chunks.len());
            for chunk in page.chunks.drain(..) {
                match merged.last_mut() {
                    Some(previous)
                        if previous.owner == ChunkOwner::Free && chunk.owner == ChunkOwner::Free =>
                    {
                        previous.size += chunk.size;
                    }
                    _ => merged.push(chunk),
                }
            }
            page.chunks = merged;
        }
    }

    /// Removes pages that are entirely free, returning their buffers for
    /// destruction.
    pub fn take_empty_pages(&mut self) -> Vec<BufferKey> {
        let page_size = self.page_size;
        let mut buffers = Vec::new();
        self.pages.retain(|page| {
            let empty = page.chunks.len() == 1
                && page.chunks[0].owner == ChunkOwner::Free
                && page.chunks[0].size == page_size;
            if empty {
                buffers.push(page.buffer);
            }
            !empty
        });
        buffers
    }

    /// Removes every page, for allocator destruction.
    pub fn take_all_pages(&mut self) -> Vec<BufferKey> {
        self.pages.drain(..).map(|page| page.buffer).collect()
    }

    #[cfg(test)]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

fn allocate_on_page(page: &mut Page, size: u64, alignment: u64, current_frame: u32) -> Option<u64> {
    for index in 0..page.chunks.len() {
        if page.chunks[index].owner != ChunkOwner::Free {
            continue;
        }

        let chunk_offset = page.chunks[index].offset;
        let aligned_offset = align_up(chunk_offset, alignment);
        // Alignment padding is charged to the allocation.
        let allocation_size = size + aligned_offset - chunk_offset;
        if page.chunks[index].size < allocation_size {
            continue;
        }

        page.chunks[index].offset += allocation_size;
        page.chunks[index].size -= allocation_size;

        let previous_is_current_frame = index > 0
            && page.chunks[index - 1].owner == ChunkOwner::Frame(current_frame);

        if previous_is_current_frame {
            // Fold the allocation (and its padding) into the previous
            // chunk, which retires on the same frame anyway.
            page.chunks[index - 1].size += allocation_size;
            if page.chunks[index].size == 0 {
                page.chunks.remove(index);
            }
        } else if page.chunks[index].size == 0 {
            // The chunk was consumed whole; retag it instead of splitting.
            page.chunks[index].offset = chunk_offset;
            page.chunks[index].size = allocation_size;
            page.chunks[index].owner = ChunkOwner::Frame(current_frame);
        } else {
            page.chunks.insert(
                index,
                Chunk {
                    offset: chunk_offset,
                    size: allocation_size,
                    owner: ChunkOwner::Frame(current_frame),
                },
            );
        }

        return Some(aligned_offset);
    }

    None
}
