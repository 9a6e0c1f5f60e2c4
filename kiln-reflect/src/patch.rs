//! Patch building, validation and application.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_memory::InternedString;
use thiserror::Error;

use crate::dynamic_array::DynamicArray;
use crate::registry::{FieldArchetype, Initializer, Registry, TypeInfo};

/// Identifies a section while a patch is being built. The root section
/// addressing the main memory block always exists and has id zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SectionHandle(u32);

impl SectionHandle {
    pub const ROOT: SectionHandle = SectionHandle(0);

    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SectionKind {
    /// Writes into existing items of the target array, growing it so
    /// every chunk offset fits.
    ArraySet,
    /// Appends one item to the target array; chunk offsets are local to
    /// the appended item. Appends run after all sets on the same array.
    ArrayAppend,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("type \"{0}\" is not registered")]
    UnknownType(InternedString),
    #[error(
        "section {section} targets offset {offset} in type \"{parent_type}\" \
         which is not a dynamic array field"
    )]
    SectionTargetNotArray {
        section: u32,
        offset: usize,
        parent_type: InternedString,
    },
    #[error("section {0} has no known item layout")]
    UnknownItemLayout(u32),
    #[error(
        "chunk at offset {offset} overwrites field \"{field}\" of type \
         \"{type_name}\"; that archetype must be reached through a section"
    )]
    ForbiddenChunkTarget {
        offset: usize,
        field: InternedString,
        type_name: InternedString,
    },
}

struct BuilderSection {
    parent: u32,
    kind: SectionKind,
    offset_in_parent: usize,
}

struct BuilderChunk {
    section: u32,
    offset: usize,
    bytes: Vec<u8>,
}

/// Accumulates chunks and sections, then [`build`](Self::build)s them
/// into an optimized immutable [`Patch`].
///
/// Duplicate sections merge and chunks are normalized during build, so
/// submission order does not matter except that later chunk bytes win
/// where chunks overlap.
pub struct PatchBuilder {
    sections: Vec<BuilderSection>,
    chunks: Vec<BuilderChunk>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        PatchBuilder {
            sections: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Declares a section reached from `parent` at `offset_in_parent`.
    /// Safe to declare the same section several times; duplicates merge
    /// during build.
    pub fn add_section(
        &mut self,
        parent: SectionHandle,
        kind: SectionKind,
        offset_in_parent: usize,
    ) -> SectionHandle {
        debug_assert!((parent.0 as usize) <= self.sections.len());
        self.sections.push(BuilderSection {
            parent: parent.0,
            kind,
            offset_in_parent,
        });
        SectionHandle(self.sections.len() as u32)
    }

    /// Adds chunk bytes at `offset` inside `section` coordinates. Data is
    /// copied in.
    pub fn add_chunk(&mut self, section: SectionHandle, offset: usize, bytes: &[u8]) {
        self.chunks.push(BuilderChunk {
            section: section.0,
            offset,
            bytes: bytes.to_vec(),
        });
    }

    /// Builds and interns the patch in `registry` for `type_name`. The
    /// builder is reset whether the build succeeds or not.
    pub fn build(
        &mut self,
        registry: &Registry,
        type_name: InternedString,
    ) -> Result<Patch, Vec<PatchError>> {
        let sections = std::mem::take(&mut self.sections);
        let chunks = std::mem::take(&mut self.chunks);

        let type_info = match registry.find(type_name) {
            Some(info) => info,
            None => return Err(vec![PatchError::UnknownType(type_name)]),
        };

        // Deduplicate sections. Parents always have lower ids than their
        // children, so one forward pass remaps everything.
        let mut remap = vec![0u32; sections.len() + 1];
        let mut unique: HashMap<(u32, SectionKind, usize), u32> = HashMap::new();
        let mut built_sections: Vec<PatchSection> = Vec::new();

        for (index, section) in sections.iter().enumerate() {
            let parent = remap[section.parent as usize];
            let key = (parent, section.kind, section.offset_in_parent);
            let id = *unique.entry(key).or_insert_with(|| {
                built_sections.push(PatchSection {
                    parent,
                    kind: section.kind,
                    offset_in_parent: section.offset_in_parent,
                    item_size: 0,
                    item_align: 0,
                    initializer: None,
                    chunks: Vec::new(),
                });
                built_sections.len() as u32
            });
            remap[index + 1] = id;
        }

        // Normalize chunks per section: insertion order decides overlap
        // winners, offsets end up sorted and disjoint.
        let mut root_pending: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut section_pending: Vec<Vec<(usize, Vec<u8>)>> = vec![Vec::new(); built_sections.len()];
        for chunk in chunks {
            let section = remap[chunk.section as usize];
            if section == 0 {
                root_pending.push((chunk.offset, chunk.bytes));
            } else {
                section_pending[section as usize - 1].push((chunk.offset, chunk.bytes));
            }
        }

        let root_chunks = merge_chunks(root_pending);
        for (section, pending) in section_pending.into_iter().enumerate() {
            built_sections[section].chunks = merge_chunks(pending);
        }

        let mut errors = Vec::new();
        self.resolve_and_validate(registry, &type_info, &root_chunks, &mut built_sections, &mut errors);

        if !errors.is_empty() {
            for error in &errors {
                log::error!(target: "reflect", "patch build: {}", error);
            }
            return Err(errors);
        }

        let mut children = vec![Vec::new(); built_sections.len() + 1];
        for (index, section) in built_sections.iter().enumerate() {
            children[section.parent as usize].push(index);
        }

        let data = Arc::new(PatchData {
            type_info,
            root_chunks,
            sections: built_sections,
            children,
        });
        registry.intern_patch(Arc::clone(&data));
        Ok(Patch { data })
    }

    /// Fills per-section item layouts and checks chunk targets against
    /// forbidden field archetypes wherever the item type is known.
    fn resolve_and_validate(
        &self,
        registry: &Registry,
        type_info: &Arc<TypeInfo>,
        root_chunks: &[Chunk],
        sections: &mut [PatchSection],
        errors: &mut Vec<PatchError>,
    ) {
        validate_chunks_against(type_info, root_chunks, None, errors);

        // Context type of each section's items; None when unknown.
        let mut contexts: Vec<Option<Arc<TypeInfo>>> = Vec::with_capacity(sections.len());
        for index in 0..sections.len() {
            let section_id = index as u32 + 1;
            let parent_context = if sections[index].parent == 0 {
                Some(Arc::clone(type_info))
            } else {
                contexts[sections[index].parent as usize - 1].clone()
            };

            let mut context = None;
            if let Some(parent_type) = parent_context {
                match parent_type.field_at(sections[index].offset_in_parent) {
                    Some(field) if field.archetype == FieldArchetype::DynamicArray => {
                        let item_type = field.item_type.and_then(|name| registry.find(name));
                        if let Some(item_type) = &item_type {
                            sections[index].item_size = item_type.size;
                            sections[index].item_align = item_type.align;
                            sections[index].initializer = item_type.initializer;
                        } else {
                            sections[index].item_size = field.item_size;
                            sections[index].item_align = field.item_align;
                        }
                        context = item_type;
                    }
                    _ => {
                        errors.push(PatchError::SectionTargetNotArray {
                            section: section_id,
                            offset: sections[index].offset_in_parent,
                            parent_type: parent_type.name,
                        });
                    }
                }
            }

            if sections[index].item_size == 0 {
                errors.push(PatchError::UnknownItemLayout(section_id));
            } else if let Some(context_type) = &context {
                let item_size = sections[index].item_size;
                match sections[index].kind {
                    SectionKind::ArraySet => {
                        validate_chunks_against(
                            context_type,
                            &sections[index].chunks,
                            Some(item_size),
                            errors,
                        );
                    }
                    SectionKind::ArrayAppend => {
                        validate_chunks_against(context_type, &sections[index].chunks, None, errors);
                    }
                }
            }

            contexts.push(context);
        }
    }
}

impl Default for PatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks that no chunk byte lands on a field whose archetype forbids
/// raw writes. With `item_size` set, chunk offsets wrap per array item.
fn validate_chunks_against(
    type_info: &TypeInfo,
    chunks: &[Chunk],
    item_size: Option<usize>,
    errors: &mut Vec<PatchError>,
) {
    for chunk in chunks {
        let mut ranges = Vec::new();
        match item_size {
            None => ranges.push((chunk.offset, chunk.offset + chunk.bytes.len())),
            Some(item_size) => {
                // Split the chunk into per-item local ranges.
                let mut begin = chunk.offset;
                let end = chunk.offset + chunk.bytes.len();
                while begin < end {
                    let local = begin % item_size;
                    let span = (item_size - local).min(end - begin);
                    ranges.push((local, local + span));
                    begin += span;
                }
            }
        }

        for (begin, end) in ranges {
            for field in &type_info.fields {
                if field.archetype.forbids_chunks()
                    && begin < field.offset + field.size
                    && end > field.offset
                {
                    errors.push(PatchError::ForbiddenChunkTarget {
                        offset: chunk.offset,
                        field: field.name,
                        type_name: type_info.name,
                    });
                }
            }
        }
    }
}

/// Merges raw chunk submissions into a sorted list of disjoint chunks.
/// Later submissions override earlier bytes on overlap; touching chunks
/// coalesce.
fn merge_chunks(pending: Vec<(usize, Vec<u8>)>) -> Vec<Chunk> {
    let mut merged: Vec<(usize, Vec<u8>)> = Vec::new();

    for (offset, bytes) in pending {
        if bytes.is_empty() {
            continue;
        }
        let end = offset + bytes.len();

        let first = merged.partition_point(|(start, data)| start + data.len() < offset);
        let mut last = first;
        while last < merged.len() && merged[last].0 <= end {
            last += 1;
        }

        if first == last {
            merged.insert(first, (offset, bytes));
            continue;
        }

        let union_start = offset.min(merged[first].0);
        let union_end = end.max(
            merged[first..last]
                .iter()
                .map(|(start, data)| start + data.len())
                .max()
                .unwrap_or(end),
        );

        let mut buffer = vec![0u8; union_end - union_start];
        for (start, data) in &merged[first..last] {
            buffer[start - union_start..start - union_start + data.len()].copy_from_slice(data);
        }
        buffer[offset - union_start..end - union_start].copy_from_slice(&bytes);

        merged.splice(first..last, std::iter::once((union_start, buffer)));
    }

    merged
        .into_iter()
        .map(|(offset, bytes)| Chunk {
            offset,
            bytes: bytes.into_boxed_slice(),
        })
        .collect()
}

#[derive(Clone, Debug)]
struct Chunk {
    offset: usize,
    bytes: Box<[u8]>,
}

struct PatchSection {
    parent: u32,
    kind: SectionKind,
    offset_in_parent: usize,
    item_size: usize,
    item_align: usize,
    initializer: Option<Initializer>,
    chunks: Vec<Chunk>,
}

pub(crate) struct PatchData {
    type_info: Arc<TypeInfo>,
    root_chunks: Vec<Chunk>,
    sections: Vec<PatchSection>,
    /// Section indices grouped by parent id (0 = root).
    children: Vec<Vec<usize>>,
}

/// Information about one section node reported during iteration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PatchSectionInfo {
    pub section_id: u32,
    pub parent_section_id: u32,
    pub kind: SectionKind,
    pub offset_in_parent: usize,
}

/// Information about one data chunk node reported during iteration.
#[derive(Clone, Copy, Debug)]
pub struct PatchChunkInfo<'a> {
    pub offset: usize,
    pub data: &'a [u8],
}

/// One node of a built patch, in emission order.
pub enum PatchNode<'a> {
    Section(PatchSectionInfo),
    Chunk(PatchChunkInfo<'a>),
}

/// Immutable optimized patch, interned in the registry it was built for.
#[derive(Clone)]
pub struct Patch {
    data: Arc<PatchData>,
}

impl Patch {
    pub fn type_name(&self) -> InternedString {
        self.data.type_info.name
    }

    pub fn chunk_count(&self) -> usize {
        self.data.root_chunks.len()
            + self
                .data
                .sections
                .iter()
                .map(|section| section.chunks.len())
                .sum::<usize>()
    }

    /// Strictly greater than every section id inside the patch.
    pub fn section_id_bound(&self) -> u32 {
        self.data.sections.len() as u32 + 1
    }

    /// Iterates patch nodes in emission order: root chunks first, then
    /// every section followed by its chunks.
    pub fn nodes(&self) -> impl Iterator<Item = PatchNode<'_>> + '_ {
        let data = &self.data;
        let root = data
            .root_chunks
            .iter()
            .map(|chunk| PatchNode::Chunk(PatchChunkInfo {
                offset: chunk.offset,
                data: &chunk.bytes,
            }));

        let sections = data.sections.iter().enumerate().flat_map(|(index, section)| {
            std::iter::once(PatchNode::Section(PatchSectionInfo {
                section_id: index as u32 + 1,
                parent_section_id: section.parent,
                kind: section.kind,
                offset_in_parent: section.offset_in_parent,
            }))
            .chain(section.chunks.iter().map(|chunk| {
                PatchNode::Chunk(PatchChunkInfo {
                    offset: chunk.offset,
                    data: &chunk.bytes,
                })
            }))
        });

        root.chain(sections)
    }

    /// Applies the patch to an instance of its target type.
    ///
    /// # Safety
    ///
    /// `target` must point to a live, properly aligned instance of the
    /// patch's target type whose dynamic array fields use the
    /// [`DynamicArray`] layout.
    pub unsafe fn apply(&self, target: *mut u8) {
        for chunk in &self.data.root_chunks {
            std::ptr::copy_nonoverlapping(
                chunk.bytes.as_ptr(),
                target.add(chunk.offset),
                chunk.bytes.len(),
            );
        }

        self.apply_children(target, 0);
    }

    /// Processes every section whose parent is `parent_id`, with offsets
    /// relative to `block`.
    unsafe fn apply_children(&self, block: *mut u8, parent_id: u32) {
        let data = &self.data;
        let child_indices = &data.children[parent_id as usize];
        if child_indices.is_empty() {
            return;
        }

        // Sections sharing one array: sets size it, appends extend it,
        // then capacity is trimmed once before any bytes are written.
        let mut by_array: Vec<(usize, Vec<usize>)> = Vec::new();
        for &index in child_indices {
            let offset = data.sections[index].offset_in_parent;
            match by_array.iter_mut().find(|(existing, _)| *existing == offset) {
                Some((_, group)) => group.push(index),
                None => by_array.push((offset, vec![index])),
            }
        }

        for (array_offset, group) in by_array {
            let array = &mut *(block.add(array_offset) as *mut DynamicArray);
            let mut append_bases: Vec<(usize, usize)> = Vec::new();

            for &index in &group {
                let section = &data.sections[index];
                if section.kind != SectionKind::ArraySet {
                    continue;
                }
                let required = section
                    .chunks
                    .iter()
                    .map(|chunk| (chunk.offset + chunk.bytes.len() + section.item_size - 1)
                        / section.item_size)
                    .max()
                    .unwrap_or(0);
                array.ensure_size(required, section.initializer);
            }

            for &index in &group {
                let section = &data.sections[index];
                if section.kind != SectionKind::ArrayAppend {
                    continue;
                }
                let slot = array.len();
                array.ensure_size(slot + 1, section.initializer);
                append_bases.push((index, slot * section.item_size));
            }

            array.trim();

            for &index in &group {
                let section = &data.sections[index];
                let base = match section.kind {
                    SectionKind::ArraySet => 0,
                    SectionKind::ArrayAppend => {
                        append_bases
                            .iter()
                            .find(|(section_index, _)| *section_index == index)
                            .map(|(_, base)| *base)
                            .unwrap_or(0)
                    }
                };

                for chunk in &section.chunks {
                    std::ptr::copy_nonoverlapping(
                        chunk.bytes.as_ptr(),
                        array.data().add(base + chunk.offset),
                        chunk.bytes.len(),
                    );
                }

                self.apply_children(array.data().add(base), index as u32 + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(pairs: &[(usize, &[u8])]) -> Vec<(usize, Vec<u8>)> {
        merge_chunks(
            pairs
                .iter()
                .map(|&(offset, bytes)| (offset, bytes.to_vec()))
                .collect(),
        )
        .into_iter()
        .map(|chunk| (chunk.offset, chunk.bytes.into_vec()))
        .collect()
    }

    #[test]
    fn disjoint_chunks_stay_sorted() {
        let merged = merge(&[(8, &[1, 1]), (0, &[2, 2])]);
        assert_eq!(merged, vec![(0, vec![2, 2]), (8, vec![1, 1])]);
    }

    #[test]
    fn adjacent_chunks_coalesce() {
        let merged = merge(&[(0, &[1, 1]), (2, &[2, 2])]);
        assert_eq!(merged, vec![(0, vec![1, 1, 2, 2])]);
    }

    #[test]
    fn later_chunks_win_on_overlap() {
        let merged = merge(&[(0, &[1, 1, 1, 1]), (1, &[9, 9])]);
        assert_eq!(merged, vec![(0, vec![1, 9, 9, 1])]);
    }

    #[test]
    fn bridging_chunk_joins_neighbours() {
        let merged = merge(&[(0, &[1, 1]), (6, &[3, 3]), (2, &[2, 2, 2, 2])]);
        assert_eq!(merged, vec![(0, vec![1, 1, 2, 2, 2, 2, 3, 3])]);
    }
}
