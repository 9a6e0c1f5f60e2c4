use std::mem::{align_of, offset_of, size_of};

use kiln_memory::{AllocationGroup, InternedString};
use kiln_reflect::{
    DynamicArray, FieldArchetype, FieldInfo, Patch, PatchBuilder, PatchError, PatchNode, Registry,
    SectionHandle, SectionKind, TypeInfo,
};

#[repr(C)]
struct Target {
    a: i32,
    b: i32,
    items: DynamicArray,
}

impl Target {
    fn new() -> Self {
        Target {
            a: 0,
            b: 0,
            items: DynamicArray::for_item::<i32>(AllocationGroup::IGNORE),
        }
    }
}

fn register_target(registry: &Registry, name: &str) -> InternedString {
    let name = InternedString::intern(name);
    registry
        .register(TypeInfo {
            name,
            size: size_of::<Target>(),
            align: align_of::<Target>(),
            initializer: None,
            fields: vec![
                FieldInfo::data("a", offset_of!(Target, a), size_of::<i32>()),
                FieldInfo::data("b", offset_of!(Target, b), size_of::<i32>()),
                FieldInfo::dynamic_array(
                    "items",
                    offset_of!(Target, items),
                    size_of::<DynamicArray>(),
                    None,
                    size_of::<i32>(),
                    align_of::<i32>(),
                ),
            ],
        })
        .unwrap();
    name
}

fn items_section(builder: &mut PatchBuilder, kind: SectionKind) -> SectionHandle {
    builder.add_section(SectionHandle::ROOT, kind, offset_of!(Target, items))
}

#[test]
fn apply_sets_scalars_and_grows_arrays() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_grow");

    let mut builder = PatchBuilder::new();
    builder.add_chunk(SectionHandle::ROOT, offset_of!(Target, a), bytemuck::bytes_of(&7i32));
    let section = items_section(&mut builder, SectionKind::ArraySet);
    builder.add_chunk(section, 2 * size_of::<i32>(), bytemuck::bytes_of(&5i32));
    let patch = builder.build(&registry, type_name).unwrap();

    let mut target = Target::new();
    unsafe { patch.apply(&mut target as *mut Target as *mut u8) };

    assert_eq!(target.a, 7);
    assert_eq!(target.b, 0);
    assert_eq!(target.items.len(), 3);
    assert_eq!(unsafe { target.items.as_slice::<i32>() }, &[0, 0, 5]);
    // Dangling capacity from the growth is trimmed away.
    assert_eq!(target.items.capacity(), 3);
}

#[test]
fn apply_is_a_pure_function_of_chunk_bytes() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_pure");

    let mut builder = PatchBuilder::new();
    builder.add_chunk(SectionHandle::ROOT, offset_of!(Target, b), bytemuck::bytes_of(&41i32));
    let section = items_section(&mut builder, SectionKind::ArraySet);
    builder.add_chunk(section, 0, bytemuck::bytes_of(&3i32));
    let patch = builder.build(&registry, type_name).unwrap();

    let mut first = Target::new();
    let mut second = Target::new();
    unsafe {
        patch.apply(&mut first as *mut Target as *mut u8);
        patch.apply(&mut second as *mut Target as *mut u8);
    }

    assert_eq!(first.a, second.a);
    assert_eq!(first.b, second.b);
    assert_eq!(unsafe { first.items.as_slice::<i32>() }, unsafe {
        second.items.as_slice::<i32>()
    });
}

#[test]
fn append_creates_a_fresh_slot() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_append");

    let mut builder = PatchBuilder::new();
    let set = items_section(&mut builder, SectionKind::ArraySet);
    builder.add_chunk(set, 0, bytemuck::bytes_of(&1i32));
    builder.add_chunk(set, size_of::<i32>(), bytemuck::bytes_of(&2i32));
    let append = items_section(&mut builder, SectionKind::ArrayAppend);
    builder.add_chunk(append, 0, bytemuck::bytes_of(&9i32));
    let patch = builder.build(&registry, type_name).unwrap();

    let mut target = Target::new();
    unsafe { patch.apply(&mut target as *mut Target as *mut u8) };

    assert_eq!(unsafe { target.items.as_slice::<i32>() }, &[1, 2, 9]);
}

#[test]
fn duplicate_sections_merge() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_dedup");

    let mut builder = PatchBuilder::new();
    let first = items_section(&mut builder, SectionKind::ArraySet);
    builder.add_chunk(first, 0, bytemuck::bytes_of(&1i32));
    let second = items_section(&mut builder, SectionKind::ArraySet);
    builder.add_chunk(second, size_of::<i32>(), bytemuck::bytes_of(&2i32));
    assert_ne!(first, second);

    let patch = builder.build(&registry, type_name).unwrap();
    assert_eq!(patch.section_id_bound(), 2);

    let mut target = Target::new();
    unsafe { patch.apply(&mut target as *mut Target as *mut u8) };
    assert_eq!(unsafe { target.items.as_slice::<i32>() }, &[1, 2]);
}

#[test]
fn overlapping_chunks_later_wins() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_overlap");

    let mut builder = PatchBuilder::new();
    builder.add_chunk(SectionHandle::ROOT, offset_of!(Target, a), bytemuck::bytes_of(&1i32));
    builder.add_chunk(SectionHandle::ROOT, offset_of!(Target, a), bytemuck::bytes_of(&2i32));
    let patch = builder.build(&registry, type_name).unwrap();

    // Adjacent writes to a and b merge into one chunk.
    builder.add_chunk(SectionHandle::ROOT, offset_of!(Target, a), bytemuck::bytes_of(&3i32));
    builder.add_chunk(SectionHandle::ROOT, offset_of!(Target, b), bytemuck::bytes_of(&4i32));
    let merged = builder.build(&registry, type_name).unwrap();
    assert_eq!(merged.chunk_count(), 1);

    let mut target = Target::new();
    unsafe { patch.apply(&mut target as *mut Target as *mut u8) };
    assert_eq!(target.a, 2);
}

#[test]
fn chunks_must_not_overwrite_array_fields() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_forbidden");

    let mut builder = PatchBuilder::new();
    builder.add_chunk(
        SectionHandle::ROOT,
        offset_of!(Target, items),
        &[0u8; size_of::<usize>()],
    );
    let errors = builder.build(&registry, type_name).err().unwrap();
    assert!(matches!(errors[0], PatchError::ForbiddenChunkTarget { .. }));
}

#[test]
fn sections_must_target_array_fields() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_bad_section");

    let mut builder = PatchBuilder::new();
    let section = builder.add_section(SectionHandle::ROOT, SectionKind::ArraySet, offset_of!(Target, a));
    builder.add_chunk(section, 0, bytemuck::bytes_of(&1i32));
    let errors = builder.build(&registry, type_name).err().unwrap();
    assert!(errors
        .iter()
        .any(|error| matches!(error, PatchError::SectionTargetNotArray { .. })));
}

#[test]
fn unknown_type_is_rejected() {
    let registry = Registry::new();
    let mut builder = PatchBuilder::new();
    builder.add_chunk(SectionHandle::ROOT, 0, &[0u8; 4]);
    let errors = builder
        .build(&registry, InternedString::intern("patch_test_missing_type"))
        .err()
        .unwrap();
    assert_eq!(errors, vec![PatchError::UnknownType(InternedString::intern(
        "patch_test_missing_type"
    ))]);
}

#[test]
fn iteration_reports_nodes_in_emission_order() {
    let registry = Registry::new();
    let type_name = register_target(&registry, "patch_test_iteration");

    let mut builder = PatchBuilder::new();
    builder.add_chunk(SectionHandle::ROOT, offset_of!(Target, a), bytemuck::bytes_of(&1i32));
    let section = items_section(&mut builder, SectionKind::ArraySet);
    builder.add_chunk(section, 0, bytemuck::bytes_of(&2i32));
    let patch = builder.build(&registry, type_name).unwrap();

    let nodes: Vec<_> = patch.nodes().collect();
    assert_eq!(nodes.len(), 3);
    assert!(matches!(nodes[0], PatchNode::Chunk(_)));
    match &nodes[1] {
        PatchNode::Section(info) => {
            assert_eq!(info.section_id, 1);
            assert_eq!(info.parent_section_id, 0);
            assert_eq!(info.kind, SectionKind::ArraySet);
            assert_eq!(info.offset_in_parent, offset_of!(Target, items));
        }
        PatchNode::Chunk(_) => panic!("expected a section node"),
    }
    assert!(matches!(nodes[2], PatchNode::Chunk(_)));
}

#[test]
fn string_pointer_fields_are_protected() {
    let registry = Registry::new();
    let name = InternedString::intern("patch_test_pointer_type");
    registry
        .register(TypeInfo {
            name,
            size: 16,
            align: 8,
            initializer: None,
            fields: vec![
                FieldInfo::data("plain", 0, 8),
                FieldInfo::pointer_like("text", 8, 8, FieldArchetype::StringPointer),
            ],
        })
        .unwrap();

    let mut builder = PatchBuilder::new();
    builder.add_chunk(SectionHandle::ROOT, 8, &[0u8; 8]);
    let errors = builder.build(&registry, name).err().unwrap();
    assert!(matches!(errors[0], PatchError::ForbiddenChunkTarget { .. }));

    builder.add_chunk(SectionHandle::ROOT, 0, &[0u8; 8]);
    assert!(builder.build(&registry, name).is_ok());
}

#[allow(dead_code)]
fn patch_type_is_shareable(patch: Patch) -> Patch {
    patch.clone()
}
