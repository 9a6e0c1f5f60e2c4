//! Typed memory patching for Kiln.
//!
//! A patch is an ordered set of byte chunks grouped into sections that is
//! applied to an instance of a registered type. The root section patches
//! the instance itself; nested sections reach dynamic arrays owned by it.
//! Patches drive prefab-style data layering and deserialized resource
//! fix-up without the patch engine understanding full type semantics.

mod dynamic_array;
mod patch;
mod registry;

pub use dynamic_array::DynamicArray;
pub use patch::{
    Patch, PatchBuilder, PatchChunkInfo, PatchError, PatchNode, PatchSectionInfo, SectionHandle,
    SectionKind,
};
pub use registry::{FieldArchetype, FieldInfo, Registry, ReflectError, TypeInfo};
