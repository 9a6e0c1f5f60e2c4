//! Minimal type registry backing patch validation and application.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kiln_memory::InternedString;
use thiserror::Error;

/// Initializer run over freshly created instances, e.g. new dynamic
/// array slots. Memory is zeroed before the initializer runs.
pub type Initializer = fn(*mut u8);

/// What a field fundamentally stores, as far as the patch engine cares.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldArchetype {
    /// Inline plain data; a valid chunk target.
    Data,
    /// Shared string identity; points outside the instance.
    StringPointer,
    /// Owned pointer to another struct.
    StructPointer,
    /// Owned growable array; reached through patch sections only.
    DynamicArray,
    /// Nested patch handle.
    Patch,
}

impl FieldArchetype {
    /// Archetypes that point at memory outside the containing block and
    /// therefore must never be overwritten by raw chunk bytes.
    pub fn forbids_chunks(self) -> bool {
        !matches!(self, FieldArchetype::Data)
    }
}

#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: InternedString,
    pub offset: usize,
    pub size: usize,
    pub archetype: FieldArchetype,
    /// Item type for [`FieldArchetype::DynamicArray`] fields, when the
    /// item is a registered struct.
    pub item_type: Option<InternedString>,
    /// Item layout for dynamic array fields with unregistered items.
    pub item_size: usize,
    pub item_align: usize,
}

impl FieldInfo {
    pub fn data(name: impl Into<InternedString>, offset: usize, size: usize) -> Self {
        FieldInfo {
            name: name.into(),
            offset,
            size,
            archetype: FieldArchetype::Data,
            item_type: None,
            item_size: 0,
            item_align: 0,
        }
    }

    pub fn dynamic_array(
        name: impl Into<InternedString>,
        offset: usize,
        size: usize,
        item_type: Option<InternedString>,
        item_size: usize,
        item_align: usize,
    ) -> Self {
        FieldInfo {
            name: name.into(),
            offset,
            size,
            archetype: FieldArchetype::DynamicArray,
            item_type,
            item_size,
            item_align,
        }
    }

    pub fn pointer_like(
        name: impl Into<InternedString>,
        offset: usize,
        size: usize,
        archetype: FieldArchetype,
    ) -> Self {
        debug_assert!(archetype.forbids_chunks());
        FieldInfo {
            name: name.into(),
            offset,
            size,
            archetype,
            item_type: None,
            item_size: 0,
            item_align: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TypeInfo {
    pub name: InternedString,
    pub size: usize,
    pub align: usize,
    pub initializer: Option<Initializer>,
    pub fields: Vec<FieldInfo>,
}

impl TypeInfo {
    pub fn field_at(&self, offset: usize) -> Option<&FieldInfo> {
        self.fields
            .iter()
            .find(|field| offset >= field.offset && offset < field.offset + field.size)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReflectError {
    #[error("type \"{0}\" is already registered")]
    DuplicateType(InternedString),
    #[error("type \"{0}\" is not registered")]
    UnknownType(InternedString),
}

/// Shared table of registered types. Patches built against a registry
/// are interned in it and stay alive as long as the registry does.
pub struct Registry {
    types: Mutex<HashMap<InternedString, Arc<TypeInfo>>>,
    patches: Mutex<Vec<Arc<crate::patch::PatchData>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            types: Mutex::new(HashMap::new()),
            patches: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, info: TypeInfo) -> Result<(), ReflectError> {
        let mut types = self.types.lock().unwrap();
        if types.contains_key(&info.name) {
            return Err(ReflectError::DuplicateType(info.name));
        }
        types.insert(info.name, Arc::new(info));
        Ok(())
    }

    pub fn find(&self, name: InternedString) -> Option<Arc<TypeInfo>> {
        self.types.lock().unwrap().get(&name).cloned()
    }

    pub(crate) fn intern_patch(&self, patch: Arc<crate::patch::PatchData>) {
        self.patches.lock().unwrap().push(patch);
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
