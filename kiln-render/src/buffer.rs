//! Buffer classification: families, types and usage derivation.

use bitflags::bitflags;
use kiln_memory::InternedString;

use crate::device::{DeviceMemoryClass, MemoryLocation, RawBufferHandle};

/// Who owns a buffer and how long its contents live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferFamily {
    /// User-owned long-lived buffer.
    Resource,
    /// Transfer source pages owned by the staging allocator.
    Staging,
    /// Host-visible frame-lifetime allocator pages.
    HostFrameLifetime,
    /// Device-local frame-lifetime allocator pages.
    DeviceFrameLifetime,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferType {
    Attribute,
    Index16,
    Index32,
    Uniform,
    Storage,
    ReadBackStorage,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const ATTRIBUTE = 1 << 2;
        const INDEX = 1 << 3;
        const UNIFORM = 1 << 4;
        const STORAGE = 1 << 5;
    }
}

/// Usage flags implied by family and type. Transfer source is always on
/// so any buffer can be read back.
pub(crate) fn derive_usage(family: BufferFamily, buffer_type: BufferType) -> BufferUsage {
    let mut usage = BufferUsage::TRANSFER_SRC;

    match family {
        BufferFamily::Resource | BufferFamily::DeviceFrameLifetime => {
            usage |= BufferUsage::TRANSFER_DST;
        }
        BufferFamily::Staging | BufferFamily::HostFrameLifetime => {}
    }

    if family != BufferFamily::Staging {
        usage |= match buffer_type {
            BufferType::Attribute => BufferUsage::ATTRIBUTE,
            BufferType::Index16 | BufferType::Index32 => BufferUsage::INDEX,
            BufferType::Uniform => BufferUsage::UNIFORM,
            BufferType::Storage => BufferUsage::STORAGE,
            BufferType::ReadBackStorage => BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
        };
    }

    usage
}

/// Memory placement implied by the device class, family and type.
pub(crate) fn derive_memory(
    class: DeviceMemoryClass,
    family: BufferFamily,
    buffer_type: BufferType,
) -> MemoryLocation {
    match class {
        // Everything is host visible on unified devices; map for writes.
        DeviceMemoryClass::Unified | DeviceMemoryClass::UnifiedCoherent => {
            MemoryLocation::HostVisibleSequential
        }
        DeviceMemoryClass::Separate => {
            if buffer_type == BufferType::ReadBackStorage {
                return MemoryLocation::HostVisibleRandom;
            }
            match family {
                BufferFamily::Resource | BufferFamily::DeviceFrameLifetime => {
                    MemoryLocation::DeviceLocal
                }
                BufferFamily::Staging | BufferFamily::HostFrameLifetime => {
                    MemoryLocation::HostVisibleSequential
                }
            }
        }
    }
}

/// Whether writes through the mapping must be flushed explicitly.
pub(crate) fn needs_flush(class: DeviceMemoryClass, location: MemoryLocation) -> bool {
    location != MemoryLocation::DeviceLocal && class != DeviceMemoryClass::UnifiedCoherent
}

pub(crate) struct BufferRecord {
    pub family: BufferFamily,
    pub buffer_type: BufferType,
    pub size: u64,
    pub raw: RawBufferHandle,
    pub mapped: Option<*mut u8>,
    pub needs_flush: bool,
    pub tracking_name: InternedString,
}

// SAFETY: the mapped pointer targets device-owned memory that is only
// reached through the backend's own synchronization.
unsafe impl Send for BufferRecord {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_src_is_always_on() {
        for family in [
            BufferFamily::Resource,
            BufferFamily::Staging,
            BufferFamily::HostFrameLifetime,
            BufferFamily::DeviceFrameLifetime,
        ] {
            assert!(derive_usage(family, BufferType::Storage).contains(BufferUsage::TRANSFER_SRC));
        }
    }

    #[test]
    fn staging_buffers_carry_no_type_usage() {
        let usage = derive_usage(BufferFamily::Staging, BufferType::Storage);
        assert_eq!(usage, BufferUsage::TRANSFER_SRC);
    }

    #[test]
    fn separate_device_splits_memory_by_family() {
        let class = DeviceMemoryClass::Separate;
        assert_eq!(
            derive_memory(class, BufferFamily::Resource, BufferType::Storage),
            MemoryLocation::DeviceLocal
        );
        assert_eq!(
            derive_memory(class, BufferFamily::Staging, BufferType::Storage),
            MemoryLocation::HostVisibleSequential
        );
        assert_eq!(
            derive_memory(class, BufferFamily::Resource, BufferType::ReadBackStorage),
            MemoryLocation::HostVisibleRandom
        );
    }

    #[test]
    fn unified_devices_map_everything() {
        assert_eq!(
            derive_memory(
                DeviceMemoryClass::Unified,
                BufferFamily::Resource,
                BufferType::Attribute
            ),
            MemoryLocation::HostVisibleSequential
        );
        assert!(needs_flush(
            DeviceMemoryClass::Unified,
            MemoryLocation::HostVisibleSequential
        ));
        assert!(!needs_flush(
            DeviceMemoryClass::UnifiedCoherent,
            MemoryLocation::HostVisibleSequential
        ));
    }
}
