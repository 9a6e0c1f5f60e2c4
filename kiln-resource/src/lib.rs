//! Resource pipeline for Kiln: virtual file system, read-only packs, a
//! content scanner and the request-driven resource provider with hot
//! reload, plus the `resource_build` tool that packs project resources.

mod pack;
mod project;
mod provider;
mod types;
mod vfs;
mod watcher;

pub use pack::{PackBuilder, PackError, PackReader};
pub use project::{BuildLock, ProjectError, ResourceProject};
pub use provider::{
    ContainerId, EntryChangedEvent, EntryId, NativeEntry, ProviderConfig, RequestId,
    RequestOutcome, RequestUpdatedEvent, ResourceProvider, ThirdPartyEntry, USER_PRIORITY_MAX,
    USER_PRIORITY_MIN,
};
pub use types::{
    intern_binary_header, peek_binary_header, peek_readable_type, write_binary_resource,
    write_readable_resource, EncodingError, IndexedNative, IndexedThirdParty, ResourceIndex,
    ResourceType, ResourceTypeRegistry, TypeHeader, RESOURCE_INDEX_FILE, STRING_REGISTRY_FILE,
};
pub use vfs::{VfsEntry, VfsEntryKind, VfsError, VirtualFileSystem};
