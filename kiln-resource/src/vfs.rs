//! Virtual file system with mountable prefixes.
//!
//! Virtual paths are forward-slash separated. A mounted prefix resolves
//! to a real filesystem directory, a read-only pack or a purely virtual
//! directory. Resolution picks the longest matching prefix.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::pack::{PackError, PackReader};

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("path \"{0}\" does not resolve to any mount")]
    NotMounted(String),
    #[error("path \"{0}\" was not found")]
    NotFound(String),
    #[error("mount point \"{0}\" already exists")]
    DuplicateMount(String),
    #[error("io error on \"{path}\": {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Pack(#[from] PackError),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VfsEntryKind {
    File,
    Directory,
}

#[derive(Clone, Debug)]
pub struct VfsEntry {
    pub name: String,
    pub kind: VfsEntryKind,
}

enum MountBacking {
    RealDirectory(PathBuf),
    Pack(PackReader),
    Virtual,
}

struct Mount {
    prefix: String,
    backing: MountBacking,
}

/// Normalizes a virtual path: forward slashes, no leading/trailing
/// slash, no empty components.
fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn strip_mount_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    match path.strip_prefix(prefix) {
        Some("") => Some(""),
        Some(rest) => rest.strip_prefix('/'),
        None => None,
    }
}

/// Mount table shared by the resource provider, build tooling and tests.
pub struct VirtualFileSystem {
    mounts: RwLock<Vec<Arc<Mount>>>,
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        VirtualFileSystem {
            mounts: RwLock::new(Vec::new()),
        }
    }

    fn add_mount(&self, prefix: &str, backing: MountBacking) -> Result<(), VfsError> {
        let prefix = normalize(prefix);
        let mut mounts = self.mounts.write().unwrap();
        if mounts.iter().any(|mount| mount.prefix == prefix) {
            return Err(VfsError::DuplicateMount(prefix));
        }
        mounts.push(Arc::new(Mount { prefix, backing }));
        // Longest prefix first, so resolution can take the first match.
        mounts.sort_by(|left, right| right.prefix.len().cmp(&left.prefix.len()));
        Ok(())
    }

    /// Mounts a real filesystem directory under `prefix`.
    pub fn mount_real(&self, prefix: &str, directory: impl Into<PathBuf>) -> Result<(), VfsError> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(VfsError::NotFound(directory.display().to_string()));
        }
        self.add_mount(prefix, MountBacking::RealDirectory(directory))
    }

    /// Mounts a read-only pack file under `prefix`.
    pub fn mount_pack(&self, prefix: &str, pack_path: impl Into<PathBuf>) -> Result<(), VfsError> {
        let reader = PackReader::open(&pack_path.into())?;
        self.add_mount(prefix, MountBacking::Pack(reader))
    }

    /// Creates a purely virtual directory under `prefix`.
    pub fn mount_virtual(&self, prefix: &str) -> Result<(), VfsError> {
        self.add_mount(prefix, MountBacking::Virtual)
    }

    /// Removes the mount at exactly `prefix`. Never touches real data.
    pub fn unmount(&self, prefix: &str) -> Result<(), VfsError> {
        let prefix = normalize(prefix);
        let mut mounts = self.mounts.write().unwrap();
        let before = mounts.len();
        mounts.retain(|mount| mount.prefix != prefix);
        if mounts.len() == before {
            return Err(VfsError::NotMounted(prefix));
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> Option<(Arc<Mount>, String)> {
        let path = normalize(path);
        let mounts = self.mounts.read().unwrap();
        for mount in mounts.iter() {
            if let Some(rest) = strip_mount_prefix(&path, &mount.prefix) {
                return Some((Arc::clone(mount), rest.to_owned()));
            }
        }
        None
    }

    /// Maps a virtual path to its real filesystem location, when the
    /// resolved mount is a real directory.
    pub fn resolve_real(&self, path: &str) -> Option<PathBuf> {
        let (mount, rest) = self.resolve(path)?;
        match &mount.backing {
            MountBacking::RealDirectory(directory) => Some(directory.join(rest)),
            _ => None,
        }
    }

    /// Maps a real filesystem path back to a virtual path, when some real
    /// mount contains it.
    pub fn virtualize_real(&self, real: &std::path::Path) -> Option<String> {
        let mounts = self.mounts.read().unwrap();
        for mount in mounts.iter() {
            if let MountBacking::RealDirectory(directory) = &mount.backing {
                if let Ok(rest) = real.strip_prefix(directory) {
                    let rest = rest
                        .components()
                        .map(|component| component.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    return Some(if mount.prefix.is_empty() {
                        rest
                    } else if rest.is_empty() {
                        mount.prefix.clone()
                    } else {
                        format!("{}/{}", mount.prefix, rest)
                    });
                }
            }
        }
        None
    }

    pub fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Some((mount, rest)) => match &mount.backing {
                MountBacking::RealDirectory(directory) => directory.join(&rest).exists(),
                MountBacking::Pack(reader) => {
                    rest.is_empty()
                        || reader.contains(&rest)
                        || reader.entries_under(&rest).next().is_some()
                }
                MountBacking::Virtual => rest.is_empty(),
            },
            None => false,
        }
    }

    pub fn file_size(&self, path: &str) -> Result<u64, VfsError> {
        let (mount, rest) = self
            .resolve(path)
            .ok_or_else(|| VfsError::NotMounted(path.to_owned()))?;
        match &mount.backing {
            MountBacking::RealDirectory(directory) => {
                let real = directory.join(&rest);
                std::fs::metadata(&real)
                    .map(|metadata| metadata.len())
                    .map_err(|source| VfsError::Io {
                        path: path.to_owned(),
                        source,
                    })
            }
            MountBacking::Pack(reader) => reader
                .entry_size(&rest)
                .ok_or_else(|| VfsError::NotFound(path.to_owned())),
            MountBacking::Virtual => Err(VfsError::NotFound(path.to_owned())),
        }
    }

    /// Reads a whole file through the mount table.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let (mount, rest) = self
            .resolve(path)
            .ok_or_else(|| VfsError::NotMounted(path.to_owned()))?;
        match &mount.backing {
            MountBacking::RealDirectory(directory) => {
                let real = directory.join(&rest);
                std::fs::read(&real).map_err(|source| VfsError::Io {
                    path: path.to_owned(),
                    source,
                })
            }
            MountBacking::Pack(reader) => Ok(reader.read_entry(&rest)?),
            MountBacking::Virtual => Err(VfsError::NotFound(path.to_owned())),
        }
    }

    /// Lists direct children of a virtual directory.
    pub fn list_directory(&self, path: &str) -> Result<Vec<VfsEntry>, VfsError> {
        let normalized = normalize(path);
        let (mount, rest) = self
            .resolve(&normalized)
            .ok_or_else(|| VfsError::NotMounted(normalized.clone()))?;

        let mut entries = Vec::new();
        match &mount.backing {
            MountBacking::RealDirectory(directory) => {
                let real = directory.join(&rest);
                let listing = std::fs::read_dir(&real).map_err(|source| VfsError::Io {
                    path: normalized.clone(),
                    source,
                })?;
                for item in listing {
                    let item = item.map_err(|source| VfsError::Io {
                        path: normalized.clone(),
                        source,
                    })?;
                    let kind = if item.path().is_dir() {
                        VfsEntryKind::Directory
                    } else {
                        VfsEntryKind::File
                    };
                    entries.push(VfsEntry {
                        name: item.file_name().to_string_lossy().into_owned(),
                        kind,
                    });
                }
            }
            MountBacking::Pack(reader) => {
                let mut files = BTreeSet::new();
                let mut directories = BTreeSet::new();
                for entry_path in reader.entries_under(&rest) {
                    let local = if rest.is_empty() {
                        entry_path
                    } else {
                        &entry_path[rest.len() + 1..]
                    };
                    match local.split_once('/') {
                        Some((directory, _)) => {
                            directories.insert(directory.to_owned());
                        }
                        None => {
                            files.insert(local.to_owned());
                        }
                    }
                }
                entries.extend(directories.into_iter().map(|name| VfsEntry {
                    name,
                    kind: VfsEntryKind::Directory,
                }));
                entries.extend(files.into_iter().map(|name| VfsEntry {
                    name,
                    kind: VfsEntryKind::File,
                }));
            }
            MountBacking::Virtual => {}
        }

        // Child mounts appear as directories of their parent path.
        let mounts = self.mounts.read().unwrap();
        for other in mounts.iter() {
            if other.prefix.is_empty() {
                continue;
            }
            if let Some(child) = strip_mount_prefix(&other.prefix, &normalized) {
                if !child.is_empty() && !child.contains('/') {
                    if !entries
                        .iter()
                        .any(|entry| entry.name == child && entry.kind == VfsEntryKind::Directory)
                    {
                        entries.push(VfsEntry {
                            name: child.to_owned(),
                            kind: VfsEntryKind::Directory,
                        });
                    }
                }
            }
        }

        Ok(entries)
    }
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackBuilder;

    #[test]
    fn real_mount_reads_and_lists() {
        let directory = tempfile::tempdir().unwrap();
        std::fs::write(directory.path().join("hello.txt"), b"hi").unwrap();
        std::fs::create_dir(directory.path().join("sub")).unwrap();

        let vfs = VirtualFileSystem::new();
        vfs.mount_real("resources", directory.path()).unwrap();

        assert_eq!(vfs.read("resources/hello.txt").unwrap(), b"hi");
        assert!(vfs.exists("resources/sub"));
        assert_eq!(vfs.file_size("resources/hello.txt").unwrap(), 2);

        let mut names: Vec<_> = vfs
            .list_directory("resources")
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["hello.txt", "sub"]);
    }

    #[test]
    fn pack_mount_resolves_through_registry() {
        let directory = tempfile::tempdir().unwrap();
        let pack_path = directory.path().join("data.pack");
        let mut builder = PackBuilder::create(&pack_path).unwrap();
        builder.add_entry("meshes/cube.bin", b"cube").unwrap();
        builder.add_entry("meshes/lod/far.bin", b"far").unwrap();
        builder.finish().unwrap();

        let vfs = VirtualFileSystem::new();
        vfs.mount_pack("packed", &pack_path).unwrap();

        assert_eq!(vfs.read("packed/meshes/cube.bin").unwrap(), b"cube");
        let entries = vfs.list_directory("packed/meshes").unwrap();
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["lod", "cube.bin"]);
    }

    #[test]
    fn longest_prefix_wins() {
        let outer = tempfile::tempdir().unwrap();
        let inner = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("file.txt"), b"outer").unwrap();
        std::fs::write(inner.path().join("file.txt"), b"inner").unwrap();

        let vfs = VirtualFileSystem::new();
        vfs.mount_real("data", outer.path()).unwrap();
        vfs.mount_real("data/inner", inner.path()).unwrap();

        assert_eq!(vfs.read("data/file.txt").unwrap(), b"outer");
        assert_eq!(vfs.read("data/inner/file.txt").unwrap(), b"inner");
    }

    #[test]
    fn unmount_leaves_real_data_alone() {
        let directory = tempfile::tempdir().unwrap();
        std::fs::write(directory.path().join("kept.txt"), b"kept").unwrap();

        let vfs = VirtualFileSystem::new();
        vfs.mount_real("data", directory.path()).unwrap();
        vfs.unmount("data").unwrap();

        assert!(vfs.read("data/kept.txt").is_err());
        assert!(directory.path().join("kept.txt").exists());
        assert!(matches!(vfs.unmount("data"), Err(VfsError::NotMounted(_))));
    }

    #[test]
    fn duplicate_mounts_fail() {
        let directory = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::new();
        vfs.mount_real("spot", directory.path()).unwrap();
        assert!(matches!(
            vfs.mount_virtual("spot"),
            Err(VfsError::DuplicateMount(_))
        ));
    }

    #[test]
    fn virtualize_real_inverts_resolution() {
        let directory = tempfile::tempdir().unwrap();
        let vfs = VirtualFileSystem::new();
        vfs.mount_real("assets", directory.path()).unwrap();

        let real = directory.path().join("models/tree.bin");
        assert_eq!(
            vfs.virtualize_real(&real).as_deref(),
            Some("assets/models/tree.bin")
        );
    }
}
