//! Read-only resource pack files.
//!
//! A pack is a single file holding raw entry payloads concatenated in
//! insertion order, followed by a registry trailer mapping virtual paths
//! to `(offset, size)` ranges. A fixed-size footer at the end of the file
//! locates the trailer:
//!
//! ```text
//! [payload 0][payload 1]...[registry][registry_offset u64][registry_size u64][magic u64]
//! ```
//!
//! All footer fields are little-endian. Lookups bisect the sorted
//! registry and reads use the pre-measured range, so mounting a pack
//! never scans payload bytes.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const PACK_MAGIC: u64 = 0x4b49_4c4e_5041_4b31; // "KILNPAK1"
const FOOTER_SIZE: u64 = 24;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not a resource pack (bad magic)")]
    BadMagic,
    #[error("pack registry is corrupted: {0}")]
    CorruptRegistry(String),
    #[error("duplicate pack entry \"{0}\"")]
    DuplicateEntry(String),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct RegistryRecord {
    path: String,
    offset: u64,
    size: u64,
}

/// Streams entry payloads into a pack file and writes the registry
/// trailer on [`finish`](Self::finish).
pub struct PackBuilder {
    file: File,
    written: u64,
    records: Vec<RegistryRecord>,
}

impl PackBuilder {
    pub fn create(path: &Path) -> Result<Self, PackError> {
        Ok(PackBuilder {
            file: File::create(path)?,
            written: 0,
            records: Vec::new(),
        })
    }

    /// Appends one entry payload under `entry_path`.
    pub fn add_entry(&mut self, entry_path: &str, payload: &[u8]) -> Result<(), PackError> {
        if self.records.iter().any(|record| record.path == entry_path) {
            return Err(PackError::DuplicateEntry(entry_path.to_owned()));
        }

        self.file.write_all(payload)?;
        self.records.push(RegistryRecord {
            path: entry_path.to_owned(),
            offset: self.written,
            size: payload.len() as u64,
        });
        self.written += payload.len() as u64;
        Ok(())
    }

    /// Writes the registry and footer, consuming the builder.
    pub fn finish(mut self) -> Result<(), PackError> {
        let registry = bincode::serialize(&self.records)
            .map_err(|error| PackError::CorruptRegistry(error.to_string()))?;
        self.file.write_all(&registry)?;

        self.file.write_all(&self.written.to_le_bytes())?;
        self.file.write_all(&(registry.len() as u64).to_le_bytes())?;
        self.file.write_all(&PACK_MAGIC.to_le_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

/// Read-only view over a mounted pack.
pub struct PackReader {
    file: Mutex<File>,
    /// Sorted by path for bisection.
    records: Vec<RegistryRecord>,
}

impl PackReader {
    pub fn open(path: &Path) -> Result<Self, PackError> {
        let mut file = File::open(path)?;
        let total = file.seek(SeekFrom::End(0))?;
        if total < FOOTER_SIZE {
            return Err(PackError::BadMagic);
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        file.read_exact(&mut footer)?;

        let registry_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let registry_size = u64::from_le_bytes(footer[8..16].try_into().unwrap());
        let magic = u64::from_le_bytes(footer[16..24].try_into().unwrap());
        if magic != PACK_MAGIC {
            return Err(PackError::BadMagic);
        }
        if registry_offset + registry_size + FOOTER_SIZE != total {
            return Err(PackError::CorruptRegistry("trailer range mismatch".to_owned()));
        }

        let mut registry = vec![0u8; registry_size as usize];
        file.seek(SeekFrom::Start(registry_offset))?;
        file.read_exact(&mut registry)?;

        let mut records: Vec<RegistryRecord> = bincode::deserialize(&registry)
            .map_err(|error| PackError::CorruptRegistry(error.to_string()))?;
        records.sort_by(|left, right| left.path.cmp(&right.path));

        Ok(PackReader {
            file: Mutex::new(file),
            records,
        })
    }

    fn find(&self, entry_path: &str) -> Option<&RegistryRecord> {
        self.records
            .binary_search_by(|record| record.path.as_str().cmp(entry_path))
            .ok()
            .map(|index| &self.records[index])
    }

    pub fn contains(&self, entry_path: &str) -> bool {
        self.find(entry_path).is_some()
    }

    pub fn entry_size(&self, entry_path: &str) -> Option<u64> {
        self.find(entry_path).map(|record| record.size)
    }

    pub fn read_entry(&self, entry_path: &str) -> Result<Vec<u8>, PackError> {
        let record = self
            .find(entry_path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, entry_path.to_owned()))?;

        let mut payload = vec![0u8; record.size as usize];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(record.offset))?;
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Entry paths that live directly or transitively under `prefix`.
    pub fn entries_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.records.iter().filter_map(move |record| {
            if prefix.is_empty() {
                Some(record.path.as_str())
            } else {
                record
                    .path
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .map(|_| record.path.as_str())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_payloads() {
        let directory = tempfile::tempdir().unwrap();
        let pack_path = directory.path().join("test.pack");

        let mut builder = PackBuilder::create(&pack_path).unwrap();
        builder.add_entry("models/cube.bin", b"cube-bytes").unwrap();
        builder.add_entry("textures/wood.png", b"png-bytes").unwrap();
        builder.finish().unwrap();

        let reader = PackReader::open(&pack_path).unwrap();
        assert_eq!(reader.read_entry("models/cube.bin").unwrap(), b"cube-bytes");
        assert_eq!(reader.read_entry("textures/wood.png").unwrap(), b"png-bytes");
        assert_eq!(reader.entry_size("textures/wood.png"), Some(9));
        assert!(!reader.contains("missing"));
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let pack_path = directory.path().join("dup.pack");

        let mut builder = PackBuilder::create(&pack_path).unwrap();
        builder.add_entry("a.bin", b"one").unwrap();
        assert!(matches!(
            builder.add_entry("a.bin", b"two"),
            Err(PackError::DuplicateEntry(_))
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let pack_path = directory.path().join("broken.pack");
        std::fs::write(&pack_path, b"short").unwrap();
        assert!(matches!(PackReader::open(&pack_path), Err(PackError::BadMagic)));
    }

    #[test]
    fn entries_under_filters_by_directory() {
        let directory = tempfile::tempdir().unwrap();
        let pack_path = directory.path().join("tree.pack");

        let mut builder = PackBuilder::create(&pack_path).unwrap();
        builder.add_entry("a/one.bin", b"1").unwrap();
        builder.add_entry("a/b/two.bin", b"2").unwrap();
        builder.add_entry("c/three.bin", b"3").unwrap();
        builder.finish().unwrap();

        let reader = PackReader::open(&pack_path).unwrap();
        let under_a: Vec<_> = reader.entries_under("a").collect();
        assert_eq!(under_a, vec!["a/b/two.bin", "a/one.bin"]);
    }
}
