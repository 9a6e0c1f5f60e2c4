//! Native resource type registration and on-disk encodings.
//!
//! Native resources come in two encodings sharing one logical layout:
//!
//! - `*.bin` — a type header (literal name or string-registry index)
//!   followed by a bincode payload;
//! - `*.rd` — readable data: a `//! type_name` sentinel line followed by
//!   a RON document.
//!
//! Any other extension is a third-party resource loaded as raw bytes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kiln_memory::InternedString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File that carries interned type names for index-encoded type headers.
pub const STRING_REGISTRY_FILE: &str = "string_registry.rd";

/// Per-directory index that pre-registers entries without a walk.
pub const RESOURCE_INDEX_FILE: &str = "resource_index.rd";

const TYPE_HEADER_LITERAL: u8 = 0;
const TYPE_HEADER_INDEX: u8 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("binary resource is truncated")]
    Truncated,
    #[error("type header kind {0} is unknown")]
    UnknownHeaderKind(u8),
    #[error("type header index {0} is outside the string registry")]
    BadRegistryIndex(u32),
    #[error("type header is not valid utf-8")]
    BadTypeName,
    #[error("readable data has no \"//! type_name\" sentinel")]
    MissingSentinel,
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Parsed `.bin` type header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeHeader {
    Literal(String),
    RegistryIndex(u32),
}

/// Splits a `.bin` payload into its type header and the payload bytes.
pub fn peek_binary_header(bytes: &[u8]) -> Result<(TypeHeader, &[u8]), EncodingError> {
    let (&kind, rest) = bytes.split_first().ok_or(EncodingError::Truncated)?;
    match kind {
        TYPE_HEADER_LITERAL => {
            if rest.len() < 2 {
                return Err(EncodingError::Truncated);
            }
            let length = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            let rest = &rest[2..];
            if rest.len() < length {
                return Err(EncodingError::Truncated);
            }
            let name = std::str::from_utf8(&rest[..length])
                .map_err(|_| EncodingError::BadTypeName)?
                .to_owned();
            Ok((TypeHeader::Literal(name), &rest[length..]))
        }
        TYPE_HEADER_INDEX => {
            if rest.len() < 4 {
                return Err(EncodingError::Truncated);
            }
            let index = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
            Ok((TypeHeader::RegistryIndex(index), &rest[4..]))
        }
        other => Err(EncodingError::UnknownHeaderKind(other)),
    }
}

fn literal_header(type_name: &str) -> Vec<u8> {
    let mut header = Vec::with_capacity(3 + type_name.len());
    header.push(TYPE_HEADER_LITERAL);
    header.extend_from_slice(&(type_name.len() as u16).to_le_bytes());
    header.extend_from_slice(type_name.as_bytes());
    header
}

/// Encodes a native resource as `.bin` bytes with a literal type header.
pub fn write_binary_resource<T: Serialize>(
    type_name: &str,
    value: &T,
) -> Result<Vec<u8>, EncodingError> {
    let mut bytes = literal_header(type_name);
    let payload = bincode::serialize(value)
        .map_err(|error| EncodingError::Serialization(error.to_string()))?;
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Rewrites a literal `.bin` type header into its string-registry index
/// form, leaving the payload untouched.
pub fn intern_binary_header(bytes: &[u8], index: u32) -> Result<Vec<u8>, EncodingError> {
    let (_, payload) = peek_binary_header(bytes)?;
    let mut interned = Vec::with_capacity(5 + payload.len());
    interned.push(TYPE_HEADER_INDEX);
    interned.extend_from_slice(&index.to_le_bytes());
    interned.extend_from_slice(payload);
    Ok(interned)
}

/// Encodes a native resource as `.rd` readable data.
pub fn write_readable_resource<T: Serialize>(
    type_name: &str,
    value: &T,
) -> Result<String, EncodingError> {
    let body = ron::ser::to_string_pretty(value, ron::ser::PrettyConfig::default())
        .map_err(|error| EncodingError::Serialization(error.to_string()))?;
    Ok(format!("//! {}\n{}\n", type_name, body))
}

/// Extracts the `//! type_name` sentinel from readable data. Leading
/// blank lines and plain comments are allowed before the sentinel.
pub fn peek_readable_type(text: &str) -> Result<String, EncodingError> {
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix("//!") {
            let name = name.trim();
            if name.is_empty() {
                return Err(EncodingError::MissingSentinel);
            }
            return Ok(name.to_owned());
        }
        if trimmed.starts_with("//") {
            continue;
        }
        break;
    }
    Err(EncodingError::MissingSentinel)
}

/// One entry of a directory resource index.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IndexedNative {
    pub type_name: String,
    pub name: String,
    pub path: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IndexedThirdParty {
    pub name: String,
    pub path: String,
    pub size: u64,
}

/// Contents of [`RESOURCE_INDEX_FILE`]: entries registered for a
/// directory without walking it.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ResourceIndex {
    pub natives: Vec<IndexedNative>,
    pub third_party: Vec<IndexedThirdParty>,
}

type ErasedValue = Arc<dyn Any + Send + Sync>;
type BinaryDeserializer = Box<dyn Fn(&[u8]) -> Result<ErasedValue, String> + Send + Sync>;
type ReadableDeserializer = Box<dyn Fn(&str) -> Result<ErasedValue, String> + Send + Sync>;

/// Deserialization hooks of one registered native resource type.
pub struct ResourceType {
    name: InternedString,
    binary: BinaryDeserializer,
    readable: ReadableDeserializer,
}

impl ResourceType {
    pub fn name(&self) -> InternedString {
        self.name
    }

    pub(crate) fn deserialize_binary(&self, payload: &[u8]) -> Result<ErasedValue, String> {
        (self.binary)(payload)
    }

    pub(crate) fn deserialize_readable(&self, text: &str) -> Result<ErasedValue, String> {
        // The sentinel line is a comment as far as RON is concerned, so
        // the full text goes through unchanged.
        (self.readable)(text)
    }
}

/// Table of native resource types the provider can deserialize.
pub struct ResourceTypeRegistry {
    types: RwLock<HashMap<InternedString, Arc<ResourceType>>>,
}

impl ResourceTypeRegistry {
    pub fn new() -> Self {
        ResourceTypeRegistry {
            types: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `T` under `name` for both encodings. Re-registration
    /// replaces the hooks, which hot code reload relies on.
    pub fn register<T>(&self, name: &str)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let name = InternedString::intern(name);
        let resource_type = Arc::new(ResourceType {
            name,
            binary: Box::new(|payload| {
                bincode::deserialize::<T>(payload)
                    .map(|value| Arc::new(value) as ErasedValue)
                    .map_err(|error| error.to_string())
            }),
            readable: Box::new(|text| {
                ron::from_str::<T>(text)
                    .map(|value| Arc::new(value) as ErasedValue)
                    .map_err(|error| error.to_string())
            }),
        });
        self.types.write().unwrap().insert(name, resource_type);
    }

    pub fn find(&self, name: InternedString) -> Option<Arc<ResourceType>> {
        self.types.read().unwrap().get(&name).cloned()
    }
}

impl Default for ResourceTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Material {
        albedo: [f32; 3],
        roughness: f32,
    }

    #[test]
    fn binary_round_trip() {
        let material = Material {
            albedo: [1.0, 0.5, 0.25],
            roughness: 0.7,
        };
        let bytes = write_binary_resource("material", &material).unwrap();
        let (header, payload) = peek_binary_header(&bytes).unwrap();
        assert_eq!(header, TypeHeader::Literal("material".to_owned()));
        assert_eq!(bincode::deserialize::<Material>(payload).unwrap(), material);
    }

    #[test]
    fn interned_header_round_trip() {
        let material = Material {
            albedo: [0.0; 3],
            roughness: 1.0,
        };
        let bytes = write_binary_resource("material", &material).unwrap();
        let interned = intern_binary_header(&bytes, 3).unwrap();
        let (header, payload) = peek_binary_header(&interned).unwrap();
        assert_eq!(header, TypeHeader::RegistryIndex(3));
        assert_eq!(bincode::deserialize::<Material>(payload).unwrap(), material);
    }

    #[test]
    fn readable_sentinel_is_parsed() {
        let material = Material {
            albedo: [0.1, 0.2, 0.3],
            roughness: 0.4,
        };
        let text = write_readable_resource("material", &material).unwrap();
        assert_eq!(peek_readable_type(&text).unwrap(), "material");

        let registry = ResourceTypeRegistry::new();
        registry.register::<Material>("material");
        let resource_type = registry.find(InternedString::intern("material")).unwrap();
        let value = resource_type.deserialize_readable(&text).unwrap();
        assert_eq!(*value.downcast::<Material>().unwrap(), material);
    }

    #[test]
    fn sentinel_is_required() {
        assert_eq!(
            peek_readable_type("(albedo: (1.0, 1.0, 1.0))"),
            Err(EncodingError::MissingSentinel)
        );
        assert_eq!(
            peek_readable_type("// just a comment\n//! material\n()"),
            Ok("material".to_owned())
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(peek_binary_header(&[]), Err(EncodingError::Truncated));
        assert_eq!(
            peek_binary_header(&[9, 0, 0]),
            Err(EncodingError::UnknownHeaderKind(9))
        );
        assert_eq!(
            peek_binary_header(&[TYPE_HEADER_LITERAL, 10, 0, b'a']),
            Err(EncodingError::Truncated)
        );
    }
}
