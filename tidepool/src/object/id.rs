//! Object identifiers and the identity allocator.
//!
//! # Layout
//!
//! An [`ObjectId`] is 32 bytes, rendered as 64 lowercase hex characters:
//!
//! ```text
//! [kind:1][jurisdiction:1][namespace tag:4][body:26]
//! ```
//!
//! - **kind**: `0x01` for ids derived from a name, `0x02` for random ids
//! - **jurisdiction**: `0x00` when unrestricted, otherwise [`Jurisdiction::code`]
//! - **namespace tag**: first 4 bytes of SHA-256 over the namespace name
//! - **body**: SHA-256 digest (named) or OS randomness (unique), 208 bits
//!
//! The namespace tag lets a namespace reject ids that another namespace
//! allocated, and lets the runtime find the binding for an id it reads back
//! from storage.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AllocationError;

/// Total identifier width in bytes.
pub const ID_LEN: usize = 32;

/// Maximum length, in bytes, of a name passed to `id_from_name`.
pub const MAX_NAME_LEN: usize = 2048;

const KIND_NAMED: u8 = 0x01;
const KIND_UNIQUE: u8 = 0x02;
const BODY_OFFSET: usize = 6;

/// Placement constraint restricting where an object's state may live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jurisdiction {
    /// European Union.
    Eu,
    /// FedRAMP-compliant regions.
    FedRamp,
}

impl Jurisdiction {
    /// Tag stored in byte 1 of an [`ObjectId`].
    pub fn code(self) -> u8 {
        match self {
            Jurisdiction::Eu => 1,
            Jurisdiction::FedRamp => 2,
        }
    }

    /// Inverse of [`code`](Self::code). `0` and unknown codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Jurisdiction::Eu),
            2 => Some(Jurisdiction::FedRamp),
            _ => None,
        }
    }

    /// Lowercase name, as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Jurisdiction::Eu => "eu",
            Jurisdiction::FedRamp => "fedramp",
        }
    }
}

impl fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Jurisdiction {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eu" => Ok(Jurisdiction::Eu),
            "fedramp" => Ok(Jurisdiction::FedRamp),
            _ => Err(AllocationError::UnknownJurisdiction(s.to_string())),
        }
    }
}

/// How an [`ObjectId`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// Derived deterministically from a name.
    Named,
    /// Drawn from the OS random number generator.
    Unique,
}

/// Opaque, fixed-width identifier of an object.
///
/// Equality and hashing use the 32 id bytes only. The originating name,
/// when known, is carried along for diagnostics.
#[derive(Clone)]
pub struct ObjectId {
    bytes: [u8; ID_LEN],
    name: Option<Arc<str>>,
}

impl ObjectId {
    /// Derive the id for `name` within `namespace`.
    ///
    /// Pure and deterministic: the same `(namespace, jurisdiction, name)`
    /// always produces the same id.
    pub(crate) fn named(
        namespace: &str,
        jurisdiction: Option<Jurisdiction>,
        name: &str,
    ) -> Result<Self, AllocationError> {
        if name.is_empty() {
            return Err(AllocationError::EmptyName);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(AllocationError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(b"tidepool.named\0");
        hasher.update((namespace.len() as u64).to_le_bytes());
        hasher.update(namespace.as_bytes());
        hasher.update([jurisdiction.map_or(0, Jurisdiction::code)]);
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = header(KIND_NAMED, namespace, jurisdiction);
        bytes[BODY_OFFSET..].copy_from_slice(&digest[..ID_LEN - BODY_OFFSET]);

        Ok(Self {
            bytes,
            name: Some(Arc::from(name)),
        })
    }

    /// Draw a fresh random id within `namespace`.
    pub(crate) fn unique(namespace: &str, jurisdiction: Option<Jurisdiction>) -> Self {
        let mut bytes = header(KIND_UNIQUE, namespace, jurisdiction);
        OsRng.fill_bytes(&mut bytes[BODY_OFFSET..]);
        Self { bytes, name: None }
    }

    /// Parse a 64-character hex rendering.
    ///
    /// Checks the kind and jurisdiction tags but not the namespace; use
    /// [`Namespace::id_from_string`](crate::Namespace::id_from_string) for that.
    pub fn parse(hex_id: &str) -> Result<Self, AllocationError> {
        if hex_id.len() != ID_LEN * 2 {
            return Err(AllocationError::Malformed(format!(
                "expected {} hex characters, got {}",
                ID_LEN * 2,
                hex_id.len()
            )));
        }
        let mut bytes = [0u8; ID_LEN];
        hex::decode_to_slice(hex_id, &mut bytes)
            .map_err(|e| AllocationError::Malformed(e.to_string()))?;

        if bytes[0] != KIND_NAMED && bytes[0] != KIND_UNIQUE {
            return Err(AllocationError::Malformed(format!(
                "unknown kind tag {:#04x}",
                bytes[0]
            )));
        }
        if bytes[1] != 0 && Jurisdiction::from_code(bytes[1]).is_none() {
            return Err(AllocationError::Malformed(format!(
                "unknown jurisdiction tag {:#04x}",
                bytes[1]
            )));
        }

        Ok(Self { bytes, name: None })
    }

    /// Whether the id was derived from a name or drawn at random.
    pub fn kind(&self) -> IdKind {
        if self.bytes[0] == KIND_NAMED {
            IdKind::Named
        } else {
            IdKind::Unique
        }
    }

    /// Jurisdiction the object must be placed in, if any.
    pub fn jurisdiction(&self) -> Option<Jurisdiction> {
        Jurisdiction::from_code(self.bytes[1])
    }

    /// The name this id was derived from, when it was built in this process.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.bytes
    }

    /// 64-character lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Whether this id was allocated by `namespace`.
    pub fn belongs_to(&self, namespace: &str) -> bool {
        self.namespace_tag() == namespace_tag(namespace)
    }

    pub(crate) fn namespace_tag(&self) -> [u8; 4] {
        [self.bytes[2], self.bytes[3], self.bytes[4], self.bytes[5]]
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ObjectId");
        s.field("hex", &self.to_hex());
        if let Some(name) = &self.name {
            s.field("name", name);
        }
        s.finish()
    }
}

impl FromStr for ObjectId {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// First 4 bytes of SHA-256 over the namespace name.
pub(crate) fn namespace_tag(namespace: &str) -> [u8; 4] {
    let digest = Sha256::new()
        .chain_update(b"tidepool.namespace\0")
        .chain_update(namespace.as_bytes())
        .finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

fn header(kind: u8, namespace: &str, jurisdiction: Option<Jurisdiction>) -> [u8; ID_LEN] {
    let mut bytes = [0u8; ID_LEN];
    bytes[0] = kind;
    bytes[1] = jurisdiction.map_or(0, Jurisdiction::code);
    bytes[2..BODY_OFFSET].copy_from_slice(&namespace_tag(namespace));
    bytes
}

/// Derive the deterministic id for `name` in `namespace`.
pub fn id_from_name(namespace: &str, name: &str) -> Result<ObjectId, AllocationError> {
    ObjectId::named(namespace, None, name)
}

/// Allocate a fresh id in `namespace`, optionally tagged with a jurisdiction.
pub fn new_unique_id(namespace: &str, jurisdiction: Option<Jurisdiction>) -> ObjectId {
    ObjectId::unique(namespace, jurisdiction)
}

/// Parse a rendered id and check that it belongs to `namespace`.
pub fn id_from_string(namespace: &str, hex_id: &str) -> Result<ObjectId, AllocationError> {
    let id = ObjectId::parse(hex_id)?;
    if !id.belongs_to(namespace) {
        return Err(AllocationError::ForeignNamespace {
            id: id.to_hex(),
            namespace: namespace.to_string(),
        });
    }
    Ok(id)
}
