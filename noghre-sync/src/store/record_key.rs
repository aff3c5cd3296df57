//! Store keys partitioned by entity type.
//!
//! Every record lives under a `RecordKey`, so ids issued by the remote for
//! different entity types never collide and a whole type can be scanned or
//! invalidated by prefix.

use noghre_core::{EntityId, EntityType};

/// Separator byte between the type discriminant and the id.
const SEPARATOR: u8 = 0xFF;

/// A store key scoped to one entity type.
///
/// # Binary Format
///
/// - Byte 0: entity type discriminant
/// - Byte 1: separator (0xFF)
/// - Bytes 2..: entity id as UTF-8
///
/// Keys sort by entity type first, so an LMDB prefix scan over `[type, 0xFF]`
/// visits exactly the records of that type, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    entity_type: EntityType,
    entity_id: EntityId,
}

impl RecordKey {
    pub fn new(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn encode(&self) -> Vec<u8> {
        let id = self.entity_id.as_str().as_bytes();
        let mut bytes = Vec::with_capacity(2 + id.len());
        bytes.extend_from_slice(&Self::type_prefix(self.entity_type));
        bytes.extend_from_slice(id);
        bytes
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` if the separator is missing, the type byte is unknown or
    /// the id is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 || bytes[1] != SEPARATOR {
            return None;
        }
        let entity_type = EntityType::from_byte(bytes[0])?;
        let id = std::str::from_utf8(&bytes[2..]).ok()?;
        Some(Self::new(entity_type, EntityId::new(id)))
    }

    /// Prefix shared by every key of `entity_type`.
    pub fn type_prefix(entity_type: EntityType) -> [u8; 2] {
        [entity_type.as_byte(), SEPARATOR]
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}", self.entity_type, self.entity_id)
    }
}
