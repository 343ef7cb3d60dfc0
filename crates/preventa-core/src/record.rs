//! The synchronizable record and its content fingerprint.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;
use crate::payload::RecordPayload;
use crate::types::{EntityKind, LocalId, ServerId, TenantId, Version, Watermark};

/// Blake3 hash of a payload's CBOR encoding.
///
/// Two versions with the same fingerprint carry identical payloads, so a
/// device can skip rewriting a record it already holds.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(payload: &RecordPayload) -> Result<Self, ValidationError> {
        let bytes = encode_payload(payload)?;
        Ok(Self(*blake3::hash(&bytes).as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; 32];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Encode a payload as CBOR, the storage representation.
pub fn encode_payload(payload: &RecordPayload) -> Result<Vec<u8>, ValidationError> {
    let mut buf = Vec::new();
    ciborium::into_writer(payload, &mut buf).map_err(|e| ValidationError::Encoding(e.to_string()))?;
    Ok(buf)
}

/// Decode a payload from its CBOR storage representation.
pub fn decode_payload(bytes: &[u8]) -> Result<RecordPayload, ValidationError> {
    ciborium::from_reader(bytes).map_err(|e| ValidationError::Encoding(e.to_string()))
}

/// One stored version of a synchronizable record.
///
/// Built only by a ledger: `server_id`, `version` and `change_seq` are
/// assigned by the write that produced this version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableRecord {
    pub tenant_id: TenantId,
    pub entity_kind: EntityKind,
    pub server_id: ServerId,
    /// Local id of the device create that produced the record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
    pub version: Version,
    /// Tenant change counter value stamped by the write.
    pub change_seq: Watermark,
    /// Server time of the write (Unix ms).
    pub updated_at: i64,
    pub is_deleted: bool,
    pub fingerprint: ContentHash,
    pub payload: RecordPayload,
}

impl SyncableRecord {
    pub fn key(&self) -> (EntityKind, ServerId) {
        (self.entity_kind, self.server_id)
    }
}

/// Get current time in milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
