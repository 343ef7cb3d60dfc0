//! Strong type definitions for the sync engine.
//!
//! All identifiers are newtypes so a tenant id can never be passed where a
//! device id is expected, and a record version never mixes with a watermark.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Isolated customer account. Supplied by the authenticated session, never
/// read from a client payload.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mobile device registered to a tenant. Supplied by the session layer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-local temporary identifier, valid until its create is acknowledged.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.0)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable identifier assigned by the ledger on first write.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub i64);

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-record version. Zero means "never stored"; every successful write
/// advances it by exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// Version carried by a record that has not been written yet.
    pub const UNSAVED: Self = Self(0);

    /// Version assigned by the first successful write.
    pub const FIRST: Self = Self(1);

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Value of a tenant's logical change counter.
///
/// Every write stamps the record with the next counter value; a delta sync
/// asks for everything stamped after the device's last watermark. The counter
/// is owned by the ledger, so wall-clock skew on devices never causes a
/// missed delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub u64);

impl Watermark {
    /// Lower bound of a full sync.
    pub const ZERO: Self = Self(0);

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// The synchronizable entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Cliente,
    Producto,
    Visita,
    Pedido,
    Ruta,
}

impl EntityKind {
    /// All kinds in dependency order: a kind only references kinds listed
    /// before it, so pushing in this order lets a batch reference records it
    /// creates itself.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Cliente,
        EntityKind::Producto,
        EntityKind::Visita,
        EntityKind::Pedido,
        EntityKind::Ruta,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Cliente => "cliente",
            EntityKind::Producto => "producto",
            EntityKind::Visita => "visita",
            EntityKind::Pedido => "pedido",
            EntityKind::Ruta => "ruta",
        }
    }

    /// Whether devices may push mutations of this kind.
    pub const fn is_device_writable(&self) -> bool {
        !matches!(self, EntityKind::Producto)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// Composite identity of a device-side create: `(tenant, device, local id)`.
///
/// Maps to at most one [`ServerId`] for the lifetime of the tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupeKey {
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
    pub local_id: LocalId,
}

impl DedupeKey {
    pub fn new(tenant_id: TenantId, device_id: DeviceId, local_id: LocalId) -> Self {
        Self {
            tenant_id,
            device_id,
            local_id,
        }
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.device_id, self.local_id)
    }
}

/// A reference from one record to another.
///
/// On the wire a number is a server id and a string is a local id of a record
/// created by the same device. Stored records only ever hold server ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordRef {
    Server(ServerId),
    Local(LocalId),
}

impl RecordRef {
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            RecordRef::Server(id) => Some(*id),
            RecordRef::Local(_) => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, RecordRef::Server(_))
    }
}

impl From<ServerId> for RecordRef {
    fn from(id: ServerId) -> Self {
        RecordRef::Server(id)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRef::Server(id) => write!(f, "#{id}"),
            RecordRef::Local(id) => write!(f, "local:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_roundtrip_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("factura".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_only_producto_is_read_only() {
        let read_only: Vec<_> = EntityKind::ALL
            .into_iter()
            .filter(|k| !k.is_device_writable())
            .collect();
        assert_eq!(read_only, vec![EntityKind::Producto]);
    }

    #[test]
    fn test_record_ref_wire_shape() {
        let server: RecordRef = serde_json::from_str("101").unwrap();
        assert_eq!(server, RecordRef::Server(ServerId(101)));

        let local: RecordRef = serde_json::from_str("\"L1\"").unwrap();
        assert_eq!(local, RecordRef::Local(LocalId::new("L1")));
        assert!(!local.is_resolved());
    }

    #[test]
    fn test_version_next() {
        assert_eq!(Version::UNSAVED.next(), Version::FIRST);
        assert_eq!(Version(7).next(), Version(8));
    }
}
