//! Typed record payloads, one variant per entity kind.
//!
//! Each payload struct holds the fields the engine understands plus a single
//! opaque `extensions` map for forward-compatible custom attributes.
//! Parent records that own ordered children (order lines, route stops) keep
//! them inline so parent and children are always versioned together.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{EntityKind, RecordRef};

/// Opaque custom attributes carried alongside the typed fields.
pub type Extensions = BTreeMap<String, serde_json::Value>;

fn default_true() -> bool {
    true
}

/// A customer account visited by the sales force.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cliente {
    pub nombre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telefono: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direccion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitud: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitud: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lista_precios_id: Option<i64>,
    #[serde(default = "default_true")]
    pub activo: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstadoPedido {
    Borrador,
    Confirmado,
    Entregado,
    Cancelado,
}

/// One line of an order. `linea` is the line's stable key within the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineaPedido {
    pub linea: u32,
    pub producto_id: RecordRef,
    pub cantidad: u32,
    /// Unit price in cents.
    pub precio_unitario: i64,
    /// Discount in cents, applied to the line total.
    #[serde(default)]
    pub descuento: i64,
}

impl LineaPedido {
    /// Line amount in cents, `None` when it does not fit in an `i64`.
    pub fn total(&self) -> Option<i64> {
        self.precio_unitario
            .checked_mul(i64::from(self.cantidad))?
            .checked_sub(self.descuento)
    }
}

/// A sales order with its ordered lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pedido {
    pub cliente_id: RecordRef,
    /// Order date (Unix ms).
    pub fecha: i64,
    pub estado: EstadoPedido,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notas: Option<String>,
    #[serde(default)]
    pub lineas: Vec<LineaPedido>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: Extensions,
}

impl Pedido {
    pub fn total(&self) -> Option<i64> {
        self.lineas
            .iter()
            .try_fold(0i64, |acc, linea| acc.checked_add(linea.total()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultadoVisita {
    Venta,
    SinVenta,
    Cerrado,
    Reprogramada,
}

/// A scheduled or completed visit to a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visita {
    pub cliente_id: RecordRef,
    /// Scheduled time (Unix ms).
    pub programada_para: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realizada_en: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resultado: Option<ResultadoVisita>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitud: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitud: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: Extensions,
}

/// One stop of a route. `orden` is the stop's stable key within the route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParadaRuta {
    pub orden: u32,
    pub cliente_id: RecordRef,
    #[serde(default)]
    pub visitada: bool,
}

/// A day route with its ordered stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ruta {
    pub nombre: String,
    /// Route date (Unix ms).
    pub fecha: i64,
    #[serde(default)]
    pub paradas: Vec<ParadaRuta>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: Extensions,
}

/// A catalog product. Devices only read products.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Producto {
    pub sku: String,
    pub nombre: String,
    /// List price in cents.
    pub precio: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unidad: Option<String>,
    #[serde(default = "default_true")]
    pub activo: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: Extensions,
}

/// Names the child of a parent record that a conflict or error concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    /// `"lineas"` or `"paradas"`.
    pub collection: String,
    /// The child's key (`linea` or `orden`).
    pub key: u32,
}

/// The payload of a synchronizable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "lowercase")]
pub enum RecordPayload {
    Cliente(Cliente),
    Producto(Producto),
    Visita(Visita),
    Pedido(Pedido),
    Ruta(Ruta),
}

impl RecordPayload {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            RecordPayload::Cliente(_) => EntityKind::Cliente,
            RecordPayload::Producto(_) => EntityKind::Producto,
            RecordPayload::Visita(_) => EntityKind::Visita,
            RecordPayload::Pedido(_) => EntityKind::Pedido,
            RecordPayload::Ruta(_) => EntityKind::Ruta,
        }
    }

    /// Parse client-submitted `fields` as the payload of `kind`.
    pub fn from_fields(kind: EntityKind, fields: serde_json::Value) -> Result<Self, ValidationError> {
        let malformed = |e: serde_json::Error| ValidationError::MalformedFields {
            kind,
            reason: e.to_string(),
        };
        let payload = match kind {
            EntityKind::Cliente => RecordPayload::Cliente(serde_json::from_value(fields).map_err(malformed)?),
            EntityKind::Producto => RecordPayload::Producto(serde_json::from_value(fields).map_err(malformed)?),
            EntityKind::Visita => RecordPayload::Visita(serde_json::from_value(fields).map_err(malformed)?),
            EntityKind::Pedido => RecordPayload::Pedido(serde_json::from_value(fields).map_err(malformed)?),
            EntityKind::Ruta => RecordPayload::Ruta(serde_json::from_value(fields).map_err(malformed)?),
        };
        Ok(payload)
    }

    pub fn extensions(&self) -> &Extensions {
        match self {
            RecordPayload::Cliente(p) => &p.extensions,
            RecordPayload::Producto(p) => &p.extensions,
            RecordPayload::Visita(p) => &p.extensions,
            RecordPayload::Pedido(p) => &p.extensions,
            RecordPayload::Ruta(p) => &p.extensions,
        }
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        match self {
            RecordPayload::Cliente(p) => &mut p.extensions,
            RecordPayload::Producto(p) => &mut p.extensions,
            RecordPayload::Visita(p) => &mut p.extensions,
            RecordPayload::Pedido(p) => &mut p.extensions,
            RecordPayload::Ruta(p) => &mut p.extensions,
        }
    }

    /// Every outgoing reference with the kind it must point at and the child
    /// that holds it, if any.
    pub fn references(&self) -> Vec<(EntityKind, &RecordRef, Option<ChildRef>)> {
        match self {
            RecordPayload::Cliente(_) | RecordPayload::Producto(_) => Vec::new(),
            RecordPayload::Visita(v) => vec![(EntityKind::Cliente, &v.cliente_id, None)],
            RecordPayload::Pedido(p) => {
                let mut refs = vec![(EntityKind::Cliente, &p.cliente_id, None)];
                refs.extend(p.lineas.iter().map(|l| {
                    (EntityKind::Producto, &l.producto_id, Some(linea_ref(l.linea)))
                }));
                refs
            }
            RecordPayload::Ruta(r) => r
                .paradas
                .iter()
                .map(|s| (EntityKind::Cliente, &s.cliente_id, Some(parada_ref(s.orden))))
                .collect(),
        }
    }

    /// Mutable access to every outgoing reference, in the same order as
    /// [`RecordPayload::references`].
    pub fn references_mut(&mut self) -> Vec<&mut RecordRef> {
        match self {
            RecordPayload::Cliente(_) | RecordPayload::Producto(_) => Vec::new(),
            RecordPayload::Visita(v) => vec![&mut v.cliente_id],
            RecordPayload::Pedido(p) => {
                let mut refs = vec![&mut p.cliente_id];
                refs.extend(p.lineas.iter_mut().map(|l| &mut l.producto_id));
                refs
            }
            RecordPayload::Ruta(r) => r.paradas.iter_mut().map(|s| &mut s.cliente_id).collect(),
        }
    }

    /// Whether every reference holds a server id.
    pub fn is_fully_resolved(&self) -> bool {
        self.references().iter().all(|(_, r, _)| r.is_resolved())
    }

    /// The first child that differs between two versions of the same parent.
    ///
    /// Children are matched by key; a child present on only one side counts as
    /// differing. Returns `None` when the child collections are equal or the
    /// payload kind has no children.
    pub fn first_divergent_child(&self, other: &RecordPayload) -> Option<ChildRef> {
        match (self, other) {
            (RecordPayload::Pedido(a), RecordPayload::Pedido(b)) => {
                first_divergent(&a.lineas, &b.lineas, |l| l.linea).map(linea_ref)
            }
            (RecordPayload::Ruta(a), RecordPayload::Ruta(b)) => {
                first_divergent(&a.paradas, &b.paradas, |s| s.orden).map(parada_ref)
            }
            _ => None,
        }
    }
}

fn linea_ref(key: u32) -> ChildRef {
    ChildRef {
        collection: "lineas".to_string(),
        key,
    }
}

fn parada_ref(key: u32) -> ChildRef {
    ChildRef {
        collection: "paradas".to_string(),
        key,
    }
}

fn first_divergent<T: PartialEq>(ours: &[T], theirs: &[T], key: impl Fn(&T) -> u32) -> Option<u32> {
    let theirs_by_key: BTreeMap<u32, &T> = theirs.iter().map(|c| (key(c), c)).collect();
    let ours_by_key: BTreeMap<u32, &T> = ours.iter().map(|c| (key(c), c)).collect();

    ours_by_key
        .keys()
        .chain(theirs_by_key.keys())
        .copied()
        .collect::<std::collections::BTreeSet<u32>>()
        .into_iter()
        .find(|k| ours_by_key.get(k) != theirs_by_key.get(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LocalId, ServerId};
    use serde_json::json;

    fn pedido(lineas: Vec<LineaPedido>) -> RecordPayload {
        RecordPayload::Pedido(Pedido {
            cliente_id: RecordRef::Server(ServerId(1)),
            fecha: 1_700_000_000_000,
            estado: EstadoPedido::Borrador,
            notas: None,
            lineas,
            extensions: Extensions::new(),
        })
    }

    fn linea(n: u32, cantidad: u32) -> LineaPedido {
        LineaPedido {
            linea: n,
            producto_id: RecordRef::Server(ServerId(50)),
            cantidad,
            precio_unitario: 1000,
            descuento: 0,
        }
    }

    #[test]
    fn test_from_fields_cliente() {
        let payload =
            RecordPayload::from_fields(EntityKind::Cliente, json!({ "nombre": "Acme" })).unwrap();
        match payload {
            RecordPayload::Cliente(c) => {
                assert_eq!(c.nombre, "Acme");
                assert!(c.activo);
                assert!(c.extensions.is_empty());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_from_fields_malformed() {
        let err = RecordPayload::from_fields(EntityKind::Pedido, json!({ "fecha": "ayer" }))
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MalformedFields { kind: EntityKind::Pedido, .. }
        ));
    }

    #[test]
    fn test_references_include_children() {
        let mut p = pedido(vec![linea(1, 2), linea(2, 1)]);
        if let RecordPayload::Pedido(ped) = &mut p {
            ped.cliente_id = RecordRef::Local(LocalId::new("L1"));
        }
        let refs = p.references();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].0, EntityKind::Cliente);
        assert_eq!(refs[2].2, Some(linea_ref(2)));
        assert!(!p.is_fully_resolved());

        for r in p.references_mut() {
            *r = RecordRef::Server(ServerId(9));
        }
        assert!(p.is_fully_resolved());
    }

    #[test]
    fn test_first_divergent_child() {
        let a = pedido(vec![linea(1, 2), linea(2, 1)]);
        let b = pedido(vec![linea(1, 2), linea(2, 5)]);
        assert_eq!(a.first_divergent_child(&b), Some(linea_ref(2)));
        assert_eq!(a.first_divergent_child(&a.clone()), None);

        let c = pedido(vec![linea(1, 2)]);
        assert_eq!(a.first_divergent_child(&c), Some(linea_ref(2)));
    }

    #[test]
    fn test_payload_wire_shape() {
        let value = serde_json::to_value(pedido(vec![linea(1, 3)])).unwrap();
        assert_eq!(value["kind"], "pedido");
        assert_eq!(value["fields"]["clienteId"], 1);
        assert_eq!(value["fields"]["lineas"][0]["precioUnitario"], 1000);
    }

    #[test]
    fn test_pedido_total() {
        let mut l = linea(1, 3);
        l.descuento = 500;
        if let RecordPayload::Pedido(p) = pedido(vec![l, linea(2, 1)]) {
            assert_eq!(p.total(), Some(3000 - 500 + 1000));
        }
    }

    #[test]
    fn test_overflowing_amounts_have_no_total() {
        let mut l = linea(1, 2);
        l.precio_unitario = i64::MAX / 2 + 1;
        assert_eq!(l.total(), None);

        let mut a = linea(1, 1);
        let mut b = linea(2, 1);
        a.precio_unitario = i64::MAX - 10;
        b.precio_unitario = 100;
        assert!(a.total().is_some() && b.total().is_some());
        if let RecordPayload::Pedido(p) = pedido(vec![a, b]) {
            assert_eq!(p.total(), None);
        }
    }
}
