//! Payload validation: structural checks run before a mutation reaches the
//! ledger.
//!
//! Referential checks (does the referenced customer exist in this tenant?)
//! need storage and live in the sync crate. Everything here is pure.

use std::collections::BTreeSet;

use crate::error::ValidationError;
use crate::payload::{Cliente, Extensions, Pedido, Producto, RecordPayload, Ruta, Visita};

/// Field and collection size limits.
pub mod limits {
    /// Max characters in a name or SKU.
    pub const MAX_NAME_LEN: usize = 200;
    /// Max characters in a free-text field (notes, address).
    pub const MAX_TEXT_LEN: usize = 2000;
    /// Max lines in one order.
    pub const MAX_LINEAS: usize = 500;
    /// Max stops in one route.
    pub const MAX_PARADAS: usize = 200;
    /// Max keys in an extension map.
    pub const MAX_EXTENSIONS: usize = 64;
}

/// Validate a payload's structure.
pub fn validate_payload(payload: &RecordPayload) -> Result<(), ValidationError> {
    match payload {
        RecordPayload::Cliente(c) => validate_cliente(c),
        RecordPayload::Producto(p) => validate_producto(p),
        RecordPayload::Visita(v) => validate_visita(v),
        RecordPayload::Pedido(p) => validate_pedido(p),
        RecordPayload::Ruta(r) => validate_ruta(r),
    }?;
    validate_extensions(payload.extensions())
}

fn validate_cliente(c: &Cliente) -> Result<(), ValidationError> {
    required_name("nombre", &c.nombre)?;
    optional_text("direccion", c.direccion.as_deref(), limits::MAX_TEXT_LEN)?;
    optional_text("telefono", c.telefono.as_deref(), limits::MAX_NAME_LEN)?;
    if let Some(email) = &c.email {
        if !email.contains('@') {
            return Err(ValidationError::OutOfRange {
                field: "email",
                detail: format!("{email:?} is not an address"),
            });
        }
    }
    coordinates(c.latitud, c.longitud)
}

fn validate_producto(p: &Producto) -> Result<(), ValidationError> {
    required_name("sku", &p.sku)?;
    required_name("nombre", &p.nombre)?;
    non_negative("precio", p.precio)
}

fn validate_visita(v: &Visita) -> Result<(), ValidationError> {
    if v.resultado.is_some() && v.realizada_en.is_none() {
        return Err(ValidationError::MissingField("realizadaEn"));
    }
    optional_text("notas", v.notas.as_deref(), limits::MAX_TEXT_LEN)?;
    coordinates(v.latitud, v.longitud)
}

fn validate_pedido(p: &Pedido) -> Result<(), ValidationError> {
    optional_text("notas", p.notas.as_deref(), limits::MAX_TEXT_LEN)?;
    if p.lineas.len() > limits::MAX_LINEAS {
        return Err(ValidationError::TooManyChildren {
            collection: "lineas",
            count: p.lineas.len(),
            max: limits::MAX_LINEAS,
        });
    }

    let mut seen = BTreeSet::new();
    for linea in &p.lineas {
        if !seen.insert(linea.linea) {
            return Err(ValidationError::DuplicateChild {
                collection: "lineas",
                key: linea.linea,
            });
        }
        if linea.cantidad == 0 {
            return Err(ValidationError::OutOfRange {
                field: "cantidad",
                detail: format!("line {} has zero quantity", linea.linea),
            });
        }
        non_negative("precioUnitario", linea.precio_unitario)?;
        non_negative("descuento", linea.descuento)?;
        match linea.total() {
            None => {
                return Err(ValidationError::OutOfRange {
                    field: "precioUnitario",
                    detail: format!("line {} amount overflows", linea.linea),
                })
            }
            Some(total) if total < 0 => {
                return Err(ValidationError::OutOfRange {
                    field: "descuento",
                    detail: format!("line {} discount exceeds its amount", linea.linea),
                })
            }
            Some(_) => {}
        }
    }
    if p.total().is_none() {
        return Err(ValidationError::OutOfRange {
            field: "lineas",
            detail: "order total overflows".into(),
        });
    }
    Ok(())
}

fn validate_ruta(r: &Ruta) -> Result<(), ValidationError> {
    required_name("nombre", &r.nombre)?;
    if r.paradas.len() > limits::MAX_PARADAS {
        return Err(ValidationError::TooManyChildren {
            collection: "paradas",
            count: r.paradas.len(),
            max: limits::MAX_PARADAS,
        });
    }

    let mut seen = BTreeSet::new();
    for parada in &r.paradas {
        if !seen.insert(parada.orden) {
            return Err(ValidationError::DuplicateChild {
                collection: "paradas",
                key: parada.orden,
            });
        }
    }
    Ok(())
}

fn validate_extensions(extensions: &Extensions) -> Result<(), ValidationError> {
    if extensions.len() > limits::MAX_EXTENSIONS {
        return Err(ValidationError::TooManyExtensions {
            count: extensions.len(),
            max: limits::MAX_EXTENSIONS,
        });
    }
    if extensions.keys().any(|k| k.trim().is_empty()) {
        return Err(ValidationError::EmptyExtensionKey);
    }
    Ok(())
}

fn required_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    optional_text(field, Some(value), limits::MAX_NAME_LEN)
}

fn optional_text(field: &'static str, value: Option<&str>, max: usize) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ValidationError::FieldTooLong { field, max }),
        _ => Ok(()),
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::OutOfRange {
            field,
            detail: format!("{value} is negative"),
        });
    }
    Ok(())
}

fn coordinates(lat: Option<f64>, lon: Option<f64>) -> Result<(), ValidationError> {
    match (lat, lon) {
        (None, None) => Ok(()),
        (Some(lat), Some(lon)) => {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ValidationError::OutOfRange {
                    field: "latitud",
                    detail: format!("{lat}"),
                });
            }
            if !(-180.0..=180.0).contains(&lon) {
                return Err(ValidationError::OutOfRange {
                    field: "longitud",
                    detail: format!("{lon}"),
                });
            }
            Ok(())
        }
        (Some(_), None) => Err(ValidationError::MissingField("longitud")),
        (None, Some(_)) => Err(ValidationError::MissingField("latitud")),
    }
}
