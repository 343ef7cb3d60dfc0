//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::json;

use preventa_core::{EntityKind, LocalId, RecordPayload, Version};

/// Generate a customer or route name.
pub fn nombre() -> impl Strategy<Value = String> {
    "[A-Z][a-z]{2,12}( [A-Z][a-z]{2,12}){0,2}".prop_map(String::from)
}

/// Generate a device-local id.
pub fn local_id() -> impl Strategy<Value = LocalId> {
    "L[0-9a-f]{8}".prop_map(LocalId::new)
}

/// Generate a coordinate pair inside the valid range.
pub fn coordinates() -> impl Strategy<Value = (f64, f64)> {
    (-90.0f64..=90.0, -180.0f64..=180.0)
}

/// Generate an extension map with non-empty keys.
pub fn extensions() -> impl Strategy<Value = serde_json::Map<String, serde_json::Value>> {
    prop::collection::btree_map("[a-z]{1,10}", any::<i32>(), 0..4).prop_map(|m| {
        m.into_iter()
            .map(|(k, v)| (k, serde_json::Value::from(v)))
            .collect()
    })
}

/// Parameters for generating the fields of a valid customer.
#[derive(Debug, Clone)]
pub struct ClienteParams {
    pub nombre: String,
    pub telefono: Option<String>,
    pub coordinates: Option<(f64, f64)>,
    pub activo: bool,
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl Arbitrary for ClienteParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            nombre(),
            proptest::option::of("55[0-9]{8}"),
            proptest::option::of(coordinates()),
            any::<bool>(),
            extensions(),
        )
            .prop_map(|(nombre, telefono, coordinates, activo, extensions)| ClienteParams {
                nombre,
                telefono,
                coordinates,
                activo,
                extensions,
            })
            .boxed()
    }
}

impl ClienteParams {
    /// The JSON fields a device would send for this customer.
    pub fn fields(&self) -> serde_json::Value {
        let mut fields = json!({ "nombre": self.nombre, "activo": self.activo });
        if let Some(telefono) = &self.telefono {
            fields["telefono"] = json!(telefono);
        }
        if let Some((lat, lon)) = self.coordinates {
            fields["latitud"] = json!(lat);
            fields["longitud"] = json!(lon);
        }
        if !self.extensions.is_empty() {
            fields["extensions"] = serde_json::Value::Object(self.extensions.clone());
        }
        fields
    }

    pub fn payload(&self) -> RecordPayload {
        RecordPayload::from_fields(EntityKind::Cliente, self.fields())
            .unwrap_or_else(|e| panic!("generated fields must parse: {e}"))
    }
}

/// One step of an edit script against a single record.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Update carrying the version the writer last saw.
    Fresh(String),
    /// Update carrying a version `lag` behind the current one.
    Stale { nombre: String, lag: u64 },
}

/// Generate an edit script of up to `max_len` steps.
pub fn edit_script(max_len: usize) -> impl Strategy<Value = Vec<Edit>> {
    let edit = prop_oneof![
        3 => nombre().prop_map(Edit::Fresh),
        1 => (nombre(), 1u64..=3).prop_map(|(nombre, lag)| Edit::Stale { nombre, lag }),
    ];
    prop::collection::vec(edit, 1..=max_len)
}

/// Version an edit claims to have seen, given the stored version.
pub fn expected_for(edit: &Edit, current: Version) -> Version {
    match edit {
        Edit::Fresh(_) => current,
        Edit::Stale { lag, .. } => Version(current.0.saturating_sub(*lag)),
    }
}
