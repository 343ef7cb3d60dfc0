//! Three-state field updates.
//!
//! `Option<T>` cannot tell "the client did not send this field" apart from
//! "the client sent null". [`Patch`] keeps the two apart so a partial update
//! never clears data by omission.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A field update: leave unchanged, clear, or replace.
///
/// Deserializes from `null` as [`Patch::Null`] and from any other value as
/// [`Patch::Value`]. Struct fields of this type should carry
/// `#[serde(default)]` so a missing key becomes [`Patch::Absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    /// Field not present in the request: keep the stored value.
    Absent,
    /// Field explicitly null: reset to the empty value.
    Null,
    /// Field present: replace the stored value.
    Value(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Absent
    }
}

impl<T> Patch<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Patch::Absent)
    }

    /// Apply this patch on top of the stored value.
    pub fn apply(self, current: T) -> T
    where
        T: Default,
    {
        match self {
            Patch::Absent => current,
            Patch::Null => T::default(),
            Patch::Value(value) => value,
        }
    }
}

impl<T: DeserializeOwned> Patch<T> {
    /// Read one key of a JSON object as a patch.
    ///
    /// A non-object `fields` value has no keys, so every field is absent.
    pub fn from_json_field(
        fields: &serde_json::Value,
        key: &str,
    ) -> Result<Self, serde_json::Error> {
        match fields.get(key) {
            None => Ok(Patch::Absent),
            Some(serde_json::Value::Null) => Ok(Patch::Null),
            Some(value) => T::deserialize(value).map(Patch::Value),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(|value| match value {
            Some(value) => Patch::Value(value),
            None => Patch::Null,
        })
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Patch::Absent | Patch::Null => serializer.serialize_none(),
            Patch::Value(value) => serializer.serialize_some(value),
        }
    }
}
