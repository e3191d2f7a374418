use crate::error::FeatureStoreError;
use crate::value::{CastMode, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: ValueType,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: ValueType) -> Self {
        Self { name: name.into(), dtype }
    }
}

/// Ordered fields; names are unique once a definition holding the schema is validated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema(Vec<Field>);

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.0.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first_duplicate(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.names().find(|name| !seen.insert(*name))
    }
}

impl From<Vec<Field>> for Schema {
    fn from(fields: Vec<Field>) -> Self {
        Schema(fields)
    }
}

/// A join key column and the type its values are normalised to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    pub name: String,
    pub dtype: Option<ValueType>,
}

/// Identifies one entity instance in an online table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityKey {
    pub join_keys: Vec<String>,
    pub entity_values: Vec<Value>,
}

impl EntityKey {
    pub fn new(join_keys: Vec<String>, entity_values: Vec<Value>) -> Self {
        Self { join_keys, entity_values }
    }

    pub fn single(join_key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { join_keys: vec![join_key.into()], entity_values: vec![value.into()] }
    }

    pub fn get(&self, join_key: &str) -> Option<&Value> {
        self.join_keys.iter().position(|k| k == join_key).and_then(|i| self.entity_values.get(i))
    }

    /// Builds a key from `join_keys`, looking each value up and normalising it to the key's dtype.
    pub fn build<'a>(join_keys: &[JoinKey], lookup: impl Fn(&str) -> Option<&'a Value>) -> Result<EntityKey, KeyError> {
        let mut values = Vec::with_capacity(join_keys.len());
        for key in join_keys {
            let raw = match lookup(&key.name) {
                Some(v) if !v.is_null() => v,
                _ => return Err(KeyError::Missing(key.name.clone())),
            };
            let value = match key.dtype {
                Some(dtype) => raw.cast(dtype, CastMode::Lenient).ok_or_else(|| KeyError::Invalid {
                    join_key: key.name.clone(),
                    value: raw.clone(),
                    expected: dtype,
                })?,
                None => raw.clone(),
            };
            values.push(value);
        }
        Ok(EntityKey::new(join_keys.iter().map(|k| k.name.clone()).collect(), values))
    }

    /// Stable byte form used as the storage key.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.join_keys.iter().zip(&self.entity_values).map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", pairs.join(","))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyError {
    Missing(String),
    Invalid { join_key: String, value: Value, expected: ValueType },
}

impl KeyError {
    pub(crate) fn into_store_error(self, view: &str, row: usize) -> FeatureStoreError {
        match self {
            KeyError::Missing(join_key) => FeatureStoreError::MissingEntityKey { view: view.to_string(), join_key, row },
            KeyError::Invalid { join_key, value, expected } => {
                FeatureStoreError::InvalidEntityValue { join_key, value: value.to_string(), expected: expected.to_string() }
            }
        }
    }
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::Missing(key) => write!(f, "missing join key '{}'", key),
            KeyError::Invalid { join_key, value, expected } => write!(f, "join key '{}' value {} is not a valid {}", join_key, value, expected),
        }
    }
}

/// One caller supplied row: join keys plus request time inputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityRow(BTreeMap<String, Value>);

impl EntityRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>, const N: usize> From<[(K, Value); N]> for EntityRow {
    fn from(pairs: [(K, Value); N]) -> Self {
        pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
    }
}

impl FromIterator<(String, Value)> for EntityRow {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        EntityRow(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod schema_tests {
    use super::*;

    fn keys(specs: &[(&str, Option<ValueType>)]) -> Vec<JoinKey> {
        specs.iter().map(|(name, dtype)| JoinKey { name: name.to_string(), dtype: *dtype }).collect()
    }

    #[test]
    fn duplicate_field_is_reported() {
        let schema = Schema::new(vec![Field::new("a", ValueType::Int64), Field::new("b", ValueType::Int64), Field::new("a", ValueType::String)]);
        assert_eq!(schema.first_duplicate(), Some("a"));
        assert_eq!(Schema::new(vec![Field::new("a", ValueType::Int64)]).first_duplicate(), None);
    }

    #[test]
    fn entity_key_normalises_values_to_join_key_type() {
        let row = EntityRow::from([("location_id", Value::Int64(1))]);
        let key = EntityKey::build(&keys(&[("location_id", Some(ValueType::Int32))]), |k| row.get(k)).expect("key");
        assert_eq!(key, EntityKey::single("location_id", Value::Int32(1)));
    }

    #[test]
    fn entity_keys_compare_names_and_values() {
        let a = EntityKey::single("customer_id", "5");
        let b = EntityKey::single("customer_id", "5");
        let c = EntityKey::single("driver_id", "5");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_bytes().expect("bytes"), b.to_bytes().expect("bytes"));
        assert_ne!(a.to_bytes().expect("bytes"), c.to_bytes().expect("bytes"));
    }

    #[test]
    fn missing_or_null_join_key_is_rejected() {
        let row = EntityRow::from([("customer_id", Value::Null)]);
        let specs = keys(&[("customer_id", None)]);
        assert_eq!(EntityKey::build(&specs, |k| row.get(k)), Err(KeyError::Missing("customer_id".into())));
        assert_eq!(EntityKey::build(&specs, |_| None), Err(KeyError::Missing("customer_id".into())));
    }

    #[test]
    fn unconvertible_join_key_is_rejected() {
        let row = EntityRow::from([("location_id", Value::String("one".into()))]);
        let result = EntityKey::build(&keys(&[("location_id", Some(ValueType::Int32))]), |k| row.get(k));
        assert!(matches!(result, Err(KeyError::Invalid { .. })));
    }
}
