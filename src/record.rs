// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Value;
use rustc_hash::FxHashMap;

/// An owned row value: a map from field name to [`Value`]
///
/// Fields that are missing when a record is written default per type
/// (numerics to `0`, strings to `""`, blobs to absent).
///
/// # Examples
///
/// ```
/// use interlace::{record, Record, Value};
///
/// let row = record! { "key" => "fox", "count" => 2_u64 };
/// assert_eq!(Some(&Value::U64(2)), row.get("count"));
/// assert_eq!(Some("fox"), row.get_str("key"));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record(FxHashMap<String, Value>);

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Sets a field value, builder-style.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns the value of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns the field as `u32`, if present and of that type.
    #[must_use]
    pub fn get_u32(&self, field: &str) -> Option<u32> {
        match self.0.get(field) {
            Some(Value::U32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns the field as `u64`, if present and of that type.
    #[must_use]
    pub fn get_u64(&self, field: &str) -> Option<u64> {
        match self.0.get(field) {
            Some(Value::U64(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns the field as `&str`, if present and of that type.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        match self.0.get(field) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the field as a byte slice, if present and a blob.
    #[must_use]
    pub fn get_blob(&self, field: &str) -> Option<&[u8]> {
        match self.0.get(field) {
            Some(Value::Blob(b)) => Some(b),
            _ => None,
        }
    }

    /// Number of fields set in this record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no fields are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(field, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Builds a [`Record`] from `field => value` pairs.
///
/// ```
/// use interlace::record;
///
/// let row = record! { "key" => "fox", "count" => 2_u64 };
/// assert_eq!(2, row.len());
/// ```
#[macro_export]
macro_rules! record {
    () => {
        $crate::Record::new()
    };
    ($($field:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::Record::new();
        $(record.insert($field, $value);)+
        record
    }};
}

#[cfg(test)]
mod tests {
    use crate::Value;
    use test_log::test;

    #[test]
    fn record_macro() {
        let row = record! { "a" => 1_u8, "b" => "two", "c" => vec![3_u8] };
        assert_eq!(3, row.len());
        assert_eq!(Some(&Value::U8(1)), row.get("a"));
        assert_eq!(Some("two"), row.get_str("b"));
        assert_eq!(Some(&[3_u8][..]), row.get_blob("c"));
        assert_eq!(None, row.get("d"));
    }

    #[test]
    fn record_typed_getter_mismatch() {
        let row = record! { "a" => 1_u8 };
        assert_eq!(None, row.get_u64("a"));
    }
}
