use std::collections::BTreeMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// A value returned by gates, configs and layers.
///
/// Specification documents carry arbitrary JSON, but evaluated values are always one of these
/// variants. Objects are kept in a `BTreeMap`, so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum DynamicValue {
    /// Absent value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. Kept as `serde_json::Number` so integers round-trip without a trailing `.0`.
    Number(serde_json::Number),
    /// A string.
    String(String),
    /// An ordered list.
    Array(Vec<DynamicValue>),
    /// An ordered map.
    Object(BTreeMap<String, DynamicValue>),
}

impl DynamicValue {
    /// Empty object, the default value of configs and layers.
    pub fn empty_object() -> DynamicValue {
        DynamicValue::Object(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynamicValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::Number(n) => n.as_i64().or_else(|| {
                let f = n.as_f64()?;
                let i = f as i64;
                (i as f64 == f).then_some(i)
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, DynamicValue>> {
        match self {
            DynamicValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Look up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.as_object()?.get(key)
    }

    /// Typed parameter access with a caller-supplied fallback on absence or type mismatch.
    pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
        self.get(key).and_then(DynamicValue::as_bool).unwrap_or(fallback)
    }

    pub fn get_f64(&self, key: &str, fallback: f64) -> f64 {
        self.get(key).and_then(DynamicValue::as_f64).unwrap_or(fallback)
    }

    pub fn get_i64(&self, key: &str, fallback: i64) -> i64 {
        self.get(key).and_then(DynamicValue::as_i64).unwrap_or(fallback)
    }

    pub fn get_string(&self, key: &str, fallback: &str) -> String {
        self.get(key)
            .and_then(DynamicValue::as_str)
            .unwrap_or(fallback)
            .to_owned()
    }

    pub fn get_array(&self, key: &str, fallback: Vec<DynamicValue>) -> Vec<DynamicValue> {
        self.get(key)
            .and_then(DynamicValue::as_array)
            .map(<[DynamicValue]>::to_vec)
            .unwrap_or(fallback)
    }

    pub fn get_object(
        &self,
        key: &str,
        fallback: BTreeMap<String, DynamicValue>,
    ) -> BTreeMap<String, DynamicValue> {
        self.get(key)
            .and_then(DynamicValue::as_object)
            .cloned()
            .unwrap_or(fallback)
    }

    /// String form used by string operators. Numbers and booleans are stringified, compound
    /// values are not.
    pub(crate) fn to_comparable_string(&self) -> Option<String> {
        match self {
            DynamicValue::String(s) => Some(s.clone()),
            DynamicValue::Number(n) => Some(number_to_string(n)),
            DynamicValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Numeric form used by numeric operators. Numeric strings are accepted.
    pub(crate) fn to_comparable_f64(&self) -> Option<f64> {
        match self {
            DynamicValue::Number(n) => n.as_f64(),
            DynamicValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Merge `overlay` on top of `self` when both are objects. `overlay` keys win.
    pub(crate) fn merged_with(&self, overlay: &DynamicValue) -> DynamicValue {
        match (self, overlay) {
            (DynamicValue::Object(base), DynamicValue::Object(top)) => {
                let mut merged = base.clone();
                merged.extend(top.iter().map(|(k, v)| (k.clone(), v.clone())));
                DynamicValue::Object(merged)
            }
            _ => overlay.clone(),
        }
    }
}

/// `1.0` prints as `1` so that `"1" == 1.0` in string comparisons.
fn number_to_string(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<f64> for DynamicValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(DynamicValue::Number)
            .unwrap_or(DynamicValue::Null)
    }
}

impl From<i64> for DynamicValue {
    fn from(value: i64) -> Self {
        DynamicValue::Number(value.into())
    }
}

impl From<serde_json::Value> for DynamicValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DynamicValue::Null,
            serde_json::Value::Bool(b) => DynamicValue::Bool(b),
            serde_json::Value::Number(n) => DynamicValue::Number(n),
            serde_json::Value::String(s) => DynamicValue::String(s),
            serde_json::Value::Array(a) => {
                DynamicValue::Array(a.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(o) => {
                DynamicValue::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_fall_back_on_mismatch() {
        let value: DynamicValue =
            serde_json::from_str(r#"{"a": 1, "b": "x", "c": true, "d": [1, 2], "e": 1.5}"#)
                .unwrap();

        assert_eq!(value.get_i64("a", 0), 1);
        assert_eq!(value.get_i64("b", 7), 7);
        assert_eq!(value.get_string("b", ""), "x");
        assert_eq!(value.get_string("a", "fallback"), "fallback");
        assert!(value.get_bool("c", false));
        assert_eq!(value.get_array("d", vec![]).len(), 2);
        assert_eq!(value.get_f64("e", 0.0), 1.5);
        assert_eq!(value.get_i64("e", 3), 3);
        assert!(value.get_object("missing", BTreeMap::new()).is_empty());
    }

    #[test]
    fn integers_serialize_without_fraction() {
        let value: DynamicValue = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn comparable_string_of_whole_float() {
        assert_eq!(
            DynamicValue::from(42.0).to_comparable_string().as_deref(),
            Some("42")
        );
    }

    #[test]
    fn merge_prefers_overlay() {
        let base: DynamicValue = serde_json::from_str(r#"{"a": 1, "b": 1}"#).unwrap();
        let top: DynamicValue = serde_json::from_str(r#"{"b": 2}"#).unwrap();
        let merged = base.merged_with(&top);
        assert_eq!(merged.get_i64("a", 0), 1);
        assert_eq!(merged.get_i64("b", 0), 2);
    }
}
