//! Typed job property values.
//!
//! Job payloads are arbitrary string-keyed maps. Values are restricted to a small set of
//! variants so that a job message can be serialized to JSON (or any other self-describing
//! format) without losing its shape.
//!
//! ```rust
//! use jobmesh::properties::{PropertyValue, Properties};
//!
//! let mut props = Properties::new();
//! props.insert("recipient".to_string(), "ops@example.com".into());
//! props.insert("attempts".to_string(), 3.into());
//!
//! assert_eq!(props["attempts"].as_i64(), Some(3));
//! assert_eq!(props["recipient"].as_str(), Some("ops@example.com"));
//! ```

use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::HashMap, fmt};

/// String-keyed property map carried by jobs and updates.
pub type Properties = HashMap<String, PropertyValue>;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(HashMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(i) => Some(*i),
            PropertyValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(i) => Some(*i as f64),
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, PropertyValue>> {
        match self {
            PropertyValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Orders scalars of compatible kinds; numbers compare across integer/float.
    ///
    /// Lists and maps are not comparable and yield `None`.
    pub fn compare(&self, other: &PropertyValue) -> Option<Ordering> {
        match (self, other) {
            (PropertyValue::String(a), PropertyValue::String(b)) => Some(a.cmp(b)),
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => Some(a.cmp(b)),
            (PropertyValue::Integer(a), PropertyValue::Integer(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Integer(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::String(s) => write!(f, "{}", s),
            other => match serde_json::to_string(other) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "{:?}", other),
            },
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Integer(value as i64)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Integer(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        PropertyValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<HashMap<String, PropertyValue>> for PropertyValue {
    fn from(map: HashMap<String, PropertyValue>) -> Self {
        PropertyValue::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_json_shape() {
        let mut nested = HashMap::new();
        nested.insert("depth".to_string(), PropertyValue::Integer(2));

        let mut props = Properties::new();
        props.insert("name".to_string(), "report".into());
        props.insert("count".to_string(), 7.into());
        props.insert("ratio".to_string(), 0.5.into());
        props.insert("enabled".to_string(), true.into());
        props.insert("tags".to_string(), vec!["a", "b"].into());
        props.insert("nested".to_string(), nested.into());

        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["name"], "report");
        assert_eq!(json["count"], 7);
        assert_eq!(json["ratio"], 0.5);
        assert_eq!(json["enabled"], true);
        assert_eq!(json["tags"][1], "b");
        assert_eq!(json["nested"]["depth"], 2);

        let back: Properties = serde_json::from_value(json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_integers_stay_integers() {
        let value: PropertyValue = serde_json::from_str("42").unwrap();
        assert_eq!(value, PropertyValue::Integer(42));

        let value: PropertyValue = serde_json::from_str("42.5").unwrap();
        assert_eq!(value, PropertyValue::Float(42.5));
    }

    #[test]
    fn test_compare_mixed_numbers() {
        let a = PropertyValue::Integer(3);
        let b = PropertyValue::Float(3.5);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(
            PropertyValue::from("b").compare(&PropertyValue::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(PropertyValue::from("1").compare(&PropertyValue::Integer(1)), None);
    }

    #[test]
    fn test_lenient_accessors() {
        assert_eq!(PropertyValue::from("12").as_i64(), Some(12));
        assert_eq!(PropertyValue::from("true").as_bool(), Some(true));
        assert_eq!(PropertyValue::Float(2.0).as_i64(), Some(2));
        assert_eq!(PropertyValue::Float(2.5).as_i64(), None);
    }
}
