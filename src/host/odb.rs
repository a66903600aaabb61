//! Values and a flat in-process store for the host's configuration tree.
//!
//! Keys are absolute slash separated paths
//! (`/Equipment/LaudaEquipment/Settings/SetPoint`). A trailing `[i]` on a
//! path addresses one element of an array value, mirroring how the host
//! framework exposes per-channel variables (`.../Variables/ARD0[0]`).

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A value stored under one configuration path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OdbValue {
    /// Boolean flag (output enable, feedback on/off)
    Bool(bool),
    /// Integer (state codes, LED on/off)
    Int(i64),
    /// Floating point (setpoints, demands, readings)
    Float(f64),
    /// Text (serial port names, units)
    String(String),
    /// Numeric array (bank contents)
    FloatArray(Vec<f64>),
    /// Text array (channel names)
    StringArray(Vec<String>),
}

impl OdbValue {
    /// Numeric view. Booleans map to 0/1, numeric strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OdbValue::Float(v) => Some(*v),
            OdbValue::Int(v) => Some(*v as f64),
            OdbValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            OdbValue::String(s) => s.trim().parse().ok(),
            OdbValue::FloatArray(_) | OdbValue::StringArray(_) => None,
        }
    }

    /// Integer view (floats are truncated).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OdbValue::Int(v) => Some(*v),
            OdbValue::Float(v) if v.is_finite() => Some(*v as i64),
            OdbValue::Bool(b) => Some(i64::from(*b)),
            OdbValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness: non-zero numbers and `true`/`y`/`yes`/`1` strings.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OdbValue::Bool(b) => Some(*b),
            OdbValue::Int(v) => Some(*v != 0),
            OdbValue::Float(v) => Some(*v != 0.0),
            OdbValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "y" | "yes" | "1" => Some(true),
                "false" | "n" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Text view of a `String` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OdbValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Element `index` of an array value.
    pub fn index(&self, index: usize) -> Option<OdbValue> {
        match self {
            OdbValue::FloatArray(values) => values.get(index).copied().map(OdbValue::Float),
            OdbValue::StringArray(values) => values.get(index).cloned().map(OdbValue::String),
            _ => None,
        }
    }

    /// Parses operator input: JSON (`true`, `12`, `2.5`, `[1, 2]`) or bare text.
    pub fn parse_input(text: &str) -> OdbValue {
        let text = text.trim();
        serde_json::from_str::<OdbValue>(text).unwrap_or_else(|_| OdbValue::String(text.to_string()))
    }
}

impl fmt::Display for OdbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OdbValue::Bool(b) => write!(f, "{}", if *b { "y" } else { "n" }),
            OdbValue::Int(v) => write!(f, "{}", v),
            OdbValue::Float(v) => write!(f, "{}", v),
            OdbValue::String(s) => write!(f, "{}", s),
            OdbValue::FloatArray(values) => write!(f, "{:?}", values),
            OdbValue::StringArray(values) => write!(f, "{:?}", values),
        }
    }
}

impl From<bool> for OdbValue {
    fn from(value: bool) -> Self {
        OdbValue::Bool(value)
    }
}

impl From<i64> for OdbValue {
    fn from(value: i64) -> Self {
        OdbValue::Int(value)
    }
}

impl From<f64> for OdbValue {
    fn from(value: f64) -> Self {
        OdbValue::Float(value)
    }
}

impl From<&str> for OdbValue {
    fn from(value: &str) -> Self {
        OdbValue::String(value.to_string())
    }
}

impl From<String> for OdbValue {
    fn from(value: String) -> Self {
        OdbValue::String(value)
    }
}

impl From<Vec<f64>> for OdbValue {
    fn from(value: Vec<f64>) -> Self {
        OdbValue::FloatArray(value)
    }
}

impl From<Vec<&str>> for OdbValue {
    fn from(value: Vec<&str>) -> Self {
        OdbValue::StringArray(value.into_iter().map(str::to_string).collect())
    }
}

/// Normalizes a path: leading `/`, no trailing `/`, no empty segments.
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Splits `path[i]` into `(path, Some(i))`.
pub fn split_index(path: &str) -> (&str, Option<usize>) {
    if let Some(stripped) = path.strip_suffix(']') {
        if let Some(open) = stripped.rfind('[') {
            if let Ok(index) = stripped[open + 1..].trim().parse::<usize>() {
                return (&stripped[..open], Some(index));
            }
        }
    }
    (path, None)
}

/// Largest array an element write may grow a key to.
pub const MAX_ARRAY_LEN: usize = 4096;

/// Flat key/value store keyed by normalized path.
#[derive(Debug, Default, Clone)]
pub struct Odb {
    entries: BTreeMap<String, OdbValue>,
}

impl Odb {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a value or one array element.
    pub fn get(&self, path: &str) -> Option<OdbValue> {
        let (base, index) = split_index(path);
        let value = self.entries.get(&normalize(base))?;
        match index {
            Some(i) => value.index(i),
            None => Some(value.clone()),
        }
    }

    /// Writes a value or one array element.
    ///
    /// Element writes grow numeric arrays with zeros and create the array
    /// when the key does not exist yet.
    ///
    /// # Errors
    /// `DaqError::Host` when an element write targets a scalar, mixes
    /// text and numbers, or indexes past [`MAX_ARRAY_LEN`].
    pub fn set(&mut self, path: &str, value: OdbValue) -> AppResult<()> {
        let (base, index) = split_index(path);
        let key = normalize(base);

        let Some(index) = index else {
            self.entries.insert(key, value);
            return Ok(());
        };
        if index >= MAX_ARRAY_LEN {
            return Err(DaqError::Host(format!(
                "{}[{}] is beyond the {} element limit",
                key, index, MAX_ARRAY_LEN
            )));
        }

        let is_text = matches!(value, OdbValue::String(_));
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            if is_text {
                OdbValue::StringArray(Vec::new())
            } else {
                OdbValue::FloatArray(Vec::new())
            }
        });

        match (entry, value) {
            (OdbValue::FloatArray(values), element) => {
                let number = element.as_f64().ok_or_else(|| {
                    DaqError::Host(format!("{}[{}] expects a number", key, index))
                })?;
                if values.len() <= index {
                    values.resize(index + 1, 0.0);
                }
                values[index] = number;
                Ok(())
            }
            (OdbValue::StringArray(values), OdbValue::String(text)) => {
                if values.len() <= index {
                    values.resize(index + 1, String::new());
                }
                values[index] = text;
                Ok(())
            }
            _ => Err(DaqError::Host(format!(
                "cannot write element {} of non-array key {}",
                index, key
            ))),
        }
    }

    /// True if the key exists.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// All keys under `prefix` (inclusive), sorted.
    pub fn list(&self, prefix: &str) -> Vec<(String, OdbValue)> {
        let prefix = normalize(prefix);
        self.entries
            .iter()
            .filter(|(key, _)| {
                prefix == "/" || *key == &prefix || key.starts_with(&format!("{}/", prefix))
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}
