//! Type-tagged parameter values (spec.md §6: "Params are type-tagged
//! strings/numbers/booleans/lists/maps").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single configuration value in `spec.params`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Num(f64),
    Bool(bool),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            ParamValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match self {
            ParamValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        ParamValue::Num(n)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

/// Common per-want options (spec.md §6): `{channelCapacity, historyMaxEntries,
/// pauseOnStart}`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WantOptions {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_history_max_entries")]
    pub history_max_entries: usize,
    #[serde(default)]
    pub pause_on_start: bool,
}

impl Default for WantOptions {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            history_max_entries: default_history_max_entries(),
            pause_on_start: false,
        }
    }
}

/// Reference implementations use a channel capacity of 10 (spec.md §4.3).
fn default_channel_capacity() -> usize {
    10
}

/// Reference implementations cap history at 1000 entries (spec.md §3).
fn default_history_max_entries() -> usize {
    1000
}
