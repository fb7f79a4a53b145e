//! Label selectors used to wire wants together (spec.md §4.2).
//!
//! A [`Selector`] is a conjunction of key=value equalities. Per spec.md's
//! explicit Non-goal ("a general expression language for connectivity"),
//! there is no `In`/`NotIn`/`Exists` family here — matching is strictly
//! equality, evaluated against a want's label map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

type Labels = BTreeMap<String, String>;

/// A single `key=value` equality to satisfy.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Expression {
    pub key: String,
    pub value: String,
}

impl Expression {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn matches(&self, labels: &Labels) -> bool {
        labels.get(&self.key).map(String::as_str) == Some(self.value.as_str())
    }
}

/// A conjunction of label equalities: a want is selected iff every
/// expression in the selector matches its labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Selector(Vec<Expression>);

impl Selector {
    pub fn from_expressions(exprs: Vec<Expression>) -> Self {
        Self(exprs)
    }

    /// An empty selector matches every want (spec.md §4.2 edge case: "A
    /// selector matching zero wants is legal").
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }

    /// Human-readable form, e.g. `role=src,stage=ingest`. Used in logs and
    /// `ResolutionError` messages; never parsed back.
    pub fn to_selector_string(&self) -> String {
        self.0
            .iter()
            .map(|e| format!("{}={}", e.key, e.value))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn expressions(&self) -> &[Expression] {
        &self.0
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| Expression::new(k, v)).collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| Expression::new(k, v))
                .collect(),
        )
    }
}
