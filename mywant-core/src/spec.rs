//! A want's declarative configuration (spec.md §3 "Want", §6).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::Selector;
use crate::params::{ParamValue, WantOptions};

/// `spec.using` / `spec.usingGlobal` name input connections abstractly, by
/// label selector, rather than by explicit peer id (spec.md §1, §4.2).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WantSpec {
    /// Free-form configuration; re-read at the start of every progress cycle
    /// so mid-run parameter changes take effect (spec.md §4.4 step 2).
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,

    /// Local-scope input selectors (spec.md §4.2 step 1).
    #[serde(default)]
    pub using: Vec<Selector>,

    /// Cross-recipe-boundary input selectors (spec.md §4.2 step 2).
    #[serde(default)]
    pub using_global: Vec<Selector>,

    /// Capability names this want needs; drives agent matching (spec.md §4.6).
    #[serde(default)]
    pub requires: Vec<String>,

    /// Target (owner) wants additionally recognise these (spec.md §6).
    #[serde(default)]
    pub recipe_path: Option<String>,
    #[serde(default)]
    pub recipe_params: BTreeMap<String, ParamValue>,

    #[serde(default)]
    pub options: WantOptions,
}

impl WantSpec {
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }
}
