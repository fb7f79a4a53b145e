//! Normalised in-memory shape of an engine bootstrap document (spec.md §6;
//! SPEC_FULL.md §11.3 "Configuration & recipe ingestion").
//!
//! The YAML/OpenAPI loader and the recipe file format itself are out of
//! scope, but a loader still needs *something* `serde`-deserialisable to
//! hand the engine. [`RecipeDocument`] is that shape: the initial set of
//! wants to register plus the agent/capability catalog they can be matched
//! against. The engine never parses YAML itself — it only ever sees a
//! already-deserialised `RecipeDocument`, the same way `kube-core`'s typed
//! manifests never know whether they came from a YAML file or the API
//! server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, Capability};
use crate::spec::WantSpec;

/// One want to register at bootstrap: enough to call
/// `Engine::add(meta, type_name, spec)` once deserialised.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WantDeclaration {
    pub id: String,
    pub type_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: WantSpec,
}

/// A full bootstrap document: the normalised `{wants, agents, capabilities}`
/// shape a recipe/config loader produces (spec.md §6).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RecipeDocument {
    #[serde(default)]
    pub wants: Vec<WantDeclaration>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}
