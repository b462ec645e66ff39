//! Side data that must survive every recompilation.
//!
//! The compiler never sees the overlay. The synchronizer reads it out of the
//! persisted config blob before a rebuild and merges it back afterwards under
//! [`META_KEY`].

use crate::desired::RosterAgent;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Reserved top-level key of the persisted config blob.
pub const META_KEY: &str = "_meta";

/// Defaults are never written back, so a blob that omits a field keeps
/// omitting it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaOverlay {
    #[serde(default, skip_serializing_if = "is_false")]
    pub multi_agent_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<RosterAgent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<SealedVariable>,
    /// Keys written by other tools. Carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Named secret variable with its value sealed by the storage cipher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedVariable {
    pub name: String,
    pub value_enc: String,
}

fn is_false(value: &bool) -> bool {
    !value
}

impl MetaOverlay {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Insert or replace a variable by name.
    pub fn set_variable(&mut self, name: &str, value_enc: String) {
        match self.variables.iter_mut().find(|variable| variable.name == name) {
            Some(existing) => existing.value_enc = value_enc,
            None => self.variables.push(SealedVariable {
                name: name.to_string(),
                value_enc,
            }),
        }
    }
}

/// Persisted blob = compiled config + overlay under [`META_KEY`].
pub fn merge_overlay(compiled: &Value, overlay: &MetaOverlay) -> anyhow::Result<Value> {
    let mut blob = compiled.clone();
    let Value::Object(map) = &mut blob else {
        anyhow::bail!("compiled config must be a JSON object");
    };
    map.remove(META_KEY);
    if !overlay.is_empty() {
        map.insert(META_KEY.to_string(), serde_json::to_value(overlay)?);
    }
    Ok(blob)
}

/// Read the overlay back out of a persisted blob. Missing means empty.
pub fn extract_overlay(blob: &Value) -> anyhow::Result<MetaOverlay> {
    match blob.get(META_KEY) {
        Some(meta) => Ok(serde_json::from_value(meta.clone())?),
        None => Ok(MetaOverlay::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::RosterBinding;
    use serde_json::json;

    fn overlay() -> MetaOverlay {
        let mut overlay = MetaOverlay {
            multi_agent_enabled: true,
            agents: vec![RosterAgent {
                id: "research".into(),
                name: "Researcher".into(),
                role: "digs up sources".into(),
                bindings: vec![RosterBinding {
                    channel: "telegram".into(),
                    peer: None,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        overlay.set_variable("GITHUB_TOKEN", "sealed".into());
        overlay.extra.insert("dashboardLayout".into(), json!({"cols": 2}));
        overlay
    }

    #[test]
    fn merge_then_extract_preserves_unknown_keys() {
        let compiled = json!({ "gateway": { "port": 18789 } });
        let blob = merge_overlay(&compiled, &overlay()).unwrap();

        assert_eq!(blob["gateway"]["port"], 18789);
        assert_eq!(blob[META_KEY]["multiAgentEnabled"], true);
        assert_eq!(blob[META_KEY]["dashboardLayout"]["cols"], 2);
        assert_eq!(extract_overlay(&blob).unwrap(), overlay());
    }

    #[test]
    fn foreign_overlay_round_trips_verbatim() {
        let meta = json!({
            "agents": [{
                "id": "a",
                "name": "A",
                "emoji": "x",
                "model": "gpt-5",
                "bindings": [{ "channel": "slack", "accountId": "T1" }]
            }]
        });
        let blob = json!({ "gateway": {}, META_KEY: meta.clone() });

        let overlay = extract_overlay(&blob).unwrap();
        assert_eq!(overlay.agents[0].extra["model"], "gpt-5");
        let merged = merge_overlay(&json!({ "gateway": { "port": 1 } }), &overlay).unwrap();
        assert_eq!(merged[META_KEY], meta);
    }

    #[test]
    fn empty_overlay_leaves_no_reserved_key() {
        let compiled = json!({ "gateway": {}, META_KEY: { "stale": true } });
        let blob = merge_overlay(&compiled, &MetaOverlay::default()).unwrap();
        assert!(blob.get(META_KEY).is_none());
        assert!(extract_overlay(&blob).unwrap().is_empty());
    }

    #[test]
    fn set_variable_replaces_by_name() {
        let mut overlay = MetaOverlay::default();
        overlay.set_variable("A", "one".into());
        overlay.set_variable("A", "two".into());
        assert_eq!(overlay.variables.len(), 1);
        assert_eq!(overlay.variables[0].value_enc, "two");
    }
}
