//! NoETL playbook types.
//!
//! A playbook is a DAG of steps with conditional transitions, loops, and
//! typed actions. Steps carry their action type directly (`type: http`,
//! `type: python`, ...); control-flow steps (`start`, `end`, `route`, or no
//! type at all) never reach a worker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Step types that are executed by workers.
pub const ACTIONABLE_TYPES: &[&str] = &[
    "http",
    "python",
    "duckdb",
    "postgres",
    "snowflake",
    "secrets",
    "workbook",
    "playbook",
    "save",
    "iterator",
];

/// Step types that are control-flow only.
pub const CONTROL_TYPES: &[&str] = &["start", "end", "route"];

/// Playbook metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metadata {
    /// Resource path in the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Playbook name (path fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Labels for filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,

    /// Additional metadata.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Target of a `next:` transition with optional condition and edge payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionTarget {
    /// Target step name.
    #[serde(alias = "name")]
    pub step: String,

    /// Jinja condition; the transition fires only when it renders truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Edge payload merged into the target's args (edge values win).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<serde_json::Map<String, serde_json::Value>>,

    /// Legacy alias for `with`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Map<String, serde_json::Value>>,

    /// Legacy alias for `with`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Map<String, serde_json::Value>>,

    /// Edge output mapping, kept under a nested `data` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A transition entry: either a bare step name or a full target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transition {
    /// Bare step name, unconditional.
    Name(String),

    /// Target with condition and edge payload.
    Target(TransitionTarget),
}

impl Transition {
    /// Target step name.
    pub fn step_name(&self) -> &str {
        match self {
            Transition::Name(name) => name,
            Transition::Target(t) => &t.step,
        }
    }

    /// Condition expression, if any.
    pub fn when(&self) -> Option<&str> {
        match self {
            Transition::Name(_) => None,
            Transition::Target(t) => t.when.as_deref(),
        }
    }

    /// Merged edge payload: `with`/`payload`/`input` keys flattened, plus the
    /// `data` mapping nested under a `data` key.
    pub fn edge_data(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut merged = serde_json::Map::new();
        if let Transition::Target(t) = self {
            for source in [&t.with, &t.payload, &t.input].into_iter().flatten() {
                for (k, v) in source {
                    merged.insert(k.clone(), v.clone());
                }
            }
            if let Some(data) = &t.data {
                merged.insert(
                    "data".to_string(),
                    serde_json::Value::Object(data.clone()),
                );
            }
        }
        merged
    }
}

/// Next step specification: one transition or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextSpec {
    /// Single transition.
    One(Transition),

    /// List of transitions, evaluated in order.
    Many(Vec<Transition>),
}

impl NextSpec {
    /// View the transitions as a list.
    pub fn transitions(&self) -> Vec<&Transition> {
        match self {
            NextSpec::One(t) => vec![t],
            NextSpec::Many(list) => list.iter().collect(),
        }
    }

    /// Whether the spec holds no transitions.
    pub fn is_empty(&self) -> bool {
        matches!(self, NextSpec::Many(list) if list.is_empty())
    }
}

/// Workflow step.
///
/// Action-specific fields (`code`, `url`, `sql`, `collection`, ...) live in
/// `extra` and are copied into worker tasks by the transition engine's
/// allowlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within the workflow).
    pub step: String,

    /// Step description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    /// Action type; absent for pure control-flow steps.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,

    /// Outgoing transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextSpec>,

    /// Result mapping, rendered at finalization (end step only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Action-specific fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Step {
    /// Lowercased step type, or empty string when absent.
    pub fn kind(&self) -> String {
        self.step_type
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_lowercase()
    }

    /// Look up an action-specific field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.extra.get(name)
    }

    /// Whether this step is executed by a worker.
    ///
    /// Control types and untyped steps are flow-only. A `python` step needs a
    /// non-empty code field to be worth dispatching. Any step with a `save:`
    /// block is actionable regardless of type.
    pub fn is_actionable(&self) -> bool {
        let kind = self.kind();

        if kind.is_empty() || CONTROL_TYPES.contains(&kind.as_str()) {
            return self.field("save").is_some();
        }

        if self.field("save").is_some() {
            return true;
        }

        if !ACTIONABLE_TYPES.contains(&kind.as_str()) {
            return false;
        }

        if kind == "python" {
            return ["code", "code_b64", "code_base64"].iter().any(|f| {
                self.field(f)
                    .and_then(|v| v.as_str())
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false)
            });
        }

        true
    }

    /// Transitions out of this step (empty when `next:` is absent).
    pub fn transitions(&self) -> Vec<&Transition> {
        self.next
            .as_ref()
            .map(|n| n.transitions())
            .unwrap_or_default()
    }

    /// The whole step definition as a JSON map.
    pub fn as_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Keychain entry definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainDef {
    /// Keychain entry name.
    pub name: String,

    /// Entry kind: static, bearer, oauth2, secret_manager, credential, ...
    #[serde(alias = "type")]
    pub kind: String,

    /// Scope type: global, catalog, shared, local.
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Auto-renew flag.
    #[serde(default)]
    pub auto_renew: bool,

    /// Explicit TTL override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,

    /// Kind-specific configuration (token, endpoint, map, auth, ref, ...).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_scope() -> String {
    "global".to_string()
}

/// Complete playbook definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// API version (noetl.io/v1).
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,

    /// Resource kind (Playbook).
    #[serde(default)]
    pub kind: String,

    /// Metadata (path, name, labels).
    #[serde(default)]
    pub metadata: Metadata,

    /// Default inputs, merged with the execute payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<serde_json::Value>,

    /// Credential definitions resolved at execution start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keychain: Option<Vec<KeychainDef>>,

    /// Workflow steps.
    pub workflow: Vec<Step>,
}

impl Playbook {
    /// Check if the workflow has a start step.
    pub fn has_start_step(&self) -> bool {
        self.workflow.iter().any(|s| s.step == "start")
    }

    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Position of a step in the workflow.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.workflow.iter().position(|s| s.step == name)
    }

    /// Number of worker-executable steps.
    pub fn actionable_step_count(&self) -> usize {
        self.workflow.iter().filter(|s| s.is_actionable()).count()
    }

    /// The catalog path: `metadata.path` falling back to `metadata.name`.
    pub fn path(&self) -> Option<&str> {
        self.metadata
            .path
            .as_deref()
            .or(self.metadata.name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_playbook() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  path: examples/weather
  name: weather
workload:
  city: "Paris"
workflow:
  - step: start
    next:
      - step: fetch
  - step: fetch
    type: http
    method: GET
    url: "https://api.example/{{ workload.city }}"
    next:
      - step: end
  - step: end
    result:
      final: "{{ fetch }}"
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.api_version, "noetl.io/v1");
        assert_eq!(playbook.kind, "Playbook");
        assert_eq!(playbook.path(), Some("examples/weather"));
        assert!(playbook.has_start_step());
        assert_eq!(playbook.workflow.len(), 3);

        let fetch = playbook.get_step("fetch").unwrap();
        assert_eq!(fetch.kind(), "http");
        assert!(fetch.is_actionable());
        assert_eq!(
            fetch.field("url").and_then(|v| v.as_str()),
            Some("https://api.example/{{ workload.city }}")
        );
    }

    #[test]
    fn test_control_steps_not_actionable() {
        let yaml = r#"
step: start
next:
  - step: fetch
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert!(!step.is_actionable());
        assert_eq!(step.transitions().len(), 1);
    }

    #[test]
    fn test_python_without_code_not_actionable() {
        let step: Step = serde_yaml::from_str("step: calc\ntype: python\n").unwrap();
        assert!(!step.is_actionable());

        let step: Step =
            serde_yaml::from_str("step: calc\ntype: python\ncode: \"def main(): return 1\"\n")
                .unwrap();
        assert!(step.is_actionable());
    }

    #[test]
    fn test_save_makes_step_actionable() {
        let yaml = r#"
step: persist
save:
  storage: postgres
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert!(step.is_actionable());
    }

    #[test]
    fn test_transition_edge_data_merge() {
        let yaml = r#"
step: classify
when: "{{ result.temp > 20 }}"
with:
  mode: "hot"
data:
  flag: true
"#;
        let transition: Transition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(transition.step_name(), "classify");
        assert_eq!(transition.when(), Some("{{ result.temp > 20 }}"));

        let data = transition.edge_data();
        assert_eq!(data.get("mode"), Some(&serde_json::json!("hot")));
        assert_eq!(data.get("data"), Some(&serde_json::json!({"flag": true})));
    }

    #[test]
    fn test_bare_string_transition() {
        let transition: Transition = serde_yaml::from_str("\"fetch\"").unwrap();
        assert_eq!(transition.step_name(), "fetch");
        assert!(transition.when().is_none());
        assert!(transition.edge_data().is_empty());
    }

    #[test]
    fn test_keychain_def_defaults() {
        let yaml = r#"
name: openai
kind: bearer
token: "{{ workload.openai_key }}"
"#;
        let def: KeychainDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.name, "openai");
        assert_eq!(def.kind, "bearer");
        assert_eq!(def.scope, "global");
        assert!(!def.auto_renew);
        assert!(def.extra.contains_key("token"));
    }

    #[test]
    fn test_actionable_step_count() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    next:
      - step: a
  - step: a
    type: python
    code: "def main(): return 1"
    next:
      - step: end
  - step: end
"#;
        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.actionable_step_count(), 1);
    }
}
