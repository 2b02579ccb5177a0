//! Transition evaluation and task materialization.
//!
//! Transitions route control after a step completes: the `when` predicate
//! renders in the evaluation context augmented with `result` (the source
//! step's result), and the target step definition is materialized into a
//! worker task by copying an allowlist of fields and merging the edge
//! payload, with edge values winning.

use serde_json::{Map, Value};

use crate::engine::context::EvalContext;
use crate::playbook::normalize::normalize_task;
use crate::playbook::types::{Step, Transition};
use crate::template::TemplateRenderer;

/// Fields copied from a step definition into a worker task.
const TASK_FIELDS: &[&str] = &[
    "task",
    "run",
    "code",
    "command",
    "commands",
    "sql",
    "url",
    "endpoint",
    "method",
    "headers",
    "params",
    "collection",
    "element",
    "mode",
    "concurrency",
    "where",
    "limit",
    "input",
    "payload",
    "with",
    "auth",
    "data",
    "path",
    "content",
    "save",
    "credential",
    "credentials",
    "retry",
];

/// Evaluate a transition's `when` predicate.
///
/// The context is augmented with `result` bound to the source step's
/// result. A missing predicate always fires; a predicate over missing data
/// is false.
pub fn transition_fires(
    transition: &Transition,
    source_result: Option<&Value>,
    ctx: &EvalContext,
    renderer: &TemplateRenderer,
) -> bool {
    let Some(condition) = transition.when() else {
        return true;
    };

    let mut scoped = ctx.clone();
    if let Some(result) = source_result {
        scoped.insert("result".to_string(), result.clone());
    }

    renderer.evaluate_condition(condition, &scoped)
}

/// Materialize a worker task from a step definition and edge payload.
///
/// Edge payload keys land in the task's `with` block (edge values win over
/// the step's own `with`); an edge `data` mapping merges into the task's
/// `data`. The result is normalized (`with` -> `args`, legacy `loop` ->
/// iterator shape, `data` lift).
pub fn build_task(step: &Step, transition_data: &Map<String, Value>) -> Value {
    let step_map = step.as_map();

    let mut task = Map::new();
    task.insert("name".to_string(), Value::String(step.step.clone()));
    task.insert(
        "type".to_string(),
        Value::String(if step.kind().is_empty() {
            "python".to_string()
        } else {
            step.kind()
        }),
    );

    for field in TASK_FIELDS {
        if let Some(value) = step_map.get(*field) {
            if !value.is_null() {
                task.insert(field.to_string(), value.clone());
            }
        }
    }

    if !transition_data.is_empty() {
        // Edge `data` merges into the task's data block
        if let Some(Value::Object(edge_data)) = transition_data.get("data") {
            let mut base = match task.get("data") {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            };
            for (k, v) in edge_data {
                base.insert(k.clone(), v.clone());
            }
            task.insert("data".to_string(), Value::Object(base));
        }

        // Remaining edge keys merge into `with`, edge values winning
        let mut merged_with = match task.get("with") {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        for (k, v) in transition_data {
            if k != "data" {
                merged_with.insert(k.clone(), v.clone());
            }
        }
        if !merged_with.is_empty() {
            task.insert("with".to_string(), Value::Object(merged_with));
        }
    }

    normalize_task(&Value::Object(task))
}

/// Retry policy for a task: `(max_attempts, retry_delay_seconds)`.
///
/// `retry:` accepts a bool (on/off), an attempt count, or a
/// `{max_attempts, retry_delay_seconds}` block. Defaults to `{3, 60}`.
pub fn retry_policy(task: &Value) -> (i32, i64) {
    match task.get("retry") {
        Some(Value::Bool(enabled)) => (if *enabled { 3 } else { 1 }, 60),
        Some(Value::Number(n)) => (n.as_i64().unwrap_or(3).max(1) as i32, 60),
        Some(Value::Object(config)) => {
            let max_attempts = config
                .get("max_attempts")
                .and_then(|v| v.as_i64())
                .unwrap_or(3)
                .max(1) as i32;
            let delay = config
                .get("retry_delay_seconds")
                .and_then(|v| v.as_i64())
                .unwrap_or(60);
            (max_attempts, delay)
        }
        _ => (3, 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_from_yaml(yaml: &str) -> Step {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn transition_from_yaml(yaml: &str) -> Transition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_unconditional_transition_fires() {
        let renderer = TemplateRenderer::new();
        let transition = transition_from_yaml("step: next_step");
        assert!(transition_fires(
            &transition,
            None,
            &EvalContext::new(),
            &renderer
        ));
    }

    #[test]
    fn test_conditional_transition_uses_result() {
        let renderer = TemplateRenderer::new();
        let hot = transition_from_yaml("step: hot\nwhen: \"{{ result.t > 20 }}\"");
        let cold = transition_from_yaml("step: cold\nwhen: \"{{ result.t <= 20 }}\"");

        let result = json!({"t": 25});
        let ctx = EvalContext::new();

        assert!(transition_fires(&hot, Some(&result), &ctx, &renderer));
        assert!(!transition_fires(&cold, Some(&result), &ctx, &renderer));
    }

    #[test]
    fn test_transition_on_missing_data_is_false() {
        let renderer = TemplateRenderer::new();
        let t = transition_from_yaml("step: next\nwhen: \"{{ result.missing > 1 }}\"");
        assert!(!transition_fires(&t, None, &EvalContext::new(), &renderer));
    }

    #[test]
    fn test_build_task_copies_allowlist() {
        let step = step_from_yaml(
            r#"
step: fetch
type: http
method: GET
url: "https://api.example/x"
headers:
  Accept: application/json
next:
  - step: end
"#,
        );

        let task = build_task(&step, &Map::new());
        assert_eq!(task["name"], "fetch");
        assert_eq!(task["type"], "http");
        assert_eq!(task["method"], "GET");
        assert_eq!(task["url"], "https://api.example/x");
        assert_eq!(task["headers"]["Accept"], "application/json");
        // Flow-control fields never reach workers
        assert!(task.get("next").is_none());
    }

    #[test]
    fn test_build_task_edge_payload_wins() {
        let step = step_from_yaml(
            r#"
step: classify
type: python
code: "def main(mode): return {'mode': mode}"
with:
  mode: default
  keep: yes
"#,
        );

        let mut edge = Map::new();
        edge.insert("mode".to_string(), json!("hot"));

        let task = build_task(&step, &edge);
        // `with` is normalized into args; edge value replaced the step's own
        assert_eq!(task["args"]["mode"], "hot");
        assert_eq!(task["args"]["keep"], true);
    }

    #[test]
    fn test_build_task_defaults_type_to_python() {
        let step = step_from_yaml("step: misc\ncode: \"def main(): return 1\"");
        let task = build_task(&step, &Map::new());
        assert_eq!(task["type"], "python");
    }

    #[test]
    fn test_build_task_edge_data_merges() {
        let step = step_from_yaml("step: sink\ntype: http\nurl: \"https://x\"");

        let mut edge = Map::new();
        edge.insert("data".to_string(), json!({"flag": true}));

        let task = build_task(&step, &edge);
        // No pre-existing args, so the migration shim lifts data into args
        assert_eq!(task["args"], json!({"flag": true}));
    }

    #[test]
    fn test_retry_policy_variants() {
        assert_eq!(retry_policy(&json!({})), (3, 60));
        assert_eq!(retry_policy(&json!({"retry": false})), (1, 60));
        assert_eq!(retry_policy(&json!({"retry": true})), (3, 60));
        assert_eq!(retry_policy(&json!({"retry": 5})), (5, 60));
        assert_eq!(
            retry_policy(&json!({"retry": {"max_attempts": 4, "retry_delay_seconds": 1}})),
            (4, 1)
        );
        assert_eq!(retry_policy(&json!({"retry": {"max_attempts": 2}})), (2, 60));
    }
}
