//! Loop fan-out and aggregation primitives.
//!
//! An iterator step expands a collection into per-iteration work units.
//! Fan-out emits one `loop_iteration` event per element; fan-in counts
//! per-iteration `result` events against the expected iteration count and
//! emits a single synthetic `action_completed` for the parent step once
//! every iteration has reported.

use serde_json::{Map, Value};

use crate::engine::context::EvalContext;
use crate::error::{AppError, AppResult};
use crate::playbook::types::Step;
use crate::template::TemplateRenderer;

/// Loop execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// All iterations are dispatched immediately.
    #[default]
    Async,
    /// The next iteration is dispatched only after the previous one's
    /// result event arrives.
    Sync,
}

impl LoopMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "sync" | "sequential" => LoopMode::Sync,
            _ => LoopMode::Async,
        }
    }
}

/// Parsed iterator step configuration.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    /// Collection expression: an array literal or a template yielding one.
    pub collection: Value,

    /// Binding name for the current element.
    pub element: String,

    /// Dispatch mode.
    pub mode: LoopMode,

    /// Optional per-element filter predicate.
    pub where_expr: Option<String>,

    /// Optional cap on the number of iterations.
    pub limit: Option<usize>,

    /// Nested work unit: an in-process task or a sub-playbook reference.
    pub task: Option<Value>,
}

impl LoopSpec {
    /// Extract the loop configuration from an iterator step.
    pub fn from_step(step: &Step) -> AppResult<Self> {
        let collection = step
            .field("collection")
            .cloned()
            .ok_or_else(|| {
                AppError::InvalidPlaybook(format!(
                    "Iterator step '{}' has no collection",
                    step.step
                ))
            })?;

        let element = step
            .field("element")
            .and_then(|v| v.as_str())
            .unwrap_or("item")
            .to_string();

        let mode = step
            .field("mode")
            .and_then(|v| v.as_str())
            .map(LoopMode::parse)
            .unwrap_or_default();

        let where_expr = step
            .field("where")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let limit = step
            .field("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        Ok(Self {
            collection,
            element,
            mode,
            where_expr,
            limit,
            task: step.field("task").cloned(),
        })
    }

    /// Whether iterations run as child executions of a sub-playbook.
    pub fn is_sub_playbook(&self) -> bool {
        self.task
            .as_ref()
            .and_then(|t| t.get("type"))
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case("playbook"))
            .unwrap_or(false)
    }

    /// Resolve the collection against the evaluation context and apply the
    /// `where` filter and `limit`.
    pub fn resolve_items(
        &self,
        ctx: &EvalContext,
        renderer: &TemplateRenderer,
    ) -> AppResult<Vec<Value>> {
        let items = expand_collection(&self.collection, ctx, renderer)?;

        let mut filtered = Vec::with_capacity(items.len());
        for item in items {
            if let Some(pred) = &self.where_expr {
                let mut scoped = ctx.clone();
                scoped.insert(self.element.clone(), item.clone());
                if !renderer.evaluate_condition(pred, &scoped) {
                    continue;
                }
            }
            filtered.push(item);
            if let Some(limit) = self.limit {
                if filtered.len() >= limit {
                    break;
                }
            }
        }

        Ok(filtered)
    }
}

/// Render a collection expression to a list of items.
///
/// Arrays pass through; objects become `{key, value}` pairs; strings are
/// parsed as JSON arrays or split on commas/newlines; numbers become the
/// range `[0, n)`.
pub fn expand_collection(
    expr: &Value,
    ctx: &EvalContext,
    renderer: &TemplateRenderer,
) -> AppResult<Vec<Value>> {
    let resolved = match expr {
        Value::String(s) => renderer.render_to_value(s, ctx)?,
        other => other.clone(),
    };

    match resolved {
        Value::Array(arr) => Ok(arr),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| serde_json::json!({"key": k, "value": v}))
            .collect()),
        Value::String(s) => {
            if let Ok(arr) = serde_json::from_str::<Vec<Value>>(&s) {
                Ok(arr)
            } else {
                Ok(s.split([',', '\n'])
                    .map(|item| Value::String(item.trim().to_string()))
                    .filter(|v| !v.as_str().unwrap_or("").is_empty())
                    .collect())
            }
        }
        Value::Number(n) => {
            let n = n.as_u64().unwrap_or(0) as usize;
            Ok((0..n).map(|i| serde_json::json!(i)).collect())
        }
        other => Err(AppError::Validation(format!(
            "Collection expression did not evaluate to an iterable: {}",
            other
        ))),
    }
}

/// Loop identifier: `"{execution_id}:{step_name}"`.
pub fn loop_id(execution_id: i64, step_name: &str) -> String {
    format!("{}:{}", execution_id, step_name)
}

/// Iteration node id: `"{execution_id}-step-{index}-iter-{k}"` where
/// `index` is the step's position in the workflow.
pub fn iteration_node_id(execution_id: i64, step_index: usize, k: usize) -> String {
    format!("{}-step-{}-iter-{}", execution_id, step_index, k)
}

/// Build the aggregated result envelope for a completed loop.
pub fn aggregate_envelope(results: &[Value]) -> Value {
    serde_json::json!({
        "data": {
            "results": results,
            "result": results,
            "count": results.len(),
        },
        "results": results,
        "result": results,
        "count": results.len(),
    })
}

/// Context attached to the synthetic aggregate events.
pub fn aggregate_context(total_iterations: usize) -> Value {
    serde_json::json!({
        "loop_completed": true,
        "total_iterations": total_iterations,
    })
}

/// Per-iteration job context `_meta` block. Workers echo these fields back
/// on their completion events so fan-in can attribute results.
pub fn iteration_meta(
    node_id: &str,
    loop_id: &str,
    loop_name: &str,
    index: usize,
    item: &Value,
    element: &str,
) -> Value {
    serde_json::json!({
        "node_id": node_id,
        "loop_id": loop_id,
        "loop_name": loop_name,
        "current_index": index,
        "current_item": item,
        "element": element,
    })
}

/// Bind the current element into a context map for task rendering.
pub fn bind_element(ctx: &EvalContext, element: &str, item: &Value, index: usize) -> EvalContext {
    let mut scoped = ctx.clone();
    scoped.insert(element.to_string(), item.clone());
    scoped.insert("_index".to_string(), serde_json::json!(index));
    scoped
}

/// Edge payload map for a sub-playbook iteration: the element binding plus
/// any `with` block on the nested task.
pub fn child_payload(spec: &LoopSpec, item: &Value, renderer: &TemplateRenderer, ctx: &EvalContext) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(spec.element.clone(), item.clone());

    if let Some(Value::Object(with)) = spec.task.as_ref().and_then(|t| t.get("with")) {
        let scoped = bind_element(ctx, &spec.element, item, 0);
        for (k, v) in with {
            let rendered = renderer.render_value(v, &scoped).unwrap_or_else(|_| v.clone());
            payload.insert(k.clone(), rendered);
        }
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new()
    }

    fn step_from_yaml(yaml: &str) -> Step {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_loop_spec_from_step() {
        let step = step_from_yaml(
            r#"
step: f
type: iterator
collection: [1, 2, 3]
element: x
mode: async
task:
  type: python
  code: "def main(x): return x * 10"
"#,
        );

        let spec = LoopSpec::from_step(&step).unwrap();
        assert_eq!(spec.element, "x");
        assert_eq!(spec.mode, LoopMode::Async);
        assert!(!spec.is_sub_playbook());
        assert!(spec.task.is_some());
    }

    #[test]
    fn test_loop_spec_requires_collection() {
        let step = step_from_yaml("step: f\ntype: iterator\nelement: x");
        assert!(LoopSpec::from_step(&step).is_err());
    }

    #[test]
    fn test_expand_array_literal() {
        let items = expand_collection(&json!([1, 2, 3]), &EvalContext::new(), &renderer()).unwrap();
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_expand_template_collection() {
        let mut ctx = EvalContext::new();
        ctx.insert("workload".to_string(), json!({"items": ["a", "b"]}));

        let items = expand_collection(
            &json!("{{ workload.items | tojson }}"),
            &ctx,
            &renderer(),
        )
        .unwrap();
        assert_eq!(items, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_expand_number_as_range() {
        let items = expand_collection(&json!(3), &EvalContext::new(), &renderer()).unwrap();
        assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn test_expand_object_as_pairs() {
        let items =
            expand_collection(&json!({"a": 1}), &EvalContext::new(), &renderer()).unwrap();
        assert_eq!(items, vec![json!({"key": "a", "value": 1})]);
    }

    #[test]
    fn test_where_filter_and_limit() {
        let step = step_from_yaml(
            r#"
step: f
type: iterator
collection: [1, 2, 3, 4, 5]
element: x
where: "{{ x > 1 }}"
limit: 2
"#,
        );

        let spec = LoopSpec::from_step(&step).unwrap();
        let items = spec.resolve_items(&EvalContext::new(), &renderer()).unwrap();
        assert_eq!(items, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_sub_playbook_detection() {
        let step = step_from_yaml(
            r#"
step: f
type: iterator
collection: [1]
element: x
task:
  type: playbook
  path: examples/child
"#,
        );

        let spec = LoopSpec::from_step(&step).unwrap();
        assert!(spec.is_sub_playbook());
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(loop_id(7, "fan"), "7:fan");
        assert_eq!(iteration_node_id(7, 2, 0), "7-step-2-iter-0");
    }

    #[test]
    fn test_aggregate_envelope() {
        let results = vec![json!(10), json!(20), json!(30)];
        let envelope = aggregate_envelope(&results);
        assert_eq!(envelope["results"], json!([10, 20, 30]));
        assert_eq!(envelope["count"], 3);
        assert_eq!(envelope["data"]["results"], json!([10, 20, 30]));
    }

    #[test]
    fn test_empty_aggregate_envelope() {
        let envelope = aggregate_envelope(&[]);
        assert_eq!(envelope["results"], json!([]));
        assert_eq!(envelope["count"], 0);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(LoopMode::parse("sync"), LoopMode::Sync);
        assert_eq!(LoopMode::parse("sequential"), LoopMode::Sync);
        assert_eq!(LoopMode::parse("async"), LoopMode::Async);
        assert_eq!(LoopMode::parse("anything"), LoopMode::Async);
    }
}
