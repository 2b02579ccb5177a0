//! Task normalization.
//!
//! Worker tasks are built from step definitions plus edge payloads; this
//! module normalizes legacy aliases into the canonical shape as a pure
//! function over JSON values:
//!
//! - `with` / `params` merge into `args` (explicit `args` wins on conflicts)
//! - `loop: {in, iterator}` becomes `type: iterator` with `collection` and
//!   `element`
//! - a top-level `data:` is lifted into `args:` when no `args:` is present
//!   (migration shim; `data` is reserved for step outputs)

use serde_json::{Map, Value};

/// Normalize a task map, returning a new value.
pub fn normalize_task(task: &Value) -> Value {
    let Value::Object(map) = task else {
        return task.clone();
    };

    let mut out: Map<String, Value> = map.clone();

    // Migration shim: legacy input `data:` becomes `args:` when absent.
    if out.contains_key("data") && !out.contains_key("args") {
        if let Some(data) = out.remove("data") {
            out.insert("args".to_string(), data);
        }
    }

    // Merge alias blocks into args; explicit args wins on key conflicts.
    let mut merged = Map::new();
    for alias in ["with", "params"] {
        if let Some(Value::Object(block)) = out.remove(alias) {
            for (k, v) in block {
                merged.insert(k, v);
            }
        }
    }

    if let Some(Value::Object(args)) = out.get("args").cloned() {
        for (k, v) in args {
            merged.insert(k, v);
        }
    }
    if !merged.is_empty() {
        out.insert("args".to_string(), Value::Object(merged));
    }

    // Legacy loop block: loop {in, iterator, mode} -> iterator shape.
    if let Some(Value::Object(loop_block)) = out.remove("loop") {
        out.entry("type".to_string())
            .or_insert_with(|| Value::String("iterator".to_string()));

        if let Some(in_expr) = loop_block.get("in") {
            out.entry("collection".to_string())
                .or_insert_with(|| in_expr.clone());
        }
        if let Some(iterator) = loop_block.get("iterator") {
            out.entry("element".to_string())
                .or_insert_with(|| iterator.clone());
        }
        if let Some(mode) = loop_block.get("mode") {
            out.entry("mode".to_string()).or_insert_with(|| mode.clone());
        }
        // Legacy pattern kept the nested unit under the loop block
        if let Some(task_block) = loop_block.get("task") {
            out.entry("task".to_string())
                .or_insert_with(|| task_block.clone());
        }
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_merges_into_args() {
        let task = json!({"type": "http", "with": {"mode": "hot"}});
        let out = normalize_task(&task);
        assert_eq!(out["args"], json!({"mode": "hot"}));
        assert!(out.get("with").is_none());
    }

    #[test]
    fn test_explicit_args_wins() {
        let task = json!({
            "type": "http",
            "with": {"mode": "hot", "retries": 1},
            "args": {"mode": "cold"}
        });
        let out = normalize_task(&task);
        assert_eq!(out["args"]["mode"], "cold");
        assert_eq!(out["args"]["retries"], 1);
    }

    #[test]
    fn test_data_lifted_to_args() {
        let task = json!({"type": "python", "code": "def main(): pass", "data": {"x": 1}});
        let out = normalize_task(&task);
        assert_eq!(out["args"], json!({"x": 1}));
        assert!(out.get("data").is_none());
    }

    #[test]
    fn test_data_not_lifted_when_args_present() {
        let task = json!({"type": "python", "args": {"y": 2}, "data": {"x": 1}});
        let out = normalize_task(&task);
        assert_eq!(out["args"], json!({"y": 2}));
        assert_eq!(out["data"], json!({"x": 1}));
    }

    #[test]
    fn test_loop_becomes_iterator() {
        let task = json!({
            "loop": {"in": "{{ workload.items }}", "iterator": "item", "mode": "async"}
        });
        let out = normalize_task(&task);
        assert_eq!(out["type"], "iterator");
        assert_eq!(out["collection"], "{{ workload.items }}");
        assert_eq!(out["element"], "item");
        assert_eq!(out["mode"], "async");
    }

    #[test]
    fn test_loop_does_not_override_explicit_fields() {
        let task = json!({
            "type": "iterator",
            "collection": "[1, 2]",
            "element": "x",
            "loop": {"in": "{{ other }}", "iterator": "y"}
        });
        let out = normalize_task(&task);
        assert_eq!(out["collection"], "[1, 2]");
        assert_eq!(out["element"], "x");
    }

    #[test]
    fn test_non_object_passthrough() {
        let task = json!("plain");
        assert_eq!(normalize_task(&task), task);
    }
}
