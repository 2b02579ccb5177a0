//! Evaluation context building.
//!
//! Transition predicates and result mappings render against the workload
//! merged with `{step_name: latest_result}` for every completed step.

use std::collections::HashMap;

use serde_json::Value;

/// Context map used for template rendering and condition evaluation.
pub type EvalContext = HashMap<String, Value>;

/// Build the evaluation context for an execution.
pub fn build_context(
    execution_id: i64,
    workload: Option<&Value>,
    node_results: &[(String, Value)],
) -> EvalContext {
    let mut ctx = EvalContext::new();

    let workload = workload.cloned().unwrap_or_else(|| Value::Object(Default::default()));
    ctx.insert("workload".to_string(), workload);
    ctx.insert(
        "execution_id".to_string(),
        Value::String(execution_id.to_string()),
    );

    for (name, result) in node_results {
        ctx.insert(name.clone(), flatten_result_envelope(result));
    }

    ctx
}

/// Unwrap the worker result envelope.
///
/// Workers report results as `{"kind": "data", "data": {...}, "status": ...}`;
/// step authors reference the inner payload directly.
pub fn flatten_result_envelope(result: &Value) -> Value {
    if let Value::Object(map) = result {
        let has_marker =
            map.contains_key("status") || map.contains_key("kind") || map.contains_key("id");
        if has_marker {
            if let Some(data) = map.get("data") {
                if data.is_object() || data.is_array() {
                    return data.clone();
                }
            }
        }
    }
    result.clone()
}

/// Deep-merge `overlay` into `base`, returning a new value.
///
/// Objects merge recursively; any other overlay value replaces the base.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                let entry = match merged.get(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v.clone(),
                };
                merged.insert(k.clone(), entry);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_context_includes_workload_and_results() {
        let workload = json!({"city": "Paris"});
        let results = vec![("fetch".to_string(), json!({"temp": 25}))];

        let ctx = build_context(42, Some(&workload), &results);

        assert_eq!(ctx["workload"], json!({"city": "Paris"}));
        assert_eq!(ctx["execution_id"], json!("42"));
        assert_eq!(ctx["fetch"], json!({"temp": 25}));
    }

    #[test]
    fn test_flatten_envelope() {
        let wrapped = json!({"kind": "data", "status": "COMPLETED", "data": {"temp": 25}});
        assert_eq!(flatten_result_envelope(&wrapped), json!({"temp": 25}));

        let plain = json!({"temp": 25});
        assert_eq!(flatten_result_envelope(&plain), plain);

        let scalar_data = json!({"status": "COMPLETED", "data": 7});
        assert_eq!(flatten_result_envelope(&scalar_data), scalar_data);
    }

    #[test]
    fn test_deep_merge_nested() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        let overlay = json!({"a": {"y": 3, "z": 4}, "c": 2});

        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1, "c": 2}));
    }

    #[test]
    fn test_deep_merge_scalar_replaces() {
        let base = json!({"a": {"x": 1}});
        let overlay = json!({"a": 5});
        assert_eq!(deep_merge(&base, &overlay), json!({"a": 5}));
    }
}
