//! Playbook YAML parser and validation.
//!
//! Parses YAML playbook definitions into [`Playbook`] structures and
//! validates the workflow graph:
//! - a step named `start` must exist
//! - step names are unique
//! - every `next:` edge references a known step
//! - the graph is acyclic (a `next:` edge re-entering an ancestor is
//!   rejected at register time, since end-step finalization counts distinct
//!   completed steps)

use std::collections::{HashMap, HashSet};

use crate::error::{AppError, AppResult};
use crate::playbook::types::{Playbook, Step};

/// Parse a YAML string into a validated Playbook.
pub fn parse_playbook(yaml_content: &str) -> AppResult<Playbook> {
    let playbook: Playbook = serde_yaml::from_str(yaml_content)
        .map_err(|e| AppError::InvalidPlaybook(e.to_string()))?;

    validate_playbook(&playbook)?;

    Ok(playbook)
}

/// Validate a parsed playbook.
pub fn validate_playbook(playbook: &Playbook) -> AppResult<()> {
    if playbook.workflow.is_empty() {
        return Err(AppError::InvalidPlaybook(
            "Workflow has no steps".to_string(),
        ));
    }

    if !playbook.has_start_step() {
        return Err(AppError::InvalidPlaybook(
            "Workflow must have a step named 'start'".to_string(),
        ));
    }

    // Duplicate step names
    let mut seen_steps = HashSet::new();
    for step in &playbook.workflow {
        if !seen_steps.insert(step.step.as_str()) {
            return Err(AppError::InvalidPlaybook(format!(
                "Duplicate step name: {}",
                step.step
            )));
        }
    }

    // Transition references
    for step in &playbook.workflow {
        for transition in step.transitions() {
            let target = transition.step_name();
            if !seen_steps.contains(target) {
                return Err(AppError::InvalidPlaybook(format!(
                    "Step '{}' references unknown step '{}' in next",
                    step.step, target
                )));
            }
        }
    }

    detect_cycles(playbook)?;

    Ok(())
}

/// Reject workflows whose `next:` edges form a cycle.
fn detect_cycles(playbook: &Playbook) -> AppResult<()> {
    let adjacency: HashMap<&str, Vec<&str>> = playbook
        .workflow
        .iter()
        .map(|s| {
            (
                s.step.as_str(),
                s.transitions().iter().map(|t| t.step_name()).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), String> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => return Err(node.to_string()),
            None => {}
        }

        marks.insert(node, Mark::InProgress);
        if let Some(targets) = adjacency.get(node) {
            for target in targets {
                visit(target, adjacency, marks)?;
            }
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for step in &playbook.workflow {
        if let Err(node) = visit(step.step.as_str(), &adjacency, &mut marks) {
            return Err(AppError::InvalidPlaybook(format!(
                "Workflow contains a cycle through step '{}'",
                node
            )));
        }
    }

    Ok(())
}

/// Append an implicit terminal step when the workflow has no `end` step.
///
/// The implicit step has no `result:` mapping; at finalization the engine
/// falls back to the aggregated per-step results.
pub fn ensure_terminal_step(mut playbook: Playbook) -> Playbook {
    if playbook.get_step("end").is_none() {
        playbook.workflow.push(Step {
            step: "end".to_string(),
            desc: Some("Implicit terminal step".to_string()),
            step_type: None,
            next: None,
            result: None,
            extra: serde_json::Map::new(),
        });
    }
    playbook
}

/// Extract `(kind, path)` from YAML content without full playbook parsing.
///
/// Used at register time, where the resource may be a Tool or Model rather
/// than a Playbook. The path comes from `metadata.path` with a fallback to
/// `metadata.name`.
pub fn extract_kind_and_path(yaml_content: &str) -> AppResult<(Option<String>, String)> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml_content).map_err(|e| AppError::InvalidPlaybook(e.to_string()))?;

    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .map(|s| s.to_string());

    let metadata = value
        .get("metadata")
        .ok_or_else(|| AppError::InvalidPlaybook("Missing 'metadata' section".to_string()))?;

    let path = metadata
        .get("path")
        .and_then(|p| p.as_str())
        .or_else(|| metadata.get("name").and_then(|n| n.as_str()))
        .ok_or_else(|| AppError::MissingPath("No 'path' or 'name' in metadata".to_string()))?
        .to_string();

    Ok((kind, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_playbook() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    next:
      - step: work
  - step: work
    type: python
    code: "def main(): return 1"
"#;

        assert!(parse_playbook(yaml).is_ok());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_playbook("workflow: [unterminated");
        assert!(matches!(result, Err(AppError::InvalidPlaybook(_))));
    }

    #[test]
    fn test_parse_missing_start_step() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: process
    type: python
    code: "def main(): return 1"
"#;

        let result = parse_playbook(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("start"));
    }

    #[test]
    fn test_parse_duplicate_step_names() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
  - step: start
"#;

        let result = parse_playbook(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Duplicate"));
    }

    #[test]
    fn test_parse_unknown_next_reference() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    next:
      - step: nonexistent
"#;

        let result = parse_playbook(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("unknown step"));
    }

    #[test]
    fn test_reject_cycle() {
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
      - step: b
  - step: b
    type: python
    code: "def main(): return 2"
    next:
      - step: a
"#;

        let result = parse_playbook(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn test_branching_is_not_a_cycle() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    next:
      - step: hot
      - step: cold
  - step: hot
    type: python
    code: "def main(): return 1"
    next:
      - step: end
  - step: cold
    type: python
    code: "def main(): return 2"
    next:
      - step: end
  - step: end
"#;

        assert!(parse_playbook(yaml).is_ok());
    }

    #[test]
    fn test_ensure_terminal_step_appends_end() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    next:
      - step: work
  - step: work
    type: python
    code: "def main(): return 1"
"#;

        let playbook = parse_playbook(yaml).unwrap();
        assert!(playbook.get_step("end").is_none());

        let playbook = ensure_terminal_step(playbook);
        let end = playbook.get_step("end").unwrap();
        assert!(!end.is_actionable());
        assert!(end.result.is_none());
    }

    #[test]
    fn test_ensure_terminal_step_keeps_existing_end() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    next:
      - step: end
  - step: end
    result:
      v: "{{ start }}"
"#;

        let playbook = ensure_terminal_step(parse_playbook(yaml).unwrap());
        assert_eq!(playbook.workflow.len(), 2);
        assert!(playbook.get_step("end").unwrap().result.is_some());
    }

    #[test]
    fn test_extract_kind_and_path() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  path: examples/weather
  name: weather
"#;

        let (kind, path) = extract_kind_and_path(yaml).unwrap();
        assert_eq!(kind, Some("Playbook".to_string()));
        assert_eq!(path, "examples/weather");
    }

    #[test]
    fn test_extract_path_falls_back_to_name() {
        let yaml = r#"
kind: Playbook
metadata:
  name: weather
"#;

        let (_, path) = extract_kind_and_path(yaml).unwrap();
        assert_eq!(path, "weather");
    }

    #[test]
    fn test_extract_missing_path_and_name() {
        let yaml = r#"
kind: Playbook
metadata:
  description: no identity
"#;

        let result = extract_kind_and_path(yaml);
        assert!(matches!(result, Err(AppError::MissingPath(_))));
    }

    #[test]
    fn test_ill_formed_yaml_is_invalid_playbook() {
        let result = extract_kind_and_path("metadata: [unterminated");
        assert!(matches!(result, Err(AppError::InvalidPlaybook(_))));
    }
}
