use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::expr::Expr;
use super::node::{string_or_number, LoopMode, NodeKind, Plan, PlanNode, Schedule};
use crate::error::ValidationError;

/// Upper bound on a retry delay (one day).
pub const MAX_BACKOFF_SECONDS: f64 = 86_400.0;

/// A validated plan plus lookup structures used by the engine.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub plan: Plan,
    pub node_map: HashMap<String, PlanNode>,
    /// Child ids for every node, regardless of kind.
    pub adjacency: HashMap<String, Vec<String>>,
    /// Compiled expressions keyed by node id: the conditional expression, the
    /// while-loop condition, or the for-each collection.
    pub expressions: HashMap<String, Expr>,
}

impl PlanContext {
    /// Parse a raw plan document.
    ///
    /// The children-embedded form is tried first; if that fails, the
    /// edge-list form is attempted and normalized. When both fail, the error
    /// from the form the document most resembles is returned.
    pub fn parse(raw: &Value) -> Result<Self, ValidationError> {
        match serde_json::from_value::<Plan>(raw.clone()) {
            Ok(plan) => Self::from_plan(plan),
            Err(primary_err) => {
                debug!(error = %primary_err, "Primary plan schema rejected document, trying edge list");
                match normalize_edge_list(raw) {
                    Ok(plan) => Self::from_plan(plan),
                    Err(edge_err) => {
                        if raw.get("edges").is_some() {
                            Err(edge_err)
                        } else {
                            Err(ValidationError::Schema(primary_err.to_string()))
                        }
                    }
                }
            }
        }
    }

    /// Validate an already-typed plan.
    pub fn from_plan(plan: Plan) -> Result<Self, ValidationError> {
        let mut node_map = HashMap::with_capacity(plan.nodes.len());
        for node in &plan.nodes {
            if node.id.trim().is_empty() {
                return Err(ValidationError::Schema("node id must not be empty".into()));
            }
            if node_map.insert(node.id.clone(), node.clone()).is_some() {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
        }

        if !node_map.contains_key(&plan.entry) {
            return Err(ValidationError::MissingEntry(plan.entry.clone()));
        }

        let mut adjacency = HashMap::with_capacity(node_map.len());
        let mut expressions = HashMap::new();

        for node in &plan.nodes {
            let children = node.kind.child_ids();
            for child in &children {
                if !node_map.contains_key(child) {
                    return Err(ValidationError::UnresolvedChild {
                        parent: node.id.clone(),
                        child: child.clone(),
                    });
                }
            }
            adjacency.insert(node.id.clone(), children);

            if let Some(retry) = &node.retry_policy {
                if retry.max_attempts == 0 {
                    return Err(invalid(node, "retryPolicy.maxAttempts must be at least 1"));
                }
                if !(0.0..=MAX_BACKOFF_SECONDS).contains(&retry.backoff_seconds) {
                    return Err(invalid(
                        node,
                        &format!(
                            "retryPolicy.backoffSeconds must be between 0 and {}",
                            MAX_BACKOFF_SECONDS
                        ),
                    ));
                }
            }

            match &node.kind {
                NodeKind::Conditional { expression, .. } => {
                    expressions.insert(node.id.clone(), compile(node, expression)?);
                }
                NodeKind::Loop {
                    mode,
                    condition,
                    collection,
                    max_iterations,
                    ..
                } => {
                    if *max_iterations == 0 {
                        return Err(invalid(node, "maxIterations must be at least 1"));
                    }
                    let source = match mode {
                        LoopMode::While => condition
                            .as_deref()
                            .ok_or_else(|| invalid(node, "while loop requires a condition"))?,
                        LoopMode::ForEach => collection
                            .as_deref()
                            .ok_or_else(|| invalid(node, "for-each loop requires a collection"))?,
                    };
                    expressions.insert(node.id.clone(), compile(node, source)?);
                }
                _ => {}
            }
        }

        detect_cycles(&plan.entry, &plan.nodes, &adjacency)?;

        let ctx = Self {
            plan,
            node_map,
            adjacency,
            expressions,
        };

        let reachable = ctx.reachable_from(&ctx.plan.entry);
        if reachable.len() < ctx.node_map.len() {
            let mut orphans: Vec<&String> = ctx
                .node_map
                .keys()
                .filter(|id| !reachable.contains(*id))
                .collect();
            orphans.sort();
            warn!(plan_id = %ctx.plan.id, ?orphans, "Plan contains nodes unreachable from entry");
        }

        Ok(ctx)
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.node_map.get(id)
    }

    pub fn entry(&self) -> &str {
        &self.plan.entry
    }

    /// Every node reachable from `start` through the adjacency lists,
    /// including `start` itself.
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(children) = self.adjacency.get(&id) {
                queue.extend(children.iter().cloned());
            }
        }
        seen
    }
}

fn invalid(node: &PlanNode, message: &str) -> ValidationError {
    ValidationError::InvalidNode {
        node: node.id.clone(),
        message: message.to_string(),
    }
}

fn compile(node: &PlanNode, source: &str) -> Result<Expr, ValidationError> {
    Expr::parse(source).map_err(|message| ValidationError::Expression {
        node: node.id.clone(),
        message,
    })
}

/// Reject any cycle in the child graph. Loops re-enter their body through
/// the `loop` node itself, never through a back-reference.
fn detect_cycles(
    entry: &str,
    nodes: &[PlanNode],
    adjacency: &HashMap<String, Vec<String>>,
) -> Result<(), ValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let roots = std::iter::once(entry).chain(nodes.iter().map(|n| n.id.as_str()));

    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        // Iterative DFS: (node, next child index)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::Visiting);

        while let Some((id, idx)) = stack.pop() {
            let children = adjacency.get(id).map(|c| c.as_slice()).unwrap_or(&[]);
            if idx < children.len() {
                stack.push((id, idx + 1));
                let child = children[idx].as_str();
                match marks.get(child) {
                    Some(Mark::Visiting) => return Err(ValidationError::Cycle(child.to_string())),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(id, Mark::Done);
            }
        }
    }

    Ok(())
}

// ---- Edge-list form ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgeListDocument {
    id: String,
    #[serde(default = "default_version", deserialize_with = "string_or_number")]
    version: String,
    entry: String,
    nodes: Vec<Value>,
    edges: Vec<EdgeSpec>,
    #[serde(default)]
    schedule: Schedule,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Deserialize)]
struct EdgeSpec {
    source: String,
    target: String,
    /// `"true"` / `"false"` for conditional sources.
    #[serde(default)]
    branch: Option<Value>,
}

/// Convert the edge-list representation into the children-embedded form.
///
/// Only fields known to the primary schema survive; UI-only fields such as
/// positions are dropped.
fn normalize_edge_list(raw: &Value) -> Result<Plan, ValidationError> {
    let doc: EdgeListDocument = serde_json::from_value(raw.clone())
        .map_err(|e| ValidationError::Schema(format!("edge list: {}", e)))?;

    let mut nodes = Vec::with_capacity(doc.nodes.len());
    for mut value in doc.nodes {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| ValidationError::Schema("edge list: node must be an object".into()))?;
        let node_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("").to_string();
        let containers: &[&str] = match node_type.as_str() {
            "sequence" | "parallel" => &["children"],
            "conditional" => &["whenTrue", "whenFalse"],
            "loop" => &["body"],
            _ => &[],
        };
        for field in containers {
            obj.entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
        }
        let node: PlanNode = serde_json::from_value(value)
            .map_err(|e| ValidationError::Schema(format!("edge list node: {}", e)))?;
        nodes.push(node);
    }

    let index: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    for edge in doc.edges {
        let Some(&pos) = index.get(&edge.source) else {
            return Err(ValidationError::InvalidEdge {
                source_id: edge.source,
                target: edge.target,
                message: "unknown source node".into(),
            });
        };
        let branch_false = match &edge.branch {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => !b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("false"),
            Some(_) => {
                return Err(ValidationError::InvalidEdge {
                    source_id: edge.source,
                    target: edge.target,
                    message: "branch must be \"true\" or \"false\"".into(),
                })
            }
        };
        let list = match &mut nodes[pos].kind {
            NodeKind::Sequence { children } | NodeKind::Parallel { children } => children,
            NodeKind::Conditional {
                when_true,
                when_false,
                ..
            } => {
                if branch_false {
                    when_false
                } else {
                    when_true
                }
            }
            NodeKind::Loop { body, .. } => body,
            other => {
                return Err(ValidationError::InvalidEdge {
                    source_id: edge.source,
                    target: edge.target,
                    message: format!("{} nodes cannot have outgoing edges", other.type_name()),
                })
            }
        };
        if !list.contains(&edge.target) {
            list.push(edge.target);
        }
    }

    Ok(Plan {
        id: doc.id,
        version: doc.version,
        entry: doc.entry,
        nodes,
        schedule: doc.schedule,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str) -> Value {
        json!({"id": id, "type": "local_task", "command": "echo hi"})
    }

    #[test]
    fn parses_children_form_and_builds_adjacency() {
        let raw = json!({
            "id": "deploy",
            "version": "3",
            "entry": "root",
            "nodes": [
                {"id": "root", "type": "sequence", "children": ["build", "fanout"]},
                task("build"),
                {"id": "fanout", "type": "parallel", "children": ["a", "b"]},
                task("a"),
                task("b")
            ]
        });
        let ctx = PlanContext::parse(&raw).unwrap();
        assert_eq!(ctx.adjacency["root"], vec!["build", "fanout"]);
        assert_eq!(ctx.adjacency["fanout"], vec!["a", "b"]);
        assert!(ctx.adjacency["a"].is_empty());
        assert_eq!(ctx.reachable_from("root").len(), 5);
        assert_eq!(ctx.reachable_from("fanout").len(), 3);
    }

    #[test]
    fn unresolved_child_is_rejected() {
        let raw = json!({
            "id": "p",
            "entry": "root",
            "nodes": [{"id": "root", "type": "sequence", "children": ["ghost"]}]
        });
        let err = PlanContext::parse(&raw).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnresolvedChild {
                parent: "root".into(),
                child: "ghost".into()
            }
        );
    }

    #[test]
    fn missing_entry_and_duplicates_are_rejected() {
        let raw = json!({"id": "p", "entry": "nope", "nodes": [task("a")]});
        assert_eq!(
            PlanContext::parse(&raw).unwrap_err(),
            ValidationError::MissingEntry("nope".into())
        );

        let raw = json!({"id": "p", "entry": "a", "nodes": [task("a"), task("a")]});
        assert_eq!(
            PlanContext::parse(&raw).unwrap_err(),
            ValidationError::DuplicateNode("a".into())
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let raw = json!({
            "id": "p",
            "entry": "a",
            "nodes": [
                {"id": "a", "type": "sequence", "children": ["b"]},
                {"id": "b", "type": "parallel", "children": ["a"]}
            ]
        });
        assert!(matches!(
            PlanContext::parse(&raw).unwrap_err(),
            ValidationError::Cycle(_)
        ));
    }

    #[test]
    fn shared_child_is_not_a_cycle() {
        let raw = json!({
            "id": "p",
            "entry": "root",
            "nodes": [
                {"id": "root", "type": "sequence", "children": ["x", "y"]},
                {"id": "x", "type": "sequence", "children": ["leaf"]},
                {"id": "y", "type": "sequence", "children": ["leaf"]},
                task("leaf")
            ]
        });
        assert!(PlanContext::parse(&raw).is_ok());
    }

    #[test]
    fn malformed_expression_surfaces_specific_message() {
        let raw = json!({
            "id": "p",
            "entry": "check",
            "nodes": [
                {"id": "check", "type": "conditional", "expression": "a.output ==",
                 "whenTrue": ["t"], "whenFalse": []},
                task("t")
            ]
        });
        let err = PlanContext::parse(&raw).unwrap_err();
        match err {
            ValidationError::Expression { node, message } => {
                assert_eq!(node, "check");
                assert!(message.contains("unexpected end"), "{}", message);
            }
            other => panic!("expected expression error, got {:?}", other),
        }
    }

    #[test]
    fn edge_list_is_normalized() {
        let raw = json!({
            "id": "p",
            "entry": "root",
            "nodes": [
                {"id": "root", "type": "sequence", "position": {"x": 1, "y": 2}},
                {"id": "gate", "type": "conditional", "expression": "true"},
                task("yes"),
                task("no"),
                task("after")
            ],
            "edges": [
                {"source": "root", "target": "gate"},
                {"source": "gate", "target": "yes", "branch": "true"},
                {"source": "gate", "target": "no", "branch": false},
                {"source": "root", "target": "after"}
            ]
        });
        let ctx = PlanContext::parse(&raw).unwrap();
        assert_eq!(ctx.adjacency["root"], vec!["gate", "after"]);
        match &ctx.node("gate").unwrap().kind {
            NodeKind::Conditional {
                when_true,
                when_false,
                ..
            } => {
                assert_eq!(when_true, &vec!["yes".to_string()]);
                assert_eq!(when_false, &vec!["no".to_string()]);
            }
            other => panic!("expected conditional, got {:?}", other),
        }
    }

    #[test]
    fn edge_from_leaf_is_rejected() {
        let raw = json!({
            "id": "p",
            "entry": "a",
            "nodes": [task("a"), task("b")],
            "edges": [{"source": "a", "target": "b"}]
        });
        assert!(matches!(
            PlanContext::parse(&raw).unwrap_err(),
            ValidationError::InvalidEdge { .. }
        ));
    }

    #[test]
    fn neither_schema_reports_primary_error() {
        let raw = json!({"id": "p", "nodes": []});
        match PlanContext::parse(&raw).unwrap_err() {
            ValidationError::Schema(msg) => assert!(msg.contains("entry"), "{}", msg),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn loops_require_their_driving_expression() {
        let raw = json!({
            "id": "p",
            "entry": "l",
            "nodes": [
                {"id": "l", "type": "loop", "mode": "while", "body": ["t"], "maxIterations": 3},
                task("t")
            ]
        });
        assert!(matches!(
            PlanContext::parse(&raw).unwrap_err(),
            ValidationError::InvalidNode { .. }
        ));
    }

    #[test]
    fn backoff_must_fit_a_duration() {
        let with_backoff = |backoff: Value| {
            json!({
                "id": "p",
                "entry": "t",
                "nodes": [{
                    "id": "t", "type": "local_task", "command": "true",
                    "retryPolicy": {"maxAttempts": 2, "backoffSeconds": backoff}
                }]
            })
        };

        for bad in [json!(1e20), json!(-1), json!(MAX_BACKOFF_SECONDS + 1.0)] {
            match PlanContext::parse(&with_backoff(bad.clone())).unwrap_err() {
                ValidationError::InvalidNode { node, message } => {
                    assert_eq!(node, "t");
                    assert!(message.contains("backoffSeconds"), "{}", message);
                }
                other => panic!("expected invalid node for {}, got {:?}", bad, other),
            }
        }
        assert!(PlanContext::parse(&with_backoff(json!(2.5))).is_ok());
        assert!(PlanContext::parse(&with_backoff(json!(MAX_BACKOFF_SECONDS))).is_ok());
    }
}
