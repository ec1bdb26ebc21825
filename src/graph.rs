// src/graph.rs

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};
use petgraph::{algo::tarjan_scc, graphmap::DiGraphMap};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{
    message::{Attachment, ButtonOption},
    state::{StateValue, Variables},
};

pub type NodeId = String;

/// What has to happen for a contact without a session to enter the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Trigger {
    #[serde(alias = "NewChat")]
    NewConversation,
    Webhook,
    NewAssignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ValidationKind {
    String,
    Number,
    Boolean,
    Email,
    Phone,
    #[serde(alias = "RegExp")]
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MatchMode {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Includes,
    StartsWith,
    EndsWith,
}

/// `left <operator> right`, both sides naming session variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Condition {
    #[serde(rename = "variable1")]
    pub left: String,
    pub operator: Operator,
    #[serde(rename = "variable2")]
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BranchItem {
    #[serde(rename = "type")]
    pub mode: MatchMode,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NodeId>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// The nine node kinds of a flow, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum NodeKind {
    Start {
        trigger: Trigger,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<NodeId>,
    },
    SendMessage {
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<NodeId>,
    },
    CollectInput {
        text: String,
        variable: String,
        validation: ValidationKind,
        /// Pattern for `Regex` validation.
        #[serde(rename = "regexp", default, skip_serializing_if = "Option::is_none")]
        validation_param: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<NodeId>,
    },
    Buttons {
        text: String,
        #[serde(rename = "buttons", default)]
        options: Vec<ButtonOption>,
    },
    Branch {
        #[serde(rename = "branches", default)]
        items: Vec<BranchItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<NodeId>,
    },
    ServiceCall {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(alias = "data", default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        /// Variable receiving the response body.
        #[serde(rename = "variable", default, skip_serializing_if = "Option::is_none")]
        capture: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<NodeId>,
    },
    #[serde(alias = "Assign", alias = "Transfer")]
    Reassign {
        #[serde(rename = "assignedTo", default)]
        assignee: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<NodeId>,
    },
    AssignTag {
        tag_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<NodeId>,
    },
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<NodeId>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start { .. } => "Start",
            NodeKind::SendMessage { .. } => "SendMessage",
            NodeKind::CollectInput { .. } => "CollectInput",
            NodeKind::Buttons { .. } => "Buttons",
            NodeKind::Branch { .. } => "Branch",
            NodeKind::ServiceCall { .. } => "ServiceCall",
            NodeKind::Reassign { .. } => "Reassign",
            NodeKind::AssignTag { .. } => "AssignTag",
            NodeKind::Close { .. } => "Close",
        }
    }

    /// Kinds that emit a prompt and then wait for the contact to answer.
    pub fn is_suspending(&self) -> bool {
        matches!(self, NodeKind::CollectInput { .. } | NodeKind::Buttons { .. })
    }

    /// Kinds whose outcome depends on something outside the session.
    pub fn waits_for_input(&self) -> bool {
        self.is_suspending() || matches!(self, NodeKind::ServiceCall { .. })
    }

    fn edges_mut(&mut self) -> Vec<&mut Option<NodeId>> {
        match self {
            NodeKind::Start { next, .. }
            | NodeKind::SendMessage { next, .. }
            | NodeKind::CollectInput { next, .. }
            | NodeKind::Reassign { next, .. }
            | NodeKind::AssignTag { next, .. }
            | NodeKind::Close { next } => vec![next],
            NodeKind::Buttons { options, .. } => options.iter_mut().map(|o| &mut o.target).collect(),
            NodeKind::Branch { items, default } => {
                let mut edges: Vec<_> = items.iter_mut().map(|i| &mut i.next).collect();
                edges.push(default);
                edges
            }
            NodeKind::ServiceCall { next, error, .. } => vec![next, error],
        }
    }

    /// Every outgoing edge that names a node.
    pub fn edges(&self) -> Vec<&str> {
        let edges: Vec<&Option<NodeId>> = match self {
            NodeKind::Start { next, .. }
            | NodeKind::SendMessage { next, .. }
            | NodeKind::CollectInput { next, .. }
            | NodeKind::Reassign { next, .. }
            | NodeKind::AssignTag { next, .. }
            | NodeKind::Close { next } => vec![next],
            NodeKind::Buttons { options, .. } => options.iter().map(|o| &o.target).collect(),
            NodeKind::Branch { items, default } => items
                .iter()
                .map(|i| &i.next)
                .chain(std::iter::once(default))
                .collect(),
            NodeKind::ServiceCall { next, error, .. } => vec![next, error],
        };
        edges.into_iter().filter_map(|e| e.as_deref()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VariableKind {
    #[default]
    Auto,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: VariableKind,
    #[serde(rename = "value", alias = "default", default)]
    pub default: StateValue,
}

/// The flow definition as exported by the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GraphDef {
    /// Either a list of nodes carrying their `id`, or an object keyed by id.
    #[serde(deserialize_with = "deserialize_nodes")]
    #[schemars(with = "Vec<Node>")]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(default)]
    id: Option<NodeId>,
    #[serde(flatten)]
    kind: NodeKind,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNodes {
    List(Vec<Node>),
    Map(BTreeMap<NodeId, RawNode>),
}

// accepts both editor layouts; a keyed node gets its key as id
fn deserialize_nodes<'de, D>(deserializer: D) -> Result<Vec<Node>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawNodes::deserialize(deserializer)? {
        RawNodes::List(nodes) => nodes,
        RawNodes::Map(map) => map
            .into_iter()
            .map(|(key, raw)| Node {
                id: raw.id.unwrap_or(key),
                kind: raw.kind,
            })
            .collect(),
    })
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("could not read graph file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid graph JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("graph has no Start node")]
    MissingStart,
    #[error("graph has more than one Start node: {0:?}")]
    MultipleStarts(Vec<NodeId>),
    #[error("node id `{0}` is declared twice")]
    DuplicateNode(NodeId),
    #[error("node `{from}` points to unknown node `{to}`")]
    DanglingEdge { from: NodeId, to: NodeId },
    #[error("node `{0}` validates with Regex but has no pattern")]
    MissingPattern(NodeId),
    #[error("node `{node}` has an invalid pattern: {source}")]
    InvalidPattern {
        node: NodeId,
        #[source]
        source: regex::Error,
    },
    #[error("node `{node}` calls an invalid url `{url}`: {source}")]
    InvalidUrl {
        node: NodeId,
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("nodes {0:?} form a cycle that never waits for input")]
    UnboundedCycle(Vec<NodeId>),
}

/// Immutable, validated flow graph shared by every session of one agent.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    variables: Vec<VariableDeclaration>,
    start: NodeId,
    trigger: Trigger,
    patterns: HashMap<NodeId, Regex>,
}

impl Graph {
    pub fn new(def: GraphDef) -> Result<Self, GraphError> {
        let mut nodes = HashMap::with_capacity(def.nodes.len());
        for mut node in def.nodes {
            // an empty edge is the editor's way of saying "end of conversation"
            for edge in node.kind.edges_mut() {
                if edge.as_deref().is_some_and(str::is_empty) {
                    *edge = None;
                }
            }
            if nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id));
            }
            nodes.insert(node.id.clone(), node);
        }

        let mut starts: Vec<NodeId> = nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Start { .. }))
            .map(|n| n.id.clone())
            .collect();
        starts.sort();
        let start = match starts.len() {
            0 => return Err(GraphError::MissingStart),
            1 => starts.remove(0),
            _ => return Err(GraphError::MultipleStarts(starts)),
        };
        let trigger = match nodes.get(&start).map(|n| &n.kind) {
            Some(NodeKind::Start { trigger, .. }) => *trigger,
            _ => return Err(GraphError::MissingStart),
        };

        let mut patterns = HashMap::new();
        for node in nodes.values() {
            for to in node.kind.edges() {
                if !nodes.contains_key(to) {
                    return Err(GraphError::DanglingEdge {
                        from: node.id.clone(),
                        to: to.to_string(),
                    });
                }
            }
            match &node.kind {
                NodeKind::CollectInput {
                    validation: ValidationKind::Regex,
                    validation_param,
                    ..
                } => {
                    let pattern = validation_param
                        .as_deref()
                        .ok_or_else(|| GraphError::MissingPattern(node.id.clone()))?;
                    let regex = Regex::new(pattern).map_err(|source| GraphError::InvalidPattern {
                        node: node.id.clone(),
                        source,
                    })?;
                    patterns.insert(node.id.clone(), regex);
                }
                NodeKind::ServiceCall { url, .. } => {
                    url::Url::parse(url).map_err(|source| GraphError::InvalidUrl {
                        node: node.id.clone(),
                        url: url.clone(),
                        source,
                    })?;
                }
                _ => {}
            }
        }

        check_unbounded_cycles(&nodes)?;

        debug!(nodes = nodes.len(), start = %start, "graph built");
        Ok(Self {
            nodes,
            variables: def.variables,
            start,
            trigger,
            patterns,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let def: GraphDef = serde_json::from_str(json)?;
        Self::new(def)
    }

    pub fn from_value(value: Value) -> Result<Self, GraphError> {
        let def: GraphDef = serde_json::from_value(value)?;
        Self::new(def)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| GraphError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Follows an edge. `None` means the conversation ends there.
    pub fn resolve(&self, edge: Option<&str>) -> Option<&Node> {
        edge.filter(|id| !id.is_empty()).and_then(|id| self.nodes.get(id))
    }

    pub fn start_id(&self) -> &str {
        &self.start
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn variables(&self) -> &[VariableDeclaration] {
        &self.variables
    }

    /// Fresh bindings for a new session: every declared variable at its default.
    pub fn initial_variables(&self) -> Variables {
        self.variables
            .iter()
            .map(|v| (v.name.clone(), v.default.clone()))
            .collect()
    }

    pub fn pattern(&self, node: &str) -> Option<&Regex> {
        self.patterns.get(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}

// A cycle made only of nodes that never wait would spin a session forever.
fn check_unbounded_cycles(nodes: &HashMap<NodeId, Node>) -> Result<(), GraphError> {
    let mut g: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in nodes.values().filter(|n| !n.kind.waits_for_input()) {
        g.add_node(node.id.as_str());
        for to in node.kind.edges() {
            if nodes.get(to).is_some_and(|n| !n.kind.waits_for_input()) {
                g.add_edge(node.id.as_str(), to, ());
            }
        }
    }

    for scc in tarjan_scc(&g) {
        let looping = scc.len() > 1 || g.contains_edge(scc[0], scc[0]);
        if looping {
            let mut ids: Vec<NodeId> = scc.into_iter().map(str::to_string).collect();
            ids.sort();
            return Err(GraphError::UnboundedCycle(ids));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear() -> Value {
        json!({
            "nodes": [
                {"id": "start", "type": "Start", "trigger": "NewChat", "next": "hello"},
                {"id": "hello", "type": "SendMessage", "text": "Hi", "attachments": [], "next": "ask"},
                {"id": "ask", "type": "CollectInput", "text": "Name?", "variable": "name",
                 "validation": "String", "next": "bye"},
                {"id": "bye", "type": "Close"}
            ],
            "variables": [{"id": 1, "type": "Auto", "name": "name"}]
        })
    }

    #[test]
    fn test_build_linear_graph() {
        let graph = Graph::from_value(linear()).unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.start_id(), "start");
        assert_eq!(graph.trigger(), Trigger::NewConversation);
        assert_eq!(
            graph.initial_variables().get("name"),
            Some(&StateValue::Null)
        );
        assert!(graph.node("ask").unwrap().kind.is_suspending());
        assert!(graph.resolve(Some("")).is_none());
        assert!(graph.resolve(None).is_none());
        assert_eq!(graph.resolve(Some("bye")).unwrap().id, "bye");
    }

    #[test]
    fn test_keyed_nodes_get_their_key_as_id() {
        let graph = Graph::from_value(json!({
            "nodes": {
                "s": {"type": "Start", "trigger": "Webhook", "next": "t"},
                "t": {"type": "Transfer", "assignedTo": 12}
            },
            "variables": []
        }))
        .unwrap();
        match &graph.node("t").unwrap().kind {
            NodeKind::Reassign { assignee, next } => {
                assert_eq!(*assignee, Some(12));
                assert!(next.is_none());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_empty_edge_means_end() {
        let graph = Graph::from_value(json!({
            "nodes": [
                {"id": "s", "type": "Start", "trigger": "Webhook", "next": ""}
            ]
        }))
        .unwrap();
        assert!(graph.node("s").unwrap().kind.edges().is_empty());
    }

    #[test]
    fn test_missing_and_multiple_starts() {
        let err = Graph::from_value(json!({"nodes": [{"id": "c", "type": "Close"}]})).unwrap_err();
        assert!(matches!(err, GraphError::MissingStart));

        let err = Graph::from_value(json!({"nodes": [
            {"id": "a", "type": "Start", "trigger": "Webhook"},
            {"id": "b", "type": "Start", "trigger": "NewChat"}
        ]}))
        .unwrap_err();
        match err {
            GraphError::MultipleStarts(ids) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_dangling_edge_is_rejected() {
        let err = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "nowhere"}
        ]}))
        .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { ref to, .. } if to == "nowhere"));
    }

    #[test]
    fn test_duplicate_node_is_rejected() {
        let err = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook"},
            {"id": "s", "type": "Close"}
        ]}))
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(ref id) if id == "s"));
    }

    #[test]
    fn test_regex_patterns_are_compiled() {
        let ok = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "q"},
            {"id": "q", "type": "CollectInput", "text": "Code?", "variable": "code",
             "validation": "RegExp", "regexp": "^[0-9]{4}$"}
        ]}))
        .unwrap();
        assert!(ok.pattern("q").unwrap().is_match("1234"));

        let missing = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "q"},
            {"id": "q", "type": "CollectInput", "text": "Code?", "variable": "code", "validation": "Regex"}
        ]}))
        .unwrap_err();
        assert!(matches!(missing, GraphError::MissingPattern(_)));

        let invalid = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "q"},
            {"id": "q", "type": "CollectInput", "text": "Code?", "variable": "code",
             "validation": "Regex", "regexp": "(unclosed"}
        ]}))
        .unwrap_err();
        assert!(matches!(invalid, GraphError::InvalidPattern { .. }));
    }

    #[test]
    fn test_service_call_url_must_parse() {
        let err = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "api"},
            {"id": "api", "type": "ServiceCall", "url": "not a url", "headers": {}}
        ]}))
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidUrl { .. }));
    }

    #[test]
    fn test_cycle_without_waiting_node_is_rejected() {
        let err = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "b"},
            {"id": "b", "type": "Branch", "branches": [], "default": "m"},
            {"id": "m", "type": "SendMessage", "text": "again", "next": "b"}
        ]}))
        .unwrap_err();
        match err {
            GraphError::UnboundedCycle(ids) => assert_eq!(ids, vec!["b", "m"]),
            other => panic!("unexpected error {other}"),
        }

        // the same loop through a question is fine
        Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "b"},
            {"id": "b", "type": "Branch", "branches": [], "default": "q"},
            {"id": "q", "type": "CollectInput", "text": "again?", "variable": "v",
             "validation": "String", "next": "b"}
        ]}))
        .unwrap();
    }

    #[test]
    fn test_self_loop_is_rejected() {
        let err = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": "Webhook", "next": "b"},
            {"id": "b", "type": "Branch", "branches": [], "default": "b"}
        ]}))
        .unwrap_err();
        assert!(matches!(err, GraphError::UnboundedCycle(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        fs::write(&path, linear().to_string()).unwrap();
        assert_eq!(Graph::load(&path).unwrap().len(), 4);

        let err = Graph::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, GraphError::Io { .. }));
    }
}
