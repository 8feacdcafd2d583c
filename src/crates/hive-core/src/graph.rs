//! The immutable graph specification: nodes, edges, entry points.
//!
//! A [`Graph`] is pure data: an ordered set of [`NodeSpec`], a flat list of
//! [`EdgeSpec`], one entry node, and named [`EntryPointSpec`] triggers.
//! Graphs legitimately contain cycles (retry loops); the executor is
//! cycle-oblivious and bounds iteration through per-node visit caps.
//! Back-edge classification ([`Graph::back_edges`]) exists for visualization
//! only.
//!
//! Structural problems are rejected at load time by [`Graph::validate`],
//! before any execution starts: empty graphs, unknown entry nodes, edges to
//! missing nodes, duplicate ids, and `always`/`on_success` cycles that have
//! neither a visit cap nor an exit.
//!
//! The [`Condition`] predicate language is shared between `conditional`
//! edges and judge rules: key checks against shared state, regex matching
//! over the evaluated text, and `all`/`any`/`not` combinators.

use crate::error::{EngineError, Result};
use crate::state::ScopedState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

/// Boolean predicate over shared state and a text under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The state key is set (and visible to the evaluating execution).
    KeyExists { key: String },
    /// The state key equals the given value.
    KeyEquals { key: String, value: Value },
    /// The evaluated text matches the regex pattern.
    TextMatches { pattern: String },
    /// Every sub-condition holds.
    All { all: Vec<Condition> },
    /// At least one sub-condition holds.
    Any { any: Vec<Condition> },
    /// No sub-condition holds.
    Not { not: Vec<Condition> },
}

/// What a [`Condition`] is evaluated against.
pub struct ConditionContext<'a> {
    pub state: &'a ScopedState,
    /// Text under evaluation: the node's latest assistant output for judge
    /// rules, empty for edge predicates unless the caller supplies one.
    pub text: &'a str,
}

impl Condition {
    /// Evaluate against the given context.
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> Result<bool> {
        match self {
            Condition::KeyExists { key } => Ok(ctx.state.get(key).is_some()),
            Condition::KeyEquals { key, value } => {
                Ok(ctx.state.get(key).as_ref() == Some(value))
            }
            Condition::TextMatches { pattern } => {
                let regex = regex::Regex::new(pattern)
                    .map_err(|e| EngineError::Config(format!("invalid pattern '{pattern}': {e}")))?;
                Ok(regex.is_match(ctx.text))
            }
            Condition::All { all } => {
                for condition in all {
                    if !condition.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any { any } => {
                for condition in any {
                    if condition.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { not } => {
                for condition in not {
                    if condition.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// How a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Bounded multi-turn LLM + tool loop with judge gating.
    #[default]
    EventLoop,
    /// Synchronous registered function.
    Function,
}

/// One declared output key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputKeySpec {
    pub key: String,
    /// Nullable keys may be left unset at node completion.
    #[serde(default)]
    pub nullable: bool,
}

impl OutputKeySpec {
    pub fn required(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            nullable: false,
        }
    }

    pub fn nullable(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            nullable: true,
        }
    }
}

/// Specification of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    /// Shared-state keys assembled into the prompt.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys the node must (or may, when nullable) produce.
    #[serde(default)]
    pub output_keys: Vec<OutputKeySpec>,
    /// Permitted tool names.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Node-level retry budget: failed nodes re-enter from scratch.
    #[serde(default)]
    pub max_retries: u32,
    /// Visit cap across the whole execution (0 = unbounded).
    #[serde(default)]
    pub max_node_visits: u32,
    /// Iteration budget for the event loop (0 = unbounded).
    #[serde(default)]
    pub max_iterations: u32,
    /// Judge success criteria, advertised to the LLM judge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Client-facing nodes stream `client_output_delta` and may block on
    /// injected input.
    #[serde(default)]
    pub client_facing: bool,
}

impl NodeSpec {
    /// An event-loop node with defaults.
    pub fn event_loop(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::EventLoop,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            tools: Vec::new(),
            max_retries: 0,
            max_node_visits: 0,
            max_iterations: 0,
            success_criteria: None,
            system_prompt: None,
            client_facing: false,
        }
    }

    /// A function node.
    pub fn function(id: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Function,
            ..Self::event_loop(id)
        }
    }

    pub fn with_input_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_keys(mut self, keys: Vec<OutputKeySpec>) -> Self {
        self.output_keys = keys;
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_node_visits(mut self, visits: u32) -> Self {
        self.max_node_visits = visits;
        self
    }

    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn client_facing(mut self) -> Self {
        self.client_facing = true;
        self
    }
}

/// When an edge fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Matches unconditionally.
    Always,
    /// Matches iff the node succeeded.
    OnSuccess,
    /// Matches iff the node failed.
    OnFailure,
    /// Matches iff the predicate holds over shared state.
    Conditional { condition: Condition },
    /// Target choice deferred to an LLM; matches iff the picked target
    /// equals this edge's target.
    Router,
}

impl EdgeCondition {
    /// Wire name used in `edge_traversed` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeCondition::Always => "always",
            EdgeCondition::OnSuccess => "on_success",
            EdgeCondition::OnFailure => "on_failure",
            EdgeCondition::Conditional { .. } => "conditional",
            EdgeCondition::Router => "router",
        }
    }
}

/// One directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    pub condition: EdgeCondition,
    /// Evaluation order: ascending priority, declaration order on ties.
    #[serde(default)]
    pub priority: i32,
}

impl EdgeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Trigger source for an entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Webhook,
    Timer { schedule: String },
    Event,
}

/// A named trigger bound to a specific entry node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPointSpec {
    pub id: String,
    pub trigger: TriggerSource,
    pub target_node: String,
}

impl EntryPointSpec {
    pub fn manual(id: impl Into<String>, target_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: TriggerSource::Manual,
            target_node: target_node.into(),
        }
    }
}

/// An immutable graph specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    pub entry_node: String,
    #[serde(default)]
    pub entry_points: Vec<EntryPointSpec>,
}

impl Graph {
    pub fn new(id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_node: entry_node.into(),
            entry_points: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_entry_point(mut self, entry_point: EntryPointSpec) -> Self {
        self.entry_points.push(entry_point);
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up an entry point by id.
    pub fn entry_point(&self, id: &str) -> Option<&EntryPointSpec> {
        self.entry_points.iter().find(|e| e.id == id)
    }

    /// Outgoing edges of `node`, sorted by ascending priority with
    /// declaration order breaking ties.
    pub fn outgoing_edges(&self, node: &str) -> Vec<&EdgeSpec> {
        let mut edges: Vec<&EdgeSpec> = self.edges.iter().filter(|e| e.source == node).collect();
        edges.sort_by_key(|e| e.priority); // stable sort keeps declaration order
        edges
    }

    /// Validate the graph structure. Called at load time, before any
    /// execution starts.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::Config(format!(
                "graph '{}' has no nodes",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "graph '{}' has duplicate node id '{}'",
                    self.id, node.id
                )));
            }
        }

        if !ids.contains(self.entry_node.as_str()) {
            return Err(EngineError::Config(format!(
                "graph '{}' entry node '{}' does not exist",
                self.id, self.entry_node
            )));
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(EngineError::Config(format!(
                        "graph '{}' edge {} -> {} references unknown node '{}'",
                        self.id, edge.source, edge.target, endpoint
                    )));
                }
            }
        }

        for entry_point in &self.entry_points {
            if !ids.contains(entry_point.target_node.as_str()) {
                return Err(EngineError::Config(format!(
                    "graph '{}' entry point '{}' targets unknown node '{}'",
                    self.id, entry_point.id, entry_point.target_node
                )));
            }
        }

        self.check_unbounded_cycles()?;
        Ok(())
    }

    /// Reject `always`/`on_success` cycles where no node carries a visit cap
    /// and no edge leaves the cycle: such a cycle can never terminate.
    fn check_unbounded_cycles(&self) -> Result<()> {
        let progress_edges: Vec<&EdgeSpec> = self
            .edges
            .iter()
            .filter(|e| matches!(e.condition, EdgeCondition::Always | EdgeCondition::OnSuccess))
            .collect();

        for component in strongly_connected_components(&self.nodes, &progress_edges) {
            let is_cycle = component.len() > 1
                || progress_edges
                    .iter()
                    .any(|e| e.source == e.target && component.contains(&e.source));
            if !is_cycle {
                continue;
            }

            let capped = component
                .iter()
                .any(|id| self.node(id).map(|n| n.max_node_visits > 0).unwrap_or(false));
            let has_exit = self
                .edges
                .iter()
                .any(|e| component.contains(&e.source) && !component.contains(&e.target));
            if !capped && !has_exit {
                let mut members: Vec<&String> = component.iter().collect();
                members.sort();
                return Err(EngineError::Config(format!(
                    "graph '{}' has an unbounded cycle with no exit: {:?}",
                    self.id, members
                )));
            }
        }
        Ok(())
    }

    /// Edges that, in a BFS from the entry node, point to an already-visited
    /// node. Informational only; the executor treats them like any edge.
    pub fn back_edges(&self) -> HashSet<(String, String)> {
        let mut visited = HashSet::new();
        let mut back = HashSet::new();
        let mut queue = VecDeque::new();

        visited.insert(self.entry_node.clone());
        queue.push_back(self.entry_node.clone());

        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing_edges(&current) {
                if visited.contains(&edge.target) {
                    back.insert((edge.source.clone(), edge.target.clone()));
                } else {
                    visited.insert(edge.target.clone());
                    queue.push_back(edge.target.clone());
                }
            }
        }
        back
    }

    /// The nearest node reachable from every one of `starts` (each start
    /// counts as reachable from itself): the join point for parallel
    /// branches. "Nearest" is BFS distance from the first start;
    /// lexicographic order breaks ties deterministically.
    pub fn nearest_common_descendant(&self, starts: &[&str]) -> Option<String> {
        let mut common: Option<HashSet<String>> = None;
        for start in starts {
            let reachable = self.reachable_from(start);
            common = Some(match common {
                None => reachable,
                Some(acc) => acc.intersection(&reachable).cloned().collect(),
            });
        }
        let common = common?;
        if common.is_empty() {
            return None;
        }

        // BFS from the first start; first common node wins, ties broken by
        // sorting each frontier.
        let first = starts.first()?;
        let mut visited = HashSet::new();
        let mut frontier = vec![first.to_string()];
        visited.insert(first.to_string());
        while !frontier.is_empty() {
            frontier.sort();
            for node in &frontier {
                if common.contains(node) {
                    return Some(node.clone());
                }
            }
            let mut next = Vec::new();
            for node in &frontier {
                for edge in self.outgoing_edges(node) {
                    if visited.insert(edge.target.clone()) {
                        next.push(edge.target.clone());
                    }
                }
            }
            frontier = next;
        }
        None
    }

    fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.to_string());
        queue.push_back(start.to_string());
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing_edges(&current) {
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        visited
    }
}

/// Tarjan's strongly connected components over the given edge subset.
fn strongly_connected_components(
    nodes: &[NodeSpec],
    edges: &[&EdgeSpec],
) -> Vec<HashSet<String>> {
    struct Tarjan<'a> {
        adjacency: &'a HashMap<&'a str, Vec<&'a str>>,
        index: HashMap<String, usize>,
        lowlink: HashMap<String, usize>,
        on_stack: HashSet<String>,
        stack: Vec<String>,
        next_index: usize,
        components: Vec<HashSet<String>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, v: &str) {
            self.index.insert(v.to_string(), self.next_index);
            self.lowlink.insert(v.to_string(), self.next_index);
            self.next_index += 1;
            self.stack.push(v.to_string());
            self.on_stack.insert(v.to_string());

            let adjacency: &'a HashMap<&'a str, Vec<&'a str>> = self.adjacency;
            if let Some(neighbors) = adjacency.get(v) {
                for &w in neighbors {
                    if !self.index.contains_key(w) {
                        self.visit(w);
                        let low = self.lowlink[w].min(self.lowlink[v]);
                        self.lowlink.insert(v.to_string(), low);
                    } else if self.on_stack.contains(w) {
                        let low = self.index[w].min(self.lowlink[v]);
                        self.lowlink.insert(v.to_string(), low);
                    }
                }
            }

            if self.lowlink[v] == self.index[v] {
                let mut component = HashSet::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    let done = w == v;
                    component.insert(w);
                    if done {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut tarjan = Tarjan {
        adjacency: &adjacency,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };
    for node in nodes {
        if !tarjan.index.contains_key(node.id.as_str()) {
            tarjan.visit(&node.id);
        }
    }
    tarjan.components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{IsolationPolicy, SharedState};
    use serde_json::json;

    fn linear_graph() -> Graph {
        Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("b"))
            .with_node(NodeSpec::event_loop("c"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::OnSuccess))
            .with_edge(EdgeSpec::new("b", "c", EdgeCondition::OnSuccess))
    }

    #[test]
    fn test_validate_accepts_linear_graph() {
        linear_graph().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_graph() {
        let err = Graph::new("g", "a").validate().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_missing_entry_node() {
        let graph = Graph::new("g", "missing").with_node(NodeSpec::event_loop("a"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_edge_target() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_edge(EdgeSpec::new("a", "ghost", EdgeCondition::Always));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_node_ids() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("a"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_success_cycle() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("b"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::OnSuccess))
            .with_edge(EdgeSpec::new("b", "a", EdgeCondition::OnSuccess));
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_accepts_capped_cycle() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a").with_max_node_visits(3))
            .with_node(NodeSpec::event_loop("b"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::OnSuccess))
            .with_edge(EdgeSpec::new("b", "a", EdgeCondition::OnSuccess));
        graph.validate().unwrap();
    }

    #[test]
    fn test_validate_accepts_cycle_with_exit() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("b"))
            .with_node(NodeSpec::event_loop("out"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::OnSuccess))
            .with_edge(EdgeSpec::new("b", "a", EdgeCondition::OnSuccess))
            .with_edge(
                EdgeSpec::new(
                    "b",
                    "out",
                    EdgeCondition::Conditional {
                        condition: Condition::KeyExists {
                            key: "done".to_string(),
                        },
                    },
                )
                .with_priority(-1),
            );
        graph.validate().unwrap();
    }

    #[test]
    fn test_outgoing_edges_ordering() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("b"))
            .with_node(NodeSpec::event_loop("c"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::Always).with_priority(5))
            .with_edge(EdgeSpec::new("a", "c", EdgeCondition::Always).with_priority(1))
            .with_edge(EdgeSpec::new("a", "a", EdgeCondition::OnFailure).with_priority(1));

        let targets: Vec<&str> = graph
            .outgoing_edges("a")
            .iter()
            .map(|e| e.target.as_str())
            .collect();
        // Priority 1 edges first, in declaration order, then priority 5.
        assert_eq!(targets, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_back_edge_classification() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a").with_max_node_visits(2))
            .with_node(NodeSpec::event_loop("b"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::OnSuccess))
            .with_edge(EdgeSpec::new("b", "a", EdgeCondition::OnFailure));

        let back = graph.back_edges();
        assert!(back.contains(&("b".to_string(), "a".to_string())));
        assert!(!back.contains(&("a".to_string(), "b".to_string())));
    }

    #[test]
    fn test_nearest_common_descendant_diamond() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("b"))
            .with_node(NodeSpec::event_loop("c"))
            .with_node(NodeSpec::event_loop("join"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::Always))
            .with_edge(EdgeSpec::new("a", "c", EdgeCondition::Always))
            .with_edge(EdgeSpec::new("b", "join", EdgeCondition::OnSuccess))
            .with_edge(EdgeSpec::new("c", "join", EdgeCondition::OnSuccess));

        assert_eq!(
            graph.nearest_common_descendant(&["b", "c"]),
            Some("join".to_string())
        );
    }

    #[test]
    fn test_nearest_common_descendant_none() {
        let graph = Graph::new("g", "a")
            .with_node(NodeSpec::event_loop("a"))
            .with_node(NodeSpec::event_loop("b"))
            .with_node(NodeSpec::event_loop("c"))
            .with_edge(EdgeSpec::new("a", "b", EdgeCondition::Always))
            .with_edge(EdgeSpec::new("a", "c", EdgeCondition::Always));

        assert_eq!(graph.nearest_common_descendant(&["b", "c"]), None);
    }

    #[test]
    fn test_condition_evaluation() {
        let state = SharedState::new(IsolationPolicy::Shared);
        state.set("status", json!("ready"));
        let scoped = state.scoped("e1");
        let ctx = ConditionContext {
            state: &scoped,
            text: "all done here",
        };

        assert!(Condition::KeyExists {
            key: "status".to_string()
        }
        .evaluate(&ctx)
        .unwrap());
        assert!(Condition::KeyEquals {
            key: "status".to_string(),
            value: json!("ready")
        }
        .evaluate(&ctx)
        .unwrap());
        assert!(Condition::TextMatches {
            pattern: r"\bdone\b".to_string()
        }
        .evaluate(&ctx)
        .unwrap());

        let combined = Condition::All {
            all: vec![
                Condition::KeyExists {
                    key: "status".to_string(),
                },
                Condition::Not {
                    not: vec![Condition::KeyExists {
                        key: "error".to_string(),
                    }],
                },
            ],
        };
        assert!(combined.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_condition_bad_regex_is_config_error() {
        let state = SharedState::new(IsolationPolicy::Shared);
        let scoped = state.scoped("e1");
        let ctx = ConditionContext {
            state: &scoped,
            text: "",
        };
        let err = Condition::TextMatches {
            pattern: "([".to_string(),
        }
        .evaluate(&ctx)
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_graph_serde_round_trip() {
        let graph = linear_graph().with_entry_point(EntryPointSpec::manual("start", "a"));
        let encoded = serde_json::to_string(&graph).unwrap();
        let decoded: Graph = serde_json::from_str(&encoded).unwrap();
        assert_eq!(graph, decoded);
    }
}
