//! Job model and dependency-graph analysis.
//!
//! A ComfyUI job (the `prompt` object) maps node ids to nodes. A node
//! input shaped as `[source_node_id, output_slot]` whose source names
//! another node of the same job is a dependency edge, never data.
//! [`analyze`] turns a [`Job`] into an immutable [`DependencyGraph`]
//! holding, per node, its dependencies, dependents and depth.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::NodeId;

/// Class type reported for nodes that do not declare one.
pub const UNKNOWN_CLASS_TYPE: &str = "unknown";

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

/// A single node of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// ComfyUI class type (e.g. "KSampler", "CLIPTextEncode").
    #[serde(default = "unknown_class_type")]
    pub class_type: String,
    /// Input values: literals or node references.
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Anything else the node carries (`_meta` titles and the like).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn unknown_class_type() -> String {
    UNKNOWN_CLASS_TYPE.to_string()
}

impl Node {
    /// Ids of the nodes this node's inputs reference, in input order.
    ///
    /// Only the shape is checked here; whether the target exists is
    /// decided by the owning job.
    pub fn referenced_nodes(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .values()
            .filter_map(|value| node_reference(value).map(|(id, _)| id))
    }
}

/// A submitted unit of work, keyed by node id.
pub type Job = IndexMap<NodeId, Node>;

/// Interpret an input value as a `(node_id, output_slot)` reference.
///
/// Returns `None` for anything that is not exactly a two-element array
/// of a string followed by a non-negative integer.
pub fn node_reference(value: &serde_json::Value) -> Option<(&str, u64)> {
    match value.as_array()?.as_slice() {
        [serde_json::Value::String(id), slot] => slot.as_u64().map(|slot| (id.as_str(), slot)),
        _ => None,
    }
}

/// Parse a job from raw JSON.
///
/// The job must be a non-empty object whose values are node objects.
/// A missing `class_type` is tolerated and reported as
/// [`UNKNOWN_CLASS_TYPE`].
pub fn parse_job(value: &serde_json::Value) -> Result<Job, CoreError> {
    let obj = value
        .as_object()
        .ok_or_else(|| CoreError::Validation("Job must be a JSON object".to_string()))?;

    if obj.is_empty() {
        return Err(CoreError::Validation(
            "Job must contain at least one node".to_string(),
        ));
    }

    let mut job = Job::with_capacity(obj.len());
    for (node_id, node_value) in obj {
        let node: Node = serde_json::from_value(node_value.clone()).map_err(|e| {
            CoreError::Validation(format!("Node '{node_id}' is not a valid node: {e}"))
        })?;
        job.insert(node_id.clone(), node);
    }

    Ok(job)
}

// ---------------------------------------------------------------------------
// Dependency graph
// ---------------------------------------------------------------------------

/// Dependency information for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeDependencies {
    /// Nodes whose outputs this node consumes.
    pub dependencies: BTreeSet<NodeId>,
    /// Nodes consuming this node's outputs.
    pub dependents: BTreeSet<NodeId>,
    /// Longest dependency chain from a dependency-free node.
    pub depth: usize,
}

/// Immutable dependency graph of one job submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyGraph {
    nodes: BTreeMap<NodeId, NodeDependencies>,
    max_depth: usize,
    /// Node count per depth, indexed by depth.
    level_sizes: Vec<usize>,
    /// Back edges `(node, dependency)` ignored while computing depth.
    cycles: Vec<(NodeId, NodeId)>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&NodeDependencies> {
        self.nodes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeDependencies)> {
        self.nodes.iter()
    }

    pub fn depth_of(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|n| n.depth)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Node count per depth level, index 0 being the dependency-free nodes.
    pub fn level_sizes(&self) -> &[usize] {
        &self.level_sizes
    }

    /// Number of nodes whose depth is strictly lower than `depth`.
    pub fn nodes_below_depth(&self, depth: usize) -> usize {
        self.level_sizes.iter().take(depth).sum()
    }

    /// Whether any node depends on another node.
    pub fn has_dependencies(&self) -> bool {
        self.nodes.values().any(|n| !n.dependencies.is_empty())
    }

    /// Back edges found during depth computation.
    pub fn cycles(&self) -> &[(NodeId, NodeId)] {
        &self.cycles
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// Build the dependency graph of a job.
///
/// Runs in O(V + E). Depths are computed by an iterative depth-first
/// traversal with three-color marking over nodes in sorted id order, so
/// the result does not depend on the job's key order. An edge into a
/// node that is still being visited closes a cycle: it is recorded in
/// [`DependencyGraph::cycles`] and does not contribute to the depth.
pub fn analyze(job: &Job) -> DependencyGraph {
    let mut nodes: BTreeMap<NodeId, NodeDependencies> = job
        .keys()
        .map(|id| (id.clone(), NodeDependencies::default()))
        .collect();

    for (id, node) in job {
        for target in node.referenced_nodes() {
            if !job.contains_key(target) {
                continue;
            }
            if let Some(entry) = nodes.get_mut(id) {
                entry.dependencies.insert(target.to_string());
            }
            if let Some(entry) = nodes.get_mut(target) {
                entry.dependents.insert(id.clone());
            }
        }
    }

    let (depths, cycles) = compute_depths(&nodes);

    let mut max_depth = 0;
    for (entry, depth) in nodes.values_mut().zip(depths) {
        entry.depth = depth;
        max_depth = max_depth.max(depth);
    }

    let mut level_sizes = if nodes.is_empty() {
        Vec::new()
    } else {
        vec![0; max_depth + 1]
    };
    for entry in nodes.values() {
        level_sizes[entry.depth] += 1;
    }

    DependencyGraph {
        nodes,
        max_depth,
        level_sizes,
        cycles,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth per node (in map order) plus the back edges encountered.
fn compute_depths(
    nodes: &BTreeMap<NodeId, NodeDependencies>,
) -> (Vec<usize>, Vec<(NodeId, NodeId)>) {
    let ids: Vec<&NodeId> = nodes.keys().collect();
    let index: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let deps: Vec<Vec<usize>> = nodes
        .values()
        .map(|n| {
            n.dependencies
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; ids.len()];
    let mut depths = vec![0usize; ids.len()];
    let mut cycles = Vec::new();

    for root in 0..ids.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::InProgress;
        // (node, index of the next dependency to visit)
        let mut stack = vec![(root, 0usize)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if let Some(&dep) = deps[node].get(frame.1) {
                frame.1 += 1;
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::InProgress;
                        stack.push((dep, 0));
                    }
                    Mark::InProgress => {
                        cycles.push((ids[node].clone(), ids[dep].clone()));
                    }
                    Mark::Done => {}
                }
            } else {
                // Dependencies still in progress are back edges.
                depths[node] = deps[node]
                    .iter()
                    .filter(|&&d| marks[d] == Mark::Done)
                    .map(|&d| depths[d] + 1)
                    .max()
                    .unwrap_or(0);
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }

    (depths, cycles)
}

// ---------------------------------------------------------------------------
// Structure summary
// ---------------------------------------------------------------------------

/// Structural metadata sent to the client before progress starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStructure {
    pub total_nodes: usize,
    pub has_dependencies: bool,
    /// Node count per class type.
    pub node_types: BTreeMap<String, usize>,
    pub max_depth: usize,
}

impl JobStructure {
    pub fn describe(job: &Job, graph: &DependencyGraph) -> Self {
        let mut node_types = BTreeMap::new();
        for node in job.values() {
            *node_types.entry(node.class_type.clone()).or_insert(0) += 1;
        }

        Self {
            total_nodes: job.len(),
            has_dependencies: graph.has_dependencies(),
            node_types,
            max_depth: graph.max_depth(),
        }
    }
}
