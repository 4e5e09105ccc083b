//! Overall-completion estimation for a running job.
//!
//! The engine only reports step progress (`value` of `max`) for the node
//! currently executing, plus which node it moved on to. The
//! [`ProgressEstimator`] folds those events into a [`ProgressState`] and
//! derives one ratio in `[0, 1]` for the whole job.
//!
//! Two policies exist:
//!
//! * [`EstimationPolicy::IndependentNodes`] for jobs without any
//!   dependency edge: completed nodes plus the in-flight fraction, over
//!   the node count.
//! * [`EstimationPolicy::DepthAware`] for everything else: a budget of one
//!   unit per node is consumed level by level in depth order. The consumed
//!   amount is the completed nodes plus the in-flight fraction, raised to
//!   the number of nodes lying at lower depths than the executing node
//!   (the engine runs dependencies first, and cached nodes never report
//!   progress).
//!
//! The reported ratio is a high-water mark: it never decreases and it is
//! `1.0` exactly when every node is complete.

use serde::Serialize;

use crate::workflow_graph::DependencyGraph;

/// Which formula turns a [`ProgressState`] into a ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationPolicy {
    IndependentNodes,
    DepthAware,
}

/// Engine-side facts that move progress forward.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Step progress of the executing node.
    Step { value: f64, max: f64 },
    /// The engine started executing this node.
    NodeStarted(String),
    /// The engine reported the whole job done.
    Finished,
}

/// Per-session progress counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressState {
    pub total_nodes: usize,
    /// Nodes the engine has signalled as fully processed.
    pub completed_nodes: usize,
    pub current_node_progress: f64,
    pub current_node_max: f64,
    /// Node the engine last reported as executing.
    pub current_node: Option<String>,
    /// Highest ratio reported so far.
    pub overall_ratio: f64,
    /// Depth levels fully covered by the last depth-aware estimate.
    pub completed_levels: usize,
}

impl ProgressState {
    pub fn new(total_nodes: usize) -> Self {
        Self {
            total_nodes,
            completed_nodes: 0,
            current_node_progress: 0.0,
            current_node_max: 1.0,
            current_node: None,
            overall_ratio: 0.0,
            completed_levels: 0,
        }
    }

    /// Completion of the executing node, in `[0, 1]`.
    pub fn current_fraction(&self) -> f64 {
        if self.current_node_max > 0.0 {
            (self.current_node_progress / self.current_node_max).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Overall ratio as a whole percentage.
    pub fn percent(&self) -> u8 {
        (self.overall_ratio * 100.0).round() as u8
    }

    pub fn is_complete(&self) -> bool {
        self.completed_nodes >= self.total_nodes
    }
}

/// Result of walking the node budget over depth levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetEstimate {
    /// Nodes whose whole budget unit has been consumed.
    pub complete_nodes: usize,
    /// Consumed share of the next node's unit, in `[0, 1)`.
    pub partial: f64,
    /// Depth levels whose nodes are all complete.
    pub completed_levels: usize,
}

/// Folds engine events into an overall completion ratio for one job.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    graph: DependencyGraph,
    policy: EstimationPolicy,
}

impl ProgressEstimator {
    /// Pick the policy from the graph: depth-aware as soon as one node
    /// depends on another.
    pub fn new(graph: DependencyGraph) -> Self {
        let policy = if graph.has_dependencies() {
            EstimationPolicy::DepthAware
        } else {
            EstimationPolicy::IndependentNodes
        };
        Self::with_policy(graph, policy)
    }

    pub fn with_policy(graph: DependencyGraph, policy: EstimationPolicy) -> Self {
        Self { graph, policy }
    }

    pub fn policy(&self) -> EstimationPolicy {
        self.policy
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Fresh state sized to this job.
    pub fn initial_state(&self) -> ProgressState {
        ProgressState::new(self.graph.len())
    }

    /// Apply one event and return the (non-decreasing) overall ratio.
    pub fn update(&self, state: &mut ProgressState, event: &ProgressEvent) -> f64 {
        match event {
            ProgressEvent::Step { value, max } => {
                if *max > 0.0 && value >= max {
                    state.completed_nodes = (state.completed_nodes + 1).min(state.total_nodes);
                    // The finished node now lives in `completed_nodes`.
                    state.current_node_progress = 0.0;
                } else {
                    state.current_node_progress = *value;
                }
                state.current_node_max = *max;
            }
            ProgressEvent::NodeStarted(node) => {
                state.current_node = Some(node.clone());
                state.current_node_progress = 0.0;
                state.current_node_max = 1.0;
            }
            ProgressEvent::Finished => {
                state.completed_nodes = state.total_nodes;
                state.current_node = None;
                state.current_node_progress = 0.0;
                state.current_node_max = 1.0;
                state.completed_levels = self.graph.level_sizes().len();
                state.overall_ratio = 1.0;
                return state.overall_ratio;
            }
        }

        if state.total_nodes == 0 {
            return state.overall_ratio;
        }

        let estimate = match self.policy {
            EstimationPolicy::IndependentNodes => self.independent_ratio(state),
            EstimationPolicy::DepthAware => {
                let budget = self.budget_estimate(state);
                state.completed_levels = state.completed_levels.max(budget.completed_levels);
                ((budget.complete_nodes as f64 + budget.partial) / state.total_nodes as f64).min(1.0)
            }
        };

        state.overall_ratio = state.overall_ratio.max(estimate);
        state.overall_ratio
    }

    /// Completed nodes plus the in-flight fraction, over the node count.
    pub fn independent_ratio(&self, state: &ProgressState) -> f64 {
        if state.total_nodes == 0 {
            return 0.0;
        }
        let total = state.total_nodes as f64;
        (state.completed_nodes as f64 / total + state.current_fraction() / total).min(1.0)
    }

    /// Walk one budget unit per node over depth levels 0..=max_depth.
    pub fn budget_estimate(&self, state: &ProgressState) -> BudgetEstimate {
        let total = state.total_nodes as f64;
        let fraction = state.current_fraction();

        let mut consumed = state.completed_nodes as f64 + fraction;
        if let Some(depth) = state
            .current_node
            .as_deref()
            .and_then(|node| self.graph.depth_of(node))
        {
            let floor = self.graph.nodes_below_depth(depth) as f64 + fraction;
            consumed = consumed.max(floor);
        }
        let consumed = consumed.min(total);

        let mut complete_nodes = 0usize;
        let mut completed_levels = 0usize;
        'levels: for &size in self.graph.level_sizes() {
            for _ in 0..size {
                if (complete_nodes + 1) as f64 > consumed {
                    break 'levels;
                }
                complete_nodes += 1;
            }
            completed_levels += 1;
        }

        BudgetEstimate {
            complete_nodes,
            partial: (consumed - complete_nodes as f64).clamp(0.0, 1.0),
            completed_levels,
        }
    }
}
