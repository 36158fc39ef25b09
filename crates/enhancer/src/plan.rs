//! Execution plans: the DAG of engine invocations a chain compiles to.
//!
//! Nodes are identified by the name of the engine they invoke, so one engine
//! appears at most once per plan. Plans are immutable once built; use
//! [`crate::dag::validate_plan`] (or wrap it in a [`crate::Chain`]) before
//! handing one to the job manager.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ExecutionNode
// ---------------------------------------------------------------------------

/// One engine invocation within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionNode {
    /// Name of the engine to invoke; also the node's identity within the plan.
    pub engine: String,
    /// Failures of optional nodes do not fail the chain.
    #[serde(default)]
    pub optional: bool,
    /// Nodes that must be completed before this one may run.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl ExecutionNode {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            optional: false,
            depends_on: BTreeSet::new(),
        }
    }

    /// Builder-style: mark this node optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Builder-style: add dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

/// The execution plan of a named chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub chain: String,
    pub nodes: Vec<ExecutionNode>,
}

impl ExecutionPlan {
    pub fn new(chain: impl Into<String>, nodes: Vec<ExecutionNode>) -> Self {
        Self {
            chain: chain.into(),
            nodes,
        }
    }

    /// Look up a node by engine name.
    pub fn node(&self, engine: &str) -> Option<&ExecutionNode> {
        self.nodes.iter().find(|n| n.engine == engine)
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.node(engine).is_some()
    }

    /// Engine names in declaration order.
    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.engine.as_str())
    }

    /// All nodes that are not yet in `completed` but whose dependencies are.
    ///
    /// With an empty `completed` set this yields the nodes that start the
    /// execution. An empty result means there is nothing left to run.
    pub fn executable(&self, completed: &BTreeSet<String>) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|n| !completed.contains(&n.engine))
            .filter(|n| n.depends_on.iter().all(|d| completed.contains(d)))
            .map(|n| n.engine.clone())
            .collect()
    }

    /// Build a plan from engine ordering weights.
    ///
    /// Engines are grouped by `order`, higher values first. Every engine of a
    /// group depends on all engines of the previous group, so engines sharing
    /// an order may run in parallel. Engines listed in `optional` are flagged
    /// as such. Optional engines in `missing` are added without dependencies
    /// (the job manager will record them as failed-but-optional), required
    /// ones in `missing` become the first group.
    pub fn weighted(
        chain: impl Into<String>,
        engines: &[(String, i32)],
        optional: &HashSet<String>,
        missing: &[String],
    ) -> Self {
        let mut nodes = Vec::with_capacity(engines.len() + missing.len());

        let mut current: BTreeSet<String> = BTreeSet::new();
        for name in missing {
            let is_optional = optional.contains(name);
            let mut node = ExecutionNode::new(name.clone());
            node.optional = is_optional;
            if !is_optional {
                current.insert(name.clone());
            }
            nodes.push(node);
        }

        // BTreeMap sorts ascending; iterate in reverse for "highest first".
        let mut groups: BTreeMap<i32, Vec<&str>> = BTreeMap::new();
        for (name, order) in engines {
            groups.entry(*order).or_default().push(name.as_str());
        }

        for (_, group) in groups.into_iter().rev() {
            let prev = std::mem::take(&mut current);
            for name in group {
                let mut node = ExecutionNode::new(name).depends_on(prev.iter().cloned());
                node.optional = optional.contains(name);
                current.insert(name.to_owned());
                nodes.push(node);
            }
        }

        Self::new(chain, nodes)
    }
}
