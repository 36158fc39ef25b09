//! Execution plan validation. Run this before registering a chain or
//! creating an enhancement job.
//!
//! Rules enforced:
//! 1. The chain must be named and every node must name its engine.
//! 2. Engine names must be unique within the plan.
//! 3. Every `depends_on` entry must reference a node of the plan.
//! 4. The dependency graph must be acyclic (topological sort must succeed).
//!
//! Returns the engine names in a deterministic topological order on success.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{ExecutionPlan, PlanError};

/// Validate the plan's DAG and return engine names in execution order.
///
/// Ties are broken alphabetically so the order is stable across runs.
///
/// # Errors
/// - [`PlanError::EmptyChainName`] / [`PlanError::EmptyEngineName`] for unnamed parts.
/// - [`PlanError::DuplicateEngine`] if two nodes invoke the same engine.
/// - [`PlanError::UnknownDependency`] if a dependency references a missing node.
/// - [`PlanError::CycleDetected`] if the graph is not acyclic.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<Vec<String>, PlanError> {
    if plan.chain.trim().is_empty() {
        return Err(PlanError::EmptyChainName);
    }

    // -----------------------------------------------------------------------
    // 1./2. Engine names present and unique
    // -----------------------------------------------------------------------
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for (idx, node) in plan.nodes.iter().enumerate() {
        if node.engine.trim().is_empty() {
            return Err(PlanError::EmptyEngineName(idx));
        }
        if !seen.insert(node.engine.as_str()) {
            return Err(PlanError::DuplicateEngine(node.engine.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 3. Validate dependency endpoints
    // -----------------------------------------------------------------------
    for node in &plan.nodes {
        if let Some(dep) = node.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
            return Err(PlanError::UnknownDependency {
                engine: node.engine.clone(),
                dependency: dep.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // 4. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    // Edges run from a dependency to its dependents.
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

    for node in &plan.nodes {
        dependents.entry(node.engine.as_str()).or_default();
        in_degree.insert(node.engine.as_str(), node.depends_on.len());
        for dep in &node.depends_on {
            dependents.entry(dep.as_str()).or_default().push(node.engine.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(plan.nodes.len());

    while let Some(engine) = queue.pop_front() {
        sorted.push(engine.to_owned());

        let mut released: Vec<&str> = Vec::new();
        if let Some(next) = dependents.get(engine) {
            for &dependent in next {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        released.push(dependent);
                    }
                }
            }
        }
        released.sort_unstable();
        queue.extend(released);
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != plan.nodes.len() {
        return Err(PlanError::CycleDetected(plan.chain.clone()));
    }

    Ok(sorted)
}
