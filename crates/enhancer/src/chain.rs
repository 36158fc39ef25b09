//! Chains: named, configured execution plans.
//!
//! Three flavours can be declared in JSON (tagged by `type`):
//!
//! ```json
//! { "type": "list",     "name": "basic",  "engines": ["langid", "ner;optional"] }
//! { "type": "weighted", "name": "auto",   "engines": [{ "name": "ner", "order": 10 }] }
//! { "type": "graph",    "name": "custom", "engines": ["langid", "ner;dependsOn=langid"] }
//! ```
//!
//! All of them compile to a validated [`ExecutionPlan`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{ExecutionNode, ExecutionPlan, PlanError};

// ---------------------------------------------------------------------------
// ChainDefinition
// ---------------------------------------------------------------------------

/// An engine entry of a weighted chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedEngine {
    pub name: String,
    /// Higher orders run first.
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub optional: bool,
}

/// Declarative chain configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainDefinition {
    /// Engines run strictly one after another, in the listed order.
    List { name: String, engines: Vec<String> },
    /// Engines are grouped by ordering weight; see [`ExecutionPlan::weighted`].
    Weighted { name: String, engines: Vec<WeightedEngine> },
    /// Explicit dependency graph, one `engine[;optional][;dependsOn=a,b]` line per node.
    Graph { name: String, engines: Vec<String> },
}

impl ChainDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::List { name, .. } | Self::Weighted { name, .. } | Self::Graph { name, .. } => name,
        }
    }

    /// Compile into a validated execution plan, assuming every engine is
    /// available.
    pub fn execution_plan(&self) -> Result<ExecutionPlan, PlanError> {
        self.execution_plan_for(|_| true)
    }

    /// Compile against the engines currently available.
    ///
    /// Weighted chains hand engines for which `is_active` is false to
    /// [`ExecutionPlan::weighted`] as missing, so they no longer hold up the
    /// ordering groups. List and graph chains keep every engine in place.
    pub fn execution_plan_for(&self, is_active: impl Fn(&str) -> bool) -> Result<ExecutionPlan, PlanError> {
        let name = self.name();
        let plan = match self {
            Self::List { engines, .. } => {
                let mut nodes: Vec<ExecutionNode> = Vec::with_capacity(engines.len());
                for line in engines {
                    let entry = parse_config_line(line)?;
                    if !entry.depends_on.is_empty() {
                        return Err(PlanError::InvalidConfigLine {
                            line: line.clone(),
                            reason: "list chains do not support 'dependsOn'".into(),
                        });
                    }
                    let mut node = ExecutionNode::new(entry.engine);
                    node.optional = entry.optional;
                    if let Some(prev) = nodes.last() {
                        node.depends_on.insert(prev.engine.clone());
                    }
                    nodes.push(node);
                }
                ExecutionPlan::new(name, nodes)
            }
            Self::Weighted { engines, .. } => {
                let (active, missing): (Vec<&WeightedEngine>, Vec<&WeightedEngine>) =
                    engines.iter().partition(|e| is_active(&e.name));
                let weights: Vec<(String, i32)> =
                    active.iter().map(|e| (e.name.clone(), e.order)).collect();
                let missing: Vec<String> = missing.iter().map(|e| e.name.clone()).collect();
                let optional: HashSet<String> = engines
                    .iter()
                    .filter(|e| e.optional)
                    .map(|e| e.name.clone())
                    .collect();
                ExecutionPlan::weighted(name, &weights, &optional, &missing)
            }
            Self::Graph { engines, .. } => {
                let nodes = engines
                    .iter()
                    .map(|line| parse_config_line(line).map(ConfigEntry::into_node))
                    .collect::<Result<Vec<_>, _>>()?;
                ExecutionPlan::new(name, nodes)
            }
        };

        if plan.nodes.is_empty() {
            return Err(PlanError::NoEngines(name.to_owned()));
        }
        crate::dag::validate_plan(&plan)?;
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Config line parsing
// ---------------------------------------------------------------------------

/// One parsed `engine;optional;dependsOn=a,b` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub engine: String,
    pub optional: bool,
    pub depends_on: Vec<String>,
}

impl ConfigEntry {
    fn into_node(self) -> ExecutionNode {
        let mut node = ExecutionNode::new(self.engine).depends_on(self.depends_on);
        node.optional = self.optional;
        node
    }
}

/// Parse a single chain configuration line.
///
/// The first `;`-separated segment is the engine name. Each further segment
/// is a parameter, either a bare flag (`optional`) or `key=v1,v2`. Unknown
/// parameters are ignored so engine-specific properties can travel along.
/// `optional=false` switches the flag off explicitly.
pub fn parse_config_line(line: &str) -> Result<ConfigEntry, PlanError> {
    let mut parts = line.split(';').map(str::trim);
    let engine = parts.next().unwrap_or_default();
    if engine.is_empty() {
        return Err(PlanError::InvalidConfigLine {
            line: line.to_owned(),
            reason: "missing engine name".into(),
        });
    }

    let mut params: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for part in parts.filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((key, values)) => {
                let values = values.split(',').map(str::trim).filter(|v| !v.is_empty());
                params.entry(key.trim()).or_default().extend(values);
            }
            None => {
                params.entry(part).or_default();
            }
        }
    }

    let optional = match params.get("optional") {
        None => false,
        Some(values) => match values.first() {
            None => true,
            Some(v) => v.parse::<bool>().map_err(|_| PlanError::InvalidConfigLine {
                line: line.to_owned(),
                reason: format!("'optional' expects true or false, got '{v}'"),
            })?,
        },
    };

    let depends_on = params
        .get("dependsOn")
        .map(|deps| deps.iter().map(|d| d.to_string()).collect())
        .unwrap_or_default();

    Ok(ConfigEntry {
        engine: engine.to_owned(),
        optional,
        depends_on,
    })
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// A named chain with its compiled, validated execution plan.
#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    plan: Arc<ExecutionPlan>,
}

impl Chain {
    /// Wrap an already built plan; validates it first.
    pub fn new(plan: ExecutionPlan) -> Result<Self, PlanError> {
        crate::dag::validate_plan(&plan)?;
        Ok(Self {
            name: plan.chain.clone(),
            plan: Arc::new(plan),
        })
    }

    pub fn from_definition(definition: &ChainDefinition) -> Result<Self, PlanError> {
        Self::new(definition.execution_plan()?)
    }

    /// See [`ChainDefinition::execution_plan_for`].
    pub fn from_definition_for(
        definition: &ChainDefinition,
        is_active: impl Fn(&str) -> bool,
    ) -> Result<Self, PlanError> {
        Self::new(definition.execution_plan_for(is_active)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execution_plan(&self) -> Arc<ExecutionPlan> {
        Arc::clone(&self.plan)
    }
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.plan == other.plan
    }
}
