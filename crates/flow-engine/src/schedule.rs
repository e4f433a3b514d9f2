//! Step dispatch ordering.
//!
//! Steps always run one at a time. The schedule only decides which step
//! comes next: declaration order, or a topological order over the declared
//! dependencies with ties broken by declaration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::error::{EngineError, EngineResult};
use crate::flow::{ExecutionOrder, FlowDefinition};

/// Dependency graph over a flow's steps, addressed by declaration index.
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// For each step, the steps that consume its output.
    dependents: Vec<Vec<usize>>,
    /// For each step, the steps it consumes.
    dependencies: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Build the graph. Unknown dependency ids are a flow error.
    pub fn build(flow: &FlowDefinition) -> EngineResult<Self> {
        let index: HashMap<&str, usize> = flow
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut dependents = vec![Vec::new(); flow.steps.len()];
        let mut dependencies = vec![Vec::new(); flow.steps.len()];

        for (i, step) in flow.steps.iter().enumerate() {
            for dep in &step.dependencies {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    EngineError::InvalidFlow(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        Ok(Self {
            dependents,
            dependencies,
        })
    }

    /// Indices of the steps `index` depends on.
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Kahn's algorithm with a min-heap ready queue.
    pub fn topological_order(&self) -> Option<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &next in &self.dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        (order.len() == in_degree.len()).then_some(order)
    }
}

/// Resolve the order in which a flow's steps are dispatched.
pub fn resolve_order(flow: &FlowDefinition) -> EngineResult<Vec<usize>> {
    match flow.settings.execution_order {
        ExecutionOrder::Declared => Ok((0..flow.steps.len()).collect()),
        ExecutionOrder::Dependencies => StepGraph::build(flow)?
            .topological_order()
            .ok_or_else(|| {
                EngineError::InvalidFlow(format!("flow '{}' has a dependency cycle", flow.id))
            }),
    }
}
