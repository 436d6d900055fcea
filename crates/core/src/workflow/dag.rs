use crate::error::{Result, WorkflowError};
use crate::types::{Step, StepId, StepStatus};
use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// DAG representation of a workflow. Node weights are positions in the
/// workflow's step list.
pub struct WorkflowDag {
    graph: DiGraph<usize, ()>,
    step_ids: Vec<StepId>,
    step_indices: HashMap<StepId, NodeIndex>,
}

impl WorkflowDag {
    /// Build a DAG from a step list, rejecting anything that could deadlock
    pub fn build(steps: &[Step]) -> Result<Self> {
        if steps.is_empty() {
            return Err(WorkflowError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        // Add all steps as nodes
        for (position, step) in steps.iter().enumerate() {
            let node = graph.add_node(position);
            if step_indices.insert(step.id.clone(), node).is_some() {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
        }

        // Add dependency edges
        for step in steps {
            let step_idx = step_indices[&step.id];
            for dep_id in &step.dependencies {
                if *dep_id == step.id {
                    return Err(WorkflowError::SelfDependency(step.id.clone()));
                }
                let dep_idx = step_indices.get(dep_id).ok_or_else(|| {
                    WorkflowError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;

                // Edge from dependency to dependent (dep -> step)
                graph.update_edge(*dep_idx, step_idx, ());
            }
        }

        let step_ids = steps.iter().map(|s| s.id.clone()).collect();
        let dag = Self {
            graph,
            step_ids,
            step_indices,
        };

        // Verify the graph is acyclic
        if toposort(&dag.graph, None).is_err() {
            return Err(WorkflowError::CycleDetected {
                steps: dag.cycle_members(),
            });
        }

        Ok(dag)
    }

    /// Steps that sit on a cycle, in declaration order
    fn cycle_members(&self) -> Vec<StepId> {
        let mut members: Vec<usize> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .flatten()
            .map(|node| self.graph[node])
            .collect();
        members.sort_unstable();
        members
            .into_iter()
            .map(|position| self.step_ids[position].clone())
            .collect()
    }

    pub fn contains(&self, step_id: &StepId) -> bool {
        self.step_indices.contains_key(step_id)
    }

    /// Direct dependencies of a step, in declaration order
    pub fn dependencies(&self, step_id: &StepId) -> Option<Vec<StepId>> {
        let node = self.step_indices.get(step_id)?;
        let mut positions: Vec<usize> = self
            .graph
            .neighbors_directed(*node, Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        positions.sort_unstable();
        Some(
            positions
                .into_iter()
                .map(|p| self.step_ids[p].clone())
                .collect(),
        )
    }

    /// Whether `step_id` is ordered after `ancestor` through some chain of dependencies
    pub fn depends_on_transitively(&self, step_id: &StepId, ancestor: &StepId) -> bool {
        match (self.step_indices.get(ancestor), self.step_indices.get(step_id)) {
            (Some(&from), Some(&to)) => from != to && has_path_connecting(&self.graph, from, to, None),
            _ => false,
        }
    }

    /// Check if all dependencies of a step are satisfied
    pub fn can_execute(&self, step_id: &StepId, completed_steps: &HashSet<StepId>) -> bool {
        self.dependencies(step_id)
            .map(|deps| deps.iter().all(|dep| completed_steps.contains(dep)))
            .unwrap_or(false)
    }

    /// Ready set: positions of steps that are pending (not completed, not
    /// dispatched, not permanently failed) and whose dependencies are all
    /// in `completed_steps`. Declaration order; no hidden state.
    pub fn ready_steps(&self, steps: &[Step], completed_steps: &HashSet<StepId>) -> Vec<usize> {
        let ready: Vec<usize> = steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.status == StepStatus::Pending)
            .filter(|(_, step)| !completed_steps.contains(&step.id))
            .filter(|(_, step)| self.can_execute(&step.id, completed_steps))
            .map(|(position, _)| position)
            .collect();

        tracing::debug!(ready = ready.len(), completed = completed_steps.len(), "computed ready set");
        ready
    }
}
