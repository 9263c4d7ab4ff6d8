//! Static event-to-step routing table.
//!
//! Built once when a workflow is constructed. Each registered step is a
//! node in a petgraph [`DiGraph`]; an edge `a → b` means `a` declares an
//! output kind that `b` consumes. Routing itself only needs the
//! kind → steps table; the graph is used to validate the declared
//! topology.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::event::{EventKind, StopEvent};
use crate::{HeddleError, Result, RunState, Step};

/// A step plus its worker-pool size.
pub(crate) struct RegisteredStep<S> {
    pub(crate) step: Arc<dyn Step<S>>,
    pub(crate) workers: usize,
}

impl<S> RegisteredStep<S> {
    pub(crate) fn name(&self) -> &str {
        self.step.name()
    }
}

/// The routing table of a built workflow.
pub(crate) struct StepRegistry<S> {
    graph: DiGraph<RegisteredStep<S>, ()>,
    routes: HashMap<EventKind, Vec<NodeIndex>>,
}

impl<S: RunState> StepRegistry<S> {
    /// Validates `steps` and builds the routing table.
    ///
    /// Registration order is preserved: node indices follow it, and an
    /// event consumed by several steps is dispatched in that order.
    pub(crate) fn build(steps: Vec<RegisteredStep<S>>) -> Result<Self> {
        if steps.is_empty() {
            return Err(HeddleError::InvalidWorkflow(
                "workflow has no steps".to_string(),
            ));
        }

        let mut graph = DiGraph::new();
        let mut names: HashMap<String, NodeIndex> = HashMap::new();
        let mut routes: HashMap<EventKind, Vec<NodeIndex>> = HashMap::new();
        let stop = EventKind::of::<StopEvent>();

        for registered in steps {
            let name = registered.name().to_string();
            if names.contains_key(&name) {
                return Err(HeddleError::DuplicateStep(name));
            }
            if registered.workers == 0 {
                return Err(HeddleError::InvalidWorkflow(format!(
                    "step {name} needs at least one worker"
                )));
            }

            let accepts = registered.step.accepts();
            if accepts.is_empty() {
                return Err(HeddleError::InvalidWorkflow(format!(
                    "step {name} accepts no events"
                )));
            }
            if accepts.contains(&stop) {
                return Err(HeddleError::InvalidWorkflow(format!(
                    "step {name} consumes StopEvent, which only ends a run"
                )));
            }

            let index = graph.add_node(registered);
            for kind in accepts {
                let consumers = routes.entry(kind).or_default();
                if !consumers.contains(&index) {
                    consumers.push(index);
                }
            }
            names.insert(name, index);
        }

        let mut registry = Self { graph, routes };
        registry.link_declared_outputs()?;
        Ok(registry)
    }

    /// Adds producer → consumer edges for declared outputs and checks the
    /// declared topology can always terminate.
    fn link_declared_outputs(&mut self) -> Result<()> {
        let stop = EventKind::of::<StopEvent>();
        let mut edges = Vec::new();
        let mut terminals = Vec::new();
        let mut declaring = Vec::new();

        for producer in self.graph.node_indices() {
            let produces = self.graph[producer].step.produces();
            if produces.is_empty() {
                continue;
            }
            declaring.push(producer);

            for kind in produces {
                if kind == stop {
                    terminals.push(producer);
                    continue;
                }
                let consumers = self.routes.get(&kind).ok_or_else(|| {
                    HeddleError::InvalidWorkflow(format!(
                        "step {} produces {} but no step consumes it",
                        self.graph[producer].name(),
                        kind
                    ))
                })?;
                edges.extend(consumers.iter().map(|&consumer| (producer, consumer)));
            }
        }

        for (from, to) in edges {
            self.graph.update_edge(from, to, ());
        }

        for node in declaring {
            let terminates = terminals
                .iter()
                .any(|&terminal| has_path_connecting(&self.graph, node, terminal, None));
            if !terminates {
                return Err(HeddleError::InvalidWorkflow(format!(
                    "step {} cannot reach a step that produces StopEvent",
                    self.graph[node].name()
                )));
            }
        }

        Ok(())
    }

    /// Indices of the steps subscribed to `kind`, in registration order.
    pub(crate) fn routes(&self, kind: &EventKind) -> &[NodeIndex] {
        self.routes.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn get(&self, index: NodeIndex) -> &RegisteredStep<S> {
        &self.graph[index]
    }

    /// Steps in registration order.
    pub(crate) fn steps(&self) -> impl Iterator<Item = (NodeIndex, &RegisteredStep<S>)> {
        self.graph
            .node_indices()
            .map(move |index| (index, &self.graph[index]))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Names of the steps a step's declared outputs feed into.
    pub(crate) fn successors(&self, name: &str) -> Option<Vec<&str>> {
        let node = self.graph.node_indices().find(|&i| self.graph[i].name() == name)?;
        let mut successors: Vec<&str> = self
            .graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .map(|i| self.graph[i].name())
            .collect();
        successors.sort_unstable();
        Some(successors)
    }
}

impl<S> fmt::Debug for StepRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<(&str, usize)> = self
            .graph
            .node_weights()
            .map(|r| (r.name(), r.workers))
            .collect();
        f.debug_struct("StepRegistry")
            .field("steps", &steps)
            .field("routes", &self.routes.len())
            .finish()
    }
}
