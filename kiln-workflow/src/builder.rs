//! Graph assembly and finalization.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use kiln_memory::{AllocationGroup, InternedString};
use kiln_task::Job;
use thiserror::Error;

use crate::graph::{Graph, GraphInner, NodeFunction, Vertex};

/// How a node touches a shared resource, for race validation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessClass {
    /// Inserts or detaches instances. Safe to overlap only with other
    /// population accesses.
    Population,
    /// Reads arbitrary instances without modifying them.
    View,
    /// Reads, writes and deletes arbitrary instances.
    Modification,
}

fn classes_conflict(first: AccessClass, second: AccessClass) -> bool {
    match (first, second) {
        (AccessClass::Modification, _) | (_, AccessClass::Modification) => true,
        (AccessClass::Population, AccessClass::View) => true,
        (AccessClass::View, AccessClass::Population) => true,
        _ => false,
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node name \"{0}\"")]
    DuplicateNode(InternedString),
    #[error("node \"{0}\" was submitted without a function")]
    MissingFunction(InternedString),
    #[error("dependency cycle through node \"{0}\"")]
    Cycle(InternedString),
    #[error(
        "nodes \"{first}\" and \"{second}\" may run concurrently with \
         conflicting access to resource \"{resource}\""
    )]
    AccessConflict {
        first: InternedString,
        second: InternedString,
        resource: InternedString,
    },
}

/// One node under construction. Configure it, then hand it to
/// [`GraphBuilder::submit`].
pub struct NodeBuilder {
    name: InternedString,
    function: Option<NodeFunction>,
    accesses: Vec<(InternedString, AccessClass)>,
    depends_on: Vec<InternedString>,
    dependency_of: Vec<InternedString>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<InternedString>) -> Self {
        NodeBuilder {
            name: name.into(),
            function: None,
            accesses: Vec::new(),
            depends_on: Vec::new(),
            dependency_of: Vec::new(),
        }
    }

    /// Sets the node body. The function receives a fresh job, may attach
    /// tasks to it and must release it.
    pub fn set_function(&mut self, function: impl Fn(Job) + Send + Sync + 'static) {
        self.function = Some(Arc::new(function));
    }

    /// Declares that the node accesses `resource` with `class`.
    pub fn register_access(&mut self, resource: impl Into<InternedString>, class: AccessClass) {
        self.accesses.push((resource.into(), class));
    }

    /// Declares that the node or checkpoint called `name` must finish
    /// before this node starts.
    pub fn depend_on(&mut self, name: impl Into<InternedString>) {
        self.depends_on.push(name.into());
    }

    /// Declares that this node must finish before the node or checkpoint
    /// called `name` starts.
    pub fn make_dependency_of(&mut self, name: impl Into<InternedString>) {
        self.dependency_of.push(name.into());
    }
}

struct BuilderState {
    nodes: Vec<NodeBuilder>,
    names: HashSet<InternedString>,
    checkpoint_dependencies: Vec<(InternedString, InternedString)>,
}

/// Collects node submissions and checkpoint dependencies, then finalizes
/// them into an executable [`Graph`].
///
/// Node creation and submission are thread-safe; checkpoint registration
/// and finalization require exclusive access. Finalization drains the
/// builder so it can be reused.
pub struct GraphBuilder {
    state: Mutex<BuilderState>,
    group: AllocationGroup,
}

impl GraphBuilder {
    pub fn new(group: AllocationGroup) -> Self {
        GraphBuilder {
            state: Mutex::new(BuilderState {
                nodes: Vec::new(),
                names: HashSet::new(),
                checkpoint_dependencies: Vec::new(),
            }),
            group,
        }
    }

    /// Takes the node into the graph under construction. Fails on name
    /// collision with an already submitted node.
    pub fn submit(&self, node: NodeBuilder) -> Result<(), GraphError> {
        let mut state = self.state.lock().unwrap();
        if !state.names.insert(node.name) {
            log::error!(target: "workflow", "duplicate node name \"{}\"", node.name);
            return Err(GraphError::DuplicateNode(node.name));
        }
        state.nodes.push(node);
        Ok(())
    }

    /// Records that checkpoint `dependency` must be passed before
    /// checkpoint `dependant`.
    pub fn register_checkpoint_dependency(
        &mut self,
        dependency: impl Into<InternedString>,
        dependant: impl Into<InternedString>,
    ) {
        let state = self.state.get_mut().unwrap();
        state
            .checkpoint_dependencies
            .push((dependency.into(), dependant.into()));
    }

    /// Builds the executable graph from everything submitted so far.
    ///
    /// All validation errors are collected and returned together; no
    /// partial graph escapes. The builder is reset either way.
    pub fn finalize(&mut self) -> Result<Graph, Vec<GraphError>> {
        let state = self.state.get_mut().unwrap();
        let nodes = std::mem::take(&mut state.nodes);
        let checkpoint_dependencies = std::mem::take(&mut state.checkpoint_dependencies);
        state.names.clear();

        let mut errors = Vec::new();
        let node_count = nodes.len();

        let mut node_index = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            node_index.insert(node.name, index);
            if node.function.is_none() {
                errors.push(GraphError::MissingFunction(node.name));
            }
        }

        // Every referenced name that is not a node becomes a checkpoint.
        fn checkpoint_of(name: InternedString, table: &mut HashMap<InternedString, usize>) -> usize {
            let next = table.len();
            *table.entry(name).or_insert(next)
        }

        fn ensure_checkpoint_slots(
            index: usize,
            into: &mut Vec<Vec<usize>>,
            from: &mut Vec<Vec<usize>>,
            edges: &mut Vec<Vec<usize>>,
        ) {
            while into.len() <= index {
                into.push(Vec::new());
                from.push(Vec::new());
                edges.push(Vec::new());
            }
        }

        let mut checkpoints: HashMap<InternedString, usize> = HashMap::new();
        let mut direct_edges: HashSet<(usize, usize)> = HashSet::new();
        // Real node -> checkpoint and checkpoint -> real node edges.
        let mut into_checkpoint: Vec<Vec<usize>> = Vec::new();
        let mut from_checkpoint: Vec<Vec<usize>> = Vec::new();
        let mut checkpoint_edges: Vec<Vec<usize>> = Vec::new();

        for (index, node) in nodes.iter().enumerate() {
            for &dependency in &node.depends_on {
                if let Some(&source) = node_index.get(&dependency) {
                    direct_edges.insert((source, index));
                } else {
                    let checkpoint = checkpoint_of(dependency, &mut checkpoints);
                    ensure_checkpoint_slots(
                        checkpoint,
                        &mut into_checkpoint,
                        &mut from_checkpoint,
                        &mut checkpoint_edges,
                    );
                    from_checkpoint[checkpoint].push(index);
                }
            }

            for &dependant in &node.dependency_of {
                if let Some(&target) = node_index.get(&dependant) {
                    direct_edges.insert((index, target));
                } else {
                    let checkpoint = checkpoint_of(dependant, &mut checkpoints);
                    ensure_checkpoint_slots(
                        checkpoint,
                        &mut into_checkpoint,
                        &mut from_checkpoint,
                        &mut checkpoint_edges,
                    );
                    into_checkpoint[checkpoint].push(index);
                }
            }
        }

        for (dependency, dependant) in &checkpoint_dependencies {
            let from = checkpoint_of(*dependency, &mut checkpoints);
            let to = checkpoint_of(*dependant, &mut checkpoints);
            let highest = from.max(to);
            ensure_checkpoint_slots(
                highest,
                &mut into_checkpoint,
                &mut from_checkpoint,
                &mut checkpoint_edges,
            );
            checkpoint_edges[from].push(to);
        }

        // Expand checkpoints: every node feeding a checkpoint becomes a
        // dependency of every node reachable from it through the
        // checkpoint graph. Checkpoints then vanish from the result.
        for checkpoint in 0..checkpoints.len() {
            if into_checkpoint[checkpoint].is_empty() {
                continue;
            }

            let mut visited = vec![false; checkpoints.len()];
            let mut targets = Vec::new();
            let mut pending = vec![checkpoint];
            while let Some(current) = pending.pop() {
                if std::mem::replace(&mut visited[current], true) {
                    continue;
                }
                targets.extend_from_slice(&from_checkpoint[current]);
                pending.extend_from_slice(&checkpoint_edges[current]);
            }

            for &source in &into_checkpoint[checkpoint] {
                for &target in &targets {
                    direct_edges.insert((source, target));
                }
            }
        }

        let mut outbound = vec![Vec::new(); node_count];
        let mut inbound_count = vec![0u32; node_count];
        for &(source, target) in &direct_edges {
            outbound[source].push(target);
            inbound_count[target] += 1;
        }

        self.check_cycles(&nodes, &outbound, &mut errors);
        self.check_races(&nodes, &outbound, &mut errors);

        if !errors.is_empty() {
            for error in &errors {
                log::error!(target: "workflow", "graph finalization: {}", error);
            }
            return Err(errors);
        }

        let vertices = nodes
            .into_iter()
            .enumerate()
            .map(|(index, node)| Vertex {
                name: node.name,
                function: node.function.expect("validated above"),
                inbound_count: inbound_count[index],
                outbound: std::mem::take(&mut outbound[index]),
            })
            .collect();

        log::debug!(
            target: "workflow",
            "finalized graph with {} nodes and {} edges",
            node_count,
            direct_edges.len()
        );
        Ok(Graph::from_inner(GraphInner { vertices }, self.group))
    }

    fn check_cycles(
        &self,
        nodes: &[NodeBuilder],
        outbound: &[Vec<usize>],
        errors: &mut Vec<GraphError>,
    ) {
        const UNVISITED: u8 = 0;
        const IN_PROGRESS: u8 = 1;
        const DONE: u8 = 2;

        let mut colors = vec![UNVISITED; nodes.len()];
        for start in 0..nodes.len() {
            if colors[start] != UNVISITED {
                continue;
            }

            // Iterative DFS; a back edge into an in-progress node is a cycle.
            let mut stack = vec![(start, 0usize)];
            colors[start] = IN_PROGRESS;
            while let Some(&mut (node, ref mut edge)) = stack.last_mut() {
                if *edge < outbound[node].len() {
                    let next = outbound[node][*edge];
                    *edge += 1;
                    match colors[next] {
                        UNVISITED => {
                            colors[next] = IN_PROGRESS;
                            stack.push((next, 0));
                        }
                        IN_PROGRESS => {
                            errors.push(GraphError::Cycle(nodes[next].name));
                            return;
                        }
                        _ => {}
                    }
                } else {
                    colors[node] = DONE;
                    stack.pop();
                }
            }
        }
    }

    fn check_races(
        &self,
        nodes: &[NodeBuilder],
        outbound: &[Vec<usize>],
        errors: &mut Vec<GraphError>,
    ) {
        let node_count = nodes.len();
        let mut reachable = vec![vec![false; node_count]; node_count];
        for start in 0..node_count {
            let mut pending = outbound[start].clone();
            while let Some(current) = pending.pop() {
                if std::mem::replace(&mut reachable[start][current], true) {
                    continue;
                }
                pending.extend_from_slice(&outbound[current]);
            }
        }

        for first in 0..node_count {
            for second in first + 1..node_count {
                if reachable[first][second] || reachable[second][first] {
                    continue;
                }

                let mut reported = HashSet::new();
                for &(resource, first_class) in &nodes[first].accesses {
                    for &(other_resource, second_class) in &nodes[second].accesses {
                        if resource == other_resource
                            && classes_conflict(first_class, second_class)
                            && reported.insert(resource)
                        {
                            errors.push(GraphError::AccessConflict {
                                first: nodes[first].name,
                                second: nodes[second].name,
                                resource,
                            });
                        }
                    }
                }
            }
        }
    }
}
