//! State graph construction and export.
//!
//! The graph is an arena of vertices indexed by [`VertexId`]; every
//! descriptor reachable from the initial state is materialized exactly
//! once, and each vertex carries its outgoing edges in attempt-priority
//! order.
//!
//! Construction walks the descriptor declarations depth-first. States
//! reachable only through back-references (their descriptors declare
//! predecessors instead of being anyone's successor) are pre-registered so
//! the forward walk discovers them as inferred successors. When a state
//! has more than one successor, a secondary preference graph is built from
//! the siblings' precedence declarations and topologically sorted; the
//! resulting order becomes the edge order. Siblings without precedence
//! data are appended in declaration order. Cyclic precedence declarations
//! are rejected at build time.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::GraphError;
use crate::fsm::descriptor::{DescriptorRegistry, StateDescriptor, StateId};

/// Index of a vertex within a [`StateGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexId(usize);

impl VertexId {
    /// Raw arena index. Stable for the lifetime of the graph.
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Vertex {
    descriptor: &'static StateDescriptor,
    edges: Vec<VertexId>,
}

/// A connected, ordered-edge state graph rooted at an initial vertex.
#[derive(Debug)]
pub struct StateGraph {
    vertices: Vec<Vertex>,
    vertex_of: HashMap<StateId, VertexId>,
}

impl StateGraph {
    /// Build the graph reachable from `initial`.
    ///
    /// `backward_edge_states` lists descriptors that are only reachable
    /// through their predecessor declarations. `fail_on_unknown_states`
    /// additionally validates that every precedence declaration points at
    /// a sibling within the same successor set, catching descriptor
    /// authoring mistakes.
    pub fn build(
        registry: &'static DescriptorRegistry,
        initial: StateId,
        backward_edge_states: &[StateId],
        fail_on_unknown_states: bool,
    ) -> Result<Self, GraphError> {
        let mut inferred: HashMap<StateId, Vec<StateId>> = HashMap::new();
        for &backward in backward_edge_states {
            let descriptor = registry
                .get(backward)
                .ok_or(GraphError::MissingDescriptor(backward))?;
            for &predecessor in descriptor.predecessors() {
                inferred.entry(predecessor).or_default().push(backward);
            }
        }

        let mut graph = Self {
            vertices: Vec::new(),
            vertex_of: HashMap::new(),
        };

        let initial_descriptor = registry
            .get(initial)
            .ok_or(GraphError::MissingDescriptor(initial))?;
        let initial_vertex = graph.get_or_add(initial_descriptor);

        let mut handled = HashSet::new();
        graph.link_vertex(
            initial_vertex,
            registry,
            &inferred,
            fail_on_unknown_states,
            &mut handled,
        )?;

        debug!(
            vertices = graph.vertex_count(),
            initial = %initial,
            "state graph constructed"
        );
        Ok(graph)
    }

    /// The initial vertex the graph was rooted at.
    pub fn initial(&self) -> VertexId {
        VertexId(0)
    }

    /// Number of materialized vertices.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Descriptor at a vertex.
    pub fn descriptor(&self, vertex: VertexId) -> &'static StateDescriptor {
        self.vertices[vertex.0].descriptor
    }

    /// Outgoing edges of a vertex, highest attempt priority first.
    pub fn edges(&self, vertex: VertexId) -> &[VertexId] {
        &self.vertices[vertex.0].edges
    }

    /// Vertex holding the given state, if it was materialized.
    pub fn find(&self, id: StateId) -> Option<VertexId> {
        self.vertex_of.get(&id).copied()
    }

    /// All vertex ids, in arena order.
    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        (0..self.vertices.len()).map(VertexId)
    }

    fn get_or_add(&mut self, descriptor: &'static StateDescriptor) -> VertexId {
        if let Some(&vertex) = self.vertex_of.get(&descriptor.id()) {
            return vertex;
        }
        let vertex = VertexId(self.vertices.len());
        self.vertices.push(Vertex {
            descriptor,
            edges: Vec::new(),
        });
        self.vertex_of.insert(descriptor.id(), vertex);
        vertex
    }

    fn add_edge(&mut self, from: VertexId, to: VertexId) -> Result<(), GraphError> {
        if self.vertices[from.0].edges.contains(&to) {
            return Err(GraphError::DuplicateEdge {
                from: self.vertices[from.0].descriptor.id(),
                to: self.vertices[to.0].descriptor.id(),
            });
        }
        self.vertices[from.0].edges.push(to);
        Ok(())
    }

    fn link_vertex(
        &mut self,
        vertex: VertexId,
        registry: &'static DescriptorRegistry,
        inferred: &HashMap<StateId, Vec<StateId>>,
        fail_on_unknown_states: bool,
        handled: &mut HashSet<StateId>,
    ) -> Result<(), GraphError> {
        let descriptor = self.vertices[vertex.0].descriptor;
        let id = descriptor.id();
        if !handled.insert(id) {
            return Ok(());
        }

        let mut successor_ids: Vec<StateId> = descriptor.successors().to_vec();
        if let Some(extra) = inferred.get(&id) {
            for &inferred_successor in extra {
                if !successor_ids.contains(&inferred_successor) {
                    successor_ids.push(inferred_successor);
                }
            }
        }

        if successor_ids.is_empty() {
            if descriptor.is_final() {
                // A final state may be a leaf of the graph.
                return Ok(());
            }
            return Err(GraphError::NoSuccessors(id));
        }

        let ordered = if successor_ids.len() == 1 {
            successor_ids
        } else {
            resolve_successor_order(registry, &successor_ids, fail_on_unknown_states)?
        };

        let mut successor_vertices = Vec::with_capacity(ordered.len());
        for successor_id in ordered {
            let successor_descriptor = registry
                .get(successor_id)
                .ok_or(GraphError::MissingDescriptor(successor_id))?;
            let successor_vertex = self.get_or_add(successor_descriptor);
            self.add_edge(vertex, successor_vertex)?;
            successor_vertices.push(successor_vertex);
        }

        for successor_vertex in successor_vertices {
            self.link_vertex(
                successor_vertex,
                registry,
                inferred,
                fail_on_unknown_states,
                handled,
            )?;
        }

        Ok(())
    }

    /// Serialize the graph to Graphviz `dot` notation.
    ///
    /// Node styling: bold = multi-visit, filled = final, dashed = not
    /// implemented. Edges of multi-successor vertices are labeled with
    /// their attempt order.
    pub fn to_dot(&self, break_state_names: bool) -> String {
        let mut out = String::from("digraph {\n");

        for vertex in &self.vertices {
            let style = if vertex.descriptor.is_multi_visit() {
                Some("bold")
            } else if vertex.descriptor.is_final() {
                Some("filled")
            } else if vertex.descriptor.is_not_implemented() {
                Some("dashed")
            } else {
                None
            };

            if let Some(style) = style {
                let _ = writeln!(
                    out,
                    "\"{}\" [ style={style} ]",
                    vertex.descriptor.full_name(break_state_names)
                );
            }
        }

        for vertex in &self.vertices {
            let total_edges = vertex.edges.len();
            for (edge_index, &target) in vertex.edges.iter().enumerate() {
                let _ = write!(
                    out,
                    "  \"{}\" -> \"{}\"",
                    vertex.descriptor.full_name(break_state_names),
                    self.vertices[target.0].descriptor.full_name(break_state_names)
                );
                if total_edges > 1 {
                    // 'dot' requires double quotes around the value.
                    let _ = write!(out, " [xlabel=\"{}\"]", edge_index + 1);
                }
                out.push_str(";\n");
            }
        }

        out.push_str("}\n");
        out
    }
}

fn preference_node(
    preference_graph: &mut DiGraph<StateId, ()>,
    node_of: &mut HashMap<StateId, NodeIndex>,
    id: StateId,
) -> NodeIndex {
    *node_of
        .entry(id)
        .or_insert_with(|| preference_graph.add_node(id))
}

/// Resolve the attempt order of a multi-successor fan-out.
///
/// Builds the preference graph over the siblings' precedence declarations
/// (an edge points from the preferred state to the subordinate one) and
/// topologically sorts it. Siblings without precedence data keep their
/// declaration order at the end.
fn resolve_successor_order(
    registry: &'static DescriptorRegistry,
    siblings: &[StateId],
    fail_on_unknown_states: bool,
) -> Result<Vec<StateId>, GraphError> {
    let mut preference_graph: DiGraph<StateId, ()> = DiGraph::new();
    let mut node_of: HashMap<StateId, NodeIndex> = HashMap::new();

    for &sibling in siblings {
        let descriptor = registry
            .get(sibling)
            .ok_or(GraphError::MissingDescriptor(sibling))?;

        for &subordinate in descriptor.precedence_over() {
            if !siblings.contains(&subordinate) {
                if fail_on_unknown_states {
                    return Err(GraphError::UnknownPrecedenceReference {
                        declarer: sibling,
                        referenced: subordinate,
                    });
                }
                continue;
            }
            let superior_node = preference_node(&mut preference_graph, &mut node_of, sibling);
            let subordinate_node =
                preference_node(&mut preference_graph, &mut node_of, subordinate);
            preference_graph.update_edge(superior_node, subordinate_node, ());
        }

        for &superior in descriptor.inferior_to() {
            if !siblings.contains(&superior) {
                if fail_on_unknown_states {
                    return Err(GraphError::UnknownPrecedenceReference {
                        declarer: sibling,
                        referenced: superior,
                    });
                }
                continue;
            }
            let subordinate_node = preference_node(&mut preference_graph, &mut node_of, sibling);
            let superior_node = preference_node(&mut preference_graph, &mut node_of, superior);
            preference_graph.update_edge(superior_node, subordinate_node, ());
        }
    }

    let sorted = toposort(&preference_graph, None).map_err(|_| GraphError::PrecedenceCycle {
        among: preference_graph.node_weights().copied().collect(),
    })?;

    let mut order: Vec<StateId> = sorted
        .into_iter()
        .map(|node| preference_graph[node])
        .collect();

    // Append siblings without precedence data in declaration order. Only
    // the toposorted prefix is deduplicated against; a descriptor that
    // declares the same successor twice keeps both entries and trips the
    // duplicate-edge guard.
    let sorted_len = order.len();
    for &sibling in siblings {
        if !order[..sorted_len].contains(&sibling) {
            order.push(sibling);
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::descriptor::StateDescriptor;

    fn leak(registry: DescriptorRegistry) -> &'static DescriptorRegistry {
        Box::leak(Box::new(registry))
    }

    fn final_leaf(id: StateId) -> StateDescriptor {
        StateDescriptor::builder(id).final_state().build()
    }

    #[test]
    fn test_linear_graph() {
        let mut registry = DescriptorRegistry::new();
        registry.register(
            StateDescriptor::builder(StateId::Disconnected)
                .final_state()
                .successor(StateId::SaslAuthentication)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::SaslAuthentication)
                .successor(StateId::AuthenticatedAndResourceBound)
                .build(),
        );
        registry.register(final_leaf(StateId::AuthenticatedAndResourceBound));

        let graph = StateGraph::build(leak(registry), StateId::Disconnected, &[], true).unwrap();
        assert_eq!(graph.vertex_count(), 3);

        let initial = graph.initial();
        assert_eq!(graph.descriptor(initial).id(), StateId::Disconnected);
        let next = graph.edges(initial)[0];
        assert_eq!(graph.descriptor(next).id(), StateId::SaslAuthentication);
    }

    #[test]
    fn test_non_final_state_without_successor_is_rejected() {
        let mut registry = DescriptorRegistry::new();
        registry.register(
            StateDescriptor::builder(StateId::Disconnected)
                .final_state()
                .successor(StateId::SaslAuthentication)
                .build(),
        );
        // Not final, no successors: a dead descriptor.
        registry.register(StateDescriptor::builder(StateId::SaslAuthentication).build());

        let err = StateGraph::build(leak(registry), StateId::Disconnected, &[], true).unwrap_err();
        assert_eq!(err, GraphError::NoSuccessors(StateId::SaslAuthentication));
    }

    #[test]
    fn test_precedence_resolves_unique_order() {
        let mut registry = DescriptorRegistry::new();
        registry.register(
            StateDescriptor::builder(StateId::AuthenticatedButUnbound)
                .final_state()
                .successor(StateId::ResourceBinding)
                .successor(StateId::Compression)
                .successor(StateId::StreamResumption)
                .build(),
        );
        registry.register(final_leaf(StateId::ResourceBinding));
        registry.register(
            StateDescriptor::builder(StateId::Compression)
                .final_state()
                .precedence_over(StateId::ResourceBinding)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::StreamResumption)
                .final_state()
                .precedence_over(StateId::ResourceBinding)
                .inferior_to(StateId::Compression)
                .build(),
        );

        let graph =
            StateGraph::build(leak(registry), StateId::AuthenticatedButUnbound, &[], true).unwrap();
        let order: Vec<StateId> = graph
            .edges(graph.initial())
            .iter()
            .map(|&v| graph.descriptor(v).id())
            .collect();
        assert_eq!(
            order,
            [
                StateId::Compression,
                StateId::StreamResumption,
                StateId::ResourceBinding
            ]
        );
    }

    #[test]
    fn test_precedence_cycle_is_rejected() {
        let mut registry = DescriptorRegistry::new();
        registry.register(
            StateDescriptor::builder(StateId::Disconnected)
                .final_state()
                .successor(StateId::Compression)
                .successor(StateId::ResourceBinding)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::Compression)
                .final_state()
                .precedence_over(StateId::ResourceBinding)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::ResourceBinding)
                .final_state()
                .precedence_over(StateId::Compression)
                .build(),
        );

        let err = StateGraph::build(leak(registry), StateId::Disconnected, &[], true).unwrap_err();
        assert!(matches!(err, GraphError::PrecedenceCycle { .. }));
    }

    #[test]
    fn test_unknown_precedence_reference() {
        let mut registry = DescriptorRegistry::new();
        registry.register(
            StateDescriptor::builder(StateId::Disconnected)
                .final_state()
                .successor(StateId::Compression)
                .successor(StateId::ResourceBinding)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::Compression)
                .final_state()
                // SaslAuthentication is not part of this successor set.
                .precedence_over(StateId::SaslAuthentication)
                .build(),
        );
        registry.register(final_leaf(StateId::ResourceBinding));
        let registry = leak(registry);

        let err = StateGraph::build(registry, StateId::Disconnected, &[], true).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownPrecedenceReference {
                declarer: StateId::Compression,
                referenced: StateId::SaslAuthentication,
            }
        );

        // Without validation the stray declaration is ignored.
        let graph = StateGraph::build(registry, StateId::Disconnected, &[], false).unwrap();
        assert_eq!(graph.edges(graph.initial()).len(), 2);
    }

    #[test]
    fn test_backward_edge_states_are_inferred_successors() {
        let mut registry = DescriptorRegistry::new();
        registry.register(final_leaf(StateId::Disconnected));
        registry.register(
            StateDescriptor::builder(StateId::Shutdown)
                .predecessor(StateId::Disconnected)
                .successor(StateId::CloseConnection)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::CloseConnection)
                .successor(StateId::Disconnected)
                .build(),
        );

        let graph = StateGraph::build(
            leak(registry),
            StateId::Disconnected,
            &[StateId::Shutdown],
            true,
        )
        .unwrap();

        let initial = graph.initial();
        let successors: Vec<StateId> = graph
            .edges(initial)
            .iter()
            .map(|&v| graph.descriptor(v).id())
            .collect();
        assert_eq!(successors, [StateId::Shutdown]);

        // The loop back to Disconnected reuses the initial vertex.
        assert_eq!(graph.vertex_count(), 3);
        let close = graph.find(StateId::CloseConnection).unwrap();
        assert_eq!(graph.edges(close), [initial]);
    }

    #[test]
    fn test_duplicate_successor_is_rejected() {
        let mut registry = DescriptorRegistry::new();
        registry.register(
            StateDescriptor::builder(StateId::Disconnected)
                .final_state()
                .successor(StateId::Compression)
                .successor(StateId::Compression)
                .build(),
        );
        registry.register(final_leaf(StateId::Compression));

        let err = StateGraph::build(leak(registry), StateId::Disconnected, &[], true).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateEdge { .. }));
    }

    #[test]
    fn test_dot_export_styles_and_edge_order() {
        let mut registry = DescriptorRegistry::new();
        registry.register(
            StateDescriptor::builder(StateId::Disconnected)
                .final_state()
                .successor(StateId::Compression)
                .successor(StateId::ResourceBinding)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::Compression)
                .xep(138)
                .not_implemented()
                .final_state()
                .precedence_over(StateId::ResourceBinding)
                .build(),
        );
        registry.register(final_leaf(StateId::ResourceBinding));

        let graph = StateGraph::build(leak(registry), StateId::Disconnected, &[], true).unwrap();
        let dot = graph.to_dot(false);

        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("\"Disconnected\" [ style=filled ]"));
        // multi-visit and final take styling precedence over not-implemented;
        // Compression here is final, so it renders filled.
        assert!(dot.contains("\"Compression (XEP-0138)\" [ style=filled ]"));
        assert!(dot.contains("[xlabel=\"1\"]"));
        assert!(dot.contains("[xlabel=\"2\"]"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const POOL: [StateId; 5] = [
            StateId::SaslAuthentication,
            StateId::Compression,
            StateId::ResourceBinding,
            StateId::StreamResumption,
            StateId::Bind2,
        ];

        fn registry_for(pairs: &[(usize, usize)]) -> &'static DescriptorRegistry {
            let mut registry = DescriptorRegistry::new();
            let mut root = StateDescriptor::builder(StateId::Disconnected).final_state();
            for &id in &POOL {
                root = root.successor(id);
            }
            registry.register(root.build());

            for (index, &id) in POOL.iter().enumerate() {
                let mut builder = StateDescriptor::builder(id).final_state();
                for &(superior, subordinate) in pairs {
                    if superior == index {
                        builder = builder.precedence_over(POOL[subordinate]);
                    }
                }
                registry.register(builder.build());
            }
            Box::leak(Box::new(registry))
        }

        proptest! {
            // Precedence pairs are generated with superior < subordinate,
            // which keeps the declarations acyclic by construction.
            #[test]
            fn toposort_respects_declarations_and_is_deterministic(
                pairs in proptest::collection::vec((0usize..4, 1usize..5), 0..8)
                    .prop_map(|v| {
                        v.into_iter()
                            .filter(|(a, b)| a < b)
                            .collect::<Vec<_>>()
                    })
            ) {
                let registry = registry_for(&pairs);
                let graph =
                    StateGraph::build(registry, StateId::Disconnected, &[], true).unwrap();
                let order: Vec<StateId> = graph
                    .edges(graph.initial())
                    .iter()
                    .map(|&v| graph.descriptor(v).id())
                    .collect();

                prop_assert_eq!(order.len(), POOL.len());
                for &(superior, subordinate) in &pairs {
                    let superior_pos =
                        order.iter().position(|&s| s == POOL[superior]).unwrap();
                    let subordinate_pos =
                        order.iter().position(|&s| s == POOL[subordinate]).unwrap();
                    prop_assert!(superior_pos < subordinate_pos);
                }

                // A second build from the same declarations resolves the
                // same attempt order.
                let rebuilt =
                    StateGraph::build(registry, StateId::Disconnected, &[], true).unwrap();
                let rebuilt_order: Vec<StateId> = rebuilt
                    .edges(rebuilt.initial())
                    .iter()
                    .map(|&v| rebuilt.descriptor(v).id())
                    .collect();
                prop_assert_eq!(order, rebuilt_order);
            }
        }
    }
}
