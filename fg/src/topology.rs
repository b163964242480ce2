use gpu_core::{Handle, HandlePool};

/// The topology graph is a DAG of vertices of two kinds; the vertex carries
/// no semantics beyond the tag and the handles into the node/pin pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexKind {
    Node,
    Pin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexState {
    Unvisited,
    Enabled,
    Disabled,
}

pub struct Vertex {
    pub kind: VertexKind,
    pub state: VertexState,
    pub node: Handle<crate::graph::NodeTag>,
    pub pin: Handle<crate::graph::PinTag>,
}

impl Vertex {
    pub fn new(kind: VertexKind) -> Self {
        Self {
            kind,
            state: VertexState::Unvisited,
            node: Handle::NONE,
            pin: Handle::NONE,
        }
    }
}

struct Adjacency {
    out_edges: Vec<Handle<Vertex>>,
    in_edges: Vec<Handle<Vertex>>,
}

/// Vertex store with adjacency lists. Iteration orders are deterministic
/// (insertion order), which makes the derived node order stable.
#[derive(Default)]
pub struct Topology {
    vertices: HandlePool<Vertex>,
    adjacency: HandlePool<Adjacency>,
}

impl Topology {
    pub fn add_vertex(&mut self, vertex: Vertex) -> Handle<Vertex> {
        let handle = self.vertices.insert(vertex);
        let adjacency = self.adjacency.insert(Adjacency {
            out_edges: Vec::new(),
            in_edges: Vec::new(),
        });
        debug_assert_eq!(handle.index(), adjacency.index());
        handle
    }

    pub fn remove_vertex(&mut self, vertex: Handle<Vertex>) {
        let adjacency_handle = self.adjacency_handle(vertex);

        if let Some(adjacency) = self.adjacency.remove(adjacency_handle) {
            for out in adjacency.out_edges {
                if let Some(other) = self.adjacency.get_mut(self.adjacency_handle(out)) {
                    other.in_edges.retain(|v| *v != vertex);
                }
            }
            for inv in adjacency.in_edges {
                if let Some(other) = self.adjacency.get_mut(self.adjacency_handle(inv)) {
                    other.out_edges.retain(|v| *v != vertex);
                }
            }
        }

        self.vertices.remove(vertex);
    }

    fn adjacency_handle(&self, vertex: Handle<Vertex>) -> Handle<Adjacency> {
        Handle::from_parts(vertex.index(), vertex.generation())
    }

    pub fn add_edge(&mut self, from: Handle<Vertex>, to: Handle<Vertex>) {
        debug_assert!(self.vertices.contains(from) && self.vertices.contains(to));

        let from_adj = self.adjacency_handle(from);
        if let Some(adjacency) = self.adjacency.get_mut(from_adj) {
            adjacency.out_edges.push(to);
        }
        let to_adj = self.adjacency_handle(to);
        if let Some(adjacency) = self.adjacency.get_mut(to_adj) {
            adjacency.in_edges.push(from);
        }
    }

    pub fn has_edge(&self, from: Handle<Vertex>, to: Handle<Vertex>) -> bool {
        self.adjacency
            .get(self.adjacency_handle(from))
            .map(|adjacency| adjacency.out_edges.contains(&to))
            .unwrap_or(false)
    }

    pub fn remove_edge(&mut self, from: Handle<Vertex>, to: Handle<Vertex>) {
        let from_adj = self.adjacency_handle(from);
        if let Some(adjacency) = self.adjacency.get_mut(from_adj) {
            if let Some(pos) = adjacency.out_edges.iter().position(|v| *v == to) {
                adjacency.out_edges.remove(pos);
            }
        }
        let to_adj = self.adjacency_handle(to);
        if let Some(adjacency) = self.adjacency.get_mut(to_adj) {
            if let Some(pos) = adjacency.in_edges.iter().position(|v| *v == from) {
                adjacency.in_edges.remove(pos);
            }
        }
    }

    pub fn get(&self, vertex: Handle<Vertex>) -> &Vertex {
        self.vertices.get(vertex).expect("dangling vertex handle")
    }

    pub fn get_mut(&mut self, vertex: Handle<Vertex>) -> &mut Vertex {
        self.vertices.get_mut(vertex).expect("dangling vertex handle")
    }

    pub fn try_get(&self, vertex: Handle<Vertex>) -> Option<&Vertex> {
        self.vertices.get(vertex)
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> Vec<Handle<Vertex>> {
        self.vertices.keys()
    }

    pub fn out_edges(&self, vertex: Handle<Vertex>) -> &[Handle<Vertex>] {
        self.adjacency
            .get(self.adjacency_handle(vertex))
            .map(|adjacency| adjacency.out_edges.as_slice())
            .unwrap_or(&[])
    }

    pub fn in_edges(&self, vertex: Handle<Vertex>) -> &[Handle<Vertex>] {
        self.adjacency
            .get(self.adjacency_handle(vertex))
            .map(|adjacency| adjacency.in_edges.as_slice())
            .unwrap_or(&[])
    }

    /// Deterministic reverse post-order DFS: the visitor sees vertices in a
    /// topological order of the DAG. Returns false if a back edge makes the
    /// graph cyclic.
    pub fn visit_topological(&self, mut visit: impl FnMut(Handle<Vertex>)) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let mut colors = std::collections::HashMap::new();
        let mut post_order = Vec::with_capacity(self.vertices.len());
        let mut is_dag = true;

        // Iterative DFS with an explicit (vertex, next-edge) stack.
        let mut stack: Vec<(Handle<Vertex>, usize)> = Vec::new();

        for root in self.vertices.keys() {
            if colors.get(&root).copied().unwrap_or(Color::White) != Color::White {
                continue;
            }

            colors.insert(root, Color::Grey);
            stack.push((root, 0));

            while let Some((vertex, edge_index)) = stack.pop() {
                let out = self.out_edges(vertex);

                if edge_index < out.len() {
                    stack.push((vertex, edge_index + 1));

                    let next = out[edge_index];
                    match colors.get(&next).copied().unwrap_or(Color::White) {
                        Color::White => {
                            colors.insert(next, Color::Grey);
                            stack.push((next, 0));
                        }
                        Color::Grey => {
                            is_dag = false;
                        }
                        Color::Black => {}
                    }
                } else {
                    colors.insert(vertex, Color::Black);
                    post_order.push(vertex);
                }
            }
        }

        if !is_dag {
            return false;
        }

        for vertex in post_order.into_iter().rev() {
            visit(vertex);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(t: &mut Topology) -> Handle<Vertex> {
        t.add_vertex(Vertex::new(VertexKind::Node))
    }

    #[test]
    fn topological_order_respects_edges() {
        let mut t = Topology::default();
        let a = node(&mut t);
        let b = node(&mut t);
        let c = node(&mut t);
        t.add_edge(a, b);
        t.add_edge(b, c);
        t.add_edge(a, c);

        let mut order = Vec::new();
        assert!(t.visit_topological(|v| order.push(v)));

        let pos = |v| order.iter().position(|x| *x == v).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn cycle_is_detected() {
        let mut t = Topology::default();
        let a = node(&mut t);
        let b = node(&mut t);
        t.add_edge(a, b);
        t.add_edge(b, a);

        assert!(!t.visit_topological(|_| {}));
    }

    #[test]
    fn vertex_removal_detaches_edges() {
        let mut t = Topology::default();
        let a = node(&mut t);
        let b = node(&mut t);
        let c = node(&mut t);
        t.add_edge(a, b);
        t.add_edge(b, c);

        t.remove_vertex(b);

        assert!(t.out_edges(a).is_empty());
        assert!(t.in_edges(c).is_empty());
        assert_eq!(t.vertex_count(), 2);
    }
}
