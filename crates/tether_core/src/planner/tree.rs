use crate::space::{distance, Configuration};

use super::to_vertex;

struct Node {
    state: Configuration,
    parent: Option<usize>,
}

/// Search tree stored as a parent-indexed arena.
#[derive(Default)]
pub(crate) struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn rooted(root: Configuration) -> Self {
        Self {
            nodes: vec![Node {
                state: root,
                parent: None,
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn state(&self, index: usize) -> &Configuration {
        &self.nodes[index].state
    }

    pub fn add(&mut self, state: Configuration, parent: usize) -> usize {
        self.nodes.push(Node {
            state,
            parent: Some(parent),
        });
        self.nodes.len() - 1
    }

    /// Linear scan; trees stay small for the budgets used here.
    pub fn nearest(&self, target: &Configuration) -> usize {
        self.nodes
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                distance(&a.state.values, &target.values)
                    .total_cmp(&distance(&b.state.values, &target.values))
            })
            .map_or(0, |(i, _)| i)
    }

    /// States from the root down to `index`.
    pub fn path_to(&self, index: usize) -> Vec<Configuration> {
        let mut path = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            path.push(self.nodes[i].state.clone());
            cursor = self.nodes[i].parent;
        }
        path.reverse();
        path
    }

    /// Appends vertices and parent edges to a diagnostics graph, offsetting
    /// indices by the vertices already present.
    pub fn export(&self, vertices: &mut Vec<Vec<f64>>, edges: &mut Vec<(usize, usize)>) {
        let offset = vertices.len();
        for (i, node) in self.nodes.iter().enumerate() {
            vertices.push(to_vertex(&node.state.values));
            if let Some(parent) = node.parent {
                edges.push((offset + parent, offset + i));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn cfg(x: f64, y: f64) -> Configuration {
        Configuration::projected(DVector::from_vec(vec![x, y]))
    }

    #[test]
    fn path_runs_from_root_to_node() {
        let mut tree = Tree::rooted(cfg(0.0, 0.0));
        let a = tree.add(cfg(1.0, 0.0), 0);
        let b = tree.add(cfg(2.0, 0.0), a);
        tree.add(cfg(0.0, 1.0), 0);

        let path = tree.path_to(b);
        let xs: Vec<f64> = path.iter().map(|c| c.values[0]).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0]);
        assert_eq!(tree.nearest(&cfg(1.9, 0.2)), b);
    }

    #[test]
    fn export_offsets_indices() {
        let mut tree = Tree::rooted(cfg(0.0, 0.0));
        tree.add(cfg(1.0, 0.0), 0);
        let mut vertices = vec![vec![9.0, 9.0]];
        let mut edges = Vec::new();
        tree.export(&mut vertices, &mut edges);
        assert_eq!(vertices.len(), 3);
        assert_eq!(edges, vec![(1, 2)]);
    }
}
