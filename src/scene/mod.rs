//! Flat-array scene graph: vertices, triangle indices, nodes and the node index table that
//! names each internal node's children.
//!
//! Nodes live in an arena and are addressed by [`NodeIndex`]. Traversal always takes a
//! `(scene, index)` pair; nothing holds a reference to a node across a mutation.

pub mod collapse;
pub mod prepare;

use std::{ops::Range, path::Path};

use nalgebra::Matrix4;
use serde::Deserialize;

use crate::{camera::Camera, error::SceneError, render_system::vertex::Vertex};

pub type NodeIndex = usize;

/// Contiguous run of triangles in the global index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TriangleRange {
    // offset of the first index (not triangle)
    pub first_index: usize,
    pub triangle_count: usize,
}

impl TriangleRange {
    pub fn indices(&self) -> Range<usize> {
        self.first_index..self.first_index + self.triangle_count * 3
    }
}

/// Contiguous run of entries in the node index table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildRange {
    pub start: usize,
    pub count: usize,
}

impl ChildRange {
    pub fn slots(&self) -> Range<usize> {
        self.start..self.start + self.count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    // references triangles only
    GeometryLeaf,
    // references children only
    Internal,
    // references both, must be split before building
    Mixed,
    // references nothing, always rejected
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SceneNode {
    // local transform, parent space from node space
    pub transform: Matrix4<f32>,
    pub geometry: Option<TriangleRange>,
    pub children: Option<ChildRange>,
    // longest distance from the root, written by `Scene::assign_levels`
    pub level: u32,
    // own triangles plus all descendants' triangles
    pub total_primitive_count: u64,
}

impl SceneNode {
    pub fn leaf(transform: Matrix4<f32>, first_index: usize, triangle_count: usize) -> SceneNode {
        SceneNode {
            transform,
            geometry: Some(TriangleRange {
                first_index,
                triangle_count,
            }),
            children: None,
            level: 0,
            total_primitive_count: triangle_count as u64,
        }
    }

    pub fn internal(transform: Matrix4<f32>, children_index: usize, num_children: usize) -> SceneNode {
        SceneNode {
            transform,
            geometry: None,
            children: Some(ChildRange {
                start: children_index,
                count: num_children,
            }),
            level: 0,
            total_primitive_count: 0,
        }
    }

    pub fn kind(&self) -> NodeKind {
        let has_geometry = self.geometry.map_or(false, |g| g.triangle_count > 0);
        let has_children = self.children.map_or(false, |c| c.count > 0);
        match (has_geometry, has_children) {
            (true, false) => NodeKind::GeometryLeaf,
            (false, true) => NodeKind::Internal,
            (true, true) => NodeKind::Mixed,
            (false, false) => NodeKind::Empty,
        }
    }

    pub fn is_geometry_leaf(&self) -> bool {
        self.kind() == NodeKind::GeometryLeaf
    }

    pub fn num_triangles(&self) -> usize {
        self.geometry.map_or(0, |g| g.triangle_count)
    }

    pub fn num_children(&self) -> usize {
        self.children.map_or(0, |c| c.count)
    }

    // raw integer fields as stored in scene files, -1 / 0 meaning "absent"
    fn from_file(node: NodeIndex, file: &NodeFile) -> Result<SceneNode, SceneError> {
        let geometry = match (file.index_buffer_index, file.num_triangles) {
            (i, 0) if i < 0 => None,
            (i, 0) => {
                return Err(SceneError::EmptyGeometry {
                    node,
                    index_buffer_index: i,
                })
            }
            (i, n) if i < 0 || n < 0 => {
                return Err(SceneError::MissingIndexBuffer {
                    node,
                    num_triangles: n,
                })
            }
            (i, n) => Some(TriangleRange {
                first_index: i as usize,
                triangle_count: n as usize,
            }),
        };
        let children = match file.num_children {
            0 => None,
            n if n < 0 || file.children_index < 0 => {
                return Err(SceneError::NegativeChildCount {
                    node,
                    num_children: n,
                })
            }
            n => Some(ChildRange {
                start: file.children_index as usize,
                count: n as usize,
            }),
        };
        Ok(SceneNode {
            // files store rows, nalgebra stores columns
            transform: Matrix4::from_fn(|r, c| file.transform[r][c]),
            geometry,
            children,
            level: 0,
            total_primitive_count: 0,
        })
    }
}

fn no_index_buffer() -> i32 {
    -1
}

#[derive(Deserialize)]
struct NodeFile {
    transform: [[f32; 4]; 4],
    #[serde(default = "no_index_buffer")]
    index_buffer_index: i32,
    #[serde(default)]
    num_triangles: i32,
    #[serde(default)]
    num_children: i32,
    #[serde(default)]
    children_index: i32,
}

#[derive(Deserialize)]
struct SceneFile {
    #[serde(default)]
    camera: Camera,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    nodes: Vec<NodeFile>,
    #[serde(default)]
    node_indices: Vec<u32>,
}

/// The loaded scene. Every range stored in a node is checked against the arrays on
/// construction, so accessors index without further bounds handling.
#[derive(Clone, Debug)]
pub struct Scene {
    pub camera: Camera,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    nodes: Vec<SceneNode>,
    node_indices: Vec<u32>,
    root: NodeIndex,
}

impl Scene {
    /// Takes ownership of the flat arrays. The root is the last node.
    ///
    /// Preparation passes append nodes with [`Scene::push_node`], so in a prepared scene the
    /// root is no longer necessarily last. Always address it through [`Scene::root`].
    pub fn new(
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        nodes: Vec<SceneNode>,
        node_indices: Vec<u32>,
    ) -> Result<Scene, SceneError> {
        let root = nodes.len().checked_sub(1).ok_or(SceneError::Empty)?;
        let scene = Scene {
            camera: Camera::default(),
            vertices,
            indices,
            nodes,
            node_indices,
            root,
        };
        for node in 0..scene.nodes.len() {
            scene.check_ranges(node)?;
        }
        Ok(scene)
    }

    pub fn load(path: &Path) -> Result<Scene, SceneError> {
        let text = std::fs::read_to_string(path).map_err(|source| SceneError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Scene, SceneError> {
        let file: SceneFile = serde_json::from_str(text)?;
        let nodes = file
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| SceneNode::from_file(i, node))
            .collect::<Result<Vec<_>, _>>()?;
        let mut scene = Scene::new(file.vertices, file.indices, nodes, file.node_indices)?;
        scene.camera = file.camera;
        Ok(scene)
    }

    fn check_ranges(&self, node: NodeIndex) -> Result<(), SceneError> {
        let n = &self.nodes[node];
        if let Some(children) = n.children {
            let slots = children.slots();
            if slots.end > self.node_indices.len() {
                return Err(SceneError::ChildrenOutOfBounds {
                    node,
                    start: slots.start,
                    end: slots.end,
                    len: self.node_indices.len(),
                });
            }
            for slot in slots {
                let child = self.node_indices[slot];
                if child as usize >= self.nodes.len() {
                    return Err(SceneError::ChildOutOfRange {
                        node,
                        slot,
                        child,
                        count: self.nodes.len(),
                    });
                }
            }
        }
        if let Some(geometry) = n.geometry {
            if geometry.triangle_count == 0 {
                return Err(SceneError::EmptyGeometry {
                    node,
                    index_buffer_index: geometry.first_index as i32,
                });
            }
            let range = geometry.indices();
            if range.end > self.indices.len() {
                return Err(SceneError::TrianglesOutOfBounds {
                    node,
                    start: range.start,
                    end: range.end,
                    len: self.indices.len(),
                });
            }
            for position in range {
                let vertex = self.indices[position];
                if vertex as usize >= self.vertices.len() {
                    return Err(SceneError::VertexOutOfRange {
                        node,
                        position,
                        vertex,
                        count: self.vertices.len(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn node(&self, index: NodeIndex) -> &SceneNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[SceneNode] {
        &self.nodes
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn node_indices(&self) -> &[u32] {
        &self.node_indices
    }

    pub fn children(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        let slots = self.nodes[index].children.map_or(0..0, |c| c.slots());
        self.node_indices[slots].iter().map(|&child| child as usize)
    }

    pub fn triangle_indices(&self, index: NodeIndex) -> &[u32] {
        match self.nodes[index].geometry {
            Some(geometry) => &self.indices[geometry.indices()],
            None => &[],
        }
    }

    /// Appends a node after every existing one. The root index does not change, so the root
    /// stops being the last node.
    pub fn push_node(&mut self, node: SceneNode) -> Result<NodeIndex, SceneError> {
        let index = self.nodes.len();
        self.nodes.push(node);
        if let Err(err) = self.check_ranges(index) {
            self.nodes.pop();
            return Err(err);
        }
        Ok(index)
    }

    /// Replaces a node's child list. The new list is appended to the node index table; the
    /// old entries stay in place since other nodes may share them.
    pub fn set_children(&mut self, index: NodeIndex, children: &[NodeIndex]) -> Result<(), SceneError> {
        if let Some(slot) = children.iter().position(|&c| c >= self.nodes.len()) {
            return Err(SceneError::ChildOutOfRange {
                node: index,
                slot,
                child: children[slot] as u32,
                count: self.nodes.len(),
            });
        }
        let start = self.node_indices.len();
        self.node_indices.extend(children.iter().map(|&c| c as u32));
        self.nodes[index].children = match children.len() {
            0 => None,
            count => Some(ChildRange { start, count }),
        };
        Ok(())
    }

    pub fn set_geometry(&mut self, index: NodeIndex, geometry: Option<TriangleRange>) {
        self.nodes[index].geometry = geometry;
    }

    /// Rejects cycles and nodes that are not exactly one of leaf / internal, for every node
    /// reachable from the root.
    pub fn validate(&self) -> Result<(), SceneError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        fn visit(scene: &Scene, node: NodeIndex, marks: &mut [Mark]) -> Result<(), SceneError> {
            match marks[node] {
                Mark::Done => return Ok(()),
                Mark::OnPath => return Err(SceneError::Cycle { node }),
                Mark::Unvisited => {}
            }
            match scene.nodes[node].kind() {
                NodeKind::Empty => return Err(SceneError::EmptyNode { node }),
                NodeKind::Mixed => return Err(SceneError::MixedNode { node }),
                NodeKind::GeometryLeaf | NodeKind::Internal => {}
            }
            marks[node] = Mark::OnPath;
            for child in scene.children(node) {
                visit(scene, child, marks)?;
            }
            marks[node] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        visit(self, self.root, &mut marks)
    }

    /// Number of geometry leaves reached from the root, counting a shared leaf once per path.
    pub fn geometry_leaf_count(&self) -> usize {
        fn count(scene: &Scene, node: NodeIndex) -> usize {
            if scene.nodes[node].is_geometry_leaf() {
                1
            } else {
                scene.children(node).map(|child| count(scene, child)).sum()
            }
        }
        count(self, self.root)
    }

    /// Writes `level` (longest path from the root) and `total_primitive_count` for every
    /// reachable node. Requires an acyclic scene.
    pub fn assign_levels(&mut self) {
        fn depth_recursion(scene: &mut Scene, node: NodeIndex) {
            let children: Vec<NodeIndex> = scene.children(node).collect();
            for &child in &children {
                if scene.nodes[node].level >= scene.nodes[child].level {
                    scene.nodes[child].level = scene.nodes[node].level + 1;
                    depth_recursion(scene, child);
                }
            }
            let own = scene.nodes[node].num_triangles() as u64;
            scene.nodes[node].total_primitive_count = own
                + children
                    .iter()
                    .map(|&c| scene.nodes[c].total_primitive_count)
                    .sum::<u64>();
        }

        for node in self.nodes.iter_mut() {
            node.level = 0;
        }
        let root = self.root;
        depth_recursion(self, root);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn positions(count: usize) -> Vec<Vertex> {
        (0..count).map(|i| Vertex::at([i as f32, 0.0, 0.0])).collect()
    }

    // root (internal, 2 children) -> A: triangles [4,5,6, 5,6,7], B: triangles [0,1,2]
    pub(crate) fn two_leaf_scene() -> Scene {
        let nodes = vec![
            SceneNode::leaf(Matrix4::new_translation(&[1.0, 0.0, 0.0].into()), 0, 2),
            SceneNode::leaf(Matrix4::identity(), 6, 1),
            SceneNode::internal(Matrix4::identity(), 0, 2),
        ];
        Scene::new(positions(8), vec![4, 5, 6, 5, 6, 7, 0, 1, 2], nodes, vec![0, 1]).unwrap()
    }

    #[test]
    fn root_is_last_node() {
        let scene = two_leaf_scene();
        assert_eq!(scene.root(), 2);
        assert_eq!(scene.children(2).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(scene.triangle_indices(0), &[4, 5, 6, 5, 6, 7]);
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn empty_scene_is_rejected() {
        let err = Scene::new(vec![], vec![], vec![], vec![]).unwrap_err();
        assert!(matches!(err, SceneError::Empty));
    }

    #[test]
    fn out_of_range_child_names_the_node() {
        let nodes = vec![
            SceneNode::leaf(Matrix4::identity(), 0, 1),
            SceneNode::internal(Matrix4::identity(), 0, 1),
        ];
        let err = Scene::new(positions(3), vec![0, 1, 2], nodes, vec![7]).unwrap_err();
        assert!(matches!(
            err,
            SceneError::ChildOutOfRange {
                node: 1,
                child: 7,
                ..
            }
        ));
    }

    #[test]
    fn out_of_range_triangles_are_rejected() {
        let nodes = vec![SceneNode::leaf(Matrix4::identity(), 3, 1)];
        let err = Scene::new(positions(3), vec![0, 1, 2], nodes, vec![]).unwrap_err();
        assert!(matches!(err, SceneError::TrianglesOutOfBounds { node: 0, .. }));
    }

    #[test]
    fn out_of_range_vertex_is_rejected() {
        let nodes = vec![SceneNode::leaf(Matrix4::identity(), 0, 1)];
        let err = Scene::new(positions(3), vec![0, 1, 9], nodes, vec![]).unwrap_err();
        assert!(matches!(
            err,
            SceneError::VertexOutOfRange {
                node: 0,
                position: 2,
                vertex: 9,
                ..
            }
        ));
    }

    #[test]
    fn leaf_with_zero_triangles_is_rejected() {
        let nodes = vec![SceneNode::leaf(Matrix4::identity(), 0, 0)];
        let err = Scene::new(positions(3), vec![0, 1, 2], nodes, vec![]).unwrap_err();
        assert!(matches!(err, SceneError::EmptyGeometry { node: 0, .. }));
    }

    #[test]
    fn cycles_are_rejected() {
        let nodes = vec![
            SceneNode::leaf(Matrix4::identity(), 0, 1),
            SceneNode::internal(Matrix4::identity(), 0, 2),
            SceneNode::internal(Matrix4::identity(), 2, 1),
        ];
        // 2 -> 1 -> {0, 1}
        let scene = Scene::new(positions(3), vec![0, 1, 2], nodes, vec![0, 1, 1]).unwrap();
        assert!(matches!(scene.validate(), Err(SceneError::Cycle { node: 1 })));
    }

    #[test]
    fn node_without_content_is_rejected() {
        let nodes = vec![
            SceneNode::internal(Matrix4::identity(), 0, 0),
            SceneNode::internal(Matrix4::identity(), 0, 1),
        ];
        let scene = Scene::new(vec![], vec![], nodes, vec![0]).unwrap();
        assert!(matches!(scene.validate(), Err(SceneError::EmptyNode { node: 0 })));
    }

    #[test]
    fn levels_take_the_longest_path() {
        // 3 -> {0, 2}, 2 -> {0, 1}
        let nodes = vec![
            SceneNode::leaf(Matrix4::identity(), 0, 1),
            SceneNode::leaf(Matrix4::identity(), 3, 2),
            SceneNode::internal(Matrix4::identity(), 2, 2),
            SceneNode::internal(Matrix4::identity(), 0, 2),
        ];
        let mut scene =
            Scene::new(positions(4), vec![0, 1, 2, 1, 2, 3, 0, 2, 3], nodes, vec![0, 2, 0, 1]).unwrap();
        scene.assign_levels();
        let levels: Vec<u32> = scene.nodes().iter().map(|n| n.level).collect();
        assert_eq!(levels, vec![2, 2, 1, 0]);
        assert_eq!(scene.node(2).total_primitive_count, 3);
        assert_eq!(scene.node(3).total_primitive_count, 4);
        assert_eq!(scene.geometry_leaf_count(), 3);
    }

    #[test]
    fn json_transforms_are_row_major() {
        let text = r#"{
            "vertices": [
                { "position": [0, 0, 0] },
                { "position": [1, 0, 0] },
                { "position": [0, 1, 0] }
            ],
            "indices": [0, 1, 2],
            "nodes": [
                {
                    "transform": [[1, 0, 0, 5], [0, 1, 0, 6], [0, 0, 1, 7], [0, 0, 0, 1]],
                    "index_buffer_index": 0,
                    "num_triangles": 1
                },
                {
                    "transform": [[1, 0, 0, 0], [0, 1, 0, 0], [0, 0, 1, 0], [0, 0, 0, 1]],
                    "num_children": 1,
                    "children_index": 0
                }
            ],
            "node_indices": [0]
        }"#;
        let scene = Scene::from_json(text).unwrap();
        assert_eq!(scene.root(), 1);
        assert_eq!(scene.node(0).transform[(0, 3)], 5.0);
        assert_eq!(scene.node(0).transform[(2, 3)], 7.0);
        assert_eq!(scene.node(0).kind(), NodeKind::GeometryLeaf);
        assert_eq!(scene.node(1).kind(), NodeKind::Internal);
    }

    #[test]
    fn json_geometry_offset_without_triangles_is_rejected() {
        let text = r#"{
            "vertices": [],
            "indices": [],
            "nodes": [{
                "transform": [[1, 0, 0, 0], [0, 1, 0, 0], [0, 0, 1, 0], [0, 0, 0, 1]],
                "index_buffer_index": 3
            }]
        }"#;
        let err = Scene::from_json(text).unwrap_err();
        assert!(matches!(
            err,
            SceneError::EmptyGeometry {
                node: 0,
                index_buffer_index: 3
            }
        ));
    }
}
