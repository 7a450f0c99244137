//! Single-level preparation: folds every ancestor transform into the geometry leaves so the
//! whole scene can be represented by one TLAS over one BLAS per leaf.

use nalgebra::Matrix4;

use super::{NodeIndex, Scene, SceneNode};
use crate::error::SceneError;

/// One geometry leaf with every ancestor transform applied, parent to child.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatNode {
    pub source: NodeIndex,
    pub transform: Matrix4<f32>,
}

/// Appends the flattened leaves below `node` to `out`. `accumulated` is the transform of
/// everything above `node`.
pub fn collapse(scene: &Scene, node: NodeIndex, accumulated: &Matrix4<f32>, out: &mut Vec<FlatNode>) {
    let transform = accumulated * scene.node(node).transform;
    if scene.node(node).is_geometry_leaf() {
        out.push(FlatNode {
            source: node,
            transform,
        });
    } else {
        for child in scene.children(node) {
            collapse(scene, child, &transform, out);
        }
    }
}

/// Flattens the leaves reachable from the root, in depth-first order.
pub fn collapse_root(scene: &Scene) -> Vec<FlatNode> {
    let mut out = Vec::with_capacity(scene.geometry_leaf_count());
    collapse(scene, scene.root(), &Matrix4::identity(), &mut out);
    out
}

/// Rebuilds the scene as an identity root whose children are the flattened leaves. The
/// vertex and index buffers are carried over untouched.
pub fn collapse_parent_nodes(scene: Scene) -> Result<Scene, SceneError> {
    scene.validate()?;
    let leaves = collapse_root(&scene);

    let mut nodes: Vec<SceneNode> = leaves
        .iter()
        .map(|leaf| SceneNode {
            transform: leaf.transform,
            ..scene.node(leaf.source).clone()
        })
        .collect();
    nodes.push(SceneNode::internal(Matrix4::identity(), 0, leaves.len()));
    let node_indices = (0..leaves.len() as u32).collect();

    let Scene {
        camera,
        vertices,
        indices,
        ..
    } = scene;
    let mut flattened = Scene::new(vertices, indices, nodes, node_indices)?;
    flattened.camera = camera;
    flattened.assign_levels();
    Ok(flattened)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::f32::consts::FRAC_PI_2;

    use nalgebra::{Rotation3, Vector3};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::scene::tests::{positions, two_leaf_scene};

    pub(crate) fn max_difference(a: &Matrix4<f32>, b: &Matrix4<f32>) -> f32 {
        (a - b).abs().max()
    }

    /// Random tree with nodes stored children-first so the root ends up last.
    pub(crate) fn random_tree(rng: &mut StdRng, depth: u32) -> Scene {
        fn grow(
            rng: &mut StdRng,
            depth: u32,
            nodes: &mut Vec<SceneNode>,
            node_indices: &mut Vec<u32>,
            indices: &mut Vec<u32>,
        ) -> u32 {
            let transform: Matrix4<f32> = Matrix4::new_translation(&Vector3::new(
                rng.random_range(-5.0..5.0),
                rng.random_range(-5.0..5.0),
                rng.random_range(-5.0..5.0),
            )) * Rotation3::from_axis_angle(&Vector3::z_axis(), rng.random_range(0.0..6.0))
                .to_homogeneous();

            if depth == 0 || rng.random_bool(0.3) {
                let triangles = rng.random_range(1..4);
                let first = indices.len();
                for _ in 0..triangles * 3 {
                    indices.push(rng.random_range(0..16));
                }
                nodes.push(SceneNode::leaf(transform, first, triangles));
            } else {
                let children: Vec<u32> = (0..rng.random_range(1..4))
                    .map(|_| grow(rng, depth - 1, nodes, node_indices, indices))
                    .collect();
                let start = node_indices.len();
                node_indices.extend(&children);
                nodes.push(SceneNode::internal(transform, start, children.len()));
            }
            nodes.len() as u32 - 1
        }

        let mut nodes = vec![];
        let mut node_indices = vec![];
        let mut indices = vec![];
        grow(rng, depth, &mut nodes, &mut node_indices, &mut indices);
        Scene::new(positions(16), indices, nodes, node_indices).unwrap()
    }

    #[test]
    fn root_with_two_leaves_collapses_to_two_entries() {
        let scene = two_leaf_scene();
        let leaves = collapse_root(&scene);
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].source, 0);
        assert_eq!(leaves[1].source, 1);
    }

    #[test]
    fn parent_transform_left_multiplies_child() {
        let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2).to_homogeneous();
        let translation = Matrix4::new_translation(&Vector3::new(1.0, 0.0, 0.0));
        let nodes = vec![
            SceneNode::leaf(translation, 0, 1),
            SceneNode::internal(rotation, 0, 1),
        ];
        let scene = Scene::new(positions(3), vec![0, 1, 2], nodes, vec![0]).unwrap();

        let leaves = collapse_root(&scene);
        assert_eq!(leaves.len(), 1);
        assert!(max_difference(&leaves[0].transform, &(rotation * translation)) < 1e-6);

        // the translation is rotated onto +y rather than added along +x
        let origin = leaves[0].transform.transform_point(&[0.0, 0.0, 0.0].into());
        assert!((origin.x - 0.0).abs() < 1e-6);
        assert!((origin.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn collapsed_scene_keeps_geometry_and_drops_hierarchy() {
        let flattened = collapse_parent_nodes(two_leaf_scene()).unwrap();
        assert_eq!(flattened.nodes().len(), 3);
        let root = flattened.root();
        assert_eq!(flattened.node(root).transform, Matrix4::identity());
        for child in flattened.children(root) {
            assert!(flattened.node(child).is_geometry_leaf());
        }
        assert_eq!(flattened.triangle_indices(0), &[4, 5, 6, 5, 6, 7]);
        assert_eq!(flattened.triangle_indices(1), &[0, 1, 2]);
    }

    #[test]
    fn collapse_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let once = collapse_parent_nodes(random_tree(&mut rng, 4)).unwrap();
            let first = collapse_root(&once);
            let twice = collapse_parent_nodes(once).unwrap();
            let second = collapse_root(&twice);

            assert_eq!(first.len(), second.len());
            for (a, b) in first.iter().zip(&second) {
                assert_eq!(a.source, b.source);
                assert!(max_difference(&a.transform, &b.transform) < 1e-5);
            }
        }
    }

    #[test]
    fn collapse_emits_one_entry_per_leaf() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let scene = random_tree(&mut rng, 5);
            let leaves = scene
                .nodes()
                .iter()
                .filter(|node| node.is_geometry_leaf())
                .count();
            assert_eq!(collapse_root(&scene).len(), leaves);
            assert_eq!(collapse_parent_nodes(scene).unwrap().nodes().len(), leaves + 1);
        }
    }
}
