//! Scene graph adjustments that run before any acceleration structure is built.

use std::collections::HashMap;

use log::debug;
use nalgebra::Matrix4;

use super::{NodeIndex, NodeKind, Scene, SceneNode, TriangleRange};
use crate::{
    error::SceneError,
    render_system::accel::{aabb::Aabb, bounds::compose_bounds},
};

// a split produces two groups, so no smaller limit can be met
pub const MIN_INSTANCE_COUNT: u32 = 2;

/// Moves the triangles of every node that has both triangles and children into a new
/// identity-transform leaf child. Nodes with the same triangle range share one new leaf.
/// Returns the number of leaves added.
pub fn split_mixed_nodes(scene: &mut Scene) -> Result<usize, SceneError> {
    let mut dummies: HashMap<TriangleRange, NodeIndex> = HashMap::new();
    let mut added = 0;

    for node in 0..scene.nodes().len() {
        if scene.node(node).kind() != NodeKind::Mixed {
            continue;
        }
        let Some(geometry) = scene.node(node).geometry else {
            continue;
        };

        let dummy = match dummies.get(&geometry) {
            Some(&dummy) => dummy,
            None => {
                let dummy = scene.push_node(SceneNode::leaf(
                    Matrix4::identity(),
                    geometry.first_index,
                    geometry.triangle_count,
                ))?;
                dummies.insert(geometry, dummy);
                added += 1;
                dummy
            }
        };

        let mut children: Vec<NodeIndex> = scene.children(node).collect();
        children.push(dummy);
        scene.set_children(node, &children)?;
        scene.set_geometry(node, None);
    }

    if added > 0 {
        debug!("split geometry out of mixed nodes into {} leaves", added);
    }
    Ok(added)
}

// splits at the mean child centroid along the longest axis of the children's union
fn split_children(items: Vec<(NodeIndex, Aabb)>) -> (Vec<(NodeIndex, Aabb)>, Vec<(NodeIndex, Aabb)>) {
    let bound = items
        .iter()
        .fold(Aabb::Empty, |acc, (_, aabb)| Aabb::union(&acc, aabb));
    let axis = bound.longest_axis();
    let split =
        items.iter().map(|(_, aabb)| aabb.centroid()[axis]).sum::<f32>() / items.len() as f32;

    let (left, right): (Vec<_>, Vec<_>) = items
        .iter()
        .copied()
        .partition(|(_, aabb)| aabb.centroid()[axis] < split);
    if left.is_empty() || right.is_empty() {
        // all centroids coincide along the axis
        let mut left = items;
        let right = left.split_off(left.len() / 2);
        (left, right)
    } else {
        (left, right)
    }
}

fn group_children(
    scene: &mut Scene,
    items: Vec<(NodeIndex, Aabb)>,
    max: usize,
    added: &mut usize,
) -> Result<NodeIndex, SceneError> {
    let children = if items.len() > max {
        let (left, right) = split_children(items);
        vec![
            group_children(scene, left, max, added)?,
            group_children(scene, right, max, added)?,
        ]
    } else {
        items.into_iter().map(|(child, _)| child).collect()
    };
    let group = scene.push_node(SceneNode::internal(Matrix4::identity(), 0, 0))?;
    scene.set_children(group, &children)?;
    *added += 1;
    Ok(group)
}

/// Gives every node at most `max_instance_count` children by pushing spatially split halves
/// of an oversized child list down into new identity-transform internal nodes. Returns the
/// number of nodes added. Requires an acyclic scene and a limit of at least
/// [`MIN_INSTANCE_COUNT`].
pub fn cap_instance_lists(scene: &mut Scene, max_instance_count: u32) -> Result<usize, SceneError> {
    if max_instance_count < MIN_INSTANCE_COUNT {
        return Err(SceneError::InstanceLimitTooSmall {
            limit: max_instance_count,
            minimum: MIN_INSTANCE_COUNT,
        });
    }
    let max = max_instance_count as usize;
    let bounds = compose_bounds(scene);
    let mut added = 0;

    for node in 0..scene.nodes().len() {
        if scene.node(node).num_children() <= max {
            continue;
        }
        let items: Vec<(NodeIndex, Aabb)> = scene
            .children(node)
            .map(|child| (child, bounds.in_parent(scene, child)))
            .collect();
        debug!("node {}: splitting {} children", node, items.len());

        let (left, right) = split_children(items);
        let children = vec![
            group_children(scene, left, max, &mut added)?,
            group_children(scene, right, max, &mut added)?,
        ];
        scene.set_children(node, &children)?;
    }

    Ok(added)
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::*;
    use crate::{
        render_system::vertex::Vertex,
        scene::{collapse::collapse_root, tests::positions},
    };

    #[test]
    fn mixed_node_geometry_moves_into_a_shared_leaf() {
        // nodes 1 and 2 both carry triangles 0..1 and child 0
        let nodes = vec![
            SceneNode::leaf(Matrix4::identity(), 3, 1),
            SceneNode {
                geometry: Some(TriangleRange {
                    first_index: 0,
                    triangle_count: 1,
                }),
                ..SceneNode::internal(Matrix4::identity(), 0, 1)
            },
            SceneNode {
                geometry: Some(TriangleRange {
                    first_index: 0,
                    triangle_count: 1,
                }),
                ..SceneNode::internal(Matrix4::identity(), 0, 1)
            },
            SceneNode::internal(Matrix4::identity(), 1, 2),
        ];
        let mut scene =
            Scene::new(positions(6), vec![0, 1, 2, 3, 4, 5], nodes, vec![0, 1, 2]).unwrap();
        assert!(matches!(scene.validate(), Err(SceneError::MixedNode { node: 1 })));

        assert_eq!(split_mixed_nodes(&mut scene).unwrap(), 1);
        assert!(scene.validate().is_ok());
        // the new leaf lands after the root
        assert_eq!(scene.root(), 3);
        assert_eq!(scene.nodes().len(), 5);
        assert_eq!(scene.children(1).collect::<Vec<_>>(), vec![0, 4]);
        assert_eq!(scene.children(2).collect::<Vec<_>>(), vec![0, 4]);
        assert_eq!(scene.triangle_indices(4), &[0, 1, 2]);
        assert_eq!(collapse_root(&scene).len(), 4);
    }

    #[test]
    fn oversized_child_lists_are_split_spatially() {
        // ten leaves spread along x under one root, cap of four
        let vertices: Vec<Vertex> = (0..30)
            .map(|i| Vertex::at([(i / 3) as f32 * 10.0 + (i % 3) as f32, (i % 2) as f32, 0.0]))
            .collect();
        let indices: Vec<u32> = (0..30).collect();
        let mut nodes: Vec<SceneNode> = (0..10)
            .map(|i| SceneNode::leaf(Matrix4::identity(), i * 3, 1))
            .collect();
        nodes.push(SceneNode::internal(Matrix4::identity(), 0, 10));
        let mut scene = Scene::new(vertices, indices, nodes, (0..10).collect()).unwrap();

        let added = cap_instance_lists(&mut scene, 4).unwrap();
        assert!(added >= 2);
        for node in scene.nodes() {
            assert!(node.num_children() <= 4);
        }
        assert!(scene.validate().is_ok());

        // every leaf is still reached exactly once, with its transform unchanged
        let mut leaves: Vec<NodeIndex> = collapse_root(&scene).iter().map(|l| l.source).collect();
        leaves.sort();
        assert_eq!(leaves, (0..10).collect::<Vec<_>>());

        // the first split separates the low-x half from the high-x half
        let root_children: Vec<NodeIndex> = scene.children(scene.root()).collect();
        let bounds = compose_bounds(&scene);
        assert!(bounds.local(root_children[0]).max().x < bounds.local(root_children[1]).min().x);
    }

    #[test]
    fn coincident_children_fall_back_to_halving() {
        let mut nodes: Vec<SceneNode> = (0..5)
            .map(|_| SceneNode::leaf(Matrix4::new_translation(&Vector3::zeros()), 0, 1))
            .collect();
        nodes.push(SceneNode::internal(Matrix4::identity(), 0, 5));
        let mut scene = Scene::new(positions(3), vec![0, 1, 2], nodes, (0..5).collect()).unwrap();

        cap_instance_lists(&mut scene, 2).unwrap();
        for node in scene.nodes() {
            assert!(node.num_children() <= 2);
        }
        assert_eq!(collapse_root(&scene).len(), 5);
    }

    #[test]
    fn instance_limit_below_two_is_rejected() {
        let mut scene = crate::scene::tests::two_leaf_scene();
        let err = cap_instance_lists(&mut scene, 1).unwrap_err();
        assert!(matches!(
            err,
            SceneError::InstanceLimitTooSmall {
                limit: 1,
                minimum: 2
            }
        ));
        assert_eq!(scene.nodes().len(), 3);
    }
}
