//! Bounding volumes composed up the node hierarchy.
//!
//! A node's local bound is the bound of its own triangles unioned with every child's bound
//! moved into the node's frame by the child's transform. Moving a bound between frames
//! always goes through [`Aabb::transform`], which keeps it tight under rotation.

use crate::{
    render_system::accel::aabb::Aabb,
    scene::{NodeIndex, Scene},
};

#[derive(Clone, Debug)]
pub struct NodeBounds {
    // indexed by node, Empty for nodes not reachable from the root
    local: Vec<Aabb>,
}

impl NodeBounds {
    /// Bound of the node's content in its own frame.
    pub fn local(&self, node: NodeIndex) -> Aabb {
        self.local[node]
    }

    /// Bound of the node's content in its parent's frame.
    pub fn in_parent(&self, scene: &Scene, node: NodeIndex) -> Aabb {
        self.local[node].transform(&scene.node(node).transform)
    }

    /// Bound of the whole scene in world space.
    pub fn world(&self, scene: &Scene) -> Aabb {
        self.in_parent(scene, scene.root())
    }
}

fn geometry_bounds(scene: &Scene, node: NodeIndex) -> Aabb {
    let vertices = scene.vertices();
    Aabb::from_positions(
        scene
            .triangle_indices(node)
            .iter()
            .map(|&i| &vertices[i as usize].position),
    )
}

/// Computes every reachable node's local bound, children first. Requires an acyclic scene.
pub fn compose_bounds(scene: &Scene) -> NodeBounds {
    fn visit(scene: &Scene, node: NodeIndex, local: &mut [Option<Aabb>]) -> Aabb {
        if let Some(aabb) = local[node] {
            return aabb;
        }
        let mut aabb = geometry_bounds(scene, node);
        for child in scene.children(node) {
            let child_local = visit(scene, child, local);
            aabb = Aabb::union(&aabb, &child_local.transform(&scene.node(child).transform));
        }
        local[node] = Some(aabb);
        aabb
    }

    let mut local = vec![None; scene.nodes().len()];
    visit(scene, scene.root(), &mut local);
    NodeBounds {
        local: local.into_iter().map(|a| a.unwrap_or(Aabb::Empty)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;

    use nalgebra::{Matrix4, Point3, Rotation3, Vector3};

    use super::*;
    use crate::{
        render_system::vertex::Vertex,
        scene::{tests::two_leaf_scene, SceneNode},
    };

    fn close(a: Point3<f32>, b: Point3<f32>) -> bool {
        (a - b).abs().max() < 1e-5
    }

    #[test]
    fn child_bounds_are_moved_into_the_parent_frame() {
        let scene = two_leaf_scene();
        let bounds = compose_bounds(&scene);

        // A spans x 4..7 and is translated by +1
        assert!(close(bounds.in_parent(&scene, 0).min(), Point3::new(5.0, 0.0, 0.0)));
        // B spans x 0..2 untransformed
        assert!(close(bounds.local(1).max(), Point3::new(2.0, 0.0, 0.0)));

        let root = bounds.local(scene.root());
        assert!(close(root.min(), Point3::new(0.0, 0.0, 0.0)));
        assert!(close(root.max(), Point3::new(8.0, 0.0, 0.0)));
    }

    #[test]
    fn nested_rotation_is_applied_through_every_level() {
        let vertices = vec![
            Vertex::at([0.0, 0.0, 0.0]),
            Vertex::at([1.0, 0.0, 0.0]),
            Vertex::at([0.0, 1.0, 0.0]),
        ];
        let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2).to_homogeneous();
        let nodes = vec![
            SceneNode::leaf(Matrix4::new_translation(&Vector3::new(2.0, 0.0, 0.0)), 0, 1),
            SceneNode::internal(rotation, 0, 1),
            SceneNode::internal(Matrix4::identity(), 1, 1),
        ];
        let scene = Scene::new(vertices, vec![0, 1, 2], nodes, vec![0, 1]).unwrap();
        let bounds = compose_bounds(&scene);

        // leaf spans x 2..3, y 0..1 in node 1's frame; rotating by 90 degrees maps it to
        // x -1..0, y 2..3
        let world = bounds.world(&scene);
        assert!(close(world.min(), Point3::new(-1.0, 2.0, 0.0)));
        assert!(close(world.max(), Point3::new(0.0, 3.0, 0.0)));
    }
}
