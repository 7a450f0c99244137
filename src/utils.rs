use nalgebra::{Matrix4, Point3, Rotation3, Vector3};

use crate::{
    camera::Camera,
    error::SceneError,
    render_system::vertex::Vertex,
    scene::{Scene, SceneNode},
};

/// Indexed box centred on `loc`: four vertices and two triangles per face.
pub fn cuboid(loc: Point3<f32>, dims: Vector3<f32>, material: u32) -> (Vec<Vertex>, Vec<u32>) {
    let fx = loc[0] - 0.5 * dims[0];
    let fy = loc[1] - 0.5 * dims[1];
    let fz = loc[2] - 0.5 * dims[2];

    let v000 = [fx, fy, fz];
    let v100 = [fx + dims[0], fy, fz];
    let v001 = [fx, fy, fz + dims[2]];
    let v101 = [fx + dims[0], fy, fz + dims[2]];
    let v010 = [fx, fy + dims[1], fz];
    let v110 = [fx + dims[0], fy + dims[1], fz];
    let v011 = [fx, fy + dims[1], fz + dims[2]];
    let v111 = [fx + dims[0], fy + dims[1], fz + dims[2]];

    // corners wound counter-clockwise seen from outside
    let faces = [
        ([v000, v001, v011, v010], [-1.0, 0.0, 0.0]),
        ([v100, v110, v111, v101], [1.0, 0.0, 0.0]),
        ([v000, v100, v101, v001], [0.0, -1.0, 0.0]),
        ([v010, v011, v111, v110], [0.0, 1.0, 0.0]),
        ([v000, v010, v110, v100], [0.0, 0.0, -1.0]),
        ([v001, v101, v111, v011], [0.0, 0.0, 1.0]),
    ];
    let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

    let mut vertexes = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (corners, normal) in faces {
        let base = vertexes.len() as u32;
        for (corner, uv) in corners.into_iter().zip(uvs) {
            vertexes.push(Vertex::new(corner, normal, uv, material));
        }
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertexes, indices)
}

pub fn unitcube() -> (Vec<Vertex>, Vec<u32>) {
    cuboid(Point3::origin(), Vector3::new(1.0, 1.0, 1.0), 0)
}

/// Small built-in scene used when no scene file is given: a ground slab, a two-cube tower
/// and a rotated instance that shares the tower's base cube.
pub fn demo_scene() -> Result<Scene, SceneError> {
    let (mut vertices, mut indices) = unitcube();
    let cube_triangles = indices.len() / 3;

    let (ground_vertices, ground_indices) =
        cuboid(Point3::new(0.0, -0.05, 0.0), Vector3::new(20.0, 0.1, 20.0), 1);
    let base = vertices.len() as u32;
    let ground_first = indices.len();
    vertices.extend(ground_vertices);
    indices.extend(ground_indices.iter().map(|i| i + base));

    let spin = Rotation3::from_axis_angle(&Vector3::y_axis(), std::f32::consts::FRAC_PI_4);
    let nodes = vec![
        // 0: cube, shared by the tower and the spinner
        SceneNode::leaf(Matrix4::identity(), 0, cube_triangles),
        // 1: ground
        SceneNode::leaf(Matrix4::identity(), ground_first, ground_indices.len() / 3),
        // 2: cube stacked on top of 0
        SceneNode::leaf(Matrix4::new_translation(&Vector3::new(0.0, 1.0, 0.0)), 0, cube_triangles),
        // 3: tower over [0, 2]
        SceneNode::internal(Matrix4::new_translation(&Vector3::new(3.0, 0.5, 0.0)), 0, 2),
        // 4: spinner over [0]
        SceneNode::internal(
            Matrix4::new_translation(&Vector3::new(-3.0, 0.5, 0.0)) * spin.to_homogeneous(),
            2,
            1,
        ),
        // 5: root over [1, 3, 4]
        SceneNode::internal(Matrix4::identity(), 3, 3),
    ];

    let mut scene = Scene::new(vertices, indices, nodes, vec![0, 2, 0, 1, 3, 4])?;
    scene.camera = Camera {
        pos: [0.0, 2.0, -8.0],
        ..Default::default()
    };
    Ok(scene)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_system::accel::aabb::Aabb;

    #[test]
    fn unitcube_is_indexed() {
        let (vertices, indices) = unitcube();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));

        let aabb = Aabb::from_positions(vertices.iter().map(|v| &v.position));
        assert_eq!(aabb.min(), Point3::new(-0.5, -0.5, -0.5));
        assert_eq!(aabb.max(), Point3::new(0.5, 0.5, 0.5));
    }

    #[test]
    fn demo_scene_is_valid() {
        let scene = demo_scene().unwrap();
        assert!(scene.validate().is_ok());
        assert_eq!(scene.root(), 5);
        assert_eq!(scene.geometry_leaf_count(), 4);
    }
}
