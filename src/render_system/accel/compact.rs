//! Cuts one geometry leaf out of the global buffers so a BLAS build only uploads the
//! vertices it references.

use crate::{
    error::SceneError,
    render_system::{accel::aabb::Aabb, vertex::PositionVertex},
    scene::{NodeIndex, Scene},
};

// a triangle needs three vertex slots even when its indices coincide
const MIN_VERTEX_COUNT: usize = 3;

#[derive(Clone, Debug)]
pub struct CompactedGeometry {
    pub node: NodeIndex,
    // smallest and largest vertex index referenced by the leaf in the global buffer
    pub min_index: u32,
    pub max_index: u32,
    // global vertices [min_index, max_index], padded to MIN_VERTEX_COUNT
    pub positions: Vec<PositionVertex>,
    // leaf indices minus min_index
    pub indices: Vec<u32>,
    // local-space bound of the referenced vertices
    pub bounds: Aabb,
}

impl CompactedGeometry {
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }
}

pub fn compact_geometry(scene: &Scene, node: NodeIndex) -> Result<CompactedGeometry, SceneError> {
    if !scene.node(node).is_geometry_leaf() {
        return Err(SceneError::EmptyGeometry {
            node,
            index_buffer_index: scene
                .node(node)
                .geometry
                .map_or(-1, |g| g.first_index as i32),
        });
    }

    let source = scene.triangle_indices(node);
    let (min_index, max_index) = source
        .iter()
        .fold((u32::MAX, 0), |(lo, hi), &i| (lo.min(i), hi.max(i)));

    let vertices = scene.vertices();
    let mut positions: Vec<PositionVertex> = vertices[min_index as usize..=max_index as usize]
        .iter()
        .map(|v| PositionVertex {
            position: v.position,
        })
        .collect();
    while positions.len() < MIN_VERTEX_COUNT {
        positions.push(positions[positions.len() - 1]);
    }

    let indices: Vec<u32> = source.iter().map(|&i| i - min_index).collect();
    let bounds = Aabb::from_positions(source.iter().map(|&i| &vertices[i as usize].position));

    Ok(CompactedGeometry {
        node,
        min_index,
        max_index,
        positions,
        indices,
        bounds,
    })
}
