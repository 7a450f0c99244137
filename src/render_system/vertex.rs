use serde::Deserialize;
use vulkano::buffer::BufferContents;

/// A scene vertex as it is laid out in the global vertex buffer (48 bytes).
#[derive(Clone, Copy, Debug, BufferContents, Default, Deserialize, PartialEq)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    #[serde(default)]
    pub tex_x: f32,
    #[serde(default)]
    pub normal: [f32; 3],
    #[serde(default)]
    pub tex_y: f32,
    #[serde(default)]
    pub material: u32,
    #[serde(skip)]
    pub _pad: [u32; 3],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2], material: u32) -> Vertex {
        Vertex {
            position,
            tex_x: uv[0],
            normal,
            tex_y: uv[1],
            material,
            _pad: [0; 3],
        }
    }

    pub fn at(position: [f32; 3]) -> Vertex {
        Vertex {
            position,
            ..Default::default()
        }
    }
}

/// Tightly packed position consumed by the bottom level build.
#[derive(Clone, Copy, Debug, BufferContents, Default, PartialEq)]
#[repr(C)]
pub struct PositionVertex {
    pub position: [f32; 3],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_stride_is_padded_for_gpu_alignment() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(std::mem::size_of::<Vertex>() % 16, 0);
        assert_eq!(std::mem::size_of::<PositionVertex>(), 12);
    }
}
