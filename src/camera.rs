use nalgebra::{Matrix4, Point2, Point3, Rotation3, Vector3};
use serde::Deserialize;

#[inline]
fn deg2rad(deg: f32) -> f32 {
    deg * std::f32::consts::PI / 180.0
}

// cursor travel (in pixels) per degree of rotation while dragging
const DRAG_PIXELS_PER_DEGREE: f32 = 10.0;

/// Fly camera: a position plus pitch (`rotation_x`) and yaw (`rotation_y`) in degrees.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Camera {
    pub pos: [f32; 3],
    pub rotation_x: f32,
    pub rotation_y: f32,
    // units per second
    #[serde(skip)]
    pub speed: Option<f32>,
}

/// Keys that move the camera this frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct MovementKeys {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
}

/// Everything a frame update needs to know about the user's input.
///
/// Owned by the caller and handed to [`Camera::update`] once per frame; the camera keeps no
/// input state of its own.
#[derive(Clone, Debug, Default)]
pub struct CameraInput {
    pub cursor: Point2<f32>,
    pub keys: MovementKeys,
    drag: Option<DragStart>,
}

#[derive(Clone, Copy, Debug)]
struct DragStart {
    cursor: Point2<f32>,
    rotation_x: f32,
    rotation_y: f32,
}

impl CameraInput {
    pub fn begin_drag(&mut self, camera: &Camera) {
        self.drag = Some(DragStart {
            cursor: self.cursor,
            rotation_x: camera.rotation_x,
            rotation_y: camera.rotation_y,
        });
    }

    pub fn end_drag(&mut self) {
        self.drag = None;
    }

    pub fn dragging(&self) -> bool {
        self.drag.is_some()
    }
}

impl Camera {
    pub fn new(pos: [f32; 3]) -> Camera {
        Camera {
            pos,
            ..Default::default()
        }
    }

    pub fn update(&mut self, input: &CameraInput, dt: f32) {
        if let Some(drag) = input.drag {
            self.rotation_x = drag.rotation_x - (input.cursor.y - drag.cursor.y) / DRAG_PIXELS_PER_DEGREE;
            self.rotation_y = drag.rotation_y + (input.cursor.x - drag.cursor.x) / DRAG_PIXELS_PER_DEGREE;
        }

        let dst = self.speed.unwrap_or(1.0) * dt;
        let axis = |pos: bool, neg: bool| (pos as i32 - neg as i32) as f32 * dst;
        let straight = axis(input.keys.forward, input.keys.backward);
        let sideways = axis(input.keys.right, input.keys.left);
        let up = axis(input.keys.up, input.keys.down);

        let (sin_y, cos_y) = deg2rad(self.rotation_y).sin_cos();
        self.pos[0] += sin_y * straight + cos_y * sideways;
        self.pos[1] += up;
        self.pos[2] += -cos_y * straight + sin_y * sideways;
    }

    // camera space to world space, looking down -z
    pub fn view_to_world(&self) -> Matrix4<f32> {
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), -deg2rad(self.rotation_y))
            * Rotation3::from_axis_angle(&Vector3::x_axis(), deg2rad(self.rotation_x));
        Matrix4::new_translation(&Point3::from(self.pos).coords) * rotation.to_homogeneous()
    }
}
