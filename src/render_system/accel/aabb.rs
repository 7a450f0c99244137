use nalgebra::{Matrix4, Point3};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aabb {
    Empty,
    NonEmpty { min: Point3<f32>, max: Point3<f32> },
}

impl Aabb {
    pub fn from_points(points: &[Point3<f32>]) -> Aabb {
        if points.len() == 0 {
            Aabb::Empty
        } else {
            let mut min = points[0];
            let mut max = points[0];
            for point in points {
                min = min.inf(point);
                max = max.sup(point);
            }
            Aabb::NonEmpty { min, max }
        }
    }

    pub fn from_positions<'a>(positions: impl IntoIterator<Item = &'a [f32; 3]>) -> Aabb {
        positions.into_iter().fold(Aabb::Empty, |aabb, p| {
            Aabb::union(&aabb, &Aabb::NonEmpty {
                min: Point3::from(*p),
                max: Point3::from(*p),
            })
        })
    }

    pub fn union(a: &Aabb, b: &Aabb) -> Aabb {
        match (a, b) {
            (Aabb::Empty, _) => *b,
            (_, Aabb::Empty) => *a,
            (
                Aabb::NonEmpty {
                    min: amin,
                    max: amax,
                },
                Aabb::NonEmpty {
                    min: bmin,
                    max: bmax,
                },
            ) => Aabb::NonEmpty {
                min: amin.inf(bmin),
                max: amax.sup(bmax),
            },
        }
    }

    pub fn min(&self) -> Point3<f32> {
        match self {
            Aabb::Empty => Point3::origin(),
            Aabb::NonEmpty { min, .. } => *min,
        }
    }

    pub fn max(&self) -> Point3<f32> {
        match self {
            Aabb::Empty => Point3::origin(),
            Aabb::NonEmpty { max, .. } => *max,
        }
    }

    pub fn centroid(&self) -> Point3<f32> {
        match self {
            Aabb::Empty => Point3::origin(),
            Aabb::NonEmpty { min, max } => Point3::from((min.coords + max.coords) / 2.0),
        }
    }

    // 0 == x, 1 == y, 2 == z
    pub fn longest_axis(&self) -> usize {
        let extent = self.max() - self.min();
        if extent.y > extent.x || extent.z > extent.x {
            if extent.y > extent.z {
                1
            } else {
                2
            }
        } else {
            0
        }
    }

    /// Tightest box around all eight transformed corners. Valid for any affine transform,
    /// rotations included.
    pub fn transform(&self, transform: &Matrix4<f32>) -> Aabb {
        match self {
            Aabb::Empty => Aabb::Empty,
            Aabb::NonEmpty { min, max } => {
                let corners = [
                    transform.transform_point(min),
                    transform.transform_point(&Point3::new(min.x, min.y, max.z)),
                    transform.transform_point(&Point3::new(min.x, max.y, min.z)),
                    transform.transform_point(&Point3::new(min.x, max.y, max.z)),
                    transform.transform_point(&Point3::new(max.x, min.y, min.z)),
                    transform.transform_point(&Point3::new(max.x, min.y, max.z)),
                    transform.transform_point(&Point3::new(max.x, max.y, min.z)),
                    transform.transform_point(max),
                ];
                Aabb::from_points(&corners)
            }
        }
    }
}
