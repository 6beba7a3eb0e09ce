//! View frustum used for tile culling

use crate::core::types::{Mat4, Vec3, Vec4};
use super::aabb::Aabb;

/// A plane in Hessian normal form
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Result of classifying a box against the frustum
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Intersecting,
    Inside,
}

/// 6-plane frustum extracted from a view-projection matrix
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6], // left, right, bottom, top, near, far
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix (Gribb/Hartmann).
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];
        let raw: [Vec4; 6] = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            rows[3] + rows[2],
            rows[3] - rows[2],
        ];

        let mut planes = [Plane::new(Vec3::ZERO, 0.0); 6];
        for (plane, r) in planes.iter_mut().zip(raw.iter()) {
            let normal = r.truncate();
            let len = normal.length();
            if len > 0.0 {
                *plane = Plane::new(normal / len, r.w / len);
            }
        }
        Self { planes }
    }

    /// Classify an AABB against all six planes.
    pub fn classify(&self, aabb: &Aabb) -> Containment {
        let mut inside = true;
        for plane in &self.planes {
            // p-vertex: corner furthest along the normal; n-vertex: the opposite one
            let p = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            let n = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabb.min, aabb.max);

            if plane.distance_to_point(p) < 0.0 {
                return Containment::Outside;
            }
            if plane.distance_to_point(n) < 0.0 {
                inside = false;
            }
        }
        if inside { Containment::Inside } else { Containment::Intersecting }
    }

    /// Conservative intersection test
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.classify(aabb) != Containment::Outside
    }
}
