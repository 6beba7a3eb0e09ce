//! View-dependent queries used for LOD selection

use crate::core::types::{Mat4, Vec3};
use crate::math::{Aabb, Frustum};

/// View/frustum service consumed by tile traversal
pub trait ViewContext {
    /// Whether `bounds` (tile space), placed in the world by `transform`,
    /// intersects the culling volume.
    fn is_visible(&self, bounds: &Aabb, transform: &Mat4) -> bool;

    /// World-space size covered by one pixel at `point` (world space).
    fn pixel_size_at(&self, point: Vec3) -> f32;
}

/// Perspective camera view
#[derive(Clone, Debug)]
pub struct PerspectiveView {
    frustum: Frustum,
    eye: Vec3,
    /// Vertical field of view in radians
    fov_y: f32,
    near: f32,
    /// Viewport height in pixels
    viewport_height: f32,
}

impl PerspectiveView {
    /// Build a view looking from `eye` towards `target`.
    #[allow(clippy::too_many_arguments)]
    pub fn look_at(
        eye: Vec3,
        target: Vec3,
        up: Vec3,
        fov_y_degrees: f32,
        aspect: f32,
        near: f32,
        far: f32,
        viewport_height: u32,
    ) -> Self {
        let fov_y = fov_y_degrees.to_radians();
        let view = Mat4::look_at_rh(eye, target, up);
        let proj = Mat4::perspective_rh(fov_y, aspect, near, far);

        Self {
            frustum: Frustum::from_view_projection(&(proj * view)),
            eye,
            fov_y,
            near,
            viewport_height: viewport_height.max(1) as f32,
        }
    }

    pub fn eye(&self) -> Vec3 {
        self.eye
    }

    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }
}

impl ViewContext for PerspectiveView {
    fn is_visible(&self, bounds: &Aabb, transform: &Mat4) -> bool {
        self.frustum.intersects_aabb(&bounds.transformed(transform))
    }

    fn pixel_size_at(&self, point: Vec3) -> f32 {
        let distance = self.eye.distance(point).max(self.near);
        2.0 * distance * (self.fov_y * 0.5).tan() / self.viewport_height
    }
}
