//! Bounding volumes and view culling

pub mod aabb;
pub mod frustum;

pub use aabb::Aabb;
pub use frustum::{Containment, Frustum, Plane};
