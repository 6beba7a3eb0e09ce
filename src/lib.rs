//! Tilestream - level-of-detail streaming cache for hierarchical 3D tile scenes

pub mod core;
pub mod math;
pub mod render;
pub mod tile;
pub mod streaming;
pub mod scene;

#[cfg(test)]
mod test_support;
