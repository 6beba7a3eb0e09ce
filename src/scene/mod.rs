//! Scene files and the per-frame scene entry point

pub mod description;
#[allow(clippy::module_inception)]
pub mod scene;

pub use description::{RootEntry, SceneDescription};
pub use scene::Scene;
