//! Seams to the renderer and the view
//!
//! The cache never talks to a graphics API directly. A [`RenderSystem`]
//! turns decoded tile buffers into opaque displayable resources and draws
//! them; a [`view::ViewContext`] answers culling and pixel-size queries.
//! Both are passed explicitly into every call that needs them, and both are
//! only ever used from the thread that owns the tile tree.

pub mod view;

pub use view::{PerspectiveView, ViewContext};

use crate::core::types::{Mat4, Result};
use crate::tile::payload::{MeshData, TextureData};

/// Opaque handle to a renderer-owned displayable resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphicHandle(pub u64);

/// Graphics-resource provider implemented by the concrete renderer
pub trait RenderSystem {
    /// Create a displayable resource from CPU-side tile buffers.
    ///
    /// Failures (out of memory, unsupported texture format, ...) surface
    /// here at draw time, never at load time.
    fn create_graphic(&mut self, meshes: &[MeshData], textures: &[TextureData]) -> Result<GraphicHandle>;

    /// Draw a previously created resource with the given model transform.
    fn draw_graphic(&mut self, graphic: GraphicHandle, transform: &Mat4);

    /// Release a resource. The CPU-side buffers it was created from stay cached.
    fn release_graphic(&mut self, graphic: GraphicHandle);
}
