//! Decoded geometry and texture data for one tile

use bytemuck::{Pod, Zeroable};

use crate::core::types::Result;
use crate::render::{GraphicHandle, RenderSystem};

/// Interleaved vertex layout handed to renderers that want a single buffer
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TileVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// One mesh (or point set, when there are no indices) of a tile
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    /// Empty, or one per position
    pub normals: Vec<[f32; 3]>,
    /// Empty, or one per position
    pub uvs: Vec<[f32; 2]>,
    /// Triangle list. Empty means the positions are drawn as points.
    pub indices: Vec<u32>,
    /// Index into the owning payload's texture list
    pub texture: Option<usize>,
}

impl MeshData {
    pub fn triangles(positions: Vec<[f32; 3]>, indices: Vec<u32>) -> Self {
        Self { positions, indices, ..Default::default() }
    }

    pub fn points(positions: Vec<[f32; 3]>) -> Self {
        Self { positions, ..Default::default() }
    }

    pub fn is_point_cloud(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn point_count(&self) -> usize {
        if self.is_point_cloud() { self.positions.len() } else { 0 }
    }

    /// Build the interleaved vertex buffer; missing attributes are zeroed.
    pub fn vertices(&self) -> Vec<TileVertex> {
        self.positions
            .iter()
            .enumerate()
            .map(|(i, &position)| TileVertex {
                position,
                normal: self.normals.get(i).copied().unwrap_or_default(),
                uv: self.uvs.get(i).copied().unwrap_or_default(),
            })
            .collect()
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// CPU bytes held by this mesh
    pub fn memory_size(&self) -> usize {
        std::mem::size_of_val(self.positions.as_slice())
            + std::mem::size_of_val(self.normals.as_slice())
            + std::mem::size_of_val(self.uvs.as_slice())
            + std::mem::size_of_val(self.indices.as_slice())
    }
}

/// Encoding of a compressed texture blob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    Jpeg,
    Png,
    /// Uncompressed RGBA8
    Rgba8,
}

impl TextureFormat {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Jpeg),
            1 => Some(Self::Png),
            2 => Some(Self::Rgba8),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Jpeg => 0,
            Self::Png => 1,
            Self::Rgba8 => 2,
        }
    }
}

/// Texture kept in its compressed on-disk form until a renderer uploads it
#[derive(Clone, Debug, PartialEq)]
pub struct TextureData {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl TextureData {
    pub fn memory_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Everything one tile needs to be drawn.
///
/// The GPU resource is created lazily on first draw and can be dropped on
/// its own ([`TilePayload::clear_graphic`]) while the decoded buffers stay
/// cached.
#[derive(Debug, Default)]
pub struct TilePayload {
    meshes: Vec<MeshData>,
    textures: Vec<TextureData>,
    graphic: Option<GraphicHandle>,
}

impl TilePayload {
    pub fn new(meshes: Vec<MeshData>, textures: Vec<TextureData>) -> Self {
        Self { meshes, textures, graphic: None }
    }

    pub fn meshes(&self) -> &[MeshData] {
        &self.meshes
    }

    pub fn textures(&self) -> &[TextureData] {
        &self.textures
    }

    /// A payload with nothing to draw. Valid: it represents an empty region.
    pub fn is_empty(&self) -> bool {
        self.meshes.iter().all(|m| m.positions.is_empty())
    }

    pub fn triangle_count(&self) -> usize {
        self.meshes.iter().map(MeshData::triangle_count).sum()
    }

    pub fn point_count(&self) -> usize {
        self.meshes.iter().map(MeshData::point_count).sum()
    }

    pub fn mesh_memory_size(&self) -> usize {
        self.meshes.iter().map(MeshData::memory_size).sum()
    }

    pub fn texture_memory_size(&self) -> usize {
        self.textures.iter().map(TextureData::memory_size).sum()
    }

    pub fn memory_size(&self) -> usize {
        self.mesh_memory_size() + self.texture_memory_size()
    }

    /// Estimated GPU bytes; zero until a graphic exists.
    pub fn gpu_memory_size(&self) -> usize {
        if self.graphic.is_some() { self.memory_size() } else { 0 }
    }

    pub fn graphic(&self) -> Option<GraphicHandle> {
        self.graphic
    }

    /// Return the GPU resource, creating it on first use.
    ///
    /// Empty payloads never get one and yield `Ok(None)`.
    pub fn ensure_graphic(&mut self, renderer: &mut dyn RenderSystem) -> Result<Option<GraphicHandle>> {
        if self.is_empty() {
            return Ok(None);
        }
        if let Some(handle) = self.graphic {
            return Ok(Some(handle));
        }
        let handle = renderer.create_graphic(&self.meshes, &self.textures)?;
        self.graphic = Some(handle);
        Ok(Some(handle))
    }

    /// Release the GPU resource, keeping the decoded buffers.
    ///
    /// Returns true if a resource was released.
    pub fn clear_graphic(&mut self, renderer: &mut dyn RenderSystem) -> bool {
        match self.graphic.take() {
            Some(handle) => {
                renderer.release_graphic(handle);
                true
            }
            None => false,
        }
    }
}
