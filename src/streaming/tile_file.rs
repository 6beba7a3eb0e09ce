//! Tile container serialization and disk I/O
//!
//! A tile file is an rkyv archive of [`TileFileData`], LZ4 compressed with
//! the uncompressed size prepended.

use std::io;
use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::error::TileError;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::tile::{MeshData, TextureData};

/// Bumped whenever the archived layout changes
pub const TILE_FILE_VERSION: u32 = 1;

#[derive(Archive, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MeshRecord {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    pub texture: Option<u32>,
}

#[derive(Archive, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct TextureRecord {
    /// See [`TextureFormat::tag`](crate::tile::TextureFormat::tag)
    pub format: u8,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// One node entry of a tile file
#[derive(Archive, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct TileNodeData {
    pub name: String,
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
    pub lod_threshold: f32,
    /// Children file, relative to this file
    pub children: Option<String>,
    pub meshes: Vec<MeshRecord>,
    pub textures: Vec<TextureRecord>,
}

impl TileNodeData {
    pub fn new(name: impl Into<String>, bounds: Aabb, lod_threshold: f32) -> Self {
        Self {
            name: name.into(),
            bounds_min: bounds.min.to_array(),
            bounds_max: bounds.max.to_array(),
            lod_threshold,
            ..Default::default()
        }
    }

    pub fn with_children(mut self, path: impl Into<String>) -> Self {
        self.children = Some(path.into());
        self
    }

    pub fn with_mesh(mut self, mesh: &MeshData) -> Self {
        self.meshes.push(MeshRecord {
            positions: mesh.positions.clone(),
            normals: mesh.normals.clone(),
            uvs: mesh.uvs.clone(),
            indices: mesh.indices.clone(),
            texture: mesh.texture.map(|t| t as u32),
        });
        self
    }

    pub fn with_texture(mut self, texture: &TextureData) -> Self {
        self.textures.push(TextureRecord {
            format: texture.format.tag(),
            width: texture.width,
            height: texture.height,
            bytes: texture.bytes.clone(),
        });
        self
    }
}

/// Contents of one tile file: a set of sibling nodes
#[derive(Archive, Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TileFileData {
    pub version: u32,
    pub nodes: Vec<TileNodeData>,
}

impl TileFileData {
    pub fn new(nodes: Vec<TileNodeData>) -> Self {
        Self { version: TILE_FILE_VERSION, nodes }
    }
}

/// Serialize and compress a tile file
pub fn encode_tile_file(data: &TileFileData) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(data)
        .map_err(|e| io::Error::other(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

/// Decompress, validate and deserialize a tile file
pub fn decode_tile_file(data: &[u8]) -> Result<TileFileData> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| TileError::Parse(format!("LZ4 decompression failed: {}", e)))?;

    // Archives must be read from aligned storage
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(decompressed.len());
    aligned.extend_from_slice(&decompressed);

    let archived = rkyv::access::<ArchivedTileFileData, rkyv::rancor::Error>(&aligned)
        .map_err(|e| TileError::Parse(e.to_string()))?;
    let file: TileFileData = rkyv::deserialize::<TileFileData, rkyv::rancor::Error>(archived)
        .map_err(|e| TileError::Parse(e.to_string()))?;

    if file.version != TILE_FILE_VERSION {
        return Err(TileError::Parse(format!(
            "unsupported tile file version {} (expected {})",
            file.version, TILE_FILE_VERSION
        )));
    }
    Ok(file)
}

/// Write a tile file, creating parent directories
pub fn write_tile_file(path: &Path, data: &TileFileData) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, encode_tile_file(data)?)?;
    Ok(())
}

/// Read a tile file; a missing file is `NotFound`
pub fn read_tile_file(path: &Path) -> Result<TileFileData> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => TileError::NotFound(path.display().to_string()),
        _ => TileError::Io(e),
    })?;
    decode_tile_file(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TextureFormat;
    use glam::Vec3;
    use tempfile::TempDir;

    fn sample() -> TileFileData {
        let mesh = MeshData {
            texture: Some(0),
            ..MeshData::triangles(vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], vec![0, 1, 2])
        };
        let texture = TextureData { format: TextureFormat::Png, width: 2, height: 2, bytes: vec![7; 16] };
        TileFileData::new(vec![
            TileNodeData::new("a", Aabb::new(Vec3::ZERO, Vec3::ONE), 10.0)
                .with_children("a/children.tile")
                .with_mesh(&mesh)
                .with_texture(&texture),
            TileNodeData::new("b", Aabb::new(Vec3::ONE, Vec3::splat(2.0)), 0.0),
        ])
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/root.tile");
        let data = sample();

        write_tile_file(&path, &data).unwrap();
        let loaded = read_tile_file(&path).unwrap();

        assert_eq!(loaded, data);
        assert_eq!(loaded.nodes[0].meshes[0].texture, Some(0));
        assert_eq!(loaded.nodes[0].textures[0].format, TextureFormat::Png.tag());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = read_tile_file(&dir.path().join("absent.tile")).unwrap_err();
        assert!(matches!(err, TileError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(decode_tile_file(b"not a tile"), Err(TileError::Parse(_))));

        let mut bytes = encode_tile_file(&sample()).unwrap();
        let last = bytes.len() - 1;
        bytes.truncate(last / 2);
        assert!(matches!(decode_tile_file(&bytes), Err(TileError::Parse(_))));
    }

    #[test]
    fn test_version_mismatch_is_parse_error() {
        let mut data = sample();
        data.version = TILE_FILE_VERSION + 1;
        let bytes = encode_tile_file(&data).unwrap();
        let err = decode_tile_file(&bytes).unwrap_err();
        assert!(err.to_string().contains("version"));
    }
}
