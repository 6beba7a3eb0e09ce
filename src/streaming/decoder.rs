//! Tile decoding: turns a locator into decoded node entries

use std::path::{Path, PathBuf};


use crate::core::types::Result;
use crate::math::Aabb;
use crate::tile::{MeshData, TextureData, TextureFormat, TileLocator, TilePayload};

use super::tile_file::{TileFileData, TileNodeData, read_tile_file};

/// One node entry of a decoded tile file
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedNode {
    /// Position of the entry in its file
    pub index: usize,
    pub name: String,
    pub bounds: Aabb,
    pub lod_threshold: f32,
    /// Children file, already resolved against the containing file
    pub children: Option<TileLocator>,
    pub meshes: Vec<MeshData>,
    pub textures: Vec<TextureData>,
}

impl DecodedNode {
    pub fn into_payload(self) -> TilePayload {
        TilePayload::new(self.meshes, self.textures)
    }
}

/// Decoded contents of one tile file
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedTile {
    pub nodes: Vec<DecodedNode>,
    /// Entries skipped as malformed, with the reason
    pub rejected: Vec<String>,
}

impl DecodedTile {
    /// Convert file entries, skipping malformed ones without failing the rest.
    pub fn from_file_data(locator: &TileLocator, data: TileFileData) -> Self {
        let mut tile = DecodedTile::default();
        for (index, entry) in data.nodes.into_iter().enumerate() {
            match decode_entry(locator, index, entry) {
                Ok(node) => tile.nodes.push(node),
                Err(reason) => {
                    log::warn!("Skipping malformed entry {} in {}: {}", index, locator, reason);
                    tile.rejected.push(format!("entry {}: {}", index, reason));
                }
            }
        }
        tile
    }

    /// Take the entry that was at `index` in the file.
    pub fn take_entry(&mut self, index: usize) -> Option<DecodedNode> {
        let position = self.nodes.iter().position(|n| n.index == index)?;
        Some(self.nodes.swap_remove(position))
    }
}

fn decode_entry(
    locator: &TileLocator,
    index: usize,
    entry: TileNodeData,
) -> std::result::Result<DecodedNode, String> {
    let bounds = Aabb::from_arrays(entry.bounds_min, entry.bounds_max);
    if !bounds.is_valid() {
        return Err("invalid bounds".into());
    }
    if !entry.lod_threshold.is_finite() {
        return Err("non-finite LOD threshold".into());
    }
    let children = match entry.children {
        Some(path) if path.trim().is_empty() => return Err("empty children path".into()),
        Some(path) => Some(locator.resolve(&path)),
        None => None,
    };

    let mut textures = Vec::with_capacity(entry.textures.len());
    for record in entry.textures {
        let format = TextureFormat::from_tag(record.format)
            .ok_or_else(|| format!("unknown texture format {}", record.format))?;
        textures.push(TextureData {
            format,
            width: record.width,
            height: record.height,
            bytes: record.bytes,
        });
    }

    let mut meshes = Vec::with_capacity(entry.meshes.len());
    for record in entry.meshes {
        let vertex_count = record.positions.len();
        if record.indices.len() % 3 != 0 {
            return Err("index count is not a multiple of 3".into());
        }
        if record.indices.iter().any(|&i| i as usize >= vertex_count) {
            return Err("index out of vertex range".into());
        }
        if !record.normals.is_empty() && record.normals.len() != vertex_count {
            return Err("normal count does not match positions".into());
        }
        if !record.uvs.is_empty() && record.uvs.len() != vertex_count {
            return Err("uv count does not match positions".into());
        }
        let texture = match record.texture {
            Some(t) if t as usize >= textures.len() => {
                return Err(format!("texture index {} out of range", t));
            }
            Some(t) => Some(t as usize),
            None => None,
        };
        meshes.push(MeshData {
            positions: record.positions,
            normals: record.normals,
            uvs: record.uvs,
            indices: record.indices,
            texture,
        });
    }

    Ok(DecodedNode {
        index,
        name: entry.name,
        bounds,
        lod_threshold: entry.lod_threshold,
        children,
        meshes,
        textures,
    })
}

/// Source of decoded tiles.
///
/// Called from background workers and from the synchronous load path, so the
/// same decoder produces the same tree regardless of how a tile was loaded.
pub trait TileDecoder: Send + Sync {
    fn decode(&self, locator: &TileLocator) -> Result<DecodedTile>;
}

/// Decodes tile files from disk, resolving relative locators against a base
/// directory.
#[derive(Clone, Debug)]
pub struct FileTileDecoder {
    base_dir: PathBuf,
}

impl FileTileDecoder {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, locator: &TileLocator) -> PathBuf {
        let path = Path::new(locator.as_str());
        if path.is_absolute() { path.to_path_buf() } else { self.base_dir.join(path) }
    }
}

impl TileDecoder for FileTileDecoder {
    fn decode(&self, locator: &TileLocator) -> Result<DecodedTile> {
        let data = read_tile_file(&self.path_for(locator))?;
        Ok(DecodedTile::from_file_data(locator, data))
    }
}
