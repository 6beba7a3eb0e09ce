//! Arena holding every node of the LOD trees managed by one cache.

use std::collections::{HashMap, HashSet};

use glam::Mat4;

use crate::core::error::TileError;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::render::RenderSystem;

use super::node::{NodeId, Tick, TileLocator, TileNode};

/// Result of one eviction sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub payloads: usize,
    pub bytes: usize,
}

/// Which byte count a memory query sums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Total,
    Mesh,
    Texture,
    Gpu,
}

/// Arena of tile nodes.
///
/// Nodes own their children through `children` id lists and refer to their
/// parent by id only, so dropping a subtree never has to break cycles.
#[derive(Debug, Default)]
pub struct TileTree {
    nodes: HashMap<NodeId, TileNode>,
    roots: Vec<NodeId>,
    next_id: u64,
}

impl TileTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    /// Insert a new root. Roots are always primary.
    pub fn insert_root(&mut self, mut node: TileNode) -> NodeId {
        let id = self.alloc_id();
        node.id = id;
        node.parent = None;
        node.children.clear();
        node.depth = 0;
        node.primary = true;
        self.nodes.insert(id, node);
        self.roots.push(id);
        id
    }

    /// Append `node` to `parent`'s children.
    ///
    /// A child is primary when its parent is primary and cannot be drawn
    /// without refinement, so the chain from a root down to the first
    /// displayable node stays protected.
    pub fn add_child(&mut self, parent: NodeId, mut node: TileNode) -> Result<NodeId> {
        let (depth, primary) = match self.nodes.get(&parent) {
            Some(p) => (p.depth + 1, p.primary && !p.is_displayable()),
            None => return Err(TileError::UnknownNode(parent)),
        };
        let id = self.alloc_id();
        node.id = id;
        node.parent = Some(parent);
        node.children.clear();
        node.depth = depth;
        node.primary = primary;
        self.nodes.insert(id, node);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// Remove a node and its entire subtree, returning the removed nodes so
    /// the caller can cancel their loads and release their graphics.
    pub fn remove(&mut self, id: NodeId) -> Vec<TileNode> {
        if !self.nodes.contains_key(&id) {
            return Vec::new();
        }
        let to_remove = self.subtree(id);

        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        match parent {
            Some(parent_id) => {
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    parent.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }

        to_remove.into_iter().filter_map(|nid| self.nodes.remove(&nid)).collect()
    }

    /// Ids of `id` and all its descendants, breadth first.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        if !self.nodes.contains_key(&id) {
            return Vec::new();
        }
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            if let Some(node) = self.nodes.get(&out[i]) {
                out.extend_from_slice(&node.children);
            }
            i += 1;
        }
        out
    }

    pub fn get(&self, id: NodeId) -> Option<&TileNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TileNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.roots.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over the children of a node.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    /// Walk parent links from `id` (exclusive) up to its root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.nodes.get(&id).and_then(|n| n.parent), |p| {
            self.nodes.get(p).and_then(|n| n.parent)
        })
    }

    /// Bytes of the given kind held by `id` and its descendants.
    pub fn memory_size_of(&self, id: NodeId, kind: MemoryKind) -> usize {
        self.subtree(id)
            .into_iter()
            .filter_map(|nid| self.nodes.get(&nid)?.payload.as_ref())
            .map(|p| match kind {
                MemoryKind::Total => p.memory_size(),
                MemoryKind::Mesh => p.mesh_memory_size(),
                MemoryKind::Texture => p.texture_memory_size(),
                MemoryKind::Gpu => p.gpu_memory_size(),
            })
            .sum()
    }

    pub fn memory_size(&self, id: NodeId) -> usize {
        self.memory_size_of(id, MemoryKind::Total)
    }

    pub fn mesh_memory_size(&self, id: NodeId) -> usize {
        self.memory_size_of(id, MemoryKind::Mesh)
    }

    pub fn texture_memory_size(&self, id: NodeId) -> usize {
        self.memory_size_of(id, MemoryKind::Texture)
    }

    /// Bytes of the given kind across every tree.
    pub fn total_memory(&self, kind: MemoryKind) -> usize {
        self.roots.iter().map(|&r| self.memory_size_of(r, kind)).sum()
    }

    /// Drop the payload of every non-primary node under `root` that was last
    /// used before `stale_time`. Topology is kept. Nodes in `busy` (loads in
    /// flight or waiting for retry) are skipped.
    pub fn flush_stale(
        &mut self,
        root: NodeId,
        stale_time: Tick,
        busy: &HashSet<NodeId>,
        renderer: &mut dyn RenderSystem,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        for id in self.subtree(root) {
            let Some(node) = self.nodes.get_mut(&id) else { continue };
            if node.primary || node.last_used >= stale_time || busy.contains(&id) {
                continue;
            }
            if let Some(mut payload) = node.take_payload() {
                payload.clear_graphic(renderer);
                report.payloads += 1;
                report.bytes += payload.memory_size();
            }
        }
        report
    }

    /// Release GPU resources of non-primary nodes last used before
    /// `stale_time`, keeping their decoded buffers.
    pub fn clear_stale_graphics(
        &mut self,
        root: NodeId,
        stale_time: Tick,
        renderer: &mut dyn RenderSystem,
    ) -> usize {
        let mut released = 0;
        for id in self.subtree(root) {
            let Some(node) = self.nodes.get_mut(&id) else { continue };
            if node.primary || node.last_used >= stale_time {
                continue;
            }
            if let Some(payload) = node.payload.as_mut() {
                if payload.clear_graphic(renderer) {
                    released += 1;
                }
            }
        }
        released
    }

    /// Lazily walk the known topology under `roots`, yielding every drawable
    /// tile (displayable, or a leaf) from the coarsest level down to the
    /// tiles sufficient at `resolution` (world units per pixel). Nothing is
    /// loaded, so unloaded levels simply end the walk early.
    pub fn tiles<'a>(&'a self, roots: &[NodeId], transform: Mat4, resolution: f32) -> TileIter<'a> {
        TileIter {
            tree: self,
            stack: roots.iter().rev().copied().collect(),
            transform,
            resolution,
        }
    }
}

/// Read-only description of a known tile.
#[derive(Clone, Debug, PartialEq)]
pub struct TileDescriptor {
    pub node: NodeId,
    pub depth: u32,
    /// Bounds after the scene transform
    pub bounds: Aabb,
    pub lod_threshold: f32,
    pub locator: Option<TileLocator>,
    pub loaded: bool,
    /// True when this tile is detailed enough at the requested resolution
    pub sufficient: bool,
}

/// Depth-first iterator returned by [`TileTree::tiles`].
pub struct TileIter<'a> {
    tree: &'a TileTree,
    stack: Vec<NodeId>,
    transform: Mat4,
    resolution: f32,
}

impl Iterator for TileIter<'_> {
    type Item = TileDescriptor;

    fn next(&mut self) -> Option<TileDescriptor> {
        while let Some(id) = self.stack.pop() {
            let Some(node) = self.tree.get(id) else { continue };
            let bounds = node.bounds.transformed(&self.transform);
            let projected = if self.resolution > 0.0 {
                bounds.diameter() / self.resolution
            } else {
                f32::INFINITY
            };
            let drawable = node.is_displayable() || !node.has_children();
            let sufficient = !node.has_children()
                || (node.is_displayable() && projected <= node.lod_threshold);

            if !sufficient {
                self.stack.extend(node.children.iter().rev().copied());
            }
            if drawable {
                return Some(TileDescriptor {
                    node: id,
                    depth: node.depth,
                    bounds,
                    lod_threshold: node.lod_threshold,
                    locator: node.source.as_ref().map(|s| s.locator.clone()),
                    loaded: node.is_loaded(),
                    sufficient,
                });
            }
        }
        None
    }
}
