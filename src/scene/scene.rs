//! A loaded scene: its root tile trees plus placement metadata

use std::path::Path;

use crate::core::types::{Mat4, Result};
use crate::render::{RenderSystem, ViewContext};
use crate::streaming::CacheManager;
use crate::tile::{NodeId, TileDescriptor, TileIter, TileLocator, TileNode, TraversalContext};

use super::description::SceneDescription;

/// Entry point the renderer draws each frame.
///
/// Each root entry becomes a non-displayable node whose children come from
/// the root tile file, so nothing is read until the first draw or an
/// explicit load asks for it.
#[derive(Debug)]
pub struct Scene {
    description: SceneDescription,
    roots: Vec<NodeId>,
    location: Mat4,
}

impl Scene {
    /// Parse a scene file and register its roots with `cache`.
    pub fn load(path: &Path, cache: &mut CacheManager) -> Result<Self> {
        let description = SceneDescription::load(path)?;
        let locator = TileLocator::new(path.to_string_lossy());
        Ok(Self::from_description(description, &locator, cache))
    }

    /// Register the roots of an already parsed description. Root files
    /// resolve against `scene_locator`.
    pub fn from_description(
        description: SceneDescription,
        scene_locator: &TileLocator,
        cache: &mut CacheManager,
    ) -> Self {
        let roots = description
            .roots
            .iter()
            .map(|entry| {
                let node = TileNode::new(entry.bounds, 0.0)
                    .with_name(entry.name.clone())
                    .with_children(scene_locator.resolve(&entry.file));
                cache.set_root(node)
            })
            .collect::<Vec<_>>();

        log::info!(
            "Scene '{}' registered {} root(s){}",
            description.name,
            roots.len(),
            description
                .coordinate_system
                .as_ref()
                .map(|crs| format!(" in {}", crs))
                .unwrap_or_default()
        );

        let location = description.location();
        Self { description, roots, location }
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn coordinate_system(&self) -> Option<&str> {
        self.description.coordinate_system.as_deref()
    }

    pub fn description(&self) -> &SceneDescription {
        &self.description
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Scene-to-world transform
    pub fn location(&self) -> Mat4 {
        self.location
    }

    /// Draw every root under the scene location. Returns true when loads
    /// are outstanding and another draw should follow soon.
    pub fn draw(
        &self,
        cache: &mut CacheManager,
        view: &dyn ViewContext,
        renderer: &mut dyn RenderSystem,
        ctx: &mut TraversalContext,
    ) -> bool {
        let outer = ctx.transform;
        ctx.transform = outer * self.location;

        let mut scheduled = false;
        for &root in &self.roots {
            scheduled |= cache.draw(root, view, renderer, ctx);
        }

        ctx.transform = outer;
        scheduled
    }

    /// Read the first displayable level of every root on the calling thread.
    pub fn load_until_displayable(&self, cache: &mut CacheManager) -> Result<usize> {
        let mut reads = 0;
        for &root in &self.roots {
            reads += cache.load_until_displayable(root)?;
        }
        Ok(reads)
    }

    /// Known tiles down to those sufficient at `resolution` world units per
    /// pixel, in world space. Nothing is loaded.
    pub fn tiles<'a>(&self, cache: &'a CacheManager, resolution: f32) -> TileIter<'a> {
        cache.tree().tiles(&self.roots, self.location, resolution)
    }

    /// Feed [`Scene::tiles`] to `callback`, stopping early when it returns
    /// false. Returns the number of tiles visited.
    pub fn get_tiles<F>(&self, cache: &CacheManager, resolution: f32, mut callback: F) -> usize
    where
        F: FnMut(&TileDescriptor) -> bool,
    {
        let mut visited = 0;
        for tile in self.tiles(cache, resolution) {
            visited += 1;
            if !callback(&tile) {
                break;
            }
        }
        visited
    }

    /// Unregister every root, cancelling their loads and releasing their
    /// graphics.
    pub fn remove(&mut self, cache: &mut CacheManager, renderer: &mut dyn RenderSystem) {
        for root in self.roots.drain(..) {
            if let Err(e) = cache.remove_root(root, renderer) {
                log::debug!("Scene '{}': root {} already gone: {}", self.description.name, root, e);
            }
        }
    }
}
