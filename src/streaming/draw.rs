//! LOD selection and the recursive draw.
//!
//! Draws the coarsest resident representation now, requests finer detail,
//! and swaps the finer tiles in once every visible child is resident.

use crate::core::error::TileError;
use crate::core::types::Result;
use crate::render::{RenderSystem, ViewContext};
use crate::tile::{ChildrenState, NodeId, TraversalContext, TraversalStats, ViewportId};

use super::manager::CacheManager;

/// Outcome of the view test for one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Culled,
    Visible {
        /// The node is too coarse for the view, so recursing into its
        /// children is warranted
        under_maximum_size: bool,
    },
}

impl CacheManager {
    /// Test `node` against the view.
    ///
    /// A node is too coarse when its projected size in pixels exceeds its
    /// LOD threshold. Non-displayable nodes always are.
    pub fn test_visibility(
        &self,
        node: NodeId,
        view: &dyn ViewContext,
        ctx: &TraversalContext,
    ) -> Visibility {
        let Some(n) = self.node(node) else {
            return Visibility::Culled;
        };
        if !view.is_visible(&n.bounds, &ctx.transform) {
            return Visibility::Culled;
        }
        if !n.is_displayable() {
            return Visibility::Visible { under_maximum_size: true };
        }

        let world = n.bounds.transformed(&ctx.transform);
        let pixel_size = ctx
            .fixed_resolution
            .unwrap_or_else(|| view.pixel_size_at(world.center()));
        let under_maximum_size = pixel_size <= 0.0 || world.diameter() / pixel_size > n.lod_threshold;
        Visibility::Visible { under_maximum_size }
    }

    /// Recursively draw `node`. Returns true if loads are outstanding for
    /// what was drawn, meaning the caller should draw again soon.
    pub fn draw(
        &mut self,
        node: NodeId,
        view: &dyn ViewContext,
        renderer: &mut dyn RenderSystem,
        ctx: &mut TraversalContext,
    ) -> bool {
        ctx.stats.nodes_visited += 1;
        let Visibility::Visible { under_maximum_size } = self.test_visibility(node, view, ctx) else {
            ctx.stats.nodes_culled += 1;
            return false;
        };
        let Some(n) = self.node_mut(node) else {
            return false;
        };
        n.touch(ctx.now);
        let refine = n.has_children() && (!n.is_displayable() || under_maximum_size);

        let mut scheduled = false;
        if refine {
            match n.children_state() {
                ChildrenState::NotRequested if ctx.force_synchronous => {
                    ctx.stats.synchronous_loads += self.load_children_until_displayable(node, true);
                }
                ChildrenState::NotRequested => {
                    scheduled |= self.request_load_until_displayable(node, ctx.viewport, &mut ctx.stats);
                }
                ChildrenState::Requested => scheduled = true,
                ChildrenState::Loaded | ChildrenState::Failed => {}
            }

            let loaded = self.node(node).is_some_and(|n| n.children_state() == ChildrenState::Loaded);
            if loaded
                && (self.are_visible_children_loaded(node, view, ctx, &mut scheduled)
                    || !self.has_stand_in(node))
            {
                let children: Vec<NodeId> = self.tree().children(node).collect();
                for child in children {
                    scheduled |= self.draw(child, view, renderer, ctx);
                }
                return scheduled;
            }
        }

        self.draw_payload(node, renderer, ctx, &mut scheduled);
        scheduled
    }

    /// Submit a children load if none was submitted yet. Never blocks.
    ///
    /// Returns true while a children load for `node` is outstanding.
    pub fn request_load_until_displayable(
        &mut self,
        node: NodeId,
        viewport: ViewportId,
        stats: &mut TraversalStats,
    ) -> bool {
        match self.request_children(node, viewport) {
            Ok(true) => {
                stats.loads_requested += 1;
                true
            }
            Ok(false) => self.node(node).is_some_and(|n| n.children_state() == ChildrenState::Requested),
            Err(_) => false,
        }
    }

    /// Load `node`'s own payload on the calling thread.
    pub fn load(&mut self, node: NodeId) -> Result<()> {
        self.load_payload_now(node).map(|_| ())
    }

    /// Load `node`'s payload and, below it, every level down to the first
    /// displayable nodes, blocking the caller. Returns the number of files read.
    pub fn load_until_displayable(&mut self, node: NodeId) -> Result<usize> {
        self.load(node)?;
        let n = self.node(node).ok_or(TileError::UnknownNode(node))?;
        if n.is_displayable() || !n.has_children() {
            return Ok(0);
        }
        let mut reads = 0;
        if !matches!(n.children_state(), ChildrenState::Loaded | ChildrenState::Failed) {
            self.synchronous_read(node)?;
            reads += 1;
        }
        Ok(reads + self.load_children_until_displayable(node, false))
    }

    /// Read children level by level until every branch reaches a displayable
    /// node, starting with `node`'s own children when `include_self` is set
    /// and with its non-displayable children otherwise. Failures are logged
    /// and end that branch. Returns the number of files read.
    fn load_children_until_displayable(&mut self, node: NodeId, include_self: bool) -> usize {
        let mut reads = 0;
        let mut level: Vec<NodeId> = if include_self {
            vec![node]
        } else {
            self.non_displayable_children(node)
        };

        while !level.is_empty() {
            let to_read: Vec<NodeId> = level
                .iter()
                .copied()
                .filter(|&id| {
                    self.node(id).is_some_and(|n| {
                        n.has_children()
                            && matches!(
                                n.children_state(),
                                ChildrenState::NotRequested | ChildrenState::Requested
                            )
                    })
                })
                .collect();

            for (id, result) in self.synchronous_read_batch(&to_read) {
                reads += 1;
                if let Err(e) = result {
                    log::debug!("Synchronous read for {} failed: {}", id, e);
                }
            }

            level = level.iter().flat_map(|&id| self.non_displayable_children(id)).collect();
        }
        reads
    }

    fn non_displayable_children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree()
            .children(node)
            .filter(|&id| self.node(id).is_some_and(|n| !n.is_displayable()))
            .collect()
    }

    /// True when at least one child is visible and every visible child has
    /// its payload. Visible children count as used this pass, and evicted
    /// payloads among them are requested again on the way.
    fn are_visible_children_loaded(
        &mut self,
        node: NodeId,
        view: &dyn ViewContext,
        ctx: &mut TraversalContext,
        scheduled: &mut bool,
    ) -> bool {
        let children: Vec<NodeId> = self.tree().children(node).collect();
        let mut any_visible = false;
        let mut all_loaded = true;

        for child in children {
            let Some(c) = self.node_mut(child) else { continue };
            if !view.is_visible(&c.bounds, &ctx.transform) {
                continue;
            }
            any_visible = true;
            c.touch(ctx.now);
            if c.has_payload_ready() {
                continue;
            }
            if !c.can_reload_payload() {
                // Terminally failed: keep showing the parent for this region
                return false;
            }
            if ctx.force_synchronous {
                ctx.stats.synchronous_loads += 1;
                if let Err(e) = self.load_payload_now(child) {
                    log::debug!("Synchronous payload load for {} failed: {}", child, e);
                }
                all_loaded &= self.node(child).is_some_and(|c| c.is_loaded());
            } else {
                if matches!(self.request_payload(child, ctx.viewport), Ok(true)) {
                    ctx.stats.loads_requested += 1;
                }
                *scheduled = true;
                all_loaded = false;
            }
        }
        any_visible && all_loaded
    }

    /// Whether `node` has, or will have, its own geometry to show while its
    /// children are incomplete.
    fn has_stand_in(&self, node: NodeId) -> bool {
        self.node(node).is_some_and(|n| n.is_loaded() || n.can_reload_payload())
    }

    fn draw_payload(
        &mut self,
        node: NodeId,
        renderer: &mut dyn RenderSystem,
        ctx: &mut TraversalContext,
        scheduled: &mut bool,
    ) {
        let Some(n) = self.node_mut(node) else { return };
        if let Some(payload) = n.payload_mut() {
            match payload.ensure_graphic(renderer) {
                Ok(Some(graphic)) => {
                    renderer.draw_graphic(graphic, &ctx.transform);
                    ctx.stats.nodes_drawn += 1;
                    ctx.stats.triangles_drawn += payload.triangle_count();
                    ctx.stats.points_drawn += payload.point_count();
                }
                Ok(None) => {}
                Err(e) => {
                    ctx.stats.graphic_failures += 1;
                    log::debug!("Graphic creation failed for {}: {}", node, e);
                }
            }
            return;
        }

        if !n.can_reload_payload() {
            return;
        }
        if ctx.force_synchronous {
            ctx.stats.synchronous_loads += 1;
            if self.load_payload_now(node).is_ok() {
                self.draw_payload(node, renderer, ctx, scheduled);
            }
        } else {
            if matches!(self.request_payload(node, ctx.viewport), Ok(true)) {
                ctx.stats.loads_requested += 1;
            }
            *scheduled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;
    use crate::streaming::{CacheConfig, ProcessResult};
    use crate::test_support::{
        FixedView, MemoryDecoder, RecordingRenderer, drain_until_idle, leaf_entry, manager_with,
        unit_bounds,
    };
    use crate::tile::{Tick, TileLocator, TileNode};
    use glam::{Mat4, Vec3};
    use std::sync::Arc;
    use std::time::Duration;

    /// Root (threshold 10) covering the unit cube with two leaf children,
    /// each covering one half. Marker = x of the first vertex.
    fn scenario() -> (Arc<MemoryDecoder>, TileNode) {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert(
            "root.tile",
            vec![leaf_entry("root", unit_bounds(), 10.0).with_children("leaves.tile")],
        );
        decoder.insert_leaves("leaves.tile", &[1.0, 2.0]);
        let top = TileNode::new(unit_bounds(), 0.0).with_children(TileLocator::new("root.tile"));
        (decoder, top)
    }

    #[test]
    fn test_visibility_uses_threshold_and_fixed_resolution() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.synchronous_read(top).unwrap();
        let root = cache.tree().children(top).next().unwrap();

        let view = FixedView::everything(0.01);
        let ctx = cache.new_traversal(ViewportId(0));
        // diameter ~1.73 at 0.01 units/pixel = 173 px > 10
        assert_eq!(
            cache.test_visibility(root, &view, &ctx),
            Visibility::Visible { under_maximum_size: true }
        );
        let coarse = ctx.clone().with_fixed_resolution(1.0);
        assert_eq!(
            cache.test_visibility(root, &view, &coarse),
            Visibility::Visible { under_maximum_size: false }
        );
        assert_eq!(cache.test_visibility(root, &FixedView::nothing(), &ctx), Visibility::Culled);

        let mut ctx = ctx;
        assert!(!cache.draw(root, &FixedView::nothing(), &mut renderer, &mut ctx));
        assert_eq!(ctx.stats.nodes_culled, 1);
        assert!(renderer.drawn.is_empty());
        assert_eq!(cache.node(root).unwrap().last_used(), Tick(0), "culled nodes are not touched");
    }

    #[test]
    fn test_coarse_first_then_children_after_completion() {
        let (decoder, top) = scenario();
        let gate = decoder.gate("leaves.tile");
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();
        let root = cache.tree().children(top).next().unwrap();
        let view = FixedView::everything(0.01);

        // First draw: root is too coarse, children get requested, root draws
        let mut ctx = cache.new_traversal(ViewportId(0));
        assert!(cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![10.0]);
        assert_eq!(ctx.stats.loads_requested, 1);
        assert!(cache.node(root).unwrap().children_requested());

        // Same pending period: no duplicate request
        renderer.drawn.clear();
        let mut ctx = cache.new_traversal(ViewportId(0));
        assert!(cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![10.0]);
        assert_eq!(ctx.stats.loads_requested, 0);
        assert_eq!(cache.pending_count(), 1);

        gate.open();
        assert!(cache.wait_for_completions(Duration::from_secs(5)));
        assert_eq!(cache.process_requests(), ProcessResult::Processed);

        let mut renderer = RecordingRenderer::default();
        let mut ctx = cache.new_traversal(ViewportId(0));
        assert!(!cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![1.0, 2.0]);
        assert_eq!(ctx.stats.nodes_drawn, 2);
        assert_eq!(ctx.stats.triangles_drawn, 2);
    }

    #[test]
    fn test_sufficient_node_does_not_request_children() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();
        let root = cache.tree().children(top).next().unwrap();

        let view = FixedView::everything(1.0);
        let mut ctx = cache.new_traversal(ViewportId(0));
        assert!(!cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![10.0]);
        assert!(!cache.node(root).unwrap().children_requested());
    }

    #[test]
    fn test_forced_synchronous_draw_loads_inline() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        let view = FixedView::everything(0.01);

        let mut ctx = cache.new_traversal(ViewportId(0)).synchronous();
        assert!(!cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![1.0, 2.0]);
        assert!(ctx.stats.synchronous_loads >= 2);
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_failed_child_falls_back_to_parent() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();
        let root = cache.tree().children(top).next().unwrap();
        cache.synchronous_read(root).unwrap();

        let leaf = cache.tree().children(root).next().unwrap();
        let n = cache.node_mut(leaf).unwrap();
        n.payload = None;
        n.payload_failed = true;

        let view = FixedView::everything(0.01);
        let mut ctx = cache.new_traversal(ViewportId(0));
        cache.draw(top, &view, &mut renderer, &mut ctx);
        assert_eq!(renderer.drawn_markers(), vec![10.0]);
    }

    #[test]
    fn test_evicted_child_is_reloaded_while_parent_stands_in() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();
        let root = cache.tree().children(top).next().unwrap();
        cache.synchronous_read(root).unwrap();

        let view = FixedView::everything(0.01);
        let mut ctx = cache.new_traversal(ViewportId(0));
        cache.draw(top, &view, &mut renderer, &mut ctx);
        let stale = ctx.now.next();

        // Eviction at T + 1 clears the leaves that were last used at T
        let report = cache.flush(stale, &mut renderer);
        assert_eq!(report.payloads, 2);
        assert!(cache.tree().children(root).all(|c| !cache.node(c).unwrap().is_loaded()));

        let mut renderer = RecordingRenderer::default();
        let mut ctx = cache.new_traversal(ViewportId(0));
        assert!(cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![10.0]);

        drain_until_idle(&mut cache);
        let mut renderer = RecordingRenderer::default();
        let mut ctx = cache.new_traversal(ViewportId(0));
        cache.draw(top, &view, &mut renderer, &mut ctx);
        assert_eq!(renderer.drawn_markers(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_only_visible_children_are_required() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();
        let root = cache.tree().children(top).next().unwrap();
        cache.synchronous_read(root).unwrap();

        // Second leaf evicted but outside the view
        let second = cache.tree().children(root).nth(1).unwrap();
        cache.node_mut(second).unwrap().payload = None;
        let view = FixedView::region(Aabb::new(Vec3::ZERO, Vec3::new(0.4, 1.0, 1.0)), 0.01);

        let mut ctx = cache.new_traversal(ViewportId(0));
        assert!(!cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![1.0]);
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_waiting_siblings_keep_loaded_children_fresh() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();
        let root = cache.tree().children(top).next().unwrap();
        cache.synchronous_read(root).unwrap();

        let children: Vec<_> = cache.tree().children(root).collect();
        cache.node_mut(children[1]).unwrap().payload = None;

        let view = FixedView::everything(0.01);
        let mut ctx = cache.new_traversal(ViewportId(0));
        assert!(cache.draw(top, &view, &mut renderer, &mut ctx));
        assert_eq!(renderer.drawn_markers(), vec![10.0]);
        // Not drawn, but still in use while its sibling reloads
        assert_eq!(cache.node(children[0]).unwrap().last_used(), ctx.now);
        assert_eq!(cache.flush(ctx.now, &mut renderer).payloads, 0);
    }

    #[test]
    fn test_graphic_failure_is_counted_not_fatal() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::failing();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();

        let view = FixedView::everything(1.0);
        let mut ctx = cache.new_traversal(ViewportId(0));
        cache.draw(top, &view, &mut renderer, &mut ctx);
        assert_eq!(ctx.stats.graphic_failures, 1);
        assert_eq!(ctx.stats.nodes_drawn, 0);
    }

    #[test]
    fn test_draw_applies_context_transform() {
        let (decoder, top) = scenario();
        let mut cache = manager_with(decoder, CacheConfig::default());
        let mut renderer = RecordingRenderer::default();
        let top = cache.set_root(top);
        cache.load_until_displayable(top).unwrap();

        let shift = Mat4::from_translation(Vec3::new(100.0, 0.0, 0.0));
        let view = FixedView::region(Aabb::new(Vec3::new(99.0, -1.0, -1.0), Vec3::splat(102.0)), 1.0);
        let mut ctx = cache.new_traversal(ViewportId(0)).with_transform(shift);
        cache.draw(top, &view, &mut renderer, &mut ctx);
        assert_eq!(renderer.drawn.len(), 1);
        assert_eq!(renderer.drawn[0].1, shift);
    }
}
