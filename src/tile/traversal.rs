//! Per-draw-pass traversal parameters and counters

use glam::Mat4;
use serde::Serialize;

use super::node::Tick;

/// Identity of the viewport a draw pass (and the loads it requests) belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ViewportId(pub u32);

/// Counters accumulated over one draw pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TraversalStats {
    pub nodes_visited: usize,
    pub nodes_culled: usize,
    pub nodes_drawn: usize,
    pub triangles_drawn: usize,
    pub points_drawn: usize,
    pub loads_requested: usize,
    pub synchronous_loads: usize,
    pub graphic_failures: usize,
}

impl TraversalStats {
    pub fn merge(&mut self, other: &TraversalStats) {
        self.nodes_visited += other.nodes_visited;
        self.nodes_culled += other.nodes_culled;
        self.nodes_drawn += other.nodes_drawn;
        self.triangles_drawn += other.triangles_drawn;
        self.points_drawn += other.points_drawn;
        self.loads_requested += other.loads_requested;
        self.synchronous_loads += other.synchronous_loads;
        self.graphic_failures += other.graphic_failures;
    }
}

/// Parameters threaded through one recursive draw.
///
/// Created per draw call by
/// [`CacheManager::new_traversal`](crate::streaming::CacheManager::new_traversal);
/// only `stats` changes during the walk.
#[derive(Clone, Debug)]
pub struct TraversalContext {
    pub viewport: ViewportId,
    /// Local-to-world transform applied to every node's bounds
    pub transform: Mat4,
    /// Draw pass stamp written into every touched node
    pub now: Tick,
    /// Load missing data on the calling thread instead of queueing it
    pub force_synchronous: bool,
    /// World units per pixel to use instead of the view's estimate
    pub fixed_resolution: Option<f32>,
    pub stats: TraversalStats,
}

impl TraversalContext {
    pub fn new(viewport: ViewportId, now: Tick) -> Self {
        Self {
            viewport,
            transform: Mat4::IDENTITY,
            now,
            force_synchronous: false,
            fixed_resolution: None,
            stats: TraversalStats::default(),
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.force_synchronous = true;
        self
    }

    pub fn with_fixed_resolution(mut self, resolution: f32) -> Self {
        self.fixed_resolution = Some(resolution);
        self
    }
}
