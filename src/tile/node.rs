//! LOD tree node types
//!
//! Node ids, locators, residency state, and the node itself.

use crate::math::Aabb;

use super::payload::TilePayload;

/// Identifier of a node in a [`TileTree`](super::TileTree).
///
/// Ids are never reused, so a stale id simply stops resolving once its node
/// has been removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic draw-pass counter used for staleness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u64);

impl Tick {
    pub fn next(self) -> Self {
        Tick(self.0 + 1)
    }

    /// Tick `ticks` earlier, clamped at zero.
    pub fn saturating_sub(self, ticks: u64) -> Self {
        Tick(self.0.saturating_sub(ticks))
    }
}

/// Path or identifier of a tile file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileLocator(String);

impl TileLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_absolute(&self) -> bool {
        self.0.starts_with('/') || self.0.contains("://")
    }

    /// Resolve `relative` against the directory containing this locator.
    pub fn resolve(&self, relative: &str) -> TileLocator {
        let candidate = TileLocator::new(relative);
        if candidate.is_absolute() {
            return candidate;
        }
        match self.0.rfind('/') {
            Some(slash) => TileLocator(format!("{}/{}", &self.0[..slash], relative)),
            None => candidate,
        }
    }
}

impl std::fmt::Display for TileLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a node's own payload lives: entry `index` of the file at `locator`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileSource {
    pub locator: TileLocator,
    pub index: usize,
}

/// Progress of a node's children load.
///
/// Once a node leaves `NotRequested` its children are never requested
/// again unless that request is cancelled while the node stays alive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChildrenState {
    #[default]
    NotRequested,
    Requested,
    Loaded,
    /// Terminal for the session; the node draws as a leaf.
    Failed,
}

/// Residency of a node's own payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loaded,
    Failed,
}

/// One node of the LOD tree.
///
/// Children are owned through the arena's child list; `parent` is a plain id
/// used for upward lookups only.
#[derive(Debug)]
pub struct TileNode {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) depth: u32,
    pub name: String,
    /// Bounds in the scene's local space
    pub bounds: Aabb,
    /// Maximum projected size in pixels at which this node is drawn as is.
    /// Non-positive means the node is never drawn without refinement.
    pub lod_threshold: f32,
    /// File holding this node's children, if it has any
    pub children_locator: Option<TileLocator>,
    /// File entry holding this node's payload, if it has one
    pub source: Option<TileSource>,
    pub(crate) payload: Option<TilePayload>,
    pub(crate) payload_failed: bool,
    pub(crate) children_state: ChildrenState,
    pub(crate) primary: bool,
    pub(crate) last_used: Tick,
}

impl TileNode {
    /// Create a detached node. Its id and parent link are assigned when it is
    /// inserted into a tree.
    pub fn new(bounds: Aabb, lod_threshold: f32) -> Self {
        Self {
            id: NodeId(0),
            parent: None,
            children: Vec::new(),
            depth: 0,
            name: String::new(),
            bounds,
            lod_threshold,
            children_locator: None,
            source: None,
            payload: None,
            payload_failed: false,
            children_state: ChildrenState::NotRequested,
            primary: false,
            last_used: Tick::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_children(mut self, locator: TileLocator) -> Self {
        self.children_locator = Some(locator);
        self
    }

    pub fn with_source(mut self, source: TileSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_payload(mut self, payload: TilePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_displayable(&self) -> bool {
        self.lod_threshold > 0.0
    }

    pub fn is_loaded(&self) -> bool {
        self.payload.is_some()
    }

    pub fn load_state(&self) -> LoadState {
        if self.payload.is_some() {
            LoadState::Loaded
        } else if self.payload_failed {
            LoadState::Failed
        } else {
            LoadState::Unloaded
        }
    }

    /// True when this node has nothing of its own to load, or it is resident.
    pub fn has_payload_ready(&self) -> bool {
        self.payload.is_some() || self.source.is_none()
    }

    /// True when a payload could be (re)loaded for this node.
    pub fn can_reload_payload(&self) -> bool {
        self.payload.is_none() && self.source.is_some() && !self.payload_failed
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn children_state(&self) -> ChildrenState {
        self.children_state
    }

    /// Set once a children load has been submitted for this node.
    pub fn children_requested(&self) -> bool {
        self.children_state != ChildrenState::NotRequested
    }

    /// True when children are known, or can be read from a children file.
    pub fn has_children(&self) -> bool {
        self.children_locator.is_some() || !self.children.is_empty()
    }

    pub fn last_used(&self) -> Tick {
        self.last_used
    }

    pub fn payload(&self) -> Option<&TilePayload> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut TilePayload> {
        self.payload.as_mut()
    }

    pub fn touch(&mut self, now: Tick) {
        self.last_used = self.last_used.max(now);
    }

    pub(crate) fn take_payload(&mut self) -> Option<TilePayload> {
        self.payload.take()
    }

    pub(crate) fn set_payload(&mut self, payload: TilePayload) {
        self.payload = Some(payload);
        self.payload_failed = false;
    }
}
