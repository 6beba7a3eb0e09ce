//! Cache manager: owns the tile trees, the pending-request table and the
//! background loader, and is the only place background results mutate the
//! trees.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;

use crate::core::error::TileError;
use crate::core::types::Result;
use crate::render::RenderSystem;
use crate::tile::{
    ChildrenState, FlushReport, MemoryKind, NodeId, Tick, TileLocator, TileNode, TileSource,
    TileTree, TraversalContext, ViewportId,
};

use super::budget::MemoryBudget;
use super::config::CacheConfig;
use super::decoder::{DecodedNode, DecodedTile, FileTileDecoder, TileDecoder};
use super::failures::{FailureAction, FailureTracker};
use super::loader::TileLoader;
use super::request::{LoadKind, LoadOutcome, LoadRequest, RequestHandle, RequestKey, RequestState};

/// Result of one [`CacheManager::process_requests`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Nothing is pending or waiting for retry
    Finished,
    /// Work is outstanding but nothing changed this pump
    None,
    /// At least one result was applied; the caller should redraw
    Processed,
}

/// Bytes held by resident payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub cpu_bytes: usize,
    pub gpu_bytes: usize,
    pub mesh_bytes: usize,
    pub texture_bytes: usize,
}

#[derive(Debug)]
struct PendingRequest {
    ticket: u64,
    handle: RequestHandle,
    viewport: ViewportId,
    locator: TileLocator,
}

/// Explicitly constructed cache for one session.
///
/// Create it at session start, pass it to whoever draws, and call
/// [`shutdown`](Self::shutdown) (or drop it) at session end to drain the
/// background worker.
pub struct CacheManager {
    config: CacheConfig,
    tree: TileTree,
    loader: TileLoader,
    pending: HashMap<RequestKey, PendingRequest>,
    failures: FailureTracker,
    budget: MemoryBudget,
    next_ticket: u64,
    pump: u64,
    now: Tick,
}

impl CacheManager {
    pub fn new(config: CacheConfig, decoder: Arc<dyn TileDecoder>) -> Result<Self> {
        config.validate()?;
        let loader = TileLoader::new(decoder, config.worker_threads)?;
        let budget = MemoryBudget::new(config.cpu_budget_mb, config.gpu_budget_mb);
        log::info!(
            "CacheManager: {} workers, stale after {} ticks, budget cpu={:?}MB gpu={:?}MB",
            config.worker_threads,
            config.stale_after_ticks,
            config.cpu_budget_mb,
            config.gpu_budget_mb
        );
        Ok(Self {
            config,
            tree: TileTree::new(),
            loader,
            pending: HashMap::new(),
            failures: FailureTracker::new(),
            budget,
            next_ticket: 0,
            pump: 0,
            now: Tick::default(),
        })
    }

    /// Cache reading tile files from `base_dir`
    pub fn with_file_decoder(config: CacheConfig, base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new(config, Arc::new(FileTileDecoder::new(base_dir)))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tree(&self) -> &TileTree {
        &self.tree
    }

    pub fn node(&self, id: NodeId) -> Option<&TileNode> {
        self.tree.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut TileNode> {
        self.tree.get_mut(id)
    }

    /// Current draw-pass tick
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Pumps processed so far
    pub fn pump_count(&self) -> u64 {
        self.pump
    }

    /// Start a draw pass: advances the tick and returns a fresh context.
    pub fn new_traversal(&mut self, viewport: ViewportId) -> TraversalContext {
        self.now = self.now.next();
        let mut ctx = TraversalContext::new(viewport, self.now);
        ctx.force_synchronous = self.config.synchronous;
        ctx
    }

    // --- Topology ---

    /// Register a scene root.
    pub fn set_root(&mut self, root: TileNode) -> NodeId {
        self.tree.insert_root(root)
    }

    /// Unregister a root, cancelling every request inside its subtree before
    /// releasing it.
    pub fn remove_root(&mut self, root: NodeId, renderer: &mut dyn RenderSystem) -> Result<()> {
        if !self.tree.is_root(root) {
            return Err(TileError::UnknownNode(root));
        }
        self.remove_subtree(root, renderer);
        Ok(())
    }

    /// Attach a node by hand (outside of any decode). A parent with no
    /// children file counts as having its children loaded from then on.
    pub fn add_child(&mut self, parent: NodeId, child: TileNode) -> Result<NodeId> {
        let id = self.tree.add_child(parent, child)?;
        if let Some(p) = self.tree.get_mut(parent) {
            if p.children_state == ChildrenState::NotRequested && p.children_locator.is_none() {
                p.children_state = ChildrenState::Loaded;
            }
        }
        Ok(id)
    }

    /// Remove a non-root node and its subtree, cancelling their requests.
    pub fn remove_child(&mut self, child: NodeId, renderer: &mut dyn RenderSystem) -> Result<()> {
        match self.tree.get(child) {
            Some(node) if node.parent().is_some() => {
                self.remove_subtree(child, renderer);
                Ok(())
            }
            _ => Err(TileError::UnknownNode(child)),
        }
    }

    fn remove_subtree(&mut self, id: NodeId, renderer: &mut dyn RenderSystem) {
        let removed = self.tree.remove(id);
        let mut cancelled = 0;
        for mut node in removed {
            cancelled += self.cancel_node_requests(node.id());
            self.failures.forget_node(node.id());
            if let Some(payload) = node.payload_mut() {
                payload.clear_graphic(renderer);
            }
        }
        if cancelled > 0 {
            log::debug!("Removed subtree {} and cancelled {} requests", id, cancelled);
        }
    }

    // --- Requests ---

    fn submit(&mut self, key: RequestKey, locator: TileLocator, viewport: ViewportId, depth: u32) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let handle = RequestHandle::new();
        self.pending.insert(
            key,
            PendingRequest { ticket, handle: handle.clone(), viewport, locator: locator.clone() },
        );
        self.loader.submit(LoadRequest {
            key,
            ticket,
            locator,
            priority: LoadRequest::priority_for_depth(depth),
            viewport,
            handle,
        });
    }

    /// Submit a children load for `node` unless one was already submitted.
    ///
    /// Returns true if a new request was queued. The node is marked as
    /// requested immediately, so repeated calls are no-ops.
    pub fn request_children(&mut self, node: NodeId, viewport: ViewportId) -> Result<bool> {
        let n = self.tree.get_mut(node).ok_or(TileError::UnknownNode(node))?;
        if n.children_state != ChildrenState::NotRequested {
            return Ok(false);
        }
        let Some(locator) = n.children_locator.clone() else {
            return Ok(false);
        };
        n.children_state = ChildrenState::Requested;
        let depth = n.depth();
        self.submit(RequestKey::children(node), locator, viewport, depth);
        Ok(true)
    }

    /// Enqueue children loads for a batch of sibling nodes, tagged with the
    /// requesting viewport. Returns how many were queued.
    pub fn queue_child_load(&mut self, nodes: &[NodeId], viewport: ViewportId) -> usize {
        nodes
            .iter()
            .filter(|&&id| matches!(self.request_children(id, viewport), Ok(true)))
            .count()
    }

    /// Request the payload of an evicted node again.
    pub fn request_payload(&mut self, node: NodeId, viewport: ViewportId) -> Result<bool> {
        let n = self.tree.get(node).ok_or(TileError::UnknownNode(node))?;
        let key = RequestKey::payload(node);
        if !n.can_reload_payload() || self.pending.contains_key(&key) || self.failures.is_waiting(key) {
            return Ok(false);
        }
        let Some(source) = n.source.clone() else {
            return Ok(false);
        };
        let depth = n.depth();
        self.submit(key, source.locator, viewport, depth);
        Ok(true)
    }

    fn cancel_key(&mut self, key: RequestKey) -> bool {
        match self.pending.remove(&key) {
            Some(entry) => {
                entry.handle.cancel();
                true
            }
            None => self.failures.cancel(key),
        }
    }

    /// Cancel both request kinds for a node. Node state is left alone.
    fn cancel_node_requests(&mut self, node: NodeId) -> usize {
        [RequestKey::children(node), RequestKey::payload(node)]
            .into_iter()
            .filter(|&key| self.cancel_key(key))
            .count()
    }

    /// A living node whose children load was cancelled may be requested again.
    fn reset_cancelled(&mut self, key: RequestKey) {
        if key.kind != LoadKind::Children {
            return;
        }
        if let Some(node) = self.tree.get_mut(key.node) {
            if node.children_state == ChildrenState::Requested {
                node.children_state = ChildrenState::NotRequested;
            }
        }
    }

    /// Cancel any pending or in-flight request for `node`. A result that is
    /// already on its way back is discarded when it arrives.
    pub fn remove_request(&mut self, node: NodeId) -> bool {
        let mut cancelled = false;
        for key in [RequestKey::children(node), RequestKey::payload(node)] {
            if self.cancel_key(key) {
                self.reset_cancelled(key);
                cancelled = true;
            }
        }
        cancelled
    }

    /// Cancel every request issued from `viewport`.
    pub fn cancel_viewport(&mut self, viewport: ViewportId) -> usize {
        let keys: Vec<RequestKey> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.viewport == viewport)
            .map(|(key, _)| *key)
            .collect();
        let mut cancelled = 0;
        for key in keys {
            if self.cancel_key(key) {
                self.reset_cancelled(key);
                cancelled += 1;
            }
        }
        for key in self.failures.cancel_viewport(viewport) {
            self.reset_cancelled(key);
            cancelled += 1;
        }
        if cancelled > 0 {
            log::debug!("Cancelled {} requests for viewport {:?}", cancelled, viewport);
        }
        cancelled
    }

    /// State of a request, if one is outstanding. Requests waiting for a
    /// retry report `Queued`.
    pub fn request_state(&self, key: RequestKey) -> Option<RequestState> {
        match self.pending.get(&key) {
            Some(entry) => Some(entry.handle.state()),
            None if self.failures.is_waiting(key) => Some(RequestState::Queued),
            None => None,
        }
    }

    /// True while any load for `node` is in flight or waiting for retry.
    pub fn is_pending(&self, node: NodeId) -> bool {
        [RequestKey::children(node), RequestKey::payload(node)]
            .into_iter()
            .any(|key| self.pending.contains_key(&key) || self.failures.is_waiting(key))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len() + self.failures.waiting_count()
    }

    /// Nodes that must not be evicted because a load is outstanding
    fn busy_nodes(&self) -> HashSet<NodeId> {
        self.pending.keys().map(|k| k.node).chain(self.failures.waiting_nodes()).collect()
    }

    // --- Synchronous loads ---

    /// Decode `node`'s children on the calling thread and splice them in.
    ///
    /// Any queued request for the same children is cancelled. Uses the same
    /// decoder and splice as the background path.
    pub fn synchronous_read(&mut self, node: NodeId) -> Result<usize> {
        let Some(locator) = self.children_to_read(node)? else {
            return Ok(self.tree.get(node).map_or(0, |n| n.children().len()));
        };
        let decoded = self.loader.decode_now(&locator);
        self.apply_synchronous(node, &locator, decoded)
    }

    /// [`synchronous_read`](Self::synchronous_read) for several nodes, decoding in parallel.
    pub fn synchronous_read_batch(&mut self, nodes: &[NodeId]) -> Vec<(NodeId, Result<usize>)> {
        let mut results = Vec::with_capacity(nodes.len());
        let mut jobs = Vec::new();
        for &id in nodes {
            match self.children_to_read(id) {
                Ok(Some(locator)) => jobs.push((id, locator)),
                Ok(None) => results.push((id, Ok(self.tree.get(id).map_or(0, |n| n.children().len())))),
                Err(e) => results.push((id, Err(e))),
            }
        }

        let decoder = self.loader.decoder();
        let decoded: Vec<_> = jobs
            .par_iter()
            .map(|(id, locator)| (*id, decoder.decode(locator)))
            .collect();

        for ((id, result), (_, locator)) in decoded.into_iter().zip(jobs.iter()) {
            results.push((id, self.apply_synchronous(id, locator, result)));
        }
        results
    }

    /// Locator to read for `node`'s children, or `None` if there is nothing to do.
    fn children_to_read(&mut self, node: NodeId) -> Result<Option<TileLocator>> {
        let n = self.tree.get(node).ok_or(TileError::UnknownNode(node))?;
        match (n.children_state, n.children_locator.clone()) {
            (ChildrenState::Loaded | ChildrenState::Failed, _) | (_, None) => Ok(None),
            (_, Some(locator)) => {
                self.cancel_key(RequestKey::children(node));
                Ok(Some(locator))
            }
        }
    }

    fn apply_synchronous(
        &mut self,
        node: NodeId,
        locator: &TileLocator,
        decoded: Result<DecodedTile>,
    ) -> Result<usize> {
        let key = RequestKey::children(node);
        match decoded {
            Ok(tile) => {
                self.failures.succeeded(key);
                self.splice_children(node, tile)
            }
            Err(e) => {
                if let Some(n) = self.tree.get_mut(node) {
                    if e.is_transient() {
                        n.children_state = ChildrenState::NotRequested;
                    } else {
                        n.children_state = ChildrenState::Failed;
                    }
                }
                if !e.is_transient() {
                    self.failures.report_permanent(key, locator, &e);
                }
                Err(e)
            }
        }
    }

    /// Decode `node`'s own payload on the calling thread if it is missing.
    pub fn load_payload_now(&mut self, node: NodeId) -> Result<bool> {
        let n = self.tree.get(node).ok_or(TileError::UnknownNode(node))?;
        if !n.can_reload_payload() {
            return Ok(false);
        }
        let Some(source) = n.source.clone() else {
            return Ok(false);
        };
        let key = RequestKey::payload(node);
        self.cancel_key(key);
        match self.loader.decode_now(&source.locator) {
            Ok(tile) => Ok(self.apply_payload(node, &source, tile)),
            Err(e) => {
                if !e.is_transient() {
                    if let Some(n) = self.tree.get_mut(node) {
                        n.payload_failed = true;
                    }
                    self.failures.report_permanent(key, &source.locator, &e);
                }
                Err(e)
            }
        }
    }

    // --- Applying results ---

    /// Fresh nodes count as used at `now` so a sweep cannot evict them
    /// before their first draw.
    fn node_from_decoded(locator: &TileLocator, decoded: DecodedNode, now: Tick) -> TileNode {
        let source = TileSource { locator: locator.clone(), index: decoded.index };
        let mut node = TileNode::new(decoded.bounds, decoded.lod_threshold)
            .with_name(decoded.name.clone())
            .with_source(source);
        node.children_locator = decoded.children.clone();
        node.touch(now);
        node.with_payload(decoded.into_payload())
    }

    /// Populate `node`'s children from a decoded children file. Applied at
    /// most once per node.
    fn splice_children(&mut self, node: NodeId, tile: DecodedTile) -> Result<usize> {
        let n = self.tree.get(node).ok_or(TileError::UnknownNode(node))?;
        if n.children_state == ChildrenState::Loaded {
            return Ok(n.children().len());
        }
        let Some(locator) = n.children_locator.clone() else {
            return Ok(0);
        };

        let count = tile.nodes.len();
        let now = self.now;
        for decoded in tile.nodes {
            self.tree.add_child(node, Self::node_from_decoded(&locator, decoded, now))?;
        }
        if let Some(n) = self.tree.get_mut(node) {
            n.children_state = ChildrenState::Loaded;
        }
        log::debug!(
            "Spliced {} children into {} from {} ({} rejected)",
            count,
            node,
            locator,
            tile.rejected.len()
        );
        Ok(count)
    }

    fn apply_payload(&mut self, node: NodeId, source: &TileSource, mut tile: DecodedTile) -> bool {
        let now = self.now;
        let Some(n) = self.tree.get_mut(node) else {
            return false;
        };
        if n.is_loaded() {
            return false;
        }
        match tile.take_entry(source.index) {
            Some(entry) => {
                n.set_payload(entry.into_payload());
                n.touch(now);
                true
            }
            None => {
                n.payload_failed = true;
                let error = TileError::Parse(format!("entry {} missing from {}", source.index, source.locator));
                self.failures.report_permanent(RequestKey::payload(node), &source.locator, &error);
                true
            }
        }
    }

    /// Apply one outcome. Returns true if the tree changed.
    fn apply_outcome(&mut self, outcome: LoadOutcome) -> bool {
        let key = outcome.key;
        match self.pending.get(&key) {
            Some(entry) if entry.ticket == outcome.ticket => {}
            _ => {
                log::trace!("Discarding stale result for {} ({:?})", key.node, key.kind);
                return false;
            }
        }
        let Some(entry) = self.pending.remove(&key) else {
            return false;
        };

        match outcome.result {
            Ok(tile) => {
                self.failures.succeeded(key);
                match key.kind {
                    LoadKind::Children => self.splice_children(key.node, tile).is_ok(),
                    LoadKind::Payload => {
                        let source = TileSource { locator: entry.locator, index: self.source_index(key.node) };
                        self.apply_payload(key.node, &source, tile)
                    }
                }
            }
            Err(TileError::Cancelled) => {
                self.reset_cancelled(key);
                false
            }
            Err(e) => {
                let action =
                    self.failures.record(key, entry.viewport, &entry.locator, &e, self.pump, &self.config);
                match action {
                    FailureAction::Retry { .. } => false,
                    FailureAction::GiveUp => {
                        self.mark_failed(key);
                        true
                    }
                }
            }
        }
    }

    fn source_index(&self, node: NodeId) -> usize {
        self.tree.get(node).and_then(|n| n.source.as_ref()).map_or(0, |s| s.index)
    }

    fn mark_failed(&mut self, key: RequestKey) {
        let Some(node) = self.tree.get_mut(key.node) else { return };
        match key.kind {
            LoadKind::Children => node.children_state = ChildrenState::Failed,
            LoadKind::Payload => node.payload_failed = true,
        }
    }

    fn resubmit_due_retries(&mut self) {
        for retry in self.failures.take_due(self.pump) {
            let Some(node) = self.tree.get(retry.key.node) else { continue };
            let locator = match retry.key.kind {
                LoadKind::Children => node.children_locator.clone(),
                LoadKind::Payload => node.source.as_ref().map(|s| s.locator.clone()),
            };
            let Some(locator) = locator else { continue };
            let depth = node.depth();
            self.submit(retry.key, locator, retry.viewport, depth);
        }
    }

    /// Drain up to one pump's worth of finished loads and splice them into
    /// the trees. Must be called from the thread that draws.
    pub fn process_requests(&mut self) -> ProcessResult {
        self.pump += 1;
        self.resubmit_due_retries();

        let mut applied = 0;
        for _ in 0..self.config.max_completions_per_pump {
            let Some(outcome) = self.loader.try_recv() else { break };
            if self.apply_outcome(outcome) {
                applied += 1;
            }
        }

        if applied > 0 {
            ProcessResult::Processed
        } else if self.pending.is_empty() && self.failures.waiting_count() == 0 {
            ProcessResult::Finished
        } else {
            ProcessResult::None
        }
    }

    /// Block until the loader has a result ready or `timeout` passes.
    pub fn wait_for_completions(&mut self, timeout: Duration) -> bool {
        self.loader.wait(timeout)
    }

    // --- Eviction ---

    /// Evict payloads of non-primary, idle nodes last used before `stale_time`.
    pub fn flush(&mut self, stale_time: Tick, renderer: &mut dyn RenderSystem) -> FlushReport {
        let busy = self.busy_nodes();
        let roots = self.tree.roots().to_vec();
        let mut total = FlushReport::default();
        for root in roots {
            let report = self.tree.flush_stale(root, stale_time, &busy, renderer);
            total.payloads += report.payloads;
            total.bytes += report.bytes;
        }
        if total.payloads > 0 {
            log::debug!("Flushed {} stale payloads ({} bytes)", total.payloads, total.bytes);
        }
        total
    }

    /// Release GPU resources of nodes last used before `stale_time`.
    pub fn clear_stale_graphics(&mut self, stale_time: Tick, renderer: &mut dyn RenderSystem) -> usize {
        let roots = self.tree.roots().to_vec();
        roots
            .into_iter()
            .map(|root| self.tree.clear_stale_graphics(root, stale_time, renderer))
            .sum()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            cpu_bytes: self.tree.total_memory(MemoryKind::Total),
            gpu_bytes: self.tree.total_memory(MemoryKind::Gpu),
            mesh_bytes: self.tree.total_memory(MemoryKind::Mesh),
            texture_bytes: self.tree.total_memory(MemoryKind::Texture),
        }
    }

    fn refresh_budget(&mut self) {
        let usage = self.memory_usage();
        self.budget.set_usage(usage.cpu_bytes, usage.gpu_bytes);
    }

    /// Evict progressively younger payloads while memory pressure is high.
    pub fn evict_to_budget(&mut self, renderer: &mut dyn RenderSystem) -> FlushReport {
        let mut total = FlushReport::default();
        if !self.budget.is_limited() {
            return total;
        }
        self.refresh_budget();
        if !self.budget.should_evict() {
            return total;
        }
        let before = self.budget.cpu_used();

        let mut age = self.config.stale_after_ticks;
        loop {
            age /= 2;
            let stale_time = self.now.saturating_sub(age);
            if self.budget.gpu_pressure() > self.budget.cpu_pressure() {
                self.clear_stale_graphics(stale_time, renderer);
            }
            let report = self.flush(stale_time, renderer);
            total.payloads += report.payloads;
            total.bytes += report.bytes;
            self.refresh_budget();
            if self.budget.is_under_target() || age == 0 {
                break;
            }
        }
        log::debug!(
            "Evicted {} payloads to enforce budget (usage: {} -> {})",
            total.payloads,
            before,
            self.budget.cpu_used()
        );
        total
    }

    /// One idle-loop iteration: apply finished loads and, every
    /// `flush_interval_pumps`, run the staleness sweeps and budget check.
    pub fn pump(&mut self, renderer: &mut dyn RenderSystem) -> ProcessResult {
        let result = self.process_requests();
        let interval = self.config.flush_interval_pumps;
        if interval > 0 && self.pump % interval == 0 {
            if let Some(ticks) = self.config.graphic_stale_after_ticks {
                self.clear_stale_graphics(self.now.saturating_sub(ticks), renderer);
            }
            self.flush(self.now.saturating_sub(self.config.stale_after_ticks), renderer);
            self.evict_to_budget(renderer);
        }
        result
    }

    /// Cancel everything outstanding and stop the background worker.
    pub fn shutdown(&mut self) {
        for entry in self.pending.values() {
            entry.handle.cancel();
        }
        let keys: Vec<RequestKey> = self.pending.drain().map(|(key, _)| key).collect();
        for key in keys {
            self.reset_cancelled(key);
        }
        self.failures.clear();
        self.loader.shutdown();
        while self.loader.try_recv().is_some() {}
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
