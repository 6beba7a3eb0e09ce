//! Load requests and their cancellable state machine

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};

use crate::core::types::Result;
use crate::tile::{NodeId, TileLocator, ViewportId};

use super::decoder::DecodedTile;

/// What a request loads for its node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadKind {
    /// Decode the node's children file and splice the children in
    Children,
    /// Decode the node's own source file again after its payload was evicted
    Payload,
}

/// Key of a pending request. At most one request per key is ever in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub node: NodeId,
    pub kind: LoadKind,
}

impl RequestKey {
    pub fn children(node: NodeId) -> Self {
        Self { node, kind: LoadKind::Children }
    }

    pub fn payload(node: NodeId) -> Self {
        Self { node, kind: LoadKind::Payload }
    }
}

/// Lifecycle of one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Queued = 0,
    Loading = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Loading,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Shared state of one request, observed by both the worker and the owner.
///
/// Transitions only move forward; cancellation wins over any state that is
/// not yet terminal.
#[derive(Clone, Debug)]
pub struct RequestHandle {
    state: Arc<AtomicU8>,
}

impl RequestHandle {
    pub fn new() -> Self {
        Self { state: Arc::new(AtomicU8::new(RequestState::Queued as u8)) }
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    /// Queued -> Loading. False if the request was cancelled first.
    pub fn begin(&self) -> bool {
        self.transition(RequestState::Queued, RequestState::Loading)
    }

    /// Loading -> Completed/Failed. False if cancelled during the decode.
    pub fn finish(&self, success: bool) -> bool {
        let to = if success { RequestState::Completed } else { RequestState::Failed };
        self.transition(RequestState::Loading, to)
    }

    /// Cancel unless already terminal. Returns true if this call cancelled it.
    pub fn cancel(&self) -> bool {
        let mut current = self.state.load(AtomicOrdering::Acquire);
        loop {
            if RequestState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                RequestState::Cancelled as u8,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for RequestHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Work item sent to the background loader.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub key: RequestKey,
    /// Epoch of the pending entry that issued this request
    pub ticket: u64,
    pub locator: TileLocator,
    /// Higher loads first
    pub priority: f32,
    pub viewport: ViewportId,
    pub handle: RequestHandle,
}

impl LoadRequest {
    /// Shallower nodes first, so coarse detail fills the view before fine detail.
    pub fn priority_for_depth(depth: u32) -> f32 {
        1.0 / (depth as f32 + 1.0)
    }
}

impl Eq for LoadRequest {}

impl PartialEq for LoadRequest {
    fn eq(&self, other: &Self) -> bool {
        self.ticket == other.ticket
    }
}

impl Ord for LoadRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority; among equals the older ticket wins
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}

impl PartialOrd for LoadRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of a request, sent back from the loader.
#[derive(Debug)]
pub struct LoadOutcome {
    pub key: RequestKey,
    pub ticket: u64,
    pub result: Result<DecodedTile>,
}
