//! Failure bookkeeping: bounded retries for transient errors, one report
//! per permanent failure.

use std::collections::{HashMap, HashSet};

use crate::core::error::TileError;
use crate::tile::{NodeId, TileLocator, ViewportId};

use super::config::CacheConfig;
use super::request::RequestKey;

/// A request waiting for its backoff to expire.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingRetry {
    pub key: RequestKey,
    pub viewport: ViewportId,
    /// Pump at which the request is submitted again
    pub due: u64,
    pub attempt: u32,
}

/// What to do with a failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureAction {
    Retry { attempt: u32, due: u64 },
    /// Mark the node terminally failed for this session
    GiveUp,
}

#[derive(Debug, Default)]
pub struct FailureTracker {
    attempts: HashMap<RequestKey, u32>,
    retries: Vec<PendingRetry>,
    reported: HashSet<RequestKey>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a failure and schedule a retry when that is still allowed.
    pub fn record(
        &mut self,
        key: RequestKey,
        viewport: ViewportId,
        locator: &TileLocator,
        error: &TileError,
        pump: u64,
        config: &CacheConfig,
    ) -> FailureAction {
        if error.is_transient() {
            let attempt = self.attempts.entry(key).or_insert(0);
            *attempt += 1;
            if *attempt <= config.max_retries {
                let attempt = *attempt;
                let due = pump + config.retry_delay(attempt);
                log::debug!("Retrying {} ({:?}) at pump {} after: {}", locator, key.kind, due, error);
                self.retries.retain(|r| r.key != key);
                self.retries.push(PendingRetry { key, viewport, due, attempt });
                return FailureAction::Retry { attempt, due };
            }
        }

        self.report_permanent(key, locator, error);
        FailureAction::GiveUp
    }

    /// Log a permanent failure, once per request key.
    pub fn report_permanent(&mut self, key: RequestKey, locator: &TileLocator, error: &TileError) {
        self.attempts.remove(&key);
        if self.reported.insert(key) {
            log::warn!("Giving up on tile {} for node {}: {}", locator, key.node, error);
        }
    }

    /// Forget the attempt count after a success.
    pub fn succeeded(&mut self, key: RequestKey) {
        self.attempts.remove(&key);
    }

    /// Remove and return every retry due at or before `pump`.
    pub fn take_due(&mut self, pump: u64) -> Vec<PendingRetry> {
        let (due, waiting): (Vec<_>, Vec<_>) = self.retries.drain(..).partition(|r| r.due <= pump);
        self.retries = waiting;
        due
    }

    pub fn is_waiting(&self, key: RequestKey) -> bool {
        self.retries.iter().any(|r| r.key == key)
    }

    /// Nodes with a retry scheduled
    pub fn waiting_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.retries.iter().map(|r| r.key.node)
    }

    pub fn waiting_count(&self) -> usize {
        self.retries.len()
    }

    /// Drop a scheduled retry. Returns true if one existed.
    pub fn cancel(&mut self, key: RequestKey) -> bool {
        let before = self.retries.len();
        self.retries.retain(|r| r.key != key);
        self.attempts.remove(&key);
        before != self.retries.len()
    }

    /// Forget everything about a node leaving the tree: its retries, attempt
    /// counts and failure reports. Returns the keys of dropped retries.
    pub fn forget_node(&mut self, node: NodeId) -> Vec<RequestKey> {
        self.attempts.retain(|key, _| key.node != node);
        self.reported.retain(|key| key.node != node);
        self.cancel_where(|r| r.key.node == node)
    }

    /// Whether a permanent failure was already reported for `key`.
    pub fn is_reported(&self, key: RequestKey) -> bool {
        self.reported.contains(&key)
    }

    /// Drop every retry issued from `viewport`, returning their keys.
    pub fn cancel_viewport(&mut self, viewport: ViewportId) -> Vec<RequestKey> {
        self.cancel_where(|r| r.viewport == viewport)
    }

    fn cancel_where(&mut self, mut matches: impl FnMut(&PendingRetry) -> bool) -> Vec<RequestKey> {
        let mut cancelled = Vec::new();
        self.retries.retain(|r| {
            if matches(r) {
                cancelled.push(r.key);
                false
            } else {
                true
            }
        });
        for key in &cancelled {
            self.attempts.remove(key);
        }
        cancelled
    }

    pub fn clear(&mut self) {
        self.retries.clear();
        self.attempts.clear();
    }
}
