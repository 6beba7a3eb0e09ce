//! Background tile loader: a tokio worker that runs decodes on blocking
//! threads, highest priority first, and reports every outcome back.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::{Id, JoinHandle, JoinSet};

use crate::core::error::TileError;
use crate::core::types::Result;
use crate::tile::TileLocator;

use super::decoder::{DecodedTile, TileDecoder};
use super::request::{LoadOutcome, LoadRequest, RequestKey};

/// Concurrent tile loader.
///
/// Must be driven from synchronous code: `wait` and `shutdown` block on the
/// loader's own runtime.
pub struct TileLoader {
    /// Channel for sending load requests to the worker
    request_tx: Option<mpsc::UnboundedSender<LoadRequest>>,
    /// Channel for receiving outcomes
    result_rx: mpsc::UnboundedReceiver<LoadOutcome>,
    /// Outcomes produced locally or received while waiting
    ready: VecDeque<LoadOutcome>,
    decoder: Arc<dyn TileDecoder>,
    worker: Option<JoinHandle<()>>,
    runtime: Runtime,
}

impl TileLoader {
    /// Create a loader running at most `max_concurrent` decodes at once.
    pub fn new(decoder: Arc<dyn TileDecoder>, max_concurrent: usize) -> Result<Self> {
        let max_concurrent = max_concurrent.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_concurrent)
            .thread_name("tile-loader")
            .enable_time()
            .build()?;

        let (request_tx, request_rx) = mpsc::unbounded_channel::<LoadRequest>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<LoadOutcome>();

        let worker_decoder = decoder.clone();
        let worker = runtime.spawn(async move {
            Self::worker_loop(worker_decoder, max_concurrent, request_rx, result_tx).await;
        });

        Ok(Self {
            request_tx: Some(request_tx),
            result_rx,
            ready: VecDeque::new(),
            decoder,
            worker: Some(worker),
            runtime,
        })
    }

    async fn worker_loop(
        decoder: Arc<dyn TileDecoder>,
        max_concurrent: usize,
        mut request_rx: mpsc::UnboundedReceiver<LoadRequest>,
        result_tx: mpsc::UnboundedSender<LoadOutcome>,
    ) {
        let mut active: JoinSet<LoadOutcome> = JoinSet::new();
        let mut in_flight: HashMap<Id, (RequestKey, u64)> = HashMap::new();
        let mut queue: BinaryHeap<LoadRequest> = BinaryHeap::new();
        let mut closed = false;

        loop {
            // Start new decodes while there is capacity
            while active.len() < max_concurrent {
                let Some(request) = queue.pop() else { break };
                if !request.handle.begin() {
                    let _ = result_tx.send(LoadOutcome {
                        key: request.key,
                        ticket: request.ticket,
                        result: Err(TileError::Cancelled),
                    });
                    continue;
                }
                let key = request.key;
                let ticket = request.ticket;
                let decoder = decoder.clone();
                let abort = active.spawn_blocking(move || Self::decode_task(decoder.as_ref(), request));
                in_flight.insert(abort.id(), (key, ticket));
            }

            if closed && queue.is_empty() && active.is_empty() {
                break;
            }

            tokio::select! {
                received = request_rx.recv(), if !closed => match received {
                    Some(request) => queue.push(request),
                    None => closed = true,
                },

                Some(joined) = active.join_next_with_id(), if !active.is_empty() => {
                    let outcome = match joined {
                        Ok((id, outcome)) => {
                            in_flight.remove(&id);
                            outcome
                        }
                        Err(e) => {
                            log::warn!("Tile decode task failed: {}", e);
                            let Some((key, ticket)) = in_flight.remove(&e.id()) else { continue };
                            LoadOutcome {
                                key,
                                ticket,
                                result: Err(TileError::Parse(format!("decode task failed: {}", e))),
                            }
                        }
                    };
                    let _ = result_tx.send(outcome);
                }

                else => break,
            }
        }
        log::debug!("Tile loader worker stopped");
    }

    /// Runs on a blocking thread
    fn decode_task(decoder: &dyn TileDecoder, request: LoadRequest) -> LoadOutcome {
        let result = decoder.decode(&request.locator);
        let result = if request.handle.finish(result.is_ok()) {
            result
        } else {
            Err(TileError::Cancelled)
        };
        LoadOutcome { key: request.key, ticket: request.ticket, result }
    }

    /// Queue a request. If the worker is gone the request fails immediately
    /// with `Cancelled`, reported through the normal outcome path.
    pub fn submit(&mut self, request: LoadRequest) {
        let Some(tx) = &self.request_tx else {
            self.reject(request);
            return;
        };
        if let Err(mpsc::error::SendError(request)) = tx.send(request) {
            self.reject(request);
        }
    }

    fn reject(&mut self, request: LoadRequest) {
        request.handle.cancel();
        self.ready.push_back(LoadOutcome {
            key: request.key,
            ticket: request.ticket,
            result: Err(TileError::Cancelled),
        });
    }

    /// Next finished outcome, if any (non-blocking)
    pub fn try_recv(&mut self) -> Option<LoadOutcome> {
        self.ready.pop_front().or_else(|| self.result_rx.try_recv().ok())
    }

    /// Block until an outcome is ready or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if !self.ready.is_empty() {
            return true;
        }
        let rx = &mut self.result_rx;
        match self.runtime.block_on(async move { tokio::time::timeout(timeout, rx.recv()).await }) {
            Ok(Some(outcome)) => {
                self.ready.push_back(outcome);
                true
            }
            _ => false,
        }
    }

    /// Decode on the calling thread with the same decoder the worker uses
    pub fn decode_now(&self, locator: &TileLocator) -> Result<DecodedTile> {
        self.decoder.decode(locator)
    }

    pub fn decoder(&self) -> Arc<dyn TileDecoder> {
        self.decoder.clone()
    }

    pub fn is_running(&self) -> bool {
        self.request_tx.is_some()
    }

    /// Stop accepting requests and wait for the worker to drain.
    ///
    /// Cancel outstanding handles first to make this return promptly;
    /// decodes already running are waited for.
    pub fn shutdown(&mut self) {
        self.request_tx = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = self.runtime.block_on(worker) {
                log::warn!("Tile loader worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TileLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
