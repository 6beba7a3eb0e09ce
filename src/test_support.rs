//! Shared fixtures for unit tests: an in-memory decoder that can hold a
//! decode in flight or fail on demand, a render system that records what it
//! draws, and a view with fixed answers.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use glam::{Mat4, Vec3};

use crate::core::error::TileError;
use crate::core::logging;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::render::{GraphicHandle, RenderSystem, ViewContext};
use crate::streaming::tile_file::{TileFileData, TileNodeData};
use crate::streaming::{CacheConfig, CacheManager, DecodedTile, ProcessResult, TileDecoder};
use crate::tile::{MeshData, TextureData, TileLocator, TilePayload};

const GATE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn unit_bounds() -> Aabb {
    Aabb::new(Vec3::ZERO, Vec3::ONE)
}

/// One triangle whose first vertex has `x == marker`
pub fn marker_mesh(marker: f32) -> MeshData {
    MeshData::triangles(
        vec![[marker, 0.0, 0.0], [marker + 1.0, 0.0, 0.0], [marker, 1.0, 0.0]],
        vec![0, 1, 2],
    )
}

pub fn marker_payload(marker: f32) -> TilePayload {
    TilePayload::new(vec![marker_mesh(marker)], Vec::new())
}

/// File entry whose marker equals its threshold
pub fn leaf_entry(name: &str, bounds: Aabb, lod_threshold: f32) -> TileNodeData {
    TileNodeData::new(name, bounds, lod_threshold).with_mesh(&marker_mesh(lod_threshold))
}

/// Released after [`Gate::open`], or after a timeout so a failing test
/// cannot hang the worker forever.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn open(&self) {
        if let Ok(mut open) = self.open.lock() {
            *open = true;
        }
        self.cv.notify_all();
    }

    fn wait(&self) {
        let Ok(guard) = self.open.lock() else { return };
        let _ = self.cv.wait_timeout_while(guard, GATE_TIMEOUT, |open| !*open);
    }
}

#[derive(Default)]
pub struct MemoryDecoder {
    files: Mutex<HashMap<String, TileFileData>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    failures: Mutex<HashMap<String, (u32, io::ErrorKind)>>,
    counts: Mutex<HashMap<String, usize>>,
    started: Mutex<HashSet<String>>,
    started_cv: Condvar,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, locator: &str, nodes: Vec<TileNodeData>) {
        self.files.lock().unwrap().insert(locator.to_string(), TileFileData::new(nodes));
    }

    /// Leaves (threshold 0) splitting the unit cube along x, one per marker
    pub fn insert_leaves(&self, locator: &str, markers: &[f32]) {
        let n = markers.len() as f32;
        let nodes = markers
            .iter()
            .enumerate()
            .map(|(i, &marker)| {
                let bounds = Aabb::new(
                    Vec3::new(i as f32 / n, 0.0, 0.0),
                    Vec3::new((i + 1) as f32 / n, 1.0, 1.0),
                );
                TileNodeData::new(format!("leaf-{}", i), bounds, 0.0).with_mesh(&marker_mesh(marker))
            })
            .collect();
        self.insert(locator, nodes);
    }

    /// Hold decodes of `locator` until the returned gate opens
    pub fn gate(&self, locator: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().insert(locator.to_string(), gate.clone());
        gate
    }

    /// Fail the next `times` decodes of `locator` with an I/O error
    pub fn fail_times(&self, locator: &str, times: u32, kind: io::ErrorKind) {
        self.failures.lock().unwrap().insert(locator.to_string(), (times, kind));
    }

    pub fn decode_count(&self, locator: &str) -> usize {
        self.counts.lock().unwrap().get(locator).copied().unwrap_or(0)
    }

    /// Block until a decode of `locator` has started
    pub fn wait_started(&self, locator: &str) {
        let started = self.started.lock().unwrap();
        let (started, _) = self
            .started_cv
            .wait_timeout_while(started, GATE_TIMEOUT, |s| !s.contains(locator))
            .unwrap();
        assert!(started.contains(locator), "decode of {} never started", locator);
    }
}

impl TileDecoder for MemoryDecoder {
    fn decode(&self, locator: &TileLocator) -> Result<DecodedTile> {
        let key = locator.as_str().to_string();
        *self.counts.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        self.started.lock().unwrap().insert(key.clone());
        self.started_cv.notify_all();

        let gate = self.gates.lock().unwrap().get(&key).cloned();
        if let Some(gate) = gate {
            gate.wait();
        }

        if let Some((remaining, kind)) = self.failures.lock().unwrap().get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TileError::Io(io::Error::new(*kind, "injected failure")));
            }
        }

        let data = self.files.lock().unwrap().get(&key).cloned();
        match data {
            Some(data) => Ok(DecodedTile::from_file_data(locator, data)),
            None => Err(TileError::NotFound(key)),
        }
    }
}

/// Render system that hands out sequential handles and records draws
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    pub created: usize,
    pub released: usize,
    pub fail_creates: bool,
    pub drawn: Vec<(GraphicHandle, Mat4)>,
    markers: HashMap<GraphicHandle, f32>,
    next: u64,
}

impl RecordingRenderer {
    /// A renderer whose graphic creation always fails
    pub fn failing() -> Self {
        Self { fail_creates: true, ..Default::default() }
    }

    /// Marker (first vertex x) of every drawn graphic, in draw order
    pub fn drawn_markers(&self) -> Vec<f32> {
        self.drawn.iter().filter_map(|(h, _)| self.markers.get(h).copied()).collect()
    }
}

impl RenderSystem for RecordingRenderer {
    fn create_graphic(&mut self, meshes: &[MeshData], _textures: &[TextureData]) -> Result<GraphicHandle> {
        if self.fail_creates {
            return Err(TileError::Resource("out of graphics memory".into()));
        }
        self.next += 1;
        self.created += 1;
        let handle = GraphicHandle(self.next);
        let marker = meshes.first().and_then(|m| m.positions.first()).map_or(f32::NAN, |p| p[0]);
        self.markers.insert(handle, marker);
        Ok(handle)
    }

    fn draw_graphic(&mut self, graphic: GraphicHandle, transform: &Mat4) {
        self.drawn.push((graphic, *transform));
    }

    fn release_graphic(&mut self, graphic: GraphicHandle) {
        self.released += 1;
        self.markers.remove(&graphic);
    }
}

/// View with a fixed visible region and a constant pixel size
#[derive(Clone, Debug)]
pub struct FixedView {
    region: Option<Aabb>,
    pixel_size: f32,
}

impl FixedView {
    pub fn everything(pixel_size: f32) -> Self {
        Self { region: Some(Aabb::new(Vec3::splat(-1.0e9), Vec3::splat(1.0e9))), pixel_size }
    }

    pub fn nothing() -> Self {
        Self { region: None, pixel_size: 1.0 }
    }

    pub fn region(region: Aabb, pixel_size: f32) -> Self {
        Self { region: Some(region), pixel_size }
    }
}

impl ViewContext for FixedView {
    fn is_visible(&self, bounds: &Aabb, transform: &Mat4) -> bool {
        self.region.is_some_and(|r| r.intersects(&bounds.transformed(transform)))
    }

    fn pixel_size_at(&self, _point: Vec3) -> f32 {
        self.pixel_size
    }
}

pub fn manager_with(decoder: Arc<MemoryDecoder>, config: CacheConfig) -> CacheManager {
    logging::try_init();
    CacheManager::new(config, decoder).unwrap()
}

/// Pump until nothing is pending
pub fn drain_until_idle(cache: &mut CacheManager) {
    for _ in 0..500 {
        if cache.process_requests() == ProcessResult::Finished {
            return;
        }
        cache.wait_for_completions(Duration::from_millis(20));
    }
    panic!("cache never became idle ({} pending)", cache.pending_count());
}
