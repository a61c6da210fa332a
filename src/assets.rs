//! Static Assets - Fetched Once, Reused By Every Engine
//!
//! The hosting environment supplies bytes through an [`AssetSource`]. The
//! caches here are process-wide: the first successful fetch is kept until
//! an explicit `reset`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::field::KeycapModel;

pub const FONT_ASSET: &str = "Inter-18pt-Noto-Regular.ttf";
pub const DEFAULT_TEMPLATE_NAME: &str = "Keycap.scad";

#[derive(Debug, Clone, Error)]
#[error("Failed to fetch asset {name}: {reason}")]
pub struct AssetFetchError {
    pub name: String,
    pub reason: String,
}

impl AssetFetchError {
    pub fn new(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Byte retrieval capability supplied by the host
pub trait AssetSource: Send + Sync {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, AssetFetchError>;

    fn fetch_text(&self, name: &str) -> Result<String, AssetFetchError> {
        let bytes = self.fetch(name)?;
        String::from_utf8(bytes).map_err(|e| AssetFetchError::new(name, e.to_string()))
    }
}

/// Serves assets from a directory on disk
#[derive(Debug, Clone)]
pub struct DirAssetSource {
    root: PathBuf,
}

impl DirAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for DirAssetSource {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, AssetFetchError> {
        let path = self.root.join(name);
        fs::read(&path).map_err(|e| AssetFetchError::new(name, format!("{}: {}", path.display(), e)))
    }
}

/// In-memory source; counts fetches
#[derive(Debug, Default)]
pub struct MemoryAssetSource {
    entries: HashMap<String, Vec<u8>>,
    fetches: AtomicUsize,
}

impl MemoryAssetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(name.to_string(), bytes.into());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl AssetSource for MemoryAssetSource {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, AssetFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| AssetFetchError::new(name, "not found"))
    }
}

/// Font plus one base shape per model
#[derive(Debug, Clone)]
pub struct StaticAssets {
    pub font: Vec<u8>,
    shapes: [Vec<u8>; 3],
}

impl StaticAssets {
    pub fn fetch(source: &dyn AssetSource) -> Result<Self, AssetFetchError> {
        let font = source.fetch(FONT_ASSET)?;
        let [normal, pit, flat] = KeycapModel::all();
        let shapes = [
            source.fetch(normal.shape_path())?,
            source.fetch(pit.shape_path())?,
            source.fetch(flat.shape_path())?,
        ];
        Ok(Self { font, shapes })
    }

    pub fn shape(&self, model: KeycapModel) -> &[u8] {
        let idx = match model {
            KeycapModel::Normal => 0,
            KeycapModel::Pit => 1,
            KeycapModel::Flat => 2,
        };
        &self.shapes[idx]
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write-once cache of [`StaticAssets`]
pub struct AssetCache {
    slot: Mutex<Option<Arc<StaticAssets>>>,
}

impl AssetCache {
    pub const fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    /// Return the cached assets, fetching them on first use.
    ///
    /// A failed fetch leaves the cache empty so the next call retries.
    pub fn get_or_fetch(&self, source: &dyn AssetSource) -> Result<Arc<StaticAssets>, AssetFetchError> {
        let mut slot = lock(&self.slot);
        if let Some(assets) = slot.as_ref() {
            return Ok(Arc::clone(assets));
        }

        info!("Loading static engine assets");
        let assets = Arc::new(StaticAssets::fetch(source)?);
        *slot = Some(Arc::clone(&assets));
        Ok(assets)
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn reset(&self) {
        debug!("Static asset cache reset");
        *lock(&self.slot) = None;
    }
}

impl Default for AssetCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-once cache of the base script template
pub struct TemplateCache {
    slot: Mutex<Option<Arc<str>>>,
}

impl TemplateCache {
    pub const fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    pub fn get_or_fetch(&self, source: &dyn AssetSource, name: &str) -> Result<Arc<str>, AssetFetchError> {
        let mut slot = lock(&self.slot);
        if let Some(text) = slot.as_ref() {
            return Ok(Arc::clone(text));
        }

        info!(template = name, "Fetching script template");
        let text: Arc<str> = Arc::from(source.fetch_text(name)?);
        *slot = Some(Arc::clone(&text));
        Ok(text)
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn reset(&self) {
        *lock(&self.slot) = None;
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide static asset cache
pub static STATIC_ASSETS: AssetCache = AssetCache::new();

/// Process-wide script template cache
pub static SCRIPT_TEMPLATE: TemplateCache = TemplateCache::new();
