//! TTL- and size-bounded result caches
//!
//! The engine keeps four kinds of derived data here: finished layouts,
//! position sets, layout geometry and viewport visibility sets. Each kind has
//! its own namespace and Rust type (see [`Cacheable`]), and every entry
//! remembers the full derivation key it was stored under. An entry whose
//! namespace, type or derivation does not match the lookup is treated as a
//! miss and dropped.
//!
//! Expiry is measured against an injectable [`Clock`], so tests can advance
//! time without sleeping.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::ConfigError;
use crate::model::NodePosition;
use crate::simulation::SimulationConfig;

/// Default maximum entry age
pub const DEFAULT_MAX_CACHE_AGE_SECS: u64 = 300;

/// Default maximum number of entries
pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

/// Default interval between periodic sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Viewport entries go stale quickly because the camera moves continuously
pub const DEFAULT_VIEWPORT_TTL_SECS: u64 = 5;

/// Grid size used to quantize camera coordinates for viewport keys
const VIEWPORT_GRID: f64 = 10.0;

/// Source of time for entry expiry
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// Monotonic wall clock
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same time, so a test can keep one handle and give the
/// other to the cache.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entries older than this are never returned
    pub max_cache_age_secs: u64,
    /// Maximum number of entries across all namespaces
    pub max_cache_size: usize,
    /// Interval between periodic sweeps
    pub sweep_interval_secs: u64,
    /// Time to live for viewport entries
    pub viewport_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_age_secs: DEFAULT_MAX_CACHE_AGE_SECS,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            viewport_ttl_secs: DEFAULT_VIEWPORT_TTL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_cache_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Cache namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheNamespace {
    Layout,
    Positions,
    Geometry,
    Viewport,
}

/// Derivation key for a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    derivation: String,
}

impl CacheKey {
    /// Key for a finished layout of a graph of this shape under this configuration
    pub fn layout(node_count: usize, edge_count: usize, config: &SimulationConfig) -> Self {
        let config = serde_json::to_string(config).unwrap_or_default();
        Self {
            derivation: format!("layout:{node_count}:{edge_count}:{config}"),
        }
    }

    /// Key for the last known positions of a graph with this many nodes
    pub fn positions(node_count: usize) -> Self {
        Self {
            derivation: format!("positions:{node_count}"),
        }
    }

    /// Key for layout geometry at a store version and layout generation
    pub fn geometry(version: u64, generation: u64) -> Self {
        Self {
            derivation: format!("geometry:{version}:{generation}"),
        }
    }

    /// Key for the visibility set of a quantized camera state
    pub fn viewport(viewport: &Viewport) -> Self {
        let [x, y, zoom, width, height] = viewport.quantized();
        Self {
            derivation: format!("viewport:{x}:{y}:{zoom}:{width}:{height}"),
        }
    }

    pub fn derivation(&self) -> &str {
        &self.derivation
    }

    fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.derivation.hash(&mut hasher);
        hasher.finish()
    }
}

/// Camera state used for visibility queries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Layout-space point at the center of the view
    pub center_x: f64,
    pub center_y: f64,
    pub zoom: f64,
    /// Screen size in pixels
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(center_x: f64, center_y: f64, zoom: f64, width: f64, height: f64) -> Self {
        Self {
            center_x,
            center_y,
            zoom,
            width,
            height,
        }
    }

    fn quantized(&self) -> [i64; 5] {
        [
            (self.center_x / VIEWPORT_GRID).round() as i64,
            (self.center_y / VIEWPORT_GRID).round() as i64,
            (self.zoom * 100.0).round() as i64,
            self.width.round() as i64,
            self.height.round() as i64,
        ]
    }

    /// Whether a circle in layout space overlaps the visible area
    pub fn contains(&self, x: f64, y: f64, radius: f64) -> bool {
        let zoom = if self.zoom > 0.0 { self.zoom } else { 1.0 };
        let half_width = self.width / (2.0 * zoom) + radius;
        let half_height = self.height / (2.0 * zoom) + radius;
        (x - self.center_x).abs() <= half_width && (y - self.center_y).abs() <= half_height
    }
}

/// Axis-aligned bounds of a layout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl LayoutBounds {
    /// Bounds of a set of positions, or `None` if it is empty
    pub fn from_positions(positions: &[NodePosition]) -> Option<Self> {
        let first = positions.first()?;
        let mut bounds = Self {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        for position in &positions[1..] {
            bounds.min_x = bounds.min_x.min(position.x);
            bounds.min_y = bounds.min_y.min(position.y);
            bounds.max_x = bounds.max_x.max(position.x);
            bounds.max_y = bounds.max_y.max(position.y);
        }
        Some(bounds)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// A finished layout
#[derive(Debug, Clone, PartialEq)]
pub struct CachedLayout {
    pub positions: Vec<NodePosition>,
    pub iterations: u64,
}

/// Last known positions of a graph
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSet(pub Vec<NodePosition>);

/// Ids of nodes visible in a viewport
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleSet(pub Vec<String>);

/// Stored value, tagged by kind
#[derive(Debug, Clone)]
pub enum CacheValue {
    Layout(CachedLayout),
    Positions(PositionSet),
    Geometry(LayoutBounds),
    Viewport(VisibleSet),
}

/// A type that can be stored in the cache
pub trait Cacheable: Clone {
    const NAMESPACE: CacheNamespace;

    fn into_value(self) -> CacheValue;

    /// Extract the typed value, or `None` if the stored kind does not match
    fn from_value(value: &CacheValue) -> Option<Self>;
}

impl Cacheable for CachedLayout {
    const NAMESPACE: CacheNamespace = CacheNamespace::Layout;

    fn into_value(self) -> CacheValue {
        CacheValue::Layout(self)
    }

    fn from_value(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Layout(layout) => Some(layout.clone()),
            _ => None,
        }
    }
}

impl Cacheable for PositionSet {
    const NAMESPACE: CacheNamespace = CacheNamespace::Positions;

    fn into_value(self) -> CacheValue {
        CacheValue::Positions(self)
    }

    fn from_value(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Positions(positions) => Some(positions.clone()),
            _ => None,
        }
    }
}

impl Cacheable for LayoutBounds {
    const NAMESPACE: CacheNamespace = CacheNamespace::Geometry;

    fn into_value(self) -> CacheValue {
        CacheValue::Geometry(self)
    }

    fn from_value(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Geometry(bounds) => Some(*bounds),
            _ => None,
        }
    }
}

impl Cacheable for VisibleSet {
    const NAMESPACE: CacheNamespace = CacheNamespace::Viewport;

    fn into_value(self) -> CacheValue {
        CacheValue::Viewport(self)
    }

    fn from_value(value: &CacheValue) -> Option<Self> {
        match value {
            CacheValue::Viewport(visible) => Some(visible.clone()),
            _ => None,
        }
    }
}

/// Cached entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Duration,
    pub derivation: String,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry<CacheValue>,
    seq: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    /// Entries dropped to respect the size bound
    pub evictions: u64,
    /// Entries dropped for age
    pub expirations: u64,
    /// Entries dropped because they did not match their key
    pub corrupted: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

type SlotKey = (CacheNamespace, u64);

/// Multi-namespace cache with age and size bounds
///
/// Single writer: the engine owns the only instance.
pub struct CacheManager {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    enabled: bool,
    entries: HashMap<SlotKey, Slot>,
    /// Insertion order by (timestamp, sequence) for oldest-first eviction
    order: BTreeMap<(Duration, u64), SlotKey>,
    next_seq: u64,
    last_sweep: Duration,
    stats: CacheStats,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("enabled", &self.enabled)
            .field("entries", &self.entries.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let last_sweep = clock.now();
        Self {
            enabled: config.enabled,
            config,
            clock,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            last_sweep,
            stats: CacheStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Enable or disable the cache
    ///
    /// Disabling drops every entry before returning.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.clear();
        }
        self.enabled = enabled;
        debug!(enabled, "cache toggled");
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn ttl(&self, namespace: CacheNamespace) -> Duration {
        match namespace {
            CacheNamespace::Viewport => Duration::from_secs(self.config.viewport_ttl_secs),
            _ => Duration::from_secs(self.config.max_cache_age_secs),
        }
    }

    fn is_expired(&self, namespace: CacheNamespace, created_at: Duration, now: Duration) -> bool {
        now.saturating_sub(created_at) >= self.ttl(namespace)
    }

    fn remove_slot(&mut self, key: &SlotKey) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&(slot.entry.created_at, slot.seq));
        Some(slot)
    }

    /// Look up a value
    pub fn get<T: Cacheable>(&mut self, key: &CacheKey) -> Option<T> {
        if !self.enabled {
            self.stats.misses += 1;
            return None;
        }
        if self.entries.len() > self.config.max_cache_size {
            self.sweep();
        }

        let slot_key = (T::NAMESPACE, key.hash_value());
        let now = self.clock.now();
        let Some(slot) = self.entries.get(&slot_key) else {
            self.stats.misses += 1;
            return None;
        };

        if self.is_expired(T::NAMESPACE, slot.entry.created_at, now) {
            self.remove_slot(&slot_key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        let value = (slot.entry.derivation == key.derivation)
            .then(|| T::from_value(&slot.entry.value))
            .flatten();
        match value {
            Some(value) => {
                self.stats.hits += 1;
                Some(value)
            }
            None => {
                debug!(key = key.derivation(), "dropping mismatched cache entry");
                self.remove_slot(&slot_key);
                self.stats.corrupted += 1;
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store a value, evicting the oldest entries if the cache is full
    pub fn put<T: Cacheable>(&mut self, key: &CacheKey, value: T) {
        if !self.enabled {
            return;
        }

        let slot_key = (T::NAMESPACE, key.hash_value());
        self.remove_slot(&slot_key);

        if self.entries.len() >= self.config.max_cache_size {
            self.sweep();
        }
        while self.entries.len() >= self.config.max_cache_size {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
            trace!(?oldest, "evicted oldest cache entry");
        }

        let created_at = self.clock.now();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((created_at, seq), slot_key);
        self.entries.insert(
            slot_key,
            Slot {
                entry: CacheEntry {
                    value: value.into_value(),
                    created_at,
                    derivation: key.derivation.clone(),
                },
                seq,
            },
        );
        self.stats.insertions += 1;
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        self.last_sweep = now;

        let expired: Vec<SlotKey> = self
            .entries
            .iter()
            .filter(|(key, slot)| self.is_expired(key.0, slot.entry.created_at, now))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.remove_slot(key);
        }
        self.stats.expirations += expired.len() as u64;
        if !expired.is_empty() {
            debug!(removed = expired.len(), "cache sweep");
        }
        expired.len()
    }

    /// Sweep if the periodic interval has elapsed since the last sweep
    pub fn maybe_sweep(&mut self) -> usize {
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        if self.clock.now().saturating_sub(self.last_sweep) >= interval {
            self.sweep()
        } else {
            0
        }
    }
}
