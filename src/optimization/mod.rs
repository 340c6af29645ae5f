//! 状态优化层：对负载的关键投影做哈希，只有内容变化时才发布新的稳定引用。
//!
//! # State Optimization Layer
//!
//! Most poll cycles return logically unchanged data. The [`StateOptimizer`]
//! derives an essential projection of each payload, strips volatile fields,
//! hashes the canonical form and only swaps in a new [`Arc`] when the hash
//! moves. Unchanged cycles hand back the previously published `Arc`, so
//! consumers can compare with [`Arc::ptr_eq`].
//!
//! ```rust
//! use poll_sync::optimization::{OptimizerConfig, RenderDecision, StateOptimizer};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let optimizer = StateOptimizer::new(OptimizerConfig::default());
//! let first = optimizer.get_stable_data(Arc::new(json!({"items": [1], "timestamp": 1})));
//! let second = optimizer.get_stable_data(Arc::new(json!({"items": [1], "timestamp": 2})));
//! assert_eq!(second.decision, RenderDecision::Prevented);
//! assert!(Arc::ptr_eq(&first.data, &second.data));
//! ```

mod extract;
mod hash;

pub use extract::{EssentialExtractor, FieldExtractor, FnExtractor, IdSetExtractor, IdentityExtractor};
pub use hash::{canonicalize, changed_fields, digest};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Fields that change every cycle regardless of content.
pub const DEFAULT_EXCLUDED_FIELDS: &[&str] = &[
    "isLoading",
    "loading",
    "timestamp",
    "lastUpdate",
    "lastUpdated",
    "processingTime",
    "stats",
    "fetchedAt",
];

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Keys dropped before hashing, at every depth: `items[i].timestamp` is
    /// ignored just like a top-level `timestamp`. Resources whose nested
    /// records carry a meaningful field of the same name should remove it
    /// with [`OptimizerConfig::without_excluded_field`].
    pub excluded_fields: Vec<String>,
    /// Keys whose array values are sorted before hashing.
    pub unordered_fields: Vec<String>,
    pub show_hash_changes: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            excluded_fields: DEFAULT_EXCLUDED_FIELDS.iter().map(|s| s.to_string()).collect(),
            unordered_fields: Vec::new(),
            show_hash_changes: false,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_excluded_field(mut self, field: impl Into<String>) -> Self {
        self.excluded_fields.push(field.into());
        self
    }

    pub fn with_excluded_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn without_excluded_field(mut self, field: &str) -> Self {
        self.excluded_fields.retain(|f| f != field);
        self
    }

    pub fn with_unordered_field(mut self, field: impl Into<String>) -> Self {
        self.unordered_fields.push(field.into());
        self
    }

    pub fn with_show_hash_changes(mut self, enabled: bool) -> Self {
        self.show_hash_changes = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderDecision {
    Allowed,
    Prevented,
    Forced,
}

/// What a cycle publishes.
#[derive(Debug, Clone)]
pub struct StableData {
    pub data: Arc<Value>,
    pub decision: RenderDecision,
    pub hash: String,
}

impl StableData {
    pub fn changed(&self) -> bool {
        self.decision != RenderDecision::Prevented
    }
}

pub trait RenderObserver: Send + Sync {
    fn on_render_allowed(&self, _stable: &StableData) {}
    fn on_render_prevented(&self, _stable: &StableData) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEvent {
    pub decision: RenderDecision,
    pub hash: String,
}

/// Keeps the most recent render events in memory.
pub struct RecordingObserver {
    capacity: usize,
    events: Mutex<VecDeque<RenderEvent>>,
}

impl RecordingObserver {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, stable: &StableData) {
        if let Ok(mut ev) = self.events.lock() {
            if ev.len() == self.capacity {
                ev.pop_front();
            }
            ev.push_back(RenderEvent {
                decision: stable.decision,
                hash: stable.hash.clone(),
            });
        }
    }

    pub fn events(&self) -> Vec<RenderEvent> {
        self.events
            .lock()
            .map(|ev| ev.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn decisions(&self) -> Vec<RenderDecision> {
        self.events().into_iter().map(|e| e.decision).collect()
    }
}

impl RenderObserver for RecordingObserver {
    fn on_render_allowed(&self, stable: &StableData) {
        self.push(stable);
    }

    fn on_render_prevented(&self, stable: &StableData) {
        self.push(stable);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizerStats {
    pub allowed: u64,
    pub prevented: u64,
    pub forced: u64,
    /// prevented / (allowed + prevented); 0 before the first cycle.
    pub render_efficiency: f64,
}

struct Snapshot {
    data: Arc<Value>,
    hash: String,
    projection: Value,
}

pub struct StateOptimizer {
    extractor: Arc<dyn EssentialExtractor>,
    excluded: HashSet<String>,
    unordered: HashSet<String>,
    show_hash_changes: bool,
    current: ArcSwapOption<Snapshot>,
    // serializes compare-and-store; readers go through `current` lock-free
    publish: Mutex<()>,
    allowed: AtomicU64,
    prevented: AtomicU64,
    forced: AtomicU64,
    observers: RwLock<Vec<Arc<dyn RenderObserver>>>,
}

impl StateOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self::with_extractor(config, Arc::new(IdentityExtractor))
    }

    pub fn with_extractor(config: OptimizerConfig, extractor: Arc<dyn EssentialExtractor>) -> Self {
        Self {
            extractor,
            excluded: config.excluded_fields.into_iter().collect(),
            unordered: config.unordered_fields.into_iter().collect(),
            show_hash_changes: config.show_hash_changes,
            current: ArcSwapOption::empty(),
            publish: Mutex::new(()),
            allowed: AtomicU64::new(0),
            prevented: AtomicU64::new(0),
            forced: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn RenderObserver>) {
        if let Ok(mut obs) = self.observers.write() {
            obs.push(observer);
        }
    }

    fn project(&self, payload: &Value) -> (Value, String) {
        let projection = canonicalize(&self.extractor.extract(payload), &self.excluded, &self.unordered);
        let hash = digest(&projection);
        (projection, hash)
    }

    /// Hash of the essential projection of `payload`.
    pub fn essential_hash(&self, payload: &Value) -> String {
        self.project(payload).1
    }

    /// Publish `payload` if its essential content changed, otherwise return
    /// the previously published reference.
    pub fn get_stable_data(&self, payload: Arc<Value>) -> StableData {
        let (projection, hash) = self.project(&payload);

        let stable = {
            let _guard = self.publish.lock().unwrap_or_else(|p| p.into_inner());
            let previous = self.current.load_full();
            match previous {
                Some(prev) if prev.hash == hash => {
                    self.prevented.fetch_add(1, Ordering::Relaxed);
                    StableData {
                        data: Arc::clone(&prev.data),
                        decision: RenderDecision::Prevented,
                        hash,
                    }
                }
                previous => {
                    if self.show_hash_changes {
                        let fields = previous
                            .as_ref()
                            .map(|p| changed_fields(&p.projection, &projection))
                            .unwrap_or_else(|| vec!["$".to_string()]);
                        debug!(
                            old_hash = previous.as_ref().map(|p| p.hash.as_str()).unwrap_or(""),
                            new_hash = %hash,
                            changed = ?fields,
                            "essential hash changed"
                        );
                    }
                    self.current.store(Some(Arc::new(Snapshot {
                        data: Arc::clone(&payload),
                        hash: hash.clone(),
                        projection,
                    })));
                    self.allowed.fetch_add(1, Ordering::Relaxed);
                    StableData {
                        data: payload,
                        decision: RenderDecision::Allowed,
                        hash,
                    }
                }
            }
        };

        self.notify(&stable);
        stable
    }

    /// Whether `payload` would publish a new reference. Mutates nothing.
    pub fn would_trigger_render(&self, payload: &Value) -> bool {
        let hash = self.essential_hash(payload);
        self.current
            .load_full()
            .map(|s| s.hash != hash)
            .unwrap_or(true)
    }

    /// Publish `payload` unconditionally.
    pub fn force_update(&self, payload: Arc<Value>) -> StableData {
        let (projection, hash) = self.project(&payload);
        {
            let _guard = self.publish.lock().unwrap_or_else(|p| p.into_inner());
            self.current.store(Some(Arc::new(Snapshot {
                data: Arc::clone(&payload),
                hash: hash.clone(),
                projection,
            })));
        }
        self.forced.fetch_add(1, Ordering::Relaxed);
        debug!(hash = %hash, "forced snapshot update");
        let stable = StableData {
            data: payload,
            decision: RenderDecision::Forced,
            hash,
        };
        self.notify(&stable);
        stable
    }

    fn notify(&self, stable: &StableData) {
        let Ok(observers) = self.observers.read() else {
            return;
        };
        for o in observers.iter() {
            match stable.decision {
                RenderDecision::Prevented => o.on_render_prevented(stable),
                RenderDecision::Allowed | RenderDecision::Forced => o.on_render_allowed(stable),
            }
        }
    }

    pub fn current(&self) -> Option<Arc<Value>> {
        self.current.load_full().map(|s| Arc::clone(&s.data))
    }

    pub fn current_hash(&self) -> Option<String> {
        self.current.load_full().map(|s| s.hash.clone())
    }

    pub fn stats(&self) -> OptimizerStats {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let prevented = self.prevented.load(Ordering::Relaxed);
        let cycles = allowed + prevented;
        OptimizerStats {
            allowed,
            prevented,
            forced: self.forced.load(Ordering::Relaxed),
            render_efficiency: if cycles == 0 {
                0.0
            } else {
                prevented as f64 / cycles as f64
            },
        }
    }

    /// Forget the published snapshot and zero the counters. Observers stay.
    pub fn reset(&self) {
        let _guard = self.publish.lock().unwrap_or_else(|p| p.into_inner());
        self.current.store(None);
        self.allowed.store(0, Ordering::Relaxed);
        self.prevented.store(0, Ordering::Relaxed);
        self.forced.store(0, Ordering::Relaxed);
    }
}

impl Default for StateOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arc(v: Value) -> Arc<Value> {
        Arc::new(v)
    }

    #[test]
    fn test_volatile_fields_reuse_reference() {
        let opt = StateOptimizer::default();
        let a = opt.get_stable_data(arc(json!({"items": [1], "timestamp": 1, "isLoading": true})));
        let b = opt.get_stable_data(arc(json!({"items": [1], "timestamp": 2, "isLoading": false})));
        let c = opt.get_stable_data(arc(json!({"items": [1], "stats": {"n": 9}})));

        assert_eq!(a.decision, RenderDecision::Allowed);
        assert_eq!(b.decision, RenderDecision::Prevented);
        assert_eq!(c.decision, RenderDecision::Prevented);
        assert!(Arc::ptr_eq(&a.data, &b.data));
        assert!(Arc::ptr_eq(&a.data, &c.data));
    }

    #[test]
    fn test_content_change_publishes_new_reference() {
        let opt = StateOptimizer::default();
        let a = opt.get_stable_data(arc(json!({"items": [1]})));
        let b = opt.get_stable_data(arc(json!({"items": [1, 2]})));
        assert_eq!(b.decision, RenderDecision::Allowed);
        assert!(!Arc::ptr_eq(&a.data, &b.data));
        assert_ne!(a.hash, b.hash);
        assert!(Arc::ptr_eq(&opt.current().unwrap(), &b.data));
    }

    #[test]
    fn test_custom_exclusion() {
        let opt = StateOptimizer::new(OptimizerConfig::new().with_excluded_field("cursor"));
        opt.get_stable_data(arc(json!({"items": [], "cursor": "x"})));
        let b = opt.get_stable_data(arc(json!({"items": [], "cursor": "y"})));
        assert_eq!(b.decision, RenderDecision::Prevented);
    }

    #[test]
    fn test_nested_exclusions_can_be_lifted() {
        let opt = StateOptimizer::default();
        opt.get_stable_data(arc(json!({"items": [{"id": "a", "timestamp": 1}]})));
        let b = opt.get_stable_data(arc(json!({"items": [{"id": "a", "timestamp": 2}]})));
        assert_eq!(b.decision, RenderDecision::Prevented);

        let opt = StateOptimizer::new(OptimizerConfig::new().without_excluded_field("timestamp"));
        opt.get_stable_data(arc(json!({"items": [{"id": "a", "timestamp": 1}]})));
        let b = opt.get_stable_data(arc(json!({"items": [{"id": "a", "timestamp": 2}]})));
        assert_eq!(b.decision, RenderDecision::Allowed);
    }

    #[test]
    fn test_reordered_id_sets_do_not_render() {
        let opt = StateOptimizer::with_extractor(
            OptimizerConfig::default(),
            Arc::new(IdSetExtractor::new(["items"])),
        );
        opt.get_stable_data(arc(json!({"items": [{"id": "a"}, {"id": "b"}]})));
        let b = opt.get_stable_data(arc(json!({"items": [{"id": "b"}, {"id": "a"}]})));
        assert_eq!(b.decision, RenderDecision::Prevented);
    }

    #[test]
    fn test_would_trigger_render_is_pure() {
        let opt = StateOptimizer::default();
        assert!(opt.would_trigger_render(&json!({"a": 1})));
        opt.get_stable_data(arc(json!({"a": 1})));
        assert!(!opt.would_trigger_render(&json!({"a": 1, "fetchedAt": 3})));
        assert!(opt.would_trigger_render(&json!({"a": 2})));

        let stats = opt.stats();
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.prevented, 0);
    }

    #[test]
    fn test_force_update_and_efficiency() {
        let opt = StateOptimizer::default();
        let first = opt.get_stable_data(arc(json!({"a": 1})));
        for _ in 0..4 {
            opt.get_stable_data(arc(json!({"a": 1})));
        }
        let forced = opt.force_update(arc(json!({"a": 1})));
        assert_eq!(forced.decision, RenderDecision::Forced);
        assert!(!Arc::ptr_eq(&first.data, &forced.data));

        let stats = opt.stats();
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.prevented, 4);
        assert_eq!(stats.forced, 1);
        assert!((stats.render_efficiency - 0.8).abs() < f64::EPSILON);

        opt.reset();
        assert!(opt.current().is_none());
        assert_eq!(opt.stats().render_efficiency, 0.0);
    }

    #[test]
    fn test_recording_observer_is_bounded() {
        let opt = StateOptimizer::default();
        let rec = Arc::new(RecordingObserver::new(3));
        opt.subscribe(rec.clone());
        for i in 0..5 {
            opt.get_stable_data(arc(json!({"i": i / 2})));
        }
        // i/2: 0,0,1,1,2 → allowed, prevented, allowed, prevented, allowed
        assert_eq!(
            rec.decisions(),
            vec![
                RenderDecision::Allowed,
                RenderDecision::Prevented,
                RenderDecision::Allowed
            ]
        );
    }
}
