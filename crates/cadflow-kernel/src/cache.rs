//! Bounded per-worker geometry cache
//!
//! Computed geometry sets are retained per geometry id so exports can run
//! without recomputing. The cache holds at most `capacity` entries with
//! least-recently-used eviction; both lookups and inserts refresh recency.

use std::collections::HashMap;

use crate::protocol::Geometry;

/// Default number of geometry sets retained per worker.
pub const MAX_STORED_GEOMETRIES: usize = 5;

/// LRU cache of computed geometry sets keyed by geometry id.
///
/// Storage is a map; recency is an ordered list of ids with the most
/// recently used at the back. Capacities are small (5 in production), so
/// the list scan on promote stays cheap.
#[derive(Debug)]
pub struct GeometryCache {
    capacity: usize,
    entries: HashMap<String, Vec<Geometry>>,
    recency: Vec<String>,
}

impl GeometryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: Vec::new(),
        }
    }

    /// Store a geometry set, refreshing recency. Returns the evicted id if
    /// the insert overflowed the capacity.
    pub fn put(&mut self, geometry_id: impl Into<String>, shapes: Vec<Geometry>) -> Option<String> {
        let geometry_id = geometry_id.into();
        self.promote(&geometry_id);
        self.entries.insert(geometry_id, shapes);

        if self.entries.len() > self.capacity {
            let evicted = self.recency.remove(0);
            self.entries.remove(&evicted);
            return Some(evicted);
        }
        None
    }

    /// Look up a geometry set, refreshing recency on hit.
    pub fn get(&mut self, geometry_id: &str) -> Option<&Vec<Geometry>> {
        if !self.entries.contains_key(geometry_id) {
            return None;
        }
        self.promote(geometry_id);
        self.entries.get(geometry_id)
    }

    /// Whether a geometry set is cached, without refreshing recency.
    pub fn contains(&self, geometry_id: &str) -> bool {
        self.entries.contains_key(geometry_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all cached sets.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Move the id to the most-recent position.
    fn promote(&mut self, geometry_id: &str) {
        self.recency.retain(|id| id != geometry_id);
        self.recency.push(geometry_id.to_string());
    }
}

impl Default for GeometryCache {
    fn default() -> Self {
        Self::new(MAX_STORED_GEOMETRIES)
    }
}
