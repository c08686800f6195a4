//! In-memory audit trail store
//!
//! The store maps project name to that project's envelopes in arrival order.
//! A single mutex guards the map; it is held for one insert or one full copy
//! and never across I/O or serialization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{AuditTrails, Envelope};

/// Concurrency-safe collection of audit trails.
#[derive(Debug, Default)]
pub struct Store {
    trails: Mutex<AuditTrails>,
    /// Bumped on every mutation
    revision: AtomicU64,
    /// Per-project bound; oldest events are evicted beyond it
    event_cap: Option<usize>,
}

impl Store {
    /// Empty, unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `trails`, e.g. from a snapshot.
    ///
    /// Projects already over `event_cap` are trimmed to their newest events.
    pub fn from_trails(mut trails: AuditTrails, event_cap: Option<usize>) -> Self {
        if let Some(cap) = event_cap {
            for events in trails.values_mut() {
                evict_oldest(events, cap);
            }
        }
        Self {
            trails: Mutex::new(trails),
            revision: AtomicU64::new(0),
            event_cap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AuditTrails> {
        // Appends cannot leave the map half-updated, so a poisoned lock is still usable.
        self.trails.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an envelope to its project's trail.
    ///
    /// Returns how many old events were evicted to respect the cap.
    pub fn append(&self, envelope: Envelope) -> usize {
        let mut trails = self.lock();
        let events = trails.entry(envelope.project_name.clone()).or_default();
        events.push(envelope);
        let evicted = match self.event_cap {
            Some(cap) => evict_oldest(events, cap),
            None => 0,
        };
        self.revision.fetch_add(1, Ordering::SeqCst);
        evicted
    }

    /// Independent copy of every trail.
    pub fn snapshot(&self) -> AuditTrails {
        self.lock().clone()
    }

    /// Total number of stored events
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of projects with a trail
    pub fn project_count(&self) -> usize {
        self.lock().len()
    }

    /// Names of all projects, sorted
    pub fn project_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Mutation counter; changes whenever the contents change
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Remove every event of `event_type` (e.g. noisy `boot` events).
    ///
    /// Returns the number of removed events. Projects left without events
    /// are dropped.
    pub fn prune_event_type(&self, event_type: &str) -> usize {
        let mut trails = self.lock();
        let mut removed = 0;
        for events in trails.values_mut() {
            let before = events.len();
            events.retain(|e| e.event_type != event_type);
            removed += before - events.len();
        }
        trails.retain(|_, events| !events.is_empty());
        if removed > 0 {
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }
}

fn evict_oldest(events: &mut Vec<Envelope>, cap: usize) -> usize {
    if events.len() <= cap {
        return 0;
    }
    let excess = events.len() - cap;
    events.drain(..excess);
    excess
}
