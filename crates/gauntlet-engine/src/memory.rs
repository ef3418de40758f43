use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use gauntlet_core::traits::{Clock, SystemClock};
use gauntlet_core::types::StageResult;

/// Value stored in [`WorkflowMemory`]: a whole stage result or a derived payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MemoryValue {
    Stage(StageResult),
    Payload(serde_json::Value),
}

impl MemoryValue {
    /// Structured view: the stage's derived output, or the payload itself.
    pub fn derived(&self) -> &serde_json::Value {
        match self {
            Self::Stage(r) => &r.derived,
            Self::Payload(v) => v,
        }
    }

    /// Text view: the stage's raw payload, or the payload serialised.
    pub fn raw(&self) -> String {
        match self {
            Self::Stage(r) => r.raw.clone(),
            Self::Payload(serde_json::Value::String(s)) => s.clone(),
            Self::Payload(v) => v.to_string(),
        }
    }
}

struct Entry {
    value: Arc<MemoryValue>,
    inserted_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Metadata of one entry, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntryInfo {
    pub key: String,
    pub inserted_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

/// Bounded key/value store of past stage results, shared by every run of a process.
///
/// Overflow evicts the least recently accessed entry; ties go to the oldest
/// insertion timestamp, then to insertion order. One mutex guards the map and
/// eviction and is never held across an await point.
pub struct WorkflowMemory {
    capacity: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl WorkflowMemory {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace `key`. Returns the key evicted to make room, if any.
    ///
    /// Replacing an existing key resets both timestamps and never evicts.
    pub fn record(&self, key: impl Into<String>, value: MemoryValue) -> Option<String> {
        let key = key.into();
        let now = self.clock.now();
        let mut inner = self.lock();

        let mut evicted = None;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let victim = inner
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.accessed_at
                        .cmp(&b.accessed_at)
                        .then(a.inserted_at.cmp(&b.inserted_at))
                        .then(a.seq.cmp(&b.seq))
                })
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
                debug!(key = %victim, "Evicted memory entry");
                evicted = Some(victim);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            Entry {
                value: Arc::new(value),
                inserted_at: now,
                accessed_at: now,
                seq,
            },
        );
        evicted
    }

    /// Look up `key`, refreshing its access timestamp.
    pub fn get(&self, key: &str) -> Option<Arc<MemoryValue>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.entries.get_mut(key).map(|entry| {
            entry.accessed_at = now;
            entry.value.clone()
        })
    }

    /// Look up `key` without touching it.
    pub fn peek(&self, key: &str) -> Option<Arc<MemoryValue>> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entry metadata ordered by insertion.
    pub fn entries(&self) -> Vec<MemoryEntryInfo> {
        let inner = self.lock();
        let mut items: Vec<_> = inner.entries.iter().collect();
        items.sort_by_key(|(_, e)| e.seq);
        items
            .into_iter()
            .map(|(k, e)| MemoryEntryInfo {
                key: k.clone(),
                inserted_at: e.inserted_at,
                accessed_at: e.accessed_at,
            })
            .collect()
    }

    /// Keys starting with `prefix`, ordered by insertion.
    pub fn keys_matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.key.starts_with(prefix))
            .map(|e| e.key)
            .collect()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}
