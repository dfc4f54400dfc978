//! Content-addressed, hit-counted, size-bounded sample cache.
//!
//! Grounded on `samplecache.cpp`: a 64-bucket map keyed by effect id, a
//! two-pass purge (age, then lowest-hit-count-first by size), and refresh
//! quiescence around eviction so a channel's buffer is never pulled out
//! from under an in-flight refresh.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::{AudienceBus, SampleRemove};
use crate::refresh::RefreshGate;
use crate::sample::{resample, Sample, UpsampleFactor};

/// ~10 seconds at the original engine's 35 Hz tick rate.
pub const PURGE_INTERVAL_MS: u64 = 10_000;
/// ~4 minutes of game time.
pub const MAX_CACHE_AGE_MS: u64 = 4 * 60 * 1000;
pub const MAX_CACHE_BYTES: usize = 4 * 1024 * 1024;

/// Raw PCM handed to the cache by the (out-of-scope) file-loading
/// collaborator. The cache itself never touches a filesystem.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub effect_id: i32,
    pub group: i32,
    pub bytes_per_sample: u8,
    pub rate_hz: u32,
    pub num_samples: u32,
    pub data: Vec<u8>,
}

/// Supplies raw waveform bytes for an effect id. Implemented by whatever
/// asset layer sits above this crate; `NullSampleSource` is used in tests
/// and when no loader has been configured.
pub trait SampleSource: Send + Sync {
    fn load(&self, effect_id: i32) -> Option<RawSample>;
}

pub struct NullSampleSource;

impl SampleSource for NullSampleSource {
    fn load(&self, _effect_id: i32) -> Option<RawSample> {
        None
    }
}

/// The system-wide format every cached sample is converted to.
#[derive(Debug, Clone, Copy)]
pub struct TargetFormat {
    pub rate_hz: u32,
    pub bytes_per_sample: u8,
}

impl Default for TargetFormat {
    fn default() -> Self {
        Self {
            rate_hz: 11025,
            bytes_per_sample: 1,
        }
    }
}

fn upsample_factor_for(input_rate: u32, target_rate: u32) -> UpsampleFactor {
    if target_rate <= input_rate || input_rate == 0 {
        return UpsampleFactor::X1;
    }
    let ratio = target_rate / input_rate;
    if ratio >= 4 {
        UpsampleFactor::X4
    } else if ratio >= 2 {
        UpsampleFactor::X2
    } else {
        UpsampleFactor::X1
    }
}

struct CacheItem {
    sample: Arc<Sample>,
    hits: u32,
    last_used_ms: u64,
}

struct Inner {
    items: HashMap<i32, CacheItem>,
    total_bytes: usize,
    last_purge_ms: u64,
}

/// Thread-shared sample cache. Cheap to clone (it's an `Arc` wrapper).
pub struct SampleCache {
    inner: Mutex<Inner>,
    source: Arc<dyn SampleSource>,
    format: Mutex<TargetFormat>,
    refresh: Arc<dyn RefreshGate>,
    events: Arc<AudienceBus>,
}

impl SampleCache {
    pub fn new(
        source: Arc<dyn SampleSource>,
        format: TargetFormat,
        refresh: Arc<dyn RefreshGate>,
        events: Arc<AudienceBus>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                total_bytes: 0,
                last_purge_ms: 0,
            }),
            source,
            format: Mutex::new(format),
            refresh,
            events,
        }
    }

    /// Changes the target format for future conversions and drops every
    /// currently cached sample (they were converted for the old format).
    /// Mirrors SS6's "rate/bit-width change clears the cache" scenario.
    pub fn set_target_format(&self, format: TargetFormat) {
        *self.format.lock() = format;
        self.clear();
    }

    /// Returns the cached sample for `effect_id`, loading and converting it
    /// on first access. Returns `None` if `effect_id <= 0`, no loader
    /// produced data, or the loaded waveform has zero samples.
    pub fn cache(&self, effect_id: i32) -> Option<Arc<Sample>> {
        if effect_id <= 0 {
            return None;
        }

        {
            let inner = self.inner.lock();
            if let Some(item) = inner.items.get(&effect_id) {
                return Some(item.sample.clone());
            }
        }

        let raw = match self.source.load(effect_id) {
            Some(r) => r,
            None => {
                tracing::debug!(effect_id, "sample cache miss: loader returned nothing");
                return None;
            }
        };
        if raw.num_samples == 0 {
            return None;
        }

        let format = *self.format.lock();
        let factor = upsample_factor_for(raw.rate_hz, format.rate_hz);
        let data = resample(
            &raw.data,
            raw.bytes_per_sample,
            raw.num_samples,
            factor,
            format.bytes_per_sample,
        );
        let num_samples = raw.num_samples * factor.as_u32();
        let sample = Arc::new(Sample {
            effect_id,
            group: raw.group,
            bytes_per_sample: format.bytes_per_sample,
            rate_hz: raw.rate_hz * factor.as_u32(),
            num_samples,
            data: Arc::from(data.into_boxed_slice()),
        });

        let mut inner = self.inner.lock();
        // Another thread may have raced us to insert the same id; keep
        // whichever won, matching the original's "first cache wins" intent.
        if let Some(existing) = inner.items.get(&effect_id) {
            return Some(existing.sample.clone());
        }
        inner.total_bytes += sample.size_bytes();
        inner.items.insert(
            effect_id,
            CacheItem {
                sample: sample.clone(),
                hits: 0,
                last_used_ms: 0,
            },
        );
        tracing::debug!(effect_id, bytes = sample.size_bytes(), "cached new sample");
        Some(sample)
    }

    /// Records a use of the cached sample, refreshing its eviction-order
    /// standing.
    pub fn hit(&self, effect_id: i32, now_ms: u64) {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.items.get_mut(&effect_id) {
            item.hits = item.hits.saturating_add(1);
            item.last_used_ms = now_ms;
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn item_count(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// No-op unless [`PURGE_INTERVAL_MS`] has elapsed since the last purge.
    /// `is_playing` must report whether any channel currently has the given
    /// effect id loaded and playing; items it reports `true` for are never
    /// evicted by the size pass.
    pub fn maybe_run_purge(&self, now_ms: u64, is_playing: &dyn Fn(i32) -> bool) {
        {
            let inner = self.inner.lock();
            if now_ms.saturating_sub(inner.last_purge_ms) < PURGE_INTERVAL_MS {
                return;
            }
        }
        self.run_purge(now_ms, is_playing);
    }

    fn run_purge(&self, now_ms: u64, is_playing: &dyn Fn(i32) -> bool) {
        // Age pass.
        let aged: Vec<i32> = {
            let inner = self.inner.lock();
            inner
                .items
                .iter()
                .filter(|(_, item)| now_ms.saturating_sub(item.last_used_ms) > MAX_CACHE_AGE_MS)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in aged {
            self.remove(id);
        }

        // Size pass: repeatedly evict the lowest-hit item not currently
        // playing, until under budget or nothing more can be removed.
        loop {
            let over_budget = self.inner.lock().total_bytes > MAX_CACHE_BYTES;
            if !over_budget {
                break;
            }
            let victim = {
                let inner = self.inner.lock();
                inner
                    .items
                    .iter()
                    .filter(|(id, _)| !is_playing(**id))
                    .min_by_key(|(_, item)| item.hits)
                    .map(|(id, _)| *id)
            };
            match victim {
                Some(id) => self.remove(id),
                None => break,
            }
        }

        self.inner.lock().last_purge_ms = now_ms;
    }

    fn remove(&self, effect_id: i32) {
        self.refresh.pause();
        let removed = {
            let mut inner = self.inner.lock();
            inner.items.remove(&effect_id).map(|item| {
                inner.total_bytes = inner.total_bytes.saturating_sub(item.sample.size_bytes());
                item
            })
        };
        if removed.is_some() {
            self.events.sample_remove.publish(SampleRemove { effect_id });
            tracing::debug!(effect_id, "evicted cached sample");
        }
        self.refresh.resume();
    }

    pub fn clear(&self) {
        self.refresh.pause();
        let ids: Vec<i32> = {
            let inner = self.inner.lock();
            inner.items.keys().copied().collect()
        };
        for id in &ids {
            self.events.sample_remove.publish(SampleRemove { effect_id: *id });
        }
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.total_bytes = 0;
        self.refresh.resume();
    }
}
