//! Typed "audiences" — the event-bus based re-expression of the original
//! engine's subject/observer back-references (see `SPEC_FULL.md` SS9).
//!
//! Each audience is keyed by payload type over one shared [`event_bus::EventBusImpl`];
//! subscribers never hold a reference back to the publisher, only a stable
//! [`event_bus::SubscriptionId`]. Delivery is deferred to an explicit
//! [`AudienceBus::drain`] call (normally once per frame) rather than firing
//! inline on the publisher's stack, so handlers can never re-enter the
//! publishing call.

use std::marker::PhantomData;
use std::sync::Arc;

use event_bus::{EventBusImpl, EventPayload, SubscriptionId};

#[derive(Debug, Clone, Copy)]
pub struct SampleRemove {
    pub effect_id: i32,
}

/// Published whenever a `Stage` gains a new logical sound. `AudioSystem`
/// performs channel selection synchronously (it cannot wait for a drain —
/// see `SPEC_FULL.md` SS4.7), so this audience exists for decoupled
/// observers (telemetry, debug overlays) rather than for that dispatch
/// itself.
#[derive(Debug, Clone, Copy)]
pub struct Addition {
    pub effect_id: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelsRemapped {
    pub track_id_hash: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentChange;

#[derive(Debug, Clone, Copy)]
pub struct MidiFontChange;

pub struct Audience<T> {
    bus: Arc<EventBusImpl>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Audience<T> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: EventPayload> Audience<T> {
    fn new(bus: Arc<EventBusImpl>) -> Self {
        Self {
            bus,
            _marker: PhantomData,
        }
    }

    pub fn publish(&self, payload: T) {
        self.bus.publish(payload);
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id);
    }
}

/// Every audience this crate publishes to, sharing one underlying bus so a
/// single [`drain`](AudienceBus::drain) call delivers all of them in
/// deterministic priority/FIFO order.
pub struct AudienceBus {
    inner: Arc<EventBusImpl>,
    pub sample_remove: Audience<SampleRemove>,
    pub channels_remapped: Audience<ChannelsRemapped>,
    pub environment_change: Audience<EnvironmentChange>,
    pub midi_font_change: Audience<MidiFontChange>,
    pub addition: Audience<Addition>,
}

impl AudienceBus {
    pub fn new() -> Self {
        let inner = Arc::new(EventBusImpl::new());
        Self {
            sample_remove: Audience::new(inner.clone()),
            channels_remapped: Audience::new(inner.clone()),
            environment_change: Audience::new(inner.clone()),
            midi_font_change: Audience::new(inner.clone()),
            addition: Audience::new(inner.clone()),
            inner,
        }
    }

    /// Delivers every queued event to its subscribers, synchronously, on
    /// the calling thread. Call once per frame from `AudioSystem::frame_end`.
    pub fn drain(&self) {
        self.inner.drain();
    }
}

impl Default for AudienceBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sample_remove_audience_delivers_on_drain() {
        let bus = AudienceBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        bus.sample_remove.subscribe(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        bus.sample_remove.publish(SampleRemove { effect_id: 9 });
        assert_eq!(count.load(Ordering::SeqCst), 0, "not delivered before drain");
        bus.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
