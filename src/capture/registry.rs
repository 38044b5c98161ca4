//! Frame sink registry
//!
//! Holds the ordered set of subscribers for one camera and fans encoded
//! frames out to them. All mutation and dispatch happen under a single
//! lock, which is what gives `remove` its drain guarantee: a removal that
//! races a fan-out blocks until the fan-out has finished, so the sink is
//! never invoked after `remove` returns.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::warn;

use super::frame::AccessUnit;

/// Identifier handed out by [`SinkRegistry::add`]; unique per camera,
/// strictly increasing, never reused.
pub type SubscriptionId = u64;

/// Callback receiving every access unit a camera emits.
///
/// Sinks run on the capture thread with the registry lock held: they must
/// not block, and anything that can block belongs behind a queue on the
/// subscriber's side.
pub type FrameSink = Box<dyn Fn(&AccessUnit) + Send>;

#[derive(Default)]
pub struct SinkRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: SubscriptionId,
    // BTreeMap keeps dispatch in registration order (ids are monotonic).
    sinks: BTreeMap<SubscriptionId, FrameSink>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink and return its id. The id is allocated under the
    /// same lock as dispatch, so a sink registered after this call returns
    /// is guaranteed to observe every frame emitted after the return.
    pub fn add(&self, sink: FrameSink) -> SubscriptionId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.sinks.insert(id, sink);
        id
    }

    /// Remove a sink. Blocks until any in-flight dispatch has completed;
    /// after return the sink will not be invoked again.
    pub fn remove(&self, id: SubscriptionId) {
        self.inner.lock().sinks.remove(&id);
    }

    /// Remove every registered sink.
    pub fn clear(&self) {
        self.inner.lock().sinks.clear();
    }

    /// Invoke every sink in registration order. A panicking sink is
    /// contained and logged; the remaining sinks still run.
    pub fn dispatch(&self, unit: &AccessUnit) {
        let inner = self.inner.lock();
        for (id, sink) in inner.sinks.iter() {
            if catch_unwind(AssertUnwindSafe(|| sink(unit))).is_err() {
                warn!(subscription = id, "frame sink panicked, continuing");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sinks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn unit() -> AccessUnit {
        AccessUnit {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            pts_ns: 0,
            is_keyframe: true,
        }
    }

    #[test]
    fn ids_are_strictly_increasing_and_never_reused() {
        let registry = SinkRegistry::new();
        let a = registry.add(Box::new(|_| {}));
        let b = registry.add(Box::new(|_| {}));
        assert!(b > a);

        registry.remove(a);
        let c = registry.add(Box::new(|_| {}));
        assert!(c > b);
    }

    #[test]
    fn removed_sink_receives_nothing() {
        let registry = SinkRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        let id = registry.add(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch(&unit());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        registry.remove(id);
        registry.dispatch(&unit());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_runs_in_registration_order() {
        let registry = SinkRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..4u64 {
            let order = order.clone();
            registry.add(Box::new(move |_| order.lock().push(tag)));
        }

        registry.dispatch(&unit());
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn panicking_sink_does_not_stop_fanout() {
        let registry = SinkRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));

        registry.add(Box::new(|_| panic!("boom")));
        let counter = hits.clone();
        registry.add(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch(&unit());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let registry = SinkRegistry::new();
        registry.add(Box::new(|_| {}));
        registry.add(Box::new(|_| {}));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());

        // Counter keeps going after a clear.
        let id = registry.add(Box::new(|_| {}));
        assert!(id >= 3);
    }

    #[test]
    fn remove_blocks_until_inflight_dispatch_finishes() {
        use std::sync::mpsc;
        use std::time::Duration;

        let registry = Arc::new(SinkRegistry::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let id = registry.add(Box::new(move |_| {
            entered_tx.send(()).unwrap();
            release_rx.recv_timeout(Duration::from_secs(2)).ok();
        }));

        let dispatcher = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.dispatch(&unit()))
        };

        // Wait until the sink is mid-dispatch, then race a removal.
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let remover = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.remove(id))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!remover.is_finished(), "remove returned during dispatch");

        release_tx.send(()).unwrap();
        dispatcher.join().unwrap();
        remover.join().unwrap();
        assert!(registry.is_empty());
    }
}
