//! Heartbeat Clock
//!
//! One periodic ticker shared by every streaming session of a route: N open
//! connections cost one timer, not N. Sessions subscribe a callback for
//! their lifetime and unsubscribe exactly once during teardown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type TickCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`HeartbeatClock::subscribe`], used to remove the
/// subscription later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct SubscriberSet {
    next_id: u64,
    entries: Vec<(SubscriptionId, TickCallback)>,
}

/// A shared periodic ticker with a fixed interval.
///
/// The interval is set at construction and immutable afterwards. On every
/// tick, all currently subscribed callbacks are invoked in subscription
/// order. The subscriber list is snapshotted per tick, so subscribing or
/// unsubscribing while a tick is being delivered is well-defined: a new
/// subscriber receives subsequent ticks, and a removal takes effect no
/// later than the next tick.
///
/// Construction spawns the tick task and therefore requires a running
/// tokio runtime. Dropping the clock aborts the task.
pub struct HeartbeatClock {
    interval: Duration,
    subscribers: Arc<Mutex<SubscriberSet>>,
    ticker: JoinHandle<()>,
}

impl HeartbeatClock {
    /// Create a clock ticking every `interval`.
    pub fn new(interval: Duration) -> Self {
        let subscribers = Arc::new(Mutex::new(SubscriberSet::default()));
        let ticker = tokio::spawn(run_ticker(interval, Arc::clone(&subscribers)));

        Self {
            interval,
            subscribers,
            ticker,
        }
    }

    /// The tick interval this clock was built with.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register `callback` to be invoked on every subsequent tick.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        let mut set = self.subscribers.lock().unwrap();
        set.next_id += 1;
        let id = SubscriptionId(set.next_id);
        set.entries.push((id, Arc::new(callback)));

        tracing::debug!(subscribers = set.entries.len(), "heartbeat subscriber added");
        id
    }

    /// Remove a subscription. Unknown or already-removed ids are a no-op,
    /// so a heartbeat tick racing a connection teardown cannot fail.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut set = self.subscribers.lock().unwrap();
        let before = set.entries.len();
        set.entries.retain(|(entry_id, _)| *entry_id != id);

        if set.entries.len() < before {
            tracing::debug!(subscribers = set.entries.len(), "heartbeat subscriber removed");
        }
    }

    /// Number of currently subscribed callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().entries.len()
    }
}

impl Drop for HeartbeatClock {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

async fn run_ticker(interval: Duration, subscribers: Arc<Mutex<SubscriberSet>>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // A tokio interval completes its first tick immediately; swallow it so
    // the first beat lands one full interval after the clock starts.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let snapshot: Vec<TickCallback> = {
            let set = subscribers.lock().unwrap();
            set.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in snapshot {
            // A fault in one subscriber must not starve the others or kill
            // the tick task.
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                tracing::error!("heartbeat subscriber panicked");
            }
        }
    }
}
