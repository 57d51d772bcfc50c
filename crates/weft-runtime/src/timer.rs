//! Deadline timers
//!
//! An ordered set of absolute-deadline entries keyed by (deadline, id).
//! The owner embeds a [`TimerManager`] and drains due callbacks from its
//! idle loop; inserting a new earliest deadline fires a notification so
//! the wait can be shortened. A `tickled` flag suppresses repeated
//! notifications until the next drain.
//!
//! The clock is the wall clock: a drain that observes time moving back
//! by more than an hour treats the whole set as due, so timers cannot
//! silently pile up after the system clock jumps backwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use crate::time::current_ms;

/// Clock-rollover threshold: an hour, in milliseconds
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Shared timer callback; cloned out of the set when due
pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Receiver of "the earliest deadline changed" notifications
pub(crate) trait TimerNotify: Send + Sync {
    fn on_earliest_changed(&self);
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// One deadline entry
///
/// Shared between the caller (who may cancel, refresh or reset it) and
/// the owning manager's set. Cancellation is cooperative: the callback
/// is dropped under the set's write lock and never runs afterwards.
pub struct Timer {
    id: u64,
    recurring: bool,
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    cb: Mutex<Option<TimerCallback>>,
    mgr: Weak<TimerShared>,
}

impl Timer {
    #[inline]
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Acquire), self.id)
    }

    /// Drop the callback and remove the entry; false if already gone
    pub fn cancel(self: &Arc<Timer>) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write();
        let mut cb = self.cb.lock();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        drop(cb);
        set.map.remove(&self.key());
        true
    }

    /// Re-anchor the deadline to now + period; false if cancelled
    pub fn refresh(self: &Arc<Timer>) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write();
        if self.cb.lock().is_none() {
            return false;
        }
        set.map.remove(&self.key());
        let deadline = current_ms() + self.period_ms.load(Ordering::Acquire);
        self.deadline_ms.store(deadline, Ordering::Release);
        set.map.insert(self.key(), self.clone());
        true
    }

    /// Change the period, optionally re-anchoring the start to now
    ///
    /// Keeping the period with `from_now == false` is a no-op. The
    /// re-inserted entry may become the new earliest and notify.
    pub fn reset(self: &Arc<Timer>, ms: u64, from_now: bool) -> bool {
        if self.cb.lock().is_none() {
            return false;
        }
        if ms == self.period_ms.load(Ordering::Acquire) && !from_now {
            return true;
        }
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let notify = {
            let mut set = mgr.set.write();
            if self.cb.lock().is_none() {
                return false;
            }
            set.map.remove(&self.key());
            let start = if from_now {
                current_ms()
            } else {
                self.deadline_ms
                    .load(Ordering::Acquire)
                    .saturating_sub(self.period_ms.load(Ordering::Acquire))
            };
            self.period_ms.store(ms, Ordering::Release);
            self.deadline_ms.store(start + ms, Ordering::Release);
            set.insert_front_aware(self.key(), self.clone())
        };
        if notify {
            mgr.notify();
        }
        true
    }
}

/// Ordered set state behind the write lock
struct TimerSet {
    map: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Earliest-changed notification already sent since the last drain
    tickled: bool,
    /// Clock observed at the previous drain, for rollover detection
    previous_ms: u64,
}

impl TimerSet {
    /// Insert and report whether a front-change notification is owed
    fn insert_front_aware(&mut self, key: (u64, u64), timer: Arc<Timer>) -> bool {
        self.map.insert(key, timer);
        let at_front = self.map.keys().next().is_some_and(|front| *front == key);
        if at_front && !self.tickled {
            self.tickled = true;
            return true;
        }
        false
    }
}

struct TimerShared {
    set: RwLock<TimerSet>,
    notify: OnceLock<Weak<dyn TimerNotify>>,
}

impl TimerShared {
    fn notify(&self) {
        if let Some(n) = self.notify.get().and_then(|w| w.upgrade()) {
            n.on_earliest_changed();
        }
    }
}

/// Owner-facing timer set
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub(crate) fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                set: RwLock::new(TimerSet {
                    map: BTreeMap::new(),
                    tickled: false,
                    previous_ms: current_ms(),
                }),
                notify: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn set_notify(&self, n: Weak<dyn TimerNotify>) {
        let _ = self.shared.notify.set(n);
    }

    /// Add a timer due in `ms` milliseconds
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(ms, Arc::new(cb), recurring)
    }

    fn add_timer_cb(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(ms),
            deadline_ms: AtomicU64::new(current_ms() + ms),
            cb: Mutex::new(Some(cb)),
            mgr: Arc::downgrade(&self.shared),
        });

        let notify = {
            let mut set = self.shared.set.write();
            set.insert_front_aware(timer.key(), timer.clone())
        };
        if notify {
            self.shared.notify();
        }
        timer
    }

    /// Add a timer whose callback is skipped once `witness` is gone
    ///
    /// The entry still expires and is removed as usual; only the user
    /// callback is guarded by the weak witness.
    pub fn add_condition_timer<F, W>(
        &self,
        ms: u64,
        cb: F,
        witness: Weak<W>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        W: Send + Sync + 'static,
    {
        self.add_timer_cb(
            ms,
            Arc::new(move || {
                if let Some(_alive) = witness.upgrade() {
                    cb();
                }
            }),
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline
    ///
    /// 0 when an entry is already due; `u64::MAX` when the set is empty.
    pub fn next_timer_ms(&self) -> u64 {
        let set = self.shared.set.read();
        match set.map.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => deadline.saturating_sub(current_ms()),
        }
    }

    /// Whether any entries remain
    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().map.is_empty()
    }

    /// Collect the callbacks of every due entry
    ///
    /// Due entries are removed; recurring ones are re-anchored to
    /// now + period and re-inserted. A clock rollback larger than an
    /// hour expires the whole set in bulk.
    pub(crate) fn drain_expired(&self) -> Vec<TimerCallback> {
        let now = current_ms();
        let mut cbs = Vec::new();

        let mut set = self.shared.set.write();
        let rollover = now < set.previous_ms && now < set.previous_ms.saturating_sub(ROLLOVER_MS);
        set.previous_ms = now;
        set.tickled = false;

        if set.map.is_empty() {
            return cbs;
        }
        if !rollover {
            if let Some(&(front, _)) = set.map.keys().next() {
                if front > now {
                    return cbs;
                }
            }
        }

        let expired = if rollover {
            std::mem::take(&mut set.map)
        } else {
            let rest = set.map.split_off(&(now + 1, 0));
            std::mem::replace(&mut set.map, rest)
        };

        for (_, timer) in expired {
            let cb = timer.cb.lock().clone();
            let Some(cb) = cb else {
                continue;
            };
            cbs.push(cb);
            if timer.recurring {
                let deadline = now + timer.period_ms.load(Ordering::Acquire);
                timer.deadline_ms.store(deadline, Ordering::Release);
                let key = timer.key();
                set.map.insert(key, timer);
            } else {
                *timer.cb.lock() = None;
            }
        }
        cbs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drain_now(mgr: &TimerManager) -> usize {
        let cbs = mgr.drain_expired();
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_add_and_next_deadline() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer_ms(), u64::MAX);
        assert!(!mgr.has_timer());

        let _t = mgr.add_timer(50, || {}, false);
        assert!(mgr.has_timer());
        let next = mgr.next_timer_ms();
        assert!(next <= 50);
    }

    #[test]
    fn test_due_timer_drains() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        // deadline == now is due
        assert_eq!(mgr.next_timer_ms(), 0);
        assert_eq!(drain_now(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_drain_preserves_insertion_order_at_same_deadline() {
        let mgr = TimerManager::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in [3, 4, 5] {
            let o = order.clone();
            mgr.add_timer(
                0,
                move || {
                    o.lock().push(tag);
                },
                false,
            );
        }
        drain_now(&mgr);
        assert_eq!(*order.lock(), vec![3, 4, 5]);
    }

    #[test]
    fn test_future_timer_not_drained() {
        let mgr = TimerManager::new();
        mgr.add_timer(60_000, || {}, false);
        assert_eq!(drain_now(&mgr), 0);
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_cancel_prevents_callback() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = mgr.add_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(!mgr.has_timer());
        assert_eq!(drain_now(&mgr), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = mgr.add_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        assert_eq!(drain_now(&mgr), 1);
        assert!(mgr.has_timer(), "recurring timer re-armed");
        assert!(t.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_conditional_skipped_when_witness_dropped() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let witness = Arc::new(());
        mgr.add_condition_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
            false,
        );
        drop(witness);

        // The entry still expires; the user callback is skipped
        assert_eq!(drain_now(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_conditional_runs_while_witness_lives() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let witness = Arc::new(());
        mgr.add_condition_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
            false,
        );

        assert_eq!(drain_now(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(40, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(t.refresh());
        let next = mgr.next_timer_ms();
        assert!(next > 30, "refresh re-anchored to now + period, got {}", next);
    }

    #[test]
    fn test_reset_changes_period() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(10_000, || {}, false);
        assert!(t.reset(20, true));
        assert!(mgr.next_timer_ms() <= 20);

        // same period, not from now: no-op success
        assert!(t.reset(20, false));
    }

    #[test]
    fn test_ops_on_cancelled_timer_fail_quietly() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(1000, || {}, false);
        assert!(t.cancel());
        assert!(!t.refresh());
        assert!(!t.reset(5, true));
        // the unchanged-period short-circuit too
        assert!(!t.reset(1000, false));
    }

    #[test]
    fn test_notify_on_new_earliest_only() {
        struct Recorder(AtomicUsize);
        impl TimerNotify for Recorder {
            fn on_earliest_changed(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mgr = TimerManager::new();
        let rec = Arc::new(Recorder(AtomicUsize::new(0)));
        mgr.set_notify(Arc::downgrade(&rec) as Weak<dyn TimerNotify>);

        mgr.add_timer(5_000, || {}, false);
        assert_eq!(rec.0.load(Ordering::SeqCst), 1);

        // later deadline: no notification
        mgr.add_timer(9_000, || {}, false);
        assert_eq!(rec.0.load(Ordering::SeqCst), 1);

        // earlier deadline, but tickled flag still set: suppressed
        mgr.add_timer(1_000, || {}, false);
        assert_eq!(rec.0.load(Ordering::SeqCst), 1);

        // drain resets the flag; the next front insert notifies again
        mgr.drain_expired();
        mgr.add_timer(10, || {}, false);
        assert_eq!(rec.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_next_deadline_monotone_between_drains() {
        let mgr = TimerManager::new();
        mgr.add_timer(100, || {}, false);
        let a = mgr.next_timer_ms();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let b = mgr.next_timer_ms();
        assert!(b <= a);
    }

    #[test]
    fn test_rollover_expires_everything() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(
            3_600_000,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        // Fake a previous observation far in the future: the next drain
        // sees the clock more than an hour behind it.
        mgr.shared.set.write().previous_ms = current_ms() + 2 * ROLLOVER_MS;

        assert_eq!(drain_now(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
    }
}
