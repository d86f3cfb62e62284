//! Deadline scheduling shared by every timeout in the engine.
//!
//! An [`ExpirationScheduler`] fires `handler(token)` once the token's
//! deadline passes. Session keep-alive, pipeline idle timers, discovery
//! renewal and delayed search responses all run through it.
//!
//! ## Model
//!
//! - Entries live in a `BTreeMap<Instant, K>` ordered by deadline, mirrored
//!   by a `HashMap<K, Instant>` for upsert/cancel by token.
//! - Colliding deadlines are nudged forward one nanosecond at a time so
//!   every entry keeps a distinct key.
//! - One worker thread sleeps on a condition variable until the soonest
//!   deadline. It is the only timer.
//! - Everything due within [`SchedulerConfig::slack`] is delivered as one
//!   batch, in deadline order, with the lock released. Handlers may call
//!   [`add`](ExpirationScheduler::add)/[`remove`](ExpirationScheduler::remove).
//! - A token removed or re-added while its batch is being delivered does
//!   not fire from that batch.
//! - Delays too large to represent are capped at [`FAR_FUTURE`].
//! - A panicking handler is logged and the rest of the batch still runs.
//!
//! Handlers are stored inside the scheduler; capture `Weak` references to
//! anything that itself owns the scheduler, or the two keep each other alive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Default batching window for entries that fall due together.
pub const DEFAULT_SLACK: Duration = Duration::from_millis(20);

/// Upper bound on how far ahead a deadline is placed (about 100 years).
pub const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

const NUDGE: Duration = Duration::from_nanos(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Entries due within this window of the current time fire together.
    pub slack: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slack: DEFAULT_SLACK,
        }
    }
}

impl SchedulerConfig {
    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }
}

type Handler<K> = Box<dyn Fn(K) + Send + Sync>;

struct Shared<K> {
    state: Mutex<Entries<K>>,
    wakeup: Condvar,
    handler: Handler<K>,
    slack: Duration,
}

struct Entries<K> {
    by_deadline: BTreeMap<Instant, K>,
    by_token: HashMap<K, Instant>,
    /// Taken from the map into the batch currently being delivered.
    firing: HashSet<K>,
    shutdown: bool,
}

/// Stops the worker once the last handle is dropped.
struct Owner<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Drop for Owner<K> {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
    }
}

/// Token → deadline firing service. Cheap to clone; clones share entries.
pub struct ExpirationScheduler<K> {
    shared: Arc<Shared<K>>,
    _owner: Arc<Owner<K>>,
}

impl<K> Clone for ExpirationScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _owner: self._owner.clone(),
        }
    }
}

impl<K> ExpirationScheduler<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(handler: impl Fn(K) + Send + Sync + 'static) -> Self {
        Self::with_config(SchedulerConfig::default(), handler)
    }

    pub fn with_config(config: SchedulerConfig, handler: impl Fn(K) + Send + Sync + 'static) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(Entries {
                by_deadline: BTreeMap::new(),
                by_token: HashMap::new(),
                firing: HashSet::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            handler: Box::new(handler),
            slack: config.slack,
        });

        let worker = shared.clone();
        thread::spawn(move || run(&worker));

        Self {
            _owner: Arc::new(Owner {
                shared: shared.clone(),
            }),
            shared,
        }
    }

    /// Schedule `token` to fire after `delay`, replacing any existing entry
    /// for the same token.
    pub fn add(&self, token: K, delay: Duration) {
        self.schedule_at(token, deadline_after(Instant::now(), delay));
    }

    pub fn add_secs(&self, token: K, secs: u64) {
        self.add(token, Duration::from_secs(secs));
    }

    fn schedule_at(&self, token: K, mut deadline: Instant) -> Instant {
        let mut state = self.shared.state.lock();
        state.firing.remove(&token);
        if let Some(old) = state.by_token.remove(&token) {
            state.by_deadline.remove(&old);
        }
        while state.by_deadline.contains_key(&deadline) {
            deadline += NUDGE;
        }
        let soonest = state
            .by_deadline
            .keys()
            .next()
            .is_none_or(|first| deadline < *first);
        state.by_deadline.insert(deadline, token.clone());
        state.by_token.insert(token, deadline);
        drop(state);

        if soonest {
            self.shared.wakeup.notify_one();
        }
        deadline
    }

    /// Cancel `token`. Returns whether an entry was removed.
    pub fn remove(&self, token: &K) -> bool {
        let mut state = self.shared.state.lock();
        let pending = state.firing.remove(token);
        match state.by_token.remove(token) {
            Some(deadline) => {
                state.by_deadline.remove(&deadline);
                true
            }
            None => pending,
        }
    }

    pub fn deadline_of(&self, token: &K) -> Option<Instant> {
        self.shared.state.lock().by_token.get(token).copied()
    }

    pub fn contains(&self, token: &K) -> bool {
        self.shared.state.lock().by_token.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(FAR_FUTURE)).unwrap_or(now)
}

fn run<K>(shared: &Shared<K>)
where
    K: Clone + Eq + Hash + Send + 'static,
{
    let mut state = shared.state.lock();
    while !state.shutdown {
        let now = Instant::now();
        let horizon = deadline_after(now, shared.slack);
        match state.by_deadline.keys().next().copied() {
            None => shared.wakeup.wait(&mut state),
            Some(first) if first > horizon => {
                shared.wakeup.wait_until(&mut state, first);
            }
            Some(_) => {
                let due = take_due(&mut state, horizon);
                tracing::trace!(count = due.len(), "expiration batch");
                MutexGuard::unlocked(&mut state, || deliver(shared, due));
            }
        }
    }
    tracing::debug!("expiration scheduler stopped");
}

fn take_due<K: Clone + Eq + Hash>(state: &mut Entries<K>, horizon: Instant) -> Vec<K> {
    let later = state.by_deadline.split_off(&deadline_after(horizon, NUDGE));
    let due = std::mem::replace(&mut state.by_deadline, later);
    state.firing.clear();
    due.into_values()
        .inspect(|token| {
            state.by_token.remove(token);
            state.firing.insert(token.clone());
        })
        .collect()
}

fn deliver<K: Eq + Hash>(shared: &Shared<K>, due: Vec<K>) {
    for token in due {
        if !shared.state.lock().firing.remove(&token) {
            continue;
        }
        if catch_unwind(AssertUnwindSafe(|| (shared.handler)(token))).is_err() {
            tracing::error!("expiration handler panicked; continuing with remaining entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collecting() -> (ExpirationScheduler<u32>, mpsc::Receiver<u32>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let s = ExpirationScheduler::new(move |t| {
            let _ = tx.lock().send(t);
        });
        (s, rx)
    }

    fn drain(rx: &mpsc::Receiver<u32>, n: usize) -> Vec<u32> {
        (0..n)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("token fired"))
            .collect()
    }

    #[test]
    fn fires_in_deadline_order() {
        let (s, rx) = collecting();
        for (token, ms) in [(3, 90), (1, 30), (5, 150), (2, 60), (4, 120)] {
            s.add(token, Duration::from_millis(ms));
        }
        assert_eq!(drain(&rx, 5), vec![1, 2, 3, 4, 5]);
        assert!(s.is_empty());
    }

    #[test]
    fn remove_suppresses_delivery() {
        let (s, rx) = collecting();
        s.add(1, Duration::from_millis(40));
        s.add(2, Duration::from_millis(80));
        assert!(s.remove(&1));
        assert!(!s.remove(&1));
        assert_eq!(drain(&rx, 1), vec![2]);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn nearer_re_add_fires_earlier() {
        let (s, rx) = collecting();
        s.add(1, Duration::from_millis(500));
        s.add(2, Duration::from_millis(200));
        s.add(1, Duration::from_millis(50));
        assert_eq!(s.len(), 2);
        assert_eq!(drain(&rx, 2), vec![1, 2]);
    }

    #[test]
    fn colliding_deadlines_stay_distinct() {
        let (s, rx) = collecting();
        let at = Instant::now() + Duration::from_millis(30);
        let a = s.schedule_at(7, at);
        let b = s.schedule_at(8, at);
        assert_eq!(a, at);
        assert!(b > a);
        assert_eq!(drain(&rx, 2), vec![7, 8]);
    }

    #[test]
    fn panicking_handler_does_not_stop_batch() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let s = ExpirationScheduler::new(move |t: u32| {
            if t == 1 {
                panic!("handler failure");
            }
            let _ = tx.lock().send(t);
        });
        let at = Instant::now() + Duration::from_millis(20);
        for t in 1..=3 {
            s.schedule_at(t, at);
        }
        assert_eq!(drain(&rx, 2), vec![2, 3]);
    }

    #[test]
    fn handler_may_reschedule() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let slot: Arc<Mutex<Option<ExpirationScheduler<u32>>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let s = ExpirationScheduler::new(move |t: u32| {
            let _ = tx.lock().send(t);
            if t < 3
                && let Some(s) = inner.lock().as_ref()
            {
                s.add(t + 1, Duration::from_millis(10));
            }
        });
        *slot.lock() = Some(s.clone());
        s.add(1, Duration::from_millis(10));
        assert_eq!(drain(&rx, 3), vec![1, 2, 3]);
        slot.lock().take();
    }

    #[test]
    fn removal_within_a_batch_cancels_later_tokens() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let slot: Arc<Mutex<Option<ExpirationScheduler<u32>>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let removed = Arc::new(Mutex::new(None));
        let seen = removed.clone();
        let s = ExpirationScheduler::new(move |t: u32| {
            if t == 1
                && let Some(s) = inner.lock().as_ref()
            {
                *seen.lock() = Some(s.remove(&2));
            }
            let _ = tx.lock().send(t);
        });
        *slot.lock() = Some(s.clone());

        let at = Instant::now() + Duration::from_millis(30);
        s.schedule_at(1, at);
        s.schedule_at(2, at);
        s.schedule_at(3, at);
        assert_eq!(drain(&rx, 2), vec![1, 3]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(*removed.lock(), Some(true));
        slot.lock().take();
    }

    #[test]
    fn huge_delay_is_capped_instead_of_overflowing() {
        let (s, rx) = collecting();
        let before = Instant::now();
        s.add(1, Duration::MAX);
        let deadline = s.deadline_of(&1).unwrap();
        assert!(deadline >= before + Duration::from_secs(50 * 365 * 24 * 60 * 60));
        assert!(deadline <= Instant::now() + FAR_FUTURE);

        s.add(2, Duration::from_millis(10));
        assert_eq!(drain(&rx, 1), vec![2]);
        assert!(s.contains(&1));
        assert!(s.remove(&1));
    }
}
