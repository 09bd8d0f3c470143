//! Time sources for the worker loops.
//!
//! Every sleep and every "now" the engine observes goes through [`Clock`], so
//! tests can run the same loops against [`SimClock`] and move time forward
//! deterministically.

mod tmp {
    use chrono::{DateTime, Utc};

    /// Source of "now" plus a cancellable delay.
    #[trait_variant::make(Clock: Send)]
    pub trait LocalClock {
        fn now(&self) -> DateTime<Utc>;
        #[allow(unused)]
        async fn sleep(&self, duration: std::time::Duration);
    }
}

pub use tmp::Clock;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Default)]
/// Production clock: wall time and real timer sleeps.
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: std::time::Duration) {
        futures_timer::Delay::new(duration).await
    }
}

#[derive(Debug)]
struct Sleeper {
    /// Identity of the owning sleep future, so a re-poll updates its entry
    /// instead of registering a second one.
    key: u64,
    deadline: DateTime<Utc>,
    waker: std::task::Waker,
}

#[derive(Debug)]
struct SimState {
    now: DateTime<Utc>,
    sleepers: Vec<Sleeper>,
    next_key: u64,
}

#[derive(Debug, Clone)]
/// Clock that only moves when a test calls [`SimClock::advance`].
///
/// A pending `sleep` wakes as soon as simulated time passes its deadline.
/// Starts at the Unix epoch unless constructed with [`SimClock::starting_at`].
pub struct SimClock {
    inner: std::sync::Arc<std::sync::Mutex<SimState>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::starting_at(DateTime::UNIX_EPOCH)
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(SimState {
                now,
                sleepers: Vec::new(),
                next_key: 0,
            })),
        }
    }

    /// Move simulated time forward and wake every sleeper whose deadline has
    /// passed.
    pub fn advance(&self, duration: std::time::Duration) {
        let due = {
            let mut state = self.lock();
            state.now = add(state.now, duration);
            let now = state.now;
            let (due, pending) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .partition(|sleeper| sleeper.deadline <= now);
            state.sleepers = pending;
            due
        };
        // Wake outside the lock; a woken task may immediately call back in.
        for sleeper in due {
            sleeper.waker.wake();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

fn add(now: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep(&self, duration: std::time::Duration) {
        let deadline = add(self.lock().now, duration);
        let mut key: Option<u64> = None;
        futures::future::poll_fn(|cx| {
            let mut state = self.lock();
            if state.now >= deadline {
                return std::task::Poll::Ready(());
            }
            // One entry per sleep: re-polls refresh the waker in place.
            match state
                .sleepers
                .iter_mut()
                .find(|sleeper| Some(sleeper.key) == key)
            {
                Some(sleeper) => {
                    if !sleeper.waker.will_wake(cx.waker()) {
                        sleeper.waker = cx.waker().clone();
                    }
                }
                None => {
                    let new_key = state.next_key;
                    state.next_key += 1;
                    key = Some(new_key);
                    state.sleepers.push(Sleeper {
                        key: new_key,
                        deadline,
                        waker: cx.waker().clone(),
                    });
                }
            }
            std::task::Poll::Pending
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt as _;
    use std::time::Duration;

    #[test]
    fn advance_moves_now() {
        let clock = SimClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(5));
    }

    #[test]
    fn sleep_completes_only_after_deadline() {
        let clock = SimClock::new();
        let sleep = clock.sleep(Duration::from_secs(2));
        futures::pin_mut!(sleep);

        assert!(sleep.as_mut().now_or_never().is_none());
        clock.advance(Duration::from_secs(1));
        assert!(sleep.as_mut().now_or_never().is_none());
        clock.advance(Duration::from_secs(1));
        assert!(sleep.as_mut().now_or_never().is_some());
    }

    #[test]
    fn repolling_a_sleep_registers_a_single_waker() {
        let clock = SimClock::new();
        let sleep = clock.sleep(Duration::from_secs(5));
        futures::pin_mut!(sleep);

        for _ in 0..3 {
            assert!(sleep.as_mut().now_or_never().is_none());
        }
        assert_eq!(clock.lock().sleepers.len(), 1);

        clock.advance(Duration::from_secs(5));
        assert!(sleep.as_mut().now_or_never().is_some());
        assert!(clock.lock().sleepers.is_empty());
    }

    #[test]
    fn zero_length_sleep_is_ready() {
        let clock = SimClock::new();
        assert!(clock.sleep(Duration::ZERO).now_or_never().is_some());
    }

    #[tokio::test]
    async fn advance_wakes_a_parked_sleeper() {
        let clock = SimClock::new();
        let waiter = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_millis(100)).await })
        };
        // Let the sleeper register its waker before time moves.
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(100));
        waiter.await.expect("sleeper should wake");
    }
}
