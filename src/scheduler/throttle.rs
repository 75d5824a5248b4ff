//! Restart debounce and burst control.
//!
//! Many independent callers can signal "re-evaluate the schedule now";
//! restarting the loop on every signal causes thrash. The throttle turns
//! bursts of signals into one coalesced restart with three regimes:
//! isolated signals restart after a small base delay; moderate bursts
//! restart with geometrically growing latency; saturated bursts trip a
//! cooldown that suppresses everything, then fires exactly once after the
//! signals settle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ThrottleConfig;

type RestartFn = Box<dyn Fn() + Send + Sync>;

pub struct RestartThrottle {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    config: ThrottleConfig,
    callback: RestartFn,
    state: parking_lot::Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    /// Recent signal instants, pruned to the burst window on every signal.
    window: VecDeque<Instant>,
    cooling_down: bool,
    last_signal: Option<Instant>,
    extra_delay: Duration,
    /// Invalidates in-flight timer tasks when a newer schedule replaces them.
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl RestartThrottle {
    /// `callback` is invoked once per coalesced restart, never while the
    /// internal lock is held. Must be constructed inside a tokio runtime.
    pub fn new(config: ThrottleConfig, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                config,
                callback: Box::new(callback),
                state: parking_lot::Mutex::new(ThrottleState::default()),
            }),
        }
    }

    /// Record one "re-evaluate the schedule" request.
    pub fn signal(&self) {
        let inner = &self.inner;
        let now = Instant::now();
        let mut st = inner.state.lock();
        st.last_signal = Some(now);

        if st.cooling_down {
            // The settle task watches last_signal; nothing to schedule.
            return;
        }

        let horizon = inner.config.burst_window;
        while st
            .window
            .front()
            .is_some_and(|&t| now.duration_since(t) > horizon)
        {
            st.window.pop_front();
        }
        st.window.push_back(now);

        if st.window.len() >= inner.config.burst_capacity {
            self.enter_cooldown(&mut st);
            return;
        }

        let delay = self.next_delay(&mut st, now);
        self.schedule_fire(&mut st, delay);
    }

    pub fn is_cooling_down(&self) -> bool {
        self.inner.state.lock().cooling_down
    }

    /// Sustained burst: suppress restarts for the cooldown period, then fire
    /// exactly once after signals have stayed quiet for the debounce
    /// interval.
    fn enter_cooldown(&self, st: &mut ThrottleState) {
        tracing::debug!("Restart burst detected; entering cooldown");
        st.cooling_down = true;
        st.window.clear();
        st.extra_delay = Duration::ZERO;
        st.generation += 1;
        if let Some(handle) = st.pending.take() {
            handle.abort();
        }
        let scheduled_gen = st.generation;
        let inner = self.inner.clone();
        st.pending = Some(tokio::spawn(settle_after_cooldown(inner, scheduled_gen)));
    }

    /// Base delay on the first signal in a window; the extra delay doubles
    /// while consecutive signals arrive closer than the minimum spacing,
    /// bounded by the configured maximum, and resets once spacing relaxes.
    fn next_delay(&self, st: &mut ThrottleState, now: Instant) -> Duration {
        let config = &self.inner.config;
        if st.window.len() <= 1 {
            st.extra_delay = Duration::ZERO;
            return config.base_delay;
        }
        let prev = st.window[st.window.len() - 2];
        if now.duration_since(prev) < config.min_spacing {
            st.extra_delay = if st.extra_delay.is_zero() {
                config.base_delay
            } else {
                (st.extra_delay * 2).min(config.max_extra_delay)
            };
        } else {
            st.extra_delay = Duration::ZERO;
        }
        config.base_delay + st.extra_delay
    }

    /// Replace any scheduled fire with a new one; only the last-scheduled
    /// timer actually runs.
    fn schedule_fire(&self, st: &mut ThrottleState, delay: Duration) {
        st.generation += 1;
        if let Some(handle) = st.pending.take() {
            handle.abort();
        }
        let scheduled_gen = st.generation;
        let inner = self.inner.clone();
        st.pending = Some(tokio::spawn(fire_after(inner, delay, scheduled_gen)));
    }
}

async fn fire_after(inner: Arc<ThrottleInner>, delay: Duration, expected_gen: u64) {
    tokio::time::sleep(delay).await;
    {
        let mut st = inner.state.lock();
        if st.generation != expected_gen {
            return;
        }
        st.pending = None;
        st.window.clear();
        st.extra_delay = Duration::ZERO;
    }
    (inner.callback)();
}

async fn settle_after_cooldown(inner: Arc<ThrottleInner>, expected_gen: u64) {
    tokio::time::sleep(inner.config.cooldown).await;
    let debounce = inner.config.debounce;
    loop {
        let remaining = {
            let st = inner.state.lock();
            if st.generation != expected_gen {
                return;
            }
            match st.last_signal {
                Some(last) => debounce.checked_sub(last.elapsed()),
                None => None,
            }
        };
        match remaining {
            // Still inside the debounce window; keep extending.
            Some(wait) if !wait.is_zero() => tokio::time::sleep(wait).await,
            _ => break,
        }
    }
    {
        let mut st = inner.state.lock();
        if st.generation != expected_gen {
            return;
        }
        st.cooling_down = false;
        st.pending = None;
        st.window.clear();
    }
    tracing::debug!("Cooldown settled; firing coalesced restart");
    (inner.callback)();
}
