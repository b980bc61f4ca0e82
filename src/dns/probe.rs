//! Probe engine
//!
//! Per-upstream state machine that sends a synthetic query (`www.gstatic.com
//! A`) on a schedule and maintains a *validated* flag. Grounded on
//! `resolver.cc`'s `GetTimeUntilProbe`/`Probe`/`RestartProbe`; see `spec.md`
//! §4.5.
//!
//! Cancellation follows the weak-reference discipline of §9: a probe loop
//! holds only a `Weak<ProbeState>`, the owning upstream table holds the
//! strong `Arc`. Invalidating or validating a target replaces the table's
//! `Arc`, so any probe loop still sleeping on the old instance finds its
//! `Weak::upgrade()` returns `None` and exits without side effects.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Tuned probe parameters (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub initial_delay_secs: f64,
    pub multiplier: f64,
    pub max_delay_secs: f64,
    pub jitter_multiplier: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 1.0,
            multiplier: 1.5,
            max_delay_secs: 3600.0,
            jitter_multiplier: 0.2,
        }
    }
}

/// Live state for one target's probe schedule. Replaced wholesale (a fresh
/// instance) on invalidation or successful probe; mutated in place (retry
/// counter only) between failed attempts of the same instance.
#[derive(Debug, Default)]
pub struct ProbeState {
    retries: AtomicU32,
}

impl ProbeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// `delay = min(initial * multiplier^retries * (1 - jitter), maximum)`,
/// where `jitter` is drawn uniformly from `[0, jitter_multiplier)`.
pub fn next_probe_delay(retries: u32, cfg: &ProbeConfig) -> Duration {
    let mut delay = cfg.initial_delay_secs * cfg.multiplier.powi(retries as i32);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..cfg.jitter_multiplier);
    delay -= jitter * delay;
    delay = delay.min(cfg.max_delay_secs).max(0.0);
    Duration::from_secs_f64(delay)
}

/// What a probe loop needs from the upstream table it probes for: a way to
/// issue the synthetic query, and a way to report success so the table can
/// replace the target's `ProbeState` with a validated instance.
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    async fn probe(&self) -> bool;
    fn mark_validated(&self);
}

/// Drive one target's probe schedule until it succeeds or its `ProbeState`
/// is replaced out from under it (invalidation, removal, or a concurrent
/// successful probe).
pub async fn run_probe_loop(state: Weak<ProbeState>, target: Arc<dyn ProbeTarget>, cfg: ProbeConfig) {
    loop {
        let Some(live) = state.upgrade() else {
            return;
        };
        let delay = next_probe_delay(live.retries(), &cfg);
        drop(live);

        tokio::time::sleep(delay).await;

        if state.upgrade().is_none() {
            return;
        }

        if target.probe().await {
            target.mark_validated();
            return;
        }

        match state.upgrade() {
            Some(live) => {
                live.retries.fetch_add(1, Ordering::Relaxed);
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delay_is_strictly_positive_and_bounded() {
        let cfg = ProbeConfig::default();
        for retries in 0..40 {
            let delay = next_probe_delay(retries, &cfg);
            assert!(delay.as_secs_f64() > 0.0);
            assert!(delay.as_secs_f64() <= cfg.max_delay_secs);
        }
    }

    #[test]
    fn delay_grows_then_saturates_at_maximum() {
        let cfg = ProbeConfig::default();
        let small = next_probe_delay(0, &cfg);
        let large = next_probe_delay(30, &cfg);
        assert!(large.as_secs_f64() >= small.as_secs_f64());
        assert!(large.as_secs_f64() <= cfg.max_delay_secs);
    }

    struct CountingTarget {
        attempts: AtomicUsize,
        succeed_on: usize,
        validated: AtomicUsize,
    }

    #[async_trait]
    impl ProbeTarget for CountingTarget {
        async fn probe(&self) -> bool {
            let n = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            n >= self.succeed_on
        }
        fn mark_validated(&self) {
            self.validated.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_after_successful_probe() {
        let cfg = ProbeConfig {
            initial_delay_secs: 0.001,
            multiplier: 1.0,
            max_delay_secs: 1.0,
            jitter_multiplier: 0.0,
        };
        let state = ProbeState::new();
        let weak = Arc::downgrade(&state);
        let target = Arc::new(CountingTarget {
            attempts: AtomicUsize::new(0),
            succeed_on: 3,
            validated: AtomicUsize::new(0),
        });

        run_probe_loop(weak, target.clone(), cfg).await;

        assert_eq!(target.attempts.load(Ordering::Relaxed), 3);
        assert_eq!(target.validated.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_quietly_once_state_is_dropped() {
        let cfg = ProbeConfig {
            initial_delay_secs: 10.0,
            multiplier: 1.0,
            max_delay_secs: 10.0,
            jitter_multiplier: 0.0,
        };
        let state = ProbeState::new();
        let weak = Arc::downgrade(&state);
        drop(state);

        let target = Arc::new(CountingTarget {
            attempts: AtomicUsize::new(0),
            succeed_on: 1,
            validated: AtomicUsize::new(0),
        });

        run_probe_loop(weak, target.clone(), cfg).await;
        assert_eq!(target.attempts.load(Ordering::Relaxed), 0);
    }
}
