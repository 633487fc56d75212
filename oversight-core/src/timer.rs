//! Clock & Timer Wheel: schedules tier-timeout events against a
//! consensus-ordered clock, with idempotent cancellation and restart
//! recovery that recomputes remaining durations instead of trusting a
//! locally persisted deadline.

use crate::error::{OversightError, OversightResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, Duration as TokioDuration};
use uuid::Uuid;

/// Source of monotonically non-decreasing time. A real deployment backs
/// this with a consensus-ordered clock service; tests and the in-process
/// default back it with the local wall clock behind a degradation flag.
pub trait ConsensusClock: Send + Sync {
    fn now(&self) -> OversightResult<DateTime<Utc>>;
}

/// Wall-clock fallback. Used directly only when `consensus_clock_required`
/// is false; otherwise availability failures from a real consensus clock
/// surface as `TimerSourceUnavailable` rather than silently falling back to
/// this.
pub struct LocalClock;

impl ConsensusClock for LocalClock {
    fn now(&self) -> OversightResult<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

/// A fired tier-timeout event.
#[derive(Debug, Clone, Copy)]
pub struct TierTimeout {
    pub request_id: Uuid,
    pub tier_index: usize,
}

#[derive(Clone)]
struct ArmedEntry {
    fire_at: DateTime<Utc>,
    tier_index: usize,
}

/// Schedules and fires tier-timeout events. Entries are keyed by request id
/// alone since a request has exactly one armed timer at a time; arming a
/// new tier implicitly supersedes the previous tier's entry.
pub struct TimerWheel<C: ConsensusClock> {
    clock: Arc<C>,
    armed: DashMap<Uuid, ArmedEntry>,
    degraded: AtomicBool,
    sender: mpsc::UnboundedSender<TierTimeout>,
}

impl<C: ConsensusClock + 'static> TimerWheel<C> {
    pub fn new(clock: Arc<C>) -> (Self, mpsc::UnboundedReceiver<TierTimeout>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                clock,
                armed: DashMap::new(),
                degraded: AtomicBool::new(false),
                sender,
            },
            receiver,
        )
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Consult the consensus clock without arming anything. Used by callers
    /// that must fail fast with `TimerSourceUnavailable` before committing
    /// state, rather than discovering clock loss only inside `arm`.
    pub fn check_source(&self) -> OversightResult<()> {
        self.current_time()?;
        Ok(())
    }

    /// Arm (or re-arm, superseding any existing entry) a timer firing
    /// `timeout_secs` seconds from the current consensus time.
    pub fn arm(self: &Arc<Self>, request_id: Uuid, tier_index: usize, timeout_secs: i64) -> OversightResult<()> {
        let now = self.current_time()?;
        let fire_at = now + chrono::Duration::seconds(timeout_secs);
        self.armed.insert(request_id, ArmedEntry { fire_at, tier_index });
        self.spawn_fire_task(request_id, tier_index, fire_at);
        Ok(())
    }

    /// Re-arm at an absolute fire time, used by startup recovery to avoid
    /// resetting a timer to the full tier duration after a restart.
    pub fn arm_absolute(self: &Arc<Self>, request_id: Uuid, tier_index: usize, fire_at: DateTime<Utc>) {
        self.armed.insert(request_id, ArmedEntry { fire_at, tier_index });
        self.spawn_fire_task(request_id, tier_index, fire_at);
    }

    /// Idempotent cancellation: cancelling an unarmed or already-cancelled
    /// request is a no-op.
    pub fn cancel(&self, request_id: Uuid) {
        self.armed.remove(&request_id);
    }

    fn current_time(&self) -> OversightResult<DateTime<Utc>> {
        self.clock.now().map_err(|_| {
            self.degraded.store(true, Ordering::SeqCst);
            OversightError::TimerSourceUnavailable
        })
    }

    fn spawn_fire_task(self: &Arc<Self>, request_id: Uuid, tier_index: usize, fire_at: DateTime<Utc>) {
        let wheel = Arc::clone(self);
        tokio::spawn(async move {
            let now = Utc::now();
            let delay = (fire_at - now).to_std().unwrap_or(TokioDuration::ZERO);
            time::sleep(delay).await;

            // Only fire if this (request, tier) pair is still current; a
            // resolved or re-escalated request will have a different or
            // absent entry by the time the sleep elapses.
            let still_current = wheel
                .armed
                .get(&request_id)
                .map(|entry| entry.tier_index == tier_index)
                .unwrap_or(false);

            if still_current {
                wheel.armed.remove(&request_id);
                let _ = wheel.sender.send(TierTimeout { request_id, tier_index });
            }
        });
    }
}
