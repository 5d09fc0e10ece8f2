//! Limiter algorithms behind one permit/lease contract.
//!
//! # Responsibilities
//! - Concurrency slots (semaphore backed, released on lease drop)
//! - Token bucket with periodic replenishment
//! - Fixed window and segmented sliding window counters
//! - Bounded waiting queue shared by all algorithms
//!
//! # Design Decisions
//! - A lease owns whatever it must give back; dropping it is the release,
//!   so every exit path (error, timeout, cancelled future) releases exactly once
//! - Time-based limiters consume budget and have nothing to return on drop
//! - Waiters re-check after the hinted delay; ordering among waiters of a
//!   time-based limiter is not strictly first come first served
//! - `tokio::time::Instant` so tests can drive time manually

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::{LimiterAlgorithm, RateLimitConfig};

/// Outcome of an admission attempt.
#[derive(Debug)]
pub struct Lease {
    acquired: bool,
    retry_after: Option<Duration>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    fn granted(permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            acquired: true,
            retry_after: None,
            _permit: permit,
        }
    }

    fn rejected(retry_after: Option<Duration>) -> Self {
        Self {
            acquired: false,
            retry_after,
            _permit: None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Hint for when a retry might succeed.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync + Debug {
    /// Acquire without waiting.
    fn try_acquire(&self, permits: usize) -> Lease;

    /// Acquire, waiting in the queue when one is configured.
    async fn acquire(&self, permits: usize) -> Lease;

    /// Nothing held, nobody waiting and the full budget available again.
    ///
    /// An idle limiter can be dropped and rebuilt without changing behavior.
    fn is_idle(&self) -> bool;
}

/// Build a single limiter for `config.algorithm`.
pub fn build_limiter(config: &RateLimitConfig) -> Arc<dyn RateLimiter> {
    build_algorithm(config.algorithm, config)
}

pub(crate) fn build_algorithm(algorithm: LimiterAlgorithm, config: &RateLimitConfig) -> Arc<dyn RateLimiter> {
    let queue = config.queue_limit;
    match algorithm {
        LimiterAlgorithm::Concurrency => Arc::new(ConcurrencyLimiter::new(config.permit_limit, queue)),
        LimiterAlgorithm::TokenBucket => Arc::new(TimedLimiter::new(
            TokenBucket::new(
                config.permit_limit,
                config.tokens_per_period,
                Duration::from_millis(config.replenishment_period_ms),
            ),
            queue,
        )),
        LimiterAlgorithm::FixedWindow => Arc::new(TimedLimiter::new(
            FixedWindow::new(config.permit_limit, Duration::from_millis(config.window_ms)),
            queue,
        )),
        LimiterAlgorithm::SlidingWindow => Arc::new(TimedLimiter::new(
            SlidingWindow::new(
                config.permit_limit,
                Duration::from_millis(config.window_ms),
                config.segments_per_window,
            ),
            queue,
        )),
    }
}

/// Reserved places in a waiting queue, returned on drop.
#[derive(Debug)]
struct QueueSlots {
    limit: usize,
    used: AtomicUsize,
}

struct QueueReservation<'a> {
    slots: &'a QueueSlots,
    permits: usize,
}

impl QueueSlots {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, permits: usize) -> Option<QueueReservation<'_>> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + permits <= self.limit).then_some(used + permits)
            })
            .ok()
            .map(|_| QueueReservation { slots: self, permits })
    }

    fn queued(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

impl Drop for QueueReservation<'_> {
    fn drop(&mut self) {
        self.slots.used.fetch_sub(self.permits, Ordering::AcqRel);
    }
}

/// At most `permit_limit` permits held at once.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    permit_limit: usize,
    queue: QueueSlots,
}

impl ConcurrencyLimiter {
    pub fn new(permit_limit: usize, queue_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permit_limit)),
            permit_limit,
            queue: QueueSlots::new(queue_limit),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queue.queued()
    }
}

#[async_trait]
impl RateLimiter for ConcurrencyLimiter {
    fn try_acquire(&self, permits: usize) -> Lease {
        let Ok(count) = u32::try_from(permits) else {
            return Lease::rejected(None);
        };
        match self.semaphore.clone().try_acquire_many_owned(count) {
            Ok(permit) => Lease::granted(Some(permit)),
            Err(_) => Lease::rejected(None),
        }
    }

    async fn acquire(&self, permits: usize) -> Lease {
        if permits > self.permit_limit {
            return Lease::rejected(None);
        }
        let lease = self.try_acquire(permits);
        if lease.is_acquired() {
            return lease;
        }
        let Some(_reservation) = self.queue.reserve(permits) else {
            return lease;
        };
        let Ok(count) = u32::try_from(permits) else {
            return Lease::rejected(None);
        };
        match self.semaphore.clone().acquire_many_owned(count).await {
            Ok(permit) => Lease::granted(Some(permit)),
            Err(_) => Lease::rejected(None),
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.queued() == 0 && self.semaphore.available_permits() == self.permit_limit
    }
}

/// Budget that refills over time.
pub(crate) trait Replenishing: Send + Sync + Debug {
    /// Take `permits` now, or return how long until budget may free up.
    fn try_take(&mut self, permits: usize, now: Instant) -> Result<(), Duration>;

    fn capacity(&self) -> usize;

    /// Whether the whole budget has been restored by `now`.
    fn is_replenished(&mut self, now: Instant) -> bool;
}

/// Queue handling shared by the time-based algorithms.
#[derive(Debug)]
pub(crate) struct TimedLimiter<R> {
    state: Mutex<R>,
    queue: QueueSlots,
}

impl<R: Replenishing> TimedLimiter<R> {
    pub(crate) fn new(state: R, queue_limit: usize) -> Self {
        Self {
            state: Mutex::new(state),
            queue: QueueSlots::new(queue_limit),
        }
    }

    fn state(&self) -> MutexGuard<'_, R> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, permits: usize) -> Result<(), Duration> {
        self.state().try_take(permits, Instant::now())
    }
}

#[async_trait]
impl<R: Replenishing + 'static> RateLimiter for TimedLimiter<R> {
    fn try_acquire(&self, permits: usize) -> Lease {
        match self.take(permits) {
            Ok(()) => Lease::granted(None),
            Err(wait) => Lease::rejected(Some(wait)),
        }
    }

    async fn acquire(&self, permits: usize) -> Lease {
        if permits > self.state().capacity() {
            return Lease::rejected(None);
        }
        let mut wait = match self.take(permits) {
            Ok(()) => return Lease::granted(None),
            Err(wait) => wait,
        };
        let Some(_reservation) = self.queue.reserve(permits) else {
            return Lease::rejected(Some(wait));
        };
        loop {
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            match self.take(permits) {
                Ok(()) => return Lease::granted(None),
                Err(next) => wait = next,
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.queued() == 0 && self.state().is_replenished(Instant::now())
    }
}

#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: usize,
    tokens: usize,
    tokens_per_period: usize,
    period: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(capacity: usize, tokens_per_period: usize, period: Duration) -> Self {
        Self {
            capacity,
            tokens: capacity,
            tokens_per_period,
            period,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.period.is_zero() {
            return;
        }
        let periods = now.saturating_duration_since(self.last_refill).as_nanos() / self.period.as_nanos();
        if periods == 0 {
            return;
        }
        let added = (periods as usize).saturating_mul(self.tokens_per_period);
        self.tokens = self.tokens.saturating_add(added).min(self.capacity);
        let advance = u32::try_from(periods).unwrap_or(u32::MAX);
        self.last_refill += self.period.saturating_mul(advance);
    }
}

impl Replenishing for TokenBucket {
    fn try_take(&mut self, permits: usize, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= permits {
            self.tokens -= permits;
            Ok(())
        } else {
            Err((self.last_refill + self.period).saturating_duration_since(now))
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_replenished(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= self.capacity
    }
}

#[derive(Debug)]
pub(crate) struct FixedWindow {
    limit: usize,
    window: Duration,
    window_start: Instant,
    used: usize,
}

impl FixedWindow {
    pub(crate) fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: Instant::now(),
            used: 0,
        }
    }
}

impl Replenishing for FixedWindow {
    fn try_take(&mut self, permits: usize, now: Instant) -> Result<(), Duration> {
        if !self.window.is_zero() && now >= self.window_start + self.window {
            let elapsed = now.saturating_duration_since(self.window_start).as_nanos();
            let windows = elapsed / self.window.as_nanos();
            self.window_start += self.window.saturating_mul(u32::try_from(windows).unwrap_or(u32::MAX));
            self.used = 0;
        }
        if self.used + permits <= self.limit {
            self.used += permits;
            Ok(())
        } else {
            Err((self.window_start + self.window).saturating_duration_since(now))
        }
    }

    fn capacity(&self) -> usize {
        self.limit
    }

    fn is_replenished(&mut self, now: Instant) -> bool {
        self.used == 0 || now >= self.window_start + self.window
    }
}

/// Window split into segments; the oldest segment expires as time moves.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    limit: usize,
    segment: Duration,
    segments: VecDeque<usize>,
    segment_start: Instant,
}

impl SlidingWindow {
    pub(crate) fn new(limit: usize, window: Duration, segments: usize) -> Self {
        let count = segments.max(1);
        Self {
            limit,
            segment: window / u32::try_from(count).unwrap_or(u32::MAX),
            segments: std::iter::repeat(0).take(count).collect(),
            segment_start: Instant::now(),
        }
    }

    fn advance(&mut self, now: Instant) {
        if self.segment.is_zero() {
            return;
        }
        let mut steps = now.saturating_duration_since(self.segment_start).as_nanos() / self.segment.as_nanos();
        if steps as usize >= self.segments.len() {
            self.segments.iter_mut().for_each(|s| *s = 0);
        }
        self.segment_start += self.segment.saturating_mul(u32::try_from(steps).unwrap_or(u32::MAX));
        steps = steps.min(self.segments.len() as u128);
        for _ in 0..steps {
            self.segments.pop_front();
            self.segments.push_back(0);
        }
    }

    fn used(&self) -> usize {
        self.segments.iter().sum()
    }
}

impl Replenishing for SlidingWindow {
    fn try_take(&mut self, permits: usize, now: Instant) -> Result<(), Duration> {
        self.advance(now);
        if self.used() + permits <= self.limit {
            if let Some(current) = self.segments.back_mut() {
                *current += permits;
            }
            Ok(())
        } else {
            Err((self.segment_start + self.segment).saturating_duration_since(now))
        }
    }

    fn capacity(&self) -> usize {
        self.limit
    }

    fn is_replenished(&mut self, now: Instant) -> bool {
        self.advance(now);
        self.used() == 0
    }
}
