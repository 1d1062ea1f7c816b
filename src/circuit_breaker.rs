//! Circuit breaker implementation with lock-free atomics.
//!
//! One breaker guards the vehicle registry for the whole process. Callers ask
//! for a [`CallPermit`] before contacting the registry and report the outcome
//! through it exactly once; the permit is consumed by the report, so a single
//! attempt can never be counted twice. A permit dropped without a report
//! (cache hit, rate-limit denial, caller cancelled) records nothing.
//!
//! ```text
//!   CLOSED --F consecutive failures--> OPEN --cool-down elapsed--> HALF_OPEN
//!     ^                                  ^                            |
//!     +--------- trial succeeds ---------|----------------------------+
//!                                        +------ trial fails ---------+
//! ```
//!
//! `force_open` latches the breaker open until `force_close`.

use crate::clock::{duration_millis, Clock, SystemClock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Consecutive failures that open the breaker by default.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;
/// Default time the breaker stays open before admitting a trial call.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cool-down elapses.
    Open,
    /// One trial call is deciding whether the registry recovered.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when validating breaker configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Cool-down must be > 0.
    #[error("cooldown must be > 0 (got {0:?})")]
    InvalidCooldown(Duration),
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    cooldown: Duration,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if cooldown.is_zero() {
            return Err(CircuitBreakerError::InvalidCooldown(cooldown));
        }
        Ok(Self { failure_threshold, cooldown })
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Duration to stay Open before a trial call.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, cooldown: DEFAULT_COOLDOWN }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: AtomicU8,
    forced: AtomicBool,
    trial_in_flight: AtomicBool,
    // Bumped whenever an outstanding trial permit becomes stale.
    trial_epoch: AtomicU64,
    consecutive_failures: AtomicUsize,
    successes_since_half_open: AtomicUsize,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
    // Epoch millis; 0 means never.
    last_failure_at: AtomicU64,
    last_state_change_at: AtomicU64,
}

/// Why a permit was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// An operator forced the breaker open.
    ForcedOpen,
    /// Open and the cool-down has not elapsed.
    CoolingDown,
    /// Half-open and the single trial call is already running.
    TrialInFlight,
}

/// A refused permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub reason: RejectReason,
    pub consecutive_failures: usize,
    /// Remaining cool-down, when the breaker will reopen for a trial on its own.
    pub retry_in: Option<Duration>,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.reason, self.retry_in) {
            (RejectReason::ForcedOpen, _) => write!(f, "circuit breaker forced open"),
            (RejectReason::CoolingDown, Some(wait)) => write!(
                f,
                "circuit breaker open ({} failures, trial in {:?})",
                self.consecutive_failures, wait
            ),
            (RejectReason::CoolingDown, None) => {
                write!(f, "circuit breaker open ({} failures)", self.consecutive_failures)
            }
            (RejectReason::TrialInFlight, _) => {
                write!(f, "circuit breaker half-open with a trial call in flight")
            }
        }
    }
}

impl std::error::Error for Rejected {}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError<E> {
    /// The breaker refused the call; the operation never ran.
    Rejected(Rejected),
    /// The operation ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Rejected(r) => write!(f, "{}", r),
            CallError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Inner(e) => Some(e),
            CallError::Rejected(_) => None,
        }
    }
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub forced: bool,
    pub consecutive_failures: usize,
    pub failure_threshold: usize,
    pub successes_since_half_open: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub last_failure_at: Option<u64>,
    pub last_state_change_at: Option<u64>,
    pub cooldown_ms: u64,
    /// Time left before a trial is admitted; only while open and not forced.
    pub cooldown_remaining_ms: Option<u64>,
}

/// Circuit breaker guarding the registry.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and
/// affect the same circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a breaker reading time from `clock` (useful for deterministic tests).
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { state: Arc::new(BreakerState::default()), config, clock }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    /// Ask to contact the registry.
    ///
    /// - **Closed**: always granted.
    /// - **Open**: refused until the cool-down elapses; the first caller after that
    ///   moves the breaker to half-open and receives the trial permit.
    /// - **HalfOpen**: the single trial permit, or refusal while it is taken.
    pub fn try_acquire(&self) -> Result<CallPermit, Rejected> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(self.permit(false, 0)),
                CircuitState::Open => {
                    if let Some(rejected) = self.holding_open() {
                        return Err(rejected);
                    }
                    let now = self.now_millis();
                    if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        self.state.trial_epoch.fetch_add(1, Ordering::AcqRel);
                        self.state.successes_since_half_open.store(0, Ordering::Release);
                        self.state.last_state_change_at.store(now, Ordering::Release);
                        tracing::info!("vehicle registry circuit → half-open");
                    }
                    // Whoever moved it, the trial slot is claimed in the HalfOpen arm.
                }
                CircuitState::HalfOpen => {
                    let epoch = self.state.trial_epoch.load(Ordering::Acquire);
                    if self
                        .state
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(self.reject(RejectReason::TrialInFlight, None));
                    }
                    if self.state() != CircuitState::HalfOpen {
                        // Lost a race with a transition; give the slot back and look again.
                        self.state.trial_in_flight.store(false, Ordering::Release);
                        continue;
                    }
                    tracing::debug!("vehicle registry circuit: trial call admitted");
                    return Ok(self.permit(true, epoch));
                }
            }
        }
    }

    /// Refuse without claiming anything while the breaker is held open: forced,
    /// or open with the cool-down still running. Closed and half-open pass, and
    /// so does an open breaker whose cool-down has elapsed; only
    /// [`try_acquire`](Self::try_acquire) claims the trial slot.
    pub fn check_open(&self) -> Result<(), Rejected> {
        if self.state() != CircuitState::Open {
            return Ok(());
        }
        self.holding_open().map_or(Ok(()), Err)
    }

    /// Run `operation` under breaker protection, reporting its outcome.
    pub async fn call<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.try_acquire().map_err(CallError::Rejected)?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(err) => {
                permit.record_failure();
                Err(CallError::Inner(err))
            }
        }
    }

    /// Open the breaker and keep it open until [`force_close`](Self::force_close).
    pub fn force_open(&self) {
        self.state.forced.store(true, Ordering::Release);
        self.state.trial_epoch.fetch_add(1, Ordering::AcqRel);
        self.state.last_state_change_at.store(self.now_millis(), Ordering::Release);
        self.set_state(CircuitState::Open);
        self.state.trial_in_flight.store(false, Ordering::Release);
        tracing::warn!("vehicle registry circuit forced open");
    }

    /// Close the breaker and clear the failure streak, whatever its state.
    pub fn force_close(&self) {
        self.state.forced.store(false, Ordering::Release);
        self.state.trial_epoch.fetch_add(1, Ordering::AcqRel);
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.last_state_change_at.store(self.now_millis(), Ordering::Release);
        self.set_state(CircuitState::Closed);
        self.state.trial_in_flight.store(false, Ordering::Release);
        tracing::info!("vehicle registry circuit forced closed");
    }

    /// Zero every counter; the state is left as it is.
    pub fn reset_metrics(&self) {
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.successes_since_half_open.store(0, Ordering::Release);
        self.state.total_successes.store(0, Ordering::Release);
        self.state.total_failures.store(0, Ordering::Release);
        self.state.rejected_calls.store(0, Ordering::Release);
        self.state.last_failure_at.store(0, Ordering::Release);
        tracing::info!(state = %self.state(), "vehicle registry circuit metrics reset");
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.state();
        let forced = self.state.forced.load(Ordering::Acquire);
        let last_change = self.state.last_state_change_at.load(Ordering::Acquire);
        let cooldown_ms = duration_millis(self.config.cooldown);
        let cooldown_remaining_ms = (state == CircuitState::Open && !forced)
            .then(|| cooldown_ms.saturating_sub(self.now_millis().saturating_sub(last_change)));

        BreakerStatus {
            state,
            forced,
            consecutive_failures: self.state.consecutive_failures.load(Ordering::Acquire),
            failure_threshold: self.config.failure_threshold,
            successes_since_half_open: self.state.successes_since_half_open.load(Ordering::Acquire),
            total_successes: self.state.total_successes.load(Ordering::Acquire),
            total_failures: self.state.total_failures.load(Ordering::Acquire),
            rejected_calls: self.state.rejected_calls.load(Ordering::Acquire),
            last_failure_at: non_zero(self.state.last_failure_at.load(Ordering::Acquire)),
            last_state_change_at: non_zero(last_change),
            cooldown_ms,
            cooldown_remaining_ms,
        }
    }

    // Forced open, or open and still cooling down.
    fn holding_open(&self) -> Option<Rejected> {
        if self.state.forced.load(Ordering::Acquire) {
            return Some(self.reject(RejectReason::ForcedOpen, None));
        }
        let opened_at = self.state.last_state_change_at.load(Ordering::Acquire);
        let elapsed = self.now_millis().saturating_sub(opened_at);
        let cooldown = duration_millis(self.config.cooldown);
        (elapsed < cooldown).then(|| {
            let wait = Duration::from_millis(cooldown - elapsed);
            self.reject(RejectReason::CoolingDown, Some(wait))
        })
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: CircuitState) {
        self.state.state.store(state.to_u8(), Ordering::Release);
    }

    fn permit(&self, trial: bool, epoch: u64) -> CallPermit {
        CallPermit { breaker: self.clone(), trial, epoch, settled: false }
    }

    fn reject(&self, reason: RejectReason, retry_in: Option<Duration>) -> Rejected {
        self.state.rejected_calls.fetch_add(1, Ordering::Relaxed);
        Rejected {
            reason,
            consecutive_failures: self.state.consecutive_failures.load(Ordering::Acquire),
            retry_in,
        }
    }

    fn on_success(&self, trial: bool, epoch: u64) {
        self.state.total_successes.fetch_add(1, Ordering::Relaxed);
        self.state.successes_since_half_open.fetch_add(1, Ordering::AcqRel);

        if trial {
            if self.state.trial_epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            self.state.consecutive_failures.store(0, Ordering::Release);
            self.state.last_state_change_at.store(self.now_millis(), Ordering::Release);
            if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                tracing::info!("vehicle registry circuit → closed");
            }
            self.state.trial_in_flight.store(false, Ordering::Release);
            return;
        }

        // Only consecutive failures trip the breaker: any success in Closed resets the streak.
        if self.state() == CircuitState::Closed {
            self.state.consecutive_failures.store(0, Ordering::Release);
        }
    }

    /// Returns true when this failure moved the breaker to Open.
    fn on_failure(&self, trial: bool, epoch: u64) -> bool {
        let now = self.now_millis();
        self.state.total_failures.fetch_add(1, Ordering::Relaxed);
        self.state.last_failure_at.store(now, Ordering::Release);
        let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if trial {
            if self.state.trial_epoch.load(Ordering::Acquire) != epoch {
                return false;
            }
            // Timestamp first so a concurrent reader never pairs Open with a stale opened-at.
            self.state.last_state_change_at.store(now, Ordering::Release);
            let reopened = self.transition(CircuitState::HalfOpen, CircuitState::Open);
            if reopened {
                tracing::warn!(failures, "vehicle registry circuit: trial failed → open");
            }
            self.state.trial_in_flight.store(false, Ordering::Release);
            return reopened;
        }

        if failures >= self.config.failure_threshold && self.state() == CircuitState::Closed {
            self.state.last_state_change_at.store(now, Ordering::Release);
            if self.transition(CircuitState::Closed, CircuitState::Open) {
                tracing::error!(
                    failures,
                    threshold = self.config.failure_threshold,
                    "vehicle registry circuit → open"
                );
                return true;
            }
        }
        false
    }

    fn release_trial(&self, epoch: u64) {
        if self.state.trial_epoch.load(Ordering::Acquire) == epoch {
            self.state.trial_in_flight.store(false, Ordering::Release);
            tracing::debug!("vehicle registry circuit: trial permit released unused");
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

fn non_zero(v: u64) -> Option<u64> {
    (v != 0).then_some(v)
}

/// Permission to make one registry call.
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping the permit unreported
/// frees the half-open trial slot without counting anything, which is what a
/// cancelled caller should do.
#[must_use = "report the call outcome, or drop the permit if no call was made"]
#[derive(Debug)]
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: bool,
    epoch: u64,
    settled: bool,
}

impl CallPermit {
    /// True when this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial, self.epoch);
    }

    /// Returns true when this failure opened (or re-opened) the breaker.
    pub fn record_failure(mut self) -> bool {
        self.settled = true;
        self.breaker.on_failure(self.trial, self.epoch)
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.epoch);
        }
    }
}
