//! Tunables and the one precedence rule that resolves them.
//!
//! Retry, timeout, reconnect, stream tuning and max-message-size can each be
//! set at operation, rpc, or global scope. [`resolve`] applies the single
//! merging rule used everywhere: operation wins over rpc, rpc over global,
//! global over the documented default. No component invents its own rule.
//!
//! Backoff delays grow exponentially and are spread by uniform jitter so
//! that a fleet of clients does not hammer a recovering server in lockstep.

use std::time::Duration;

/// Default bound on the accumulated `data:` bytes of one SSE event (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Retry policy for procedure calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total transport attempts, including the first (>= 1).
    pub max_attempts: u32,
    /// Delay before the second attempt. Zero disables backoff entirely.
    pub initial_delay: Duration,
    /// Upper bound on a single delay. Zero means uncapped.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub delay_multiplier: f64,
    /// Jitter fraction in [0, 1]; values outside are clamped.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            delay_multiplier: 1.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Backoff to sleep after attempt `attempt` (1-based) fails.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.max_delay,
            self.delay_multiplier,
            self.jitter,
            attempt,
        )
    }

    /// Attempts with the >= 1 floor applied.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Reconnect policy for stream calls. Same shape as [`RetryConfig`] with
/// defaults tuned for long-lived connections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub delay_multiplier: f64,
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            delay_multiplier: 1.5,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Backoff to sleep before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.max_delay,
            self.delay_multiplier,
            self.jitter,
            attempt,
        )
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Per-attempt deadline for procedure calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutConfig {
    /// `None` disables the deadline.
    pub timeout: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TimeoutConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// No deadline at all.
    pub fn none() -> Self {
        Self { timeout: None }
    }
}

/// Server-side stream tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamTuning {
    /// Interval between `: ping` keepalive frames. Must be > 0.
    pub ping_interval: Duration,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// The precedence rule: operation > rpc > global > default.
pub fn resolve<T>(operation: Option<T>, rpc: Option<T>, global: Option<T>, default: T) -> T {
    operation.or(rpc).or(global).unwrap_or(default)
}

/// Exponential backoff with jitter.
///
/// `delay(n) = min(max_delay, initial * multiplier^(n-1))`, then jitter
/// spreads the result uniformly over `[d*(1-j), d*(1+j)]` with the lower
/// bound clipped at zero. A zero `initial` short-circuits to zero.
pub(crate) fn backoff_delay(
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
) -> Duration {
    if initial.is_zero() {
        return Duration::ZERO;
    }
    let exp = multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
    let mut secs = initial.as_secs_f64() * exp;
    if !secs.is_finite() || secs < 0.0 {
        secs = max.as_secs_f64();
    }
    let cap = max.as_secs_f64();
    if cap > 0.0 && secs > cap {
        secs = cap;
    }
    apply_jitter(secs, jitter)
}

fn apply_jitter(secs: f64, jitter: f64) -> Duration {
    let j = jitter.clamp(0.0, 1.0);
    if j == 0.0 || secs <= 0.0 {
        return to_duration(secs.max(0.0));
    }
    let span = secs * j;
    let low = (secs - span).max(0.0);
    let high = secs + span;
    let sample = low + fastrand::f64() * (high - low);
    to_duration(sample)
}

fn to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
