//! Publish-side circuit breaker
//!
//! Guards the transport boundary of `publish`. After a run of consecutive
//! failures the breaker opens and rejects publishes immediately instead of
//! hammering a broken transport; after a cooldown a single probe is allowed
//! through (half-open) and its outcome decides whether the breaker closes
//! again or re-opens.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{BusError, BusResult};

/// Tunables for the breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Circuit breaker with closed / open / half-open states.
///
/// Shared via `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Current state, resolving an elapsed cooldown to half-open.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Inner::Open { since } = *inner {
            if since.elapsed() >= self.config.cooldown {
                *inner = Inner::HalfOpen;
            }
        }
        match *inner {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Gate a publish attempt. `Err(CircuitOpen)` while the breaker is open.
    pub fn check(&self) -> BusResult<()> {
        match self.state() {
            BreakerState::Open => Err(BusError::CircuitOpen),
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
        }
    }

    /// Record a successful transport operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match *inner {
            Inner::HalfOpen => {
                info!("Circuit breaker closing after successful probe");
                *inner = Inner::Closed {
                    consecutive_failures: 0,
                };
            }
            Inner::Closed {
                ref mut consecutive_failures,
            } => *consecutive_failures = 0,
            Inner::Open { .. } => {}
        }
    }

    /// Record a failed transport operation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match *inner {
            Inner::Closed {
                ref mut consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = *consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit breaker tripped open"
                    );
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen => {
                warn!("Circuit breaker probe failed, re-opening");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
