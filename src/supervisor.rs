//! Session lifecycle: dial, relay, back off, redial.
//!
//! ```text
//! Idle → Dialing → Active → Closing → BackoffWait → Dialing → ...
//!           └──(dial error)──────────→ BackoffWait
//! any state ──(cancel)──→ Terminated
//! ```
//!
//! Dial and relay failures never end the loop. Only cancellation does.

use crate::backoff::BackoffStrategy;
use crate::device::PacketDevice;
use crate::dialer::Dialer;
use crate::relay::{Relay, RelayOptions, RelayStats};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Dialing,
    Active,
    Closing,
    BackoffWait(Duration),
    Terminated,
}

/// Supervisor counters.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    pub dial_attempts: AtomicU64,
    pub dial_failures: AtomicU64,
    pub sessions_established: AtomicU64,
    pub relay_failures: AtomicU64,
    pub backoff_waits: AtomicU64,
}

/// Point-in-time copy of [`SupervisorStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub dial_attempts: u64,
    pub dial_failures: u64,
    pub sessions_established: u64,
    pub relay_failures: u64,
    pub backoff_waits: u64,
}

impl SupervisorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dial_attempts: self.dial_attempts.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            sessions_established: self.sessions_established.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            backoff_waits: self.backoff_waits.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dials={} dial_failures={} sessions={} relay_failures={} backoffs={}",
            self.dial_attempts,
            self.dial_failures,
            self.sessions_established,
            self.relay_failures,
            self.backoff_waits
        )
    }
}

/// Owns at most one session at a time and keeps redialing until canceled.
pub struct Supervisor<D: Dialer, P: PacketDevice> {
    dialer: D,
    device: Arc<P>,
    relay: Relay,
    backoff: Box<dyn BackoffStrategy>,
    state: watch::Sender<SupervisorState>,
    stats: Arc<SupervisorStats>,
}

impl<D: Dialer, P: PacketDevice> Supervisor<D, P> {
    pub fn new(
        dialer: D,
        device: Arc<P>,
        relay_options: RelayOptions,
        backoff: Box<dyn BackoffStrategy>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            dialer,
            device,
            relay: Relay::new(relay_options),
            backoff,
            state,
            stats: Arc::new(SupervisorStats::new()),
        }
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &Arc<SupervisorStats> {
        &self.stats
    }

    pub fn relay_stats(&self) -> &Arc<RelayStats> {
        self.relay.stats()
    }

    fn set_state(&self, state: SupervisorState) {
        log::debug!("Supervisor state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Run until `cancel` fires. Returns once any live session is closed and
    /// both pumps have exited.
    pub async fn run(&self, cancel: CancellationToken) {
        // consecutive failures since the last active session
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(SupervisorState::Dialing);
            self.stats.dial_attempts.fetch_add(1, Ordering::Relaxed);
            let dialed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.dialer.dial() => result,
            };

            match dialed {
                Ok(mut session) => {
                    attempt = 0;
                    self.stats
                        .sessions_established
                        .fetch_add(1, Ordering::Relaxed);
                    match session.ack() {
                        Some(ack) => log::info!(
                            "Session established with {} (ack {} bytes)",
                            session.relay_addr(),
                            ack.len()
                        ),
                        None => log::info!("Session established with {}", session.relay_addr()),
                    }
                    self.set_state(SupervisorState::Active);

                    let failure = self.relay.run(&cancel, &self.device, &mut session).await;
                    self.set_state(SupervisorState::Closing);
                    session.close().await;
                    if failure.is_canceled() {
                        break;
                    }
                    self.stats.relay_failures.fetch_add(1, Ordering::Relaxed);
                    attempt = 1;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dial attempt {} failed: {}", attempt, e);
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = self.backoff.next(attempt);
            self.stats.backoff_waits.fetch_add(1, Ordering::Relaxed);
            self.set_state(SupervisorState::BackoffWait(delay));
            log::info!("Reconnecting in {:.1}s", delay.as_secs_f64());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::info!("Supervisor canceled ({})", self.stats.snapshot());
        self.set_state(SupervisorState::Terminated);
    }
}
