//! Channel Connection Manager.
//!
//! Owns one logical subscription channel's lifecycle: a small finite-state
//! machine ([`ChannelFsm`]) decides transitions, and [`ChannelManager`]
//! drives it against real timers and an [`EventSource`]. The FSM holds no
//! I/O, so every transition is unit-testable without a network.
//!
//! States: `Idle → Connecting → Subscribed`; a failure from `Connecting` or
//! `Subscribed` moves to `Retrying` while the retry budget lasts, then to
//! `Failed`. `Failed` is not terminal: an independent health-check tick
//! resets the budget and forces a fresh `Connecting` attempt, so the channel
//! eventually recovers without an unbounded retry storm in the interim.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::dispatch::{self, Lane};
use crate::protocol::{ChangeEvent, ChannelId, EntityFilter};
use crate::stream::{ChangeStream, EventSource};

// ── Backoff ─────────────────────────────────────────────────────────

/// Reconnect backoff parameters: `delay = min(base · 1.2^retry, cap)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(300),
            cap: Duration::from_secs(3),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let scaled = self.base.mul_f64(1.2f64.powi(retry.min(64) as i32));
        scaled.min(self.cap)
    }
}

// ── FSM ─────────────────────────────────────────────────────────────

/// Lifecycle state of the subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting,
    Subscribed,
    Retrying,
    Failed,
}

/// Outcome of feeding a failure into the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Schedule a reconnect after the given backoff delay.
    Reconnect { after: Duration },
    /// Retry budget exhausted; wait for the health check.
    GiveUp,
}

/// Pure reconnection state machine. No I/O, no timers.
#[derive(Debug, Clone)]
pub struct ChannelFsm {
    state: ChannelState,
    retries: u32,
    policy: BackoffPolicy,
    channel_id: ChannelId,
}

impl ChannelFsm {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ChannelState::Idle,
            retries: 0,
            policy,
            channel_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Identity of the current (or most recent) channel.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Whether a channel is currently connecting or subscribed.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Connecting | ChannelState::Subscribed
        )
    }

    /// Enter `Connecting` and mint a fresh channel identity.
    ///
    /// Channel identities are never reused; every (re)subscribe gets a new
    /// one so a late event from a torn-down channel can be told apart.
    pub fn begin_connect(&mut self) -> ChannelId {
        self.state = ChannelState::Connecting;
        self.channel_id = Uuid::new_v4();
        self.channel_id
    }

    /// The subscription is established. Resets the retry budget.
    pub fn subscribed(&mut self) {
        self.state = ChannelState::Subscribed;
        self.retries = 0;
    }

    /// Force an immediate reconnect without touching the retry budget.
    /// Used when the watched filter set changes mid-subscription.
    pub fn restart(&mut self) {
        self.state = ChannelState::Connecting;
    }

    /// The subscribe attempt or live channel failed.
    pub fn failure(&mut self) -> Transition {
        if self.retries < self.policy.max_retries {
            let after = self.policy.delay(self.retries);
            self.retries += 1;
            self.state = ChannelState::Retrying;
            Transition::Reconnect { after }
        } else {
            self.state = ChannelState::Failed;
            Transition::GiveUp
        }
    }

    /// The scheduled retry delay elapsed; move back to `Connecting`.
    pub fn retry_elapsed(&mut self) {
        if self.state == ChannelState::Retrying {
            self.state = ChannelState::Connecting;
        }
    }

    /// Health-check probe. If no channel is live, resets the retry budget
    /// and forces `Connecting`; returns whether a reconnect was forced.
    pub fn health_check(&mut self) -> bool {
        if self.is_live() {
            return false;
        }
        self.retries = 0;
        self.state = ChannelState::Connecting;
        true
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// State report sent to the engine whenever the channel changes state.
#[derive(Debug, Clone)]
pub(crate) struct ChannelNotice {
    pub(crate) state: ChannelState,
    pub(crate) retries: u32,
    pub(crate) reason: Option<String>,
}

/// Drives the [`ChannelFsm`] against a real [`EventSource`] and forwards
/// decoded events into the engine's priority lanes.
pub(crate) struct ChannelManager {
    source: Arc<dyn EventSource>,
    fsm: ChannelFsm,
    filters: Vec<EntityFilter>,
    critical_tx: mpsc::UnboundedSender<ChangeEvent>,
    normal_tx: mpsc::UnboundedSender<ChangeEvent>,
    notice_tx: mpsc::UnboundedSender<ChannelNotice>,
    health_interval: Duration,
}

impl ChannelManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source: Arc<dyn EventSource>,
        policy: BackoffPolicy,
        filters: Vec<EntityFilter>,
        critical_tx: mpsc::UnboundedSender<ChangeEvent>,
        normal_tx: mpsc::UnboundedSender<ChangeEvent>,
        notice_tx: mpsc::UnboundedSender<ChannelNotice>,
        health_interval: Duration,
    ) -> Self {
        Self {
            source,
            fsm: ChannelFsm::new(policy),
            filters,
            critical_tx,
            normal_tx,
            notice_tx,
            health_interval,
        }
    }

    fn notify(&self, reason: Option<String>) {
        let _ = self.notice_tx.send(ChannelNotice {
            state: self.fsm.state(),
            retries: self.fsm.retries(),
            reason,
        });
    }

    fn forward(&self, event: ChangeEvent) {
        let tx = match dispatch::lane(event.entity) {
            Lane::Critical => &self.critical_tx,
            Lane::Normal => &self.normal_tx,
        };
        let _ = tx.send(event);
    }

    fn handle_failure(&mut self, reason: String, retry_delay: &mut Duration) {
        match self.fsm.failure() {
            Transition::Reconnect { after } => {
                warn!(
                    retries = self.fsm.retries(),
                    delay_ms = after.as_millis() as u64,
                    %reason,
                    "change channel failed, scheduling reconnect"
                );
                *retry_delay = after;
            }
            Transition::GiveUp => {
                error!(%reason, "change channel retry budget exhausted");
            }
        }
        self.notify(Some(reason));
    }

    /// Run until the refilter channel closes (engine teardown).
    ///
    /// `refilter_rx` doubles as the shutdown signal: the engine holds the
    /// sender and uses it to swap the watched filter set; when the engine
    /// exits the channel closes and this loop winds down.
    pub(crate) async fn run(mut self, mut refilter_rx: mpsc::UnboundedReceiver<Vec<EntityFilter>>) {
        let mut stream: Option<Box<dyn ChangeStream>> = None;
        // First probe one full interval out, not immediately.
        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + self.health_interval,
            self.health_interval,
        );
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut retry_delay = Duration::ZERO;

        debug!("channel manager started");

        loop {
            match self.fsm.state() {
                ChannelState::Idle | ChannelState::Connecting => {
                    // Tear down any previous channel under the same logical
                    // name before opening a new one; two live channels would
                    // mean duplicate delivery.
                    if let Some(mut old) = stream.take() {
                        let _ = old.close().await;
                    }
                    let channel = self.fsm.begin_connect();
                    self.notify(None);
                    debug!(%channel, "subscribing change channel");
                    match self.source.subscribe(channel, self.filters.clone()).await {
                        Ok(s) => {
                            stream = Some(s);
                            self.fsm.subscribed();
                            debug!(%channel, "change channel subscribed");
                            self.notify(None);
                        }
                        Err(e) => self.handle_failure(e.to_string(), &mut retry_delay),
                    }
                }

                ChannelState::Subscribed => {
                    let Some(s) = stream.as_mut() else {
                        // Unreachable by construction; resubscribe to be safe.
                        self.fsm.restart();
                        continue;
                    };
                    tokio::select! {
                        biased;

                        filters = refilter_rx.recv() => match filters {
                            Some(filters) => {
                                debug!("filter set changed, resubscribing");
                                self.filters = filters;
                                self.fsm.restart();
                            }
                            None => break,
                        },

                        // Liveness probe; a subscribed channel needs nothing.
                        _ = health.tick() => {}

                        incoming = s.recv() => match incoming {
                            Some(Ok(event)) => self.forward(event),
                            Some(Err(e)) => {
                                self.handle_failure(e.to_string(), &mut retry_delay);
                            }
                            None => {
                                self.handle_failure("channel closed by server".into(), &mut retry_delay);
                            }
                        },
                    }
                }

                ChannelState::Retrying => {
                    tokio::select! {
                        biased;

                        filters = refilter_rx.recv() => match filters {
                            Some(filters) => {
                                self.filters = filters;
                                self.fsm.retry_elapsed();
                            }
                            None => break,
                        },

                        _ = tokio::time::sleep(retry_delay) => self.fsm.retry_elapsed(),
                    }
                }

                ChannelState::Failed => {
                    tokio::select! {
                        biased;

                        filters = refilter_rx.recv() => match filters {
                            Some(filters) => {
                                self.filters = filters;
                                self.fsm.health_check();
                            }
                            None => break,
                        },

                        _ = health.tick() => {
                            if self.fsm.health_check() {
                                debug!("health check forcing channel reconnect");
                                self.notify(None);
                            }
                        }
                    }
                }
            }
        }

        if let Some(mut s) = stream.take() {
            let _ = s.close().await;
        }
        debug!("channel manager exited");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn fsm() -> ChannelFsm {
        ChannelFsm::new(BackoffPolicy::default())
    }

    #[test]
    fn starts_idle() {
        let fsm = fsm();
        assert_eq!(fsm.state(), ChannelState::Idle);
        assert_eq!(fsm.retries(), 0);
        assert!(!fsm.is_live());
    }

    #[test]
    fn connect_then_subscribe_resets_retries() {
        let mut fsm = fsm();
        fsm.begin_connect();
        assert_eq!(fsm.state(), ChannelState::Connecting);
        let _ = fsm.failure();
        assert_eq!(fsm.retries(), 1);
        fsm.begin_connect();
        fsm.subscribed();
        assert_eq!(fsm.state(), ChannelState::Subscribed);
        assert_eq!(fsm.retries(), 0);
    }

    #[test]
    fn channel_identity_never_reused() {
        let mut fsm = fsm();
        let first = fsm.begin_connect();
        let second = fsm.begin_connect();
        let third = fsm.begin_connect();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_ne!(first, third);
    }

    #[test]
    fn failure_schedules_backoff_until_budget_exhausted() {
        let mut fsm = fsm();
        fsm.begin_connect();

        for retry in 0..5 {
            match fsm.failure() {
                Transition::Reconnect { after } => {
                    assert_eq!(after, BackoffPolicy::default().delay(retry));
                    assert_eq!(fsm.state(), ChannelState::Retrying);
                }
                Transition::GiveUp => panic!("budget should last 5 retries"),
            }
            fsm.retry_elapsed();
            assert_eq!(fsm.state(), ChannelState::Connecting);
        }

        assert_eq!(fsm.failure(), Transition::GiveUp);
        assert_eq!(fsm.state(), ChannelState::Failed);
    }

    #[test]
    fn backoff_delays_grow_and_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(300));
        assert!(policy.delay(1) > policy.delay(0));
        assert!(policy.delay(4) > policy.delay(3));
        // 300ms · 1.2^20 ≈ 11.5s, well past the cap.
        assert_eq!(policy.delay(20), Duration::from_secs(3));
    }

    #[test]
    fn health_check_restores_failed_channel() {
        let mut fsm = fsm();
        fsm.begin_connect();
        for _ in 0..5 {
            let _ = fsm.failure();
            fsm.retry_elapsed();
        }
        let _ = fsm.failure();
        assert_eq!(fsm.state(), ChannelState::Failed);

        assert!(fsm.health_check());
        assert_eq!(fsm.state(), ChannelState::Connecting);
        assert_eq!(fsm.retries(), 0);
    }

    #[test]
    fn health_check_is_noop_while_live() {
        let mut fsm = fsm();
        fsm.begin_connect();
        assert!(!fsm.health_check());
        fsm.subscribed();
        assert!(!fsm.health_check());
        assert_eq!(fsm.state(), ChannelState::Subscribed);
    }

    #[test]
    fn restart_keeps_retry_budget() {
        let mut fsm = fsm();
        fsm.begin_connect();
        let _ = fsm.failure();
        assert_eq!(fsm.retries(), 1);
        fsm.restart();
        assert_eq!(fsm.state(), ChannelState::Connecting);
        assert_eq!(fsm.retries(), 1);
    }
}
