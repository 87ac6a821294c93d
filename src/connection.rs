//! ConnectionMonitor: network/connection phase and the reconnection state machine
//!
//! ```text
//! ONLINE --network lost--> OFFLINE --(immediately)--> RECONNECTING
//! RECONNECTING --restored / subscribed--> ONLINE        (attempts reset)
//! RECONNECTING --attempt cap reached--> OFFLINE (exhausted)
//! OFFLINE (exhausted) --restored / manual retry--> RECONNECTING
//! ```
//!
//! Transitions are computed by a pure function over the full prior state;
//! the monitor only stores and publishes the result.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Online,
    Offline,
    Reconnecting,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Local network loss, or the live feed closed/errored
    NetworkLost,
    NetworkRestored,
    /// Arm the retry loop after entering OFFLINE
    BeginReconnect,
    AttemptFailed,
    /// The live feed (re-)established
    Subscribed,
    /// User-triggered reconnect
    ManualRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed delay between reconnect attempts
    pub interval: Duration,
    /// Attempts per armed loop before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: Phase,
    /// Attempts since the last time we were ONLINE
    pub attempt_count: u32,
    pub last_transition_at: DateTime<Utc>,
    /// `attempt_count` when the current loop was armed
    armed_at: u32,
    /// OFFLINE because the loop ran out of attempts
    exhausted: bool,
}

impl ConnectionState {
    pub fn online() -> Self {
        Self::at(Phase::Online, Utc::now())
    }

    pub fn offline() -> Self {
        Self::at(Phase::Offline, Utc::now())
    }

    fn at(phase: Phase, now: DateTime<Utc>) -> Self {
        Self {
            phase,
            attempt_count: 0,
            last_transition_at: now,
            armed_at: 0,
            exhausted: false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.phase == Phase::Online
    }

    /// OFFLINE with the retry loop stopped; needs a restore or manual retry
    pub fn is_exhausted(&self) -> bool {
        self.phase == Phase::Offline && self.exhausted
    }

    /// Attempts made by the currently armed loop
    pub fn loop_attempts(&self) -> u32 {
        self.attempt_count - self.armed_at
    }

    /// Pure transition: the next full state for `signal`
    pub fn next(&self, signal: Signal, policy: &ReconnectPolicy, now: DateTime<Utc>) -> ConnectionState {
        use Phase::*;
        use Signal::*;

        match (self.phase, signal) {
            (Online, NetworkLost) => Self {
                phase: Offline,
                exhausted: false,
                last_transition_at: now,
                ..self.clone()
            },
            (Offline, BeginReconnect) if !self.exhausted => self.arm(now),
            (Offline, NetworkRestored | ManualRetry) if self.exhausted => self.arm(now),
            (Offline, ManualRetry) => self.arm(now),
            (Offline, NetworkRestored) | (Reconnecting, NetworkRestored) => Self::at(Online, now),
            (Offline | Reconnecting, Subscribed) => Self::at(Online, now),
            (Reconnecting, AttemptFailed) => {
                let attempt_count = self.attempt_count + 1;
                if attempt_count - self.armed_at >= policy.max_attempts {
                    Self {
                        phase: Offline,
                        attempt_count,
                        last_transition_at: now,
                        armed_at: self.armed_at,
                        exhausted: true,
                    }
                } else {
                    Self {
                        attempt_count,
                        ..self.clone()
                    }
                }
            }
            _ => self.clone(),
        }
    }

    fn arm(&self, now: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Reconnecting,
            attempt_count: self.attempt_count,
            last_transition_at: now,
            armed_at: self.attempt_count,
            exhausted: false,
        }
    }
}

/// Holds the process-wide connection state and publishes every change
pub struct ConnectionMonitor {
    state: watch::Sender<ConnectionState>,
    policy: ReconnectPolicy,
}

impl ConnectionMonitor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::online());
        Self { state, policy }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Feed a signal through the state machine and publish the result
    ///
    /// Entering a non-exhausted OFFLINE arms the retry loop right away.
    pub fn apply(&self, signal: Signal) -> ConnectionState {
        let mut state = self.step(signal);
        if state.phase == Phase::Offline && !state.exhausted {
            state = self.step(Signal::BeginReconnect);
        }
        state
    }

    fn step(&self, signal: Signal) -> ConnectionState {
        let prev = self.current();
        let next = prev.next(signal, &self.policy, Utc::now());
        if next == prev {
            return next;
        }

        if next.phase != prev.phase {
            if next.is_exhausted() {
                warn!(
                    attempts = next.loop_attempts(),
                    "Reconnect gave up, staying offline until the network returns"
                );
            } else {
                info!("Connection {:?} -> {:?} on {:?}", prev.phase, next.phase, signal);
            }
        }
        self.state.send_replace(next.clone());
        next
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: ConnectionState, signals: &[Signal]) -> ConnectionState {
        let policy = ReconnectPolicy::default();
        signals
            .iter()
            .fold(state, |s, signal| s.next(*signal, &policy, Utc::now()))
    }

    #[test]
    fn test_loss_then_reconnect_then_restore() {
        let state = run(
            ConnectionState::online(),
            &[Signal::NetworkLost, Signal::BeginReconnect],
        );
        assert_eq!(state.phase, Phase::Reconnecting);

        let state = run(state, &[Signal::AttemptFailed, Signal::AttemptFailed]);
        assert_eq!(state.phase, Phase::Reconnecting);
        assert_eq!(state.attempt_count, 2);

        let state = run(state, &[Signal::NetworkRestored]);
        assert_eq!(state.phase, Phase::Online);
        assert_eq!(state.attempt_count, 0);
    }

    #[test]
    fn test_attempt_cap_is_terminal() {
        let state = run(
            ConnectionState::online(),
            &[Signal::NetworkLost, Signal::BeginReconnect],
        );
        let state = run(state, &[Signal::AttemptFailed; 5]);
        assert_eq!(state.phase, Phase::Offline);
        assert!(state.is_exhausted());
        assert_eq!(state.attempt_count, 5);

        // the loop does not re-arm by itself
        let state = run(state, &[Signal::BeginReconnect, Signal::AttemptFailed]);
        assert!(state.is_exhausted());
        assert_eq!(state.attempt_count, 5);
    }

    #[test]
    fn test_restore_rearms_exhausted_loop_without_reset() {
        let state = run(
            ConnectionState::online(),
            &[Signal::NetworkLost, Signal::BeginReconnect],
        );
        let state = run(state, &[Signal::AttemptFailed; 5]);
        let state = run(state, &[Signal::NetworkRestored]);
        assert_eq!(state.phase, Phase::Reconnecting);
        assert_eq!(state.attempt_count, 5);
        assert_eq!(state.loop_attempts(), 0);

        // fresh budget for the re-armed loop
        let state = run(state, &[Signal::AttemptFailed; 4]);
        assert_eq!(state.phase, Phase::Reconnecting);
        let state = run(state, &[Signal::Subscribed]);
        assert_eq!(state.phase, Phase::Online);
        assert_eq!(state.attempt_count, 0);
    }

    #[test]
    fn test_manual_retry_rearms() {
        let state = run(
            ConnectionState::online(),
            &[Signal::NetworkLost, Signal::BeginReconnect],
        );
        let state = run(state, &[Signal::AttemptFailed; 5]);
        let state = run(state, &[Signal::ManualRetry]);
        assert_eq!(state.phase, Phase::Reconnecting);
    }

    #[test]
    fn test_irrelevant_signals_are_ignored() {
        let online = ConnectionState::online();
        assert_eq!(run(online.clone(), &[Signal::AttemptFailed]), online);
        assert_eq!(run(online.clone(), &[Signal::ManualRetry]), online);
        assert_eq!(run(online.clone(), &[Signal::BeginReconnect]), online);

        let reconnecting = run(online, &[Signal::NetworkLost, Signal::BeginReconnect]);
        assert_eq!(
            run(reconnecting.clone(), &[Signal::NetworkLost]),
            reconnecting
        );
    }

    #[test]
    fn test_monitor_arms_immediately_and_publishes() {
        let monitor = ConnectionMonitor::default();
        let mut rx = monitor.subscribe();

        let state = monitor.apply(Signal::NetworkLost);
        assert_eq!(state.phase, Phase::Reconnecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phase, Phase::Reconnecting);

        for _ in 0..5 {
            monitor.apply(Signal::AttemptFailed);
        }
        assert!(monitor.current().is_exhausted());

        monitor.apply(Signal::NetworkRestored);
        assert_eq!(monitor.phase(), Phase::Reconnecting);
        monitor.apply(Signal::Subscribed);
        assert!(monitor.current().is_online());
    }
}
