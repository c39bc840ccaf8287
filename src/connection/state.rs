//! Connection state machine.
//!
//! Pure transition logic with no I/O: each [`Input`] either moves the machine
//! to a new [`ConnectionState`] and returns the [`Effect`]s the driver must
//! perform, or is rejected with a [`TransitionError`].
//!
//! # State Machine
//! ```text
//! Disconnected --connect--> Connecting --opened--> Open --closed(clean)--> Disconnected
//!                               ^                   |
//!                               |             closed(unclean) / liveness expired
//!                          timer fired              v
//!                               +------------ Reconnecting --(attempts exhausted)--> Disconnected
//!
//! any --disconnect--> Disconnected        any --destroy--> Closed
//! ```
//!
//! # Invariants
//! - The heartbeat runs iff the state is `Open`
//! - The reconnect timer runs iff the state is `Reconnecting`
//! - `reconnect_attempts <= max_reconnect_attempts`

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::ConnectionConfig;

/// Upper bound for exponential reconnect delays.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Lifecycle state of the persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    /// Torn down by `destroy`; no further transitions
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Events fed into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Explicit `connect()` call
    Connect,
    /// Transport handshake completed
    Opened,
    /// Transport failed before opening
    OpenFailed,
    /// Transport closed after opening
    Closed { clean: bool },
    /// Open connection missed its liveness window
    LivenessExpired,
    /// Reconnect delay elapsed
    ReconnectTimerFired,
    /// Operator-initiated `disconnect()`
    Disconnect,
    /// Final teardown
    Destroy,
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport,
    CloseTransport,
    StartHeartbeat,
    StopHeartbeat,
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelReconnect,
    /// Resend `subscribe_task` for each id, staggered
    Resubscribe(Vec<String>),
    CancelResubscribe,
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Reconnection gave up after `attempts` tries
    ConnectionLost { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Connection attempt already in progress ({0})")]
    InProgress(ConnectionState),

    #[error("Connection has been destroyed")]
    Destroyed,

    #[error("Input {input:?} is not valid in state {state}")]
    Invalid {
        state: ConnectionState,
        input: Input,
    },
}

/// Reconnect timing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub exponential: bool,
}

impl ReconnectPolicy {
    /// Delay before the given 1-indexed attempt.
    ///
    /// Fixed policies always return `interval`. Exponential policies return
    /// `interval * 2^(attempt - 1)` capped at 60 seconds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.interval;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        self.interval
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(MAX_BACKOFF.max(self.interval))
    }
}

impl From<&ConnectionConfig> for ReconnectPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            interval: config.reconnect_interval(),
            max_attempts: config.max_reconnect_attempts,
            exponential: config.exponential_backoff,
        }
    }
}

/// The connection state machine plus the subscription set it owns.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    reconnect_attempts: u32,
    operator_closed: bool,
    subscriptions: BTreeSet<String>,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            operator_closed: false,
            subscriptions: BTreeSet::new(),
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Whether the last close was requested by the operator.
    pub fn operator_closed(&self) -> bool {
        self.operator_closed
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &String> {
        self.subscriptions.iter()
    }

    pub fn is_subscribed(&self, task_id: &str) -> bool {
        self.subscriptions.contains(task_id)
    }

    /// Add a task id. Returns `false` if it was already present.
    pub fn add_subscription(&mut self, task_id: &str) -> bool {
        self.subscriptions.insert(task_id.to_string())
    }

    /// Remove a task id. Returns `false` if it was not present.
    pub fn remove_subscription(&mut self, task_id: &str) -> bool {
        self.subscriptions.remove(task_id)
    }

    /// Apply one input.
    ///
    /// # Errors
    /// - `InProgress` for `Connect` while `Connecting`/`Reconnecting`
    /// - `Destroyed` for anything but `Destroy` once `Closed`
    /// - `Invalid` for inputs that do not apply to the current state (stale
    ///   transport events); the machine is left unchanged
    pub fn handle(&mut self, input: Input) -> Result<Vec<Effect>, TransitionError> {
        use ConnectionState::*;

        if self.state == Closed && input != Input::Destroy {
            return Err(TransitionError::Destroyed);
        }

        match (self.state, input) {
            (Disconnected, Input::Connect) => {
                self.operator_closed = false;
                self.reconnect_attempts = 0;
                let mut effects = self.transition(Connecting);
                effects.push(Effect::OpenTransport);
                Ok(effects)
            }
            (Open, Input::Connect) => Ok(Vec::new()),
            (Connecting | Reconnecting, Input::Connect) => {
                Err(TransitionError::InProgress(self.state))
            }

            (Connecting, Input::Opened) => {
                self.reconnect_attempts = 0;
                let mut effects = self.transition(Open);
                effects.push(Effect::StartHeartbeat);
                if !self.subscriptions.is_empty() {
                    effects.push(Effect::Resubscribe(
                        self.subscriptions.iter().cloned().collect(),
                    ));
                }
                Ok(effects)
            }

            (Connecting, Input::OpenFailed | Input::Closed { .. }) => Ok(self.schedule_reconnect()),

            (Open, Input::Closed { clean: true }) => {
                let mut effects = vec![Effect::StopHeartbeat, Effect::CancelResubscribe];
                effects.extend(self.transition(Disconnected));
                Ok(effects)
            }
            (Open, Input::Closed { clean: false }) => {
                let mut effects = vec![Effect::StopHeartbeat, Effect::CancelResubscribe];
                effects.extend(self.schedule_reconnect());
                Ok(effects)
            }
            (Open, Input::LivenessExpired) => {
                let mut effects = vec![
                    Effect::StopHeartbeat,
                    Effect::CancelResubscribe,
                    Effect::CloseTransport,
                ];
                effects.extend(self.schedule_reconnect());
                Ok(effects)
            }

            (Reconnecting, Input::ReconnectTimerFired) => {
                let mut effects = self.transition(Connecting);
                effects.push(Effect::OpenTransport);
                Ok(effects)
            }

            (_, Input::Disconnect) => Ok(self.shut_down(Disconnected)),
            (_, Input::Destroy) => Ok(self.shut_down(Closed)),

            (state, input) => Err(TransitionError::Invalid { state, input }),
        }
    }

    /// Enter `Reconnecting`, or settle in `Disconnected` once attempts run out.
    fn schedule_reconnect(&mut self) -> Vec<Effect> {
        if self.operator_closed {
            return self.transition(ConnectionState::Disconnected);
        }

        if self.reconnect_attempts >= self.policy.max_attempts {
            let attempts = self.reconnect_attempts;
            let mut effects = self.transition(ConnectionState::Disconnected);
            effects.push(Effect::ConnectionLost { attempts });
            self.reconnect_attempts = 0;
            return effects;
        }

        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;
        let mut effects = self.transition(ConnectionState::Reconnecting);
        effects.push(Effect::ScheduleReconnect {
            attempt,
            delay: self.policy.delay_for(attempt),
        });
        effects
    }

    fn shut_down(&mut self, target: ConnectionState) -> Vec<Effect> {
        self.operator_closed = true;
        self.reconnect_attempts = 0;
        self.subscriptions.clear();

        let mut effects = vec![
            Effect::StopHeartbeat,
            Effect::CancelReconnect,
            Effect::CancelResubscribe,
            Effect::CloseTransport,
        ];
        effects.extend(self.transition(target));
        effects
    }

    fn transition(&mut self, to: ConnectionState) -> Vec<Effect> {
        let from = self.state;
        if from == to {
            return Vec::new();
        }
        self.state = to;
        tracing::debug!(from = %from, to = %to, "Connection state transition");
        vec![Effect::StateChanged { from, to }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn machine(max_attempts: u32) -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy {
            interval: Duration::from_millis(5000),
            max_attempts,
            exponential: false,
        })
    }

    fn open(m: &mut ConnectionMachine) {
        m.handle(Input::Connect).unwrap();
        m.handle(Input::Opened).unwrap();
        assert_eq!(m.state(), Open);
    }

    #[test]
    fn test_connect_then_open_starts_heartbeat() {
        let mut m = machine(3);
        let effects = m.handle(Input::Connect).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::StateChanged {
                    from: Disconnected,
                    to: Connecting
                },
                Effect::OpenTransport
            ]
        );
        let effects = m.handle(Input::Opened).unwrap();
        assert!(effects.contains(&Effect::StartHeartbeat));
        assert_eq!(m.state(), Open);
    }

    #[test]
    fn test_connect_while_open_is_noop() {
        let mut m = machine(3);
        open(&mut m);
        assert_eq!(m.handle(Input::Connect).unwrap(), Vec::new());
        assert_eq!(m.state(), Open);
    }

    #[test]
    fn test_connect_while_in_flight_fails() {
        let mut m = machine(3);
        m.handle(Input::Connect).unwrap();
        assert_eq!(
            m.handle(Input::Connect),
            Err(TransitionError::InProgress(Connecting))
        );

        let mut m = machine(3);
        open(&mut m);
        m.handle(Input::Closed { clean: false }).unwrap();
        assert_eq!(m.state(), Reconnecting);
        assert_eq!(
            m.handle(Input::Connect),
            Err(TransitionError::InProgress(Reconnecting))
        );
    }

    #[test]
    fn test_clean_close_does_not_reconnect() {
        let mut m = machine(3);
        open(&mut m);
        let effects = m.handle(Input::Closed { clean: true }).unwrap();
        assert_eq!(m.state(), Disconnected);
        assert!(effects.contains(&Effect::StopHeartbeat));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleReconnect { .. })));
    }

    #[test]
    fn test_unclean_close_schedules_reconnect() {
        let mut m = machine(3);
        open(&mut m);
        let effects = m.handle(Input::Closed { clean: false }).unwrap();
        assert_eq!(m.state(), Reconnecting);
        assert!(effects.contains(&Effect::ScheduleReconnect {
            attempt: 1,
            delay: Duration::from_millis(5000)
        }));

        let effects = m.handle(Input::ReconnectTimerFired).unwrap();
        assert_eq!(m.state(), Connecting);
        assert!(effects.contains(&Effect::OpenTransport));
    }

    #[test]
    fn test_reconnect_gives_up_after_max_attempts() {
        let mut m = machine(3);
        open(&mut m);
        m.handle(Input::Closed { clean: false }).unwrap();

        for expected_attempt in 2..=3 {
            m.handle(Input::ReconnectTimerFired).unwrap();
            let effects = m.handle(Input::OpenFailed).unwrap();
            assert!(effects.iter().any(|e| matches!(
                e,
                Effect::ScheduleReconnect { attempt, .. } if *attempt == expected_attempt
            )));
        }

        m.handle(Input::ReconnectTimerFired).unwrap();
        let effects = m.handle(Input::OpenFailed).unwrap();
        assert_eq!(m.state(), Disconnected);
        assert!(effects.contains(&Effect::ConnectionLost { attempts: 3 }));

        // Settled: stale timer or transport events do nothing.
        assert!(m.handle(Input::ReconnectTimerFired).is_err());
        assert!(m.handle(Input::Closed { clean: false }).is_err());
        assert_eq!(m.state(), Disconnected);
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut m = machine(3);
        open(&mut m);
        m.handle(Input::Closed { clean: false }).unwrap();
        m.handle(Input::ReconnectTimerFired).unwrap();
        assert_eq!(m.reconnect_attempts(), 1);
        m.handle(Input::Opened).unwrap();
        assert_eq!(m.reconnect_attempts(), 0);
    }

    #[test]
    fn test_open_resubscribes_every_subscription() {
        let mut m = machine(3);
        for id in ["C", "A", "B"] {
            m.add_subscription(id);
        }
        m.handle(Input::Connect).unwrap();
        let effects = m.handle(Input::Opened).unwrap();
        assert!(effects.contains(&Effect::Resubscribe(vec![
            "A".to_string(),
            "B".to_string(),
            "C".to_string()
        ])));
    }

    #[test]
    fn test_disconnect_clears_subscriptions_and_timers() {
        let mut m = machine(3);
        m.add_subscription("A");
        open(&mut m);
        m.handle(Input::Closed { clean: false }).unwrap();

        let effects = m.handle(Input::Disconnect).unwrap();
        assert_eq!(m.state(), Disconnected);
        assert!(m.operator_closed());
        assert_eq!(m.subscriptions().count(), 0);
        for effect in [
            Effect::StopHeartbeat,
            Effect::CancelReconnect,
            Effect::CloseTransport,
        ] {
            assert!(effects.contains(&effect));
        }
    }

    #[test]
    fn test_close_after_disconnect_during_connect_does_not_reconnect() {
        let mut m = machine(3);
        m.handle(Input::Connect).unwrap();
        m.handle(Input::Disconnect).unwrap();
        assert!(m.handle(Input::OpenFailed).is_err());
        assert_eq!(m.state(), Disconnected);
    }

    #[test]
    fn test_liveness_expiry_is_an_unclean_close() {
        let mut m = machine(3);
        open(&mut m);
        let effects = m.handle(Input::LivenessExpired).unwrap();
        assert!(effects.contains(&Effect::CloseTransport));
        assert_eq!(m.state(), Reconnecting);
    }

    #[test]
    fn test_destroy_is_terminal() {
        let mut m = machine(3);
        open(&mut m);
        m.handle(Input::Destroy).unwrap();
        assert_eq!(m.state(), Closed);
        assert_eq!(m.handle(Input::Connect), Err(TransitionError::Destroyed));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = ReconnectPolicy {
            interval: Duration::from_secs(1),
            max_attempts: 20,
            exponential: true,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(15), Duration::from_secs(60));
    }
}
