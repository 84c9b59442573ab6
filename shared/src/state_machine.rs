//! Link State Machine
//!
//! Defines the per-device connection lifecycle:
//! `Idle -> Connecting -> Connected -> (Monitoring) -> Disconnected/Idle`.

use std::fmt;

/// Connection lifecycle state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// No channel and no attempt in progress
    #[default]
    Idle,
    /// A connect attempt is running
    Connecting,
    /// A channel is installed
    Connected,
    /// A channel is installed and a keep-alive monitor is probing it
    Monitoring,
    /// The last channel failed or the last attempt failed
    Disconnected,
}

impl LinkState {
    /// Stable name used on the control socket
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "IDLE",
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
            LinkState::Monitoring => "MONITORING",
            LinkState::Disconnected => "DISCONNECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(LinkState::Idle),
            "CONNECTING" => Some(LinkState::Connecting),
            "CONNECTED" => Some(LinkState::Connected),
            "MONITORING" => Some(LinkState::Monitoring),
            "DISCONNECTED" => Some(LinkState::Disconnected),
            _ => None,
        }
    }

    /// Whether a channel is expected to exist in this state
    pub fn has_channel(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Monitoring)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive link state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connect attempt acquired the device
    ConnectRequested,
    /// The transport opened a channel
    ChannelOpened,
    /// The transport failed to open a channel
    ConnectFailed,
    /// A keep-alive monitor was started
    MonitorStarted,
    /// The keep-alive monitor was stopped without a failure
    MonitorStopped,
    /// A probe or write detected that the peer is gone
    LinkLost,
    /// The channel was closed on request (disconnect or teardown)
    Closed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Changed(LinkState),
    /// Transition was valid and the state is the same
    Unchanged(LinkState),
    /// Transition was invalid from current state
    Invalid { from: LinkState, event: LinkEvent },
}

/// The lifecycle state machine for a single device
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: LinkState,
}

impl LinkStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> LinkState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        match next_state(self.current_state, event) {
            Some(state) if state == self.current_state => TransitionResult::Unchanged(state),
            Some(state) => {
                self.current_state = state;
                TransitionResult::Changed(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}

/// Get the next state for a given event, if the transition is valid
pub fn next_state(from: LinkState, event: LinkEvent) -> Option<LinkState> {
    use LinkEvent::*;
    use LinkState::*;

    match (from, event) {
        // Closing is always allowed and always ends idle
        (_, Closed) => Some(Idle),

        // Connect replaces whatever exists; a second attempt may queue behind the first
        (_, ConnectRequested) => Some(Connecting),

        (Connecting, ChannelOpened) => Some(Connected),
        (Connecting, ConnectFailed) => Some(Disconnected),

        (Connected | Monitoring, MonitorStarted) => Some(Monitoring),
        (Monitoring, MonitorStopped) => Some(Connected),
        (Connected, MonitorStopped) => Some(Connected),

        (Connected | Monitoring, LinkLost) => Some(Disconnected),
        (Disconnected, LinkLost) => Some(Disconnected),

        // Invalid transition
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(fsm.state(), LinkState::Idle);
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut fsm = LinkStateMachine::new();

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(result, TransitionResult::Changed(LinkState::Connecting));

        let result = fsm.process_event(LinkEvent::ChannelOpened);
        assert_eq!(result, TransitionResult::Changed(LinkState::Connected));

        let result = fsm.process_event(LinkEvent::MonitorStarted);
        assert_eq!(result, TransitionResult::Changed(LinkState::Monitoring));

        let result = fsm.process_event(LinkEvent::LinkLost);
        assert_eq!(result, TransitionResult::Changed(LinkState::Disconnected));

        // Recovery starts over from a fresh attempt
        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(result, TransitionResult::Changed(LinkState::Connecting));
    }

    #[test]
    fn test_connect_failure() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);

        let result = fsm.process_event(LinkEvent::ConnectFailed);
        assert_eq!(result, TransitionResult::Changed(LinkState::Disconnected));
        assert!(!fsm.state().has_channel());
    }

    #[test]
    fn test_reconnect_from_connected() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::ChannelOpened);

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(result, TransitionResult::Changed(LinkState::Connecting));
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = LinkStateMachine::new();

        // Can't monitor without a channel
        let result = fsm.process_event(LinkEvent::MonitorStarted);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), LinkState::Idle);

        let result = fsm.process_event(LinkEvent::ChannelOpened);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }

    #[test]
    fn test_closed_from_any_state() {
        for state in [
            LinkState::Idle,
            LinkState::Connecting,
            LinkState::Connected,
            LinkState::Monitoring,
            LinkState::Disconnected,
        ] {
            assert_eq!(next_state(state, LinkEvent::Closed), Some(LinkState::Idle));
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(LinkState::parse("MONITORING"), Some(LinkState::Monitoring));
        assert_eq!(LinkState::Connected.to_string(), "CONNECTED");
        assert_eq!(LinkState::parse("connected"), None);
    }
}
