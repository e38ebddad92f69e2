//! Named states of a call and of its H.245 sub-protocols

use std::fmt;

use serde::{Deserialize, Serialize};

/// Overall call state
///
/// The declaration order is the transition order: a call only ever moves to
/// a greater state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CallState {
    Created,
    WaitingAdmission,
    Connecting,
    Connected,
    /// Clearing has been decided; ReleaseComplete not sent yet
    Clear,
    ClearReleaseSent,
    Cleared,
}

impl CallState {
    /// True once clearing has been decided
    pub fn is_clearing(self) -> bool {
        self >= CallState::Clear
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Created => "Created",
            CallState::WaitingAdmission => "WaitingAdmission",
            CallState::Connecting => "Connecting",
            CallState::Connected => "Connected",
            CallState::Clear => "Clear",
            CallState::ClearReleaseSent => "ClearReleaseSent",
            CallState::Cleared => "Cleared",
        };
        f.write_str(name)
    }
}

/// Which side originated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl CallDirection {
    /// Incoming calls set the Q.931 call reference flag
    pub fn is_incoming(self) -> bool {
        self == CallDirection::Incoming
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Outgoing => write!(f, "outgoing"),
            CallDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// H.245 session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum H245SessionState {
    Idle,
    Active,
    /// We sent EndSessionCommand and wait for the remote one
    EndSent,
    /// The remote sent EndSessionCommand
    EndRecvd,
    Closed,
}

/// Separate H.245 connection, when not tunneling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H245Link {
    None,
    Connecting,
    Connected,
    Closed,
}

/// Master-slave determination state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsdState {
    Idle,
    DetermineSent,
    Master,
    Slave,
}

impl MsdState {
    pub fn is_resolved(self) -> bool {
        matches!(self, MsdState::Master | MsdState::Slave)
    }
}

impl fmt::Display for MsdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsdState::Idle => "Idle",
            MsdState::DetermineSent => "DetermineSent",
            MsdState::Master => "Master",
            MsdState::Slave => "Slave",
        };
        f.write_str(name)
    }
}

/// State of our TerminalCapabilitySet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalTcsState {
    Idle,
    Sent,
    AckRecvd,
}

/// State of the remote TerminalCapabilitySet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteTcsState {
    Idle,
    Recvd,
    AckSent,
}

/// Media session the call currently runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    Audio,
    /// T.38 fax data session
    Data,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_state_order() {
        assert!(CallState::Created < CallState::WaitingAdmission);
        assert!(CallState::Connected < CallState::Clear);
        assert!(CallState::ClearReleaseSent < CallState::Cleared);
        assert!(CallState::Clear.is_clearing());
        assert!(!CallState::Connected.is_clearing());
    }

    #[test]
    fn test_msd_resolution() {
        assert!(MsdState::Master.is_resolved());
        assert!(MsdState::Slave.is_resolved());
        assert!(!MsdState::DetermineSent.is_resolved());
    }
}
