//! Error types and call end reasons for the call-control engine
//!
//! Sub-protocol handlers never unwind a call through these errors: a handler
//! that detects a fatal condition moves the call to `Clear` with a
//! [`CallEndReason`] and then returns an error the caller may log. The
//! runtime is the only place that releases a call.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rvoip_h323_proto::q931::{Q931Cause, ReleaseCompleteReason};
use rvoip_h323_proto::{ChannelNumber, CodecError, MediaKind};

/// Result type for call-control operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors raised by the call-control engine
#[derive(Debug, Error)]
pub enum CallError {
    /// Encoding or decoding a message failed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport level failure in the runtime
    #[error("Transport error: {0}")]
    Transport(#[from] rvoip_h323_transport::Error),

    /// Invalid endpoint configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A message arrived that the current state cannot accept
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    /// A logical channel could not be opened before master-slave determination finished
    #[error("Master-slave determination not resolved")]
    MasterSlaveUnresolved,

    /// No joint capability for the requested media kind
    #[error("No common {kind} capability for a transmit channel")]
    NoCommonCapability { kind: MediaKind },

    /// The referenced logical channel does not exist
    #[error("Logical channel {number} not found")]
    ChannelNotFound { number: ChannelNumber },

    /// The media engine refused or is missing for a channel start
    #[error("Media error: {message}")]
    Media { message: String },

    /// The call was cleared while handling the event
    #[error("Call cleared: {reason}")]
    CallCleared { reason: CallEndReason },

    /// No call with the given token
    #[error("Call not found: {token}")]
    CallNotFound { token: String },

    /// The operation is not valid in the current call state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl CallError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn media(message: impl Into<String>) -> Self {
        Self::Media { message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallEndReason {
    Unknown,
    RemoteCleared,
    LocalCleared,
    InvalidMessage,
    TransportFailure,
    NoBandwidth,
    RemoteBusy,
    RemoteNoAnswer,
    RemoteRejected,
    RemoteForwarded,
    RemoteCongested,
    NoCommonCapabilities,
    NoRoute,
    NoUser,
    GatekeeperNoCalledUser,
    GatekeeperNoCallerUser,
    GatekeeperUnreachable,
    GatekeeperNoResources,
    GatekeeperCleared,
    LocalBusy,
    LocalRejected,
    LocalCongested,
    LocalNoAnswer,
}

impl CallEndReason {
    /// Q.931 cause and H.225.0 ReleaseComplete reason sent for this end reason
    pub fn to_release_cause(self) -> (Q931Cause, ReleaseCompleteReason) {
        use CallEndReason::*;
        use ReleaseCompleteReason as R;

        match self {
            InvalidMessage | TransportFailure => {
                (Q931Cause::ProtocolErrorUnspecified, R::UndefinedReason)
            }
            NoBandwidth => (Q931Cause::ErrorInCauseIe, R::NoBandwidth),
            GatekeeperNoCalledUser => (Q931Cause::SubscriberAbsent, R::CalledPartyNotRegistered),
            GatekeeperNoCallerUser => (Q931Cause::SubscriberAbsent, R::CallerNotRegistered),
            GatekeeperUnreachable => (Q931Cause::TemporaryFailure, R::UnreachableGatekeeper),
            GatekeeperNoResources | GatekeeperCleared => {
                (Q931Cause::Congestion, R::GatekeeperResources)
            }
            NoCommonCapabilities => (Q931Cause::IncompatibleDestination, R::UndefinedReason),
            RemoteForwarded => (Q931Cause::Redirection, R::FacilityCallDeflection),
            RemoteCleared | LocalCleared => (Q931Cause::NormalCallClearing, R::UndefinedReason),
            RemoteBusy | LocalBusy => (Q931Cause::UserBusy, R::InConf),
            RemoteNoAnswer | LocalNoAnswer => (Q931Cause::NoAnswer, R::UndefinedReason),
            RemoteRejected | LocalRejected => (Q931Cause::CallRejected, R::DestinationRejection),
            RemoteCongested | LocalCongested => (Q931Cause::Congestion, R::NoBandwidth),
            NoRoute => (Q931Cause::NoRouteToDestination, R::UnreachableDestination),
            NoUser => (Q931Cause::SubscriberAbsent, R::UndefinedReason),
            Unknown => (Q931Cause::NormalUnspecified, R::UndefinedReason),
        }
    }

    /// End reason for a received ReleaseComplete
    ///
    /// The Q.931 cause wins when it maps to a known reason; otherwise the
    /// H.225.0 reason is consulted.
    pub fn from_release(cause: Option<Q931Cause>, reason: Option<ReleaseCompleteReason>) -> Self {
        use Q931Cause::*;

        let by_cause = match cause {
            Some(NormalCallClearing) => Some(Self::RemoteCleared),
            Some(UserBusy) => Some(Self::RemoteBusy),
            Some(NoResponse) | Some(NoAnswer) => Some(Self::RemoteNoAnswer),
            Some(CallRejected) => Some(Self::RemoteRejected),
            Some(Redirection) => Some(Self::RemoteForwarded),
            Some(NetworkOutOfOrder) | Some(TemporaryFailure) => Some(Self::TransportFailure),
            Some(NoCircuitChannelAvailable)
            | Some(Congestion)
            | Some(RequestedCircuitUnavailable)
            | Some(ResourcesUnavailable) => Some(Self::RemoteCongested),
            Some(NoRouteToDestination) | Some(NoRouteToNetwork) => Some(Self::NoRoute),
            Some(NumberChanged) | Some(UnallocatedNumber) | Some(SubscriberAbsent) => {
                Some(Self::NoUser)
            }
            _ => None,
        };
        if let Some(reason) = by_cause {
            return reason;
        }

        use ReleaseCompleteReason as R;
        match reason {
            Some(R::NoBandwidth) => Self::NoBandwidth,
            Some(R::GatekeeperResources) | Some(R::GatewayResources) => Self::GatekeeperNoResources,
            Some(R::UnreachableDestination) => Self::NoRoute,
            Some(R::DestinationRejection) => Self::RemoteRejected,
            Some(R::InConf) => Self::RemoteBusy,
            Some(R::FacilityCallDeflection) => Self::RemoteForwarded,
            Some(R::CalledPartyNotRegistered) => Self::GatekeeperNoCalledUser,
            Some(R::CallerNotRegistered) => Self::GatekeeperNoCallerUser,
            Some(R::UnreachableGatekeeper) => Self::GatekeeperUnreachable,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        use CallEndReason::*;
        match self {
            Unknown => "UNKNOWN",
            RemoteCleared => "REMOTE_CLEARED",
            LocalCleared => "LOCAL_CLEARED",
            InvalidMessage => "INVALIDMESSAGE",
            TransportFailure => "TRANSPORTFAILURE",
            NoBandwidth => "NOBW",
            RemoteBusy => "REMOTE_BUSY",
            RemoteNoAnswer => "REMOTE_NOANSWER",
            RemoteRejected => "REMOTE_REJECTED",
            RemoteForwarded => "REMOTE_FWDED",
            RemoteCongested => "REMOTE_CONGESTED",
            NoCommonCapabilities => "NOCOMMON_CAPABILITIES",
            NoRoute => "NOROUTE",
            NoUser => "NOUSER",
            GatekeeperNoCalledUser => "GK_NOCALLEDUSER",
            GatekeeperNoCallerUser => "GK_NOCALLERUSER",
            GatekeeperUnreachable => "GK_UNREACHABLE",
            GatekeeperNoResources => "GK_NORESOURCES",
            GatekeeperCleared => "GK_CLEARED",
            LocalBusy => "LOCAL_BUSY",
            LocalRejected => "LOCAL_REJECTED",
            LocalCongested => "LOCAL_CONGESTED",
            LocalNoAnswer => "LOCAL_NOANSWER",
        }
    }
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_cause_for_local_clear() {
        let (cause, reason) = CallEndReason::LocalCleared.to_release_cause();
        assert_eq!(cause, Q931Cause::NormalCallClearing);
        assert_eq!(reason, ReleaseCompleteReason::UndefinedReason);

        let (cause, reason) = CallEndReason::NoCommonCapabilities.to_release_cause();
        assert_eq!(cause, Q931Cause::IncompatibleDestination);
        assert_eq!(reason, ReleaseCompleteReason::UndefinedReason);

        let (cause, reason) = CallEndReason::RemoteForwarded.to_release_cause();
        assert_eq!(cause, Q931Cause::Redirection);
        assert_eq!(reason, ReleaseCompleteReason::FacilityCallDeflection);
    }

    #[test]
    fn test_cause_takes_precedence_over_reason() {
        let reason = CallEndReason::from_release(
            Some(Q931Cause::UserBusy),
            Some(ReleaseCompleteReason::DestinationRejection),
        );
        assert_eq!(reason, CallEndReason::RemoteBusy);
    }

    #[test]
    fn test_reason_used_when_cause_unmapped() {
        let reason = CallEndReason::from_release(
            Some(Q931Cause::ProtocolErrorUnspecified),
            Some(ReleaseCompleteReason::UnreachableGatekeeper),
        );
        assert_eq!(reason, CallEndReason::GatekeeperUnreachable);

        assert_eq!(CallEndReason::from_release(None, None), CallEndReason::Unknown);
        assert_eq!(
            CallEndReason::from_release(Some(Q931Cause::SubscriberAbsent), None),
            CallEndReason::NoUser
        );
    }

    #[test]
    fn test_display_names() {
        assert_eq!(CallEndReason::LocalCleared.to_string(), "LOCAL_CLEARED");
        assert_eq!(CallEndReason::RemoteForwarded.to_string(), "REMOTE_FWDED");
    }
}
