//! Application hooks
//!
//! The engine reports call progress and asks the media engine to start or
//! stop RTP through [`CallEventHandler`]. All methods run synchronously
//! inside a state-machine step while the call is locked, so they must return
//! promptly. Every method has a default, so an application implements only
//! the hooks it cares about; a call without any handler is allowed too.
//!
//! Admission of incoming calls is the one decision the runtime waits for,
//! which is why [`AdmissionControl`] is async.

use std::net::SocketAddr;

use async_trait::async_trait;

use rvoip_h323_proto::q931::AliasAddress;
use rvoip_h323_proto::{MediaKind, TransportAddress};

use crate::call::{CallRecord, CallToken, LogicalChannel};
use crate::call::state::CallDirection;
use crate::errors::{CallEndReason, CallResult};

/// Where a forwarded call should be redirected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub address: Option<TransportAddress>,
    pub aliases: Vec<AliasAddress>,
}

/// Synchronous callbacks into the application and media engine
pub trait CallEventHandler: Send + Sync {
    /// A SETUP was accepted; the application decides when to alert or answer
    fn on_incoming_call(&self, _call: &CallRecord) {}

    fn on_alerting(&self, _call: &CallRecord) {}

    fn on_progress(&self, _call: &CallRecord) {}

    /// CONNECT received on an outgoing call
    fn on_received_connect(&self, _call: &CallRecord) {}

    fn on_call_established(&self, _call: &CallRecord) {}

    /// Media switched between audio and T.38
    fn on_mode_changed(&self, _call: &CallRecord, _is_t38: bool) {}

    fn on_received_dtmf(&self, _call: &CallRecord, _digits: &str) {}

    /// Both negotiations finished; return the media kinds to open instead of
    /// the configured call mode, or `None` to keep the default policy
    fn open_logical_channels(&self, _call: &CallRecord) -> Option<Vec<MediaKind>> {
        None
    }

    fn start_receive_channel(
        &self,
        _call: &CallRecord,
        _channel: &LogicalChannel,
    ) -> CallResult<()> {
        Ok(())
    }

    fn start_transmit_channel(
        &self,
        _call: &CallRecord,
        _channel: &LogicalChannel,
    ) -> CallResult<()> {
        Ok(())
    }

    fn stop_receive_channel(&self, _call: &CallRecord, _channel: &LogicalChannel) {}

    fn stop_transmit_channel(&self, _call: &CallRecord, _channel: &LogicalChannel) {}

    fn on_call_forwarded(&self, _call: &CallRecord, _target: &ForwardTarget) {}

    /// The call reached `Cleared`; its record is about to be released
    fn on_call_cleared(&self, _call: &CallRecord) {}
}

/// Snapshot of an incoming call handed to admission control
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub token: CallToken,
    pub direction: CallDirection,
    pub remote_signal_addr: Option<SocketAddr>,
    pub caller_aliases: Vec<AliasAddress>,
    pub callee_aliases: Vec<AliasAddress>,
    pub calling_number: Option<String>,
    pub called_number: Option<String>,
}

/// Outcome of the admission step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject(CallEndReason),
}

/// External admission step consulted for every incoming SETUP
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    async fn admit(&self, call: CallSummary) -> AdmissionDecision;
}
