//! H.245 transport selection
//!
//! H.245 either rides inside Q.931 messages (tunneling) or uses its own TCP
//! connection. While tunneling, encoded H.245 messages wait in a per-call
//! queue and are attached to the next outgoing Q.931 message; whatever is
//! still queued at the end of a step goes out in a Facility. Without
//! tunneling, messages are handed to the runtime for the separate
//! connection, or held until that connection is up.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use rvoip_h323_proto::q931::{FacilityReason, FacilityUuie};
use rvoip_h323_proto::{
    H245Message, H323MessageBody, H323UserInformation, Q931Message, Q931MessageType,
    TransportAddress,
};

use crate::call::{CallAction, CallRecord, CallState, H245Link, H245SessionState, LocalTcsState};
use crate::errors::{CallEndReason, CallError, CallResult};

impl CallRecord {
    /// Queue an H.245 message on whichever transport the call uses
    pub(crate) fn send_h245(&mut self, message: H245Message) -> CallResult<()> {
        if self.state >= CallState::ClearReleaseSent {
            debug!(call = %self.token, "Dropping {} after ReleaseComplete", message.name());
            return Ok(());
        }
        if self.h245_session == H245SessionState::Idle {
            self.h245_session = H245SessionState::Active;
        }

        if self.flags.tunneling {
            let encoded = match self.codec().encode_h245(&message) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(call = %self.token, "Failed to encode {}: {}", message.name(), e);
                    self.clear_call(CallEndReason::InvalidMessage);
                    return Err(e.into());
                }
            };
            debug!(call = %self.token, "Tunneling {}", message.name());
            self.tunneled.push(encoded);
            if message.is_end_session() {
                self.flush_tunneled();
            }
            return Ok(());
        }

        match self.h245_link {
            H245Link::Connected => {
                debug!(call = %self.token, "Sending {} on H.245 connection", message.name());
                self.actions.push(CallAction::SendH245(message));
            }
            H245Link::None | H245Link::Connecting => {
                debug!(
                    call = %self.token,
                    "Holding {} until the H.245 connection is up", message.name()
                );
                self.h245_backlog.push(message);
                self.ensure_h245_connection();
            }
            H245Link::Closed => {
                warn!(call = %self.token, "Dropping {}: H.245 connection closed", message.name());
            }
        }
        Ok(())
    }

    /// Queue a Q.931 message, attaching any tunneled H.245
    pub(crate) fn send_q931(&mut self, mut message: Q931Message) {
        if let Some(info) = message.user_info.as_mut() {
            info.h245_tunneling = Some(self.flags.tunneling);
            if self.flags.tunneling && !self.tunneled.is_empty() {
                info.h245_control.append(&mut self.tunneled);
            }
        }
        debug!(call = %self.token, "Sending {}", message.message_type);
        self.actions.push(CallAction::SendQ931(message));
    }

    /// Send leftover tunneled H.245 in a Facility
    pub(crate) fn flush_tunneled(&mut self) {
        if self.tunneled.is_empty() || !self.flags.signaling_started || self.flags.release_sent {
            return;
        }
        debug!(
            call = %self.token,
            "Flushing {} tunneled H.245 message(s) in Facility", self.tunneled.len()
        );
        let mut uuie = FacilityUuie::new(FacilityReason::TransportedInformation);
        uuie.call_identifier = Some(self.identity.call_identifier);
        let message = self
            .q931(Q931MessageType::Facility)
            .with_user_info(H323UserInformation::new(H323MessageBody::Facility(uuie)));
        self.send_q931(message);
    }

    /// A Q.931 message of `message_type` with our call reference and flag
    pub(crate) fn q931(&self, message_type: Q931MessageType) -> Q931Message {
        Q931Message::new(message_type, self.identity.call_reference, self.direction.is_incoming())
    }

    /// Follow the remote's tunneling flag and H.245 address
    ///
    /// An explicit `true` keeps tunneling on, `false` turns it off; an
    /// absent flag turns it off only in SETUP and CONNECT. An H.245 address
    /// without tunneling switches the call to a separate connection.
    pub(crate) fn apply_tunneling_policy(
        &mut self,
        message_type: Q931MessageType,
        info: &H323UserInformation,
    ) {
        let was_tunneling = self.flags.tunneling;
        match info.h245_tunneling {
            Some(true) => {}
            Some(false) => self.flags.tunneling = false,
            None => {
                if matches!(message_type, Q931MessageType::Setup | Q931MessageType::Connect) {
                    self.flags.tunneling = false;
                }
            }
        }

        if let Some(address) = info.h245_address() {
            if info.h245_tunneling == Some(true) && self.flags.tunneling {
                debug!(call = %self.token, "Ignoring H.245 address while tunneling");
            } else {
                self.flags.tunneling = false;
                self.record_remote_h245_address(address);
            }
        }

        if was_tunneling && !self.flags.tunneling {
            info!(call = %self.token, "H.245 tunneling disabled by {}", message_type);
            if !self.tunneled.is_empty() {
                debug!(
                    call = %self.token,
                    "Discarding {} queued tunneled message(s)", self.tunneled.len()
                );
                self.tunneled.clear();
            }
        }
    }

    pub(crate) fn record_remote_h245_address(&mut self, address: TransportAddress) -> bool {
        match address.unicast() {
            Some(addr) if addr.port() != 0 => {
                self.remote_h245_addr = Some(addr);
                true
            }
            _ => {
                warn!(call = %self.token, "Ignoring unusable H.245 address {:?}", address);
                false
            }
        }
    }

    /// Ask the runtime to connect H.245 when an address is known
    pub(crate) fn ensure_h245_connection(&mut self) {
        if self.flags.tunneling || self.h245_link != H245Link::None || self.state.is_clearing() {
            return;
        }
        if let Some(addr) = self.remote_h245_addr {
            info!(call = %self.token, "Connecting H.245 to {}", addr);
            self.h245_link = H245Link::Connecting;
            self.actions.push(CallAction::ConnectH245(addr));
        }
    }

    /// Decode and dispatch H.245 carried in a Q.931 message
    pub(crate) fn process_tunneled(&mut self, info: &H323UserInformation) -> CallResult<()> {
        for data in &info.h245_control {
            if self.state == CallState::Cleared {
                break;
            }
            let message = match self.codec().decode_h245(data) {
                Ok(message) => message,
                Err(e) => {
                    warn!(call = %self.token, "Skipping undecodable tunneled H.245: {}", e);
                    continue;
                }
            };
            debug!(call = %self.token, "Received tunneled {}", message.name());
            if let Err(e) = self.dispatch_h245(message) {
                debug!(call = %self.token, "Tunneled H.245 handling failed: {}", e);
            }
        }
        Ok(())
    }

    pub(crate) fn close_h245(&mut self) {
        if matches!(self.h245_link, H245Link::Connected | H245Link::Connecting) {
            debug!(call = %self.token, "Closing H.245 connection");
            self.actions.push(CallAction::CloseH245);
            self.h245_link = H245Link::Closed;
        }
        self.h245_session = H245SessionState::Closed;
    }

    // =====================================================================
    // Separate H.245 connection events
    // =====================================================================

    /// The separate H.245 connection came up
    pub fn on_h245_connected(&mut self, remote: SocketAddr) -> CallResult<()> {
        self.step(|call| {
            if call.state == CallState::Cleared {
                return Ok(());
            }
            info!(call = %call.token, "H.245 connection established with {}", remote);
            call.h245_link = H245Link::Connected;
            call.h245_session = H245SessionState::Active;
            for message in std::mem::take(&mut call.h245_backlog) {
                call.actions.push(CallAction::SendH245(message));
            }
            if call.state.is_clearing() {
                return Ok(());
            }
            if call.tcs.local == LocalTcsState::Idle {
                call.send_capability_set()?;
            }
            call.begin_msd()
        })
    }

    pub fn on_h245_connect_failed(&mut self, error: &CallError) -> CallResult<()> {
        self.step(|call| {
            warn!(call = %call.token, "H.245 connection failed: {}", error);
            call.h245_link = H245Link::Closed;
            call.h245_backlog.clear();
            call.clear_call(CallEndReason::TransportFailure);
            Ok(())
        })
    }

    pub fn on_h245_closed(&mut self) -> CallResult<()> {
        self.step(|call| {
            if call.h245_link == H245Link::Closed {
                return Ok(());
            }
            info!(call = %call.token, "H.245 connection closed");
            call.h245_link = H245Link::Closed;
            call.h245_session = H245SessionState::Closed;
            match call.state {
                CallState::ClearReleaseSent => call.mark_cleared(),
                state if state < CallState::Clear => {
                    call.clear_call(CallEndReason::TransportFailure)
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// The call signaling connection went away
    pub fn on_signaling_closed(&mut self) -> CallResult<()> {
        self.step(|call| {
            if call.state != CallState::Cleared {
                info!(call = %call.token, "Call signaling connection closed");
                if call.end_reason.is_none() {
                    call.end_reason = Some(CallEndReason::TransportFailure);
                }
                call.flags.release_sent = true;
                call.mark_cleared();
            }
            Ok(())
        })
    }
}
