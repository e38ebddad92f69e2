//! H.245 message dispatch and the smaller control procedures
//!
//! Routes every decoded H.245 message, whether it arrived tunneled or on the
//! separate connection, to its sub-protocol handler. Also hosts the
//! procedures too small for a module of their own: session end, round-trip
//! delay, mode requests and DTMF relay.

use tracing::{debug, info, warn};

use rvoip_h323_proto::h245::{
    CommandMessage, EndSessionCommand, FlowControlCommand, IndicationMessage, ModeElement,
    RequestMessage, RequestMode, RequestModeAck, RequestModeReject, RequestModeRejectCause,
    RequestModeResponse, ResponseMessage, RoundTripDelay, UserInputIndication, UserInputSignal,
};
use rvoip_h323_proto::{H245Message, Q931Cause};

use crate::call::{
    CallRecord, CallState, ChannelDirection, H245SessionState, RemoteTcsState, SessionKind,
};
use crate::errors::{CallEndReason, CallError, CallResult};
use crate::timer::TimerClass;

/// Duration reported for DTMF signals we send, in milliseconds
const DTMF_SIGNAL_DURATION: u32 = 250;

impl CallRecord {
    pub(crate) fn dispatch_h245(&mut self, message: H245Message) -> CallResult<()> {
        if self.state == CallState::Cleared {
            debug!(call = %self.token, "Ignoring {} on cleared call", message.name());
            return Ok(());
        }
        if self.h245_session == H245SessionState::Idle {
            self.h245_session = H245SessionState::Active;
        }
        debug!(call = %self.token, "Handling {}", message.name());

        match message {
            H245Message::Request(request) => self.dispatch_request(request),
            H245Message::Response(response) => self.dispatch_response(response),
            H245Message::Command(command) => self.dispatch_command(command),
            H245Message::Indication(indication) => {
                self.dispatch_indication(indication);
                Ok(())
            }
        }
    }

    fn dispatch_request(&mut self, request: RequestMessage) -> CallResult<()> {
        match request {
            RequestMessage::MasterSlaveDetermination(msd) => self.on_msd_request(msd),
            RequestMessage::TerminalCapabilitySet(tcs) => self.on_remote_capability_set(tcs),
            RequestMessage::OpenLogicalChannel(olc) => {
                self.on_open_channel_request(olc)?;
                let negotiated =
                    self.msd.state.is_resolved() && self.tcs.remote == RemoteTcsState::AckSent;
                let transmitting = self.channels.has_direction(ChannelDirection::Transmit);
                if negotiated && !self.state.is_clearing() && !transmitting {
                    self.open_default_channels()?;
                }
                Ok(())
            }
            RequestMessage::CloseLogicalChannel(close) => self.on_close_channel_request(close),
            RequestMessage::RequestChannelClose(request) => self.on_request_channel_close(request),
            RequestMessage::RequestMode(mode) => self.on_request_mode(mode),
            RequestMessage::RoundTripDelayRequest(rtd) => {
                self.send_h245(H245Message::Response(ResponseMessage::RoundTripDelayResponse(rtd)))
            }
            RequestMessage::Unsupported(name) => {
                warn!(call = %self.token, "Unsupported H.245 request {}", name);
                Ok(())
            }
        }
    }

    fn dispatch_response(&mut self, response: ResponseMessage) -> CallResult<()> {
        match response {
            ResponseMessage::MasterSlaveDeterminationAck(ack) => self.on_msd_ack(ack),
            ResponseMessage::MasterSlaveDeterminationReject(reject) => self.on_msd_reject(reject),
            ResponseMessage::TerminalCapabilitySetAck(ack) => self.on_capability_set_ack(ack),
            ResponseMessage::TerminalCapabilitySetReject(reject) => {
                self.on_capability_set_reject(reject)
            }
            ResponseMessage::OpenLogicalChannelAck(ack) => self.on_open_channel_ack(ack),
            ResponseMessage::OpenLogicalChannelReject(reject) => {
                self.on_open_channel_reject(reject);
                Ok(())
            }
            ResponseMessage::CloseLogicalChannelAck(ack) => self.on_close_channel_ack(ack),
            ResponseMessage::RequestChannelCloseAck(ack) => {
                self.on_request_channel_close_ack(ack);
                Ok(())
            }
            ResponseMessage::RequestChannelCloseReject(reject) => {
                self.on_request_channel_close_reject(reject);
                Ok(())
            }
            ResponseMessage::RequestModeAck(ack) => {
                self.on_request_mode_ack(ack);
                Ok(())
            }
            ResponseMessage::RequestModeReject(reject) => {
                self.on_request_mode_reject(reject);
                Ok(())
            }
            ResponseMessage::RoundTripDelayResponse(rtd) => {
                self.on_round_trip_delay_response(rtd);
                Ok(())
            }
            ResponseMessage::Unsupported(name) => {
                warn!(call = %self.token, "Unsupported H.245 response {}", name);
                Ok(())
            }
        }
    }

    fn dispatch_command(&mut self, command: CommandMessage) -> CallResult<()> {
        match command {
            CommandMessage::EndSession(_) => self.on_end_session(),
            CommandMessage::SendTerminalCapabilitySet => {
                self.on_send_capability_set_command();
                Ok(())
            }
            CommandMessage::FlowControl(flow) => {
                self.on_flow_control(flow);
                Ok(())
            }
            CommandMessage::Unsupported(name) => {
                warn!(call = %self.token, "Unsupported H.245 command {}", name);
                Ok(())
            }
        }
    }

    fn dispatch_indication(&mut self, indication: IndicationMessage) {
        match indication {
            IndicationMessage::MasterSlaveDeterminationRelease => self.on_msd_release(),
            IndicationMessage::TerminalCapabilitySetRelease => self.on_capability_set_release(),
            IndicationMessage::OpenLogicalChannelConfirm(confirm) => {
                self.on_open_channel_confirm(confirm)
            }
            IndicationMessage::RequestChannelCloseRelease(release) => {
                self.on_request_channel_close_release(release)
            }
            IndicationMessage::RequestModeRelease => {
                debug!(call = %self.token, "RequestModeRelease received")
            }
            IndicationMessage::UserInput(input) => self.on_user_input(input),
            IndicationMessage::FunctionNotUnderstood => {
                warn!(call = %self.token, "Remote did not understand one of our H.245 messages")
            }
            IndicationMessage::Unsupported(name) => {
                warn!(call = %self.token, "Unsupported H.245 indication {}", name)
            }
        }
    }

    fn on_flow_control(&self, flow: FlowControlCommand) {
        info!(
            call = %self.token,
            scope = ?flow.scope,
            "FlowControlCommand: maximum bit rate {:?} (x100 bit/s)", flow.maximum_bit_rate
        );
    }

    // =====================================================================
    // Session end
    // =====================================================================

    pub(crate) fn send_end_session(&mut self) -> CallResult<()> {
        if self.flags.end_session_sent {
            return Ok(());
        }
        let awaiting_reply = self.h245_session == H245SessionState::Active;
        self.flags.end_session_sent = true;
        info!(call = %self.token, "Sending EndSessionCommand");
        let command = CommandMessage::EndSession(EndSessionCommand::Disconnect);
        self.send_h245(H245Message::Command(command))?;
        if awaiting_reply {
            self.h245_session = H245SessionState::EndSent;
            self.timers.arm(TimerClass::Session, None, self.ctx.config.timers.session());
        }
        Ok(())
    }

    fn on_end_session(&mut self) -> CallResult<()> {
        if self.flags.end_session_sent {
            info!(call = %self.token, "EndSessionCommand answered");
            self.timers.cancel_class(TimerClass::Session, None);
            self.close_h245();
            if self.state < CallState::Clear {
                self.clear_call(CallEndReason::RemoteCleared);
            } else if self.state == CallState::ClearReleaseSent {
                self.mark_cleared();
            }
            return Ok(());
        }

        info!(call = %self.token, "Remote ended the H.245 session");
        self.h245_session = H245SessionState::EndRecvd;
        self.clear_all_channels();
        let result = self.send_end_session();
        self.clear_call(CallEndReason::RemoteCleared);
        result
    }

    pub(crate) fn on_session_timeout(&mut self) -> CallResult<()> {
        warn!(call = %self.token, "No EndSessionCommand from remote");
        self.close_h245();
        if self.state == CallState::ClearReleaseSent {
            self.mark_cleared();
        }
        Ok(())
    }

    // =====================================================================
    // Round-trip delay
    // =====================================================================

    /// Measure the round trip; too many unanswered requests clear the call
    pub(crate) fn send_round_trip_delay_request(&mut self) -> CallResult<()> {
        let rtd = self.ctx.config.rtd;
        // Sequence numbers wrap at 255, so compare the distance
        if u32::from(self.rtd.send.wrapping_sub(self.rtd.recv)) > rtd.count {
            warn!(
                call = %self.token,
                sent = self.rtd.send,
                answered = self.rtd.recv,
                "Round-trip delay requests unanswered"
            );
            self.q931_cause = Some(Q931Cause::RecoveryOnTimerExpiry);
            self.clear_call(CallEndReason::Unknown);
            return Err(CallError::protocol("round-trip delay requests unanswered"));
        }
        self.rtd.send = self.rtd.send.wrapping_add(1);
        self.send_h245(H245Message::Request(RequestMessage::RoundTripDelayRequest(RoundTripDelay {
            sequence_number: self.rtd.send,
        })))?;
        self.timers.arm(TimerClass::Rtd, None, rtd.interval());
        Ok(())
    }

    fn on_round_trip_delay_response(&mut self, rtd: RoundTripDelay) {
        debug!(call = %self.token, seq = rtd.sequence_number, "RoundTripDelayResponse received");
        self.rtd.recv = rtd.sequence_number;
    }

    pub(crate) fn on_rtd_timeout(&mut self) -> CallResult<()> {
        if self.state.is_clearing() {
            return Ok(());
        }
        self.send_round_trip_delay_request()
    }

    // =====================================================================
    // Mode requests
    // =====================================================================

    /// Ask the remote to switch between audio and T.38
    pub(crate) fn send_request_mode(&mut self, t38: bool) -> CallResult<()> {
        if t38 && !self.flags.t38_supported {
            return Err(CallError::protocol("T.38 not negotiated with the remote"));
        }
        let (element, kind) = if t38 {
            (ModeElement::T38Fax, SessionKind::Data)
        } else {
            (ModeElement::Audio, SessionKind::Audio)
        };
        self.request_mode.seq = self.request_mode.seq.wrapping_add(1);
        self.request_mode.pending = Some(kind);
        info!(call = %self.token, seq = self.request_mode.seq, "Requesting {:?} mode", element);
        self.send_h245(H245Message::Request(RequestMessage::RequestMode(RequestMode {
            sequence_number: self.request_mode.seq,
            requested_modes: vec![vec![element]],
        })))
    }

    fn on_request_mode(&mut self, request: RequestMode) -> CallResult<()> {
        let seq = request.sequence_number;
        let target = match request.preferred_element() {
            Some(ModeElement::T38Fax | ModeElement::OtherData) if self.flags.t38_supported => {
                Some(SessionKind::Data)
            }
            Some(ModeElement::Audio) => Some(SessionKind::Audio),
            _ => None,
        };
        let Some(kind) = target else {
            warn!(
                call = %self.token,
                "Rejecting RequestMode {}: {:?}", seq, request.preferred_element()
            );
            let reject = RequestModeReject {
                sequence_number: seq,
                cause: RequestModeRejectCause::ModeUnavailable,
            };
            let response = ResponseMessage::RequestModeReject(reject);
            return self.send_h245(H245Message::Response(response));
        };

        self.send_h245(H245Message::Response(ResponseMessage::RequestModeAck(RequestModeAck {
            sequence_number: seq,
            response: RequestModeResponse::WillTransmitMostPreferredMode,
        })))?;
        self.switch_session(kind);
        Ok(())
    }

    fn on_request_mode_ack(&mut self, ack: RequestModeAck) {
        if ack.sequence_number != self.request_mode.seq {
            debug!(call = %self.token, "Ignoring RequestModeAck {}", ack.sequence_number);
            return;
        }
        let Some(kind) = self.request_mode.pending.take() else { return };
        info!(call = %self.token, "Remote accepted {:?} mode", kind);
        self.switch_session(kind);
        if let Err(e) = self.close_all_transmit_channels() {
            debug!(call = %self.token, "Closing transmit channels for mode change failed: {}", e);
        }
    }

    fn on_request_mode_reject(&mut self, reject: RequestModeReject) {
        warn!(
            call = %self.token,
            cause = ?reject.cause,
            "RequestMode {} rejected", reject.sequence_number
        );
        self.request_mode.pending = None;
        self.clear_call(CallEndReason::RemoteRejected);
    }

    fn switch_session(&mut self, kind: SessionKind) {
        if self.session_kind == kind {
            return;
        }
        self.session_kind = kind;
        if let Some(handler) = self.handler() {
            handler.on_mode_changed(self, kind == SessionKind::Data);
        }
    }

    // =====================================================================
    // DTMF relay
    // =====================================================================

    fn on_user_input(&mut self, input: UserInputIndication) {
        let dtmf = self.ctx.config.dtmf;
        match input {
            UserInputIndication::Alphanumeric(digits) if dtmf.h245_alphanumeric => {
                self.deliver_dtmf(&digits)
            }
            UserInputIndication::Signal(signal) if dtmf.h245_signal => {
                self.on_user_input_signal(signal)
            }
            other => debug!(call = %self.token, "Ignoring user input {:?}", other),
        }
    }

    fn on_user_input_signal(&mut self, signal: UserInputSignal) {
        let duplicate = match (&self.dtmf.last_signal, self.dtmf.next_stamp, signal.rtp_timestamp) {
            (Some(last), Some(next), Some(stamp)) => *last == signal.signal_type && next > stamp,
            _ => false,
        };
        self.dtmf.next_stamp = match (signal.rtp_timestamp, signal.duration) {
            (Some(stamp), Some(duration)) => Some(stamp.wrapping_add(duration)),
            _ => None,
        };
        if duplicate {
            debug!(call = %self.token, "Suppressing repeated DTMF signal {}", signal.signal_type);
        } else {
            self.deliver_dtmf(&signal.signal_type);
        }
        self.dtmf.last_signal = Some(signal.signal_type);
    }

    fn deliver_dtmf(&self, digits: &str) {
        debug!(call = %self.token, "Received DTMF {}", digits);
        if let Some(handler) = self.handler() {
            handler.on_received_dtmf(self, digits);
        }
    }

    /// Relay digits using the negotiated H.245 mode
    pub(crate) fn send_user_input(&mut self, digits: &str) -> CallResult<()> {
        if self.joint_dtmf.h245_alphanumeric {
            return self.send_h245(H245Message::Indication(IndicationMessage::UserInput(
                UserInputIndication::Alphanumeric(digits.to_string()),
            )));
        }
        if self.joint_dtmf.h245_signal {
            for digit in digits.chars() {
                let signal = UserInputSignal {
                    signal_type: digit.to_string(),
                    duration: Some(DTMF_SIGNAL_DURATION),
                    rtp_timestamp: None,
                };
                let input = UserInputIndication::Signal(signal);
                self.send_h245(H245Message::Indication(IndicationMessage::UserInput(input)))?;
            }
            return Ok(());
        }
        Err(CallError::protocol("no H.245 DTMF mode negotiated"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallContext;
    use crate::config::EndpointConfig;

    fn call_with_rtd(count: u32) -> CallRecord {
        let config = EndpointConfig::new().with_rtd(count, 1);
        CallRecord::new_outgoing(CallContext::new(config), "192.0.2.20:1720".parse().unwrap())
    }

    #[test]
    fn test_round_trip_bound_across_sequence_wrap() {
        let mut call = call_with_rtd(2);
        call.rtd.send = 254;
        call.rtd.recv = 254;

        for expected in [255u8, 0, 1] {
            call.send_round_trip_delay().unwrap();
            assert_eq!(call.rtd.send, expected);
        }
        assert!(call.send_round_trip_delay().is_err());
        assert_eq!(call.end_reason(), Some(CallEndReason::Unknown));
        assert_eq!(call.q931_cause(), Some(Q931Cause::RecoveryOnTimerExpiry));
    }

    #[test]
    fn test_round_trip_answer_after_wrap_resets_distance() {
        let mut call = call_with_rtd(2);
        call.rtd.send = 255;
        call.rtd.recv = 254;

        call.send_round_trip_delay().unwrap();
        assert_eq!(call.rtd.send, 0);
        call.on_round_trip_delay_response(RoundTripDelay { sequence_number: 0 });

        call.send_round_trip_delay().unwrap();
        assert_eq!(call.rtd.send, 1);
        assert_eq!(call.end_reason(), None);
    }
}
