//! H.225.0 call signaling
//!
//! ```text
//!  outgoing:  Created ──SETUP──▶ Connecting ──CONNECT──▶ Connected
//!  incoming:  Created ──SETUP──▶ [WaitingAdmission] ──▶ Connecting ──answer──▶ Connected
//!
//!  any state ──clear──▶ Clear ──ReleaseComplete sent──▶ ClearReleaseSent ──▶ Cleared
//!  any state ──ReleaseComplete received──────────────────────────────────▶ Cleared
//! ```
//!
//! Each received Q.931 message is first checked for a tunneling change and a
//! separate H.245 address, then for fast start answers, and only then are
//! its tunneled H.245 messages dispatched.

use bytes::Bytes;
use tracing::{debug, info, warn};

use rvoip_h323_proto::h245::{
    DataType, H2250LogicalChannelParameters, LogicalChannelParameters, OpenLogicalChannel,
};
use rvoip_h323_proto::q931::{
    AliasAddress, CallProgressUuie, ConnectUuie, FacilityReason, FacilityUuie, ReleaseCompleteUuie,
    SetupUuie,
};
use rvoip_h323_proto::{
    H323MessageBody, H323UserInformation, MediaKind, Q931Cause, Q931Message, Q931MessageType,
    TransportAddress,
};

use crate::call::{
    CallDirection, CallRecord, CallState, ChannelDirection, ChannelState, H245Link,
    H245SessionState, LocalTcsState, LogicalChannel,
};
use crate::channels::default_session_id;
use crate::config::CallMode;
use crate::errors::{CallEndReason, CallError, CallResult};
use crate::handler::{AdmissionDecision, ForwardTarget};
use crate::timer::TimerClass;

impl CallRecord {
    pub(crate) fn dispatch_q931(&mut self, message: Q931Message) -> CallResult<()> {
        if self.state == CallState::Cleared {
            debug!(call = %self.token, "Ignoring {} on cleared call", message.message_type);
            return Ok(());
        }
        info!(call = %self.token, "Received {}", message.message_type);

        match message.message_type {
            Q931MessageType::Setup => self.on_setup(message),
            Q931MessageType::CallProceeding
            | Q931MessageType::Alerting
            | Q931MessageType::Progress => self.on_call_progress(message),
            Q931MessageType::Connect => self.on_connect(message),
            Q931MessageType::Facility => self.on_facility(message),
            Q931MessageType::ReleaseComplete => {
                self.on_release_complete(message);
                Ok(())
            }
            other => {
                debug!(call = %self.token, "{} not handled beyond tunneled H.245", other);
                match message.user_info {
                    Some(info) => self.process_tunneled(&info),
                    None => Ok(()),
                }
            }
        }
    }

    /// Reject a malformed message by clearing the call
    fn invalid_message(&mut self, what: &str) -> CallResult<()> {
        warn!(call = %self.token, "Invalid message: {}", what);
        self.clear_call(CallEndReason::InvalidMessage);
        Err(CallError::protocol(what.to_string()))
    }

    // =====================================================================
    // Outgoing call
    // =====================================================================

    /// Send SETUP toward the remote signaling address
    pub fn place_call(
        &mut self,
        destination: Vec<AliasAddress>,
        called_number: Option<String>,
    ) -> CallResult<()> {
        self.step(|call| call.send_setup(destination, called_number))
    }

    fn send_setup(
        &mut self,
        destination: Vec<AliasAddress>,
        called_number: Option<String>,
    ) -> CallResult<()> {
        if self.direction != CallDirection::Outgoing || self.state != CallState::Created {
            return Err(CallError::invalid_state(format!(
                "cannot place a call in state {}",
                self.state
            )));
        }
        let config = self.config_arc();
        self.identity.caller_aliases =
            local_aliases(config.h323_id.as_deref(), config.e164.as_deref());
        self.identity.callee_aliases = destination;
        self.identity.calling_number = config.e164.clone();
        self.identity.called_number =
            called_number.or_else(|| first_dialed_digits(&self.identity.callee_aliases));
        self.identity.display = config.display_name.clone();

        let fast_start = if self.flags.fast_start {
            match self.propose_fast_start() {
                Ok(elements) => elements,
                Err(e) => {
                    warn!(call = %self.token, "Failed to build fast start proposals: {}", e);
                    self.clear_call(CallEndReason::LocalCleared);
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        let setup = SetupUuie {
            call_identifier: self.identity.call_identifier,
            conference_id: self.identity.conference_id,
            source_address: self.identity.caller_aliases.clone(),
            destination_address: self.identity.callee_aliases.clone(),
            source_call_signal_address: None,
            destination_call_signal_address: self.remote_signal_addr.map(TransportAddress::Unicast),
            h245_address: None,
            fast_start,
            media_wait_for_connect: false,
        };
        let mut message = self
            .q931(Q931MessageType::Setup)
            .with_user_info(H323UserInformation::new(H323MessageBody::Setup(setup)));
        message.display = self.identity.display.clone();
        message.calling_party_number = self.identity.calling_number.clone();
        message.called_party_number = self.identity.called_number.clone();

        info!(call = %self.token, remote = ?self.remote_signal_addr, "Placing call");
        self.flags.signaling_started = true;
        self.send_q931(message);
        self.set_state(CallState::Connecting);
        self.timers.arm(TimerClass::CallEstablish, None, config.timers.call_establishment());
        Ok(())
    }

    pub(crate) fn on_call_establish_timeout(&mut self) -> CallResult<()> {
        if self.state < CallState::Connected {
            warn!(call = %self.token, "No CONNECT before the call establishment timer expired");
            self.clear_call(CallEndReason::RemoteNoAnswer);
        }
        Ok(())
    }

    fn on_call_progress(&mut self, message: Q931Message) -> CallResult<()> {
        if self.direction != CallDirection::Outgoing {
            debug!(call = %self.token, "Ignoring {} on incoming call", message.message_type);
            return Ok(());
        }
        let Some(info) = message.user_info else {
            debug!(call = %self.token, "{} without user information", message.message_type);
            return Ok(());
        };
        self.apply_tunneling_policy(message.message_type, &info);
        if !info.fast_start().is_empty() {
            self.answer_fast_start_proposals(info.fast_start())?;
        }
        self.process_tunneled(&info)?;
        if self.state.is_clearing() {
            return Ok(());
        }

        if let Some(handler) = self.handler() {
            match message.message_type {
                Q931MessageType::Alerting => handler.on_alerting(self),
                Q931MessageType::Progress => handler.on_progress(self),
                _ => {}
            }
        }
        self.start_h245_negotiation()
    }

    fn on_connect(&mut self, message: Q931Message) -> CallResult<()> {
        if self.direction != CallDirection::Outgoing {
            debug!(call = %self.token, "Ignoring CONNECT on incoming call");
            return Ok(());
        }
        if self.state >= CallState::Connected {
            debug!(call = %self.token, "Duplicate CONNECT ignored");
            return Ok(());
        }
        self.timers.cancel_class(TimerClass::CallEstablish, None);

        let Some(info) = message.user_info else {
            return self.invalid_message("CONNECT without user information");
        };
        if !matches!(info.body, H323MessageBody::Connect(_)) {
            return self.invalid_message("CONNECT with a foreign body");
        }

        if self.flags.fast_start && !self.flags.fast_start_answered {
            if info.fast_start().is_empty() {
                info!(
                    call = %self.token,
                    "Remote did not answer fast start, using H.245 procedures"
                );
                self.drop_fast_start_proposals();
                self.flags.fast_start = false;
            } else {
                self.answer_fast_start_proposals(info.fast_start())?;
            }
        }

        self.apply_tunneling_policy(Q931MessageType::Connect, &info);
        self.process_tunneled(&info)?;
        if self.state.is_clearing() {
            return Ok(());
        }
        self.set_state(CallState::Connected);
        self.start_h245_negotiation()?;
        // Dropped fast start proposals may have held back the open check
        self.open_channels_if_ready()?;
        if !self.flags.tunneling
            && self.remote_h245_addr.is_none()
            && self.h245_link == H245Link::None
        {
            warn!(call = %self.token, "Connected without tunneling or an H.245 address");
        }
        if self.ctx.config.rtd.enabled() {
            self.timers.arm(TimerClass::Rtd, None, self.ctx.config.rtd.interval());
        }

        if let Some(handler) = self.handler() {
            handler.on_received_connect(self);
            handler.on_call_established(self);
        }
        Ok(())
    }

    /// Tunneling starts TCS and MSD right away; otherwise connect H.245
    fn start_h245_negotiation(&mut self) -> CallResult<()> {
        if self.flags.tunneling {
            if self.tcs.local == LocalTcsState::Idle {
                self.send_capability_set()?;
            }
            self.begin_msd()
        } else {
            self.ensure_h245_connection();
            Ok(())
        }
    }

    // =====================================================================
    // Incoming call
    // =====================================================================

    fn on_setup(&mut self, message: Q931Message) -> CallResult<()> {
        if self.direction != CallDirection::Incoming || self.flags.setup_received {
            warn!(call = %self.token, "Unexpected SETUP ignored");
            return Ok(());
        }
        self.flags.setup_received = true;
        self.flags.signaling_started = true;
        self.identity.call_reference = message.call_reference;

        let Some(info) = message.user_info else {
            return self.invalid_message("SETUP without user information");
        };
        let H323MessageBody::Setup(setup) = &info.body else {
            return self.invalid_message("SETUP with a foreign body");
        };
        if let Some(address) = setup.source_call_signal_address {
            if address.unicast().is_none() {
                return self.invalid_message("SETUP source signaling address is not an IP address");
            }
        }

        self.identity.call_identifier = setup.call_identifier;
        self.identity.conference_id = setup.conference_id;
        self.identity.display = message.display.clone();
        self.identity.caller_aliases = setup.source_address.clone();
        self.identity.callee_aliases = setup.destination_address.clone();
        self.identity.calling_number = message
            .calling_party_number
            .clone()
            .or_else(|| first_dialed_digits(&setup.source_address));
        self.identity.called_number = message
            .called_party_number
            .clone()
            .or_else(|| first_dialed_digits(&setup.destination_address));
        info!(
            call = %self.token,
            caller = ?self.identity.calling_number,
            callee = ?self.identity.called_number,
            "Incoming SETUP"
        );

        self.apply_tunneling_policy(Q931MessageType::Setup, &info);
        if self.flags.fast_start && !setup.fast_start.is_empty() {
            self.accept_fast_start_offer(&setup.fast_start)?;
        } else {
            self.flags.fast_start = false;
        }
        self.process_tunneled(&info)?;
        if self.state.is_clearing() {
            return Ok(());
        }

        if self.ctx.admission_required {
            debug!(call = %self.token, "Waiting for admission");
            self.set_state(CallState::WaitingAdmission);
            Ok(())
        } else {
            self.admit()
        }
    }

    fn admit(&mut self) -> CallResult<()> {
        let body = CallProgressUuie {
            call_identifier: Some(self.identity.call_identifier),
            ..Default::default()
        };
        let message = self
            .q931(Q931MessageType::CallProceeding)
            .with_user_info(H323UserInformation::new(H323MessageBody::CallProceeding(body)));
        self.send_q931(message);
        self.set_state(CallState::Connecting);
        self.ensure_h245_connection();
        if let Some(handler) = self.handler() {
            handler.on_incoming_call(self);
        }
        Ok(())
    }

    /// Outcome of the admission step for an incoming call
    pub fn admission_result(&mut self, decision: AdmissionDecision) -> CallResult<()> {
        self.step(|call| {
            if call.state != CallState::WaitingAdmission {
                debug!(call = %call.token, "Admission decision after state {} ignored", call.state);
                return Ok(());
            }
            match decision {
                AdmissionDecision::Admit => call.admit(),
                AdmissionDecision::Reject(reason) => {
                    info!(call = %call.token, reason = %reason, "Admission rejected");
                    call.clear_call(reason);
                    Ok(())
                }
            }
        })
    }

    /// No admission decision arrived in time
    pub fn admission_timed_out(&mut self) -> CallResult<()> {
        self.step(|call| {
            if call.state == CallState::WaitingAdmission {
                warn!(call = %call.token, "Admission timed out");
                call.clear_call(CallEndReason::GatekeeperUnreachable);
            }
            Ok(())
        })
    }

    fn require_answerable(&self) -> CallResult<()> {
        if self.direction != CallDirection::Incoming || self.state != CallState::Connecting {
            return Err(CallError::invalid_state(format!(
                "cannot answer a call in state {}",
                self.state
            )));
        }
        Ok(())
    }

    /// Send ALERTING for an incoming call
    pub fn send_alerting(&mut self) -> CallResult<()> {
        self.step(|call| {
            call.require_answerable()?;
            let fast_start = call.fast_start_answer()?;
            let body = CallProgressUuie {
                call_identifier: Some(call.identity.call_identifier),
                fast_start,
                ..Default::default()
            };
            let message = call
                .q931(Q931MessageType::Alerting)
                .with_user_info(H323UserInformation::new(H323MessageBody::Alerting(body)));
            call.send_q931(message);
            call.activate_fast_start_channels()
        })
    }

    /// Send CONNECT for an incoming call
    pub fn answer_call(&mut self) -> CallResult<()> {
        self.step(|call| {
            call.require_answerable()?;
            if call.flags.tunneling {
                if call.tcs.local == LocalTcsState::Idle {
                    call.send_capability_set()?;
                }
                call.begin_msd()?;
            }
            let fast_start = call.fast_start_answer()?;
            let body = ConnectUuie {
                call_identifier: Some(call.identity.call_identifier),
                conference_id: Some(call.identity.conference_id),
                fast_start,
                ..Default::default()
            };
            let message = call
                .q931(Q931MessageType::Connect)
                .with_user_info(H323UserInformation::new(H323MessageBody::Connect(body)));
            call.send_q931(message);
            call.set_state(CallState::Connected);
            call.activate_fast_start_channels()?;
            call.ensure_h245_connection();
            if call.ctx.config.rtd.enabled() {
                call.timers.arm(TimerClass::Rtd, None, call.ctx.config.rtd.interval());
            }
            info!(call = %call.token, "Call answered");
            if let Some(handler) = call.handler() {
                handler.on_call_established(call);
            }
            Ok(())
        })
    }

    // =====================================================================
    // Facility
    // =====================================================================

    fn on_facility(&mut self, message: Q931Message) -> CallResult<()> {
        let Some(info) = message.user_info else {
            debug!(call = %self.token, "Facility without user information");
            return Ok(());
        };
        let facility = match &info.body {
            H323MessageBody::Facility(facility) => facility.clone(),
            H323MessageBody::Empty => return self.process_tunneled(&info),
            other => {
                debug!(call = %self.token, "Facility with body {:?}", other);
                return self.process_tunneled(&info);
            }
        };

        match facility.reason {
            FacilityReason::TransportedInformation => self.process_tunneled(&info),
            FacilityReason::StartH245 => self.on_start_h245(&facility),
            FacilityReason::CallForwarded => self.on_call_forwarded(facility),
            FacilityReason::ForwardedElements => {
                self.apply_tunneling_policy(Q931MessageType::Facility, &info);
                if !facility.fast_start.is_empty() {
                    self.answer_fast_start_proposals(&facility.fast_start)?;
                }
                self.process_tunneled(&info)?;
                if self.state.is_clearing() {
                    return Ok(());
                }
                self.start_h245_negotiation()
            }
            other => {
                debug!(call = %self.token, "Facility reason {:?} not handled", other);
                self.process_tunneled(&info)
            }
        }
    }

    fn on_start_h245(&mut self, facility: &FacilityUuie) -> CallResult<()> {
        let Some(address) = facility.h245_address.filter(|a| a.unicast().is_some()) else {
            return self.invalid_message("startH245 Facility without an IP H.245 address");
        };
        if !self.record_remote_h245_address(address) {
            return self.invalid_message("startH245 Facility with an unusable H.245 address");
        }
        info!(call = %self.token, "Remote asked for a separate H.245 connection");
        self.flags.tunneling = false;
        self.tunneled.clear();
        self.ensure_h245_connection();
        Ok(())
    }

    fn on_call_forwarded(&mut self, facility: FacilityUuie) -> CallResult<()> {
        if facility.alternative_address.is_none() && facility.alternative_alias_address.is_empty() {
            return self.invalid_message("callForwarded Facility without a target");
        }
        let target = ForwardTarget {
            address: facility.alternative_address,
            aliases: facility.alternative_alias_address,
        };
        info!(call = %self.token, target = ?target, "Call forwarded");
        self.forward = Some(target.clone());
        if let Some(handler) = self.handler() {
            handler.on_call_forwarded(self, &target);
        }
        self.clear_call(CallEndReason::RemoteForwarded);
        Ok(())
    }

    // =====================================================================
    // Release
    // =====================================================================

    fn on_release_complete(&mut self, message: Q931Message) {
        let cause = message.cause.map(|raw| raw & 0x7f).and_then(Q931Cause::from_u8);
        let reason = match message.body() {
            Some(H323MessageBody::ReleaseComplete(body)) => body.reason,
            _ => None,
        };
        info!(call = %self.token, cause = ?cause, reason = ?reason, "ReleaseComplete received");

        self.q931_cause = cause;
        self.release_reason = reason;
        self.timers.cancel_class(TimerClass::Session, None);
        if self.end_reason.is_none() {
            self.end_reason = Some(CallEndReason::from_release(cause, reason));
        }
        self.flags.release_sent = true;
        self.close_h245();
        self.mark_cleared();
    }

    /// End of step for a call in `Clear`: tear down and send ReleaseComplete
    pub(crate) fn run_clearing(&mut self) {
        if !self.flags.signaling_started || self.flags.release_sent {
            self.mark_cleared();
            return;
        }

        self.clear_all_channels();
        if self.h245_session == H245SessionState::Active {
            if let Err(e) = self.send_end_session() {
                debug!(call = %self.token, "EndSessionCommand not sent: {}", e);
            }
        }

        let reason = self.end_reason.unwrap_or(CallEndReason::Unknown);
        let (default_cause, release_reason) = reason.to_release_cause();
        let cause = self.q931_cause.unwrap_or(default_cause);
        self.q931_cause = Some(cause);
        self.release_reason = Some(release_reason);

        let body = ReleaseCompleteUuie {
            call_identifier: Some(self.identity.call_identifier),
            reason: Some(release_reason),
        };
        let message = self
            .q931(Q931MessageType::ReleaseComplete)
            .with_user_info(H323UserInformation::new(H323MessageBody::ReleaseComplete(body)))
            .with_cause(cause);
        info!(call = %self.token, cause = ?cause, reason = %reason, "Sending ReleaseComplete");
        self.send_q931(message);
        self.flags.release_sent = true;
        self.set_state(CallState::ClearReleaseSent);

        let awaiting_end_session = !self.flags.tunneling
            && self.h245_session == H245SessionState::EndSent
            && self.h245_link == H245Link::Connected;
        if !awaiting_end_session {
            self.mark_cleared();
        }
    }

    // =====================================================================
    // Fast start
    // =====================================================================

    /// Build our fast start proposals: per preferred capability a receive
    /// and/or a transmit channel
    fn propose_fast_start(&mut self) -> CallResult<Vec<Bytes>> {
        let config = self.config_arc();
        let codec = self.codec();
        let mut elements = Vec::new();

        for cap in &config.capabilities {
            let kind = cap.kind();
            let video_off = kind == MediaKind::Video && config.call_mode != CallMode::VideoCall;
            if kind == MediaKind::Data || video_off {
                continue;
            }
            let session_id = default_session_id(kind);

            if cap.direction.can_receive() {
                let number = self.next_channel_number();
                let (local_rtp, local_rtcp) = self.allocate_media_addresses();
                let format = cap.rx_format();
                let olc = OpenLogicalChannel {
                    forward_logical_channel_number: number,
                    forward_parameters: LogicalChannelParameters {
                        data_type: DataType::Null,
                        multiplex_parameters: Some(H2250LogicalChannelParameters {
                            session_id,
                            media_channel: None,
                            media_control_channel: None,
                        }),
                    },
                    reverse_parameters: Some(LogicalChannelParameters {
                        data_type: DataType::from_format(format.clone()),
                        multiplex_parameters: Some(H2250LogicalChannelParameters {
                            session_id,
                            media_channel: Some(TransportAddress::Unicast(local_rtp)),
                            media_control_channel: Some(TransportAddress::Unicast(local_rtcp)),
                        }),
                    }),
                };
                elements.push(codec.encode_fast_start(&olc)?);
                self.channels.insert(LogicalChannel {
                    number,
                    session_id,
                    direction: ChannelDirection::Receive,
                    format,
                    state: ChannelState::ProposedFastStart,
                    local_rtp,
                    local_rtcp,
                    remote_rtp: None,
                    remote_rtcp: None,
                });
            }

            if cap.direction.can_transmit() {
                let number = self.next_channel_number();
                let (local_rtp, local_rtcp) = self.allocate_media_addresses();
                let format = cap.tx_format();
                let olc = OpenLogicalChannel {
                    forward_logical_channel_number: number,
                    forward_parameters: LogicalChannelParameters {
                        data_type: DataType::from_format(format.clone()),
                        multiplex_parameters: Some(H2250LogicalChannelParameters {
                            session_id,
                            media_channel: None,
                            media_control_channel: Some(TransportAddress::Unicast(local_rtcp)),
                        }),
                    },
                    reverse_parameters: None,
                };
                elements.push(codec.encode_fast_start(&olc)?);
                self.channels.insert(LogicalChannel {
                    number,
                    session_id,
                    direction: ChannelDirection::Transmit,
                    format,
                    state: ChannelState::ProposedFastStart,
                    local_rtp,
                    local_rtcp,
                    remote_rtp: None,
                    remote_rtcp: None,
                });
            }
        }
        debug!(call = %self.token, "Proposing {} fast start channel(s)", elements.len());
        Ok(elements)
    }

    fn drop_fast_start_proposals(&mut self) {
        let proposals: Vec<_> = self
            .channels
            .iter()
            .filter(|c| c.state == ChannelState::ProposedFastStart)
            .map(|c| (c.number, c.direction))
            .collect();
        for (number, direction) in proposals {
            self.clear_channel(number, direction);
        }
    }

    /// The remote's answer to our fast start proposals; handled once
    fn answer_fast_start_proposals(&mut self, elements: &[Bytes]) -> CallResult<()> {
        if !self.flags.fast_start || self.flags.fast_start_answered {
            return Ok(());
        }
        let codec = self.codec();
        let mut answers = Vec::with_capacity(elements.len());
        for element in elements {
            match codec.decode_fast_start(element) {
                Ok(olc) => answers.push(olc),
                Err(e) => {
                    warn!(call = %self.token, "Undecodable fast start answer: {}", e);
                    return self.invalid_message("undecodable fast start answer");
                }
            }
        }
        self.flags.fast_start_answered = true;

        for olc in answers {
            if let Some(format) = olc.forward_parameters.data_type.format() {
                // The remote receives what we proposed to transmit
                let Some(number) = self.find_proposal(ChannelDirection::Transmit, format.codec)
                else {
                    warn!(
                        call = %self.token,
                        "Fast start answer for unknown transmit codec {}", format.codec
                    );
                    continue;
                };
                let params = olc.forward_parameters.multiplex_parameters.as_ref();
                let media = params.and_then(|p| p.media_channel).and_then(|a| a.unicast());
                let Some(media) = media else {
                    return self
                        .invalid_message("fast start answer without a unicast media channel");
                };
                let answered = olc.forward_logical_channel_number;
                let number = self.renumber_proposal(number, ChannelDirection::Transmit, answered);
                if let Some(channel) = self.channels.get_mut(number, ChannelDirection::Transmit) {
                    channel.remote_rtp = Some(media);
                    channel.remote_rtcp =
                        params.and_then(|p| p.media_control_channel).and_then(|a| a.unicast());
                }
                self.start_channel_media(number, ChannelDirection::Transmit)?;
                self.establish_channel(number, ChannelDirection::Transmit);
            } else if let Some(reverse) = &olc.reverse_parameters {
                let Some(format) = reverse.data_type.format() else { continue };
                let Some(number) = self.find_proposal(ChannelDirection::Receive, format.codec)
                else {
                    warn!(
                        call = %self.token,
                        "Fast start answer for unknown receive codec {}", format.codec
                    );
                    continue;
                };
                let remote_rtcp = reverse
                    .multiplex_parameters
                    .as_ref()
                    .and_then(|p| p.media_control_channel)
                    .and_then(|a| a.unicast());
                let answered = olc.forward_logical_channel_number;
                let number = self.renumber_proposal(number, ChannelDirection::Receive, answered);
                if let Some(channel) = self.channels.get_mut(number, ChannelDirection::Receive) {
                    channel.remote_rtcp = remote_rtcp;
                }
                self.start_channel_media(number, ChannelDirection::Receive)?;
                self.establish_channel(number, ChannelDirection::Receive);
            } else {
                debug!(call = %self.token, "Fast start answer without media ignored");
            }
        }

        self.drop_fast_start_proposals();
        info!(
            call = %self.token,
            "Fast start answered, {} channel(s) established", self.channels.len()
        );
        Ok(())
    }

    fn find_proposal(
        &self,
        direction: ChannelDirection,
        codec: rvoip_h323_proto::Codec,
    ) -> Option<u16> {
        self.channels
            .iter()
            .filter(|c| c.state == ChannelState::ProposedFastStart)
            .find(|c| c.direction == direction && c.format.codec == codec)
            .map(|c| c.number)
    }

    /// Adopt the channel number chosen in the answer
    fn renumber_proposal(
        &mut self,
        number: u16,
        direction: ChannelDirection,
        answered: u16,
    ) -> u16 {
        if number == answered {
            return number;
        }
        if let Some(mut channel) = self.channels.remove(number, direction) {
            channel.number = answered;
            if self.channels.insert(channel).is_some() {
                warn!(
                    call = %self.token,
                    channel = answered,
                    "Fast start answer replaced an existing channel"
                );
            }
        }
        answered
    }

    /// Accept the caller's fast start offer, preparing our answers
    fn accept_fast_start_offer(&mut self, elements: &[Bytes]) -> CallResult<()> {
        let codec = self.codec();
        let config = self.config_arc();
        let mut offers = Vec::with_capacity(elements.len());
        for element in elements {
            match codec.decode_fast_start(element) {
                Ok(olc) => offers.push(olc),
                Err(e) => {
                    warn!(call = %self.token, "Undecodable fast start offer: {}", e);
                    return self.invalid_message("undecodable fast start offer");
                }
            }
        }

        for olc in offers {
            let forward = &olc.forward_parameters;
            if forward.data_type.format().is_some() && olc.reverse_parameters.is_some() {
                debug!(call = %self.token, "Skipping bidirectional fast start proposal");
                continue;
            }

            if let Some(format) = forward.data_type.format() {
                // Remote transmits: a receive channel for us
                let Some(params) = forward.multiplex_parameters.as_ref() else { continue };
                if !config.capabilities.iter().any(|c| c.can_receive_format(format)) {
                    continue;
                }
                let session_id = params.session_id;
                if self.channels.find_by_session(session_id, ChannelDirection::Receive).is_some() {
                    continue;
                }
                let number = olc.forward_logical_channel_number;
                let (local_rtp, local_rtcp) = self.allocate_media_addresses();
                self.channels.insert(LogicalChannel {
                    number,
                    session_id,
                    direction: ChannelDirection::Receive,
                    format: format.clone(),
                    state: ChannelState::ProposedFastStart,
                    local_rtp,
                    local_rtcp,
                    remote_rtp: None,
                    remote_rtcp: params.media_control_channel.and_then(|a| a.unicast()),
                });
                self.fast_start_response.push(OpenLogicalChannel {
                    forward_logical_channel_number: number,
                    forward_parameters: LogicalChannelParameters {
                        data_type: forward.data_type.clone(),
                        multiplex_parameters: Some(H2250LogicalChannelParameters {
                            session_id,
                            media_channel: Some(TransportAddress::Unicast(local_rtp)),
                            media_control_channel: Some(TransportAddress::Unicast(local_rtcp)),
                        }),
                    },
                    reverse_parameters: None,
                });
            } else if let Some(reverse) = &olc.reverse_parameters {
                // Remote receives: a transmit channel for us
                let Some(format) = reverse.data_type.format() else { continue };
                let Some(params) = reverse.multiplex_parameters.as_ref() else { continue };
                let Some(remote_rtp) = params.media_channel.and_then(|a| a.unicast()) else {
                    continue;
                };
                if !config.capabilities.iter().any(|c| c.can_transmit_format(format)) {
                    continue;
                }
                let session_id = params.session_id;
                if self.channels.find_by_session(session_id, ChannelDirection::Transmit).is_some() {
                    continue;
                }
                let number = self.next_channel_number();
                let (local_rtp, local_rtcp) = self.allocate_media_addresses();
                self.channels.insert(LogicalChannel {
                    number,
                    session_id,
                    direction: ChannelDirection::Transmit,
                    format: format.clone(),
                    state: ChannelState::ProposedFastStart,
                    local_rtp,
                    local_rtcp,
                    remote_rtp: Some(remote_rtp),
                    remote_rtcp: params.media_control_channel.and_then(|a| a.unicast()),
                });
                self.fast_start_response.push(OpenLogicalChannel {
                    forward_logical_channel_number: number,
                    forward_parameters: LogicalChannelParameters {
                        data_type: DataType::Null,
                        multiplex_parameters: Some(H2250LogicalChannelParameters {
                            session_id,
                            media_channel: None,
                            media_control_channel: None,
                        }),
                    },
                    reverse_parameters: Some(LogicalChannelParameters {
                        data_type: reverse.data_type.clone(),
                        multiplex_parameters: Some(H2250LogicalChannelParameters {
                            session_id,
                            media_channel: None,
                            media_control_channel: Some(TransportAddress::Unicast(local_rtcp)),
                        }),
                    }),
                });
            }
        }

        if self.fast_start_response.is_empty() {
            info!(call = %self.token, "No acceptable fast start proposal");
            self.flags.fast_start = false;
        } else {
            info!(
                call = %self.token,
                "Accepted {} fast start proposal(s)", self.fast_start_response.len()
            );
        }
        Ok(())
    }

    /// Encoded fast start answers for ALERTING/CONNECT
    fn fast_start_answer(&mut self) -> CallResult<Vec<Bytes>> {
        if !self.flags.fast_start {
            return Ok(Vec::new());
        }
        let codec = self.codec();
        let encoded: Result<Vec<Bytes>, _> =
            self.fast_start_response.iter().map(|olc| codec.encode_fast_start(olc)).collect();
        encoded.or_else(|e| {
            warn!(call = %self.token, "Failed to encode fast start answer: {}", e);
            self.clear_call(CallEndReason::LocalCleared);
            Err(e.into())
        })
    }

    /// Start media for accepted fast start channels once the answer is sent
    fn activate_fast_start_channels(&mut self) -> CallResult<()> {
        if !self.flags.fast_start || self.flags.fast_start_answered {
            return Ok(());
        }
        self.flags.fast_start_answered = true;
        let accepted: Vec<_> = self
            .channels
            .iter()
            .filter(|c| c.state == ChannelState::ProposedFastStart)
            .map(|c| (c.number, c.direction))
            .collect();
        for (number, direction) in accepted {
            self.start_channel_media(number, direction)?;
            self.establish_channel(number, direction);
        }
        Ok(())
    }
}

fn local_aliases(h323_id: Option<&str>, e164: Option<&str>) -> Vec<AliasAddress> {
    let mut aliases = Vec::new();
    if let Some(id) = h323_id {
        aliases.push(AliasAddress::H323Id(id.to_string()));
    }
    if let Some(number) = e164 {
        aliases.push(AliasAddress::DialedDigits(number.to_string()));
    }
    aliases
}

fn first_dialed_digits(aliases: &[AliasAddress]) -> Option<String> {
    aliases.iter().find_map(|a| a.dialed_digits().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_aliases() {
        let aliases = local_aliases(Some("alice"), Some("1000"));
        assert_eq!(
            aliases,
            vec![AliasAddress::H323Id("alice".into()), AliasAddress::DialedDigits("1000".into())]
        );
        assert!(local_aliases(None, None).is_empty());
    }
}
