//! Logical channel signaling
//!
//! Opening, acknowledging, closing and timing out H.245 logical channels,
//! plus the side effects every channel state change carries: media start and
//! stop callbacks, timer cancellation and replacement of an older channel in
//! the same session.
//!
//! Close handshakes are not symmetric. A CloseLogicalChannel from the remote
//! always drops our receive channel before the Ack goes out; an
//! Ack *or* a Reject to our RequestChannelClose drops it as well.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use rvoip_h323_proto::h245::{
    ChannelCloseReason, ChannelCloseSource, CloseLogicalChannel, CloseLogicalChannelAck, DataType,
    H2250LogicalChannelAckParameters, H2250LogicalChannelParameters, IndicationMessage,
    LogicalChannelParameters, OlcRejectCause, OpenLogicalChannel, OpenLogicalChannelAck,
    OpenLogicalChannelConfirm, OpenLogicalChannelReject, RccRejectCause, RequestChannelClose,
    RequestChannelCloseAck, RequestChannelCloseReject, RequestChannelCloseRelease, RequestMessage,
    ResponseMessage,
};
use rvoip_h323_proto::{ChannelNumber, H245Message, MediaFormat, MediaKind, TransportAddress};

use crate::call::{
    CallRecord, ChannelDirection, ChannelState, LocalTcsState, LogicalChannel, MsdState,
    PendingAction, RemoteTcsState, SessionKind,
};
use crate::config::CallMode;
use crate::errors::{CallEndReason, CallError, CallResult};
use crate::timer::TimerClass;

/// Default RTP session for a media kind
pub(crate) fn default_session_id(kind: MediaKind) -> u8 {
    match kind {
        MediaKind::Audio => 1,
        MediaKind::Video => 2,
        MediaKind::Data => 3,
    }
}

impl CallRecord {
    // =====================================================================
    // Allocation
    // =====================================================================

    /// Next forward channel number, wrapping inside the configured range
    pub(crate) fn next_channel_number(&mut self) -> ChannelNumber {
        let range = self.ctx.config.channel_range;
        let number = self.next_channel;
        self.next_channel = if number >= range.max { range.base } else { number + 1 };
        number
    }

    /// Session id for a new channel: the kind's default if unused in that
    /// direction, else a fresh one from the master, else 0 for the master to assign
    pub(crate) fn allocate_session_id(
        &mut self,
        kind: MediaKind,
        direction: ChannelDirection,
    ) -> u8 {
        let default = default_session_id(kind);
        if self.channels.find_by_session(default, direction).is_none() {
            return default;
        }
        if self.msd.state == MsdState::Master {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
            id
        } else {
            0
        }
    }

    pub(crate) fn allocate_media_addresses(&self) -> (SocketAddr, SocketAddr) {
        let (rtp, rtcp) = self.ctx.ports.next_pair();
        let ip = self.ctx.config.media_ip;
        (SocketAddr::new(ip, rtp), SocketAddr::new(ip, rtcp))
    }

    // =====================================================================
    // Opening
    // =====================================================================

    /// Open policy runs once both negotiations are done and the remote acknowledged MSD
    pub(crate) fn open_channels_if_ready(&mut self) -> CallResult<()> {
        if self.state.is_clearing() {
            return Ok(());
        }
        let ready = self.msd.state.is_resolved()
            && self.tcs.local == LocalTcsState::AckRecvd
            && self.tcs.remote == RemoteTcsState::AckSent
            && self.msd.remote_acked;
        if !ready || self.channels.has_direction(ChannelDirection::Transmit) {
            return Ok(());
        }
        self.open_default_channels()
    }

    /// Open a transmit channel for every kind the handler or the call mode wants
    pub(crate) fn open_default_channels(&mut self) -> CallResult<()> {
        let kinds = match self.handler().and_then(|h| h.open_logical_channels(self)) {
            Some(kinds) => kinds,
            None => self.default_transmit_kinds(),
        };
        debug!(call = %self.token, "Opening transmit channels for {:?}", kinds);
        for kind in kinds {
            if self.channels.has_kind(kind, ChannelDirection::Transmit) {
                continue;
            }
            self.open_transmit_channel(kind)?;
        }
        Ok(())
    }

    fn default_transmit_kinds(&self) -> Vec<MediaKind> {
        let mode = self.ctx.config.call_mode;
        mode.transmit_kinds()
            .iter()
            .map(|kind| match (kind, self.session_kind) {
                (MediaKind::Audio, SessionKind::Data) if mode != CallMode::AudioRx => {
                    MediaKind::Data
                }
                (kind, _) => *kind,
            })
            .collect()
    }

    /// Choose a joint format for `kind`: the master follows its own
    /// preference list, the slave takes the first joint entry
    fn select_transmit_format(&self, kind: MediaKind) -> Option<MediaFormat> {
        let joint_tx = || {
            self.joint_caps
                .iter()
                .filter(|j| j.direction == ChannelDirection::Transmit && j.kind() == kind)
        };
        if self.msd.state == MsdState::Master {
            self.ctx
                .config
                .capabilities
                .iter()
                .filter(|c| c.kind() == kind && c.direction.can_transmit())
                .find_map(|c| joint_tx().find(|j| j.format.codec == c.codec))
                .map(|j| j.format.clone())
        } else {
            joint_tx().next().map(|j| j.format.clone())
        }
    }

    /// Send an OpenLogicalChannel for `kind`
    pub(crate) fn open_transmit_channel(&mut self, kind: MediaKind) -> CallResult<ChannelNumber> {
        if !self.msd.state.is_resolved() {
            debug!(
                call = %self.token,
                "Not opening {} channel before master-slave determination", kind
            );
            return Err(CallError::MasterSlaveUnresolved);
        }
        let Some(format) = self.select_transmit_format(kind) else {
            warn!(call = %self.token, "No common {} capability for a transmit channel", kind);
            self.clear_call(CallEndReason::LocalCleared);
            return Err(CallError::NoCommonCapability { kind });
        };

        let number = self.next_channel_number();
        let session_id = self.allocate_session_id(kind, ChannelDirection::Transmit);
        let (local_rtp, local_rtcp) = self.allocate_media_addresses();

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

        self.channels.insert(LogicalChannel {
            number,
            session_id,
            direction: ChannelDirection::Transmit,
            format,
            state: ChannelState::Proposed,
            local_rtp,
            local_rtcp,
            remote_rtp: None,
            remote_rtcp: None,
        });
        info!(
            call = %self.token,
            channel = number,
            session = session_id,
            "Opening {} transmit channel", kind
        );

        self.send_h245(H245Message::Request(RequestMessage::OpenLogicalChannel(olc)))?;
        let timeout = self.ctx.config.timers.logical_channel();
        self.timers.arm(TimerClass::Olc, Some(number), timeout);
        Ok(number)
    }

    /// OpenLogicalChannel from the remote: a new receive channel
    pub(crate) fn on_open_channel_request(&mut self, olc: OpenLogicalChannel) -> CallResult<()> {
        let number = olc.forward_logical_channel_number;
        let forward = olc.forward_parameters;

        let Some(format) = forward.data_type.format().cloned() else {
            warn!(
                call = %self.token,
                channel = number,
                "Unsupported channel data type {}", forward.data_type.name()
            );
            return self.reject_open_channel(number, OlcRejectCause::DataTypeNotSupported);
        };
        let Some(multiplex) = forward.multiplex_parameters else {
            warn!(
                call = %self.token,
                channel = number,
                "OpenLogicalChannel without H.225.0 parameters"
            );
            return self.reject_open_channel(number, OlcRejectCause::Unspecified);
        };
        if !self.ctx.config.capabilities.iter().any(|c| c.can_receive_format(&format)) {
            warn!(
                call = %self.token,
                channel = number,
                "No receive capability for {}", format.codec
            );
            return self.reject_open_channel(number, OlcRejectCause::DataTypeNotSupported);
        }

        let session_id = if multiplex.session_id == 0 {
            self.allocate_session_id(format.kind(), ChannelDirection::Receive)
        } else {
            multiplex.session_id
        };
        let (local_rtp, local_rtcp) = self.allocate_media_addresses();
        self.channels.insert(LogicalChannel {
            number,
            session_id,
            direction: ChannelDirection::Receive,
            format,
            state: ChannelState::Proposed,
            local_rtp,
            local_rtcp,
            remote_rtp: None,
            remote_rtcp: multiplex.media_control_channel.and_then(|a| a.unicast()),
        });

        let ack = OpenLogicalChannelAck {
            forward_logical_channel_number: number,
            forward_multiplex_ack_parameters: Some(H2250LogicalChannelAckParameters {
                session_id: Some(session_id),
                media_channel: Some(TransportAddress::Unicast(local_rtp)),
                media_control_channel: Some(TransportAddress::Unicast(local_rtcp)),
            }),
        };
        self.send_h245(H245Message::Response(ResponseMessage::OpenLogicalChannelAck(ack)))?;

        self.start_channel_media(number, ChannelDirection::Receive)?;
        self.establish_channel(number, ChannelDirection::Receive);
        Ok(())
    }

    fn reject_open_channel(
        &mut self,
        number: ChannelNumber,
        cause: OlcRejectCause,
    ) -> CallResult<()> {
        let reject = OpenLogicalChannelReject { forward_logical_channel_number: number, cause };
        self.send_h245(H245Message::Response(ResponseMessage::OpenLogicalChannelReject(reject)))
    }

    pub(crate) fn on_open_channel_ack(&mut self, ack: OpenLogicalChannelAck) -> CallResult<()> {
        let number = ack.forward_logical_channel_number;
        if !self.channels.contains(number, ChannelDirection::Transmit) {
            warn!(
                call = %self.token,
                channel = number,
                "OpenLogicalChannelAck for unknown channel"
            );
            return Err(CallError::ChannelNotFound { number });
        }
        let Some(params) = ack.forward_multiplex_ack_parameters else {
            return Err(CallError::protocol(format!(
                "OpenLogicalChannelAck {} without H.225.0 parameters",
                number
            )));
        };
        let Some(media) = params.media_channel.and_then(|a| a.unicast()) else {
            return Err(CallError::protocol(format!(
                "OpenLogicalChannelAck {} without unicast media channel",
                number
            )));
        };
        if let Some(filter) = &self.address_filter {
            if !filter.is_match(&media.ip().to_string()) {
                warn!(
                    call = %self.token,
                    channel = number,
                    "Remote media address {} rejected by mask", media
                );
                return Err(CallError::protocol(format!(
                    "remote media address {} not allowed",
                    media
                )));
            }
        }

        if let Some(channel) = self.channels.get_mut(number, ChannelDirection::Transmit) {
            if channel.session_id == 0 {
                channel.session_id = params.session_id.unwrap_or(0);
            }
            channel.remote_rtp = Some(media);
            channel.remote_rtcp = params.media_control_channel.and_then(|a| a.unicast());
        }
        self.timers.cancel_class(TimerClass::Olc, Some(number));

        self.start_channel_media(number, ChannelDirection::Transmit)?;
        self.establish_channel(number, ChannelDirection::Transmit);
        Ok(())
    }

    pub(crate) fn on_open_channel_reject(&mut self, reject: OpenLogicalChannelReject) {
        warn!(
            call = %self.token,
            channel = reject.forward_logical_channel_number,
            "OpenLogicalChannel rejected: {}", reject.cause
        );
        self.timers.cancel_class(TimerClass::Olc, Some(reject.forward_logical_channel_number));
        self.clear_call(CallEndReason::LocalCleared);
    }

    pub(crate) fn on_open_channel_confirm(&self, confirm: OpenLogicalChannelConfirm) {
        debug!(
            call = %self.token,
            channel = confirm.forward_logical_channel_number,
            "OpenLogicalChannelConfirm received"
        );
    }

    /// Run the media start callback; a missing handler or a refusal clears the call
    pub(crate) fn start_channel_media(
        &mut self,
        number: ChannelNumber,
        direction: ChannelDirection,
    ) -> CallResult<()> {
        let Some(channel) = self.channels.get(number, direction).cloned() else {
            return Err(CallError::ChannelNotFound { number });
        };
        let result = match self.handler() {
            Some(handler) => match direction {
                ChannelDirection::Receive => handler.start_receive_channel(self, &channel),
                ChannelDirection::Transmit => handler.start_transmit_channel(self, &channel),
            },
            None => Err(CallError::media(format!("no media handler to start {}", channel))),
        };
        if let Err(e) = result {
            warn!(call = %self.token, "Failed to start {}: {}", channel, e);
            self.clear_call(CallEndReason::LocalCleared);
            return Err(e);
        }
        Ok(())
    }

    /// Mark a channel established, replacing older channels of the same session
    pub(crate) fn establish_channel(&mut self, number: ChannelNumber, direction: ChannelDirection) {
        let Some(channel) = self.channels.get_mut(number, direction) else { return };
        channel.state = ChannelState::Established;
        let session_id = channel.session_id;
        info!(
            call = %self.token,
            channel = number,
            session = session_id,
            "{} channel established", direction
        );

        if session_id != 0 {
            for peer in self.channels.established_peers(number, session_id, direction) {
                debug!(
                    call = %self.token,
                    channel = peer,
                    "Replacing channel in session {}", session_id
                );
                self.clear_channel(peer, direction);
            }
        }
    }

    // =====================================================================
    // Closing
    // =====================================================================

    /// Remove a channel silently: cancel its timers, stop its media
    pub(crate) fn clear_channel(
        &mut self,
        number: ChannelNumber,
        direction: ChannelDirection,
    ) -> Option<LogicalChannel> {
        let channel = self.channels.remove(number, direction)?;
        match direction {
            ChannelDirection::Transmit => {
                self.timers.cancel_class(TimerClass::Olc, Some(number));
                self.timers.cancel_class(TimerClass::Clc, Some(number));
            }
            ChannelDirection::Receive => {
                self.timers.cancel_class(TimerClass::Rcc, Some(number));
            }
        }
        if channel.is_established() || channel.state == ChannelState::ClosePending {
            if let Some(handler) = self.handler() {
                match direction {
                    ChannelDirection::Receive => handler.stop_receive_channel(self, &channel),
                    ChannelDirection::Transmit => handler.stop_transmit_channel(self, &channel),
                }
            }
        }
        debug!(call = %self.token, "Cleared {}", channel);
        Some(channel)
    }

    pub(crate) fn clear_all_channels(&mut self) {
        for (number, direction) in self.channels.keys() {
            self.clear_channel(number, direction);
        }
    }

    /// Close one of our transmit channels, or ask the remote to close one we receive
    pub(crate) fn close_logical_channel(
        &mut self,
        number: ChannelNumber,
        direction: ChannelDirection,
    ) -> CallResult<()> {
        if !self.channels.contains(number, direction) {
            return Err(CallError::ChannelNotFound { number });
        }
        let timeout = self.ctx.config.timers.logical_channel();
        match direction {
            ChannelDirection::Transmit => {
                info!(call = %self.token, channel = number, "Closing transmit channel");
                let close = CloseLogicalChannel {
                    forward_logical_channel_number: number,
                    source: ChannelCloseSource::Lcse,
                    reason: ChannelCloseReason::Unknown,
                };
                self.send_h245(H245Message::Request(RequestMessage::CloseLogicalChannel(close)))?;
                if let Some(channel) = self.channels.get_mut(number, direction) {
                    channel.state = ChannelState::ClosePending;
                }
                self.timers.cancel_class(TimerClass::Olc, Some(number));
                self.timers.arm(TimerClass::Clc, Some(number), timeout);
            }
            ChannelDirection::Receive => {
                info!(call = %self.token, channel = number, "Requesting close of receive channel");
                let request = RequestChannelClose {
                    forward_logical_channel_number: number,
                    reason: ChannelCloseReason::Unknown,
                };
                self.send_h245(H245Message::Request(RequestMessage::RequestChannelClose(request)))?;
                self.timers.arm(TimerClass::Rcc, Some(number), timeout);
            }
        }
        Ok(())
    }

    pub(crate) fn close_all_transmit_channels(&mut self) -> CallResult<()> {
        for number in self.channels.numbers(ChannelDirection::Transmit) {
            let pending = self
                .channels
                .get(number, ChannelDirection::Transmit)
                .is_some_and(|c| c.state == ChannelState::ClosePending);
            if !pending {
                self.close_logical_channel(number, ChannelDirection::Transmit)?;
            }
        }
        Ok(())
    }

    /// Send our capability set again once the queued renegotiation can run
    fn renegotiate(&mut self) -> CallResult<()> {
        self.pending.retain(|p| *p != PendingAction::Renegotiate);
        info!(call = %self.token, "Renegotiating capabilities");
        self.tcs.local = LocalTcsState::Idle;
        self.send_capability_set()
    }

    /// CloseLogicalChannel from the remote closes our receive channel
    pub(crate) fn on_close_channel_request(
        &mut self,
        close: CloseLogicalChannel,
    ) -> CallResult<()> {
        let number = close.forward_logical_channel_number;
        if self.clear_channel(number, ChannelDirection::Receive).is_none() {
            warn!(call = %self.token, channel = number, "CloseLogicalChannel for unknown channel");
        }
        let ack = CloseLogicalChannelAck { forward_logical_channel_number: number };
        self.send_h245(H245Message::Response(ResponseMessage::CloseLogicalChannelAck(ack)))?;

        if self.has_pending_renegotiation()
            && !self.channels.has_direction(ChannelDirection::Transmit)
        {
            self.renegotiate()?;
        }
        Ok(())
    }

    pub(crate) fn on_close_channel_ack(&mut self, ack: CloseLogicalChannelAck) -> CallResult<()> {
        let number = ack.forward_logical_channel_number;
        if self.clear_channel(number, ChannelDirection::Transmit).is_none() {
            debug!(
                call = %self.token,
                channel = number,
                "CloseLogicalChannelAck for unknown channel"
            );
        }

        if self.has_pending_renegotiation()
            && !self.channels.has_direction(ChannelDirection::Receive)
        {
            self.renegotiate()
        } else if !self.channels.has_direction(ChannelDirection::Transmit) {
            self.open_channels_if_ready()
        } else {
            Ok(())
        }
    }

    /// RequestChannelClose from the remote asks us to close a transmit channel
    pub(crate) fn on_request_channel_close(
        &mut self,
        request: RequestChannelClose,
    ) -> CallResult<()> {
        let number = request.forward_logical_channel_number;
        let established = self
            .channels
            .get(number, ChannelDirection::Transmit)
            .map(|c| c.is_established());
        let Some(established) = established else {
            warn!(call = %self.token, channel = number, "RequestChannelClose for unknown channel");
            let reject = RequestChannelCloseReject {
                forward_logical_channel_number: number,
                cause: RccRejectCause::Unspecified,
            };
            return self.send_h245(H245Message::Response(
                ResponseMessage::RequestChannelCloseReject(reject),
            ));
        };
        let ack = RequestChannelCloseAck { forward_logical_channel_number: number };
        self.send_h245(H245Message::Response(ResponseMessage::RequestChannelCloseAck(ack)))?;
        if established {
            self.close_logical_channel(number, ChannelDirection::Transmit)?;
        }
        Ok(())
    }

    pub(crate) fn on_request_channel_close_ack(&mut self, ack: RequestChannelCloseAck) {
        let number = ack.forward_logical_channel_number;
        debug!(call = %self.token, channel = number, "RequestChannelClose acknowledged");
        self.clear_channel(number, ChannelDirection::Receive);
    }

    pub(crate) fn on_request_channel_close_reject(&mut self, reject: RequestChannelCloseReject) {
        let number = reject.forward_logical_channel_number;
        // The channel goes away even though the remote refused to close it
        warn!(
            call = %self.token,
            channel = number,
            cause = ?reject.cause,
            "RequestChannelClose rejected"
        );
        self.clear_channel(number, ChannelDirection::Receive);
    }

    pub(crate) fn on_request_channel_close_release(&self, release: RequestChannelCloseRelease) {
        debug!(
            call = %self.token,
            channel = release.forward_logical_channel_number,
            "RequestChannelCloseRelease received"
        );
    }

    // =====================================================================
    // Timers
    // =====================================================================

    pub(crate) fn on_olc_timeout(&mut self, number: ChannelNumber) -> CallResult<()> {
        let mut result = Ok(());
        if self.channels.contains(number, ChannelDirection::Transmit) {
            let close = CloseLogicalChannel {
                forward_logical_channel_number: number,
                source: ChannelCloseSource::Lcse,
                reason: ChannelCloseReason::Unknown,
            };
            let message = H245Message::Request(RequestMessage::CloseLogicalChannel(close));
            result = self.send_h245(message);
            self.clear_channel(number, ChannelDirection::Transmit);
        }
        self.clear_call(CallEndReason::LocalCleared);
        result
    }

    pub(crate) fn on_clc_timeout(&mut self, number: ChannelNumber) -> CallResult<()> {
        self.clear_channel(number, ChannelDirection::Transmit);
        self.clear_call(CallEndReason::LocalCleared);
        Ok(())
    }

    pub(crate) fn on_rcc_timeout(&mut self, number: ChannelNumber) -> CallResult<()> {
        let release = RequestChannelCloseRelease { forward_logical_channel_number: number };
        let result = self.send_h245(H245Message::Indication(
            IndicationMessage::RequestChannelCloseRelease(release),
        ));
        self.clear_channel(number, ChannelDirection::Receive);
        self.clear_call(CallEndReason::LocalCleared);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sessions() {
        assert_eq!(default_session_id(MediaKind::Audio), 1);
        assert_eq!(default_session_id(MediaKind::Video), 2);
        assert_eq!(default_session_id(MediaKind::Data), 3);
    }
}
