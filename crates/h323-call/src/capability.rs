//! Local capabilities and terminal capability set exchange
//!
//! ```text
//!  local:  Idle ──send──▶ Sent ──Ack──▶ AckRecvd
//!                          │
//!                          └─Reject / timeout──▶ Idle (+ Release, call cleared)
//!
//!  remote: Idle ──TCS──▶ Recvd ──Ack sent──▶ AckSent
//! ```
//!
//! Every accepted remote capability set is merged into the remote and joint
//! capability lists. A joint entry is the format this endpoint will use for
//! one direction: a remote receive capability becomes a joint transmit
//! entry, a remote transmit capability a joint receive entry.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rvoip_h323_proto::h245::{
    CommandMessage, IndicationMessage, RequestMessage, ResponseMessage, TcsRejectCause,
    TerminalCapabilitySet, TerminalCapabilitySetAck, TerminalCapabilitySetReject,
};
use rvoip_h323_proto::{
    CapabilityDescriptor, CapabilityDirection, CapabilityTableEntry, Codec, H245Capability,
    H245Message, MediaFormat, MediaKind, MediaParams, PictureFormat, UserInputCapability,
};

use crate::call::{
    CallRecord, ChannelDirection, LocalTcsState, MsdState, PendingAction, RemoteTcsState,
};
use crate::config::DtmfModes;
use crate::errors::{CallEndReason, CallError, CallResult};
use crate::timer::TimerClass;

/// Codec specific parameters of a local capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityParams {
    /// Frames per packet we accept and frames per packet we send
    Audio { rx_frames: u32, tx_frames: u32, silence_suppression: bool },
    Video { picture_format: PictureFormat, mpi: u32, max_bit_rate: u32 },
    T38,
}

/// One entry of the local capability list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub codec: Codec,
    pub direction: CapabilityDirection,
    pub params: CapabilityParams,
}

impl Capability {
    pub fn audio(
        codec: Codec,
        direction: CapabilityDirection,
        rx_frames: u32,
        tx_frames: u32,
    ) -> Self {
        Self {
            codec,
            direction,
            params: CapabilityParams::Audio { rx_frames, tx_frames, silence_suppression: false },
        }
    }

    pub fn video(
        codec: Codec,
        direction: CapabilityDirection,
        picture_format: PictureFormat,
        mpi: u32,
        max_bit_rate: u32,
    ) -> Self {
        Self {
            codec,
            direction,
            params: CapabilityParams::Video { picture_format, mpi, max_bit_rate },
        }
    }

    pub fn t38(direction: CapabilityDirection) -> Self {
        Self { codec: Codec::T38, direction, params: CapabilityParams::T38 }
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.media_kind()
    }

    /// Format advertised for receiving
    pub fn rx_format(&self) -> MediaFormat {
        match self.params {
            CapabilityParams::Audio { rx_frames, silence_suppression, .. } => MediaFormat {
                codec: self.codec,
                params: MediaParams::Audio { frames: rx_frames, silence_suppression },
            },
            CapabilityParams::Video { picture_format, mpi, max_bit_rate } => {
                MediaFormat::video(self.codec, picture_format, mpi, max_bit_rate)
            }
            CapabilityParams::T38 => MediaFormat::t38(),
        }
    }

    /// Format used when transmitting
    pub fn tx_format(&self) -> MediaFormat {
        match self.params {
            CapabilityParams::Audio { tx_frames, silence_suppression, .. } => MediaFormat {
                codec: self.codec,
                params: MediaParams::Audio { frames: tx_frames, silence_suppression },
            },
            _ => self.rx_format(),
        }
    }

    /// We can receive `format`: same codec and no more frames than we accept
    pub fn can_receive_format(&self, format: &MediaFormat) -> bool {
        if !self.direction.can_receive() || self.codec != format.codec {
            return false;
        }
        match (&self.params, format.frames()) {
            (CapabilityParams::Audio { rx_frames, .. }, Some(frames)) => *rx_frames >= frames,
            (CapabilityParams::Audio { .. }, None) => false,
            _ => true,
        }
    }

    /// We can transmit toward a receiver accepting `format`
    pub fn can_transmit_format(&self, format: &MediaFormat) -> bool {
        if !self.direction.can_transmit() || self.codec != format.codec {
            return false;
        }
        match (&self.params, format.frames()) {
            (CapabilityParams::Audio { tx_frames, .. }, Some(frames)) => *tx_frames <= frames,
            (CapabilityParams::Audio { .. }, None) => false,
            _ => true,
        }
    }

    pub fn validate(&self) -> CallResult<()> {
        let consistent = match (&self.params, self.kind()) {
            (CapabilityParams::Audio { rx_frames, tx_frames, .. }, MediaKind::Audio) => {
                *rx_frames > 0 && *tx_frames > 0
            }
            (CapabilityParams::Video { mpi, .. }, MediaKind::Video) => *mpi > 0,
            (CapabilityParams::T38, MediaKind::Data) => true,
            _ => false,
        };
        if consistent {
            Ok(())
        } else {
            Err(CallError::Configuration {
                message: format!(
                    "capability {} has parameters of the wrong kind or zero frames",
                    self.codec
                ),
            })
        }
    }
}

/// A format both endpoints agreed on, for one direction of this endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointCapability {
    pub format: MediaFormat,
    pub direction: ChannelDirection,
}

impl JointCapability {
    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }
}

/// Match one remote capability against the local list
///
/// Local preference order decides between several local candidates;
/// a remote capability that can go both ways tries transmit first.
pub fn joint_for_remote(
    local: &[Capability],
    remote_direction: CapabilityDirection,
    remote: &MediaFormat,
) -> Option<JointCapability> {
    let transmit = || {
        local.iter().find(|c| c.can_transmit_format(remote)).map(|c| JointCapability {
            format: c.tx_format(),
            direction: ChannelDirection::Transmit,
        })
    };
    let receive = || {
        local.iter().find(|c| c.can_receive_format(remote)).map(|_| JointCapability {
            format: remote.clone(),
            direction: ChannelDirection::Receive,
        })
    };
    match remote_direction {
        CapabilityDirection::Receive => transmit(),
        CapabilityDirection::Transmit => receive(),
        CapabilityDirection::ReceiveAndTransmit => transmit().or_else(receive),
    }
}

/// Build our capability set: one table entry per capability and DTMF mode,
/// one descriptor holding an alternative set per media kind
pub fn build_capability_set(
    sequence_number: u8,
    local: &[Capability],
    dtmf: DtmfModes,
) -> TerminalCapabilitySet {
    let mut table = Vec::new();
    let mut alternatives: Vec<(MediaKind, Vec<u16>)> = Vec::new();
    let mut user_input = Vec::new();

    for cap in local {
        let number = table.len() as u16 + 1;
        let format = if cap.direction == CapabilityDirection::Transmit {
            cap.tx_format()
        } else {
            cap.rx_format()
        };
        table.push(CapabilityTableEntry {
            number,
            capability: H245Capability::Media { direction: cap.direction, format },
        });
        match alternatives.iter_mut().find(|(kind, _)| *kind == cap.kind()) {
            Some((_, set)) => set.push(number),
            None => alternatives.push((cap.kind(), vec![number])),
        }
    }

    let modes = [
        (dtmf.h245_alphanumeric, UserInputCapability::BasicString),
        (dtmf.h245_signal, UserInputCapability::Dtmf),
    ];
    for (enabled, mode) in modes {
        if enabled {
            let number = table.len() as u16 + 1;
            let capability = H245Capability::ReceiveUserInput(mode);
            table.push(CapabilityTableEntry { number, capability });
            user_input.push(number);
        }
    }

    let mut simultaneous: Vec<Vec<u16>> = alternatives.into_iter().map(|(_, set)| set).collect();
    if !user_input.is_empty() {
        simultaneous.push(user_input);
    }

    TerminalCapabilitySet {
        sequence_number,
        capability_table: table,
        capability_descriptors: vec![CapabilityDescriptor {
            number: 1,
            simultaneous_capabilities: simultaneous,
        }],
    }
}

impl CallRecord {
    /// Send our capability set unless one is outstanding
    pub(crate) fn send_capability_set(&mut self) -> CallResult<()> {
        if self.tcs.local == LocalTcsState::Sent {
            debug!(call = %self.token, "Capability set already outstanding");
            return Ok(());
        }
        self.tcs.local_seq = self.tcs.local_seq.wrapping_add(1);
        let config = self.config_arc();
        let tcs = build_capability_set(self.tcs.local_seq, &config.capabilities, config.dtmf);
        info!(
            call = %self.token,
            "Sending TerminalCapabilitySet {} ({} entries)",
            tcs.sequence_number,
            tcs.capability_table.len()
        );
        self.send_h245(H245Message::Request(RequestMessage::TerminalCapabilitySet(tcs)))?;
        self.tcs.local = LocalTcsState::Sent;
        self.timers.arm(TimerClass::Tcs, None, config.timers.tcs());
        Ok(())
    }

    pub(crate) fn send_empty_capability_set(&mut self) -> CallResult<()> {
        self.tcs.local_seq = self.tcs.local_seq.wrapping_add(1);
        info!(call = %self.token, "Sending empty TerminalCapabilitySet {}", self.tcs.local_seq);
        let tcs = TerminalCapabilitySet::empty(self.tcs.local_seq);
        self.send_h245(H245Message::Request(RequestMessage::TerminalCapabilitySet(tcs)))
    }

    pub(crate) fn on_remote_capability_set(
        &mut self,
        tcs: TerminalCapabilitySet,
    ) -> CallResult<()> {
        let seq = tcs.sequence_number;
        if self.tcs.last_remote_seq.is_some_and(|last| seq <= last) {
            warn!(
                call = %self.token,
                "Rejecting stale TerminalCapabilitySet {} (last {:?})",
                seq,
                self.tcs.last_remote_seq
            );
            let reject = TerminalCapabilitySetReject {
                sequence_number: seq,
                cause: TcsRejectCause::Unspecified,
            };
            return self.send_h245(H245Message::Response(
                ResponseMessage::TerminalCapabilitySetReject(reject),
            ));
        }
        self.tcs.remote = RemoteTcsState::Recvd;
        self.tcs.last_remote_seq = Some(seq);

        if tcs.is_empty() {
            info!(
                call = %self.token,
                "Empty TerminalCapabilitySet {}, closing transmit channels", seq
            );
            self.send_capability_set_ack(seq)?;
            self.close_all_transmit_channels()?;
            if !self.pending.contains(&PendingAction::Renegotiate) {
                self.pending.push_back(PendingAction::Renegotiate);
            }
            return Ok(());
        }

        self.merge_remote_capabilities(&tcs.capability_table);
        debug!(
            call = %self.token,
            "Remote capabilities merged: {} remote, {} joint",
            self.remote_caps.len(),
            self.joint_caps.len()
        );
        self.send_capability_set_ack(seq)?;

        if self.tcs.local == LocalTcsState::Idle {
            self.send_capability_set()?;
        }
        if self.msd.state == MsdState::Idle {
            self.begin_msd()?;
        }
        self.open_channels_if_ready()
    }

    fn send_capability_set_ack(&mut self, sequence_number: u8) -> CallResult<()> {
        let ack = TerminalCapabilitySetAck { sequence_number };
        self.send_h245(H245Message::Response(ResponseMessage::TerminalCapabilitySetAck(ack)))?;
        self.tcs.remote = RemoteTcsState::AckSent;
        Ok(())
    }

    fn merge_remote_capabilities(&mut self, table: &[CapabilityTableEntry]) {
        let config = self.config_arc();
        let mut remote_dtmf = DtmfModes::default();

        for entry in table {
            match &entry.capability {
                H245Capability::Media { direction, format } => {
                    let joint = joint_for_remote(&config.capabilities, *direction, format);
                    if let Some(joint) = joint {
                        if !self.joint_caps.contains(&joint) {
                            debug!(
                                call = %self.token,
                                "Joint {} capability {}", joint.direction, joint.format.codec
                            );
                            self.joint_caps.push(joint);
                        }
                    }
                }
                H245Capability::ReceiveUserInput(UserInputCapability::BasicString) => {
                    remote_dtmf.h245_alphanumeric = true;
                }
                H245Capability::ReceiveUserInput(UserInputCapability::Dtmf) => {
                    remote_dtmf.h245_signal = true;
                }
            }
            if !self.remote_caps.contains(&entry.capability) {
                self.remote_caps.push(entry.capability.clone());
            }
        }

        let joint_dtmf = config.dtmf.intersect(remote_dtmf);
        self.joint_dtmf = DtmfModes {
            h245_alphanumeric: self.joint_dtmf.h245_alphanumeric || joint_dtmf.h245_alphanumeric,
            h245_signal: self.joint_dtmf.h245_signal || joint_dtmf.h245_signal,
        };
        self.flags.t38_supported =
            config.supports_t38() && self.joint_caps.iter().any(|j| j.format.codec == Codec::T38);
    }

    pub(crate) fn on_capability_set_ack(
        &mut self,
        ack: TerminalCapabilitySetAck,
    ) -> CallResult<()> {
        if ack.sequence_number != self.tcs.local_seq {
            debug!(
                call = %self.token,
                "Ignoring TerminalCapabilitySetAck {} (sent {})",
                ack.sequence_number,
                self.tcs.local_seq
            );
            return Ok(());
        }
        self.timers.cancel_class(TimerClass::Tcs, None);
        self.tcs.local = LocalTcsState::AckRecvd;
        debug!(call = %self.token, "Capability set {} acknowledged", ack.sequence_number);
        self.open_channels_if_ready()
    }

    pub(crate) fn on_capability_set_reject(
        &mut self,
        reject: TerminalCapabilitySetReject,
    ) -> CallResult<()> {
        if reject.sequence_number != self.tcs.local_seq {
            debug!(
                call = %self.token,
                "Ignoring TerminalCapabilitySetReject {}", reject.sequence_number
            );
            return Ok(());
        }
        warn!(call = %self.token, cause = ?reject.cause, "Capability set rejected");
        self.timers.cancel_class(TimerClass::Tcs, None);
        self.tcs.local = LocalTcsState::Idle;
        let release = H245Message::Indication(IndicationMessage::TerminalCapabilitySetRelease);
        let result = self.send_h245(release);
        self.clear_call(CallEndReason::NoCommonCapabilities);
        result
    }

    pub(crate) fn on_capability_set_release(&mut self) {
        debug!(call = %self.token, "Remote released its capability set");
        self.tcs.remote = RemoteTcsState::Idle;
    }

    pub(crate) fn on_tcs_timeout(&mut self) -> CallResult<()> {
        self.tcs.local = LocalTcsState::Idle;
        let release = H245Message::Indication(IndicationMessage::TerminalCapabilitySetRelease);
        let result = self.send_h245(release);
        self.clear_call(CallEndReason::LocalCleared);
        result
    }

    pub(crate) fn on_send_capability_set_command(&mut self) {
        let name = CommandMessage::SendTerminalCapabilitySet.name();
        info!(call = %self.token, "{} received, not handled", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g711(direction: CapabilityDirection) -> Capability {
        Capability::audio(Codec::G711Ulaw64k, direction, 20, 20)
    }

    #[test]
    fn test_remote_receive_becomes_joint_transmit() {
        let local = vec![g711(CapabilityDirection::ReceiveAndTransmit)];
        let remote = MediaFormat::audio(Codec::G711Ulaw64k, 30);

        let joint = joint_for_remote(&local, CapabilityDirection::Receive, &remote).unwrap();
        assert_eq!(joint.direction, ChannelDirection::Transmit);
        // We send our own packetization, which fits the remote's limit
        assert_eq!(joint.format.frames(), Some(20));
    }

    #[test]
    fn test_frames_limit_applies() {
        let local = vec![g711(CapabilityDirection::ReceiveAndTransmit)];
        let small = MediaFormat::audio(Codec::G711Ulaw64k, 10);

        // Remote can only receive 10 frames, we send 20
        assert!(joint_for_remote(&local, CapabilityDirection::Receive, &small).is_none());
        // Remote sends 10 frames, we accept up to 20
        let joint = joint_for_remote(&local, CapabilityDirection::Transmit, &small).unwrap();
        assert_eq!(joint.direction, ChannelDirection::Receive);
        assert_eq!(joint.format, small);
    }

    #[test]
    fn test_rxtx_falls_back_to_receive() {
        let local = vec![g711(CapabilityDirection::Receive)];
        let remote = MediaFormat::audio(Codec::G711Ulaw64k, 20);
        let joint =
            joint_for_remote(&local, CapabilityDirection::ReceiveAndTransmit, &remote).unwrap();
        assert_eq!(joint.direction, ChannelDirection::Receive);
    }

    #[test]
    fn test_codec_mismatch() {
        let local = vec![g711(CapabilityDirection::ReceiveAndTransmit)];
        let remote = MediaFormat::audio(Codec::G729, 2);
        let joint = joint_for_remote(&local, CapabilityDirection::ReceiveAndTransmit, &remote);
        assert!(joint.is_none());
    }

    #[test]
    fn test_t38_matches_on_codec() {
        let local = vec![Capability::t38(CapabilityDirection::ReceiveAndTransmit)];
        let joint =
            joint_for_remote(&local, CapabilityDirection::Receive, &MediaFormat::t38()).unwrap();
        assert_eq!(joint.kind(), MediaKind::Data);
    }

    #[test]
    fn test_build_capability_set() {
        let local = vec![
            g711(CapabilityDirection::ReceiveAndTransmit),
            Capability::audio(Codec::G729, CapabilityDirection::Transmit, 4, 2),
            Capability::t38(CapabilityDirection::ReceiveAndTransmit),
        ];
        let dtmf = DtmfModes { h245_alphanumeric: false, h245_signal: true };
        let tcs = build_capability_set(7, &local, dtmf);

        assert_eq!(tcs.sequence_number, 7);
        assert_eq!(tcs.capability_table.len(), 4);
        assert_eq!(tcs.capability_table[0].number, 1);
        match &tcs.capability_table[1].capability {
            H245Capability::Media { format, .. } => assert_eq!(format.frames(), Some(2)),
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(
            tcs.capability_table[3].capability,
            H245Capability::ReceiveUserInput(UserInputCapability::Dtmf)
        );
        assert_eq!(tcs.capability_descriptors.len(), 1);
        assert_eq!(
            tcs.capability_descriptors[0].simultaneous_capabilities,
            vec![vec![1, 2], vec![3], vec![4]]
        );
    }

    #[test]
    fn test_validate() {
        assert!(g711(CapabilityDirection::Receive).validate().is_ok());
        let zero_frames = Capability::audio(Codec::G729, CapabilityDirection::Receive, 0, 2);
        assert!(zero_frames.validate().is_err());
        let wrong = Capability {
            codec: Codec::H263,
            direction: CapabilityDirection::Receive,
            params: CapabilityParams::T38,
        };
        assert!(wrong.validate().is_err());
    }
}
