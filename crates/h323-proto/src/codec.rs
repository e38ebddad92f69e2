//! Codec seam between the call-control engine and the wire encoding
//!
//! The engine only ever talks to [`MessageCodec`]. [`JsonCodec`] is the
//! reference implementation: the Q.931 envelope is framed with real
//! information elements, while H.245 messages, H.323-UserInformation and
//! fast start elements are serialized with serde_json instead of ASN.1 PER.

use std::fmt;

use bytes::Bytes;
use tracing::trace;

use crate::error::{CodecError, Result};
use crate::h245::{H245Message, OpenLogicalChannel};
use crate::q931::{self, H323UserInformation, Q931Message};

/// Encoder/decoder for H.245 messages, Q.931 messages and fast start elements
pub trait MessageCodec: Send + Sync + fmt::Debug {
    fn encode_h245(&self, message: &H245Message) -> Result<Bytes>;

    fn decode_h245(&self, data: &[u8]) -> Result<H245Message>;

    fn encode_q931(&self, message: &Q931Message) -> Result<Bytes>;

    fn decode_q931(&self, data: &[u8]) -> Result<Q931Message>;

    fn encode_fast_start(&self, olc: &OpenLogicalChannel) -> Result<Bytes>;

    fn decode_fast_start(&self, data: &[u8]) -> Result<OpenLogicalChannel>;
}

/// serde_json based reference codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl MessageCodec for JsonCodec {
    fn encode_h245(&self, message: &H245Message) -> Result<Bytes> {
        let data = serde_json::to_vec(message)
            .map_err(|e| CodecError::encode("H.245 message", e.to_string()))?;
        trace!("Encoded H.245 {} ({} bytes)", message.name(), data.len());
        Ok(Bytes::from(data))
    }

    fn decode_h245(&self, data: &[u8]) -> Result<H245Message> {
        serde_json::from_slice(data).map_err(|e| CodecError::decode("H.245 message", e.to_string()))
    }

    fn encode_q931(&self, message: &Q931Message) -> Result<Bytes> {
        let user_user = match &message.user_info {
            Some(info) => Some(
                serde_json::to_vec(info)
                    .map_err(|e| CodecError::encode("H.323-UserInformation", e.to_string()))?,
            ),
            None => None,
        };
        let data = q931::encode_frame(message, user_user.as_deref())?;
        trace!("Encoded Q.931 {} ({} bytes)", message.message_type, data.len());
        Ok(data)
    }

    fn decode_q931(&self, data: &[u8]) -> Result<Q931Message> {
        let (mut message, user_user) = q931::decode_frame(data)?;
        if let Some(payload) = user_user {
            let info: H323UserInformation = serde_json::from_slice(&payload)
                .map_err(|e| CodecError::decode("H.323-UserInformation", e.to_string()))?;
            message.user_info = Some(info);
        }
        Ok(message)
    }

    fn encode_fast_start(&self, olc: &OpenLogicalChannel) -> Result<Bytes> {
        serde_json::to_vec(olc)
            .map(Bytes::from)
            .map_err(|e| CodecError::encode("fast start element", e.to_string()))
    }

    fn decode_fast_start(&self, data: &[u8]) -> Result<OpenLogicalChannel> {
        serde_json::from_slice(data)
            .map_err(|e| CodecError::decode("fast start element", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Codec, MediaFormat};
    use crate::h245::*;
    use crate::q931::*;
    use uuid::Uuid;

    #[test]
    fn test_h245_round_trip() {
        let codec = JsonCodec::new();
        let msd = MasterSlaveDetermination {
            terminal_type: 60,
            status_determination_number: 0x00ab_cdef,
        };
        let msg = H245Message::Request(RequestMessage::MasterSlaveDetermination(msd));
        let bytes = codec.encode_h245(&msg).unwrap();
        assert_eq!(codec.decode_h245(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_q931_with_tunneled_h245() {
        let codec = JsonCodec::new();
        let end_session = CommandMessage::EndSession(EndSessionCommand::Disconnect);
        let tunneled = codec.encode_h245(&H245Message::Command(end_session)).unwrap();
        let mut info = H323UserInformation::new(H323MessageBody::Facility(FacilityUuie::new(
            FacilityReason::TransportedInformation,
        )));
        info.h245_tunneling = Some(true);
        info.h245_control.push(tunneled.clone());

        let msg = Q931Message::new(Q931MessageType::Facility, 7, false).with_user_info(info);
        let bytes = codec.encode_q931(&msg).unwrap();
        let decoded = codec.decode_q931(&bytes).unwrap();
        assert_eq!(decoded, msg);
        let control = &decoded.user_info.unwrap().h245_control;
        assert!(codec.decode_h245(&control[0]).unwrap().is_end_session());
    }

    #[test]
    fn test_fast_start_element() {
        let codec = JsonCodec::new();
        let olc = OpenLogicalChannel {
            forward_logical_channel_number: 1001,
            forward_parameters: LogicalChannelParameters {
                data_type: DataType::Audio(MediaFormat::audio(Codec::G711Ulaw64k, 20)),
                multiplex_parameters: Some(H2250LogicalChannelParameters {
                    session_id: 1,
                    media_channel: None,
                    media_control_channel: Some(TransportAddress::Unicast(
                        "10.0.0.1:5001".parse().unwrap(),
                    )),
                }),
            },
            reverse_parameters: None,
        };
        let bytes = codec.encode_fast_start(&olc).unwrap();
        assert_eq!(codec.decode_fast_start(&bytes).unwrap(), olc);
        assert!(codec.decode_fast_start(b"not json").is_err());
    }

    #[test]
    fn test_setup_round_trip() {
        let codec = JsonCodec::new();
        let setup = SetupUuie {
            call_identifier: Uuid::new_v4(),
            conference_id: Uuid::new_v4(),
            source_address: vec![
                AliasAddress::H323Id("alice".into()),
                AliasAddress::DialedDigits("100".into()),
            ],
            destination_address: vec![AliasAddress::DialedDigits("200".into())],
            source_call_signal_address: Some(TransportAddress::Unicast(
                "10.0.0.1:1720".parse().unwrap(),
            )),
            destination_call_signal_address: None,
            h245_address: None,
            fast_start: Vec::new(),
            media_wait_for_connect: false,
        };
        let msg = Q931Message::new(Q931MessageType::Setup, 1, false)
            .with_user_info(H323UserInformation::new(H323MessageBody::Setup(setup)));
        let decoded = codec.decode_q931(&codec.encode_q931(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
