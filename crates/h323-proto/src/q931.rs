//! Q.931 call signaling messages with their H.225.0 user-user payload
//!
//! The Q.931 envelope (protocol discriminator, call reference, message type
//! and the handful of information elements H.323 uses) is framed here. The
//! H.323-UserInformation carried in the user-user IE is handed to a
//! [`MessageCodec`](crate::codec::MessageCodec) as an opaque buffer.

use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CodecError, Result};
use crate::h245::TransportAddress;

/// Q.931 protocol discriminator for call control messages
pub const Q931_PROTOCOL_DISCRIMINATOR: u8 = 0x08;

/// User-user IE protocol discriminator: X.208/X.209 coded user information
const USER_USER_PROTOCOL: u8 = 0x05;

const IE_CAUSE: u8 = 0x08;
const IE_DISPLAY: u8 = 0x28;
const IE_CALLING_PARTY_NUMBER: u8 = 0x6c;
const IE_CALLED_PARTY_NUMBER: u8 = 0x70;
const IE_USER_USER: u8 = 0x7e;

/// Q.931 message types used by H.225.0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Q931MessageType {
    Alerting = 0x01,
    CallProceeding = 0x02,
    Progress = 0x03,
    Setup = 0x05,
    Connect = 0x07,
    SetupAck = 0x0d,
    ConnectAck = 0x0f,
    ReleaseComplete = 0x5a,
    Facility = 0x62,
    Notify = 0x6e,
    StatusEnquiry = 0x75,
    Information = 0x7b,
    Status = 0x7d,
}

impl Q931MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let t = match value {
            0x01 => Self::Alerting,
            0x02 => Self::CallProceeding,
            0x03 => Self::Progress,
            0x05 => Self::Setup,
            0x07 => Self::Connect,
            0x0d => Self::SetupAck,
            0x0f => Self::ConnectAck,
            0x5a => Self::ReleaseComplete,
            0x62 => Self::Facility,
            0x6e => Self::Notify,
            0x75 => Self::StatusEnquiry,
            0x7b => Self::Information,
            0x7d => Self::Status,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for Q931MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Alerting => "Alerting",
            Self::CallProceeding => "CallProceeding",
            Self::Progress => "Progress",
            Self::Setup => "Setup",
            Self::Connect => "Connect",
            Self::SetupAck => "SetupAck",
            Self::ConnectAck => "ConnectAck",
            Self::ReleaseComplete => "ReleaseComplete",
            Self::Facility => "Facility",
            Self::Notify => "Notify",
            Self::StatusEnquiry => "StatusEnquiry",
            Self::Information => "Information",
            Self::Status => "Status",
        };
        f.write_str(name)
    }
}

/// Q.931 cause values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Q931Cause {
    ErrorInCauseIe = 0x00,
    UnallocatedNumber = 0x01,
    NoRouteToNetwork = 0x02,
    NoRouteToDestination = 0x03,
    ChannelUnacceptable = 0x06,
    NormalCallClearing = 0x10,
    UserBusy = 0x11,
    NoResponse = 0x12,
    NoAnswer = 0x13,
    SubscriberAbsent = 0x14,
    CallRejected = 0x15,
    NumberChanged = 0x16,
    Redirection = 0x17,
    DestinationOutOfOrder = 0x1b,
    InvalidNumberFormat = 0x1c,
    StatusEnquiryResponse = 0x1e,
    NormalUnspecified = 0x1f,
    NoCircuitChannelAvailable = 0x22,
    NetworkOutOfOrder = 0x26,
    TemporaryFailure = 0x29,
    Congestion = 0x2a,
    RequestedCircuitUnavailable = 0x2c,
    ResourcesUnavailable = 0x2f,
    InvalidCallReference = 0x51,
    IncompatibleDestination = 0x58,
    RecoveryOnTimerExpiry = 0x66,
    ProtocolErrorUnspecified = 0x6f,
}

impl Q931Cause {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let cause = match value {
            0x00 => Self::ErrorInCauseIe,
            0x01 => Self::UnallocatedNumber,
            0x02 => Self::NoRouteToNetwork,
            0x03 => Self::NoRouteToDestination,
            0x06 => Self::ChannelUnacceptable,
            0x10 => Self::NormalCallClearing,
            0x11 => Self::UserBusy,
            0x12 => Self::NoResponse,
            0x13 => Self::NoAnswer,
            0x14 => Self::SubscriberAbsent,
            0x15 => Self::CallRejected,
            0x16 => Self::NumberChanged,
            0x17 => Self::Redirection,
            0x1b => Self::DestinationOutOfOrder,
            0x1c => Self::InvalidNumberFormat,
            0x1e => Self::StatusEnquiryResponse,
            0x1f => Self::NormalUnspecified,
            0x22 => Self::NoCircuitChannelAvailable,
            0x26 => Self::NetworkOutOfOrder,
            0x29 => Self::TemporaryFailure,
            0x2a => Self::Congestion,
            0x2c => Self::RequestedCircuitUnavailable,
            0x2f => Self::ResourcesUnavailable,
            0x51 => Self::InvalidCallReference,
            0x58 => Self::IncompatibleDestination,
            0x66 => Self::RecoveryOnTimerExpiry,
            0x6f => Self::ProtocolErrorUnspecified,
            _ => return None,
        };
        Some(cause)
    }
}

/// H.225.0 ReleaseComplete reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseCompleteReason {
    NoBandwidth,
    GatekeeperResources,
    UnreachableDestination,
    DestinationRejection,
    InvalidRevision,
    NoPermission,
    UnreachableGatekeeper,
    GatewayResources,
    BadFormatAddress,
    AdaptiveBusy,
    InConf,
    UndefinedReason,
    FacilityCallDeflection,
    SecurityDenied,
    CalledPartyNotRegistered,
    CallerNotRegistered,
}

/// H.225.0 Facility reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FacilityReason {
    RouteCallToGatekeeper,
    CallForwarded,
    RouteCallToMc,
    Undefined,
    ConferenceListChoice,
    StartH245,
    NoH245,
    NewTokens,
    FeatureSetUpdate,
    ForwardedElements,
    TransportedInformation,
}

/// H.225.0 alias address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AliasAddress {
    DialedDigits(String),
    H323Id(String),
    Url(String),
    Email(String),
    TransportId(SocketAddr),
}

impl AliasAddress {
    pub fn dialed_digits(&self) -> Option<&str> {
        match self {
            AliasAddress::DialedDigits(d) => Some(d),
            _ => None,
        }
    }

    pub fn h323_id(&self) -> Option<&str> {
        match self {
            AliasAddress::H323Id(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupUuie {
    pub call_identifier: Uuid,
    pub conference_id: Uuid,
    pub source_address: Vec<AliasAddress>,
    pub destination_address: Vec<AliasAddress>,
    pub source_call_signal_address: Option<TransportAddress>,
    pub destination_call_signal_address: Option<TransportAddress>,
    pub h245_address: Option<TransportAddress>,
    /// Encoded OpenLogicalChannel proposals
    pub fast_start: Vec<Bytes>,
    pub media_wait_for_connect: bool,
}

/// Body shared by CallProceeding, Alerting and Progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallProgressUuie {
    pub call_identifier: Option<Uuid>,
    pub h245_address: Option<TransportAddress>,
    pub fast_start: Vec<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectUuie {
    pub call_identifier: Option<Uuid>,
    pub conference_id: Option<Uuid>,
    pub h245_address: Option<TransportAddress>,
    pub fast_start: Vec<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationUuie {
    pub call_identifier: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCompleteUuie {
    pub call_identifier: Option<Uuid>,
    pub reason: Option<ReleaseCompleteReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityUuie {
    pub call_identifier: Option<Uuid>,
    pub reason: FacilityReason,
    pub alternative_address: Option<TransportAddress>,
    pub alternative_alias_address: Vec<AliasAddress>,
    pub h245_address: Option<TransportAddress>,
    pub fast_start: Vec<Bytes>,
}

impl FacilityUuie {
    pub fn new(reason: FacilityReason) -> Self {
        Self {
            call_identifier: None,
            reason,
            alternative_address: None,
            alternative_alias_address: Vec::new(),
            h245_address: None,
            fast_start: Vec::new(),
        }
    }
}

/// H.323-UU-PDU message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum H323MessageBody {
    Setup(SetupUuie),
    CallProceeding(CallProgressUuie),
    Connect(ConnectUuie),
    Alerting(CallProgressUuie),
    Information(InformationUuie),
    ReleaseComplete(ReleaseCompleteUuie),
    Facility(FacilityUuie),
    Progress(CallProgressUuie),
    Empty,
    Status,
    StatusInquiry,
    SetupAcknowledge,
    Notify,
}

/// H.323-UserInformation carried in the user-user IE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct H323UserInformation {
    pub body: H323MessageBody,
    /// `None` when the h245Tunneling field is absent
    pub h245_tunneling: Option<bool>,
    /// Encoded H.245 messages tunneled in this PDU
    pub h245_control: Vec<Bytes>,
}

impl H323UserInformation {
    pub fn new(body: H323MessageBody) -> Self {
        Self { body, h245_tunneling: None, h245_control: Vec::new() }
    }

    /// Fast start elements of the body, if the body can carry any
    pub fn fast_start(&self) -> &[Bytes] {
        match &self.body {
            H323MessageBody::Setup(b) => &b.fast_start,
            H323MessageBody::CallProceeding(b)
            | H323MessageBody::Alerting(b)
            | H323MessageBody::Progress(b) => &b.fast_start,
            H323MessageBody::Connect(b) => &b.fast_start,
            H323MessageBody::Facility(b) => &b.fast_start,
            _ => &[],
        }
    }

    /// Separate H.245 address offered by the body
    pub fn h245_address(&self) -> Option<TransportAddress> {
        match &self.body {
            H323MessageBody::Setup(b) => b.h245_address,
            H323MessageBody::CallProceeding(b)
            | H323MessageBody::Alerting(b)
            | H323MessageBody::Progress(b) => b.h245_address,
            H323MessageBody::Connect(b) => b.h245_address,
            H323MessageBody::Facility(b) => b.h245_address,
            _ => None,
        }
    }
}

/// A Q.931 message as exchanged on the H.225.0 call signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Q931Message {
    pub call_reference: u16,
    /// Call reference flag: set when sent by the side that did not originate the call
    pub from_destination: bool,
    pub message_type: Q931MessageType,
    /// Raw cause octet; the cause value is the low 7 bits
    pub cause: Option<u8>,
    pub display: Option<String>,
    pub calling_party_number: Option<String>,
    pub called_party_number: Option<String>,
    pub user_info: Option<H323UserInformation>,
}

impl Q931Message {
    pub fn new(message_type: Q931MessageType, call_reference: u16, from_destination: bool) -> Self {
        Self {
            call_reference,
            from_destination,
            message_type,
            cause: None,
            display: None,
            calling_party_number: None,
            called_party_number: None,
            user_info: None,
        }
    }

    pub fn with_user_info(mut self, user_info: H323UserInformation) -> Self {
        self.user_info = Some(user_info);
        self
    }

    pub fn with_cause(mut self, cause: Q931Cause) -> Self {
        self.cause = Some(0x80 | cause.value());
        self
    }

    pub fn body(&self) -> Option<&H323MessageBody> {
        self.user_info.as_ref().map(|u| &u.body)
    }
}

/// Frame the Q.931 envelope around an already encoded user-user payload
pub fn encode_frame(message: &Q931Message, user_user: Option<&[u8]>) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + user_user.map_or(0, <[u8]>::len));
    buf.put_u8(Q931_PROTOCOL_DISCRIMINATOR);
    buf.put_u8(2);
    let flag: u16 = if message.from_destination { 0x8000 } else { 0 };
    buf.put_u16((message.call_reference & 0x7fff) | flag);
    buf.put_u8(message.message_type.as_u8());

    if let Some(cause) = message.cause {
        buf.put_u8(IE_CAUSE);
        buf.put_u8(2);
        buf.put_u8(0x80);
        buf.put_u8(0x80 | (cause & 0x7f));
    }
    if let Some(display) = &message.display {
        put_short_ie(&mut buf, IE_DISPLAY, &[], display.as_bytes())?;
    }
    if let Some(number) = &message.calling_party_number {
        // numbering plan ISDN, presentation allowed
        put_short_ie(&mut buf, IE_CALLING_PARTY_NUMBER, &[0x01, 0x80], number.as_bytes())?;
    }
    if let Some(number) = &message.called_party_number {
        put_short_ie(&mut buf, IE_CALLED_PARTY_NUMBER, &[0x81], number.as_bytes())?;
    }
    if let Some(uu) = user_user {
        let len = uu.len() + 1;
        if len > u16::MAX as usize {
            return Err(CodecError::PayloadTooLarge(len));
        }
        buf.put_u8(IE_USER_USER);
        buf.put_u16(len as u16);
        buf.put_u8(USER_USER_PROTOCOL);
        buf.put_slice(uu);
    }
    Ok(buf.freeze())
}

fn put_short_ie(buf: &mut BytesMut, ie: u8, prefix: &[u8], content: &[u8]) -> Result<()> {
    let len = prefix.len() + content.len();
    if len > u8::MAX as usize {
        let detail = format!("IE {:#04x} too long ({} bytes)", ie, len);
        return Err(CodecError::encode("Q.931 IE", detail));
    }
    buf.put_u8(ie);
    buf.put_u8(len as u8);
    buf.put_slice(prefix);
    buf.put_slice(content);
    Ok(())
}

/// Parse the Q.931 envelope; returns the message (without user information)
/// and the raw user-user payload if one was present
pub fn decode_frame(data: &[u8]) -> Result<(Q931Message, Option<Bytes>)> {
    if data.len() < 3 {
        return Err(CodecError::MalformedQ931(format!("message too short ({} bytes)", data.len())));
    }
    if data[0] != Q931_PROTOCOL_DISCRIMINATOR {
        return Err(CodecError::MalformedQ931(format!(
            "unexpected protocol discriminator {:#04x}",
            data[0]
        )));
    }
    let cr_len = (data[1] & 0x0f) as usize;
    if cr_len > 2 || data.len() < 2 + cr_len + 1 {
        return Err(CodecError::MalformedQ931(format!("bad call reference length {}", cr_len)));
    }
    let (call_reference, from_destination) = match cr_len {
        0 => (0, false),
        1 => ((data[2] & 0x7f) as u16, data[2] & 0x80 != 0),
        _ => {
            let raw = u16::from_be_bytes([data[2], data[3]]);
            (raw & 0x7fff, raw & 0x8000 != 0)
        }
    };
    let mut pos = 2 + cr_len;
    let message_type =
        Q931MessageType::from_u8(data[pos]).ok_or(CodecError::UnknownMessageType(data[pos]))?;
    pos += 1;

    let mut message = Q931Message::new(message_type, call_reference, from_destination);
    let mut user_user = None;

    while pos < data.len() {
        let ie = data[pos];
        pos += 1;
        if ie & 0x80 != 0 {
            // single octet IE
            continue;
        }
        let len = if ie == IE_USER_USER {
            if pos + 2 > data.len() {
                return Err(CodecError::MalformedQ931("truncated user-user length".to_string()));
            }
            let l = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            l
        } else {
            let l = *data
                .get(pos)
                .ok_or_else(|| CodecError::MalformedQ931("truncated IE length".to_string()))?
                as usize;
            pos += 1;
            l
        };
        if pos + len > data.len() {
            return Err(CodecError::MalformedQ931(format!("IE {:#04x} overruns message", ie)));
        }
        let content = &data[pos..pos + len];
        pos += len;

        match ie {
            IE_CAUSE => message.cause = content.last().copied(),
            IE_DISPLAY => message.display = Some(String::from_utf8_lossy(content).into_owned()),
            IE_CALLING_PARTY_NUMBER => {
                message.calling_party_number = Some(number_digits(content));
            }
            IE_CALLED_PARTY_NUMBER => {
                message.called_party_number = Some(number_digits(content));
            }
            IE_USER_USER => {
                if let Some((_, payload)) = content.split_first() {
                    user_user = Some(Bytes::copy_from_slice(payload));
                }
            }
            _ => {}
        }
    }

    Ok((message, user_user))
}

/// Skip the type/plan octet (and octet 3a when the extension bit is clear)
fn number_digits(content: &[u8]) -> String {
    let skip = match content.first() {
        Some(b) if b & 0x80 == 0 => 2,
        Some(_) => 1,
        None => 0,
    };
    String::from_utf8_lossy(content.get(skip..).unwrap_or(&[])).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(Q931MessageType::Setup.as_u8(), 0x05);
        assert_eq!(Q931MessageType::CallProceeding.as_u8(), 0x02);
        assert_eq!(Q931MessageType::Alerting.as_u8(), 0x01);
        assert_eq!(Q931MessageType::Connect.as_u8(), 0x07);
        assert_eq!(Q931MessageType::Facility.as_u8(), 0x62);
        assert_eq!(Q931MessageType::ReleaseComplete.as_u8(), 0x5a);
        assert_eq!(Q931MessageType::from_u8(0x5a), Some(Q931MessageType::ReleaseComplete));
        assert_eq!(Q931MessageType::from_u8(0x99), None);
    }

    #[test]
    fn test_frame_round_trip_with_ies() {
        let mut msg = Q931Message::new(Q931MessageType::ReleaseComplete, 0x1234, true)
            .with_cause(Q931Cause::NormalCallClearing);
        msg.display = Some("Alice".to_string());
        msg.calling_party_number = Some("5551000".to_string());
        msg.called_party_number = Some("5552000".to_string());

        let bytes = encode_frame(&msg, Some(b"payload")).unwrap();
        assert_eq!(bytes[0], Q931_PROTOCOL_DISCRIMINATOR);
        assert_eq!(bytes[4], 0x5a);

        let (decoded, uu) = decode_frame(&bytes).unwrap();
        assert_eq!(decoded.call_reference, 0x1234);
        assert!(decoded.from_destination);
        assert_eq!(decoded.cause.map(|c| c & 0x7f), Some(0x10));
        assert_eq!(decoded.display.as_deref(), Some("Alice"));
        assert_eq!(decoded.calling_party_number.as_deref(), Some("5551000"));
        assert_eq!(decoded.called_party_number.as_deref(), Some("5552000"));
        assert_eq!(uu.as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn test_decode_rejects_bad_discriminator() {
        let err = decode_frame(&[0x09, 0x02, 0x00, 0x01, 0x05]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedQ931(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = decode_frame(&[0x08, 0x02, 0x00, 0x01, 0x44]).unwrap_err();
        assert_eq!(err, CodecError::UnknownMessageType(0x44));
    }

    #[test]
    fn test_decode_rejects_overrun() {
        let err = decode_frame(&[0x08, 0x02, 0x00, 0x01, 0x05, 0x28, 0x10, b'a']).unwrap_err();
        assert!(matches!(err, CodecError::MalformedQ931(_)));
    }
}
