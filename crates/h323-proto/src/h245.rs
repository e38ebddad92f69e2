//! H.245 control messages
//!
//! Every MultimediaSystemControlMessage is one of four classes (request,
//! response, command, indication). Each class is a tagged enum over the
//! concrete message bodies the call-control engine understands, so dispatch
//! sites are checked for exhaustiveness by the compiler.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityDescriptor, CapabilityTableEntry, MediaFormat, MediaKind};

/// Logical channel number as carried on the wire
pub type ChannelNumber = u16;

/// Top level H.245 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum H245Message {
    Request(RequestMessage),
    Response(ResponseMessage),
    Command(CommandMessage),
    Indication(IndicationMessage),
}

impl H245Message {
    /// Short name of the message for logging
    pub fn name(&self) -> &'static str {
        match self {
            H245Message::Request(r) => r.name(),
            H245Message::Response(r) => r.name(),
            H245Message::Command(c) => c.name(),
            H245Message::Indication(i) => i.name(),
        }
    }

    pub fn is_end_session(&self) -> bool {
        matches!(self, H245Message::Command(CommandMessage::EndSession(_)))
    }

    /// Logical channel the message refers to, if any
    pub fn channel_number(&self) -> Option<ChannelNumber> {
        use IndicationMessage as I;
        use RequestMessage as Req;
        use ResponseMessage as Resp;

        let number = match self {
            Self::Request(Req::OpenLogicalChannel(m)) => m.forward_logical_channel_number,
            Self::Request(Req::CloseLogicalChannel(m)) => m.forward_logical_channel_number,
            Self::Request(Req::RequestChannelClose(m)) => m.forward_logical_channel_number,
            Self::Response(Resp::OpenLogicalChannelAck(m)) => m.forward_logical_channel_number,
            Self::Response(Resp::OpenLogicalChannelReject(m)) => m.forward_logical_channel_number,
            Self::Response(Resp::CloseLogicalChannelAck(m)) => m.forward_logical_channel_number,
            Self::Response(Resp::RequestChannelCloseAck(m)) => m.forward_logical_channel_number,
            Self::Response(Resp::RequestChannelCloseReject(m)) => m.forward_logical_channel_number,
            Self::Indication(I::RequestChannelCloseRelease(m)) => m.forward_logical_channel_number,
            Self::Indication(I::OpenLogicalChannelConfirm(m)) => m.forward_logical_channel_number,
            _ => return None,
        };
        Some(number)
    }
}

impl fmt::Display for H245Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =========================================================================
// Requests
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestMessage {
    MasterSlaveDetermination(MasterSlaveDetermination),
    TerminalCapabilitySet(TerminalCapabilitySet),
    OpenLogicalChannel(OpenLogicalChannel),
    CloseLogicalChannel(CloseLogicalChannel),
    RequestChannelClose(RequestChannelClose),
    RequestMode(RequestMode),
    RoundTripDelayRequest(RoundTripDelay),
    /// Requests this stack does not implement (multiplex entry, maintenance loop, ...)
    Unsupported(String),
}

impl RequestMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MasterSlaveDetermination(_) => "MasterSlaveDetermination",
            Self::TerminalCapabilitySet(_) => "TerminalCapabilitySet",
            Self::OpenLogicalChannel(_) => "OpenLogicalChannel",
            Self::CloseLogicalChannel(_) => "CloseLogicalChannel",
            Self::RequestChannelClose(_) => "RequestChannelClose",
            Self::RequestMode(_) => "RequestMode",
            Self::RoundTripDelayRequest(_) => "RoundTripDelayRequest",
            Self::Unsupported(_) => "UnsupportedRequest",
        }
    }
}

/// Master-slave determination request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSlaveDetermination {
    pub terminal_type: u8,
    /// 24-bit random status determination number
    pub status_determination_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCapabilitySet {
    pub sequence_number: u8,
    pub capability_table: Vec<CapabilityTableEntry>,
    pub capability_descriptors: Vec<CapabilityDescriptor>,
}

impl TerminalCapabilitySet {
    /// An empty set carries no capability table; it asks the peer to close
    /// its transmit channels and renegotiate.
    pub fn empty(sequence_number: u8) -> Self {
        Self { sequence_number, capability_table: Vec::new(), capability_descriptors: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.capability_table.is_empty()
    }
}

/// Transport address used for media, media control and H.245 endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportAddress {
    Unicast(SocketAddr),
    Multicast(SocketAddr),
}

impl TransportAddress {
    pub fn unicast(&self) -> Option<SocketAddr> {
        match self {
            TransportAddress::Unicast(addr) => Some(*addr),
            TransportAddress::Multicast(_) => None,
        }
    }
}

/// Data type of a logical channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    NonStandard,
    Null,
    Video(MediaFormat),
    Audio(MediaFormat),
    Data(MediaFormat),
    Encryption,
    H235Control,
    H235Media,
    MultiplexedStream,
    RedundancyEncoding,
    MultiplePayloadStream,
    Fec,
}

impl DataType {
    /// Media kind for the data types a channel can actually carry
    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            DataType::Audio(_) => Some(MediaKind::Audio),
            DataType::Video(_) => Some(MediaKind::Video),
            DataType::Data(_) => Some(MediaKind::Data),
            _ => None,
        }
    }

    pub fn format(&self) -> Option<&MediaFormat> {
        match self {
            DataType::Audio(f) | DataType::Video(f) | DataType::Data(f) => Some(f),
            _ => None,
        }
    }

    pub fn from_format(format: MediaFormat) -> Self {
        match format.kind() {
            MediaKind::Audio => DataType::Audio(format),
            MediaKind::Video => DataType::Video(format),
            MediaKind::Data => DataType::Data(format),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::NonStandard => "nonStandard",
            DataType::Null => "nullData",
            DataType::Video(_) => "videoData",
            DataType::Audio(_) => "audioData",
            DataType::Data(_) => "data",
            DataType::Encryption => "encryptionData",
            DataType::H235Control => "h235Control",
            DataType::H235Media => "h235Media",
            DataType::MultiplexedStream => "multiplexedStream",
            DataType::RedundancyEncoding => "redundancyEncoding",
            DataType::MultiplePayloadStream => "multiplePayloadStream",
            DataType::Fec => "fec",
        }
    }
}

/// H.225.0 logical channel parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2250LogicalChannelParameters {
    pub session_id: u8,
    pub media_channel: Option<TransportAddress>,
    pub media_control_channel: Option<TransportAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalChannelParameters {
    pub data_type: DataType,
    pub multiplex_parameters: Option<H2250LogicalChannelParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenLogicalChannel {
    pub forward_logical_channel_number: ChannelNumber,
    pub forward_parameters: LogicalChannelParameters,
    pub reverse_parameters: Option<LogicalChannelParameters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCloseSource {
    User,
    Lcse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCloseReason {
    Unknown,
    Normal,
    ReopeningChannel,
    ReservationFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseLogicalChannel {
    pub forward_logical_channel_number: ChannelNumber,
    pub source: ChannelCloseSource,
    pub reason: ChannelCloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestChannelClose {
    pub forward_logical_channel_number: ChannelNumber,
    pub reason: ChannelCloseReason,
}

/// Mode element requested through RequestMode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeElement {
    Audio,
    Video,
    T38Fax,
    OtherData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMode {
    pub sequence_number: u8,
    /// Mode descriptions in preference order, each a list of elements
    pub requested_modes: Vec<Vec<ModeElement>>,
}

impl RequestMode {
    /// First element of the most preferred mode
    pub fn preferred_element(&self) -> Option<ModeElement> {
        self.requested_modes.first().and_then(|m| m.first()).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTripDelay {
    pub sequence_number: u8,
}

// =========================================================================
// Responses
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMessage {
    MasterSlaveDeterminationAck(MasterSlaveDeterminationAck),
    MasterSlaveDeterminationReject(MasterSlaveDeterminationReject),
    TerminalCapabilitySetAck(TerminalCapabilitySetAck),
    TerminalCapabilitySetReject(TerminalCapabilitySetReject),
    OpenLogicalChannelAck(OpenLogicalChannelAck),
    OpenLogicalChannelReject(OpenLogicalChannelReject),
    CloseLogicalChannelAck(CloseLogicalChannelAck),
    RequestChannelCloseAck(RequestChannelCloseAck),
    RequestChannelCloseReject(RequestChannelCloseReject),
    RequestModeAck(RequestModeAck),
    RequestModeReject(RequestModeReject),
    RoundTripDelayResponse(RoundTripDelay),
    Unsupported(String),
}

impl ResponseMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MasterSlaveDeterminationAck(_) => "MasterSlaveDeterminationAck",
            Self::MasterSlaveDeterminationReject(_) => "MasterSlaveDeterminationReject",
            Self::TerminalCapabilitySetAck(_) => "TerminalCapabilitySetAck",
            Self::TerminalCapabilitySetReject(_) => "TerminalCapabilitySetReject",
            Self::OpenLogicalChannelAck(_) => "OpenLogicalChannelAck",
            Self::OpenLogicalChannelReject(_) => "OpenLogicalChannelReject",
            Self::CloseLogicalChannelAck(_) => "CloseLogicalChannelAck",
            Self::RequestChannelCloseAck(_) => "RequestChannelCloseAck",
            Self::RequestChannelCloseReject(_) => "RequestChannelCloseReject",
            Self::RequestModeAck(_) => "RequestModeAck",
            Self::RequestModeReject(_) => "RequestModeReject",
            Self::RoundTripDelayResponse(_) => "RoundTripDelayResponse",
            Self::Unsupported(_) => "UnsupportedResponse",
        }
    }
}

/// Role assigned to the receiver of a MasterSlaveDeterminationAck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsdDecision {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSlaveDeterminationAck {
    pub decision: MsdDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsdRejectCause {
    IdenticalNumbers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSlaveDeterminationReject {
    pub cause: MsdRejectCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCapabilitySetAck {
    pub sequence_number: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcsRejectCause {
    Unspecified,
    UndefinedTableEntryUsed,
    DescriptorCapacityExceeded,
    TableEntryCapacityExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCapabilitySetReject {
    pub sequence_number: u8,
    pub cause: TcsRejectCause,
}

/// H.225.0 acknowledgement parameters of an OpenLogicalChannelAck
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2250LogicalChannelAckParameters {
    pub session_id: Option<u8>,
    pub media_channel: Option<TransportAddress>,
    pub media_control_channel: Option<TransportAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenLogicalChannelAck {
    pub forward_logical_channel_number: ChannelNumber,
    pub forward_multiplex_ack_parameters: Option<H2250LogicalChannelAckParameters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OlcRejectCause {
    Unspecified,
    UnsuitableReverseParameters,
    DataTypeNotSupported,
    DataTypeNotAvailable,
    UnknownDataType,
    DataTypeAlCombinationNotSupported,
    MulticastChannelNotAllowed,
    InsufficientBandwidth,
    SeparateStackEstablishmentFailed,
    InvalidSessionId,
    MasterSlaveConflict,
    WaitForCommunicationMode,
    InvalidDependentChannel,
    ReplacementForRejected,
    SecurityDenied,
}

impl fmt::Display for OlcRejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unspecified => "unspecified",
            Self::UnsuitableReverseParameters => "unsuitableReverseParameters",
            Self::DataTypeNotSupported => "dataTypeNotSupported",
            Self::DataTypeNotAvailable => "dataTypeNotAvailable",
            Self::UnknownDataType => "unknownDataType",
            Self::DataTypeAlCombinationNotSupported => "dataTypeALCombinationNotSupported",
            Self::MulticastChannelNotAllowed => "multicastChannelNotAllowed",
            Self::InsufficientBandwidth => "insufficientBandwidth",
            Self::SeparateStackEstablishmentFailed => "separateStackEstablishmentFailed",
            Self::InvalidSessionId => "invalidSessionID",
            Self::MasterSlaveConflict => "masterSlaveConflict",
            Self::WaitForCommunicationMode => "waitForCommunicationMode",
            Self::InvalidDependentChannel => "invalidDependentChannel",
            Self::ReplacementForRejected => "replacementForRejected",
            Self::SecurityDenied => "securityDenied",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenLogicalChannelReject {
    pub forward_logical_channel_number: ChannelNumber,
    pub cause: OlcRejectCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseLogicalChannelAck {
    pub forward_logical_channel_number: ChannelNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestChannelCloseAck {
    pub forward_logical_channel_number: ChannelNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RccRejectCause {
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestChannelCloseReject {
    pub forward_logical_channel_number: ChannelNumber,
    pub cause: RccRejectCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestModeResponse {
    WillTransmitMostPreferredMode,
    WillTransmitLessPreferredMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestModeAck {
    pub sequence_number: u8,
    pub response: RequestModeResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestModeRejectCause {
    ModeUnavailable,
    MultipointConstraint,
    RequestDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestModeReject {
    pub sequence_number: u8,
    pub cause: RequestModeRejectCause,
}

// =========================================================================
// Commands
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandMessage {
    EndSession(EndSessionCommand),
    SendTerminalCapabilitySet,
    FlowControl(FlowControlCommand),
    Unsupported(String),
}

impl CommandMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EndSession(_) => "EndSessionCommand",
            Self::SendTerminalCapabilitySet => "SendTerminalCapabilitySet",
            Self::FlowControl(_) => "FlowControlCommand",
            Self::Unsupported(_) => "UnsupportedCommand",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndSessionCommand {
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControlScope {
    LogicalChannel(ChannelNumber),
    WholeMultiplex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlCommand {
    pub scope: FlowControlScope,
    /// Maximum bit rate in units of 100 bit/s; `None` lifts the restriction
    pub maximum_bit_rate: Option<u32>,
}

// =========================================================================
// Indications
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicationMessage {
    MasterSlaveDeterminationRelease,
    TerminalCapabilitySetRelease,
    OpenLogicalChannelConfirm(OpenLogicalChannelConfirm),
    RequestChannelCloseRelease(RequestChannelCloseRelease),
    RequestModeRelease,
    UserInput(UserInputIndication),
    FunctionNotUnderstood,
    Unsupported(String),
}

impl IndicationMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MasterSlaveDeterminationRelease => "MasterSlaveDeterminationRelease",
            Self::TerminalCapabilitySetRelease => "TerminalCapabilitySetRelease",
            Self::OpenLogicalChannelConfirm(_) => "OpenLogicalChannelConfirm",
            Self::RequestChannelCloseRelease(_) => "RequestChannelCloseRelease",
            Self::RequestModeRelease => "RequestModeRelease",
            Self::UserInput(_) => "UserInputIndication",
            Self::FunctionNotUnderstood => "FunctionNotUnderstood",
            Self::Unsupported(_) => "UnsupportedIndication",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenLogicalChannelConfirm {
    pub forward_logical_channel_number: ChannelNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestChannelCloseRelease {
    pub forward_logical_channel_number: ChannelNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserInputIndication {
    Alphanumeric(String),
    Signal(UserInputSignal),
    NonStandard,
}

/// DTMF signal relayed over H.245
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInputSignal {
    pub signal_type: String,
    /// Duration in milliseconds
    pub duration: Option<u32>,
    /// RTP timestamp of the tone start
    pub rtp_timestamp: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_names() {
        let msg = H245Message::Command(CommandMessage::EndSession(EndSessionCommand::Disconnect));
        assert!(msg.is_end_session());
        assert_eq!(msg.name(), "EndSessionCommand");

        let ack = CloseLogicalChannelAck { forward_logical_channel_number: 1005 };
        let ack = H245Message::Response(ResponseMessage::CloseLogicalChannelAck(ack));
        assert!(!ack.is_end_session());
        assert_eq!(ack.channel_number(), Some(1005));
    }

    #[test]
    fn test_data_type_kinds() {
        assert_eq!(DataType::H235Media.media_kind(), None);
        assert_eq!(DataType::Null.format(), None);
        let format = MediaFormat::audio(crate::capability::Codec::G711Ulaw64k, 20);
        let audio = DataType::from_format(format);
        assert_eq!(audio.media_kind(), Some(MediaKind::Audio));
        assert_eq!(audio.name(), "audioData");
    }

    #[test]
    fn test_empty_tcs() {
        let tcs = TerminalCapabilitySet::empty(4);
        assert!(tcs.is_empty());
        assert_eq!(tcs.sequence_number, 4);
    }
}
