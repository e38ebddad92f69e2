//! Capability descriptions shared by terminal capability tables, logical
//! channel data types and the endpoint's own capability list.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of media a capability or channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
    Data,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Data => write!(f, "data"),
        }
    }
}

/// Codecs understood by the capability negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    G711Alaw64k,
    G711Alaw56k,
    G711Ulaw64k,
    G711Ulaw56k,
    G722_64k,
    G7231,
    G728,
    G729,
    G729A,
    G729B,
    G729AB,
    GsmFullRate,
    GsmHalfRate,
    GsmEnhancedFullRate,
    H261,
    H263,
    T38,
}

impl Codec {
    pub fn media_kind(self) -> MediaKind {
        match self {
            Codec::H261 | Codec::H263 => MediaKind::Video,
            Codec::T38 => MediaKind::Data,
            _ => MediaKind::Audio,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::G711Alaw64k => "G711-ALaw-64k",
            Codec::G711Alaw56k => "G711-ALaw-56k",
            Codec::G711Ulaw64k => "G711-ULaw-64k",
            Codec::G711Ulaw56k => "G711-ULaw-56k",
            Codec::G722_64k => "G722-64k",
            Codec::G7231 => "G7231",
            Codec::G728 => "G728",
            Codec::G729 => "G729",
            Codec::G729A => "G729A",
            Codec::G729B => "G729B",
            Codec::G729AB => "G729AB",
            Codec::GsmFullRate => "GSM-FullRate",
            Codec::GsmHalfRate => "GSM-HalfRate",
            Codec::GsmEnhancedFullRate => "GSM-EnhancedFullRate",
            Codec::H261 => "H261",
            Codec::H263 => "H263",
            Codec::T38 => "T38",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction advertised for a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityDirection {
    Receive,
    Transmit,
    ReceiveAndTransmit,
}

impl CapabilityDirection {
    pub fn can_receive(self) -> bool {
        matches!(self, Self::Receive | Self::ReceiveAndTransmit)
    }

    pub fn can_transmit(self) -> bool {
        matches!(self, Self::Transmit | Self::ReceiveAndTransmit)
    }
}

/// H.263 picture formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PictureFormat {
    Sqcif,
    Qcif,
    Cif,
    Cif4,
    Cif16,
}

/// Codec specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaParams {
    /// Frames per packet and silence suppression for audio codecs
    Audio { frames: u32, silence_suppression: bool },
    /// Picture format, minimum picture interval and bit rate (units of 100 bit/s)
    Video { picture_format: PictureFormat, mpi: u32, max_bit_rate: u32 },
    /// T.38 fax over UDP
    T38 { max_datagram: Option<u32>, version: Option<u32> },
}

/// A concrete media format, as used in a capability entry or a channel data type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub codec: Codec,
    pub params: MediaParams,
}

impl MediaFormat {
    pub fn audio(codec: Codec, frames: u32) -> Self {
        Self { codec, params: MediaParams::Audio { frames, silence_suppression: false } }
    }

    pub fn video(codec: Codec, picture_format: PictureFormat, mpi: u32, max_bit_rate: u32) -> Self {
        Self { codec, params: MediaParams::Video { picture_format, mpi, max_bit_rate } }
    }

    pub fn t38() -> Self {
        Self { codec: Codec::T38, params: MediaParams::T38 { max_datagram: None, version: None } }
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.media_kind()
    }

    /// Frames per packet for audio formats
    pub fn frames(&self) -> Option<u32> {
        match self.params {
            MediaParams::Audio { frames, .. } => Some(frames),
            _ => None,
        }
    }
}

/// DTMF relay capabilities advertised as receive user input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserInputCapability {
    BasicString,
    Dtmf,
}

/// One entry of a terminal capability table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum H245Capability {
    Media { direction: CapabilityDirection, format: MediaFormat },
    ReceiveUserInput(UserInputCapability),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTableEntry {
    pub number: u16,
    pub capability: H245Capability,
}

/// Capability descriptor; each inner vector is an alternative capability set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub number: u8,
    pub simultaneous_capabilities: Vec<Vec<u16>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_media_kind() {
        assert_eq!(Codec::G711Ulaw64k.media_kind(), MediaKind::Audio);
        assert_eq!(Codec::H263.media_kind(), MediaKind::Video);
        assert_eq!(Codec::T38.media_kind(), MediaKind::Data);
    }

    #[test]
    fn test_direction_bits() {
        assert!(CapabilityDirection::ReceiveAndTransmit.can_receive());
        assert!(CapabilityDirection::ReceiveAndTransmit.can_transmit());
        assert!(!CapabilityDirection::Receive.can_transmit());
        assert!(!CapabilityDirection::Transmit.can_receive());
    }

    #[test]
    fn test_media_format_frames() {
        assert_eq!(MediaFormat::audio(Codec::G729, 2).frames(), Some(2));
        assert_eq!(MediaFormat::t38().frames(), None);
    }
}
