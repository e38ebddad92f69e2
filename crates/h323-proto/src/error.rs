use thiserror::Error;

/// Errors raised while encoding, decoding or framing H.323 messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A message could not be serialized
    #[error("Failed to encode {what}: {message}")]
    Encode { what: &'static str, message: String },

    /// A buffer could not be turned back into a message
    #[error("Failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    /// TPKT header carried a version other than 3
    #[error("Invalid TPKT version: {0}")]
    InvalidTpktVersion(u8),

    /// TPKT length field shorter than the header itself
    #[error("Invalid TPKT length: {0}")]
    InvalidTpktLength(usize),

    /// Payload does not fit the 16-bit TPKT length field
    #[error("Payload too large for TPKT framing: {0} bytes")]
    PayloadTooLarge(usize),

    /// Q.931 message type octet not known to this stack
    #[error("Unknown Q.931 message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Q.931 header or information element is malformed
    #[error("Malformed Q.931 message: {0}")]
    MalformedQ931(String),
}

impl CodecError {
    pub fn encode(what: &'static str, message: impl Into<String>) -> Self {
        Self::Encode { what, message: message.into() }
    }

    pub fn decode(what: &'static str, message: impl Into<String>) -> Self {
        Self::Decode { what, message: message.into() }
    }
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;
