//! H.323 protocol model for the rvoip stack
//!
//! This crate holds the structured H.245 and H.225.0/Q.931 messages consumed
//! by the call-control engine, the capability model they share, the
//! [`MessageCodec`] seam the engine encodes through, and TPKT framing for
//! TCP transports.

pub mod capability;
pub mod codec;
pub mod error;
pub mod h245;
pub mod q931;
pub mod tpkt;

// Re-export commonly used types
pub use capability::{
    CapabilityDescriptor, CapabilityDirection, CapabilityTableEntry, Codec, H245Capability,
    MediaFormat, MediaKind, MediaParams, PictureFormat, UserInputCapability,
};
pub use codec::{JsonCodec, MessageCodec};
pub use error::{CodecError, Result};
pub use h245::{ChannelNumber, H245Message, TransportAddress};
pub use q931::{H323MessageBody, H323UserInformation, Q931Cause, Q931Message, Q931MessageType};
pub use tpkt::{TpktDecoder, TPKT_HEADER_LEN, TPKT_VERSION};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::capability::*;
    pub use crate::codec::{JsonCodec, MessageCodec};
    pub use crate::error::{CodecError, Result};
    pub use crate::h245::*;
    pub use crate::q931::*;
}
