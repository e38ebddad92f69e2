//! H.323 call-control engine for the rvoip stack
//!
//! A call is a [`CallRecord`]: a synchronous state machine that consumes
//! decoded Q.931 and H.245 messages, timer expiries and application
//! commands, and queues [`CallAction`]s for whoever owns the transports.
//! It covers master-slave determination, terminal capability exchange,
//! logical channel signaling, H.245 tunneling inside Q.931, fast start and
//! call clearing.
//!
//! [`CallManager`] is the tokio runtime around it: it accepts and places
//! signaling connections, opens separate H.245 connections when the remote
//! does not tunnel, pumps call timers and runs admission control.
//!
//! ```no_run
//! use rvoip_h323_call::prelude::*;
//!
//! # async fn example() -> CallResult<()> {
//! let config = EndpointConfig::new().with_h323_id("alice");
//! let manager = CallManager::new(config)?;
//! manager.start().await?;
//! let token = manager.make_call("192.0.2.10:1720".parse().unwrap(), Vec::new(), None).await?;
//! manager.hang_up(&token, CallEndReason::LocalCleared).await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod capability;
pub mod config;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod manager;
pub mod msd;
pub mod ports;
pub mod timer;

// Call record behavior, split by protocol area
mod channels;
mod h245;
mod signaling;
mod tunneling;

pub use call::{
    CallAction, CallContext, CallDirection, CallIdentity, CallRecord, CallState, CallToken,
    ChannelDirection, ChannelState, LogicalChannel, MsdState, SessionKind,
};
pub use capability::{Capability, CapabilityParams, JointCapability};
pub use config::{CallMode, DtmfModes, EndpointConfig, TimerSettings};
pub use errors::{CallEndReason, CallError, CallResult};
pub use handler::{
    AdmissionControl, AdmissionDecision, CallEventHandler, CallSummary, ForwardTarget,
};
pub use manager::{CallManager, CallManagerBuilder};
pub use msd::{determine_master, MsdOutcome};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::call::state::*;
    pub use crate::call::{
        CallAction, CallContext, CallRecord, CallToken, ChannelDirection, ChannelState,
        LogicalChannel,
    };
    pub use crate::capability::{Capability, CapabilityParams, JointCapability};
    pub use crate::config::*;
    pub use crate::errors::{CallEndReason, CallError, CallResult};
    pub use crate::handler::*;
    pub use crate::logging::{setup_logging, LogFormat, LoggingConfig};
    pub use crate::manager::{CallManager, CallManagerBuilder};
}
