//! The per-call aggregate
//!
//! A [`CallRecord`] owns every piece of state of one call: the call state,
//! the H.245 sub-protocol states, the logical channel table, the timers and
//! the capability lists. It performs no I/O. Network input and timer
//! expiries are fed in through its entry points; everything it wants sent is
//! queued as [`CallAction`]s that the runtime drains with
//! [`CallRecord::take_actions`].
//!
//! ```text
//!  Q.931 / H.245 / timers ──▶ CallRecord ──▶ Vec<CallAction> ──▶ transports
//!                               │
//!                               └─▶ CallEventHandler (media, application)
//! ```
//!
//! Callers must serialize access to a record (one lock per call); a step
//! never blocks.

pub mod channel;
pub mod state;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rvoip_h323_proto::h245::OpenLogicalChannel;
use rvoip_h323_proto::q931::{AliasAddress, ReleaseCompleteReason};
use rvoip_h323_proto::{
    ChannelNumber, H245Capability, H245Message, JsonCodec, MediaKind, MessageCodec, Q931Cause,
    Q931Message,
};

pub use channel::{ChannelDirection, ChannelState, ChannelTable, LogicalChannel};
pub use state::{
    CallDirection, CallState, H245Link, H245SessionState, LocalTcsState, MsdState, RemoteTcsState,
    SessionKind,
};

use crate::capability::JointCapability;
use crate::config::{DtmfModes, EndpointConfig};
use crate::errors::{CallEndReason, CallResult};
use crate::handler::{CallEventHandler, CallSummary, ForwardTarget};
use crate::ports::RtpPortPool;
use crate::timer::{CallTimers, PendingTimer, TimerClass};

/// Unique identifier of a call within one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallToken(String);

impl CallToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn generate() -> Self {
        Self(format!("h323-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of a state-machine step, executed by the runtime in order
#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    /// Encode and send on the call signaling connection
    SendQ931(Q931Message),
    /// Encode and send on the separate H.245 connection
    SendH245(H245Message),
    /// Open the separate H.245 connection
    ConnectH245(SocketAddr),
    /// Close the separate H.245 connection
    CloseH245,
    /// The call reached `Cleared`; release its resources
    Released,
}

/// Work deferred until other procedures complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    /// Resend our capability set once our transmit channels are closed
    Renegotiate,
}

/// Endpoint-wide collaborators shared by every call
#[derive(Clone)]
pub struct CallContext {
    pub config: Arc<EndpointConfig>,
    pub codec: Arc<dyn MessageCodec>,
    pub ports: Arc<RtpPortPool>,
    pub handler: Option<Arc<dyn CallEventHandler>>,
    /// Incoming SETUPs wait for an external admission decision
    pub admission_required: bool,
}

impl CallContext {
    /// Context with the reference codec and no handler
    pub fn new(config: EndpointConfig) -> Self {
        let ports = Arc::new(RtpPortPool::new(config.rtp_ports));
        Self {
            config: Arc::new(config),
            codec: Arc::new(JsonCodec::new()),
            ports,
            handler: None,
            admission_required: false,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn CallEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_admission(mut self, required: bool) -> Self {
        self.admission_required = required;
        self
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("has_handler", &self.handler.is_some())
            .field("admission_required", &self.admission_required)
            .finish()
    }
}

/// Names and identifiers exchanged in SETUP
#[derive(Debug, Clone, Default)]
pub struct CallIdentity {
    pub call_reference: u16,
    pub call_identifier: Uuid,
    pub conference_id: Uuid,
    pub display: Option<String>,
    pub caller_aliases: Vec<AliasAddress>,
    pub callee_aliases: Vec<AliasAddress>,
    pub calling_number: Option<String>,
    pub called_number: Option<String>,
}

#[derive(Debug)]
pub(crate) struct MsdNegotiation {
    pub(crate) state: MsdState,
    pub(crate) local_number: u32,
    pub(crate) retries: u32,
    /// The remote acknowledged a determination
    pub(crate) remote_acked: bool,
}

#[derive(Debug)]
pub(crate) struct TcsNegotiation {
    pub(crate) local: LocalTcsState,
    pub(crate) remote: RemoteTcsState,
    pub(crate) local_seq: u8,
    pub(crate) last_remote_seq: Option<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct CallFlags {
    pub(crate) tunneling: bool,
    pub(crate) fast_start: bool,
    pub(crate) fast_start_answered: bool,
    pub(crate) t38_supported: bool,
    /// SETUP sent or received
    pub(crate) signaling_started: bool,
    pub(crate) setup_received: bool,
    pub(crate) end_session_sent: bool,
    pub(crate) release_sent: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RtdCounters {
    pub(crate) send: u8,
    pub(crate) recv: u8,
}

#[derive(Debug, Default)]
pub(crate) struct RequestModeState {
    pub(crate) seq: u8,
    pub(crate) pending: Option<SessionKind>,
}

#[derive(Debug, Default)]
pub(crate) struct DtmfState {
    pub(crate) last_signal: Option<String>,
    pub(crate) next_stamp: Option<u32>,
}

/// State of one H.323 call
pub struct CallRecord {
    pub(crate) token: CallToken,
    pub(crate) direction: CallDirection,
    pub(crate) ctx: CallContext,
    pub(crate) state: CallState,
    pub(crate) end_reason: Option<CallEndReason>,
    /// Q.931 cause sent or received in ReleaseComplete
    pub(crate) q931_cause: Option<Q931Cause>,
    pub(crate) release_reason: Option<ReleaseCompleteReason>,
    pub(crate) h245_session: H245SessionState,
    pub(crate) h245_link: H245Link,
    pub(crate) msd: MsdNegotiation,
    pub(crate) tcs: TcsNegotiation,
    pub(crate) request_mode: RequestModeState,
    pub(crate) rtd: RtdCounters,
    pub(crate) dtmf: DtmfState,
    pub(crate) flags: CallFlags,
    pub(crate) session_kind: SessionKind,
    pub(crate) identity: CallIdentity,
    pub(crate) remote_signal_addr: Option<SocketAddr>,
    pub(crate) remote_h245_addr: Option<SocketAddr>,
    pub(crate) forward: Option<ForwardTarget>,
    pub(crate) channels: ChannelTable,
    pub(crate) next_channel: ChannelNumber,
    pub(crate) next_session_id: u8,
    pub(crate) timers: CallTimers,
    pub(crate) remote_caps: Vec<H245Capability>,
    pub(crate) joint_caps: Vec<JointCapability>,
    pub(crate) joint_dtmf: DtmfModes,
    pub(crate) pending: VecDeque<PendingAction>,
    /// Fast start answers prepared for an incoming call
    pub(crate) fast_start_response: Vec<OpenLogicalChannel>,
    pub(crate) address_filter: Option<Regex>,
    /// Encoded H.245 waiting for the next Q.931 message
    pub(crate) tunneled: Vec<Bytes>,
    /// H.245 waiting for the separate connection
    pub(crate) h245_backlog: Vec<H245Message>,
    pub(crate) actions: Vec<CallAction>,
}

impl CallRecord {
    /// A call we originate toward `remote` (its H.225.0 signaling address)
    pub fn new_outgoing(ctx: CallContext, remote: SocketAddr) -> Self {
        let mut record = Self::new(ctx, CallDirection::Outgoing, Some(remote));
        record.identity.call_reference = rand::thread_rng().gen_range(1..=0x7fff);
        record.identity.call_identifier = Uuid::new_v4();
        record.identity.conference_id = Uuid::new_v4();
        record
    }

    /// A call announced by a SETUP from `remote`
    pub fn new_incoming(ctx: CallContext, remote: Option<SocketAddr>) -> Self {
        Self::new(ctx, CallDirection::Incoming, remote)
    }

    fn new(ctx: CallContext, direction: CallDirection, remote: Option<SocketAddr>) -> Self {
        let config = ctx.config.clone();
        let address_filter =
            config.rtp_address_mask.as_deref().and_then(|mask| match Regex::new(mask) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Ignoring invalid rtp_address_mask {}: {}", mask, e);
                    None
                }
            });
        let token = CallToken::generate();
        debug!(call = %token, "Created {} call record", direction);

        Self {
            token,
            direction,
            state: CallState::Created,
            end_reason: None,
            q931_cause: None,
            release_reason: None,
            h245_session: H245SessionState::Idle,
            h245_link: H245Link::None,
            msd: MsdNegotiation {
                state: MsdState::Idle,
                local_number: 0,
                retries: 0,
                remote_acked: false,
            },
            tcs: TcsNegotiation {
                local: LocalTcsState::Idle,
                remote: RemoteTcsState::Idle,
                local_seq: 0,
                last_remote_seq: None,
            },
            request_mode: RequestModeState::default(),
            rtd: RtdCounters::default(),
            dtmf: DtmfState::default(),
            flags: CallFlags {
                tunneling: config.tunneling,
                fast_start: config.fast_start,
                ..CallFlags::default()
            },
            session_kind: if config.call_mode == crate::config::CallMode::Fax {
                SessionKind::Data
            } else {
                SessionKind::Audio
            },
            identity: CallIdentity::default(),
            remote_signal_addr: remote,
            remote_h245_addr: None,
            forward: None,
            channels: ChannelTable::new(),
            next_channel: config.channel_range.base,
            next_session_id: 4,
            timers: CallTimers::new(),
            remote_caps: Vec::new(),
            joint_caps: Vec::new(),
            joint_dtmf: DtmfModes::default(),
            pending: VecDeque::new(),
            fast_start_response: Vec::new(),
            address_filter,
            tunneled: Vec::new(),
            h245_backlog: Vec::new(),
            actions: Vec::new(),
            ctx,
        }
    }

    // =====================================================================
    // Accessors
    // =====================================================================

    pub fn token(&self) -> &CallToken {
        &self.token
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn end_reason(&self) -> Option<CallEndReason> {
        self.end_reason
    }

    pub fn q931_cause(&self) -> Option<Q931Cause> {
        self.q931_cause
    }

    pub fn release_reason(&self) -> Option<ReleaseCompleteReason> {
        self.release_reason
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.ctx.config
    }

    pub fn h245_session_state(&self) -> H245SessionState {
        self.h245_session
    }

    pub fn h245_link(&self) -> H245Link {
        self.h245_link
    }

    pub fn msd_state(&self) -> MsdState {
        self.msd.state
    }

    pub fn msd_retries(&self) -> u32 {
        self.msd.retries
    }

    /// Our current 24-bit status determination number
    pub fn status_determination_number(&self) -> u32 {
        self.msd.local_number
    }

    pub fn local_tcs_state(&self) -> LocalTcsState {
        self.tcs.local
    }

    pub fn remote_tcs_state(&self) -> RemoteTcsState {
        self.tcs.remote
    }

    pub fn local_tcs_sequence(&self) -> u8 {
        self.tcs.local_seq
    }

    pub fn last_remote_tcs_sequence(&self) -> Option<u8> {
        self.tcs.last_remote_seq
    }

    pub fn is_tunneling(&self) -> bool {
        self.flags.tunneling
    }

    pub fn is_fast_start(&self) -> bool {
        self.flags.fast_start
    }

    pub fn is_fast_start_answered(&self) -> bool {
        self.flags.fast_start_answered
    }

    pub fn is_t38_supported(&self) -> bool {
        self.flags.t38_supported
    }

    pub fn session_kind(&self) -> SessionKind {
        self.session_kind
    }

    pub fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    pub fn remote_signal_addr(&self) -> Option<SocketAddr> {
        self.remote_signal_addr
    }

    pub fn remote_h245_addr(&self) -> Option<SocketAddr> {
        self.remote_h245_addr
    }

    pub fn forward_target(&self) -> Option<&ForwardTarget> {
        self.forward.as_ref()
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn timers(&self) -> &CallTimers {
        &self.timers
    }

    pub fn remote_capabilities(&self) -> &[H245Capability] {
        &self.remote_caps
    }

    pub fn joint_capabilities(&self) -> &[JointCapability] {
        &self.joint_caps
    }

    pub fn joint_dtmf(&self) -> DtmfModes {
        self.joint_dtmf
    }

    pub fn has_pending_renegotiation(&self) -> bool {
        self.pending.contains(&PendingAction::Renegotiate)
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Snapshot used by admission control
    pub fn summary(&self) -> CallSummary {
        CallSummary {
            token: self.token.clone(),
            direction: self.direction,
            remote_signal_addr: self.remote_signal_addr,
            caller_aliases: self.identity.caller_aliases.clone(),
            callee_aliases: self.identity.callee_aliases.clone(),
            calling_number: self.identity.calling_number.clone(),
            called_number: self.identity.called_number.clone(),
        }
    }

    /// Drain the queued output of the previous steps
    pub fn take_actions(&mut self) -> Vec<CallAction> {
        std::mem::take(&mut self.actions)
    }

    // =====================================================================
    // Public operations
    //
    // Each runs one state-machine step: the operation itself, then the
    // end-of-step work (tunneled H.245 flush, clearing procedure).
    // =====================================================================

    /// Start master-slave determination; no-op unless idle
    pub fn start_msd(&mut self) -> CallResult<()> {
        self.step(|call| call.begin_msd())
    }

    /// Send our capability set; no-op while one is outstanding
    pub fn send_tcs(&mut self) -> CallResult<()> {
        self.step(|call| call.send_capability_set())
    }

    /// Send an empty capability set to force the remote to renegotiate
    pub fn send_empty_tcs(&mut self) -> CallResult<()> {
        self.step(|call| call.send_empty_capability_set())
    }

    /// Open a transmit channel of `kind`
    pub fn open_channel(&mut self, kind: MediaKind) -> CallResult<ChannelNumber> {
        self.step(|call| call.open_transmit_channel(kind))
    }

    /// Open the transmit channels of the call mode, or those chosen by the handler
    pub fn open_logical_channels(&mut self) -> CallResult<()> {
        self.step(|call| call.open_default_channels())
    }

    /// Close a transmit channel, or ask the remote to close a receive channel
    pub fn close_channel(
        &mut self,
        number: ChannelNumber,
        direction: ChannelDirection,
    ) -> CallResult<()> {
        self.step(|call| call.close_logical_channel(number, direction))
    }

    /// Process an H.245 message received on the separate H.245 connection
    pub fn handle_h245(&mut self, message: H245Message) -> CallResult<()> {
        self.step(|call| call.dispatch_h245(message))
    }

    /// Process a Q.931 message received on the call signaling connection
    pub fn handle_q931(&mut self, message: Q931Message) -> CallResult<()> {
        self.step(|call| call.dispatch_q931(message))
    }

    /// Fire every timer whose deadline is not after `now`, oldest first
    pub fn handle_timeout(&mut self, now: Instant) -> CallResult<()> {
        self.step(|call| {
            while call.state != CallState::Cleared {
                let Some(timer) = call.timers.pop_expired(now) else { break };
                if let Err(e) = call.on_timer(timer) {
                    debug!(call = %call.token, "{} timer handling ended with: {}", timer.class, e);
                }
            }
            Ok(())
        })
    }

    /// Clear the call locally
    pub fn end_call(&mut self, reason: CallEndReason) -> CallResult<()> {
        self.step(|call| {
            call.clear_call(reason);
            Ok(())
        })
    }

    /// Ask the remote to switch the media session to T.38 or back to audio
    pub fn request_mode(&mut self, t38: bool) -> CallResult<()> {
        self.step(|call| call.send_request_mode(t38))
    }

    /// Relay DTMF digits over H.245
    pub fn send_dtmf(&mut self, digits: &str) -> CallResult<()> {
        self.step(|call| call.send_user_input(digits))
    }

    /// Send one round-trip delay request now
    pub fn send_round_trip_delay(&mut self) -> CallResult<()> {
        self.step(|call| call.send_round_trip_delay_request())
    }

    pub(crate) fn step<T>(&mut self, op: impl FnOnce(&mut Self) -> CallResult<T>) -> CallResult<T> {
        let result = op(self);
        self.complete_step();
        result
    }

    fn complete_step(&mut self) {
        match self.state {
            CallState::Cleared => self.tunneled.clear(),
            CallState::Clear => self.run_clearing(),
            _ => self.flush_tunneled(),
        }
    }

    fn on_timer(&mut self, timer: PendingTimer) -> CallResult<()> {
        info!(call = %self.token, channel = ?timer.channel, "{} timer expired", timer.class);
        match (timer.class, timer.channel) {
            (TimerClass::Msd, _) => self.on_msd_timeout(),
            (TimerClass::Tcs, _) => self.on_tcs_timeout(),
            (TimerClass::Olc, Some(number)) => self.on_olc_timeout(number),
            (TimerClass::Clc, Some(number)) => self.on_clc_timeout(number),
            (TimerClass::Rcc, Some(number)) => self.on_rcc_timeout(number),
            (TimerClass::Session, _) => self.on_session_timeout(),
            (TimerClass::Rtd, _) => self.on_rtd_timeout(),
            (TimerClass::CallEstablish, _) => self.on_call_establish_timeout(),
            (class, None) => {
                warn!(call = %self.token, "{} timer without a channel", class);
                Ok(())
            }
        }
    }

    // =====================================================================
    // Call state bookkeeping
    // =====================================================================

    /// Move the call to `Clear`; no effect once clearing has started
    pub(crate) fn clear_call(&mut self, reason: CallEndReason) {
        if self.state.is_clearing() {
            return;
        }
        info!(call = %self.token, reason = %reason, "Clearing call from state {}", self.state);
        if self.end_reason.is_none() {
            self.end_reason = Some(reason);
        }
        self.state = CallState::Clear;
    }

    /// Advance the call state; never moves backwards
    pub(crate) fn set_state(&mut self, next: CallState) {
        if next < self.state {
            warn!(call = %self.token, "Refusing call state change {} -> {}", self.state, next);
            return;
        }
        if next != self.state {
            debug!(call = %self.token, "Call state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Final teardown: cancel timers, stop media, close H.245, report
    pub(crate) fn mark_cleared(&mut self) {
        if self.state == CallState::Cleared {
            return;
        }
        if self.end_reason.is_none() {
            self.end_reason = Some(CallEndReason::Unknown);
        }
        self.state = CallState::Cleared;
        self.timers.cancel_all();
        self.clear_all_channels();
        self.close_h245();
        self.tunneled.clear();
        self.h245_backlog.clear();
        self.pending.clear();
        self.actions.push(CallAction::Released);
        info!(call = %self.token, reason = ?self.end_reason, "Call cleared");

        if let Some(handler) = self.handler() {
            handler.on_call_cleared(self);
        }
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn CallEventHandler>> {
        self.ctx.handler.clone()
    }

    pub(crate) fn codec(&self) -> Arc<dyn MessageCodec> {
        self.ctx.codec.clone()
    }

    pub(crate) fn config_arc(&self) -> Arc<EndpointConfig> {
        self.ctx.config.clone()
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("token", &self.token)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("end_reason", &self.end_reason)
            .field("msd", &self.msd.state)
            .field("local_tcs", &self.tcs.local)
            .field("remote_tcs", &self.tcs.remote)
            .field("h245_session", &self.h245_session)
            .field("tunneling", &self.flags.tunneling)
            .field("channels", &self.channels.len())
            .finish()
    }
}
