//! Shared helpers for call-control integration tests
//!
//! Two call records are wired back to back: whatever one queues for the
//! wire is handed to the other, until both go quiet.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use rvoip_h323_call::call::{CallAction, CallContext, CallRecord, LogicalChannel};
use rvoip_h323_call::config::EndpointConfig;
use rvoip_h323_call::errors::{CallError, CallResult};
use rvoip_h323_call::handler::{CallEventHandler, ForwardTarget};
use rvoip_h323_proto::h245::H245Message;
use rvoip_h323_proto::q931::{
    CallProgressUuie, H323MessageBody, H323UserInformation, Q931Message, Q931MessageType,
};
use rvoip_h323_proto::{JsonCodec, MediaKind, MessageCodec};

/// Everything a test wants to know about the callbacks a call made
#[derive(Debug, Default)]
pub struct Recorded {
    pub incoming: usize,
    pub alerting: usize,
    pub connected: usize,
    pub established: usize,
    pub cleared: usize,
    pub started_rx: Vec<LogicalChannel>,
    pub started_tx: Vec<LogicalChannel>,
    pub stopped_rx: Vec<LogicalChannel>,
    pub stopped_tx: Vec<LogicalChannel>,
    pub dtmf: Vec<String>,
    pub mode_changes: Vec<bool>,
    pub forwarded: Vec<ForwardTarget>,
}

/// Handler that records every callback
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub recorded: Mutex<Recorded>,
    /// Overrides the channels opened after negotiation
    pub open_kinds: Mutex<Option<Vec<MediaKind>>>,
    /// Refuse to start media
    pub refuse_media: Mutex<bool>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dtmf(&self) -> Vec<String> {
        self.recorded.lock().dtmf.clone()
    }

    fn start(&self) -> CallResult<()> {
        if *self.refuse_media.lock() {
            Err(CallError::media("media engine refused"))
        } else {
            Ok(())
        }
    }
}

impl CallEventHandler for RecordingHandler {
    fn on_incoming_call(&self, _call: &CallRecord) {
        self.recorded.lock().incoming += 1;
    }

    fn on_alerting(&self, _call: &CallRecord) {
        self.recorded.lock().alerting += 1;
    }

    fn on_received_connect(&self, _call: &CallRecord) {
        self.recorded.lock().connected += 1;
    }

    fn on_call_established(&self, _call: &CallRecord) {
        self.recorded.lock().established += 1;
    }

    fn on_mode_changed(&self, _call: &CallRecord, is_t38: bool) {
        self.recorded.lock().mode_changes.push(is_t38);
    }

    fn on_received_dtmf(&self, _call: &CallRecord, digits: &str) {
        self.recorded.lock().dtmf.push(digits.to_string());
    }

    fn open_logical_channels(&self, _call: &CallRecord) -> Option<Vec<MediaKind>> {
        self.open_kinds.lock().clone()
    }

    fn start_receive_channel(
        &self,
        _call: &CallRecord,
        channel: &LogicalChannel,
    ) -> CallResult<()> {
        self.start()?;
        self.recorded.lock().started_rx.push(channel.clone());
        Ok(())
    }

    fn start_transmit_channel(
        &self,
        _call: &CallRecord,
        channel: &LogicalChannel,
    ) -> CallResult<()> {
        self.start()?;
        self.recorded.lock().started_tx.push(channel.clone());
        Ok(())
    }

    fn stop_receive_channel(&self, _call: &CallRecord, channel: &LogicalChannel) {
        self.recorded.lock().stopped_rx.push(channel.clone());
    }

    fn stop_transmit_channel(&self, _call: &CallRecord, channel: &LogicalChannel) {
        self.recorded.lock().stopped_tx.push(channel.clone());
    }

    fn on_call_forwarded(&self, _call: &CallRecord, target: &ForwardTarget) {
        self.recorded.lock().forwarded.push(target.clone());
    }

    fn on_call_cleared(&self, _call: &CallRecord) {
        self.recorded.lock().cleared += 1;
    }
}

pub fn remote_addr() -> SocketAddr {
    "192.0.2.20:1720".parse().unwrap()
}

pub fn caller_addr() -> SocketAddr {
    "192.0.2.10:40000".parse().unwrap()
}

/// One side of a test call
pub struct Side {
    pub call: CallRecord,
    pub handler: Arc<RecordingHandler>,
}

impl Side {
    pub fn outgoing(config: EndpointConfig) -> Self {
        let handler = RecordingHandler::new();
        let ctx = CallContext::new(config).with_handler(handler.clone());
        Self { call: CallRecord::new_outgoing(ctx, remote_addr()), handler }
    }

    pub fn incoming(config: EndpointConfig) -> Self {
        let handler = RecordingHandler::new();
        let ctx = CallContext::new(config).with_handler(handler.clone());
        Self { call: CallRecord::new_incoming(ctx, Some(caller_addr())), handler }
    }

    /// Drain queued actions into Q.931 and H.245 messages
    pub fn outbox(&mut self) -> Outbox {
        let mut outbox = Outbox::default();
        for action in self.call.take_actions() {
            match action {
                CallAction::SendQ931(message) => outbox.q931.push(message),
                CallAction::SendH245(message) => outbox.h245.push(message),
                CallAction::ConnectH245(addr) => outbox.connect_h245.push(addr),
                CallAction::CloseH245 => outbox.close_h245 += 1,
                CallAction::Released => outbox.released = true,
            }
        }
        outbox
    }

    /// H.245 messages carried inside the queued Q.931 messages
    pub fn tunneled_h245(&mut self) -> Vec<H245Message> {
        let codec = JsonCodec::new();
        self.outbox()
            .q931
            .iter()
            .filter_map(|m| m.user_info.as_ref())
            .flat_map(|info| info.h245_control.iter())
            .map(|data| codec.decode_h245(data).unwrap())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Outbox {
    pub q931: Vec<Q931Message>,
    pub h245: Vec<H245Message>,
    pub connect_h245: Vec<SocketAddr>,
    pub close_h245: usize,
    pub released: bool,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.q931.is_empty()
            && self.h245.is_empty()
            && self.connect_h245.is_empty()
            && self.close_h245 == 0
            && !self.released
    }

    pub fn deliver(self, to: &mut CallRecord) {
        for message in self.q931 {
            let _ = to.handle_q931(message);
        }
        for message in self.h245 {
            let _ = to.handle_h245(message);
        }
    }
}

/// Exchange messages until neither side has anything left to send
pub fn pump(a: &mut Side, b: &mut Side) {
    for _ in 0..64 {
        let from_a = a.outbox();
        let from_b = b.outbox();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        from_a.deliver(&mut b.call);
        from_b.deliver(&mut a.call);
    }
    panic!("calls did not settle");
}

/// Place a call from `a` to `b`, answer it and run negotiation to the end
pub fn connected_pair(config_a: EndpointConfig, config_b: EndpointConfig) -> (Side, Side) {
    let mut a = Side::outgoing(config_a);
    let mut b = Side::incoming(config_b);
    a.call.place_call(Vec::new(), Some("2000".to_string())).unwrap();
    pump(&mut a, &mut b);
    b.call.answer_call().unwrap();
    pump(&mut a, &mut b);
    (a, b)
}

pub fn config() -> EndpointConfig {
    EndpointConfig::new().with_h323_id("test-endpoint").with_e164("1000")
}

// =====================================================================
// Message builders
// =====================================================================

pub fn encode(message: &H245Message) -> Bytes {
    JsonCodec::new().encode_h245(message).unwrap()
}

/// Q.931 message from the remote with the given tunneling flag and tunneled H.245
pub fn q931_from_remote(
    message_type: Q931MessageType,
    body: H323MessageBody,
    tunneling: Option<bool>,
    h245: &[H245Message],
) -> Q931Message {
    let mut info = H323UserInformation::new(body);
    info.h245_tunneling = tunneling;
    info.h245_control = h245.iter().map(encode).collect();
    Q931Message::new(message_type, 1, true).with_user_info(info)
}

/// Outgoing call that has sent SETUP and got CALL PROCEEDING with tunneling on
pub fn proceeding(config: EndpointConfig) -> Side {
    let mut side = Side::outgoing(config);
    side.call.place_call(Vec::new(), None).unwrap();
    side.outbox();
    let message = q931_from_remote(
        Q931MessageType::CallProceeding,
        H323MessageBody::CallProceeding(CallProgressUuie::default()),
        Some(true),
        &[],
    );
    side.call.handle_q931(message).unwrap();
    side
}
