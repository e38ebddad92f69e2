//! Call manager: the async runtime around call records
//!
//! ```text
//!   TpktListener ──accept──▶ serve_incoming ─┐
//!   make_call ──connect──────────────────────┤
//!                                            ▼
//!                        ┌────────────── CallEntry ─────────────┐
//!   signaling events ──▶ │ Mutex<CallRecord> ──▶ Vec<CallAction> │ ──▶ drive()
//!   H.245 events ──────▶ │                                        │      │
//!   timer pump ────────▶ └────────────────────────────────────────┘      ▼
//!                                                   Q.931 / H.245 transports
//! ```
//!
//! Every call has one lock; an event is applied to the record under that
//! lock, then the queued actions are executed with the lock released.
//! Handler callbacks run under the lock and must not call back into the
//! manager for the same call.
//!
//! Execution is serialized by a second, async lock per call that is held
//! from taking a batch of actions until its last write completes, so a
//! call's messages leave in the order the record queued them.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use rvoip_h323_proto::q931::AliasAddress;
use rvoip_h323_proto::{MessageCodec, Q931MessageType};
use rvoip_h323_transport::{ListenerEvent, TcpTransport, TpktListener, Transport, TransportEvent};

use crate::call::{CallAction, CallContext, CallRecord, CallState, CallToken};
use crate::config::EndpointConfig;
use crate::errors::{CallEndReason, CallError, CallResult};
use crate::handler::{AdmissionControl, CallEventHandler};

/// Resolution of the timer pump
const TIMER_TICK: Duration = Duration::from_millis(50);

/// Limit for connecting call signaling and H.245
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builder for [`CallManager`]
pub struct CallManagerBuilder {
    config: EndpointConfig,
    handler: Option<Arc<dyn CallEventHandler>>,
    admission: Option<Arc<dyn AdmissionControl>>,
    codec: Option<Arc<dyn MessageCodec>>,
}

impl CallManagerBuilder {
    pub fn handler(mut self, handler: Arc<dyn CallEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn admission(mut self, admission: Arc<dyn AdmissionControl>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> CallResult<CallManager> {
        self.config.validate()?;
        let mut ctx = CallContext::new(self.config).with_admission(self.admission.is_some());
        if let Some(handler) = self.handler {
            ctx = ctx.with_handler(handler);
        }
        if let Some(codec) = self.codec {
            ctx = ctx.with_codec(codec);
        }
        Ok(CallManager {
            inner: Arc::new(ManagerInner {
                ctx,
                admission: self.admission,
                calls: RwLock::new(HashMap::new()),
                listener: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }
}

/// Owns every call of one endpoint and the tasks serving them
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    ctx: CallContext,
    admission: Option<Arc<dyn AdmissionControl>>,
    calls: RwLock<HashMap<CallToken, Arc<CallEntry>>>,
    listener: Mutex<Option<TpktListener>>,
    running: AtomicBool,
}

struct CallEntry {
    token: CallToken,
    record: Mutex<CallRecord>,
    /// Held while queued actions are taken and executed
    outbound: tokio::sync::Mutex<()>,
    signaling: TcpTransport,
    h245: Mutex<Option<TcpTransport>>,
}

impl CallManager {
    pub fn builder(config: EndpointConfig) -> CallManagerBuilder {
        CallManagerBuilder { config, handler: None, admission: None, codec: None }
    }

    /// Manager without handler or admission control
    pub fn new(config: EndpointConfig) -> CallResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.ctx.config
    }

    /// Bind the signaling listener and start the accept loop and timer pump
    pub async fn start(&self) -> CallResult<SocketAddr> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(CallError::invalid_state("call manager already started"));
        }
        let (listener, mut events) = TpktListener::bind(self.inner.ctx.config.listen_addr).await?;
        let local_addr = listener.local_addr();
        *self.inner.listener.lock() = Some(listener);
        info!("H.323 call manager listening on {}", local_addr);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ListenerEvent::Accepted { transport, events, peer } => {
                        if !inner.running.load(Ordering::SeqCst) {
                            let _ = transport.close().await;
                            break;
                        }
                        debug!("Incoming signaling connection from {}", peer);
                        tokio::spawn(serve_incoming(inner.clone(), transport, events, peer));
                    }
                    ListenerEvent::Error { error } => warn!("Signaling listener error: {}", error),
                }
            }
            debug!("Signaling accept loop terminated");
        });

        tokio::spawn(run_timer_pump(self.inner.clone()));
        Ok(local_addr)
    }

    /// Connect to `remote` and send SETUP
    pub async fn make_call(
        &self,
        remote: SocketAddr,
        destination: Vec<AliasAddress>,
        called_number: Option<String>,
    ) -> CallResult<CallToken> {
        let (transport, events) = TcpTransport::connect(remote, Some(CONNECT_TIMEOUT), None).await?;
        let mut record = CallRecord::new_outgoing(self.inner.ctx.clone(), remote);
        record.place_call(destination, called_number)?;

        let entry = self.inner.register(record, transport);
        let token = entry.token.clone();
        drive(&self.inner, &entry).await;
        tokio::spawn(run_signaling_events(self.inner.clone(), entry, events));
        Ok(token)
    }

    pub async fn send_alerting(&self, token: &CallToken) -> CallResult<()> {
        self.run(token, |call| call.send_alerting()).await
    }

    pub async fn answer_call(&self, token: &CallToken) -> CallResult<()> {
        self.run(token, |call| call.answer_call()).await
    }

    pub async fn hang_up(&self, token: &CallToken, reason: CallEndReason) -> CallResult<()> {
        self.run(token, |call| call.end_call(reason)).await
    }

    pub async fn request_mode(&self, token: &CallToken, t38: bool) -> CallResult<()> {
        self.run(token, |call| call.request_mode(t38)).await
    }

    pub async fn send_dtmf(&self, token: &CallToken, digits: &str) -> CallResult<()> {
        self.run(token, |call| call.send_dtmf(digits)).await
    }

    pub fn call_state(&self, token: &CallToken) -> Option<CallState> {
        self.with_call(token, |call| call.state())
    }

    /// Inspect a call under its lock
    pub fn with_call<R>(&self, token: &CallToken, f: impl FnOnce(&CallRecord) -> R) -> Option<R> {
        let entry = self.inner.calls.read().get(token).cloned()?;
        let call = entry.record.lock();
        Some(f(&call))
    }

    pub fn active_calls(&self) -> Vec<CallToken> {
        self.inner.calls.read().keys().cloned().collect()
    }

    /// Clear every call and stop accepting new ones
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.close();
        }
        let entries: Vec<_> = self.inner.calls.read().values().cloned().collect();
        info!("Shutting down call manager with {} call(s)", entries.len());
        for entry in entries {
            apply(&entry, |call| call.end_call(CallEndReason::LocalCleared));
            drive(&self.inner, &entry).await;
        }
    }

    async fn run<R>(
        &self,
        token: &CallToken,
        op: impl FnOnce(&mut CallRecord) -> CallResult<R>,
    ) -> CallResult<R> {
        let entry = self.inner.entry(token)?;
        let result = op(&mut entry.record.lock());
        drive(&self.inner, &entry).await;
        result
    }
}

impl ManagerInner {
    fn register(&self, record: CallRecord, signaling: TcpTransport) -> Arc<CallEntry> {
        let token = record.token().clone();
        let entry = Arc::new(CallEntry {
            token: token.clone(),
            record: Mutex::new(record),
            outbound: tokio::sync::Mutex::new(()),
            signaling,
            h245: Mutex::new(None),
        });
        self.calls.write().insert(token, entry.clone());
        entry
    }

    fn entry(&self, token: &CallToken) -> CallResult<Arc<CallEntry>> {
        self.calls
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| CallError::CallNotFound { token: token.to_string() })
    }
}

/// Apply one event to a call under its lock; errors are already reflected in the call state
fn apply(entry: &CallEntry, op: impl FnOnce(&mut CallRecord) -> CallResult<()>) {
    let mut call = entry.record.lock();
    if let Err(e) = op(&mut call) {
        debug!(call = %entry.token, "Event handling ended with: {}", e);
    }
}

/// Execute queued actions until the call has nothing more to send
async fn drive(inner: &Arc<ManagerInner>, entry: &Arc<CallEntry>) {
    let _sending = entry.outbound.lock().await;
    loop {
        let actions = entry.record.lock().take_actions();
        if actions.is_empty() {
            break;
        }
        for action in actions {
            execute(inner, entry, action).await;
        }
    }
}

async fn execute(inner: &Arc<ManagerInner>, entry: &Arc<CallEntry>, action: CallAction) {
    match action {
        CallAction::SendQ931(message) => {
            let payload = match inner.ctx.codec.encode_q931(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(call = %entry.token, "Failed to encode {}: {}", message.message_type, e);
                    apply(entry, |call| call.end_call(CallEndReason::InvalidMessage));
                    return;
                }
            };
            if let Err(e) = entry.signaling.send_payload(payload).await {
                warn!(call = %entry.token, "Failed to send {}: {}", message.message_type, e);
                apply(entry, |call| call.on_signaling_closed());
            }
        }
        CallAction::SendH245(message) => {
            let transport = entry.h245.lock().clone();
            let Some(transport) = transport else {
                warn!(call = %entry.token, "No H.245 connection for {}", message.name());
                return;
            };
            match inner.ctx.codec.encode_h245(&message) {
                Ok(payload) => {
                    if let Err(e) = transport.send_payload(payload).await {
                        warn!(call = %entry.token, "Failed to send {}: {}", message.name(), e);
                        apply(entry, |call| call.on_h245_closed());
                    }
                }
                Err(e) => {
                    error!(call = %entry.token, "Failed to encode {}: {}", message.name(), e);
                    apply(entry, |call| call.end_call(CallEndReason::InvalidMessage));
                }
            }
        }
        CallAction::ConnectH245(addr) => spawn_h245_connect(inner.clone(), entry.clone(), addr),
        CallAction::CloseH245 => {
            let transport = entry.h245.lock().take();
            if let Some(transport) = transport {
                let _ = transport.close().await;
            }
        }
        CallAction::Released => {
            inner.calls.write().remove(&entry.token);
            let _ = entry.signaling.close().await;
            let transport = entry.h245.lock().take();
            if let Some(transport) = transport {
                let _ = transport.close().await;
            }
            info!(call = %entry.token, "Call released");
        }
    }
}

async fn serve_incoming(
    inner: Arc<ManagerInner>,
    transport: TcpTransport,
    events: mpsc::Receiver<TransportEvent>,
    peer: SocketAddr,
) {
    let record = CallRecord::new_incoming(inner.ctx.clone(), Some(peer));
    let entry = inner.register(record, transport);
    run_signaling_events(inner, entry, events).await;
}

async fn run_signaling_events(
    inner: Arc<ManagerInner>,
    entry: Arc<CallEntry>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::PayloadReceived { payload, source } => {
                match inner.ctx.codec.decode_q931(&payload) {
                    Ok(message) => {
                        let is_setup = message.message_type == Q931MessageType::Setup;
                        apply(&entry, |call| call.handle_q931(message));
                        let state = entry.record.lock().state();
                        if is_setup && state == CallState::WaitingAdmission {
                            spawn_admission(inner.clone(), entry.clone());
                        }
                        drive(&inner, &entry).await;
                    }
                    Err(e) => {
                        warn!(call = %entry.token, "Undecodable Q.931 from {}: {}", source, e)
                    }
                }
            }
            TransportEvent::Error { error } => {
                warn!(call = %entry.token, "Signaling receive error: {}", error)
            }
            TransportEvent::Closed => {
                apply(&entry, |call| call.on_signaling_closed());
                drive(&inner, &entry).await;
                break;
            }
        }
        if entry.record.lock().state() == CallState::Cleared {
            break;
        }
    }
    debug!(call = %entry.token, "Signaling event loop finished");
}

fn spawn_h245_connect(inner: Arc<ManagerInner>, entry: Arc<CallEntry>, addr: SocketAddr) {
    let task: BoxTask = Box::pin(async move {
        match TcpTransport::connect(addr, Some(CONNECT_TIMEOUT), None).await {
            Ok((transport, events)) => {
                *entry.h245.lock() = Some(transport);
                apply(&entry, |call| call.on_h245_connected(addr));
                drive(&inner, &entry).await;
                run_h245_events(inner, entry, events).await;
            }
            Err(e) => {
                let error = CallError::from(e);
                apply(&entry, |call| call.on_h245_connect_failed(&error));
                drive(&inner, &entry).await;
            }
        }
    });
    tokio::spawn(task);
}

async fn run_h245_events(
    inner: Arc<ManagerInner>,
    entry: Arc<CallEntry>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::PayloadReceived { payload, .. } => {
                match inner.ctx.codec.decode_h245(&payload) {
                    Ok(message) => {
                        apply(&entry, |call| call.handle_h245(message));
                        drive(&inner, &entry).await;
                    }
                    Err(e) => warn!(call = %entry.token, "Undecodable H.245 message: {}", e),
                }
            }
            TransportEvent::Error { error } => {
                warn!(call = %entry.token, "H.245 receive error: {}", error)
            }
            TransportEvent::Closed => {
                apply(&entry, |call| call.on_h245_closed());
                drive(&inner, &entry).await;
                break;
            }
        }
    }
}

fn spawn_admission(inner: Arc<ManagerInner>, entry: Arc<CallEntry>) {
    let Some(admission) = inner.admission.clone() else { return };
    let summary = entry.record.lock().summary();
    let limit = inner.ctx.config.timers.admission();

    let task: BoxTask = Box::pin(async move {
        match tokio::time::timeout(limit, admission.admit(summary)).await {
            Ok(decision) => apply(&entry, |call| call.admission_result(decision)),
            Err(_) => apply(&entry, |call| call.admission_timed_out()),
        }
        drive(&inner, &entry).await;
    });
    tokio::spawn(task);
}

/// Fire due timers of every call
async fn run_timer_pump(inner: Arc<ManagerInner>) {
    let mut interval = tokio::time::interval(TIMER_TICK);
    while inner.running.load(Ordering::SeqCst) {
        interval.tick().await;
        let now = Instant::now();
        let entries: Vec<_> = inner.calls.read().values().cloned().collect();
        for entry in entries {
            let deadline = entry.record.lock().next_timer_deadline();
            let due = deadline.is_some_and(|deadline| deadline <= now);
            if due {
                apply(&entry, |call| call.handle_timeout(now));
                drive(&inner, &entry).await;
            }
        }
    }
    debug!("Timer pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use rvoip_h323_proto::{JsonCodec, Q931Message};

    const DRIVERS: usize = 8;
    const PER_DRIVER: usize = 25;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_drivers_keep_send_order() {
        let (listener, mut accepted) =
            TpktListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (transport, _events) =
            TcpTransport::connect(listener.local_addr(), None, None).await.unwrap();
        let Some(ListenerEvent::Accepted { transport: _server, events: mut received, .. }) =
            accepted.recv().await
        else {
            panic!("connection not accepted");
        };

        let manager = CallManager::new(EndpointConfig::new()).unwrap();
        let record = CallRecord::new_outgoing(manager.inner.ctx.clone(), listener.local_addr());
        let entry = manager.inner.register(record, transport);

        // Numbers are assigned under the record lock, so they give the queue order
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..DRIVERS {
            let inner = manager.inner.clone();
            let entry = entry.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..PER_DRIVER {
                    {
                        let mut call = entry.record.lock();
                        let mut message = Q931Message::new(Q931MessageType::Information, 1, false);
                        message.display = Some(counter.fetch_add(1, Ordering::SeqCst).to_string());
                        call.actions.push(CallAction::SendQ931(message));
                    }
                    drive(&inner, &entry).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let codec = JsonCodec::new();
        for expected in 0..DRIVERS * PER_DRIVER {
            let event = tokio::time::timeout(Duration::from_secs(5), received.recv())
                .await
                .expect("message arrives")
                .expect("connection open");
            let TransportEvent::PayloadReceived { payload, .. } = event else {
                panic!("unexpected transport event");
            };
            let message = codec.decode_q931(&payload).unwrap();
            assert_eq!(message.display, Some(expected.to_string()));
        }
        listener.close();
    }
}
