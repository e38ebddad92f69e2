//! Two call managers talking over loopback TCP

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use rvoip_h323_call::prelude::*;

/// Forwards the token of every admitted incoming call
struct IncomingCalls {
    tx: mpsc::UnboundedSender<CallToken>,
}

impl CallEventHandler for IncomingCalls {
    fn on_incoming_call(&self, call: &CallRecord) {
        let _ = self.tx.send(call.token().clone());
    }
}

fn loopback_config(name: &str) -> EndpointConfig {
    let config = EndpointConfig::new()
        .with_h323_id(name)
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_logging(LoggingConfig::default().with_directive("rvoip_h323_call=debug"));
    // Only the first test in the binary installs the subscriber
    let _ = setup_logging(&config.logging);
    config
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_call_setup_and_hang_up_over_tcp() {
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let callee = CallManager::builder(loopback_config("bob"))
        .handler(Arc::new(IncomingCalls { tx }))
        .build()
        .unwrap();
    let callee_addr = callee.start().await.unwrap();

    let (unused_tx, _unused_rx) = mpsc::unbounded_channel();
    let caller = CallManager::builder(loopback_config("alice"))
        .handler(Arc::new(IncomingCalls { tx: unused_tx }))
        .build()
        .unwrap();
    caller.start().await.unwrap();

    let outgoing = caller.make_call(callee_addr, Vec::new(), Some("2000".into())).await.unwrap();
    let answered = timeout(Duration::from_secs(5), incoming.recv())
        .await
        .expect("incoming call announced")
        .expect("handler alive");

    assert_eq!(
        callee.with_call(&answered, |call| call.identity().called_number.clone()).flatten(),
        Some("2000".to_string())
    );
    callee.answer_call(&answered).await.unwrap();

    wait_for("caller connected", || {
        caller.call_state(&outgoing) == Some(CallState::Connected)
    })
    .await;
    wait_for("media channels on both sides", || {
        let has_both = |manager: &CallManager, token: &CallToken| {
            manager
                .with_call(token, |call| {
                    call.channels().has_direction(ChannelDirection::Transmit)
                        && call.channels().has_direction(ChannelDirection::Receive)
                })
                .unwrap_or(false)
        };
        has_both(&caller, &outgoing) && has_both(&callee, &answered)
    })
    .await;

    caller.hang_up(&outgoing, CallEndReason::LocalCleared).await.unwrap();
    wait_for("caller released", || caller.active_calls().is_empty()).await;
    wait_for("callee released", || callee.active_calls().is_empty()).await;

    caller.shutdown().await;
    callee.shutdown().await;
}

#[tokio::test]
async fn test_unknown_call_token() {
    let manager = CallManager::new(loopback_config("carol")).unwrap();
    let result = manager.answer_call(&CallToken::new("missing")).await;
    assert!(matches!(result, Err(CallError::CallNotFound { .. })));
    assert_eq!(manager.call_state(&CallToken::new("missing")), None);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let manager = CallManager::new(loopback_config("dave")).unwrap();
    manager.start().await.unwrap();
    assert!(manager.start().await.is_err());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let manager = CallManager::new(loopback_config("erin")).unwrap();
    // Bind and drop to find a port nobody listens on
    let addr = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    assert!(manager.make_call(addr, Vec::new(), None).await.is_err());
    assert!(manager.active_calls().is_empty());
}
