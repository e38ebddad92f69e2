//! Call signaling flows between two call records wired back to back

mod common;

use std::time::{Duration, Instant};

use common::*;
use rvoip_h323_call::call::{
    CallContext, CallRecord, CallState, ChannelDirection, ChannelState, H245Link, MsdState,
};
use rvoip_h323_call::call::state::{LocalTcsState, RemoteTcsState};
use rvoip_h323_call::capability::build_capability_set;
use rvoip_h323_call::config::DtmfModes;
use rvoip_h323_call::errors::CallEndReason;
use rvoip_h323_call::handler::AdmissionDecision;
use rvoip_h323_proto::h245::{H245Message, RequestMessage, ResponseMessage, TransportAddress};
use rvoip_h323_proto::q931::{
    AliasAddress, ConnectUuie, FacilityReason, FacilityUuie, H323MessageBody, Q931Cause,
    Q931MessageType, ReleaseCompleteReason, ReleaseCompleteUuie,
};

#[test]
fn test_tunneled_call_negotiates_and_opens_media() {
    let (a, b) = connected_pair(config(), config());

    assert_eq!(a.call.state(), CallState::Connected);
    assert_eq!(b.call.state(), CallState::Connected);
    assert!(a.call.is_tunneling());
    assert!(b.call.is_tunneling());

    let roles = (a.call.msd_state(), b.call.msd_state());
    assert!(
        roles == (MsdState::Master, MsdState::Slave)
            || roles == (MsdState::Slave, MsdState::Master),
        "roles must be complementary, got {:?}",
        roles
    );

    for side in [&a, &b] {
        assert_eq!(side.call.local_tcs_state(), LocalTcsState::AckRecvd);
        assert_eq!(side.call.remote_tcs_state(), RemoteTcsState::AckSent);
        let established = |direction| {
            side.call
                .channels()
                .iter()
                .filter(|c| c.direction == direction && c.state == ChannelState::Established)
                .count()
        };
        assert_eq!(established(ChannelDirection::Transmit), 1);
        assert_eq!(established(ChannelDirection::Receive), 1);
        assert!(side.call.timers().is_empty(), "no protocol timer should remain armed");
    }

    let recorded_a = a.handler.recorded.lock();
    assert_eq!(recorded_a.connected, 1);
    assert_eq!(recorded_a.established, 1);
    assert_eq!(recorded_a.started_tx.len(), 1);
    assert_eq!(recorded_a.started_rx.len(), 1);

    let recorded_b = b.handler.recorded.lock();
    assert_eq!(recorded_b.incoming, 1);
    assert_eq!(recorded_b.established, 1);
}

#[test]
fn test_incoming_call_identity_from_setup() {
    let (_a, b) = connected_pair(config().with_e164("1000"), config());

    let identity = b.call.identity();
    assert_eq!(identity.calling_number.as_deref(), Some("1000"));
    assert_eq!(identity.called_number.as_deref(), Some("2000"));
    assert!(identity.caller_aliases.contains(&AliasAddress::H323Id("test-endpoint".into())));
    assert_eq!(b.call.remote_signal_addr(), Some(caller_addr()));
}

#[test]
fn test_connect_prefers_tunneling_over_h245_address() {
    let mut a = Side::outgoing(config());
    a.call.place_call(Vec::new(), None).unwrap();
    a.outbox();

    let remote_tcs = build_capability_set(1, &config().capabilities, DtmfModes::default());
    let body = H323MessageBody::Connect(ConnectUuie {
        h245_address: Some(TransportAddress::Unicast("192.0.2.20:1721".parse().unwrap())),
        ..Default::default()
    });
    let connect = q931_from_remote(
        Q931MessageType::Connect,
        body,
        Some(true),
        &[H245Message::Request(RequestMessage::TerminalCapabilitySet(remote_tcs))],
    );
    a.call.handle_q931(connect).unwrap();

    assert_eq!(a.call.state(), CallState::Connected);
    assert!(a.call.is_tunneling());
    assert_eq!(a.call.remote_h245_addr(), None);
    assert_eq!(a.call.h245_link(), H245Link::None);
    assert_eq!(a.call.last_remote_tcs_sequence(), Some(1));

    let sent = a.tunneled_h245();
    let ack = sent
        .iter()
        .position(|m| {
            matches!(m, H245Message::Response(ResponseMessage::TerminalCapabilitySetAck(_)))
        })
        .expect("piggybacked TCS acknowledged");
    let own_tcs = sent
        .iter()
        .position(|m| matches!(m, H245Message::Request(RequestMessage::TerminalCapabilitySet(_))))
        .expect("local TCS started");
    assert!(ack < own_tcs, "piggybacked H.245 is handled before local TCS starts");
}

#[test]
fn test_h245_address_without_tunneling_connects_separately() {
    let mut a = Side::outgoing(config());
    a.call.place_call(Vec::new(), None).unwrap();
    a.outbox();

    let h245_addr = "192.0.2.20:1721".parse().unwrap();
    let body = H323MessageBody::Connect(ConnectUuie {
        h245_address: Some(TransportAddress::Unicast(h245_addr)),
        ..Default::default()
    });
    a.call.handle_q931(q931_from_remote(Q931MessageType::Connect, body, Some(false), &[])).unwrap();

    assert!(!a.call.is_tunneling());
    assert_eq!(a.call.h245_link(), H245Link::Connecting);
    let outbox = a.outbox();
    assert_eq!(outbox.connect_h245, vec![h245_addr]);

    a.call.on_h245_connected(h245_addr).unwrap();
    assert_eq!(a.call.h245_link(), H245Link::Connected);
    let outbox = a.outbox();
    assert!(outbox.h245.iter().any(|m| {
        matches!(m, H245Message::Request(RequestMessage::TerminalCapabilitySet(_)))
    }));
    assert!(outbox.h245.iter().any(|m| {
        matches!(m, H245Message::Request(RequestMessage::MasterSlaveDetermination(_)))
    }));

    a.call.on_h245_closed().unwrap();
    assert_eq!(a.call.end_reason(), Some(CallEndReason::TransportFailure));
    assert_eq!(a.call.state(), CallState::Cleared);
    let outbox = a.outbox();
    assert!(outbox.q931.iter().any(|m| m.message_type == Q931MessageType::ReleaseComplete));
    assert!(outbox.released);
}

#[test]
fn test_h245_connect_failure_clears_call() {
    let mut a = Side::outgoing(config().with_tunneling(false));
    a.call.place_call(Vec::new(), None).unwrap();
    let body = H323MessageBody::Connect(ConnectUuie {
        h245_address: Some(TransportAddress::Unicast("192.0.2.20:1721".parse().unwrap())),
        ..Default::default()
    });
    a.call.handle_q931(q931_from_remote(Q931MessageType::Connect, body, None, &[])).unwrap();
    assert_eq!(a.call.h245_link(), H245Link::Connecting);

    let error = rvoip_h323_call::errors::CallError::protocol("connection refused");
    a.call.on_h245_connect_failed(&error).unwrap();
    assert_eq!(a.call.end_reason(), Some(CallEndReason::TransportFailure));
    assert_eq!(a.call.state(), CallState::Cleared);
}

#[test]
fn test_fast_start_call_establishes_media_without_h245_channels() {
    let fast = config().with_fast_start(true);
    let (a, b) = connected_pair(fast.clone(), fast);

    assert!(a.call.is_fast_start());
    assert!(a.call.is_fast_start_answered());
    assert!(b.call.is_fast_start_answered());

    for side in [&a, &b] {
        assert_eq!(side.call.channels().len(), 2, "one channel per direction survives");
        assert!(side.call.channels().iter().all(|c| c.state == ChannelState::Established));
        assert!(side.call.channels().has_direction(ChannelDirection::Transmit));
        assert!(side.call.channels().has_direction(ChannelDirection::Receive));
    }
    assert_eq!(a.handler.recorded.lock().started_tx.len(), 1);
    assert_eq!(b.handler.recorded.lock().started_rx.len(), 1);
}

#[test]
fn test_unanswered_fast_start_falls_back_to_h245() {
    let (a, b) = connected_pair(config().with_fast_start(true), config());

    assert!(!a.call.is_fast_start());
    assert!(a.call.channels().iter().all(|c| c.state != ChannelState::ProposedFastStart));
    assert!(a.call.channels().has_direction(ChannelDirection::Transmit));
    assert!(b.call.channels().has_direction(ChannelDirection::Receive));
}

#[test]
fn test_call_forwarded_facility_ends_call() {
    let mut a = proceeding(config());
    a.outbox();

    let mut facility = FacilityUuie::new(FacilityReason::CallForwarded);
    facility.alternative_alias_address = vec![AliasAddress::H323Id("bob".into())];
    let body = H323MessageBody::Facility(facility);
    let message = q931_from_remote(Q931MessageType::Facility, body, Some(true), &[]);
    a.call.handle_q931(message).unwrap();

    assert_eq!(a.call.end_reason(), Some(CallEndReason::RemoteForwarded));
    assert_eq!(a.call.state(), CallState::Cleared);
    let target = a.call.forward_target().expect("forward target recorded");
    assert_eq!(target.aliases, vec![AliasAddress::H323Id("bob".into())]);
    assert_eq!(a.handler.recorded.lock().forwarded.len(), 1);

    let outbox = a.outbox();
    let release = outbox
        .q931
        .iter()
        .find(|m| m.message_type == Q931MessageType::ReleaseComplete)
        .expect("ReleaseComplete sent");
    assert_eq!(release.cause, Some(0x80 | Q931Cause::Redirection.value()));
}

#[test]
fn test_call_forwarded_without_target_is_invalid() {
    let mut a = proceeding(config());
    let facility = FacilityUuie::new(FacilityReason::CallForwarded);
    let body = H323MessageBody::Facility(facility);
    let message = q931_from_remote(Q931MessageType::Facility, body, Some(true), &[]);
    assert!(a.call.handle_q931(message).is_err());
    assert_eq!(a.call.end_reason(), Some(CallEndReason::InvalidMessage));
}

#[test]
fn test_start_h245_facility_switches_off_tunneling() {
    let mut a = proceeding(config());
    a.outbox();

    let h245_addr = "192.0.2.20:1730".parse().unwrap();
    let mut facility = FacilityUuie::new(FacilityReason::StartH245);
    facility.h245_address = Some(TransportAddress::Unicast(h245_addr));
    let body = H323MessageBody::Facility(facility);
    let message = q931_from_remote(Q931MessageType::Facility, body, None, &[]);
    a.call.handle_q931(message).unwrap();

    assert!(!a.call.is_tunneling());
    assert_eq!(a.call.remote_h245_addr(), Some(h245_addr));
    assert_eq!(a.outbox().connect_h245, vec![h245_addr]);
}

#[test]
fn test_release_complete_maps_cause_to_end_reason() {
    let (mut a, mut b) = connected_pair(config(), config());

    let body = H323MessageBody::ReleaseComplete(ReleaseCompleteUuie {
        call_identifier: None,
        reason: Some(ReleaseCompleteReason::DestinationRejection),
    });
    let release = q931_from_remote(Q931MessageType::ReleaseComplete, body, Some(true), &[])
        .with_cause(Q931Cause::UserBusy);
    a.call.handle_q931(release).unwrap();

    assert_eq!(a.call.state(), CallState::Cleared);
    assert_eq!(a.call.end_reason(), Some(CallEndReason::RemoteBusy));
    assert_eq!(a.call.q931_cause(), Some(Q931Cause::UserBusy));
    assert_eq!(a.call.release_reason(), Some(ReleaseCompleteReason::DestinationRejection));

    let outbox = a.outbox();
    assert!(outbox.released);
    assert!(
        outbox.q931.iter().all(|m| m.message_type != Q931MessageType::ReleaseComplete),
        "no ReleaseComplete is sent back"
    );

    let recorded = a.handler.recorded.lock();
    assert_eq!(recorded.cleared, 1);
    assert_eq!(recorded.stopped_tx.len(), 1);
    assert_eq!(recorded.stopped_rx.len(), 1);
    drop(recorded);

    // The other side is untouched until it hears about it
    pump(&mut a, &mut b);
    assert_eq!(b.call.state(), CallState::Connected);
}

#[test]
fn test_local_hang_up_sends_end_session_and_release() {
    let (mut a, mut b) = connected_pair(config(), config());

    a.call.end_call(CallEndReason::LocalCleared).unwrap();
    assert_eq!(a.call.state(), CallState::Cleared);

    let outbox = a.outbox();
    let types: Vec<_> = outbox.q931.iter().map(|m| m.message_type).collect();
    assert_eq!(types.last(), Some(&Q931MessageType::ReleaseComplete));
    let carries_end_session = outbox
        .q931
        .iter()
        .filter_map(|m| m.user_info.as_ref())
        .flat_map(|info| info.h245_control.iter())
        .any(|data| {
            use rvoip_h323_proto::MessageCodec;
            rvoip_h323_proto::JsonCodec::new().decode_h245(data).unwrap().is_end_session()
        });
    assert!(carries_end_session, "EndSessionCommand rides in a Facility before ReleaseComplete");

    outbox.deliver(&mut b.call);
    pump(&mut a, &mut b);
    assert_eq!(b.call.state(), CallState::Cleared);
    assert_eq!(b.call.end_reason(), Some(CallEndReason::RemoteCleared));
    assert!(b.call.channels().is_empty());
    assert_eq!(b.handler.recorded.lock().cleared, 1);

    // Once cleared nothing moves the call again
    assert!(a.call.end_call(CallEndReason::Unknown).is_ok());
    assert_eq!(a.call.end_reason(), Some(CallEndReason::LocalCleared));
}

#[test]
fn test_end_session_wait_times_out_after_release() {
    let mut a = Side::outgoing(config());
    a.call.place_call(Vec::new(), None).unwrap();
    a.outbox();

    let h245_addr = "192.0.2.20:1721".parse().unwrap();
    let body = H323MessageBody::Connect(ConnectUuie {
        h245_address: Some(TransportAddress::Unicast(h245_addr)),
        ..Default::default()
    });
    a.call.handle_q931(q931_from_remote(Q931MessageType::Connect, body, Some(false), &[])).unwrap();
    a.call.on_h245_connected(h245_addr).unwrap();
    a.outbox();

    a.call.end_call(CallEndReason::LocalCleared).unwrap();
    assert_eq!(a.call.state(), CallState::ClearReleaseSent);
    let outbox = a.outbox();
    assert!(outbox.h245.iter().any(|m| m.is_end_session()));
    assert!(outbox.q931.iter().any(|m| m.message_type == Q931MessageType::ReleaseComplete));
    assert!(!outbox.released);

    // The remote never answers the EndSessionCommand
    a.call.handle_timeout(Instant::now() + Duration::from_secs(16)).unwrap();

    assert_eq!(a.call.state(), CallState::Cleared);
    assert_eq!(a.call.end_reason(), Some(CallEndReason::LocalCleared));
    let outbox = a.outbox();
    assert_eq!(outbox.close_h245, 1);
    assert!(outbox.released);
    assert!(outbox.q931.is_empty(), "ReleaseComplete is not repeated");
}

#[test]
fn test_call_establishment_timeout() {
    let mut a = Side::outgoing(config());
    a.call.place_call(Vec::new(), None).unwrap();
    assert_eq!(a.call.state(), CallState::Connecting);

    a.call.handle_timeout(Instant::now() + Duration::from_secs(61)).unwrap();
    assert_eq!(a.call.end_reason(), Some(CallEndReason::RemoteNoAnswer));
    assert_eq!(a.call.state(), CallState::Cleared);
}

#[test]
fn test_signaling_loss_clears_without_release() {
    let (mut a, _b) = connected_pair(config(), config());
    a.call.on_signaling_closed().unwrap();

    assert_eq!(a.call.state(), CallState::Cleared);
    assert_eq!(a.call.end_reason(), Some(CallEndReason::TransportFailure));
    let outbox = a.outbox();
    assert!(outbox.q931.is_empty());
    assert!(outbox.released);
}

#[test]
fn test_answer_requires_incoming_connecting_call() {
    let mut a = Side::outgoing(config());
    assert!(a.call.answer_call().is_err());
    assert!(a.call.send_alerting().is_err());
    assert_eq!(a.call.state(), CallState::Created);
}

#[test]
fn test_alerting_reaches_caller() {
    let mut a = Side::outgoing(config());
    let mut b = Side::incoming(config());
    a.call.place_call(Vec::new(), None).unwrap();
    pump(&mut a, &mut b);

    b.call.send_alerting().unwrap();
    pump(&mut a, &mut b);
    assert_eq!(a.handler.recorded.lock().alerting, 1);
    assert_eq!(a.call.state(), CallState::Connecting);
}

fn admission_side() -> Side {
    let handler = RecordingHandler::new();
    let ctx = CallContext::new(config()).with_handler(handler.clone()).with_admission(true);
    Side { call: CallRecord::new_incoming(ctx, Some(caller_addr())), handler }
}

fn setup_from(a: &mut Side) -> Vec<rvoip_h323_proto::q931::Q931Message> {
    a.call.place_call(Vec::new(), Some("2000".into())).unwrap();
    a.outbox().q931
}

#[test]
fn test_admission_holds_call_until_decided() {
    let mut a = Side::outgoing(config());
    let mut b = admission_side();
    for message in setup_from(&mut a) {
        b.call.handle_q931(message).unwrap();
    }

    assert_eq!(b.call.state(), CallState::WaitingAdmission);
    assert!(b.outbox().q931.is_empty(), "nothing is sent while admission is pending");
    assert_eq!(b.call.summary().called_number.as_deref(), Some("2000"));

    b.call.admission_result(AdmissionDecision::Admit).unwrap();
    assert_eq!(b.call.state(), CallState::Connecting);
    assert_eq!(b.handler.recorded.lock().incoming, 1);
    let outbox = b.outbox();
    assert_eq!(outbox.q931[0].message_type, Q931MessageType::CallProceeding);
}

#[test]
fn test_admission_rejection_releases_call() {
    let mut a = Side::outgoing(config());
    let mut b = admission_side();
    for message in setup_from(&mut a) {
        b.call.handle_q931(message).unwrap();
    }

    b.call.admission_result(AdmissionDecision::Reject(CallEndReason::LocalBusy)).unwrap();
    assert_eq!(b.call.state(), CallState::Cleared);
    assert_eq!(b.call.end_reason(), Some(CallEndReason::LocalBusy));
    let outbox = b.outbox();
    assert_eq!(outbox.q931.len(), 1);
    assert_eq!(outbox.q931[0].message_type, Q931MessageType::ReleaseComplete);

    outbox.deliver(&mut a.call);
    assert_eq!(a.call.end_reason(), Some(CallEndReason::RemoteBusy));
}

#[test]
fn test_admission_timeout_reports_unreachable_gatekeeper() {
    let mut a = Side::outgoing(config());
    let mut b = admission_side();
    for message in setup_from(&mut a) {
        b.call.handle_q931(message).unwrap();
    }

    b.call.admission_timed_out().unwrap();
    assert_eq!(b.call.end_reason(), Some(CallEndReason::GatekeeperUnreachable));
    assert_eq!(b.call.state(), CallState::Cleared);

    // A late decision is ignored
    b.call.admission_result(AdmissionDecision::Admit).unwrap();
    assert_eq!(b.call.state(), CallState::Cleared);
}
