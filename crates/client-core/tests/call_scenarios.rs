use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serial_test::serial;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use softphone_client_core::testing::{self, MockSignaling, SignalingCall};
use softphone_client_core::{
    CallState, ClientError, ConnectionAddress, FailureReason, MediaDescription, NegotiationWarning, Phone, PhoneConfig,
    PhoneEvent, SipStatus, TransmitMode,
};
use softphone_media_core::MediaSettings;
use softphone_rtp_core::{DtmfEvent, DtmfTone, RtpHeader, RtpPacket};

const USER: &str = "100";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("softphone_client_core=debug,softphone_media_core=info")
        .with_test_writer()
        .try_init();
}

fn config() -> PhoneConfig {
    PhoneConfig::new("127.0.0.1", 5060, USER, "secret")
        .with_local_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_rtp_port_range(10000..=15000)
        .with_transfer_settle(Duration::from_millis(10))
        .with_media_settings(MediaSettings::default().with_keepalive_interval(Duration::from_millis(50)))
}

async fn started_phone() -> (Arc<Phone>, Arc<MockSignaling>) {
    init_tracing();
    let signaling = Arc::new(MockSignaling::new(USER));
    let phone = Phone::new(config(), signaling.clone()).unwrap();
    phone.start().await.unwrap();
    (phone, signaling)
}

async fn peer() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

fn drain(rx: &mut broadcast::Receiver<PhoneEvent>) -> Vec<PhoneEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn states(events: &[PhoneEvent]) -> Vec<CallState> {
    events
        .iter()
        .filter_map(|e| match e {
            PhoneEvent::CallStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
#[serial]
async fn inbound_call_is_answered_with_one_stream() {
    let (phone, signaling) = started_phone().await;
    let mut events = phone.subscribe();
    let (remote, remote_port) = peer().await;

    phone
        .on_call(testing::invite("in-1", "300", USER, remote_port, vec![0, 101]))
        .await
        .unwrap();

    let call = phone.get_call("in-1").unwrap();
    assert_eq!(call.state(), CallState::RingingMe);
    assert_eq!(call.stream_count(), 1);
    assert_eq!(call.number(), "300");
    assert_eq!(call.display_name(), "Caller 300");
    assert_eq!(phone.sessions_in_use(), 1);
    assert_eq!(phone.ports_in_use(), 1);
    assert_eq!(states(&drain(&mut events)), vec![CallState::RingingMe]);

    phone.answer("in-1").await.unwrap();
    assert_eq!(call.state(), CallState::Online);
    assert!(call.connected_at().is_some());
    let streams = call.streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_running());

    let answers = signaling.recorded_kind("answer");
    assert_eq!(answers.len(), 1);
    match &answers[0] {
        SignalingCall::Answer { call_id, plan, mode, .. } => {
            assert_eq!(call_id, "in-1");
            let (port, association) = plan.iter().next().unwrap();
            assert!((10000..=15000).contains(port));
            assert_eq!(association.telephone_event_id(), Some(101));
            assert_eq!(*mode, TransmitMode::SendRecv);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Media reaches the remote side from the allocated port
    let mut buf = [0u8; 1500];
    let (len, from) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(len >= 12);
    assert_eq!(from.port(), streams[0].local_addr().port());
    assert_eq!(states(&drain(&mut events)), vec![CallState::Online]);

    // A second answer is a state error
    assert!(phone.answer("in-1").await.unwrap_err().is_state_error());

    phone.hangup("in-1").await.unwrap();
    assert_eq!(call.state(), CallState::End);
    assert!(!phone.calls().contains("in-1"));
    assert_eq!(phone.ports_in_use(), 0);
    assert_eq!(phone.sessions_in_use(), 0);
    assert!(!streams[0].is_running());
    assert_eq!(signaling.count("bye"), 1);
}

#[tokio::test]
#[serial]
async fn outbound_call_progresses_to_online() {
    let (phone, signaling) = started_phone().await;
    let mut events = phone.subscribe();
    let (remote, remote_port) = peer().await;

    let call = phone.call("5551234").await.unwrap();
    let call_id = call.call_id().to_string();
    assert_eq!(call.state(), CallState::Dialing);
    assert_eq!(call.stream_count(), 0);
    assert_eq!(call.number(), "5551234");

    let port = *call.media_plan().keys().next().unwrap();
    assert!((10000..=15000).contains(&port));
    assert_eq!(call.local_ports(), vec![port]);
    match &signaling.recorded_kind("invite")[0] {
        SignalingCall::Invite { number, plan, .. } => {
            assert_eq!(number, "5551234");
            assert!(plan.contains_key(&port));
        }
        other => panic!("unexpected {other:?}"),
    }

    phone
        .on_call(testing::response(&call_id, SipStatus::Trying, USER, "5551234"))
        .await
        .unwrap();
    phone
        .on_call(testing::response(&call_id, SipStatus::Ringing, USER, "5551234"))
        .await
        .unwrap();
    assert_eq!(call.state(), CallState::Ringing);

    phone
        .on_call(testing::ok_with_audio(&call_id, USER, "5551234", remote_port))
        .await
        .unwrap();
    assert_eq!(call.state(), CallState::Online);
    assert_eq!(call.stream_count(), 1);
    assert_eq!(call.streams()[0].local_addr().port(), port);
    assert_eq!(call.request().to.tag.as_deref(), Some("remote-tag"));

    let mut buf = [0u8; 1500];
    timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        states(&drain(&mut events)),
        vec![
            CallState::Dialing,
            CallState::Dialing,
            CallState::Ringing,
            CallState::Online,
            CallState::Answered
        ]
    );

    // Remote hangs up
    phone
        .on_call(testing::response(&call_id, SipStatus::Bye, USER, "5551234"))
        .await
        .unwrap();
    assert_eq!(call.state(), CallState::End);
    assert!(phone.calls().is_empty());
    assert_eq!(phone.ports_in_use(), 0);
    assert_eq!(states(&drain(&mut events)), vec![CallState::End]);
}

#[tokio::test]
#[serial]
async fn hold_and_resume_toggle_streams() {
    let (phone, signaling) = started_phone().await;
    let (_remote, remote_port) = peer().await;

    phone
        .on_call(testing::invite("in-2", "300", USER, remote_port, vec![0, 101]))
        .await
        .unwrap();
    phone.answer("in-2").await.unwrap();
    let call = phone.get_call("in-2").unwrap();
    let stream = call.streams()[0].clone();

    // Resume is only valid while held
    assert!(phone.hold("in-2", false).await.unwrap_err().is_state_error());

    phone.hold("in-2", true).await.unwrap();
    assert_eq!(call.state(), CallState::Hold);
    assert!(stream.is_on_hold());
    sleep(Duration::from_millis(60)).await;
    let sent_while_held = stream.stats().packets_sent;
    sleep(Duration::from_millis(150)).await;
    assert_eq!(stream.stats().packets_sent, sent_while_held);
    assert!(stream.stats().keepalives_sent >= 1);

    phone.hold("in-2", false).await.unwrap();
    assert_eq!(call.state(), CallState::Online);
    assert!(!stream.is_on_hold());
    sleep(Duration::from_millis(100)).await;
    assert!(stream.stats().packets_sent > sent_while_held);

    let holds: Vec<_> = signaling
        .recorded_kind("hold")
        .into_iter()
        .filter_map(|c| match c {
            SignalingCall::Hold(hold) => Some(hold),
            _ => None,
        })
        .collect();
    assert_eq!(holds.len(), 2);
    assert!(holds[0].is_hold);
    assert_eq!(holds[0].transmit_mode, TransmitMode::SendOnly);
    assert_eq!(holds[0].call_to, "300");
    assert_eq!(holds[0].tag_to.as_deref(), Some("remote-tag"));
    assert!(!holds[1].is_hold);
    assert_eq!(holds[1].transmit_mode, TransmitMode::SendRecv);
    // The nonce from the first re-INVITE is reused
    assert_eq!(holds[1].nonce.as_deref(), Some("hold-nonce"));

    phone.hangup("in-2").await.unwrap();
}

#[tokio::test]
#[serial]
async fn remote_hold_via_reinvite() {
    let (phone, signaling) = started_phone().await;
    let (_remote, remote_port) = peer().await;

    phone
        .on_call(testing::invite("in-3", "300", USER, remote_port, vec![0]))
        .await
        .unwrap();
    phone.answer("in-3").await.unwrap();
    let call = phone.get_call("in-3").unwrap();

    let mut reinvite = testing::invite("in-3", "300", USER, remote_port + 2, vec![0]);
    if let Some(body) = reinvite.body.as_mut() {
        body.transmit_mode = TransmitMode::SendOnly;
    }
    phone.on_call(reinvite).await.unwrap();

    assert_eq!(call.state(), CallState::OnlineHold);
    assert_eq!(call.streams()[0].remote_addr().port(), remote_port + 2);
    assert_eq!(call.streams()[0].transmit_mode(), TransmitMode::RecvOnly);
    assert_eq!(phone.calls().len(), 1);
    match signaling.recorded_kind("answer").last().unwrap() {
        SignalingCall::Answer { mode, .. } => assert_eq!(*mode, TransmitMode::RecvOnly),
        other => panic!("unexpected {other:?}"),
    }

    // Resuming restores both directions
    phone
        .on_call(testing::invite("in-3", "300", USER, remote_port + 2, vec![0]))
        .await
        .unwrap();
    assert_eq!(call.state(), CallState::Online);
    assert_eq!(call.streams()[0].transmit_mode(), TransmitMode::SendRecv);

    // Hangup is allowed while the remote side holds
    phone.hangup("in-3").await.unwrap();
    assert!(phone.calls().is_empty());
}

#[tokio::test]
#[serial]
async fn reinvite_matches_streams_by_media_line() {
    let (phone, _signaling) = started_phone().await;
    let mut events = phone.subscribe();
    let (_remote, remote_port) = peer().await;

    let mut body = testing::audio_body(remote_port, vec![0]);
    body.media.push(MediaDescription::audio(remote_port + 10, vec![0]));
    phone
        .on_call(testing::invite("in-4", "300", USER, remote_port, vec![0]).with_body(body))
        .await
        .unwrap();
    phone.answer("in-4").await.unwrap();
    let call = phone.get_call("in-4").unwrap();
    let original = call.streams();
    assert_eq!(original.len(), 2);
    assert_eq!(original[1].remote_addr().port(), remote_port + 10);
    drain(&mut events);

    // The first line now offers nothing usable, the second moves
    let mut body = testing::audio_body(remote_port + 2, vec![18]);
    body.media[0] = body.media[0].clone().with_rtpmap(18, "G729", 8000);
    body.media.push(MediaDescription::audio(remote_port + 12, vec![0]));
    phone
        .on_call(testing::invite("in-4", "300", USER, remote_port, vec![0]).with_body(body))
        .await
        .unwrap();

    let streams = call.streams();
    assert_eq!(streams.len(), 1);
    assert!(Arc::ptr_eq(&streams[0], &original[1]));
    assert_eq!(streams[0].remote_addr().port(), remote_port + 12);
    assert!(streams[0].is_running());
    assert!(!original[0].is_running());
    assert_eq!(call.state(), CallState::Online);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        PhoneEvent::NegotiationWarning {
            warning: NegotiationWarning::NoCompatibleCodecs { .. },
            ..
        }
    )));

    phone.hangup("in-4").await.unwrap();
    assert_eq!(phone.ports_in_use(), 0);
}

#[tokio::test]
#[serial]
async fn not_found_ends_dialing_call_once() {
    let (phone, _signaling) = started_phone().await;
    let mut events = phone.subscribe();

    let call = phone.call("5559999").await.unwrap();
    let call_id = call.call_id().to_string();
    let not_found = testing::response(&call_id, SipStatus::NotFound, USER, "5559999");

    phone.on_call(not_found.clone()).await.unwrap();
    assert_eq!(call.state(), CallState::End);
    assert!(!phone.calls().contains(&call_id));
    assert_eq!(phone.ports_in_use(), 0);
    assert_eq!(phone.sessions_in_use(), 0);

    // Repeats change nothing
    assert!(call.not_found(&not_found).await.is_none());
    phone.on_call(not_found).await.unwrap();

    let failures: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PhoneEvent::CallFailed { failure } => Some(failure),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, FailureReason::NotFound);
    assert_eq!(failures[0].number, "5559999");
}

#[tokio::test]
#[serial]
async fn unavailable_and_busy_end_outbound_calls() {
    let (phone, _signaling) = started_phone().await;

    let first = phone.call("200").await.unwrap();
    phone
        .on_call(testing::response(first.call_id(), SipStatus::TemporarilyUnavailable, USER, "200"))
        .await
        .unwrap();
    assert_eq!(first.state(), CallState::End);

    let second = phone.call("201").await.unwrap();
    phone
        .on_call(testing::response(second.call_id(), SipStatus::Ringing, USER, "201"))
        .await
        .unwrap();
    phone
        .on_call(testing::response(second.call_id(), SipStatus::BusyHere, USER, "201"))
        .await
        .unwrap();
    assert_eq!(second.state(), CallState::End);
    assert!(phone.calls().is_empty());
    assert_eq!(phone.ports_in_use(), 0);
}

#[tokio::test]
#[serial]
async fn deny_sends_busy_or_cancel() {
    let (phone, signaling) = started_phone().await;
    let (_remote, remote_port) = peer().await;

    phone
        .on_call(testing::invite("in-4", "300", USER, remote_port, vec![0, 101]))
        .await
        .unwrap();
    let inbound = phone.get_call("in-4").unwrap();
    phone.deny("in-4").await.unwrap();
    assert_eq!(inbound.state(), CallState::End);
    assert_eq!(inbound.stream_count(), 0);
    assert_eq!(signaling.count("busy"), 1);

    let outbound = phone.call("5551234").await.unwrap();
    outbound.deny().await.unwrap();
    assert_eq!(signaling.count("cancel"), 1);
    assert_eq!(signaling.count("busy"), 1);

    assert!(phone.calls().is_empty());
    assert_eq!(phone.ports_in_use(), 0);
    assert!(matches!(
        phone.deny("in-4").await,
        Err(ClientError::CallNotFound { .. })
    ));
}

#[tokio::test]
#[serial]
async fn transfer_holds_then_refers() {
    let (phone, signaling) = started_phone().await;
    let (_remote, remote_port) = peer().await;
    let (_other, other_port) = peer().await;

    phone
        .on_call(testing::invite("in-5", "300", USER, remote_port, vec![0, 101]))
        .await
        .unwrap();
    phone.answer("in-5").await.unwrap();
    phone
        .on_call(testing::invite("in-6", "400", USER, other_port, vec![0, 101]))
        .await
        .unwrap();
    phone.answer("in-6").await.unwrap();

    let call = phone.get_call("in-5").unwrap();
    phone.transfer("in-5", "500", Some("in-6")).await.unwrap();
    assert_eq!(call.state(), CallState::TransferAccepted);
    assert!(call.streams().iter().all(|s| s.is_on_hold()));

    let recorded = signaling.recorded();
    let hold_at = recorded.iter().position(|c| c.kind() == "hold").unwrap();
    let transfer_at = recorded.iter().position(|c| c.kind() == "transfer").unwrap();
    assert!(hold_at < transfer_at);
    match &recorded[transfer_at] {
        SignalingCall::Transfer(transfer) => {
            assert_eq!(transfer.refer_to, "500");
            assert_eq!(transfer.number, "300");
            let replaces = transfer.replaces.as_ref().unwrap();
            assert_eq!(replaces.call_id, "in-6");
            // Tags are oriented to this phone
            assert_eq!(replaces.to.tag.as_deref(), Some("remote-tag"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // Transfer of a call that is no longer online fails the guard
    assert!(phone.transfer("in-5", "500", None).await.unwrap_err().is_state_error());

    phone
        .on_call(testing::response("in-5", SipStatus::TransferAccepted, "300", USER))
        .await
        .unwrap();
    assert!(!phone.calls().contains("in-5"));
    phone.hangup("in-6").await.unwrap();
}

#[tokio::test]
#[serial]
async fn failed_transfer_is_declined() {
    let (phone, signaling) = started_phone().await;
    let (_remote, remote_port) = peer().await;
    signaling.fail_on("transfer");

    phone
        .on_call(testing::invite("in-7", "300", USER, remote_port, vec![0]))
        .await
        .unwrap();
    phone.answer("in-7").await.unwrap();

    let err = phone.transfer("in-7", "500", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Signaling { .. }));
    let call = phone.get_call("in-7").unwrap();
    assert_eq!(call.state(), CallState::TransferDecline);

    assert!(matches!(
        phone.transfer("in-7", "500", Some("missing")).await,
        Err(ClientError::InvalidCallState { .. })
    ));
    call.cancel().await.unwrap();
    assert!(phone.calls().is_empty());
}

#[tokio::test]
#[serial]
async fn rejected_answer_stops_media_and_ends_call() {
    let (phone, signaling) = started_phone().await;
    let mut events = phone.subscribe();
    let (_remote, remote_port) = peer().await;
    signaling.fail_on("answer");

    phone
        .on_call(testing::invite("in-ans", "300", USER, remote_port, vec![0, 101]))
        .await
        .unwrap();
    let call = phone.get_call("in-ans").unwrap();
    let streams = call.streams();
    assert_eq!(streams.len(), 1);

    let err = phone.answer("in-ans").await.unwrap_err();
    assert!(matches!(err, ClientError::Signaling { .. }));
    assert_eq!(call.state(), CallState::End);
    assert!(!streams[0].is_running());
    assert!(!phone.calls().contains("in-ans"));
    assert_eq!(phone.ports_in_use(), 0);
    assert_eq!(phone.sessions_in_use(), 0);
    assert_eq!(
        states(&drain(&mut events)),
        vec![CallState::RingingMe, CallState::End]
    );
}

#[tokio::test]
#[serial]
async fn received_dtmf_is_captured_when_armed() {
    let (phone, _signaling) = started_phone().await;
    let (remote, remote_port) = peer().await;

    phone
        .on_call(testing::invite("in-8", "300", USER, remote_port, vec![0, 101]))
        .await
        .unwrap();
    phone.answer("in-8").await.unwrap();
    let call = phone.get_call("in-8").unwrap();
    let local = call.streams()[0].local_addr();

    let send_key = |seq: u16, tone: DtmfTone| {
        let header = RtpHeader::new(101, seq, 8000, 0x1234).with_marker(true);
        RtpPacket::new(header, DtmfEvent::key_press(tone).to_bytes()).build().unwrap()
    };

    // Not armed: ignored
    remote.send_to(&send_key(1, DtmfTone::Digit1), local).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(call.get_dtmf(1), "");

    call.arm_dtmf();
    remote.send_to(&send_key(2, DtmfTone::Digit9), local).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(call.get_dtmf(1), "9");

    // Outbound digits go out on the telephone-event payload type
    phone.send_dtmf("in-8", '#').await.unwrap();
    let mut buf = [0u8; 1500];
    let mut saw_event = false;
    for _ in 0..200 {
        let (len, _) = timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if let Ok(packet) = RtpPacket::decode(&buf[..len]) {
            if packet.header.payload_type == 101 {
                assert_eq!(packet.payload, Bytes::from_static(&[11, 0x8a, 0x03, 0x20]));
                saw_event = true;
                break;
            }
        }
    }
    assert!(saw_event);
    assert!(matches!(
        phone.send_dtmf("in-8", 'z').await,
        Err(ClientError::InvalidDtmf { digit: 'z' })
    ));

    phone.hangup("in-8").await.unwrap();
}

#[tokio::test]
#[serial]
async fn audio_round_trip_through_call() {
    let (phone, _signaling) = started_phone().await;
    let (remote, remote_port) = peer().await;

    phone
        .on_call(testing::invite("in-9", "300", USER, remote_port, vec![0, 101]))
        .await
        .unwrap();
    phone.answer("in-9").await.unwrap();
    let call = phone.get_call("in-9").unwrap();
    let local = call.streams()[0].local_addr();

    for i in 0..3u16 {
        let packet = RtpPacket::new_with_payload(0, 10 + i, 1000 + 160 * i as u32, 0x4321, Bytes::from(vec![0x20; 160]));
        remote.send_to(&packet.build().unwrap(), local).await.unwrap();
    }

    let audio = timeout(Duration::from_secs(2), call.read_audio(480, true)).await.unwrap();
    assert_eq!(audio.len(), 480);
    assert!(audio.iter().all(|b| *b == 0x20));

    call.write_audio(&[0x33; 160]);
    let mut buf = [0u8; 1500];
    let mut heard = false;
    for _ in 0..200 {
        let (len, _) = timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if let Ok(packet) = RtpPacket::decode(&buf[..len]) {
            if packet.payload.iter().all(|b| *b == 0x33) {
                heard = true;
                break;
            }
        }
    }
    assert!(heard);

    phone.hangup("in-9").await.unwrap();
}

#[tokio::test]
#[serial]
async fn blocking_read_returns_when_one_leg_is_silent() {
    let (phone, _signaling) = started_phone().await;
    let (remote, remote_port) = peer().await;

    let mut body = testing::audio_body(remote_port, vec![0, 101]);
    body.connections.push(ConnectionAddress::unicast(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    body.media[0].port_count = 2;
    phone
        .on_call(testing::invite("in-10", "300", USER, remote_port, vec![0, 101]).with_body(body))
        .await
        .unwrap();
    phone.answer("in-10").await.unwrap();
    let call = phone.get_call("in-10").unwrap();
    let streams = call.streams();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[1].remote_addr().port(), remote_port + 1);

    for i in 0..3u16 {
        let packet = RtpPacket::new_with_payload(0, 10 + i, 1000 + 160 * i as u32, 0x4321, Bytes::from(vec![0x20; 160]));
        remote.send_to(&packet.build().unwrap(), streams[0].local_addr()).await.unwrap();
    }

    let audio = timeout(Duration::from_secs(2), call.read_audio(480, true))
        .await
        .expect("a silent leg must not stall the read");
    assert_eq!(audio.len(), 480);
    let received: u64 = streams.iter().map(|s| s.stats().packets_received).sum();
    assert_eq!(received, 3);

    phone.hangup("in-10").await.unwrap();
}
