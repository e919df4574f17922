//! Test support: a recording signaling collaborator and request builders
//!
//! [`MockSignaling`] answers every outbound operation successfully (unless
//! told to fail) and records it, so tests can drive a [`crate::Phone`]
//! entirely through [`crate::Phone::on_call`] and assert on what would have
//! gone out on the wire.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use softphone_client_core::testing::MockSignaling;
//! # use softphone_client_core::{CallState, Phone, PhoneConfig};
//! # tokio_test::block_on(async {
//! let signaling = Arc::new(MockSignaling::new("100"));
//! let phone = Phone::new(PhoneConfig::default(), signaling.clone()).unwrap();
//! phone.start().await.unwrap();
//!
//! let call = phone.call("200").await.unwrap();
//! assert_eq!(call.state(), CallState::Dialing);
//! assert_eq!(signaling.count("invite"), 1);
//! # });
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use softphone_media_core::TransmitMode;

use crate::error::{ClientError, ClientResult};
use crate::signaling::{
    ConnectionAddress, HoldRequest, InviteOutcome, MediaDescription, MediaPlan, Party, SessionDescription,
    SignalingClient, SipRequest, SipStatus, TransferRequest,
};

/// One recorded outbound operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingCall {
    Start,
    Stop,
    Invite {
        number: String,
        plan: MediaPlan,
        mode: TransmitMode,
    },
    Answer {
        call_id: String,
        session_id: u32,
        plan: MediaPlan,
        mode: TransmitMode,
    },
    Bye { call_id: String },
    Cancel { call_id: String },
    Busy { call_id: String },
    Hold(HoldRequest),
    Transfer(TransferRequest),
    MovedTemporarily { call_id: String, target: String },
}

impl SignalingCall {
    /// Operation name as accepted by [`MockSignaling::fail_on`]
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingCall::Start => "start",
            SignalingCall::Stop => "stop",
            SignalingCall::Invite { .. } => "invite",
            SignalingCall::Answer { .. } => "answer",
            SignalingCall::Bye { .. } => "bye",
            SignalingCall::Cancel { .. } => "cancel",
            SignalingCall::Busy { .. } => "busy",
            SignalingCall::Hold(_) => "hold",
            SignalingCall::Transfer(_) => "transfer",
            SignalingCall::MovedTemporarily { .. } => "moved_temporarily",
        }
    }
}

/// Recording [`SignalingClient`]
#[derive(Debug)]
pub struct MockSignaling {
    username: String,
    local_addr: SocketAddr,
    recorded: Mutex<Vec<SignalingCall>>,
    failing: Mutex<HashSet<&'static str>>,
    next_call: AtomicU32,
}

impl MockSignaling {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5060),
            recorded: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            next_call: AtomicU32::new(1),
        }
    }

    /// Make every later `operation` fail with a signaling error
    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn recorded(&self) -> Vec<SignalingCall> {
        self.recorded.lock().clone()
    }

    /// Recorded operations of one kind
    pub fn recorded_kind(&self, kind: &str) -> Vec<SignalingCall> {
        self.recorded.lock().iter().filter(|c| c.kind() == kind).cloned().collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.recorded.lock().iter().filter(|c| c.kind() == kind).count()
    }

    fn record(&self, call: SignalingCall) -> ClientResult<()> {
        let kind = call.kind();
        self.recorded.lock().push(call);
        if self.failing.lock().contains(kind) {
            return Err(ClientError::signaling(format!("{kind} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingClient for MockSignaling {
    async fn start(&self) -> ClientResult<SocketAddr> {
        self.record(SignalingCall::Start)?;
        Ok(self.local_addr)
    }

    async fn stop(&self) -> ClientResult<()> {
        self.record(SignalingCall::Stop)
    }

    async fn invite(&self, number: &str, plan: &MediaPlan, mode: TransmitMode) -> ClientResult<InviteOutcome> {
        self.record(SignalingCall::Invite {
            number: number.to_string(),
            plan: plan.clone(),
            mode,
        })?;
        let n = self.next_call.fetch_add(1, Ordering::Relaxed);
        let call_id = format!("call-{n}@mock");
        let request = SipRequest::new(
            call_id.clone(),
            SipStatus::Invite,
            Party::new(self.username.clone()).with_tag(format!("local-{n}")),
            Party::new(number),
        );
        Ok(InviteOutcome {
            request,
            call_id,
            session_id: 50_000 + n,
        })
    }

    async fn answer(&self, request: &SipRequest, session_id: u32, plan: &MediaPlan, mode: TransmitMode) -> ClientResult<()> {
        self.record(SignalingCall::Answer {
            call_id: request.call_id.clone(),
            session_id,
            plan: plan.clone(),
            mode,
        })
    }

    async fn bye(&self, request: &SipRequest) -> ClientResult<()> {
        self.record(SignalingCall::Bye {
            call_id: request.call_id.clone(),
        })
    }

    async fn cancel(&self, request: &SipRequest) -> ClientResult<()> {
        self.record(SignalingCall::Cancel {
            call_id: request.call_id.clone(),
        })
    }

    async fn busy(&self, request: &SipRequest) -> ClientResult<()> {
        self.record(SignalingCall::Busy {
            call_id: request.call_id.clone(),
        })
    }

    async fn hold(&self, hold: HoldRequest) -> ClientResult<SipRequest> {
        let sent = SipRequest::new(
            hold.call_id.clone(),
            SipStatus::Invite,
            Party::new(self.username.clone()).with_tag(hold.tag_from.clone().unwrap_or_default()),
            Party::new(hold.call_to.clone()).with_tag(hold.tag_to.clone().unwrap_or_default()),
        )
        .with_authentication("hold-nonce");
        self.record(SignalingCall::Hold(hold))?;
        Ok(sent)
    }

    async fn transfer(&self, transfer: TransferRequest) -> ClientResult<()> {
        self.record(SignalingCall::Transfer(transfer))
    }

    async fn moved_temporarily(&self, request: &SipRequest, target: &str) -> ClientResult<()> {
        self.record(SignalingCall::MovedTemporarily {
            call_id: request.call_id.clone(),
            target: target.to_string(),
        })
    }
}

/// Loopback session description with one audio line on `remote_port`
pub fn audio_body(remote_port: u16, payload_ids: Vec<u8>) -> SessionDescription {
    let mut media = MediaDescription::audio(remote_port, payload_ids.clone());
    for id in payload_ids {
        if id == 101 {
            media = media.with_rtpmap(101, "telephone-event", 8000);
        }
    }
    SessionDescription {
        connections: vec![ConnectionAddress::unicast(IpAddr::V4(Ipv4Addr::LOCALHOST))],
        media: vec![media],
        transmit_mode: TransmitMode::SendRecv,
    }
}

/// Inbound INVITE from `from` to `to` offering `payload_ids`
pub fn invite(call_id: &str, from: &str, to: &str, remote_port: u16, payload_ids: Vec<u8>) -> SipRequest {
    SipRequest::new(
        call_id,
        SipStatus::Invite,
        Party::new(from).with_tag("remote-tag").with_display_name(format!("Caller {from}")),
        Party::new(to),
    )
    .with_contact(format!("sip:{from}@127.0.0.1"))
    .with_body(audio_body(remote_port, payload_ids))
}

/// Response or in-dialog event for a call placed from `from` to `to`
pub fn response(call_id: &str, status: SipStatus, from: &str, to: &str) -> SipRequest {
    SipRequest::new(
        call_id,
        status,
        Party::new(from).with_tag("local-tag"),
        Party::new(to).with_tag("remote-tag"),
    )
}

/// 200 OK carrying an audio answer
pub fn ok_with_audio(call_id: &str, from: &str, to: &str, remote_port: u16) -> SipRequest {
    response(call_id, SipStatus::Ok, from, to)
        .with_contact(format!("sip:{to}@127.0.0.1"))
        .with_body(audio_body(remote_port, vec![0, 101]))
}
