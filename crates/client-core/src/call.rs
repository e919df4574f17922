//! Call state machine
//!
//! A [`Call`] is one dialog: its identity, the signaling request that
//! created it, the media streams negotiated for it and its
//! [`CallState`]. User operations ([`Call::answer`], [`Call::hold`],
//! [`Call::transfer`], [`Call::deny`], [`Call::hangup`]) are checked against
//! the current state and fail with [`ClientError::InvalidCallState`] when not
//! allowed. Signaling driven operations ([`Call::answered`],
//! [`Call::not_found`], [`Call::bye`], ...) never fail on state; they ignore
//! events that no longer apply.
//!
//! | Operation | Allowed from |
//! |-----------|--------------|
//! | `answer` | RINGING_ME |
//! | `hold(true)` | ONLINE |
//! | `hold(false)` | HOLD |
//! | `transfer` | ONLINE |
//! | `deny` | RINGING_ME, RINGING, DIALING |
//! | `hangup` | ONLINE, HOLD, ONLINE_HOLD |
//!
//! Reaching END always removes the call from the phone's directory and
//! returns its ports and session id to the pools.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use softphone_media_core::{mixer, DtmfCallback, MediaError, MediaStream, MediaStreamConfig, TransmitMode};
use softphone_rtp_core::DtmfTone;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::PhoneConfig;
use crate::error::{ClientError, ClientResult};
use crate::negotiation::{self, MediaLeg, NegotiationWarning};
use crate::phone::PhoneContext;
use crate::signaling::{HoldRequest, MediaPlan, SessionDescription, SipRequest, TransferRequest};

/// State of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Outbound INVITE sent
    Dialing,
    /// Remote side is ringing
    Ringing,
    /// Inbound call waiting to be answered
    RingingMe,
    /// Remote side accepted an outbound call
    Answered,
    Online,
    /// This phone put the call on hold
    Hold,
    /// Remote side put the call on hold
    OnlineHold,
    Decline,
    Busy,
    NotAvailable,
    NotFound,
    End,
    TransferAccepted,
    TransferDecline,
}

impl CallState {
    pub const ALL: [CallState; 14] = [
        CallState::Dialing,
        CallState::Ringing,
        CallState::RingingMe,
        CallState::Answered,
        CallState::Online,
        CallState::Hold,
        CallState::OnlineHold,
        CallState::Decline,
        CallState::Busy,
        CallState::NotAvailable,
        CallState::NotFound,
        CallState::End,
        CallState::TransferAccepted,
        CallState::TransferDecline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Dialing => "DIALING",
            CallState::Ringing => "RINGING",
            CallState::RingingMe => "RINGING_ME",
            CallState::Answered => "ANSWERED",
            CallState::Online => "ONLINE",
            CallState::Hold => "HOLD",
            CallState::OnlineHold => "ONLINE_HOLD",
            CallState::Decline => "DECLINE",
            CallState::Busy => "BUSY",
            CallState::NotAvailable => "NOT_AVAILABLE",
            CallState::NotFound => "NOT_FOUND",
            CallState::End => "END",
            CallState::TransferAccepted => "TRANSFER_ACCEPTED",
            CallState::TransferDecline => "TRANSFER_DECLINE",
        }
    }

    /// Media is flowing or paused by hold
    pub fn is_connected(&self) -> bool {
        matches!(self, CallState::Online | CallState::Hold | CallState::OnlineHold)
    }

    /// Call has not been answered yet
    pub fn is_pending(&self) -> bool {
        matches!(self, CallState::Dialing | CallState::Ringing | CallState::RingingMe)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    NotFound,
    Unavailable,
}

/// Terminal failure of an outbound call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub call_id: String,
    /// Number that was dialed
    pub number: String,
    pub reason: FailureReason,
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            FailureReason::NotFound => write!(f, "The number '{}' was not found", self.number),
            FailureReason::Unavailable => write!(f, "The number '{}' was unavailable", self.number),
        }
    }
}

/// Received key presses, captured one at a time
#[derive(Debug, Default)]
pub(crate) struct DtmfCapture {
    armed: AtomicBool,
    digits: Mutex<VecDeque<char>>,
}

impl DtmfCapture {
    fn on_tone(&self, tone: DtmfTone) {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.digits.lock().push_back(tone.to_char());
            debug!(digit = %tone.to_char(), "Captured DTMF");
        }
    }

    fn callback(self: &Arc<Self>) -> DtmfCallback {
        let capture = self.clone();
        Arc::new(move |tone| capture.on_tone(tone))
    }
}

/// Build one stream per leg, sharing the call's DTMF capture
fn build_streams(config: &PhoneConfig, legs: &[MediaLeg], capture: &Arc<DtmfCapture>) -> ClientResult<Vec<Arc<MediaStream>>> {
    legs.iter()
        .map(|leg| {
            let stream_config = MediaStreamConfig::new(
                SocketAddr::new(config.local_ip, leg.local_port),
                leg.remote_addr,
                leg.association.clone(),
            )
            .with_transmit_mode(leg.transmit_mode.answer())
            .with_settings(config.media.clone());
            Ok(Arc::new(MediaStream::new(stream_config, Some(capture.callback()))?))
        })
        .collect()
}

fn plan_from_legs(legs: &[MediaLeg]) -> MediaPlan {
    legs.iter()
        .map(|leg| (leg.local_port, leg.association.clone()))
        .collect()
}

/// `request` with its tags swapped so From is the side registered as `username`
fn oriented_to(request: &SipRequest, username: &str) -> SipRequest {
    let mut oriented = request.clone();
    if oriented.from.number != username {
        std::mem::swap(&mut oriented.from.tag, &mut oriented.to.tag);
    }
    oriented
}

/// One call dialog
pub struct Call {
    call_id: String,
    session_id: u32,
    direction: CallDirection,
    phone: Weak<PhoneContext>,
    state: RwLock<CallState>,
    request: RwLock<SipRequest>,
    media_plan: RwLock<MediaPlan>,
    streams: RwLock<Vec<Arc<MediaStream>>>,
    /// (media line, connection line) of each stream, in stream order
    leg_keys: RwLock<Vec<(usize, usize)>>,
    ports: Mutex<Vec<u16>>,
    dtmf: Arc<DtmfCapture>,
    /// Serialises user and signaling operations on this call
    op_lock: tokio::sync::Mutex<()>,
    created_at: DateTime<Utc>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
}

impl Call {
    fn with_parts(
        phone: Weak<PhoneContext>,
        request: SipRequest,
        session_id: u32,
        direction: CallDirection,
        state: CallState,
        media_plan: MediaPlan,
        ports: Vec<u16>,
    ) -> Self {
        Self {
            call_id: request.call_id.clone(),
            session_id,
            direction,
            phone,
            state: RwLock::new(state),
            request: RwLock::new(request),
            media_plan: RwLock::new(media_plan),
            streams: RwLock::new(Vec::new()),
            leg_keys: RwLock::new(Vec::new()),
            ports: Mutex::new(ports),
            dtmf: Arc::new(DtmfCapture::default()),
            op_lock: tokio::sync::Mutex::new(()),
            created_at: Utc::now(),
            connected_at: RwLock::new(None),
            ended_at: RwLock::new(None),
        }
    }

    /// Inbound call in RINGING_ME, with streams negotiated from the offer
    /// but not started.
    ///
    /// Local ports are reserved from the phone's pool; on error every port
    /// reserved so far is released again.
    pub(crate) fn incoming(
        ctx: &Arc<PhoneContext>,
        request: SipRequest,
        session_id: u32,
    ) -> ClientResult<(Call, Vec<NegotiationWarning>)> {
        let mut reserved = Vec::new();
        let negotiated = match &request.body {
            Some(body) => negotiation::negotiate(body, &ctx.config.supported_codecs, |_| {
                let port = ctx.reserve_port()?;
                reserved.push(port);
                Ok(port)
            }),
            None => Ok(Default::default()),
        };

        let negotiation = match negotiated {
            Ok(negotiation) => negotiation,
            Err(e) => {
                ctx.release_ports(&reserved);
                return Err(e);
            }
        };

        let call = Call::with_parts(
            Arc::downgrade(ctx),
            request,
            session_id,
            CallDirection::Incoming,
            CallState::RingingMe,
            plan_from_legs(&negotiation.legs),
            reserved.clone(),
        );

        match build_streams(&ctx.config, &negotiation.legs, &call.dtmf) {
            Ok(streams) => call.install_streams(&negotiation.legs, streams),
            Err(e) => {
                ctx.release_ports(&reserved);
                return Err(e);
            }
        }

        info!(
            call_id = %call.call_id,
            from = %call.number(),
            streams = call.stream_count(),
            "Incoming call"
        );
        Ok((call, negotiation.warnings))
    }

    /// Outbound call in DIALING; streams are created by [`Call::answered`]
    pub(crate) fn outgoing(ctx: &Arc<PhoneContext>, request: SipRequest, session_id: u32, plan: MediaPlan) -> Call {
        let ports = plan.keys().copied().collect();
        Call::with_parts(
            Arc::downgrade(ctx),
            request,
            session_id,
            CallDirection::Outgoing,
            CallState::Dialing,
            plan,
            ports,
        )
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        *self.state.read()
    }

    /// The request that created the dialog, updated as it progresses
    pub fn request(&self) -> SipRequest {
        self.request.read().clone()
    }

    /// Remote party number
    pub fn number(&self) -> String {
        let request = self.request.read();
        match self.direction {
            CallDirection::Incoming => request.from.number.clone(),
            CallDirection::Outgoing => request.to.number.clone(),
        }
    }

    /// Remote party display name, falling back to the number
    pub fn display_name(&self) -> String {
        let request = self.request.read();
        let party = match self.direction {
            CallDirection::Incoming => &request.from,
            CallDirection::Outgoing => &request.to,
        };
        party.display_name.clone().unwrap_or_else(|| party.number.clone())
    }

    /// Local port to codecs, as offered or answered
    pub fn media_plan(&self) -> MediaPlan {
        self.media_plan.read().clone()
    }

    pub fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.streams.read().clone()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn local_ports(&self) -> Vec<u16> {
        self.ports.lock().clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.read()
    }

    /// Capture the next received key press
    pub fn arm_dtmf(&self) {
        self.dtmf.armed.store(true, Ordering::Release);
    }

    pub fn disarm_dtmf(&self) {
        self.dtmf.armed.store(false, Ordering::Release);
    }

    pub fn is_dtmf_armed(&self) -> bool {
        self.dtmf.armed.load(Ordering::Acquire)
    }

    /// Take up to `length` captured digits
    pub fn get_dtmf(&self, length: usize) -> String {
        let mut digits = self.dtmf.digits.lock();
        let take = length.min(digits.len());
        digits.drain(..take).collect()
    }

    fn context(&self) -> ClientResult<Arc<PhoneContext>> {
        self.phone
            .upgrade()
            .ok_or_else(|| ClientError::internal_error("phone has been dropped"))
    }

    pub(crate) fn set_state(&self, state: CallState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!(call_id = %self.call_id, from = %previous, to = %state, "Call state changed");
        }
        match state {
            CallState::Online => {
                let mut connected_at = self.connected_at.write();
                if connected_at.is_none() {
                    *connected_at = Some(Utc::now());
                }
            }
            CallState::End => *self.ended_at.write() = Some(Utc::now()),
            _ => {}
        }
    }

    fn guard(&self, operation: &'static str, allowed: &[CallState]) -> ClientResult<CallState> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(current)
        } else {
            Err(ClientError::invalid_state(&self.call_id, operation, current))
        }
    }

    fn install_streams(&self, legs: &[MediaLeg], streams: Vec<Arc<MediaStream>>) {
        *self.streams.write() = streams;
        *self.leg_keys.write() = legs.iter().map(MediaLeg::key).collect();
    }

    fn stop_streams(&self) {
        for stream in self.streams.read().iter() {
            stream.stop();
        }
    }

    fn hold_streams(&self, on_hold: bool) {
        for stream in self.streams.read().iter() {
            stream.hold(on_hold);
        }
    }

    async fn start_streams(&self) -> ClientResult<()> {
        for stream in self.streams() {
            stream.start().await?;
        }
        Ok(())
    }

    /// Move to END and leave the directory
    fn finish(&self, ctx: &PhoneContext) {
        self.set_state(CallState::End);
        ctx.retire(&self.call_id);
    }

    /// Answer an inbound call
    ///
    /// If the media or the signaling answer fails the streams are stopped
    /// and the call ends.
    pub async fn answer(&self) -> ClientResult<()> {
        let (ctx, outcome) = {
            let _op = self.op_lock.lock().await;
            self.guard("answer", &[CallState::RingingMe])?;
            let ctx = self.context()?;

            if self.stream_count() == 0 {
                warn!(call_id = %self.call_id, "Answering without negotiated media");
            }
            let outcome = self.connect_answer(&ctx).await;
            match &outcome {
                Ok(()) => self.set_state(CallState::Online),
                Err(e) => {
                    warn!(call_id = %self.call_id, error = %e, "Answer failed, ending call");
                    self.stop_streams();
                    self.finish(&ctx);
                }
            }
            (ctx, outcome)
        };

        // Handlers may act on the call, so notify outside the op lock
        match outcome {
            Ok(()) => {
                ctx.notify(CallState::Online, &self.call_id).await;
                Ok(())
            }
            Err(e) => {
                ctx.notify(CallState::End, &self.call_id).await;
                Err(e)
            }
        }
    }

    async fn connect_answer(&self, ctx: &PhoneContext) -> ClientResult<()> {
        self.start_streams().await?;
        if let Some(first) = self.streams().into_iter().next() {
            if let Err(e) = first.send_rtcp().await {
                debug!(call_id = %self.call_id, error = %e, "Initial RTCP report failed");
            }
        }

        let request = self.request();
        let plan = self.media_plan();
        ctx.signaling
            .answer(&request, self.session_id, &plan, request.transmit_mode().answer())
            .await
    }

    /// Remote side is ringing
    pub(crate) fn ringing(&self) {
        if self.state() == CallState::Dialing {
            self.set_state(CallState::Ringing);
        }
    }

    /// Final success response to an outbound call
    ///
    /// Negotiates the remote answer against the offered media plan, starts
    /// the streams and moves to ONLINE. Ignored unless the call is still
    /// dialing or ringing.
    pub async fn answered(&self, response: &SipRequest) -> ClientResult<()> {
        let (ctx, warnings) = {
            let _op = self.op_lock.lock().await;
            let current = self.state();
            if !matches!(current, CallState::Dialing | CallState::Ringing) {
                debug!(call_id = %self.call_id, state = %current, "Ignoring final response");
                return Ok(());
            }
            let ctx = self.context()?;
            let body = response
                .body
                .as_ref()
                .ok_or_else(|| ClientError::ProtocolError {
                    reason: "answer carries no session description".to_string(),
                })?;

            let plan = self.media_plan();
            let mut plan_ports = plan.keys().copied();
            let mut last_port = None;
            let negotiation = negotiation::negotiate(body, &ctx.config.supported_codecs, |_| {
                // Lines beyond the plan reuse its last port
                let port = plan_ports
                    .next()
                    .or(last_port)
                    .ok_or_else(|| ClientError::call_setup_failed("media plan has no local port"))?;
                last_port = Some(port);
                Ok(port)
            })?;

            let streams = build_streams(&ctx.config, &negotiation.legs, &self.dtmf)?;
            self.install_streams(&negotiation.legs, streams);
            self.start_streams().await?;

            {
                let mut request = self.request.write();
                if response.contact.is_some() {
                    request.contact = response.contact.clone();
                }
                request.to.tag = response.to.tag.clone();
            }
            self.set_state(CallState::Online);
            (ctx, negotiation.warnings)
        };

        ctx.report_warnings(&self.call_id, &warnings).await;
        ctx.notify(CallState::Online, &self.call_id).await;
        Ok(())
    }

    /// Re-INVITE for an established call.
    ///
    /// Streams are matched to the new offer by (media line, connection line)
    /// index. A matched stream follows the new destination and direction; a
    /// stream whose line was dropped or has no common codec is stopped.
    pub async fn renegotiate(&self, request: &SipRequest) -> ClientResult<()> {
        let (ctx, warnings) = {
            let _op = self.op_lock.lock().await;
            let current = self.state();
            if !current.is_connected() {
                debug!(call_id = %self.call_id, state = %current, "Ignoring re-INVITE");
                return Ok(());
            }
            let ctx = self.context()?;

            let warnings = match &request.body {
                Some(body) => self.retarget_streams(&ctx, body)?,
                None => Vec::new(),
            };
            self.start_streams().await?;

            let plan = self.media_plan();
            let offered = request.transmit_mode();
            ctx.signaling
                .answer(request, self.session_id, &plan, offered.answer())
                .await?;

            match (current, offered) {
                (CallState::Online, TransmitMode::SendOnly | TransmitMode::Inactive) => {
                    self.set_state(CallState::OnlineHold)
                }
                (CallState::OnlineHold, TransmitMode::SendRecv | TransmitMode::RecvOnly) => {
                    self.set_state(CallState::Online)
                }
                _ => {}
            }
            (ctx, warnings)
        };

        ctx.report_warnings(&self.call_id, &warnings).await;
        Ok(())
    }

    fn retarget_streams(&self, ctx: &PhoneContext, body: &SessionDescription) -> ClientResult<Vec<NegotiationWarning>> {
        // Only destinations and directions are taken, so no port is allocated
        let offer = negotiation::negotiate(body, &ctx.config.supported_codecs, |_| Ok(0))?;

        let mut streams = self.streams.write();
        let mut keys = self.leg_keys.write();
        let mut kept = Vec::with_capacity(streams.len());
        let mut kept_keys = Vec::with_capacity(keys.len());
        for (stream, key) in streams.drain(..).zip(keys.drain(..)) {
            match offer.legs.iter().find(|leg| leg.key() == key) {
                Some(leg) => {
                    stream.set_remote_addr(leg.remote_addr);
                    stream.set_transmit_mode(leg.transmit_mode.answer());
                    kept.push(stream);
                    kept_keys.push(key);
                }
                None => {
                    warn!(
                        call_id = %self.call_id,
                        media = key.0,
                        connection = key.1,
                        "Media leg missing from re-INVITE, stopping stream"
                    );
                    stream.stop();
                }
            }
        }
        *streams = kept;
        *keys = kept_keys;
        Ok(offer.warnings)
    }

    /// Put the call on hold (`true`, from ONLINE) or resume it (`false`,
    /// from HOLD).
    ///
    /// Holding offers `sendonly` and mutes every stream; resuming offers
    /// `sendrecv` and unmutes them.
    pub async fn hold(&self, is_hold: bool) -> ClientResult<()> {
        let _op = self.op_lock.lock().await;
        self.hold_locked(is_hold).await
    }

    async fn hold_locked(&self, is_hold: bool) -> ClientResult<()> {
        if is_hold {
            self.guard("hold", &[CallState::Online])?;
        } else {
            self.guard("resume", &[CallState::Hold])?;
        }
        let ctx = self.context()?;
        let username = ctx.config.username.as_str();

        let request = self.request();
        let dialog = ctx.provisional_request(&self.call_id).unwrap_or_else(|| request.clone());
        let (tag_from, tag_to) = dialog.dialog_tags(username);

        let hold = HoldRequest {
            call_id: self.call_id.clone(),
            number: request.to.number.clone(),
            call_to: request.remote_party(username).number.clone(),
            plan: self.media_plan(),
            transmit_mode: if is_hold { TransmitMode::SendOnly } else { TransmitMode::SendRecv },
            tag_from,
            tag_to,
            nonce: request.nonce().map(str::to_string),
            is_hold,
        };
        let sent = ctx.signaling.hold(hold).await?;
        ctx.update_authentication(&self.call_id, &sent);
        self.request.write().authentication = sent.authentication;

        self.hold_streams(is_hold);
        self.set_state(if is_hold { CallState::Hold } else { CallState::Online });
        Ok(())
    }

    /// Transfer the remote party to `transfer_to`.
    ///
    /// The call is held first. With `replaces` the transfer is attended and
    /// replaces that other call's dialog.
    pub async fn transfer(&self, transfer_to: &str, replaces: Option<&str>) -> ClientResult<()> {
        let _op = self.op_lock.lock().await;
        self.guard("transfer", &[CallState::Online])?;
        let ctx = self.context()?;
        let username = ctx.config.username.as_str();

        let request = self.request();
        let dialog = ctx.provisional_request(&self.call_id).unwrap_or_else(|| request.clone());
        let (tag_from, tag_to) = dialog.dialog_tags(username);
        let number = dialog.remote_party(username).number.clone();

        let replaces = match replaces {
            Some(other) => {
                let replaced = ctx
                    .provisional_request(other)
                    .or_else(|| ctx.calls.get(other).map(|call| call.request()))
                    .ok_or_else(|| ClientError::call_not_found(other))?;
                Some(oriented_to(&replaced, username))
            }
            None => None,
        };

        self.hold_locked(true).await?;
        tokio::time::sleep(ctx.config.transfer_settle()).await;

        let transfer = TransferRequest {
            call_id: self.call_id.clone(),
            number,
            refer_to: transfer_to.to_string(),
            replaces,
            plan: self.media_plan(),
            transmit_mode: TransmitMode::SendRecv,
            tag_from,
            tag_to,
            nonce: self.request.read().nonce().map(str::to_string),
        };
        let result = ctx.signaling.transfer(transfer).await;
        self.hold_streams(true);

        match result {
            Ok(()) => {
                info!(call_id = %self.call_id, transfer_to, "Transfer accepted");
                self.set_state(CallState::TransferAccepted);
                Ok(())
            }
            Err(e) => {
                warn!(call_id = %self.call_id, transfer_to, error = %e, "Transfer failed");
                self.set_state(CallState::TransferDecline);
                Err(e)
            }
        }
    }

    /// Reject a ringing call or abandon a dialing one
    pub async fn deny(&self) -> ClientResult<()> {
        let _op = self.op_lock.lock().await;
        let current = self.guard("deny", &[CallState::RingingMe, CallState::Ringing, CallState::Dialing])?;
        let ctx = self.context()?;

        let request = self.request();
        let signaled = if current == CallState::Dialing {
            ctx.signaling.cancel(&request).await
        } else {
            ctx.signaling.busy(&request).await
        };

        self.stop_streams();
        self.install_streams(&[], Vec::new());
        self.finish(&ctx);
        signaled
    }

    /// End a connected call
    pub async fn hangup(&self) -> ClientResult<()> {
        let _op = self.op_lock.lock().await;
        self.guard("hangup", &[CallState::Online, CallState::Hold, CallState::OnlineHold])?;
        let ctx = self.context()?;

        self.stop_streams();
        let signaled = ctx.signaling.bye(&self.request()).await;
        self.finish(&ctx);
        signaled
    }

    /// Abort the call, sending CANCEL unless it already ended
    pub async fn cancel(&self) -> ClientResult<()> {
        let _op = self.op_lock.lock().await;
        let ctx = self.context()?;

        self.stop_streams();
        let signaled = if self.state() != CallState::End {
            ctx.signaling.cancel(&self.request()).await
        } else {
            Ok(())
        };
        self.finish(&ctx);
        signaled
    }

    /// Remote side ended the call
    pub async fn bye(&self) -> ClientResult<()> {
        let _op = self.op_lock.lock().await;
        let ctx = self.context()?;

        self.stop_streams();
        self.finish(&ctx);
        Ok(())
    }

    /// End the call locally without signaling
    pub(crate) async fn discard(&self) {
        let _op = self.op_lock.lock().await;
        self.stop_streams();
        if let Ok(ctx) = self.context() {
            self.finish(&ctx);
        } else {
            self.set_state(CallState::End);
        }
    }

    /// 404 for an outbound call
    pub async fn not_found(&self, response: &SipRequest) -> Option<CallFailure> {
        self.fail(response, FailureReason::NotFound).await
    }

    /// 480 for an outbound call
    pub async fn unavailable(&self, response: &SipRequest) -> Option<CallFailure> {
        self.fail(response, FailureReason::Unavailable).await
    }

    async fn fail(&self, response: &SipRequest, reason: FailureReason) -> Option<CallFailure> {
        let _op = self.op_lock.lock().await;
        let current = self.state();
        if !matches!(current, CallState::Dialing | CallState::Ringing) {
            debug!(call_id = %self.call_id, state = %current, ?reason, "Ignoring failure response");
            return None;
        }

        self.stop_streams();
        match self.context() {
            Ok(ctx) => self.finish(&ctx),
            Err(_) => self.set_state(CallState::End),
        }

        let failure = CallFailure {
            call_id: self.call_id.clone(),
            number: response.to.number.clone(),
            reason,
        };
        warn!(call_id = %self.call_id, "{failure}");
        Some(failure)
    }

    /// Decline or busy for an outbound call that was not answered
    pub(crate) async fn remote_rejected(&self) -> bool {
        let _op = self.op_lock.lock().await;
        if !matches!(self.state(), CallState::Dialing | CallState::Ringing) {
            return false;
        }
        self.stop_streams();
        if let Ok(ctx) = self.context() {
            self.finish(&ctx);
        }
        true
    }

    /// Queue audio on every stream
    pub fn write_audio(&self, data: &[u8]) {
        for stream in self.streams.read().iter() {
            stream.write(data);
        }
    }

    /// Read `length` bytes of received audio, mixed across streams
    pub async fn read_audio(&self, length: usize, blocking: bool) -> Bytes {
        let streams = self.streams();
        match streams.as_slice() {
            [] => {
                let silence = self
                    .context()
                    .map(|ctx| ctx.config.media.silence_byte)
                    .unwrap_or(0xFF);
                mixer::silence(length, silence)
            }
            [only] => only.read(length, blocking).await,
            many => {
                if blocking {
                    // Any leg with a full frame is enough, the rest are padded
                    let mut waiting = JoinSet::new();
                    for stream in many.iter().cloned() {
                        waiting.spawn(async move { stream.readable(length).await });
                    }
                    let _ = waiting.join_next().await;
                }
                let mut frames = Vec::with_capacity(many.len());
                for stream in many {
                    frames.push(stream.read(length, false).await);
                }
                mixer::mix_frames(&frames)
            }
        }
    }

    /// Send a key press (`0-9`, `*`, `#`, `A-D`) on every stream
    pub async fn send_dtmf(&self, digit: char) -> ClientResult<()> {
        // Rejected even when the call has no streams
        DtmfTone::from_char(digit).ok_or(MediaError::InvalidDtmfDigit(digit))?;
        for stream in self.streams() {
            stream.send_digit(digit).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("call_id", &self.call_id)
            .field("session_id", &self.session_id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("streams", &self.stream_count())
            .finish()
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        for stream in self.streams.get_mut().iter() {
            stream.stop();
        }
    }
}
