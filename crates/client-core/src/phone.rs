//! Phone registry
//!
//! [`Phone`] is the application's entry point: it owns the call directory,
//! the port and session-id pools and the per-call request caches, drives the
//! signaling collaborator for outbound operations and receives every inbound
//! signaling event through [`Phone::on_call`].
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use softphone_client_core::{Phone, PhoneConfig, SignalingClient, ClientResult};
//! # async fn example(signaling: Arc<dyn SignalingClient>) -> ClientResult<()> {
//! let config = PhoneConfig::new("pbx.example.com", 5060, "100", "secret");
//! let phone = Phone::new(config, signaling)?;
//! phone.start().await?;
//!
//! let call = phone.call("5551234").await?;
//! println!("{} is {}", call.call_id(), call.state());
//!
//! phone.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use softphone_media_core::TransmitMode;
use softphone_rtp_core::PayloadAssociation;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::call::{Call, CallFailure, CallState};
use crate::config::PhoneConfig;
use crate::directory::CallDirectory;
use crate::dispatcher;
use crate::error::{ClientError, ClientResult};
use crate::events::{PhoneEvent, PhoneEventHandler, RegistrationStatus};
use crate::negotiation::NegotiationWarning;
use crate::pool::{PortPool, SessionIdPool};
use crate::signaling::{MediaPlan, SignalingClient, SipRequest};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Whether the phone has been started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhoneStatus {
    Stopped,
    Started,
}

/// State shared between the phone, its calls and spawned timers
pub(crate) struct PhoneContext {
    pub(crate) config: PhoneConfig,
    pub(crate) signaling: Arc<dyn SignalingClient>,
    pub(crate) calls: CallDirectory,
    pub(crate) ports: PortPool,
    pub(crate) session_ids: SessionIdPool,
    /// Latest provisional response per call, used for dialog tags
    provisional: DashMap<String, SipRequest>,
    /// Request each call was created from
    requests: DashMap<String, SipRequest>,
    status: RwLock<PhoneStatus>,
    local_addr: RwLock<Option<SocketAddr>>,
    events: broadcast::Sender<PhoneEvent>,
    handler: RwLock<Option<Arc<dyn PhoneEventHandler>>>,
}

impl PhoneContext {
    pub(crate) fn reserve_port(&self) -> ClientResult<u16> {
        self.ports
            .reserve_random(&self.config.rtp_port_range, self.config.max_allocation_attempts)
    }

    pub(crate) fn reserve_session_id(&self) -> ClientResult<u32> {
        self.session_ids
            .reserve_random(&self.config.session_id_range, self.config.max_allocation_attempts)
    }

    pub(crate) fn release_ports(&self, ports: &[u16]) {
        for port in ports {
            self.ports.release(*port);
        }
    }

    pub(crate) fn cache_provisional(&self, request: &SipRequest) {
        self.provisional.insert(request.call_id.clone(), request.clone());
    }

    pub(crate) fn cache_request(&self, request: &SipRequest) {
        self.requests.insert(request.call_id.clone(), request.clone());
    }

    pub(crate) fn provisional_request(&self, call_id: &str) -> Option<SipRequest> {
        self.provisional.get(call_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn original_request(&self, call_id: &str) -> Option<SipRequest> {
        self.requests.get(call_id).map(|entry| entry.value().clone())
    }

    /// Carry a fresh digest challenge over to the cached request
    pub(crate) fn update_authentication(&self, call_id: &str, sent: &SipRequest) {
        if let Some(mut cached) = self.requests.get_mut(call_id) {
            cached.authentication = sent.authentication.clone();
        }
    }

    /// Remove a call from the directory and release what it holds.
    ///
    /// Only the first call for a given id does anything.
    pub(crate) fn retire(&self, call_id: &str) -> bool {
        let Some(call) = self.calls.remove(call_id) else {
            return false;
        };
        self.release_ports(&call.local_ports());
        self.session_ids.release(call.session_id());
        self.provisional.remove(call_id);
        self.requests.remove(call_id);
        info!(call_id, remaining = self.calls.len(), "Call retired");
        true
    }

    pub(crate) async fn notify(&self, state: CallState, call_id: &str) {
        debug!(call_id, %state, "Call notification");
        let _ = self.events.send(PhoneEvent::CallStateChanged {
            call_id: call_id.to_string(),
            state,
            timestamp: Utc::now(),
        });
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_call_state(state, &self.calls, call_id).await;
        }
    }

    pub(crate) async fn report_warnings(&self, call_id: &str, warnings: &[NegotiationWarning]) {
        if warnings.is_empty() {
            return;
        }
        let handler = self.handler.read().clone();
        for warning in warnings {
            let _ = self.events.send(PhoneEvent::NegotiationWarning {
                call_id: call_id.to_string(),
                warning: warning.clone(),
            });
            if let Some(handler) = &handler {
                handler.on_negotiation_warning(call_id, warning).await;
            }
        }
    }

    pub(crate) async fn report_failure(&self, failure: CallFailure) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_call_failure(&failure).await;
        }
        let _ = self.events.send(PhoneEvent::CallFailed { failure });
    }

    /// Register an inbound call in RINGING_ME and arm the forward timer
    pub(crate) async fn incoming_call(self: &Arc<Self>, request: SipRequest, session_id: u32) -> ClientResult<Arc<Call>> {
        let call_id = request.call_id.clone();
        let cached = request.clone();

        let (call, warnings) = Call::incoming(self, request, session_id)?;
        let call = Arc::new(call);
        if !self.calls.insert(call.clone()) {
            self.release_ports(&call.local_ports());
            return Err(ClientError::CallAlreadyExists { call_id });
        }
        self.cache_request(&cached);
        self.report_warnings(&call_id, &warnings).await;

        if let Some(forwarding) = self.config.forwarding.as_ref().filter(|f| f.is_armed()) {
            let delay = forwarding.delay();
            let context = Arc::downgrade(self);
            let forward_id = call_id.clone();
            debug!(call_id = %call_id, ?delay, "Forward timer armed");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(context) = context.upgrade() {
                    if let Err(e) = context.call_forward(&forward_id, None).await {
                        debug!(call_id = %forward_id, error = %e, "Scheduled forward skipped");
                    }
                }
            });
        }

        Ok(call)
    }

    /// Redirect a ringing inbound call with 302 and drop it locally.
    ///
    /// Returns false when the call is no longer ringing.
    pub(crate) async fn call_forward(&self, call_id: &str, target: Option<&str>) -> ClientResult<bool> {
        let call = self.calls.get(call_id).ok_or_else(|| ClientError::call_not_found(call_id))?;
        if call.state() != CallState::RingingMe {
            return Ok(false);
        }

        let target = target
            .map(str::to_string)
            .or_else(|| self.config.forwarding.as_ref().map(|f| f.number.clone()))
            .filter(|number| !number.is_empty())
            .ok_or_else(|| ClientError::invalid_configuration("forwarding.number", "no forward target"))?;

        let request = self.original_request(call_id).unwrap_or_else(|| call.request());
        self.signaling.moved_temporarily(&request, &target).await?;
        info!(call_id, target = %target, "Call forwarded");

        self.notify(CallState::End, call_id).await;
        call.discard().await;
        Ok(true)
    }
}

/// A registered softphone
pub struct Phone {
    ctx: Arc<PhoneContext>,
}

impl Phone {
    /// Build a phone around a signaling collaborator
    pub fn new(config: PhoneConfig, signaling: Arc<dyn SignalingClient>) -> ClientResult<Arc<Self>> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let ctx = PhoneContext {
            config,
            signaling,
            calls: CallDirectory::new(),
            ports: PortPool::new("rtp ports"),
            session_ids: SessionIdPool::new("session ids"),
            provisional: DashMap::new(),
            requests: DashMap::new(),
            status: RwLock::new(PhoneStatus::Stopped),
            local_addr: RwLock::new(None),
            events,
            handler: RwLock::new(None),
        };
        Ok(Arc::new(Self { ctx: Arc::new(ctx) }))
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.ctx.config
    }

    pub fn status(&self) -> PhoneStatus {
        *self.ctx.status.read()
    }

    pub fn is_started(&self) -> bool {
        self.status() == PhoneStatus::Started
    }

    /// Signaling address reported by the last successful start
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.ctx.local_addr.read()
    }

    pub fn calls(&self) -> &CallDirectory {
        &self.ctx.calls
    }

    pub fn get_call(&self, call_id: &str) -> ClientResult<Arc<Call>> {
        self.ctx.calls.get(call_id).ok_or_else(|| ClientError::call_not_found(call_id))
    }

    pub fn set_event_handler(&self, handler: Arc<dyn PhoneEventHandler>) {
        *self.ctx.handler.write() = Some(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.ctx.events.subscribe()
    }

    /// Local RTP ports currently reserved
    pub fn ports_in_use(&self) -> usize {
        self.ctx.ports.len()
    }

    /// Session ids currently reserved
    pub fn sessions_in_use(&self) -> usize {
        self.ctx.session_ids.len()
    }

    /// Register with the signaling layer
    pub async fn start(&self) -> ClientResult<SocketAddr> {
        let addr = self.ctx.signaling.start().await?;
        *self.ctx.local_addr.write() = Some(addr);
        *self.ctx.status.write() = PhoneStatus::Started;
        info!(local = %addr, user = %self.ctx.config.username, "Phone started");
        Ok(addr)
    }

    /// End every call, then deregister
    pub async fn stop(&self) -> ClientResult<()> {
        *self.ctx.status.write() = PhoneStatus::Stopped;

        for call in self.ctx.calls.snapshot() {
            let state = call.state();
            let result = match state {
                CallState::Online | CallState::Hold | CallState::OnlineHold => call.hangup().await,
                CallState::Ringing | CallState::RingingMe => call.deny().await,
                CallState::Dialing | CallState::End => call.cancel().await,
                _ => call.bye().await,
            };
            if let Err(e) = result {
                warn!(call_id = %call.call_id(), %state, error = %e, "Failed to end call on stop");
            }
        }

        self.ctx.signaling.stop().await?;
        info!("Phone stopped");
        Ok(())
    }

    /// Registration status reported by the signaling layer
    pub async fn sip_status(&self, online: bool) {
        let status = if online { RegistrationStatus::Online } else { RegistrationStatus::Offline };
        info!(%status, "Registration status");
        let _ = self.ctx.events.send(PhoneEvent::RegistrationChanged {
            status,
            timestamp: Utc::now(),
        });
        let handler = self.ctx.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_registration_status(status).await;
        }
    }

    /// Place an outbound call
    pub async fn call(&self, number: &str) -> ClientResult<Arc<Call>> {
        if !self.is_started() {
            return Err(ClientError::NotStarted);
        }

        let port = self.ctx.reserve_port()?;
        let plan: MediaPlan = [(port, PayloadAssociation::default_offer())].into_iter().collect();

        let outcome = match self.ctx.signaling.invite(number, &plan, TransmitMode::SendRecv).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.ctx.ports.release(port);
                warn!(number, error = %e, "Invite failed");
                return Err(e);
            }
        };

        // The session id must be owned by this call alone, since retiring
        // the call releases it.
        if !self.ctx.session_ids.reserve(outcome.session_id) {
            warn!(call_id = %outcome.call_id, session_id = outcome.session_id, "Session id already in use");
            self.abandon_invite(&outcome.request, port).await;
            return Err(ClientError::resource_unavailable(format!(
                "session id {} already in use",
                outcome.session_id
            )));
        }

        let request = outcome.request.clone();
        let call = Arc::new(Call::outgoing(&self.ctx, outcome.request, outcome.session_id, plan));
        if !self.ctx.calls.insert(call.clone()) {
            self.ctx.session_ids.release(outcome.session_id);
            self.abandon_invite(&request, port).await;
            return Err(ClientError::CallAlreadyExists { call_id: outcome.call_id });
        }
        self.ctx.cache_request(&request);

        info!(call_id = %outcome.call_id, number, port, "Dialing");
        self.ctx.notify(CallState::Dialing, &outcome.call_id).await;
        Ok(call)
    }

    /// Cancel an invite that could not be registered and free its port
    async fn abandon_invite(&self, request: &SipRequest, port: u16) {
        if let Err(e) = self.ctx.signaling.cancel(request).await {
            warn!(call_id = %request.call_id, error = %e, "Cancel of abandoned invite failed");
        }
        self.ctx.ports.release(port);
    }

    /// Register an inbound call under its call-id in RINGING_ME
    pub async fn incoming_call(&self, request: SipRequest, session_id: u32) -> ClientResult<Arc<Call>> {
        if !self.ctx.session_ids.reserve(session_id) {
            return Err(ClientError::resource_unavailable(format!("session id {session_id} already in use")));
        }
        let result = self.ctx.incoming_call(request, session_id).await;
        if result.is_err() {
            self.ctx.session_ids.release(session_id);
        }
        result
    }

    /// Entry point for every inbound signaling event
    pub async fn on_call(&self, request: SipRequest) -> ClientResult<()> {
        dispatcher::dispatch(&self.ctx, request).await
    }

    /// Redirect a ringing call to `target`, or the configured forward number
    pub async fn call_forward(&self, call_id: &str, target: Option<&str>) -> ClientResult<bool> {
        self.ctx.call_forward(call_id, target).await
    }

    pub async fn answer(&self, call_id: &str) -> ClientResult<()> {
        self.get_call(call_id)?.answer().await
    }

    pub async fn deny(&self, call_id: &str) -> ClientResult<()> {
        self.get_call(call_id)?.deny().await
    }

    pub async fn hangup(&self, call_id: &str) -> ClientResult<()> {
        self.get_call(call_id)?.hangup().await
    }

    pub async fn hold(&self, call_id: &str, is_hold: bool) -> ClientResult<()> {
        self.get_call(call_id)?.hold(is_hold).await
    }

    pub async fn transfer(&self, call_id: &str, transfer_to: &str, replaces: Option<&str>) -> ClientResult<()> {
        self.get_call(call_id)?.transfer(transfer_to, replaces).await
    }

    pub async fn send_dtmf(&self, call_id: &str, digit: char) -> ClientResult<()> {
        self.get_call(call_id)?.send_dtmf(digit).await
    }
}

impl std::fmt::Debug for Phone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phone")
            .field("username", &self.ctx.config.username)
            .field("status", &self.status())
            .field("calls", &self.ctx.calls.len())
            .finish()
    }
}
