//! A single negotiated RTP leg
//!
//! Each [`MediaStream`] owns one local UDP port, one destination and one
//! [`PayloadAssociation`]. Once started it runs two tasks: a sender that
//! paces outbound frames every packet interval, and a receiver that parses
//! inbound datagrams into the timestamp-addressed receive buffer or fires
//! the DTMF callback. Both tasks stop when the stream's cancellation token
//! fires, which [`MediaStream::stop`] does synchronously and idempotently.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use softphone_rtp_core::{
    rtcp, DtmfEvent, DtmfTone, PayloadAssociation, PayloadType, RtpHeader, RtpPacket,
    DEFAULT_MAX_PACKET_SIZE,
};

use crate::buffer::PacketBuffer;
use crate::config::{MediaSettings, MediaStreamConfig, TransmitMode};
use crate::error::{MediaError, MediaResult};

/// Invoked from the receive task for every new telephone event
pub type DtmfCallback = Arc<dyn Fn(DtmfTone) + Send + Sync>;

/// Lifecycle of a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct StreamCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,
    keepalives_sent: AtomicU64,
    dtmf_sent: AtomicU64,
    dtmf_received: AtomicU64,
}

/// Point-in-time copy of a stream's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Media packets only; keepalives and DTMF are counted separately
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
    pub keepalives_sent: u64,
    pub dtmf_sent: u64,
    pub dtmf_received: u64,
}

struct SendState {
    sequence: u16,
    timestamp: u32,
    first_packet: bool,
}

/// State shared between the stream handle and its tasks
struct StreamShared {
    id: Uuid,
    ssrc: u32,
    codec: (u8, PayloadType),
    association: PayloadAssociation,
    mode: RwLock<TransmitMode>,
    settings: MediaSettings,
    remote: RwLock<SocketAddr>,
    on_hold: AtomicBool,
    send: Mutex<SendState>,
    counters: StreamCounters,
    inbound: PacketBuffer,
    outbound: PacketBuffer,
    dtmf_callback: Option<DtmfCallback>,
}

impl StreamShared {
    fn media_packet(&self, payload: Bytes) -> RtpPacket {
        let mut send = self.send.lock();
        let header = RtpHeader::new(self.codec.0, send.sequence, send.timestamp, self.ssrc)
            .with_marker(send.first_packet);
        send.first_packet = false;
        send.sequence = send.sequence.wrapping_add(1);
        send.timestamp = send.timestamp.wrapping_add(payload.len() as u32);
        RtpPacket::new(header, payload)
    }

    fn event_packet(&self, payload_type: u8, payload: Bytes) -> RtpPacket {
        let mut send = self.send.lock();
        let header = RtpHeader::new(payload_type, send.sequence, send.timestamp, self.ssrc).with_marker(true);
        send.sequence = send.sequence.wrapping_add(1);
        RtpPacket::new(header, payload)
    }

    fn keepalive_packet(&self) -> RtpPacket {
        let mut send = self.send.lock();
        let header = RtpHeader::new(self.settings.keepalive_payload_type, send.sequence, 0, self.ssrc);
        send.sequence = send.sequence.wrapping_add(1);
        RtpPacket::new(header, Bytes::from_static(&[0, 0, 0, 0]))
    }

    async fn transmit(&self, socket: &UdpSocket, packet: &RtpPacket) -> MediaResult<usize> {
        let bytes = packet.build()?;
        let remote = *self.remote.read();
        let sent = socket.send_to(&bytes, remote).await?;
        self.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        trace!(
            stream = %self.id,
            %remote,
            seq = packet.header.sequence_number,
            pt = packet.header.payload_type,
            "Sent RTP packet"
        );
        Ok(sent)
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr, first_seen: &mut bool) {
        if rtcp::is_rtcp(data) {
            trace!(stream = %self.id, %from, "Ignoring RTCP datagram");
            return;
        }

        let (packet, codec) = match RtpPacket::parse(data, &self.association) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(stream = %self.id, %from, error = %e, "Dropping undecodable RTP packet");
                return;
            }
        };

        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);

        match codec {
            PayloadType::TelephoneEvent => self.handle_event(&packet),
            codec if codec.is_audio() => {
                if !self.mode.read().can_receive() {
                    return;
                }
                // A marker after the first packet starts a new talk spurt
                let resync = packet.header.marker && *first_seen;
                *first_seen = true;
                self.inbound.write_at(packet.header.timestamp, &packet.media_payload(), resync);
            }
            other => {
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(stream = %self.id, codec = %other, "Unsupported payload on media leg");
            }
        }
    }

    fn handle_event(&self, packet: &RtpPacket) {
        match DtmfEvent::parse(&packet.media_payload()) {
            Ok(event) if packet.header.marker => {
                self.counters.dtmf_received.fetch_add(1, Ordering::Relaxed);
                debug!(stream = %self.id, digit = %event.tone.to_char(), "Received DTMF");
                if let Some(callback) = &self.dtmf_callback {
                    callback(event.tone);
                }
            }
            Ok(_) => trace!(stream = %self.id, "Telephone event continuation"),
            Err(e) => debug!(stream = %self.id, error = %e, "Malformed telephone event"),
        }
    }
}

/// One negotiated RTP leg
pub struct MediaStream {
    shared: Arc<StreamShared>,
    local_addr: SocketAddr,
    state: Mutex<StreamState>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaStream {
    /// Create a stream; nothing is bound until [`MediaStream::start`].
    ///
    /// Fails with [`MediaError::NoCompatibleCodec`] when the association
    /// has no audio codec to send with.
    pub fn new(config: MediaStreamConfig, dtmf_callback: Option<DtmfCallback>) -> MediaResult<Self> {
        let codec = config
            .association
            .preferred_codec()
            .ok_or(MediaError::NoCompatibleCodec)?;

        let mut rng = rand::thread_rng();
        let send = SendState {
            sequence: rng.gen_range(1..=100),
            timestamp: rng.gen_range(1..=10_000),
            first_packet: true,
        };
        let ssrc = rng.gen_range(1000..=65530);

        let settings = config.settings;
        let shared = StreamShared {
            id: Uuid::new_v4(),
            ssrc,
            codec,
            association: config.association,
            mode: RwLock::new(config.transmit_mode),
            remote: RwLock::new(config.remote_addr),
            on_hold: AtomicBool::new(false),
            send: Mutex::new(send),
            counters: StreamCounters::default(),
            inbound: PacketBuffer::new(settings.silence_byte, settings.resync_threshold),
            outbound: PacketBuffer::new(settings.silence_byte, settings.resync_threshold),
            dtmf_callback,
            settings,
        };

        debug!(
            stream = %shared.id,
            local = %config.local_addr,
            remote = %config.remote_addr,
            codec = %codec.1,
            "Created media stream"
        );

        Ok(Self {
            shared: Arc::new(shared),
            local_addr: config.local_addr,
            state: Mutex::new(StreamState::Idle),
            socket: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn ssrc(&self) -> u32 {
        self.shared.ssrc
    }

    /// Payload id and codec used for outbound media
    pub fn codec(&self) -> (u8, PayloadType) {
        self.shared.codec
    }

    pub fn association(&self) -> &PayloadAssociation {
        &self.shared.association
    }

    pub fn transmit_mode(&self) -> TransmitMode {
        *self.shared.mode.read()
    }

    /// Change direction mid-call (re-INVITE)
    pub fn set_transmit_mode(&self, mode: TransmitMode) {
        let previous = std::mem::replace(&mut *self.shared.mode.write(), mode);
        if previous != mode {
            info!(stream = %self.shared.id, %previous, %mode, "Transmit mode changed");
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Bound address once started, the configured one before that
    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .lock()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .unwrap_or(self.local_addr)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        *self.shared.remote.read()
    }

    /// Point the stream at a new destination (re-INVITE)
    pub fn set_remote_addr(&self, remote: SocketAddr) {
        let previous = std::mem::replace(&mut *self.shared.remote.write(), remote);
        if previous != remote {
            info!(stream = %self.shared.id, %previous, %remote, "Media destination changed");
        }
    }

    pub fn stats(&self) -> StreamStats {
        let c = &self.shared.counters;
        StreamStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_dropped: c.packets_dropped.load(Ordering::Relaxed),
            keepalives_sent: c.keepalives_sent.load(Ordering::Relaxed),
            dtmf_sent: c.dtmf_sent.load(Ordering::Relaxed),
            dtmf_received: c.dtmf_received.load(Ordering::Relaxed),
        }
    }

    /// Bind the local port and spawn the send and receive tasks.
    ///
    /// Calling it again while running is a no-op; a stopped stream cannot be
    /// restarted.
    pub async fn start(&self) -> MediaResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                StreamState::Running | StreamState::Starting => return Ok(()),
                StreamState::Stopped => return Err(MediaError::Stopped),
                StreamState::Idle => *state = StreamState::Starting,
            }
        }

        let socket = match bind_shared(self.local_addr) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                *self.state.lock() = StreamState::Idle;
                warn!(stream = %self.shared.id, local = %self.local_addr, error = %e, "Failed to bind media port");
                return Err(e.into());
            }
        };

        let mut state = self.state.lock();
        if *state == StreamState::Stopped {
            return Err(MediaError::Stopped);
        }

        let sender = tokio::spawn(run_sender(self.shared.clone(), socket.clone(), self.cancel.clone()));
        let receiver = tokio::spawn(run_receiver(self.shared.clone(), socket.clone(), self.cancel.clone()));
        self.tasks.lock().extend([sender, receiver]);

        let bound = socket.local_addr().unwrap_or(self.local_addr);
        *self.socket.lock() = Some(socket);
        *state = StreamState::Running;

        info!(
            stream = %self.shared.id,
            local = %bound,
            remote = %self.remote_addr(),
            ssrc = format_args!("{:08x}", self.shared.ssrc),
            mode = %self.transmit_mode(),
            "Media stream started"
        );
        Ok(())
    }

    /// Stop both tasks and release the socket.
    ///
    /// Safe to call repeatedly and from any thread; blocked readers wake up
    /// and receive silence.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == StreamState::Stopped {
                return;
            }
            *state = StreamState::Stopped;
        }

        self.cancel.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.socket.lock().take();
        self.shared.inbound.wake_readers();

        info!(stream = %self.shared.id, "Media stream stopped");
    }

    /// Mute outbound media while held; a keepalive keeps NAT bindings open.
    /// Receiving is unaffected.
    pub fn hold(&self, on_hold: bool) {
        let was = self.shared.on_hold.swap(on_hold, Ordering::AcqRel);
        if was != on_hold {
            info!(stream = %self.shared.id, on_hold, "Media stream hold changed");
        }
    }

    pub fn is_on_hold(&self) -> bool {
        self.shared.on_hold.load(Ordering::Acquire)
    }

    /// Queue audio for sending. Audio queued while held is discarded.
    pub fn write(&self, data: &[u8]) {
        self.shared.outbound.push(data);
    }

    /// Read `length` bytes of received audio.
    ///
    /// A blocking read waits until that much is buffered or the stream is
    /// stopped; a non-blocking read returns at once. Either way the result
    /// is padded with silence to `length`.
    pub async fn read(&self, length: usize, blocking: bool) -> Bytes {
        if blocking {
            self.readable(length).await;
        }
        self.shared.inbound.read_padded(length)
    }

    /// Wait until `length` bytes are buffered or the stream is stopped
    pub async fn readable(&self, length: usize) {
        loop {
            let notified = self.shared.inbound.notified();
            if self.shared.inbound.available() >= length || self.state() == StreamState::Stopped {
                return;
            }
            notified.await;
        }
    }

    /// Send the key press for `digit` (`0-9`, `*`, `#`, `A-D`)
    pub async fn send_digit(&self, digit: char) -> MediaResult<()> {
        let tone = DtmfTone::from_char(digit).ok_or(MediaError::InvalidDtmfDigit(digit))?;
        self.send_dtmf(tone).await
    }

    /// Send one RFC 4733 key press on the negotiated telephone-event type
    pub async fn send_dtmf(&self, tone: DtmfTone) -> MediaResult<()> {
        let payload_type = self
            .shared
            .association
            .telephone_event_id()
            .ok_or(MediaError::DtmfNotNegotiated)?;
        let socket = self.active_socket()?;

        if self.is_on_hold() {
            debug!(stream = %self.shared.id, digit = %tone.to_char(), "Stream held, DTMF not sent");
            return Ok(());
        }

        let packet = self
            .shared
            .event_packet(payload_type, DtmfEvent::key_press(tone).to_bytes());
        self.shared.transmit(&socket, &packet).await?;
        self.shared.counters.dtmf_sent.fetch_add(1, Ordering::Relaxed);
        debug!(stream = %self.shared.id, digit = %tone.to_char(), "Sent DTMF");
        Ok(())
    }

    /// Send the receiver report + SDES compound to the peer's RTCP port
    pub async fn send_rtcp(&self) -> MediaResult<()> {
        let socket = self.active_socket()?;
        let cname = format!("{:08x}@{}", self.shared.ssrc, self.local_addr().ip());
        let report = rtcp::receiver_report_with_cname(self.shared.ssrc, &cname)?;

        let mut destination = self.remote_addr();
        destination.set_port(destination.port().wrapping_add(1));
        socket.send_to(&report, destination).await?;
        debug!(stream = %self.shared.id, %destination, "Sent RTCP receiver report");
        Ok(())
    }

    fn active_socket(&self) -> MediaResult<Arc<UdpSocket>> {
        if self.state() == StreamState::Stopped {
            return Err(MediaError::Stopped);
        }
        self.socket.lock().clone().ok_or(MediaError::NotStarted)
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.shared.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr())
            .field("codec", &self.shared.codec)
            .field("state", &self.state())
            .finish()
    }
}

/// Bind a UDP socket that other legs of the same call may share.
fn bind_shared(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    // Ephemeral binds stay exclusive so the kernel never hands out a shared port
    if addr.port() != 0 {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

async fn run_sender(shared: Arc<StreamShared>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let frame_size = shared.settings.frame_size;
    let keepalive_interval = shared.settings.keepalive_interval();
    let mut ticker = interval(shared.settings.packet_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_keepalive: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let payload = shared.outbound.read_padded(frame_size);

        if shared.on_hold.load(Ordering::Acquire) {
            let due = last_keepalive.map_or(true, |at| at.elapsed() >= keepalive_interval);
            if due {
                last_keepalive = Some(Instant::now());
                let packet = shared.keepalive_packet();
                match shared.transmit(&socket, &packet).await {
                    Ok(_) => {
                        shared.counters.keepalives_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => debug!(stream = %shared.id, error = %e, "Keepalive send failed"),
                }
            }
            continue;
        }
        last_keepalive = None;

        if !shared.mode.read().can_send() {
            continue;
        }

        let packet = shared.media_packet(payload);
        match shared.transmit(&socket, &packet).await {
            Ok(_) => {
                shared.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!(stream = %shared.id, error = %e, "RTP send failed"),
        }
    }

    debug!(stream = %shared.id, "RTP sender finished");
}

async fn run_receiver(shared: Arc<StreamShared>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
    let mut first_seen = false;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, from)) => shared.handle_datagram(&buf[..len], from, &mut first_seen),
            Err(e) => debug!(stream = %shared.id, error = %e, "RTP receive error"),
        }
    }

    debug!(stream = %shared.id, "RTP receiver finished");
}
