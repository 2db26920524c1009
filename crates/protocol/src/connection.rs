use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{FLOOD_TRIGGER, IDLE_TIMEOUT, MAX_RETRIES, RETRY_PERIOD};
use crate::frame::{Command, ControlFrame, FrameKind, KEY_LEN, NetworkKey, classify};
use crate::fragment::{FragmentPacket, FragmentReassembler};
use crate::sequence::Sequence;
use crate::simulation::{ClientHandle, Simulation};

/// Time source a connection reads on every update. Injected so retry and
/// timeout behavior is testable without sleeping.
pub trait Clock: fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// Server side, answering handshakes.
    Listening,
    /// Client side, soliciting a challenge response.
    Challenging,
    /// Client side, key adopted, soliciting a connect response.
    Connecting,
    Connected,
    /// Local disconnect requested; the notice goes out on the next update.
    Disconnecting,
    /// Terminal until the connection is restarted.
    Failed,
}

/// What one processed datagram produced for the layer above.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    None,
    /// A complete delta frame, reassembled if it arrived in fragments.
    Delta(Vec<u8>),
}

/// Per-peer handshake and lifecycle state machine. Consumes raw datagrams,
/// queues raw frames to send, and leaves delta payload decoding to the
/// session that owns it.
#[derive(Debug)]
pub struct Connection {
    addr: SocketAddr,
    state: ConnectionState,
    key: NetworkKey,
    version: u16,
    session_id: Option<u16>,
    handle: Option<ClientHandle>,
    client_info: Vec<u8>,
    retries: u32,
    last_send: Option<Instant>,
    handshake_packets: u32,
    fail_reason: Option<String>,
    pending_disconnect: Option<String>,
    last_info: Option<Vec<u8>>,
    remote_ack: Option<Sequence>,
    local_ack: Option<Sequence>,
    last_receive: Instant,
    reassembler: FragmentReassembler,
    outbox: Vec<Vec<u8>>,
    clock: Arc<dyn Clock>,
}

impl Connection {
    /// Client-side connection: starts challenging the peer. `info` is the
    /// opaque blob the simulation wants delivered with the connect request.
    pub fn client(addr: SocketAddr, version: u16, info: Vec<u8>, clock: Arc<dyn Clock>) -> Self {
        let last_receive = clock.now();
        Self {
            addr,
            state: ConnectionState::Challenging,
            key: NetworkKey::NIL,
            version,
            session_id: None,
            handle: None,
            client_info: info,
            retries: 0,
            last_send: None,
            handshake_packets: 0,
            fail_reason: None,
            pending_disconnect: None,
            last_info: None,
            remote_ack: None,
            local_ack: None,
            last_receive,
            reassembler: FragmentReassembler::new(),
            outbox: Vec::new(),
            clock,
        }
    }

    /// Server-side connection for a newly seen address, sharing the
    /// server-minted key.
    pub fn server(
        addr: SocketAddr,
        key: NetworkKey,
        session_id: u16,
        version: u16,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let last_receive = clock.now();
        Self {
            addr,
            state: ConnectionState::Listening,
            key,
            version,
            session_id: Some(session_id),
            handle: None,
            client_info: Vec::new(),
            retries: 0,
            last_send: None,
            handshake_packets: 0,
            fail_reason: None,
            pending_disconnect: None,
            last_info: None,
            remote_ack: None,
            local_ack: None,
            last_receive,
            reassembler: FragmentReassembler::new(),
            outbox: Vec::new(),
            clock,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_addr(&mut self, addr: SocketAddr) {
        self.addr = addr;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn key(&self) -> &NetworkKey {
        &self.key
    }

    pub fn session_id(&self) -> Option<u16> {
        self.session_id
    }

    pub fn handle(&self) -> Option<ClientHandle> {
        self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn has_failed(&self) -> bool {
        self.state == ConnectionState::Failed
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    pub fn remote_ack(&self) -> Option<Sequence> {
        self.remote_ack
    }

    pub fn set_remote_ack(&mut self, ack: Option<Sequence>) {
        self.remote_ack = ack;
    }

    pub fn local_ack(&self) -> Option<Sequence> {
        self.local_ack
    }

    pub fn set_local_ack(&mut self, ack: Option<Sequence>) {
        self.local_ack = ack;
    }

    pub fn server_info(&self) -> Option<&[u8]> {
        self.last_info.as_deref()
    }

    /// Frames queued for the peer since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Requests a graceful teardown; the notice is emitted on the next
    /// update, after which the connection lands in `Failed`.
    pub fn disconnect(&mut self, reason: &str) {
        if matches!(self.state, ConnectionState::Failed | ConnectionState::Idle) {
            return;
        }
        self.pending_disconnect = Some(reason.to_string());
        self.state = ConnectionState::Disconnecting;
    }

    /// Returns the connection to its initial state for a fresh session.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Idle;
        self.key = NetworkKey::NIL;
        self.session_id = None;
        self.handle = None;
        self.retries = 0;
        self.last_send = None;
        self.handshake_packets = 0;
        self.fail_reason = None;
        self.pending_disconnect = None;
        self.last_info = None;
        self.remote_ack = None;
        self.local_ack = None;
        self.last_receive = self.clock.now();
        self.reassembler.reset();
        self.outbox.clear();
    }

    /// Queues an out-of-band server info query. Needs the session key, so
    /// it is a no-op until the challenge response arrived.
    pub fn request_info(&mut self) {
        if self.key.is_nil() {
            return;
        }
        self.outbox
            .push(ControlFrame::with_key(Command::Info, self.key, Vec::new()).encode());
    }

    /// Feeds one raw datagram through the state machine. Control frames
    /// are consumed here; completed delta frames are handed back up.
    pub fn process(&mut self, bytes: &[u8], sim: &mut dyn Simulation) -> Inbound {
        self.last_receive = self.clock.now();
        match classify(bytes) {
            FrameKind::Control(_) => {
                if let Some(frame) = ControlFrame::parse(bytes) {
                    self.process_control(&frame, sim);
                }
                Inbound::None
            }
            FrameKind::Delta => {
                if self.state == ConnectionState::Listening {
                    self.promote();
                }
                if self.state != ConnectionState::Connected {
                    return Inbound::None;
                }
                Inbound::Delta(bytes.to_vec())
            }
            FrameKind::Fragment => {
                if self.state == ConnectionState::Listening {
                    self.promote();
                }
                if self.state != ConnectionState::Connected {
                    return Inbound::None;
                }
                match FragmentPacket::parse(bytes).and_then(|f| self.reassembler.accept(f)) {
                    Some(frame) => Inbound::Delta(frame),
                    None => Inbound::None,
                }
            }
            FrameKind::Unrecognised => Inbound::None,
        }
    }

    /// Tick-driven time handling: handshake retries, timeout failure, and
    /// the deferred disconnect notice.
    pub fn update(&mut self) {
        let now = self.clock.now();
        match self.state {
            ConnectionState::Challenging => self.retry(now, Command::Challenge),
            ConnectionState::Connecting => self.retry(now, Command::Connect),
            ConnectionState::Listening | ConnectionState::Connected => {
                if now.duration_since(self.last_receive) >= IDLE_TIMEOUT {
                    self.fail(String::from("Connection idle: peer went silent"));
                }
            }
            ConnectionState::Disconnecting => {
                let reason = self
                    .pending_disconnect
                    .take()
                    .unwrap_or_else(|| String::from("Disconnected"));
                if !self.key.is_nil() {
                    self.outbox.push(
                        ControlFrame::with_key(
                            Command::Disconnect,
                            self.key,
                            reason.clone().into_bytes(),
                        )
                        .encode(),
                    );
                }
                self.fail(reason);
            }
            _ => {}
        }
    }

    fn retry(&mut self, now: Instant, command: Command) {
        let due = match self.last_send {
            None => true,
            Some(at) => now.duration_since(at) >= RETRY_PERIOD,
        };
        if !due {
            return;
        }
        if self.retries >= MAX_RETRIES {
            self.fail(format!(
                "{:?} handshake: Timeout after {} retries",
                command, MAX_RETRIES
            ));
            return;
        }
        let frame = match command {
            Command::Challenge => {
                ControlFrame::new(Command::Challenge, self.version.to_be_bytes().to_vec())
            }
            Command::Connect => {
                ControlFrame::with_key(Command::Connect, self.key, self.client_info.clone())
            }
            _ => return,
        };
        self.outbox.push(frame.encode());
        self.retries += 1;
        self.last_send = Some(now);
    }

    fn process_control(&mut self, frame: &ControlFrame, sim: &mut dyn Simulation) {
        if frame.command == Command::InfoResponse
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            self.last_info = Some(frame.payload.clone());
            return;
        }
        match self.state {
            ConnectionState::Listening => self.listening_control(frame, sim),
            ConnectionState::Challenging => self.challenging_control(frame),
            ConnectionState::Connecting => self.connecting_control(frame, sim),
            ConnectionState::Connected => self.connected_control(frame, sim),
            _ => {}
        }
    }

    fn listening_control(&mut self, frame: &ControlFrame, sim: &mut dyn Simulation) {
        self.handshake_packets += 1;
        if self.handshake_packets > FLOOD_TRIGGER {
            log::debug!("{}: handshake flood, replies suppressed", self.addr);
            return;
        }
        match frame.command {
            Command::Challenge => {
                let mut payload = self.version.to_be_bytes().to_vec();
                payload.extend_from_slice(self.key.as_bytes());
                self.outbox
                    .push(ControlFrame::new(Command::ChallengeResponse, payload).encode());
            }
            Command::Info => {
                if !frame.is_valid() || frame.key != self.key {
                    return;
                }
                self.outbox
                    .push(ControlFrame::new(Command::InfoResponse, sim.state_info(None)).encode());
            }
            Command::Connect => {
                if !frame.is_valid() || frame.key != self.key {
                    log::debug!("{}: connect with wrong key ignored", self.addr);
                    return;
                }
                if self.handle.is_none() {
                    match sim.connect(&frame.payload) {
                        Ok(handle) => {
                            log::info!("{}: peer accepted as {:?}", self.addr, handle);
                            self.handle = Some(handle);
                        }
                        Err(reason) => {
                            log::info!("{}: connect refused: {}", self.addr, reason);
                            self.outbox.push(
                                ControlFrame::with_key(
                                    Command::Disconnect,
                                    self.key,
                                    reason.clone().into_bytes(),
                                )
                                .encode(),
                            );
                            self.fail(reason);
                            return;
                        }
                    }
                }
                // retransmitted connects get the same response again
                let mut payload = self.session_id.unwrap_or(0).to_be_bytes().to_vec();
                payload.extend_from_slice(&sim.state_info(self.handle));
                self.outbox.push(
                    ControlFrame::with_key(Command::ConnectResponse, self.key, payload).encode(),
                );
            }
            Command::Disconnect => {
                if !frame.is_valid() || frame.key != self.key {
                    return;
                }
                self.fail(String::from_utf8_lossy(&frame.payload).into_owned());
            }
            _ => {}
        }
    }

    fn challenging_control(&mut self, frame: &ControlFrame) {
        if frame.command != Command::ChallengeResponse {
            return;
        }
        if frame.payload.len() < 2 + KEY_LEN {
            return;
        }
        let version = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        if version != self.version {
            self.fail(format!(
                "Protocol version mismatch: peer {}, local {}",
                version, self.version
            ));
            return;
        }
        let Some(key) = NetworkKey::from_bytes(&frame.payload[2..2 + KEY_LEN]) else {
            return;
        };
        if key.is_nil() {
            return;
        }
        log::debug!("{}: challenge answered, key adopted", self.addr);
        self.key = key;
        self.state = ConnectionState::Connecting;
        self.retries = 0;
        self.last_send = None;
    }

    fn connecting_control(&mut self, frame: &ControlFrame, sim: &mut dyn Simulation) {
        match frame.command {
            Command::ConnectResponse => {
                if !frame.is_valid() || frame.key != self.key || frame.payload.len() < 2 {
                    return;
                }
                let session_id = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                match sim.connect(&frame.payload[2..]) {
                    Ok(handle) => {
                        log::info!("{}: connected, session {}", self.addr, session_id);
                        self.session_id = Some(session_id);
                        self.handle = Some(handle);
                        self.state = ConnectionState::Connected;
                    }
                    Err(reason) => {
                        self.outbox.push(
                            ControlFrame::with_key(
                                Command::Disconnect,
                                self.key,
                                reason.clone().into_bytes(),
                            )
                            .encode(),
                        );
                        self.fail(reason);
                    }
                }
            }
            Command::Disconnect => {
                if !frame.is_valid() || frame.key != self.key {
                    return;
                }
                self.fail(String::from_utf8_lossy(&frame.payload).into_owned());
            }
            _ => {}
        }
    }

    fn connected_control(&mut self, frame: &ControlFrame, sim: &mut dyn Simulation) {
        match frame.command {
            Command::Disconnect => {
                if !frame.is_valid() || frame.key != self.key {
                    return;
                }
                self.fail(String::from_utf8_lossy(&frame.payload).into_owned());
            }
            // info queries keep working on a live session
            Command::Info => {
                if !frame.is_valid() || frame.key != self.key {
                    return;
                }
                self.outbox
                    .push(ControlFrame::new(Command::InfoResponse, sim.state_info(None)).encode());
            }
            _ => {}
        }
    }

    /// A listening connection that sees state traffic is done handshaking.
    fn promote(&mut self) {
        log::debug!("{}: first delta received, session live", self.addr);
        self.state = ConnectionState::Connected;
    }

    fn fail(&mut self, reason: String) {
        log::info!("{}: connection failed: {}", self.addr, reason);
        self.state = ConnectionState::Failed;
        self.fail_reason = Some(reason);
    }
}
