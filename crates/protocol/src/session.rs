use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{MAX_PACKET_SIZE, PROTOCOL_VERSION};
use crate::connection::{Clock, Connection, ConnectionState, Inbound, SystemClock};
use crate::delta::{DeltaPacket, keystream, xor_in_place};
use crate::error::{FragmentError, HuffmanError};
use crate::frame::{Command, ControlFrame, FrameKind, NetworkKey, classify};
use crate::fragment::{FRAGMENT_HEADER_LEN, split_frame};
use crate::history::Delta;
use crate::huffman::HuffmanCodec;
use crate::sequence::Sequence;
use crate::simulation::{ClientHandle, Simulation};
use crate::stats::NetworkStats;
use crate::transport::Transport;

/// Compresses, scrambles, frames, and (when oversized) fragments one
/// outbound delta into ready-to-send frames.
fn encode_delta(
    codec: &HuffmanCodec,
    key: &NetworkKey,
    delta: &Delta,
    ack: Option<Sequence>,
    session_id: Option<u16>,
) -> Result<Vec<Vec<u8>>, FragmentError> {
    let mut body = codec.encode(&delta.payload);
    xor_in_place(&mut body, &keystream(delta.to, ack, key));

    let mut payload = Vec::with_capacity(body.len() + 2);
    if let Some(id) = session_id {
        payload.extend_from_slice(&id.to_be_bytes());
    }
    payload.extend_from_slice(&body);

    let frame = DeltaPacket {
        to: delta.to,
        ack,
        base_distance: delta.base_distance,
        payload,
    }
    .encode();

    if frame.len() <= MAX_PACKET_SIZE {
        Ok(vec![frame])
    } else {
        split_frame(delta.to, &frame, MAX_PACKET_SIZE - FRAGMENT_HEADER_LEN)
    }
}

/// Server-side session table: one connection per peer address, driven by
/// `tick` through receive, garbage-collect, and send phases.
pub struct ServerSession<T: Transport, S: Simulation> {
    transport: T,
    sim: S,
    key: NetworkKey,
    codec: HuffmanCodec,
    connections: HashMap<SocketAddr, Connection>,
    session_addrs: HashMap<u16, SocketAddr>,
    next_session_id: u16,
    /// Farewell frames from connections torn down this tick; flushed by
    /// the send phase after the owning connection is already gone.
    parting_frames: Vec<(SocketAddr, Vec<u8>)>,
    clock: Arc<dyn Clock>,
    stats: NetworkStats,
}

impl<T: Transport, S: Simulation> ServerSession<T, S> {
    pub fn new(transport: T, sim: S) -> Result<Self, HuffmanError> {
        Self::with_clock(transport, sim, Arc::new(SystemClock))
    }

    pub fn with_clock(transport: T, sim: S, clock: Arc<dyn Clock>) -> Result<Self, HuffmanError> {
        let codec = HuffmanCodec::new(&sim.huffman_frequencies())?;
        Ok(Self {
            transport,
            sim,
            key: NetworkKey::random(),
            codec,
            connections: HashMap::new(),
            session_addrs: HashMap::new(),
            next_session_id: 1,
            parting_frames: Vec::new(),
            clock,
            stats: NetworkStats::default(),
        })
    }

    pub fn key(&self) -> &NetworkKey {
        &self.key
    }

    pub fn sim(&self) -> &S {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.connections.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.is_connected())
            .count()
    }

    /// Kicks one peer; the disconnect notice goes out on the next tick.
    pub fn disconnect_addr(&mut self, addr: SocketAddr, reason: &str) {
        if let Some(conn) = self.connections.get_mut(&addr) {
            conn.disconnect(reason);
        }
    }

    /// Tears down every session and disables the transport.
    pub fn shutdown(&mut self, reason: &str) {
        for conn in self.connections.values_mut() {
            conn.disconnect(reason);
        }
        self.tick();
        self.transport.disable();
    }

    pub fn tick(&mut self) {
        self.receive_phase();
        self.gc_phase();
        self.send_phase();
    }

    fn receive_phase(&mut self) {
        for (addr, bytes) in self.transport.receive() {
            self.stats.packets_received += 1;
            self.stats.bytes_received += bytes.len() as u64;
            self.dispatch(addr, &bytes);
        }
    }

    fn dispatch(&mut self, addr: SocketAddr, bytes: &[u8]) {
        if !self.connections.contains_key(&addr) {
            match classify(bytes) {
                FrameKind::Control(_) => {
                    if !self.admit(addr, bytes) {
                        return;
                    }
                }
                FrameKind::Delta => {
                    // a known session may have rebound to a new address
                    if !self.try_migrate(addr, bytes) {
                        return;
                    }
                }
                // fragments from unknown addresses cannot prove a session
                // id, so they are dropped rather than buffered
                FrameKind::Fragment | FrameKind::Unrecognised => return,
            }
        }

        let Some(conn) = self.connections.get_mut(&addr) else {
            return;
        };
        match conn.process(bytes, &mut self.sim) {
            Inbound::Delta(frame) => self.handle_delta(addr, &frame),
            Inbound::None => {}
        }
    }

    /// Creates a listening connection for a fresh address, but only for
    /// frames that could legitimately open a handshake. A key-bearing
    /// command with the wrong key never creates anything and never gets
    /// an answer.
    fn admit(&mut self, addr: SocketAddr, bytes: &[u8]) -> bool {
        let Some(frame) = ControlFrame::parse(bytes) else {
            return false;
        };
        if !frame.is_valid() {
            return false;
        }
        if !matches!(
            frame.command,
            Command::Challenge | Command::Connect | Command::Info
        ) {
            return false;
        }
        if frame.command.carries_key() && frame.key != self.key {
            log::debug!("{}: {:?} with wrong key ignored", addr, frame.command);
            return false;
        }

        let session_id = self.allocate_session_id();
        log::debug!("{}: new peer, session {}", addr, session_id);
        let conn = Connection::server(
            addr,
            self.key,
            session_id,
            PROTOCOL_VERSION,
            Arc::clone(&self.clock),
        );
        self.connections.insert(addr, conn);
        self.session_addrs.insert(session_id, addr);
        true
    }

    fn allocate_session_id(&mut self) -> u16 {
        loop {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
            if !self.session_addrs.contains_key(&id) {
                return id;
            }
        }
    }

    /// Rebinds an existing session to a new source address. The frame must
    /// carry a known session id and its payload must decode under the
    /// session key; otherwise nothing moves.
    fn try_migrate(&mut self, addr: SocketAddr, bytes: &[u8]) -> bool {
        let Some(packet) = DeltaPacket::parse(bytes) else {
            return false;
        };
        if packet.payload.len() < 2 {
            return false;
        }
        let session_id = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
        let Some(&old_addr) = self.session_addrs.get(&session_id) else {
            return false;
        };

        let mut body = packet.payload[2..].to_vec();
        xor_in_place(&mut body, &keystream(packet.to, packet.ack, &self.key));
        if self.codec.decode(&body).is_err() {
            log::debug!("{}: migration claim for session {} rejected", addr, session_id);
            return false;
        }

        let Some(mut conn) = self.connections.remove(&old_addr) else {
            self.session_addrs.remove(&session_id);
            return false;
        };
        log::info!("session {} migrated {} -> {}", session_id, old_addr, addr);
        conn.set_addr(addr);
        self.connections.insert(addr, conn);
        self.session_addrs.insert(session_id, addr);
        true
    }

    fn handle_delta(&mut self, addr: SocketAddr, frame: &[u8]) {
        let Some(packet) = DeltaPacket::parse(frame) else {
            return;
        };
        // client-to-server payloads lead with the peer's session id
        if packet.payload.len() < 2 {
            return;
        }
        let session_id = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);

        let Some(conn) = self.connections.get_mut(&addr) else {
            return;
        };
        if conn.session_id() != Some(session_id) {
            return;
        }

        let mut body = packet.payload[2..].to_vec();
        xor_in_place(&mut body, &keystream(packet.to, packet.ack, &self.key));
        let payload = match self.codec.decode(&body) {
            Ok(payload) => payload,
            Err(error) => {
                log::debug!("{}: undecodable delta payload: {}", addr, error);
                self.stats.packets_dropped += 1;
                return;
            }
        };

        let Some(handle) = conn.handle() else {
            return;
        };
        conn.set_remote_ack(packet.ack);
        let delta = Delta {
            to: packet.to,
            base_distance: packet.base_distance,
            payload,
        };
        let ack = self.sim.delta_apply(handle, &delta);
        conn.set_local_ack(ack);
    }

    fn gc_phase(&mut self) {
        let failed: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.has_failed())
            .map(|(addr, _)| *addr)
            .collect();
        for addr in failed {
            let Some(mut conn) = self.connections.remove(&addr) else {
                continue;
            };
            for frame in conn.take_outgoing() {
                self.parting_frames.push((addr, frame));
            }
            if let Some(id) = conn.session_id() {
                self.session_addrs.remove(&id);
            }
            if let Some(handle) = conn.handle() {
                self.sim.disconnect(handle);
            }
            log::info!(
                "{}: session removed: {}",
                addr,
                conn.fail_reason().unwrap_or("no reason")
            );
        }
    }

    fn send_phase(&mut self) {
        let mut batch: Vec<(SocketAddr, Vec<u8>)> = std::mem::take(&mut self.parting_frames);
        let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();

        for addr in addrs {
            let (frames, connected, handle, remote_ack, local_ack) = {
                let Some(conn) = self.connections.get_mut(&addr) else {
                    continue;
                };
                conn.update();
                (
                    conn.take_outgoing(),
                    conn.is_connected(),
                    conn.handle(),
                    conn.remote_ack(),
                    conn.local_ack(),
                )
            };
            batch.extend(frames.into_iter().map(|frame| (addr, frame)));

            if !connected {
                continue;
            }
            let Some(handle) = handle else {
                continue;
            };
            if !self.sim.is_connected(handle) {
                continue;
            }

            let delta = self.sim.delta_create(handle, remote_ack);
            match encode_delta(&self.codec, &self.key, &delta, local_ack, None) {
                Ok(frames) => batch.extend(frames.into_iter().map(|frame| (addr, frame))),
                Err(error) => log::warn!("{}: delta dropped: {}", addr, error),
            }
        }

        for (_, frame) in &batch {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += frame.len() as u64;
        }
        self.transport.send(&batch);
        self.transport.flush();
    }
}

/// Client-side counterpart: a single connection to one server, driven
/// symmetrically every tick.
pub struct ClientSession<T: Transport, S: Simulation> {
    transport: T,
    sim: S,
    server_addr: SocketAddr,
    connection: Connection,
    codec: HuffmanCodec,
    stats: NetworkStats,
}

impl<T: Transport, S: Simulation> ClientSession<T, S> {
    pub fn new(transport: T, sim: S, server_addr: SocketAddr) -> Result<Self, HuffmanError> {
        Self::with_clock(transport, sim, server_addr, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: T,
        sim: S,
        server_addr: SocketAddr,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HuffmanError> {
        let codec = HuffmanCodec::new(&sim.huffman_frequencies())?;
        let info = sim.state_info(None);
        let connection = Connection::client(server_addr, PROTOCOL_VERSION, info, clock);
        Ok(Self {
            transport,
            sim,
            server_addr,
            connection,
            codec,
            stats: NetworkStats::default(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn has_failed(&self) -> bool {
        self.connection.has_failed()
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.connection.fail_reason()
    }

    pub fn handle(&self) -> Option<ClientHandle> {
        self.connection.handle()
    }

    pub fn session_id(&self) -> Option<u16> {
        self.connection.session_id()
    }

    pub fn sim(&self) -> &S {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Queues an out-of-band server info query (needs the session key).
    pub fn request_info(&mut self) {
        self.connection.request_info();
    }

    pub fn server_info(&self) -> Option<&[u8]> {
        self.connection.server_info()
    }

    pub fn disconnect(&mut self, reason: &str) {
        self.connection.disconnect(reason);
    }

    pub fn tick(&mut self) {
        for (addr, bytes) in self.transport.receive() {
            if addr != self.server_addr {
                continue;
            }
            self.stats.packets_received += 1;
            self.stats.bytes_received += bytes.len() as u64;
            match self.connection.process(&bytes, &mut self.sim) {
                Inbound::Delta(frame) => self.handle_delta(&frame),
                Inbound::None => {}
            }
        }

        self.connection.update();
        let mut batch: Vec<(SocketAddr, Vec<u8>)> = self
            .connection
            .take_outgoing()
            .into_iter()
            .map(|frame| (self.server_addr, frame))
            .collect();

        if self.connection.is_connected() {
            if let (Some(handle), Some(session_id)) =
                (self.connection.handle(), self.connection.session_id())
            {
                if self.sim.is_connected(handle) {
                    let delta = self.sim.delta_create(handle, self.connection.remote_ack());
                    match encode_delta(
                        &self.codec,
                        self.connection.key(),
                        &delta,
                        self.connection.local_ack(),
                        Some(session_id),
                    ) {
                        Ok(frames) => {
                            batch.extend(frames.into_iter().map(|frame| (self.server_addr, frame)));
                        }
                        Err(error) => log::warn!("delta dropped: {}", error),
                    }
                }
            }
        }

        for (_, frame) in &batch {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += frame.len() as u64;
        }
        self.transport.send(&batch);
        self.transport.flush();
    }

    fn handle_delta(&mut self, frame: &[u8]) {
        let Some(packet) = DeltaPacket::parse(frame) else {
            return;
        };
        // server-to-client payloads carry no session id prefix
        let stream = keystream(packet.to, packet.ack, self.connection.key());
        let mut body = packet.payload;
        xor_in_place(&mut body, &stream);
        let payload = match self.codec.decode(&body) {
            Ok(payload) => payload,
            Err(error) => {
                log::debug!("undecodable delta payload: {}", error);
                self.stats.packets_dropped += 1;
                return;
            }
        };

        let Some(handle) = self.connection.handle() else {
            return;
        };
        self.connection.set_remote_ack(packet.ack);
        let delta = Delta {
            to: packet.to,
            base_distance: packet.base_distance,
            payload,
        };
        let ack = self.sim.delta_apply(handle, &delta);
        self.connection.set_local_ack(ack);
    }
}
