use std::collections::HashMap;

use crate::bitbuf::{BitReader, BitWriter};
use crate::config::HISTORY_CAPACITY;
use crate::error::SnapshotError;
use crate::history::{Delta, DeltaHistoryBuffer, DeltaHistoryParser, Snapshot};
use crate::sequence::Sequence;

/// Opaque ticket the simulation hands out for an accepted peer. The
/// transport stores and returns it, never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u32);

/// Everything the transport needs from the simulation layer: admission,
/// opaque info blobs, per-peer delta production/consumption, and the
/// frequency model the byte compressor is built from.
pub trait Simulation {
    fn connect(&mut self, info: &[u8]) -> Result<ClientHandle, String>;
    fn disconnect(&mut self, handle: ClientHandle);
    fn is_connected(&self, handle: ClientHandle) -> bool;
    fn state_info(&self, handle: Option<ClientHandle>) -> Vec<u8>;
    fn delta_create(&mut self, handle: ClientHandle, acked: Option<Sequence>) -> Delta;
    /// Returns the sequence to acknowledge after taking this delta in:
    /// the current base, or none when only an identity diff can resync
    /// the stream.
    fn delta_apply(&mut self, handle: ClientHandle, delta: &Delta) -> Option<Sequence>;
    fn huffman_frequencies(&self) -> [u64; 256];
}

/// Demo player state used by the binaries and the integration tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerState {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub health: u16,
    pub flags: u8,
}

// Hand-listed field table: one presence bit per field, then the field at a
// fixed width. Order and widths are part of the wire format.
const FIELD_WIDTHS: [u32; 5] = [32, 32, 32, 16, 8];

impl PlayerState {
    fn field(&self, index: usize) -> u32 {
        match index {
            0 => self.x as u32,
            1 => self.y as u32,
            2 => self.z as u32,
            3 => self.health as u32,
            4 => self.flags as u32,
            _ => 0,
        }
    }

    fn set_field(&mut self, index: usize, value: u32) {
        match index {
            0 => self.x = value as i32,
            1 => self.y = value as i32,
            2 => self.z = value as i32,
            3 => self.health = value as u16,
            4 => self.flags = value as u8,
            _ => {}
        }
    }
}

impl Snapshot for PlayerState {
    fn identity() -> Self {
        Self::default()
    }

    fn diff(&self, base: &Self) -> Vec<u8> {
        let mut writer = BitWriter::new();
        for (index, &width) in FIELD_WIDTHS.iter().enumerate() {
            let value = self.field(index);
            if value == base.field(index) {
                writer.push_bit(false);
            } else {
                writer.push_bit(true);
                writer.push_bits(value, width);
            }
        }
        writer.into_bytes()
    }

    fn apply(base: &Self, payload: &[u8]) -> Result<Self, SnapshotError> {
        let mut reader = BitReader::new(payload);
        let mut next = *base;
        for (index, &width) in FIELD_WIDTHS.iter().enumerate() {
            match reader.pull_bit() {
                Some(true) => {
                    let value = reader.pull_bits(width).ok_or(SnapshotError::Truncated)?;
                    next.set_field(index, value);
                }
                Some(false) => {}
                None => return Err(SnapshotError::Truncated),
            }
        }
        Ok(next)
    }
}

#[derive(Debug)]
struct Peer {
    state: PlayerState,
    outbound: DeltaHistoryBuffer<PlayerState>,
    inbound: DeltaHistoryParser<PlayerState>,
}

/// Reference `Simulation` over `PlayerState` peers: admission with a peer
/// cap, symmetric per-peer delta history, a static info blob.
#[derive(Debug)]
pub struct DemoWorld {
    peers: HashMap<u32, Peer>,
    next_handle: u32,
    max_peers: usize,
    info: Vec<u8>,
}

impl DemoWorld {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            next_handle: 1,
            max_peers,
            info: b"slipstream demo world".to_vec(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn handles(&self) -> Vec<ClientHandle> {
        let mut handles: Vec<ClientHandle> = self.peers.keys().map(|&id| ClientHandle(id)).collect();
        handles.sort_by_key(|handle| handle.0);
        handles
    }

    /// The locally authored state for a peer, the one deltas are cut from.
    pub fn peer_state(&self, handle: ClientHandle) -> Option<PlayerState> {
        self.peers.get(&handle.0).map(|peer| peer.state)
    }

    pub fn set_peer_state(&mut self, handle: ClientHandle, state: PlayerState) {
        if let Some(peer) = self.peers.get_mut(&handle.0) {
            peer.state = state;
        }
    }

    /// The most recent state received from the peer, if any arrived yet.
    pub fn received_state(&self, handle: ClientHandle) -> Option<PlayerState> {
        self.peers
            .get(&handle.0)
            .and_then(|peer| peer.inbound.snapshot().copied())
    }

    /// Demo mutation used by the binaries to keep deltas flowing.
    pub fn nudge(&mut self, handle: ClientHandle, step: i32) {
        if let Some(peer) = self.peers.get_mut(&handle.0) {
            peer.state.x = peer.state.x.wrapping_add(step);
            peer.state.z = peer.state.z.wrapping_sub(step);
            peer.state.flags = peer.state.flags.wrapping_add(1);
        }
    }
}

impl Simulation for DemoWorld {
    fn connect(&mut self, info: &[u8]) -> Result<ClientHandle, String> {
        if self.peers.len() >= self.max_peers {
            return Err(String::from("Server full"));
        }
        let handle = ClientHandle(self.next_handle);
        self.next_handle += 1;
        log::debug!("peer {} joined ({} info bytes)", handle.0, info.len());
        self.peers.insert(
            handle.0,
            Peer {
                state: PlayerState::default(),
                outbound: DeltaHistoryBuffer::new(HISTORY_CAPACITY),
                inbound: DeltaHistoryParser::new(),
            },
        );
        Ok(handle)
    }

    fn disconnect(&mut self, handle: ClientHandle) {
        if self.peers.remove(&handle.0).is_some() {
            log::debug!("peer {} left", handle.0);
        }
    }

    fn is_connected(&self, handle: ClientHandle) -> bool {
        self.peers.contains_key(&handle.0)
    }

    fn state_info(&self, _handle: Option<ClientHandle>) -> Vec<u8> {
        self.info.clone()
    }

    fn delta_create(&mut self, handle: ClientHandle, acked: Option<Sequence>) -> Delta {
        match self.peers.get_mut(&handle.0) {
            Some(peer) => {
                let state = peer.state;
                peer.outbound.tick(state);
                peer.outbound.diff(acked)
            }
            None => Delta {
                to: Sequence::ZERO,
                base_distance: 0,
                payload: Vec::new(),
            },
        }
    }

    fn delta_apply(&mut self, handle: ClientHandle, delta: &Delta) -> Option<Sequence> {
        let peer = self.peers.get_mut(&handle.0)?;
        if let Err(error) = peer.inbound.apply(delta) {
            // drop the payload, keep the base we have
            log::debug!("peer {}: bad delta payload: {}", handle.0, error);
        }
        peer.inbound.last_sequence()
    }

    fn huffman_frequencies(&self) -> [u64; 256] {
        default_frequencies()
    }
}

/// Frequency model for delta payloads: heavily zero-biased with a falloff
/// over small values. Presence-bit encodings make most payload bytes zero
/// or near it.
pub fn default_frequencies() -> [u64; 256] {
    let mut table = [1u64; 256];
    table[0] = 1 << 12;
    for value in 1..32 {
        table[value] = 1 << 6;
    }
    for value in 32..128 {
        table[value] = 8;
    }
    table
}
