use crate::delta::{DeltaPacket, FRAGMENT_BIT};
use crate::fragment::FRAGMENT_HEADER_LEN;
use crate::stats::rand_u64;

pub const KEY_LEN: usize = 16;

const MARKER: [u8; 2] = [0xFF, 0xFF];
const MIN_CONTROL_LEN: usize = 3;

/// Out-of-band command codes, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Unrecognised = 0,
    Challenge = 1,
    ChallengeResponse = 2,
    Info = 3,
    InfoResponse = 4,
    Connect = 5,
    ConnectResponse = 6,
    Disconnect = 7,
}

impl Command {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Challenge,
            2 => Self::ChallengeResponse,
            3 => Self::Info,
            4 => Self::InfoResponse,
            5 => Self::Connect,
            6 => Self::ConnectResponse,
            7 => Self::Disconnect,
            _ => Self::Unrecognised,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Commands that append the 16-byte session key right after the header.
    pub fn carries_key(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::ConnectResponse | Self::Disconnect | Self::Info
        )
    }
}

/// 16 opaque bytes identifying one server session. Minted by the server,
/// copied by the client from the challenge response. The all-zero value
/// is reserved as "no key".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkKey([u8; KEY_LEN]);

impl NetworkKey {
    pub const NIL: Self = Self([0; KEY_LEN]);

    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes[..8].copy_from_slice(&rand_u64().to_be_bytes());
        bytes[8..].copy_from_slice(&rand_u64().to_be_bytes());
        if bytes == [0; KEY_LEN] {
            bytes[0] = 1;
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; KEY_LEN]
    }
}

/// Connectionless frame: `0xFF 0xFF <command>` plus the key for key-bearing
/// commands, then the command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub command: Command,
    pub key: NetworkKey,
    pub payload: Vec<u8>,
}

impl ControlFrame {
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self {
            command,
            key: NetworkKey::NIL,
            payload,
        }
    }

    pub fn with_key(command: Command, key: NetworkKey, payload: Vec<u8>) -> Self {
        Self {
            command,
            key,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_CONTROL_LEN + KEY_LEN + self.payload.len());
        out.extend_from_slice(&MARKER);
        out.push(self.command.as_byte());
        if self.command.carries_key() {
            out.extend_from_slice(self.key.as_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MIN_CONTROL_LEN || bytes[..2] != MARKER {
            return None;
        }
        let command = Command::from_byte(bytes[2]);
        let rest = &bytes[MIN_CONTROL_LEN..];
        if command.carries_key() {
            if rest.len() < KEY_LEN {
                return None;
            }
            Some(Self {
                command,
                key: NetworkKey::from_bytes(&rest[..KEY_LEN])?,
                payload: rest[KEY_LEN..].to_vec(),
            })
        } else {
            Some(Self {
                command,
                key: NetworkKey::NIL,
                payload: rest.to_vec(),
            })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.command != Command::Unrecognised
            && (!self.command.carries_key() || !self.key.is_nil())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Control(Command),
    Delta,
    Fragment,
    Unrecognised,
}

/// Sorts a raw datagram into one of the three frame families without
/// touching anything past the header. The connectionless marker wins over
/// a fragment of sequence 0x7FFF, which shares the same first two bytes.
pub fn classify(bytes: &[u8]) -> FrameKind {
    if bytes.len() >= MIN_CONTROL_LEN && bytes[..2] == MARKER {
        return FrameKind::Control(Command::from_byte(bytes[2]));
    }
    if bytes.len() >= 2 && bytes[0] & (FRAGMENT_BIT >> 8) as u8 != 0 {
        if bytes.len() >= FRAGMENT_HEADER_LEN {
            return FrameKind::Fragment;
        }
        return FrameKind::Unrecognised;
    }
    if bytes.len() >= DeltaPacket::HEADER_LEN {
        return FrameKind::Delta;
    }
    FrameKind::Unrecognised
}
