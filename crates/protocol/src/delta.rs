use crate::frame::NetworkKey;
use crate::sequence::Sequence;

/// Wire sentinel for "no acknowledged sequence yet". An honest ack of
/// 0xFFFF reads back as none, costing the peer one identity diff.
pub const ACK_NONE: u16 = 0xFFFF;

/// Top bit of the sequence field marks a fragment frame; a delta's own
/// sequence therefore never uses it.
pub const FRAGMENT_BIT: u16 = 0x8000;

/// State-update frame: sequence, acknowledged peer sequence, how far back
/// the diff base sits (0 = identity snapshot), then the compressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPacket {
    pub to: Sequence,
    pub ack: Option<Sequence>,
    pub base_distance: u8,
    pub payload: Vec<u8>,
}

impl DeltaPacket {
    pub const HEADER_LEN: usize = 5;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.to.0 & !FRAGMENT_BIT).to_be_bytes());
        out.extend_from_slice(&self.ack.map_or(ACK_NONE, |seq| seq.0).to_be_bytes());
        out.push(self.base_distance);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::HEADER_LEN {
            return None;
        }
        let sequence = u16::from_be_bytes([bytes[0], bytes[1]]);
        if sequence & FRAGMENT_BIT != 0 {
            return None;
        }
        let ack = u16::from_be_bytes([bytes[2], bytes[3]]);
        Some(Self {
            to: Sequence(sequence),
            ack: (ack != ACK_NONE).then_some(Sequence(ack)),
            base_distance: bytes[4],
            payload: bytes[Self::HEADER_LEN..].to_vec(),
        })
    }
}

/// Derives the 4-byte obfuscation stream for one delta packet from its
/// header fields and the session key.
///
/// This is scrambling against casual inspection and packet replay from
/// strangers, nothing more. It is NOT encryption and offers no
/// confidentiality or integrity against anyone who has read this source.
pub fn keystream(to: Sequence, ack: Option<Sequence>, key: &NetworkKey) -> [u8; 4] {
    let to = to.0.to_be_bytes();
    let ack = ack.map_or(0, |seq| seq.0).to_be_bytes();
    let mut stream = [to[0], to[1], ack[0], ack[1]];
    for (i, &byte) in key.as_bytes().iter().enumerate() {
        stream[i % 4] ^= byte;
    }
    stream
}

/// XORs the stream across the payload. Involutory: applying it twice
/// restores the input.
pub fn xor_in_place(payload: &mut [u8], stream: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= stream[i % 4];
    }
}
