use crate::delta::FRAGMENT_BIT;
use crate::error::FragmentError;
use crate::sequence::Sequence;

pub const FRAGMENT_HEADER_LEN: usize = 3;
pub const LAST_FRAGMENT_FLAG: u8 = 0x80;

/// The last-fragment marker takes the top bit of the index byte, capping a
/// logical packet at 127 fragments. That bounds the largest deliverable
/// delta; oversize splits fail instead of truncating.
pub const MAX_FRAGMENTS: usize = 127;

/// One slice of an oversized delta frame: the owning sequence with the
/// fragment bit set, an index byte, and the raw slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPacket {
    pub sequence: Sequence,
    pub index: u8,
    pub last: bool,
    pub payload: Vec<u8>,
}

impl FragmentPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.sequence.0 | FRAGMENT_BIT).to_be_bytes());
        out.push(self.index | if self.last { LAST_FRAGMENT_FLAG } else { 0 });
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return None;
        }
        let sequence = u16::from_be_bytes([bytes[0], bytes[1]]);
        if sequence & FRAGMENT_BIT == 0 {
            return None;
        }
        let index_byte = bytes[2];
        Some(Self {
            sequence: Sequence(sequence & !FRAGMENT_BIT),
            index: index_byte & !LAST_FRAGMENT_FLAG,
            last: index_byte & LAST_FRAGMENT_FLAG != 0,
            payload: bytes[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Splits an encoded delta frame into fragment frames of at most
/// `max_payload` bytes each, all carrying `sequence`.
pub fn split_frame(
    sequence: Sequence,
    frame: &[u8],
    max_payload: usize,
) -> Result<Vec<Vec<u8>>, FragmentError> {
    let chunks: Vec<&[u8]> = if frame.is_empty() {
        vec![frame]
    } else {
        frame.chunks(max_payload).collect()
    };
    if chunks.len() > MAX_FRAGMENTS {
        return Err(FragmentError::TooLarge {
            fragments: chunks.len(),
        });
    }

    let count = chunks.len();
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            FragmentPacket {
                sequence,
                index: index as u8,
                last: index == count - 1,
                payload: chunk.to_vec(),
            }
            .encode()
        })
        .collect())
}

/// Collects fragments for exactly one in-flight sequence. A fragment of a
/// newer sequence throws away the old set whole; nothing is ever carried
/// over between sequences.
#[derive(Debug, Default)]
pub struct FragmentReassembler {
    sequence: Option<Sequence>,
    fragments: Vec<Option<Vec<u8>>>,
    last_index: Option<u8>,
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.sequence = None;
        self.fragments.clear();
        self.last_index = None;
    }

    /// Returns the concatenated original frame once the last-fragment flag
    /// has been seen and every index below it is present.
    pub fn accept(&mut self, fragment: FragmentPacket) -> Option<Vec<u8>> {
        match self.sequence {
            Some(current) if current == fragment.sequence => {}
            Some(current) if fragment.sequence.is_newer_than(current) => {
                self.reset();
                self.sequence = Some(fragment.sequence);
            }
            // stale fragment of an abandoned sequence
            Some(_) => return None,
            None => self.sequence = Some(fragment.sequence),
        }

        let index = fragment.index as usize;
        if index >= MAX_FRAGMENTS {
            return None;
        }
        if self.fragments.len() <= index {
            self.fragments.resize(index + 1, None);
        }
        if fragment.last {
            self.last_index = Some(fragment.index);
        }
        self.fragments[index] = Some(fragment.payload);

        let last = self.last_index?;
        let needed = last as usize + 1;
        if self.fragments.len() < needed {
            return None;
        }
        if self.fragments[..needed].iter().any(|piece| piece.is_none()) {
            return None;
        }

        let mut out = Vec::new();
        for piece in &mut self.fragments[..needed] {
            if let Some(piece) = piece.take() {
                out.extend_from_slice(&piece);
            }
        }
        self.reset();
        Some(out)
    }
}
