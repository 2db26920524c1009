use crate::error::SnapshotError;
use crate::sequence::Sequence;

/// One full state of the simulation at a tick, as far as the transport is
/// concerned: something that can be diffed against a base and rebuilt from
/// a base plus a diff. `identity` is the agreed empty state both ends can
/// always fall back to.
pub trait Snapshot: Clone {
    fn identity() -> Self;
    fn diff(&self, base: &Self) -> Vec<u8>;
    fn apply(base: &Self, payload: &[u8]) -> Result<Self, SnapshotError>;
}

/// An encoded state update: target sequence, how many ticks back the base
/// sits (0 = identity), and the diff payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub to: Sequence,
    pub base_distance: u8,
    pub payload: Vec<u8>,
}

/// Writer-side ring of past snapshots. Grows by one per `tick`, never
/// shrinks; bases that fell off the ring degrade to identity diffs.
#[derive(Debug)]
pub struct DeltaHistoryBuffer<S> {
    ring: Vec<Option<(Sequence, S)>>,
    sequence: Sequence,
}

impl<S: Snapshot> DeltaHistoryBuffer<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: (0..capacity.max(1)).map(|_| None).collect(),
            sequence: Sequence::ZERO,
        }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Records a snapshot and advances the local sequence.
    pub fn tick(&mut self, snapshot: S) -> Sequence {
        let sequence = self.sequence.next();
        let slot = sequence.0 as usize % self.ring.len();
        self.ring[slot] = Some((sequence, snapshot));
        sequence
    }

    fn lookup(&self, sequence: Sequence) -> Option<&S> {
        let slot = sequence.0 as usize % self.ring.len();
        match &self.ring[slot] {
            Some((stored, snapshot)) if *stored == sequence => Some(snapshot),
            _ => None,
        }
    }

    /// Diffs the newest snapshot against the peer-acknowledged base. With
    /// no ack, or a base too old for the ring or the one-byte distance
    /// field, the diff is taken against the identity snapshot instead.
    pub fn diff(&self, acked: Option<Sequence>) -> Delta {
        let to = self.sequence;
        let identity = S::identity();
        let current = self.lookup(to).unwrap_or(&identity);

        let base = acked.and_then(|acked| {
            let distance = to.distance(acked);
            if distance == 0 || distance > 255 || distance as usize >= self.ring.len() {
                return None;
            }
            self.lookup(acked).map(|snapshot| (distance as u8, snapshot))
        });

        match base {
            Some((base_distance, snapshot)) => Delta {
                to,
                base_distance,
                payload: current.diff(snapshot),
            },
            None => Delta {
                to,
                base_distance: 0,
                payload: current.diff(&identity),
            },
        }
    }
}

/// Reader-side counterpart: tracks the one snapshot deltas build on.
#[derive(Debug)]
pub struct DeltaHistoryParser<S> {
    base: Option<(Sequence, S)>,
}

impl<S> Default for DeltaHistoryParser<S> {
    fn default() -> Self {
        Self { base: None }
    }
}

impl<S: Snapshot> DeltaHistoryParser<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sequence(&self) -> Option<Sequence> {
        self.base.as_ref().map(|(sequence, _)| *sequence)
    }

    pub fn snapshot(&self) -> Option<&S> {
        self.base.as_ref().map(|(_, snapshot)| snapshot)
    }

    pub fn reset(&mut self) {
        self.base = None;
    }

    /// Applies a delta and returns the newly accepted sequence. A stale
    /// delta is ignored; a delta whose base we never accepted means the
    /// stream lost sync, so the base resets and the next identity diff
    /// resynchronizes rather than guessing.
    pub fn apply(&mut self, delta: &Delta) -> Result<Option<Sequence>, SnapshotError> {
        if delta.base_distance == 0 {
            let snapshot = S::apply(&S::identity(), &delta.payload)?;
            self.base = Some((delta.to, snapshot));
            return Ok(Some(delta.to));
        }

        let expected = Sequence(delta.to.0.wrapping_sub(delta.base_distance as u16));
        match &self.base {
            Some((have, base)) if *have == expected => {
                let snapshot = S::apply(base, &delta.payload)?;
                self.base = Some((delta.to, snapshot));
                Ok(Some(delta.to))
            }
            Some((have, _)) => {
                if delta.to.is_newer_than(*have) {
                    self.base = None;
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-value snapshot; the diff is the new value when it changed,
    /// empty otherwise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Counter(u32);

    impl Snapshot for Counter {
        fn identity() -> Self {
            Counter(0)
        }

        fn diff(&self, base: &Self) -> Vec<u8> {
            if self.0 == base.0 {
                Vec::new()
            } else {
                self.0.to_be_bytes().to_vec()
            }
        }

        fn apply(base: &Self, payload: &[u8]) -> Result<Self, SnapshotError> {
            match payload.len() {
                0 => Ok(*base),
                4 => Ok(Counter(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]))),
                _ => Err(SnapshotError::Malformed("counter payload")),
            }
        }
    }

    #[test]
    fn test_first_diff_is_identity_based() {
        let mut buffer = DeltaHistoryBuffer::new(8);
        buffer.tick(Counter(5));
        let delta = buffer.diff(None);
        assert_eq!(delta.to, Sequence(1));
        assert_eq!(delta.base_distance, 0);
        assert_eq!(delta.payload, 5u32.to_be_bytes());
    }

    #[test]
    fn test_diff_against_acked_base() {
        let mut buffer = DeltaHistoryBuffer::new(8);
        buffer.tick(Counter(5));
        let acked = buffer.sequence();
        buffer.tick(Counter(5));
        let delta = buffer.diff(Some(acked));
        assert_eq!(delta.base_distance, 1);
        assert!(delta.payload.is_empty());
    }

    #[test]
    fn test_old_ack_falls_back_to_identity() {
        let mut buffer = DeltaHistoryBuffer::new(8);
        buffer.tick(Counter(1));
        let stale = buffer.sequence();
        for value in 2..=9 {
            buffer.tick(Counter(value));
        }
        // the acked snapshot is 8 ticks old with capacity 8
        let delta = buffer.diff(Some(stale));
        assert_eq!(delta.base_distance, 0);
    }

    #[test]
    fn test_bogus_future_ack_falls_back_to_identity() {
        let mut buffer = DeltaHistoryBuffer::new(8);
        buffer.tick(Counter(1));
        let delta = buffer.diff(Some(Sequence(40)));
        assert_eq!(delta.base_distance, 0);
    }

    #[test]
    fn test_parser_follows_chain() {
        let mut buffer = DeltaHistoryBuffer::new(8);
        let mut parser: DeltaHistoryParser<Counter> = DeltaHistoryParser::new();

        buffer.tick(Counter(10));
        let first = buffer.diff(None);
        assert_eq!(parser.apply(&first).unwrap(), Some(Sequence(1)));
        assert_eq!(parser.snapshot(), Some(&Counter(10)));

        buffer.tick(Counter(11));
        let second = buffer.diff(parser.last_sequence());
        assert_eq!(second.base_distance, 1);
        assert_eq!(parser.apply(&second).unwrap(), Some(Sequence(2)));
        assert_eq!(parser.snapshot(), Some(&Counter(11)));
    }

    #[test]
    fn test_stale_delta_ignored() {
        let mut parser: DeltaHistoryParser<Counter> = DeltaHistoryParser::new();
        let fresh = Delta {
            to: Sequence(10),
            base_distance: 0,
            payload: 3u32.to_be_bytes().to_vec(),
        };
        parser.apply(&fresh).unwrap();

        let stale = Delta {
            to: Sequence(8),
            base_distance: 1,
            payload: Vec::new(),
        };
        assert_eq!(parser.apply(&stale).unwrap(), None);
        // still in sync on the old base
        assert_eq!(parser.last_sequence(), Some(Sequence(10)));
    }

    #[test]
    fn test_newer_mismatch_resets_sync() {
        let mut parser: DeltaHistoryParser<Counter> = DeltaHistoryParser::new();
        let fresh = Delta {
            to: Sequence(10),
            base_distance: 0,
            payload: 3u32.to_be_bytes().to_vec(),
        };
        parser.apply(&fresh).unwrap();

        // base 14 was never accepted: the stream skipped ahead
        let ahead = Delta {
            to: Sequence(15),
            base_distance: 1,
            payload: Vec::new(),
        };
        assert_eq!(parser.apply(&ahead).unwrap(), None);
        assert_eq!(parser.last_sequence(), None);

        // the next identity diff resynchronizes
        let resync = Delta {
            to: Sequence(16),
            base_distance: 0,
            payload: 7u32.to_be_bytes().to_vec(),
        };
        assert_eq!(parser.apply(&resync).unwrap(), Some(Sequence(16)));
    }

    #[test]
    fn test_no_base_needs_identity_diff() {
        let mut parser: DeltaHistoryParser<Counter> = DeltaHistoryParser::new();
        let delta = Delta {
            to: Sequence(3),
            base_distance: 1,
            payload: Vec::new(),
        };
        assert_eq!(parser.apply(&delta).unwrap(), None);
    }
}
