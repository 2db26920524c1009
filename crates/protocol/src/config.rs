use std::time::Duration;

pub const PROTOCOL_VERSION: u16 = 1;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Largest frame handed to the transport. Chosen once for the whole system
/// (a safe MTU minus IP/UDP overhead), never negotiated per path.
pub const MAX_PACKET_SIZE: usize = 1200;

/// Handshake packets are resent on this period until an answer arrives.
pub const RETRY_PERIOD: Duration = Duration::from_millis(1000);

/// Resend attempts before a handshake fails with a timeout.
pub const MAX_RETRIES: u32 = 5;

/// Handshake packets from one address beyond this count go unanswered.
pub const FLOOD_TRIGGER: u32 = 32;

/// A listening or connected peer that stays silent this long is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshots kept for delta bases before falling back to an identity diff.
pub const HISTORY_CAPACITY: usize = 64;
