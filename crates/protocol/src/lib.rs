mod bitbuf;
mod config;
mod connection;
mod delta;
mod error;
mod fragment;
mod frame;
mod history;
mod huffman;
mod sequence;
mod session;
mod simulation;
mod stats;
mod transport;

pub use bitbuf::{BitReader, BitWriter};
pub use config::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, FLOOD_TRIGGER, HISTORY_CAPACITY, IDLE_TIMEOUT,
    MAX_PACKET_SIZE, MAX_RETRIES, PROTOCOL_VERSION, RETRY_PERIOD,
};
pub use connection::{Clock, Connection, ConnectionState, Inbound, SystemClock};
pub use delta::{ACK_NONE, DeltaPacket, FRAGMENT_BIT, keystream, xor_in_place};
pub use error::{FragmentError, HuffmanError, SnapshotError};
pub use fragment::{
    FRAGMENT_HEADER_LEN, FragmentPacket, FragmentReassembler, LAST_FRAGMENT_FLAG, MAX_FRAGMENTS,
    split_frame,
};
pub use frame::{Command, ControlFrame, FrameKind, KEY_LEN, NetworkKey, classify};
pub use history::{Delta, DeltaHistoryBuffer, DeltaHistoryParser, Snapshot};
pub use huffman::{EOF_SYMBOL, HuffmanCodec};
pub use sequence::Sequence;
pub use session::{ClientSession, ServerSession};
pub use simulation::{ClientHandle, DemoWorld, PlayerState, Simulation, default_frequencies};
pub use stats::{NetworkStats, PacketLossSimulation, rand_percent, rand_u64};
pub use transport::{MemoryHub, MemoryTransport, Transport, UdpTransport};
