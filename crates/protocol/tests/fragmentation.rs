use std::net::SocketAddr;

use slipstream::{
    ClientHandle, ClientSession, Delta, DeltaHistoryBuffer, DeltaHistoryParser, DemoWorld,
    MAX_PACKET_SIZE, MemoryHub, MemoryTransport, Sequence, ServerSession, Simulation, Snapshot,
    SnapshotError,
};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Opaque blob snapshot; every diff ships the whole thing, which makes it
/// easy to push frames far past the MTU.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Blob(Vec<u8>);

impl Snapshot for Blob {
    fn identity() -> Self {
        Blob(Vec::new())
    }

    fn diff(&self, _base: &Self) -> Vec<u8> {
        self.0.clone()
    }

    fn apply(_base: &Self, payload: &[u8]) -> Result<Self, SnapshotError> {
        Ok(Blob(payload.to_vec()))
    }
}

/// Single-peer simulation shipping one large blob.
struct BlobSim {
    blob: Vec<u8>,
    outbound: DeltaHistoryBuffer<Blob>,
    inbound: DeltaHistoryParser<Blob>,
    connected: bool,
}

impl BlobSim {
    fn new(blob: Vec<u8>) -> Self {
        Self {
            blob,
            outbound: DeltaHistoryBuffer::new(16),
            inbound: DeltaHistoryParser::new(),
            connected: false,
        }
    }

    fn received(&self) -> Option<&Vec<u8>> {
        self.inbound.snapshot().map(|blob| &blob.0)
    }
}

impl Simulation for BlobSim {
    fn connect(&mut self, _info: &[u8]) -> Result<ClientHandle, String> {
        self.connected = true;
        Ok(ClientHandle(1))
    }

    fn disconnect(&mut self, _handle: ClientHandle) {
        self.connected = false;
    }

    fn is_connected(&self, _handle: ClientHandle) -> bool {
        self.connected
    }

    fn state_info(&self, _handle: Option<ClientHandle>) -> Vec<u8> {
        Vec::new()
    }

    fn delta_create(&mut self, _handle: ClientHandle, acked: Option<Sequence>) -> Delta {
        self.outbound.tick(Blob(self.blob.clone()));
        self.outbound.diff(acked)
    }

    fn delta_apply(&mut self, _handle: ClientHandle, delta: &Delta) -> Option<Sequence> {
        let _ = self.inbound.apply(delta);
        self.inbound.last_sequence()
    }

    fn huffman_frequencies(&self) -> [u64; 256] {
        [1; 256]
    }
}

#[test]
fn oversized_delta_fragments_end_to_end() {
    let hub = MemoryHub::new();
    let server_addr = addr(41000);
    let client_addr = addr(41001);

    // incompressible-ish payload several times the MTU
    let blob: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
    assert!(blob.len() > 3 * MAX_PACKET_SIZE);

    let mut server = ServerSession::new(hub.endpoint(server_addr), BlobSim::new(blob.clone()))
        .expect("server session");
    let mut client: ClientSession<MemoryTransport, BlobSim> =
        ClientSession::new(hub.endpoint(client_addr), BlobSim::new(Vec::new()), server_addr)
            .expect("client session");

    for _ in 0..8 {
        client.tick();
        server.tick();
    }

    assert!(client.is_connected());
    assert_eq!(client.sim().received(), Some(&blob));
}

#[test]
fn small_payloads_still_fit_one_frame() {
    let hub = MemoryHub::new();
    let server_addr = addr(41010);
    let client_addr = addr(41011);

    let mut server = ServerSession::new(hub.endpoint(server_addr), DemoWorld::new(4))
        .expect("server session");
    let mut client = ClientSession::new(hub.endpoint(client_addr), DemoWorld::new(1), server_addr)
        .expect("client session");

    for _ in 0..6 {
        client.tick();
        server.tick();
    }
    assert!(client.is_connected());

    // demo deltas are tiny; every frame stays under the MTU
    let stats = server.stats();
    assert!(stats.packets_sent > 0);
    assert!(stats.bytes_sent < stats.packets_sent * MAX_PACKET_SIZE as u64);
}
