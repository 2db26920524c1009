use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::stats::PacketLossSimulation;

const RECV_BUFFER_LEN: usize = 2048;

/// Batch-oriented datagram transport. The sessions above never touch a
/// socket directly; anything that can move address-tagged byte blobs fits.
pub trait Transport {
    fn receive(&mut self) -> Vec<(SocketAddr, Vec<u8>)>;
    fn send(&mut self, batch: &[(SocketAddr, Vec<u8>)]);
    /// Drops anything pending and re-enables the endpoint.
    fn reset(&mut self);
    /// Pushes buffered sends out, where the medium buffers at all.
    fn flush(&mut self);
    /// Stops all traffic until the next `reset`.
    fn disable(&mut self);
}

/// Nonblocking UDP socket transport.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; RECV_BUFFER_LEN],
    enabled: bool,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; RECV_BUFFER_LEN],
            enabled: true,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for UdpTransport {
    fn receive(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut batch = Vec::new();
        if !self.enabled {
            return batch;
        }
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => batch.push((addr, self.recv_buffer[..size].to_vec())),
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    log::warn!("udp receive error: {}", error);
                    break;
                }
            }
        }
        batch
    }

    fn send(&mut self, batch: &[(SocketAddr, Vec<u8>)]) {
        if !self.enabled {
            return;
        }
        for (addr, bytes) in batch {
            if let Err(error) = self.socket.send_to(bytes, addr) {
                log::warn!("udp send to {} failed: {}", addr, error);
            }
        }
    }

    fn reset(&mut self) {
        while self.socket.recv_from(&mut self.recv_buffer).is_ok() {}
        self.enabled = true;
    }

    fn flush(&mut self) {
        // datagrams go out on send; nothing is buffered here
    }

    fn disable(&mut self) {
        self.enabled = false;
    }
}

#[derive(Debug)]
struct DelayedPacket {
    release_time: Instant,
    src: SocketAddr,
    dst: SocketAddr,
    bytes: Vec<u8>,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse order for min-heap
        other.release_time.cmp(&self.release_time)
    }
}

#[derive(Debug, Default)]
struct HubInner {
    mailboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    delayed: BinaryHeap<DelayedPacket>,
    loss: Option<PacketLossSimulation>,
}

impl HubInner {
    /// Moves every delayed packet whose time has come into its mailbox.
    fn release_due(&mut self) {
        let now = Instant::now();
        while let Some(next) = self.delayed.peek() {
            if next.release_time > now {
                break;
            }
            if let Some(packet) = self.delayed.pop() {
                self.mailboxes
                    .entry(packet.dst)
                    .or_default()
                    .push_back((packet.src, packet.bytes));
            }
        }
    }
}

/// In-memory datagram network for tests and simulations: every endpoint
/// gets a mailbox keyed by its address, with an optional loss model on
/// the wire.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Rc<RefCell<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_loss(&self, loss: Option<PacketLossSimulation>) {
        self.inner.borrow_mut().loss = loss;
    }

    pub fn endpoint(&self, addr: SocketAddr) -> MemoryTransport {
        self.inner.borrow_mut().mailboxes.entry(addr).or_default();
        MemoryTransport {
            inner: Rc::clone(&self.inner),
            addr,
            enabled: true,
        }
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    inner: Rc<RefCell<HubInner>>,
    addr: SocketAddr,
    enabled: bool,
}

impl MemoryTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Moves this endpoint to a new source address, keeping anything
    /// already queued for it. Simulates a NAT rebind.
    pub fn rebind(&mut self, addr: SocketAddr) {
        let mut inner = self.inner.borrow_mut();
        let pending = inner.mailboxes.remove(&self.addr).unwrap_or_default();
        inner.mailboxes.insert(addr, pending);
        self.addr = addr;
    }
}

impl Transport for MemoryTransport {
    fn receive(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        if !self.enabled {
            return Vec::new();
        }
        let mut inner = self.inner.borrow_mut();
        inner.release_due();
        inner
            .mailboxes
            .get_mut(&self.addr)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn send(&mut self, batch: &[(SocketAddr, Vec<u8>)]) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        for (dst, bytes) in batch {
            let (lost, delay_ms) = match &inner.loss {
                Some(loss) => (loss.should_drop(), loss.delay_ms()),
                None => (false, 0),
            };
            if lost {
                continue;
            }
            if delay_ms == 0 {
                inner
                    .mailboxes
                    .entry(*dst)
                    .or_default()
                    .push_back((self.addr, bytes.clone()));
            } else {
                inner.delayed.push(DelayedPacket {
                    release_time: Instant::now() + Duration::from_millis(delay_ms as u64),
                    src: self.addr,
                    dst: *dst,
                    bytes: bytes.clone(),
                });
            }
        }
    }

    fn reset(&mut self) {
        self.inner
            .borrow_mut()
            .mailboxes
            .entry(self.addr)
            .or_default()
            .clear();
        self.enabled = true;
    }

    fn flush(&mut self) {}

    fn disable(&mut self) {
        self.enabled = false;
    }
}
