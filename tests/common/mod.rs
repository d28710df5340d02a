#![allow(dead_code)]

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use quictun::{Error, PacketDevice, PublicKey, Session, quinn::ConnectionError};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf, duplex, split},
    sync::{Mutex, mpsc, watch},
};

pub static SETUP: LazyLock<()> = LazyLock::new(|| {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
});

type MemorySend = WriteHalf<DuplexStream>;
type MemoryRecv = ReadHalf<DuplexStream>;

/// One side of an in-memory session pair.
#[derive(Debug, Clone)]
pub struct MemorySession {
    outgoing: mpsc::UnboundedSender<(MemorySend, MemoryRecv)>,
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<(MemorySend, MemoryRecv)>>>,
    closed: Arc<watch::Sender<Option<(u32, Vec<u8>)>>>,
    rtt: Arc<std::sync::Mutex<Duration>>,
    peer_key: Option<PublicKey>,
    connection_id: u64,
    remote: SocketAddr,
}

impl MemorySession {
    /// A connected pair. `keys` are the keys each side presents to the other.
    pub fn pair(keys: (Option<PublicKey>, Option<PublicKey>)) -> (Self, Self) {
        let (a_out, b_in) = mpsc::unbounded_channel();
        let (b_out, a_in) = mpsc::unbounded_channel();
        let closed = Arc::new(watch::Sender::new(None));
        let connection_id = 0x0123_4567_89ab_cdef;

        let a = Self {
            outgoing: a_out,
            incoming: Arc::new(Mutex::new(a_in)),
            closed: closed.clone(),
            rtt: Arc::new(std::sync::Mutex::new(Duration::from_millis(10))),
            peer_key: keys.1,
            connection_id,
            remote: "127.0.0.2:4433".parse().unwrap(),
        };
        let b = Self {
            outgoing: b_out,
            incoming: Arc::new(Mutex::new(b_in)),
            closed,
            rtt: Arc::new(std::sync::Mutex::new(Duration::from_millis(10))),
            peer_key: keys.0,
            connection_id,
            remote: "127.0.0.1:50000".parse().unwrap(),
        };
        (a, b)
    }

    /// The same session, seeing its peer at another address.
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = remote;
        self
    }

    pub fn set_rtt(&self, rtt: Duration) {
        *self.rtt.lock().unwrap() = rtt;
    }

    /// The close code and reason, if either side closed the session.
    pub fn close_reason(&self) -> Option<(u32, Vec<u8>)> {
        self.closed.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }
}

fn closed_error() -> Error {
    Error::Connection(ConnectionError::LocallyClosed)
}

impl Session for MemorySession {
    type SendStream = MemorySend;
    type RecvStream = MemoryRecv;

    async fn open_stream(&self) -> Result<(MemorySend, MemoryRecv), Error> {
        if self.is_closed() {
            return Err(closed_error());
        }

        let (local, remote) = duplex(64 * 1024);
        let (local_recv, local_send) = split(local);
        let (remote_recv, remote_send) = split(remote);
        self.outgoing
            .send((remote_send, remote_recv))
            .map_err(|_| closed_error())?;
        Ok((local_send, local_recv))
    }

    async fn accept_stream(&self) -> Result<(MemorySend, MemoryRecv), Error> {
        let mut closed = self.closed.subscribe();
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream.ok_or_else(closed_error),
            _ = closed.wait_for(|c| c.is_some()) => Err(closed_error()),
        }
    }

    fn peer_key(&self) -> Option<PublicKey> {
        self.peer_key.clone()
    }

    fn rtt(&self) -> Duration {
        *self.rtt.lock().unwrap()
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn close(&self, code: u32, reason: &[u8]) {
        self.closed.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some((code, reason.to_vec()));
            true
        });
    }
}

/// A packet device backed by channels: packets pushed into `inject` are read by the tunnel, and
/// packets the tunnel writes come out of `written`.
#[derive(Debug)]
pub struct ChannelDevice {
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct DeviceHandle {
    pub inject: mpsc::UnboundedSender<Vec<u8>>,
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn new() -> (Arc<Self>, DeviceHandle) {
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inbound: Mutex::new(inbound),
                outbound,
            }),
            DeviceHandle { inject, written },
        )
    }
}

impl PacketDevice for ChannelDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

/// A minimal IPv4 packet with a transport header starting with the two ports.
pub fn ipv4_packet(protocol: u8, src: ([u8; 4], u16), dst: ([u8; 4], u16), payload: &[u8]) -> Vec<u8> {
    let total = 20 + 8 + payload.len();
    let mut packet = vec![0_u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.0);
    packet[16..20].copy_from_slice(&dst.0);
    packet.extend_from_slice(&src.1.to_be_bytes());
    packet.extend_from_slice(&dst.1.to_be_bytes());
    packet.extend_from_slice(&[0; 4]);
    packet.extend_from_slice(payload);
    packet
}

/// A minimal IPv6 packet with a transport header starting with the two ports, behind the given
/// chain of extension headers (each as `(next_header, raw bytes)`).
pub fn ipv6_packet(
    protocol: u8,
    src: ([u8; 16], u16),
    dst: ([u8; 16], u16),
    extensions: &[(u8, Vec<u8>)],
) -> Vec<u8> {
    let mut packet = vec![0_u8; 40];
    packet[0] = 0x60;
    packet[6] = extensions.first().map_or(protocol, |(kind, _)| *kind);
    packet[7] = 64;
    packet[8..24].copy_from_slice(&src.0);
    packet[24..40].copy_from_slice(&dst.0);

    for (i, (_, raw)) in extensions.iter().enumerate() {
        let mut raw = raw.clone();
        raw[0] = extensions.get(i + 1).map_or(protocol, |(kind, _)| *kind);
        packet.extend_from_slice(&raw);
    }

    packet.extend_from_slice(&src.1.to_be_bytes());
    packet.extend_from_slice(&dst.1.to_be_bytes());
    packet.extend_from_slice(&[0; 4]);
    let payload_len = (packet.len() - 40) as u16;
    packet[4..6].copy_from_slice(&payload_len.to_be_bytes());
    packet
}
