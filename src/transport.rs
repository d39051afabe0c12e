//! Transport capability (spec §6) and two concrete implementations.
//!
//! The manager never parses addressing; `PeerAddress` is an opaque, tagged
//! handle. `TransportKind` is what lets the manager suppress MRP over a
//! stream transport (spec §9, "reliability-over-stream suppression").
//!
//! `DatagramTransport` adapts the teacher's original UDP multiplexing design
//! (one socket, a reader task fanning datagrams out to per-peer channels by
//! address). `DuplexTransport` is new: an in-memory `tokio::mpsc` pair so
//! the reliability engine can be driven deterministically in tests without a
//! real socket.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Datagram,
    Stream,
}

/// Opaque peer handle. Equality and hashing are by the raw address string
/// only; the manager never inspects it beyond passing it back to `send`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    addr: String,
    kind: TransportKind,
}

impl PeerAddress {
    pub fn datagram(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            kind: TransportKind::Datagram,
        }
    }

    pub fn stream(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            kind: TransportKind::Stream,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

type SendFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>>;

/// A datagram-or-stream send primitive, kept deliberately thin: the manager
/// only ever calls `send`, and reads `kind()` once to decide whether MRP
/// applies. Boxed-future return (rather than `async fn` in the trait) keeps
/// `Arc<dyn Transport>` object-safe.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, bytes: &'a [u8], peer: &'a PeerAddress) -> SendFuture<'a>;
    fn kind(&self) -> TransportKind;
}

struct ConnectionInfo {
    sender: mpsc::Sender<Vec<u8>>,
}

/// Shared UDP transport: one socket, a map of remote address -> channel
/// sender, a reader task dispatching inbound datagrams by source address.
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    connections: AsyncMutex<HashMap<String, ConnectionInfo>>,
    stop_token: CancellationToken,
}

impl DatagramTransport {
    pub async fn bind(local: &str) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(local).await.context("binding datagram transport")?);
        let stop_token = CancellationToken::new();
        let transport = Arc::new(Self {
            socket: socket.clone(),
            connections: AsyncMutex::new(HashMap::new()),
            stop_token: stop_token.clone(),
        });

        let self_weak = Arc::downgrade(&transport);
        tokio::spawn(async move {
            let _ = Self::read_loop(socket, stop_token, self_weak).await;
        });

        Ok(transport)
    }

    /// Registers a channel that will receive datagrams from `remote`,
    /// returning the receiving half for the caller to poll.
    pub async fn register_peer(&self, remote: &str) -> mpsc::Receiver<Vec<u8>> {
        let mut connections = self.connections.lock().await;
        let (sender, receiver) = mpsc::channel(32);
        connections.insert(remote.to_owned(), ConnectionInfo { sender });
        receiver
    }

    pub async fn deregister_peer(&self, remote: &str) {
        self.connections.lock().await.remove(remote);
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        stop_token: CancellationToken,
        self_weak: std::sync::Weak<DatagramTransport>,
    ) -> Result<()> {
        loop {
            let mut buf = vec![0u8; 1280];
            let (n, addr) = tokio::select! {
                recv = socket.recv_from(&mut buf) => recv?,
                _ = stop_token.cancelled() => break,
            };
            buf.truncate(n);
            let Some(transport) = self_weak.upgrade() else {
                break;
            };
            let connections = transport.connections.lock().await;
            if let Some(info) = connections.get(&addr.to_string()) {
                let _ = info.sender.send(buf).await;
            } else {
                log::trace!("datagram from unregistered peer {addr}, dropped");
            }
        }
        Ok(())
    }
}

impl Transport for DatagramTransport {
    fn send<'a>(&'a self, bytes: &'a [u8], peer: &'a PeerAddress) -> SendFuture<'a> {
        Box::pin(async move {
            self.socket.send_to(bytes, peer.addr()).await?;
            Ok(())
        })
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        self.stop_token.cancel();
    }
}

/// In-memory transport for tests: an mpsc channel pair standing in for the
/// link between two nodes, with the option to drop or delay frames so the
/// reliability scenarios in spec §8 can be exercised deterministically.
pub struct DuplexTransport {
    outbound: mpsc::Sender<Vec<u8>>,
    kind: TransportKind,
    drop_all: std::sync::atomic::AtomicBool,
}

impl DuplexTransport {
    /// Builds a connected pair: `(a, b)` where bytes sent on `a` arrive on
    /// `b`'s inbound receiver and vice versa.
    pub fn pair(kind: TransportKind) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>, Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx_a, rx_b) = mpsc::channel(64);
        let (tx_b, rx_a) = mpsc::channel(64);
        let a = Arc::new(Self {
            outbound: tx_a,
            kind,
            drop_all: std::sync::atomic::AtomicBool::new(false),
        });
        let b = Arc::new(Self {
            outbound: tx_b,
            kind,
            drop_all: std::sync::atomic::AtomicBool::new(false),
        });
        (a, rx_a, b, rx_b)
    }

    /// Simulates a link that drops every datagram from this point on (spec
    /// §8 scenario E, retransmit exhaustion).
    pub fn drop_everything(&self) {
        self.drop_all.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Transport for DuplexTransport {
    fn send<'a>(&'a self, bytes: &'a [u8], _peer: &'a PeerAddress) -> SendFuture<'a> {
        Box::pin(async move {
            if self.drop_all.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(());
            }
            self.outbound
                .send(bytes.to_vec())
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer receiver dropped"))
        })
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_pair_delivers_in_order() {
        let (a, mut rx_a, b, mut rx_b) = DuplexTransport::pair(TransportKind::Datagram);
        let peer = PeerAddress::datagram("irrelevant");
        a.send(b"one", &peer).await.unwrap();
        a.send(b"two", &peer).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap(), b"one");
        assert_eq!(rx_b.recv().await.unwrap(), b"two");

        b.send(b"reply", &peer).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), b"reply");
    }

    #[tokio::test]
    async fn drop_everything_suppresses_delivery() {
        let (a, _rx_a, _b, mut rx_b) = DuplexTransport::pair(TransportKind::Datagram);
        let peer = PeerAddress::datagram("irrelevant");
        a.drop_everything();
        a.send(b"lost", &peer).await.unwrap();
        assert!(rx_b.try_recv().is_err());
    }
}
