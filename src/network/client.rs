//! Outbound side: dial-or-reuse, random peer selection and broadcast.

use crate::error::NetworkError;
use crate::network::connection::Connection;
use crate::network::connection_table::{ConnectionHandle, ConnectionTable};
use crate::network::wire::Frame;
use crate::peer_directory::{Peer, PeerDirectory};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Bound on establishing a TCP connection
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

pub struct NetworkClient {
    table: Arc<ConnectionTable>,
    directory: Arc<RwLock<PeerDirectory>>,
    /// Serializes concurrent dials to one address
    dial_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NetworkClient {
    pub fn new(table: Arc<ConnectionTable>, directory: Arc<RwLock<PeerDirectory>>) -> Self {
        Self {
            table,
            directory,
            dial_locks: DashMap::new(),
        }
    }

    /// Open connection to `peer`, reusing the table entry when one is open.
    /// `None` means the peer is unreachable right now.
    pub async fn connect(&self, peer: &Peer) -> Option<ConnectionHandle> {
        let addr = peer.endpoint();
        if let Some(handle) = self.open_entry(&addr).await {
            return Some(handle);
        }

        let lock = self.dial_locks.entry(addr.clone()).or_default().clone();
        let _dialing = lock.lock().await;

        // Someone else may have finished dialing while we waited
        if let Some(handle) = self.open_entry(&addr).await {
            return Some(handle);
        }

        let stream = match dial(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("{}", e);
                return None;
            }
        };

        configure_socket(&stream, &addr);

        self.directory.write().await.touch(peer);
        info!("Connected to peer: {}", addr);
        Some(self.table.add(Connection::dialed(addr, stream)).await)
    }

    async fn open_entry(&self, addr: &str) -> Option<ConnectionHandle> {
        self.table.get(addr).await.filter(|h| h.is_open())
    }

    /// Draw peers uniformly at random until one connects. Failed peers are
    /// only dropped from this draw, never from the directory.
    pub async fn connect_to_a_peer(&self) -> Option<ConnectionHandle> {
        let mut candidates: Vec<Peer> = self.directory.read().await.peers().to_vec();

        while !candidates.is_empty() {
            let idx = rand::thread_rng().gen_range(0..candidates.len());
            let peer = candidates.swap_remove(idx);
            if let Some(handle) = self.connect(&peer).await {
                return Some(handle);
            }
        }
        None
    }

    /// Deliver `frames`, in order, to every directory peer. Each peer gets
    /// its own task; returns how many peers were targeted without waiting
    /// for delivery.
    pub async fn broadcast(self: &Arc<Self>, frames: Vec<Frame>) -> usize {
        let peers: Vec<Peer> = self.directory.read().await.peers().to_vec();
        let frames = Arc::new(frames);
        let targeted = peers.len();
        for peer in peers {
            let client = Arc::clone(self);
            let frames = Arc::clone(&frames);
            tokio::spawn(async move {
                let Some(conn) = client.connect(&peer).await else {
                    debug!("Broadcast skipped unreachable peer {}", peer.endpoint());
                    return;
                };
                for frame in frames.iter() {
                    if let Err(e) = conn.write(frame).await {
                        warn!("Broadcast to {} failed: {}", conn.addr(), e);
                        client.table.remove(conn.addr()).await;
                        return;
                    }
                }
            });
        }
        targeted
    }
}

async fn dial(addr: &str) -> Result<TcpStream, NetworkError> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(NetworkError::ConnectFailure {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(NetworkError::Timeout("dialing peer")),
    }
}

/// Disable Nagle and enable keepalive on a dialed socket.
fn configure_socket(stream: &TcpStream, addr: &str) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(30))
        .with_interval(std::time::Duration::from_secs(10));

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP_KEEPALIVE: {}", e);
    } else {
        debug!("TCP keepalive enabled for {}", addr);
    }
}
