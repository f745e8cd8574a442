//! Sync driver: pulls connections from the peer stream and exchanges chain
//! and directory data with each one.
//!
//! Every round takes a few connections, claims each with
//! [`Node::handle`] so no other consumer reads from it concurrently, asks
//! for blocks past our head plus the peer's directory, and then serves
//! whatever the peer sends until it goes quiet.

use crate::error::NetworkError;
use crate::network::connection_table::ConnectionHandle;
use crate::network::message::Message;
use crate::network::wire::Frame;
use crate::node::Node;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connections pulled from the stream per round
const MAX_CONCURRENT_SYNCS: usize = 3;

/// Pause between rounds
const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive empty reads before a session ends
const MAX_IDLE_READS: usize = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub messages: usize,
    pub remote_closed: bool,
}

pub struct SyncCoordinator {
    node: Arc<Node>,
}

impl SyncCoordinator {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Run rounds until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Sync driver started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                served = self.round() => {
                    if served > 0 {
                        debug!("Sync round served {} connection(s)", served);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(SYNC_INTERVAL) => {}
            }
        }
        info!("Sync driver stopped");
    }

    /// One pass over up to [`MAX_CONCURRENT_SYNCS`] connections, served
    /// concurrently. Returns how many were served.
    pub async fn round(&self) -> usize {
        let pulled: Vec<ConnectionHandle> = self
            .node
            .peer_stream()
            .take(MAX_CONCURRENT_SYNCS)
            .collect()
            .await;

        // A single reachable peer is returned on every draw
        let mut seen = HashSet::new();
        let batch: Vec<ConnectionHandle> = pulled
            .into_iter()
            .filter(|conn| !self.node.table().is_handled(conn.addr()))
            .filter(|conn| seen.insert(conn.addr().to_string()))
            .collect();

        let mut sessions = Vec::with_capacity(batch.len());
        for conn in batch {
            let node = Arc::clone(&self.node);
            sessions.push(tokio::spawn(async move {
                let worker = Arc::clone(&node);
                node.handle(conn, |conn| async move {
                    let stats = sync_session(&worker, &conn).await;
                    (!stats.remote_closed, stats)
                })
                .await
            }));
        }

        let mut served = 0;
        for session in sessions {
            match session.await {
                Ok(stats) => {
                    served += 1;
                    debug!("Sync session handled {} message(s)", stats.messages);
                }
                Err(e) => warn!("Sync session failed: {}", e),
            }
        }
        served
    }
}

/// Request blocks and peers over `conn`, then answer incoming messages
/// until the peer is idle for [`MAX_IDLE_READS`] reads or hangs up.
pub async fn sync_session(node: &Node, conn: &ConnectionHandle) -> SessionStats {
    let mut stats = SessionStats::default();

    let head = node.chain_snapshot().await.hash();
    let requests = [
        Frame::data(Message::get_blocks(Some(head))),
        Frame::data(Message::peer_directory_request()),
    ];
    if let Err(e) = conn.ensure_preamble().await {
        debug!("Preamble to {} failed: {}", conn.addr(), e);
        stats.remote_closed = true;
        return stats;
    }
    for frame in &requests {
        if let Err(e) = conn.write(frame).await {
            debug!("Sync request to {} failed: {}", conn.addr(), e);
            stats.remote_closed = true;
            return stats;
        }
    }

    let mut idle = 0;
    while idle < MAX_IDLE_READS {
        match conn.read().await {
            Ok(Some(frame)) => {
                idle = 0;
                stats.messages += 1;
                if let Err(e) = node.process_message(conn, frame.message).await {
                    warn!("Failed to process message from {}: {}", conn.addr(), e);
                }
            }
            Ok(None) if !conn.is_open() => {
                stats.remote_closed = true;
                break;
            }
            Ok(None) => idle += 1,
            // Undecodable frame is dropped, the connection stays usable
            Err(e @ (NetworkError::Decode(_) | NetworkError::FrameTooLarge(_))) => {
                debug!("Dropped frame from {}: {}", conn.addr(), e);
                idle += 1;
            }
            Err(e) => {
                warn!("Read from {} failed: {}", conn.addr(), e);
                stats.remote_closed = true;
                break;
            }
        }
    }
    stats
}
