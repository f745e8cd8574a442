//! Inbound side: accept loop, connection cap and preamble classification.

use crate::error::NetworkError;
use crate::network::connection::Connection;
use crate::network::connection_table::ConnectionTable;
use crate::network::wire::{Frame, FrameKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on receiving the first frame of an inbound connection
pub const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct NetworkServer {
    listener: TcpListener,
    table: Arc<ConnectionTable>,
}

impl NetworkServer {
    pub async fn bind(bind_addr: &str, table: Arc<ConnectionTable>) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener, table })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires. Each socket is classified on its own
    /// task so a slow handshake never blocks the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Listening for peers on {}", addr),
            Err(e) => error!("Listener has no local address: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("Accept failed: {}", e);
                    continue;
                }
            };

            let table = Arc::clone(&self.table);
            tokio::spawn(async move {
                if let Err(e) = dispatch(stream, table).await {
                    if e.is_routine() {
                        debug!("Inbound {} dropped: {}", addr, e);
                    } else {
                        error!("Inbound {} rejected: {}", addr, e);
                    }
                }
            });
        }
        info!("Accept loop stopped");
    }
}

/// Admit `stream` into the table if there is room and its first frame is a
/// DATA preamble.
pub async fn dispatch(stream: TcpStream, table: Arc<ConnectionTable>) -> Result<(), NetworkError> {
    if table.is_full().await {
        // Dropping the stream closes the socket without a handshake
        drop(stream);
        return Err(NetworkError::CapacityExceeded(table.max_connections()));
    }

    let mut conn = Connection::accepted(stream)?;
    let preamble = match tokio::time::timeout(PREAMBLE_TIMEOUT, read_first_frame(&mut conn)).await {
        Ok(result) => result,
        Err(_) => Ok(None),
    };

    match preamble {
        Ok(Some(frame)) if frame.kind == FrameKind::Data => {
            let label = frame.message.label();
            match table.add_if_below_cap(conn).await {
                Ok(handle) => {
                    debug!("Admitted {} ({})", handle.addr(), label);
                    Ok(())
                }
                // Filled up while this socket was handshaking
                Err(conn) => {
                    discard(conn).await;
                    Err(NetworkError::CapacityExceeded(table.max_connections()))
                }
            }
        }
        Ok(Some(_)) => {
            let addr = conn.remote_address().to_string();
            discard(conn).await;
            Err(NetworkError::UnsupportedPreamble(addr))
        }
        Ok(None) => {
            discard(conn).await;
            Err(NetworkError::Timeout("waiting for preamble"))
        }
        Err(e) => {
            discard(conn).await;
            Err(e)
        }
    }
}

async fn discard(mut conn: Connection) {
    match conn.close().await {
        Ok(()) | Err(NetworkError::AlreadyClosed(_)) => {}
        Err(e) => warn!("Failed to close inbound {}: {}", conn.remote_address(), e),
    }
}

async fn read_first_frame(conn: &mut Connection) -> Result<Option<Frame>, NetworkError> {
    loop {
        if let Some(frame) = conn.read().await? {
            return Ok(Some(frame));
        }
        if conn.remote_closed() {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Message;
    use crate::network::wire::serialize_frame;
    use tokio::io::AsyncWriteExt;

    async fn serve(max: usize) -> (SocketAddr, Arc<ConnectionTable>, CancellationToken) {
        let table = Arc::new(ConnectionTable::new(max));
        let server = NetworkServer::bind("127.0.0.1:0", Arc::clone(&table))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));
        (addr, table, token)
    }

    async fn wait_for_len(table: &ConnectionTable, n: usize) -> bool {
        for _ in 0..50 {
            if table.len().await == n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_data_preamble_admitted() {
        let (addr, table, token) = serve(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = serialize_frame(&Frame::preamble()).unwrap();
        stream.write_all(&bytes).await.unwrap();

        assert!(wait_for_len(&table, 1).await);
        token.cancel();
    }

    #[tokio::test]
    async fn test_peer_preamble_rejected() {
        let (addr, table, token) = serve(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = serialize_frame(&Frame::peer(Message::data_push())).unwrap();
        stream.write_all(&bytes).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(table.len().await, 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_cap_drops_new_sockets() {
        let (addr, table, token) = serve(1).await;
        let bytes = serialize_frame(&Frame::preamble()).unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&bytes).await.unwrap();
        assert!(wait_for_len(&table, 1).await);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let _ = second.write_all(&bytes).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(table.len().await, 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_cap_holds_under_concurrent_handshakes() {
        let table = Arc::new(ConnectionTable::new(1));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bytes = serialize_frame(&Frame::preamble()).unwrap();

        // Four handshakes race for a single slot
        let mut clients = Vec::new();
        let mut dispatches = Vec::new();
        for _ in 0..4 {
            let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
            clients.push(client.unwrap());
            dispatches.push(dispatch(accepted.unwrap().0, Arc::clone(&table)));
        }
        for client in &mut clients {
            client.write_all(&bytes).await.unwrap();
        }

        let results = futures_util::future::join_all(dispatches).await;
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, NetworkError::CapacityExceeded(1))));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_silent_socket_closed() {
        let table = Arc::new(ConnectionTable::new(4));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let result = dispatch(accepted.unwrap().0, Arc::clone(&table)).await;
        assert!(matches!(result, Err(NetworkError::Timeout(_))));
        assert!(table.is_empty().await);
    }
}
