//! Lazy, pull-based sequence of usable connections.
//!
//! Open connections nobody is consuming come first, then freshly drawn
//! directory peers. The stream ends the first time a full draw over the
//! directory fails; build a new one to sample again.

use crate::network::client::NetworkClient;
use crate::network::connection_table::{ConnectionHandle, ConnectionTable};
use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;

enum Phase {
    /// Nothing pulled yet
    Start,
    /// Draining the unclaimed snapshot
    Backlog(VecDeque<ConnectionHandle>),
    /// Drawing random directory peers
    Dialing,
}

struct State {
    table: Arc<ConnectionTable>,
    client: Arc<NetworkClient>,
    phase: Phase,
}

pub fn peer_stream(
    table: Arc<ConnectionTable>,
    client: Arc<NetworkClient>,
) -> impl Stream<Item = ConnectionHandle> + Send {
    let state = State {
        table,
        client,
        phase: Phase::Start,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            match &mut state.phase {
                Phase::Start => {
                    let backlog = state.table.unclaimed().await;
                    state.phase = Phase::Backlog(backlog.into());
                }
                Phase::Backlog(queue) => match queue.pop_front() {
                    // Claimed or closed since the snapshot was taken
                    Some(conn) if !conn.is_open() || state.table.is_handled(conn.addr()) => {}
                    Some(conn) => return Some((conn, state)),
                    None => state.phase = Phase::Dialing,
                },
                Phase::Dialing => {
                    let conn = state.client.connect_to_a_peer().await?;
                    return Some((conn, state));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::Connection;
    use crate::peer_directory::{Peer, PeerDirectory};
    use futures_util::StreamExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::RwLock;

    fn setup(peers: Vec<Peer>) -> (Arc<ConnectionTable>, Arc<NetworkClient>) {
        let table = Arc::new(ConnectionTable::new(16));
        let mut dir = PeerDirectory::new();
        dir.merge_all(peers);
        let client = Arc::new(NetworkClient::new(
            Arc::clone(&table),
            Arc::new(RwLock::new(dir)),
        ));
        (table, client)
    }

    #[tokio::test]
    async fn test_empty_directory_yields_nothing() {
        let (table, client) = setup(vec![]);
        let items: Vec<_> = peer_stream(table, client).collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_backlog_before_dialing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (table, client) = setup(vec![Peer::new("127.0.0.1", addr.port())]);

        let (dialed, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        table
            .add(Connection::dialed("backlog:1".to_string(), dialed.unwrap()))
            .await;

        let mut stream = Box::pin(peer_stream(Arc::clone(&table), client));
        let first = stream.next().await.unwrap();
        assert_eq!(first.addr(), "backlog:1");

        let second = stream.next().await.unwrap();
        assert_eq!(second.addr(), format!("127.0.0.1:{}", addr.port()));
    }

    #[tokio::test]
    async fn test_handled_connections_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (table, client) = setup(vec![]);

        let (dialed, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let handle = table
            .add(Connection::dialed("busy:1".to_string(), dialed.unwrap()))
            .await;

        let t = Arc::clone(&table);
        let c = Arc::clone(&client);
        let pulled = table
            .handle(handle, |_| async move {
                let items: Vec<_> = peer_stream(t, c).collect().await;
                (true, items.len())
            })
            .await;
        assert_eq!(pulled, 0);
    }
}
