//! Registry of open connections keyed by remote address.
//!
//! At most one connection per key. The map lock is only held to swap
//! entries; evicted connections are closed after it is released.

use crate::error::NetworkError;
use crate::network::connection::Connection;
use crate::network::wire::Frame;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Shared reference to a table entry.
#[derive(Clone)]
pub struct ConnectionHandle {
    addr: Arc<str>,
    inner: Arc<Mutex<Connection>>,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("addr", &self.addr)
            .field("alive", &self.is_open())
            .finish()
    }
}

impl ConnectionHandle {
    fn new(conn: Connection) -> Self {
        Self {
            addr: Arc::from(conn.remote_address()),
            alive: Arc::new(AtomicBool::new(!conn.is_closed())),
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Neither closed locally nor seen EOF from the peer.
    pub fn is_open(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Exclusive access for a sequence of operations.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().await
    }

    pub async fn read(&self) -> Result<Option<Frame>, NetworkError> {
        let mut conn = self.inner.lock().await;
        let result = conn.read().await;
        if conn.remote_closed() {
            self.alive.store(false, Ordering::Release);
        }
        result
    }

    pub async fn write(&self, frame: &Frame) -> Result<usize, NetworkError> {
        self.inner.lock().await.write(frame).await
    }

    pub async fn ensure_preamble(&self) -> Result<(), NetworkError> {
        self.inner.lock().await.ensure_preamble().await
    }

    pub async fn close(&self) -> Result<(), NetworkError> {
        self.alive.store(false, Ordering::Release);
        self.inner.lock().await.close().await
    }
}

pub struct ConnectionTable {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    handled: parking_lot::Mutex<HashSet<String>>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            handled: parking_lot::Mutex::new(HashSet::new()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    pub async fn is_full(&self) -> bool {
        self.len().await >= self.max_connections
    }

    pub async fn is_open(&self, addr: &str) -> bool {
        self.connections
            .lock()
            .await
            .get(addr)
            .is_some_and(|h| h.is_open())
    }

    pub async fn get(&self, addr: &str) -> Option<ConnectionHandle> {
        self.connections.lock().await.get(addr).cloned()
    }

    /// Insert `conn`, closing any connection previously held under the same
    /// address.
    pub async fn add(&self, conn: Connection) -> ConnectionHandle {
        let handle = ConnectionHandle::new(conn);
        let evicted = {
            let mut connections = self.connections.lock().await;
            connections.insert(handle.addr().to_string(), handle.clone())
        };
        self.registered(&handle, evicted).await;
        handle
    }

    /// Like [`add`](Self::add), but the cap is checked under the same lock
    /// as the insert. A full table hands `conn` back untouched; replacing an
    /// existing address never counts against the cap.
    pub async fn add_if_below_cap(&self, conn: Connection) -> Result<ConnectionHandle, Connection> {
        let (handle, evicted) = {
            let mut connections = self.connections.lock().await;
            if connections.len() >= self.max_connections
                && !connections.contains_key(conn.remote_address())
            {
                return Err(conn);
            }
            let handle = ConnectionHandle::new(conn);
            let evicted = connections.insert(handle.addr().to_string(), handle.clone());
            (handle, evicted)
        };
        self.registered(&handle, evicted).await;
        Ok(handle)
    }

    async fn registered(&self, handle: &ConnectionHandle, evicted: Option<ConnectionHandle>) {
        if let Some(old) = evicted {
            debug!("Replacing connection to {}", old.addr());
            release(old).await;
        }
        debug!("Registered connection: {}", handle.addr());
    }

    /// Remove and close the entry for `addr`. No-op when absent.
    pub async fn remove(&self, addr: &str) {
        let removed = self.connections.lock().await.remove(addr);
        if let Some(old) = removed {
            release(old).await;
            debug!("Unregistered connection: {}", addr);
        }
    }

    /// Open connections not currently claimed by a consumer.
    pub async fn unclaimed(&self) -> Vec<ConnectionHandle> {
        let candidates: Vec<ConnectionHandle> = self
            .connections
            .lock()
            .await
            .values()
            .filter(|h| h.is_open())
            .cloned()
            .collect();
        let handled = self.handled.lock();
        candidates
            .into_iter()
            .filter(|h| !handled.contains(h.addr()))
            .collect()
    }

    pub fn is_handled(&self, addr: &str) -> bool {
        self.handled.lock().contains(addr)
    }

    /// Claim `conn` for the duration of `consumer`. The claim is released
    /// when the consumer finishes (or panics, or is cancelled); the
    /// connection is removed unless the consumer asks to keep it open.
    pub async fn handle<F, Fut, T>(&self, conn: ConnectionHandle, consumer: F) -> T
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = (bool, T)>,
    {
        let addr = conn.addr().to_string();
        self.handled.lock().insert(addr.clone());
        let guard = HandledGuard {
            table: self,
            addr: addr.clone(),
        };

        let (keep_open, result) = consumer(conn).await;
        drop(guard);

        if !keep_open {
            self.remove(&addr).await;
        }
        result
    }

    /// Close everything; used at shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<ConnectionHandle> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, h)| h).collect()
        };
        for handle in drained {
            release(handle).await;
        }
    }
}

async fn release(handle: ConnectionHandle) {
    match handle.close().await {
        Ok(()) | Err(NetworkError::AlreadyClosed(_)) => {}
        Err(e) => warn!("Failed to close connection {}: {}", handle.addr(), e),
    }
}

struct HandledGuard<'a> {
    table: &'a ConnectionTable,
    addr: String,
}

impl Drop for HandledGuard<'_> {
    fn drop(&mut self) {
        self.table.handled.lock().remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// A dialed connection registered under `key`, plus the accepted end.
    async fn dialed(key: &str) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            Connection::dialed(key.to_string(), dialed.unwrap()),
            accepted.unwrap().0,
        )
    }

    #[tokio::test]
    async fn test_add_twice_closes_first() {
        let table = ConnectionTable::new(8);
        let (c1, _s1) = dialed("peer:1").await;
        let (c2, _s2) = dialed("peer:1").await;

        let first = table.add(c1).await;
        let second = table.add(c2).await;

        assert_eq!(table.len().await, 1);
        assert!(!first.is_open());
        assert!(first.lock().await.is_closed());
        assert!(second.is_open());
        assert!(table.is_open("peer:1").await);
    }

    #[tokio::test]
    async fn test_add_if_below_cap() {
        let table = ConnectionTable::new(1);
        let (c1, _s1) = dialed("peer:5").await;
        let (c2, _s2) = dialed("peer:6").await;
        let (c3, _s3) = dialed("peer:5").await;

        let first = table.add_if_below_cap(c1).await.unwrap();
        let mut refused = table.add_if_below_cap(c2).await.unwrap_err();
        assert_eq!(refused.remote_address(), "peer:6");
        assert!(!refused.is_closed());
        refused.close().await.unwrap();
        assert_eq!(table.len().await, 1);

        // Same address replaces rather than grows
        let replacement = table.add_if_below_cap(c3).await.unwrap();
        assert!(!first.is_open());
        assert!(replacement.is_open());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_twice_is_safe() {
        let table = ConnectionTable::new(8);
        let (c, _s) = dialed("peer:2").await;
        let handle = table.add(c).await;

        table.remove("peer:2").await;
        table.remove("peer:2").await;
        table.remove("never-added").await;

        assert!(table.is_empty().await);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_handle_claims_and_releases() {
        let table = ConnectionTable::new(8);
        let (c, _s) = dialed("peer:3").await;
        let handle = table.add(c).await;

        let t = &table;
        let seen_claimed = table
            .handle(handle.clone(), |conn| async move {
                let claimed = t.is_handled(conn.addr()) && t.unclaimed().await.is_empty();
                (true, claimed)
            })
            .await;
        assert!(seen_claimed);
        assert!(!table.is_handled("peer:3"));
        assert_eq!(table.unclaimed().await.len(), 1);

        // Not kept open: removed and closed
        table.handle(handle.clone(), |_| async { (false, ()) }).await;
        assert!(table.is_empty().await);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_handle_marker_cleared_on_cancel() {
        let table = ConnectionTable::new(8);
        let (c, _s) = dialed("peer:4").await;
        let handle = table.add(c).await;

        let pending = table.handle(handle, |_| std::future::pending::<(bool, ())>());
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), pending).await;

        assert!(!table.is_handled("peer:4"));
        assert_eq!(table.len().await, 1);
    }
}
