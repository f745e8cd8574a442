pub mod client;
pub mod connection;
pub mod connection_table;
pub mod message;
pub mod peer_stream;
pub mod server;
pub mod sync_coordinator;
pub mod wire;

pub use client::NetworkClient;
pub use connection::Connection;
pub use connection_table::{ConnectionHandle, ConnectionTable};
pub use message::Message;
pub use server::NetworkServer;
pub use sync_coordinator::SyncCoordinator;
pub use wire::{Frame, FrameKind};
