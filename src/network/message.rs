//! Protocol envelope exchanged between nodes.
//!
//! Every message carries a method and at most one body matching it. The
//! frame kind (DATA or PEER) travels outside the envelope, see
//! [`crate::network::wire`].

use crate::block::types::Block;
use crate::peer_directory::Peer;
use crate::types::{Hash256, Transaction};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Manage,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetRequest {
    Peer,
    Mempool,
    Blocks,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Get {
    pub request: GetRequest,
    pub startblock: Option<Hash256>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Post {
    pub transactions: Vec<Transaction>,
    pub blocks: Vec<Block>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageType {
    Ping,
    Pong,
    PeerDirectoryRequest,
    PeerDirectoryPush,
    DataPush,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manage {
    pub kind: ManageType,
    pub peers: Vec<PeerRecord>,
}

/// Peer as announced on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: String,
    pub port: u32,
    pub last_seen: u64,
}

impl From<&Peer> for PeerRecord {
    fn from(peer: &Peer) -> Self {
        Self {
            address: peer.address.clone(),
            port: peer.port as u32,
            last_seen: peer.last_seen,
        }
    }
}

impl PeerRecord {
    /// `None` when the announced port does not fit a TCP port.
    pub fn to_peer(&self) -> Option<Peer> {
        let port = u16::try_from(self.port).ok()?;
        if self.address.is_empty() || port == 0 {
            return None;
        }
        Some(Peer {
            address: self.address.clone(),
            port,
            last_seen: self.last_seen,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: Method,
    pub get: Option<Get>,
    pub post: Option<Post>,
    pub manage: Option<Manage>,
}

impl Message {
    fn get(request: GetRequest, startblock: Option<Hash256>) -> Self {
        Self {
            method: Method::Get,
            get: Some(Get {
                request,
                startblock,
            }),
            post: None,
            manage: None,
        }
    }

    fn manage(kind: ManageType, peers: Vec<PeerRecord>) -> Self {
        Self {
            method: Method::Manage,
            get: None,
            post: None,
            manage: Some(Manage { kind, peers }),
        }
    }

    pub fn get_blocks(startblock: Option<Hash256>) -> Self {
        Self::get(GetRequest::Blocks, startblock)
    }

    pub fn get_peers() -> Self {
        Self::get(GetRequest::Peer, None)
    }

    pub fn get_mempool() -> Self {
        Self::get(GetRequest::Mempool, None)
    }

    pub fn post(transactions: Vec<Transaction>, blocks: Vec<Block>) -> Self {
        Self {
            method: Method::Post,
            get: None,
            post: Some(Post {
                transactions,
                blocks,
            }),
            manage: None,
        }
    }

    pub fn ping() -> Self {
        Self::manage(ManageType::Ping, vec![])
    }

    pub fn pong() -> Self {
        Self::manage(ManageType::Pong, vec![])
    }

    /// First message on a dialed connection; marks it as a data channel.
    pub fn data_push() -> Self {
        Self::manage(ManageType::DataPush, vec![])
    }

    pub fn peer_directory_request() -> Self {
        Self::manage(ManageType::PeerDirectoryRequest, vec![])
    }

    pub fn peer_directory_push<'a>(peers: impl IntoIterator<Item = &'a Peer>) -> Self {
        Self::manage(
            ManageType::PeerDirectoryPush,
            peers.into_iter().map(PeerRecord::from).collect(),
        )
    }

    pub fn manage_type(&self) -> Option<ManageType> {
        match (self.method, &self.manage) {
            (Method::Manage, Some(m)) => Some(m.kind),
            _ => None,
        }
    }

    pub fn is_data_push(&self) -> bool {
        self.manage_type() == Some(ManageType::DataPush)
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match (self.method, &self.get, &self.manage) {
            (Method::Get, Some(g), _) => match g.request {
                GetRequest::Peer => "GET PEER",
                GetRequest::Mempool => "GET MEMPOOL",
                GetRequest::Blocks => "GET BLOCKS",
            },
            (Method::Post, _, _) => "POST",
            (Method::Manage, _, Some(m)) => match m.kind {
                ManageType::Ping => "PING",
                ManageType::Pong => "PONG",
                ManageType::PeerDirectoryRequest => "PEER_DIRECTORY_REQUEST",
                ManageType::PeerDirectoryPush => "PEER_DIRECTORY_PUSH",
                ManageType::DataPush => "DATA_PUSH",
            },
            _ => "MALFORMED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_fill_one_body() {
        let m = Message::get_blocks(Some([1u8; 32]));
        assert_eq!(m.method, Method::Get);
        assert!(m.post.is_none() && m.manage.is_none());
        assert_eq!(m.label(), "GET BLOCKS");

        assert!(Message::data_push().is_data_push());
        assert!(!Message::ping().is_data_push());
        assert_eq!(Message::post(vec![], vec![]).label(), "POST");
    }

    #[test]
    fn test_peer_record_port_range() {
        let record = PeerRecord {
            address: "10.0.0.1".into(),
            port: 70_000,
            last_seen: 0,
        };
        assert!(record.to_peer().is_none());

        let peer = Peer::new("10.0.0.1", 8333);
        let back = PeerRecord::from(&peer).to_peer().unwrap();
        assert_eq!(back, peer);
    }
}
