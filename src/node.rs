//! A running peer: chain, connections and directory wired together.

use crate::block::pow;
use crate::block::types::Block;
use crate::chain::{BlockStore, Chain, ChainError, ChainResult};
use crate::config::Config;
use crate::consensus::{ChainManager, ContentValidator, SubmitOutcome};
use crate::error::AppError;
use crate::network::client::NetworkClient;
use crate::network::connection_table::{ConnectionHandle, ConnectionTable};
use crate::network::message::{GetRequest, ManageType, Message, Method};
use crate::network::peer_stream::peer_stream;
use crate::network::server::NetworkServer;
use crate::network::wire::Frame;
use crate::peer_directory::{Peer, PeerDirectory};
use crate::types::unix_now;
use futures_util::Stream;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PEERS_FILE: &str = "peers.csv";
pub const CHAIN_DB_DIR: &str = "chain.db";
/// Blocks returned for one GET BLOCKS
pub const MAX_BLOCKS_PER_POST: usize = 500;

pub struct Node {
    name: String,
    data_dir: PathBuf,
    store: Arc<BlockStore>,
    manager: Mutex<ChainManager>,
    table: Arc<ConnectionTable>,
    directory: Arc<RwLock<PeerDirectory>>,
    client: Arc<NetworkClient>,
    /// Taken by [`Node::run`]
    server: parking_lot::Mutex<Option<NetworkServer>>,
    local_addr: SocketAddr,
}

impl Node {
    /// Open the data directory and bind the listener. Nothing is accepted
    /// until [`Node::run`].
    pub async fn new(
        config: &Config,
        validator: Arc<dyn ContentValidator>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let data_dir = config.storage.data_path();
        std::fs::create_dir_all(&data_dir)?;

        let params = Arc::new(config.consensus.chain_params());
        let store = Arc::new(BlockStore::open(data_dir.join(CHAIN_DB_DIR))?);
        let chain = Chain::open(Arc::clone(&store), params, validator)?;

        let mut directory = PeerDirectory::load(data_dir.join(PEERS_FILE))?;
        for entry in &config.network.bootstrap_peers {
            match Peer::parse(entry) {
                Some(peer) if directory.find(&peer).is_none() => directory.merge(peer),
                Some(_) => {}
                None => warn!("Ignoring malformed bootstrap peer {:?}", entry),
            }
        }
        let directory = Arc::new(RwLock::new(directory));

        let table = Arc::new(ConnectionTable::new(config.network.max_connections));
        let client = Arc::new(NetworkClient::new(
            Arc::clone(&table),
            Arc::clone(&directory),
        ));

        let server =
            NetworkServer::bind(&config.network.full_listen_address(), Arc::clone(&table)).await?;
        let local_addr = server.local_addr()?;

        info!(
            "Node {} ready: height {}, listening on {}",
            config.node.name,
            chain.height(),
            local_addr
        );

        Ok(Self {
            name: config.node.name.clone(),
            data_dir,
            store,
            manager: Mutex::new(ChainManager::new(chain)),
            table,
            directory,
            client,
            server: parking_lot::Mutex::new(Some(server)),
            local_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    pub fn directory(&self) -> &Arc<RwLock<PeerDirectory>> {
        &self.directory
    }

    /// Accept peers until `shutdown` fires, then close connections and
    /// flush state to disk.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AppError> {
        let Some(server) = self.server.lock().take() else {
            warn!("Node {} is already running", self.name);
            return Ok(());
        };

        server.run(shutdown).await;

        self.table.close_all().await;
        if let Err(e) = self.save_peers().await {
            error!("Failed to save peer directory: {}", e);
        }
        self.store.flush().await?;
        info!("Node {} stopped", self.name);
        Ok(())
    }

    /// Send `frames`, in order, to every known peer without waiting.
    pub async fn broadcast(&self, frames: Vec<Frame>) -> usize {
        self.client.broadcast(frames).await
    }

    pub fn peer_stream(&self) -> impl Stream<Item = ConnectionHandle> + Send {
        peer_stream(Arc::clone(&self.table), Arc::clone(&self.client))
    }

    /// Run `consumer` with `conn` claimed; see [`ConnectionTable::handle`].
    pub async fn handle<F, Fut, T>(&self, conn: ConnectionHandle, consumer: F) -> T
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = (bool, T)>,
    {
        self.table.handle(conn, consumer).await
    }

    pub async fn save_peers(&self) -> Result<(), AppError> {
        let path = self.data_dir.join(PEERS_FILE);
        self.directory.read().await.save(&path)?;
        debug!("Saved peer directory to {}", path.display());
        Ok(())
    }

    /// Clone of the adopted chain.
    pub async fn chain_snapshot(&self) -> Chain {
        self.manager.lock().await.chain().clone()
    }

    pub async fn submit_block(&self, block: Block) -> ChainResult<SubmitOutcome> {
        self.manager.lock().await.submit(block)
    }

    /// Answer `msg` from `conn`, writing the reply (if any) back to it.
    pub async fn process_message(
        &self,
        conn: &ConnectionHandle,
        msg: Message,
    ) -> Result<(), AppError> {
        debug!("{} from {}", msg.label(), conn.addr());
        if let Some(reply) = self.respond(msg).await? {
            conn.write(&Frame::data(reply)).await?;
        }
        Ok(())
    }

    /// Reply for one inbound message. Rejected blocks are logged and
    /// skipped; only storage failures are errors.
    pub async fn respond(&self, msg: Message) -> Result<Option<Message>, AppError> {
        match msg.method {
            Method::Get => {
                let Some(get) = msg.get else {
                    return Ok(None);
                };
                match get.request {
                    GetRequest::Blocks => {
                        let manager = self.manager.lock().await;
                        let blocks = manager
                            .chain()
                            .blocks_after(get.startblock.as_ref(), MAX_BLOCKS_PER_POST)?;
                        Ok(Some(Message::post(vec![], blocks)))
                    }
                    GetRequest::Peer => Ok(Some(self.directory_push().await)),
                    GetRequest::Mempool => Ok(Some(Message::post(vec![], vec![]))),
                }
            }
            Method::Post => {
                let Some(post) = msg.post else {
                    return Ok(None);
                };
                if !post.transactions.is_empty() {
                    debug!("Ignoring {} relayed transaction(s)", post.transactions.len());
                }
                self.accept_blocks(post.blocks).await
            }
            Method::Manage => {
                let Some(manage) = msg.manage else {
                    return Ok(None);
                };
                match manage.kind {
                    ManageType::Ping => Ok(Some(Message::pong())),
                    ManageType::Pong | ManageType::DataPush => Ok(None),
                    ManageType::PeerDirectoryRequest => Ok(Some(self.directory_push().await)),
                    ManageType::PeerDirectoryPush => {
                        let peers: Vec<Peer> =
                            manage.peers.iter().filter_map(|p| p.to_peer()).collect();
                        let mut directory = self.directory.write().await;
                        for peer in peers {
                            // Keep our own contact time if it is newer
                            match directory.find(&peer) {
                                Some(i) if directory.peers()[i].last_seen >= peer.last_seen => {}
                                _ => directory.merge(peer),
                            }
                        }
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn directory_push(&self) -> Message {
        let directory = self.directory.read().await;
        Message::peer_directory_push(directory.peers())
    }

    /// Submit blocks oldest first. An orphan means we are missing history,
    /// so ask the sender for everything past our head.
    async fn accept_blocks(&self, blocks: Vec<Block>) -> Result<Option<Message>, AppError> {
        let mut manager = self.manager.lock().await;
        let mut missing_history = false;

        for block in blocks {
            let hash = hex::encode(block.hash());
            match manager.submit(block) {
                Ok(SubmitOutcome::Extended { height }) => {
                    info!("Adopted block {} at height {}", hash, height)
                }
                Ok(SubmitOutcome::Reorganized {
                    reverted,
                    applied,
                    height,
                }) => info!(
                    "Reorganized: reverted {}, applied {}, new height {}",
                    reverted, applied, height
                ),
                Ok(SubmitOutcome::ForkTracked { height }) => {
                    debug!("Block {} extends a fork at height {}", hash, height)
                }
                Ok(SubmitOutcome::Known) => {}
                Ok(SubmitOutcome::Orphan { .. }) => missing_history = true,
                Err(e) if e.is_recoverable() => warn!("Rejected block {}: {}", hash, e),
                Err(e) => {
                    error!("Failed to store block {}: {}", hash, e);
                    return Err(e.into());
                }
            }
        }

        Ok(missing_history.then(|| Message::get_blocks(Some(manager.chain().hash()))))
    }

    /// Build a block on the adopted head and search for a nonce. `None`
    /// when `max_tries` nonces were not enough.
    pub async fn mine_block(&self, max_tries: u64) -> Result<Option<SubmitOutcome>, AppError> {
        let template = {
            let manager = self.manager.lock().await;
            let chain = manager.chain();
            let timestamp = unix_now().max(chain.head().header.timestamp + 1);
            Block::new(chain.hash(), chain.expected_bits()?, timestamp, vec![])
        };

        let solved = tokio::task::spawn_blocking(move || {
            let mut block = template;
            pow::solve(&mut block, max_tries).then_some(block)
        })
        .await?;
        let Some(block) = solved else {
            return Ok(None);
        };

        let outcome = match self.submit_block(block.clone()).await {
            Ok(outcome) => outcome,
            // Head moved while we were solving
            Err(ChainError::Rejected(r)) => {
                debug!("Mined block went stale: {}", r);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if let SubmitOutcome::Extended { height } = outcome {
            info!("Mined block {} at height {}", hex::encode(block.hash()), height);
            let post = Message::post(vec![], vec![block]);
            self.broadcast(vec![Frame::preamble(), Frame::data(post)])
                .await;
        }
        Ok(Some(outcome))
    }
}
