//! Known remote nodes and when we last reached them.
//!
//! Persisted as `peers.csv`, one `address,port,"HH:MM:SS MM/DD/YYYY"` row per
//! peer in local time, most recently seen first.

use crate::error::PeerDirectoryError;
use crate::types::unix_now;
use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%H:%M:%S %m/%d/%Y";

/// A remote node. Identity is `(address, port)`; `last_seen` is ignored by
/// equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub address: String,
    pub port: u16,
    pub last_seen: u64,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl Peer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            last_seen: 0,
        }
    }

    /// Parse `host:port`.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.trim().rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self::new(host, port))
    }

    /// `address:port`, the key used for the connection table.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Vec<Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn find(&self, peer: &Peer) -> Option<usize> {
        self.peers.iter().position(|p| p == peer)
    }

    pub fn remove(&mut self, index: usize) -> Option<Peer> {
        (index < self.peers.len()).then(|| self.peers.remove(index))
    }

    /// Overwrite the entry with the same identity in place, or append.
    pub fn merge(&mut self, peer: Peer) {
        match self.find(&peer) {
            Some(i) => self.peers[i] = peer,
            None => self.peers.push(peer),
        }
    }

    pub fn merge_all(&mut self, peers: impl IntoIterator<Item = Peer>) {
        for peer in peers {
            self.merge(peer);
        }
    }

    /// Record a successful contact with `peer` now.
    pub fn touch(&mut self, peer: &Peer) {
        let mut seen = peer.clone();
        seen.last_seen = unix_now();
        self.merge(seen);
    }

    /// Load from `path`. A missing file is an empty directory; malformed rows
    /// are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PeerDirectoryError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut directory = Self::new();
        for (line, record) in reader.records().enumerate() {
            let parsed = record
                .map_err(PeerDirectoryError::from)
                .and_then(|r| parse_row(&r));
            match parsed {
                Ok(peer) => directory.merge(peer),
                Err(e) => warn!("Skipping peers.csv row {}: {}", line + 1, e),
            }
        }
        info!("Loaded {} peer(s) from {}", directory.len(), path.display());
        Ok(directory)
    }

    /// Write to `path`, most recently seen first.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PeerDirectoryError> {
        let mut sorted = self.peers.clone();
        sorted.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .quote_style(csv::QuoteStyle::Never)
            .from_path(path.as_ref())?;
        for peer in &sorted {
            let port = peer.port.to_string();
            let seen = format!("\"{}\"", format_timestamp(peer.last_seen)?);
            writer.write_record([peer.address.as_str(), port.as_str(), seen.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn parse_row(record: &csv::StringRecord) -> Result<Peer, PeerDirectoryError> {
    let field = |i: usize| {
        record
            .get(i)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PeerDirectoryError::Malformed(format!("missing column {}", i + 1)))
    };
    let address = field(0)?;
    let port = field(1)?
        .parse::<u16>()
        .map_err(|e| PeerDirectoryError::Malformed(format!("bad port: {}", e)))?;
    let last_seen = parse_timestamp(field(2)?)?;
    Ok(Peer {
        address: address.to_string(),
        port,
        last_seen,
    })
}

fn format_timestamp(secs: u64) -> Result<String, PeerDirectoryError> {
    let secs = i64::try_from(secs).map_err(|_| PeerDirectoryError::Timestamp(secs.to_string()))?;
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .ok_or_else(|| PeerDirectoryError::Timestamp(secs.to_string()))
}

fn parse_timestamp(s: &str) -> Result<u64, PeerDirectoryError> {
    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|_| PeerDirectoryError::Timestamp(s.to_string()))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| PeerDirectoryError::Timestamp(s.to_string()))?;
    u64::try_from(local.timestamp()).map_err(|_| PeerDirectoryError::Timestamp(s.to_string()))
}
