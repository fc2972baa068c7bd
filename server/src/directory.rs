//! Directory service listing running game servers
//!
//! Game servers connect, send one `DirectoryRegister` and hang up. Players
//! connect, send `DirectoryQuery` and receive a `DirectoryUpdate` before the
//! service closes the connection. Listings that are not refreshed expire.

use log::{debug, info, warn};
use shared::transport::{read_frame, write_frame};
use shared::{ClientPacket, ServerEntry, ServerPacket};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;

/// Listings not refreshed within this window are dropped
pub const ENTRY_TTL: Duration = Duration::from_secs(30);

/// How long a directory connection may take to send its one request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Listing {
    entry: ServerEntry,
    refreshed: Instant,
}

/// Registered game servers keyed by host and port
#[derive(Debug, Default)]
pub struct Directory {
    listings: HashMap<(IpAddr, u16), Listing>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records or refreshes a listing
    pub fn register(&mut self, host: IpAddr, port: u16, name: String, players: u8, now: Instant) {
        let entry = ServerEntry {
            host: host.to_string(),
            port,
            name,
            players,
        };
        self.listings.insert(
            (host, port),
            Listing {
                entry,
                refreshed: now,
            },
        );
    }

    /// Drops listings older than [`ENTRY_TTL`]
    pub fn prune(&mut self, now: Instant) {
        self.listings
            .retain(|_, listing| now.saturating_duration_since(listing.refreshed) <= ENTRY_TTL);
    }

    /// Live listings sorted by name, then host and port
    pub fn listing(&mut self, now: Instant) -> Vec<ServerEntry> {
        self.prune(now);
        let mut entries: Vec<ServerEntry> =
            self.listings.values().map(|l| l.entry.clone()).collect();
        entries.sort_by(|a, b| {
            (&a.name, &a.host, a.port).cmp(&(&b.name, &b.host, b.port))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

/// TCP front end of a [`Directory`]
pub struct DirectoryServer {
    listener: TcpListener,
    directory: Arc<RwLock<Directory>>,
}

impl DirectoryServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Directory listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            directory: Arc::new(RwLock::new(Directory::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn directory(&self) -> Arc<RwLock<Directory>> {
        Arc::clone(&self.directory)
    }

    /// Accepts connections until the listener fails
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let directory = Arc::clone(&self.directory);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, addr, directory).await {
                    debug!("Directory connection from {} failed: {}", addr, e);
                }
            });
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    directory: Arc<RwLock<Directory>>,
) -> io::Result<()> {
    let frame = match timeout(REQUEST_TIMEOUT, read_frame(&mut stream)).await {
        Ok(frame) => frame?,
        Err(_) => {
            debug!("Directory connection from {} sent nothing", addr);
            return Ok(());
        }
    };
    let Some(frame) = frame else {
        return Ok(());
    };

    match ClientPacket::decode(&frame) {
        Ok(ClientPacket::DirectoryRegister {
            name,
            port,
            players,
        }) => {
            debug!("{} registered {:?} on port {}", addr.ip(), name, port);
            directory
                .write()
                .await
                .register(addr.ip(), port, name, players, Instant::now());
        }
        Ok(ClientPacket::DirectoryQuery) => {
            let servers = directory.write().await.listing(Instant::now());
            let reply = ServerPacket::DirectoryUpdate { servers }
                .encode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            write_frame(&mut stream, &reply).await?;
        }
        Ok(other) => warn!("Unexpected {:?} from {}", other.header(), addr),
        Err(e) => warn!("Malformed directory request from {}: {}", addr, e),
    }
    stream.shutdown().await
}
