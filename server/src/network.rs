//! Server network layer: TCP game channel, UDP stream channel and the
//! single loop that owns all table state
//!
//! Background tasks never touch game state. The acceptor, the datagram
//! receiver and every per-connection reader turn socket events into
//! [`ServerMessage`]s; the loop in [`Server::run`] applies them to the
//! [`GameState`] and routes the resulting [`Outbound`] actions into
//! per-peer writer queues.

use crate::config::Settings;
use crate::game::{GameState, Outbound};
use crate::stream::{self, StreamClock, STREAM_INTERVAL};
use log::{debug, error, info, warn};
use shared::transport::{read_frame, write_frame, MAX_DATAGRAM};
use shared::{ClientId, ClientPacket, PackageLoader};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// How often the server re-registers with its directory
pub const DIRECTORY_HEARTBEAT: Duration = Duration::from_secs(10);

const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one accepted TCP connection for the lifetime of the process
pub type ConnectionId = u64;

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    Accepted {
        stream: TcpStream,
        addr: SocketAddr,
    },
    PacketReceived {
        conn: ConnectionId,
        data: Vec<u8>,
    },
    PeerClosed {
        conn: ConnectionId,
    },
    Datagram {
        data: Vec<u8>,
        addr: SocketAddr,
    },
    Shutdown,
}

/// Stop signal shared by the ctrl-c handler, tests and the loop
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    wake: mpsc::UnboundedSender<ServerMessage>,
}

impl Shutdown {
    /// Asks the loop to stop at its next iteration
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.wake.send(ServerMessage::Shutdown);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Writer side of one connected peer
struct PeerLink {
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

/// Main server coordinating networking and the authoritative table
pub struct Server {
    listener: Option<TcpListener>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    game_state: GameState,
    links: HashMap<ClientId, PeerLink>,
    connections: HashMap<ConnectionId, ClientId>,
    next_conn: ConnectionId,
    clock: StreamClock,
    shutdown: Shutdown,

    // Communication channel
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    /// Binds the TCP listener and the UDP socket on the same port
    pub async fn bind(settings: Settings, loader: Box<dyn PackageLoader>) -> io::Result<Self> {
        let listener = TcpListener::bind(settings.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        info!("Server listening on {} (tcp+udp)", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            wake: server_tx.clone(),
        };

        let mut settings = settings;
        settings.port = local_addr.port();

        Ok(Server {
            listener: Some(listener),
            socket,
            local_addr,
            game_state: GameState::new(settings, loader),
            links: HashMap::new(),
            connections: HashMap::new(),
            next_conn: 0,
            clock: StreamClock::new(),
            shutdown,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Spawns task that accepts TCP connections
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if server_tx
                            .send(ServerMessage::Accepted { stream, addr })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that continuously listens for stream datagrams
    fn spawn_datagram_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if server_tx.send(ServerMessage::Datagram { data, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that triggers shutdown on ctrl-c
    fn spawn_ctrl_c_handler(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c, shutting down");
                shutdown.trigger();
            }
        });
    }

    /// Gives a fresh connection a client id plus reader and writer tasks
    fn spawn_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        let Some(client) = self.game_state.connect(addr) else {
            warn!("Refusing connection from {}: no free client id", addr);
            return;
        };
        let conn = self.next_conn;
        self.next_conn += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot disable nagle for {}: {}", addr, e);
        }
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let server_tx = self.server_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(data)) => {
                        if server_tx
                            .send(ServerMessage::PacketReceived { conn, data })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Connection {} failed: {}", conn, e);
                        break;
                    }
                }
            }
            let _ = server_tx.send(ServerMessage::PeerClosed { conn });
        });

        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &packet).await {
                    debug!("Write to connection {} failed: {}", conn, e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        debug!("Connection {} from {} is client {}", conn, addr, client);
        self.links.insert(client, PeerLink { conn, tx, reader });
        self.connections.insert(conn, client);
    }

    fn queue(&self, to: ClientId, bytes: &[u8]) {
        if let Some(link) = self.links.get(&to) {
            if link.tx.send(bytes.to_vec()).is_err() {
                debug!("Writer of client {} is gone", to);
            }
        }
    }

    /// Carries out the actions produced by the game state, in order
    fn dispatch(&mut self, outbound: Vec<Outbound>) {
        for action in outbound {
            match action {
                Outbound::Send { to, packet } => match packet.encode() {
                    Ok(bytes) => self.queue(to, &bytes),
                    Err(e) => error!("Failed to encode {:?}: {}", packet.header(), e),
                },
                Outbound::Broadcast { packet, exclude } => match packet.encode() {
                    Ok(bytes) => {
                        for id in self.game_state.clients().joined_ids() {
                            if Some(id) != exclude {
                                self.queue(id, &bytes);
                            }
                        }
                    }
                    Err(e) => error!("Failed to encode {:?}: {}", packet.header(), e),
                },
                Outbound::Close { client } => self.close_link(client),
            }
        }
    }

    /// Drops the transport of a client. Queued packets are still flushed.
    fn close_link(&mut self, client: ClientId) {
        if let Some(link) = self.links.remove(&client) {
            self.connections.remove(&link.conn);
            link.reader.abort();
            debug!("Closed connection {} of client {}", link.conn, client);
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Accepted { stream, addr } => self.spawn_peer(stream, addr),
            ServerMessage::PacketReceived { conn, data } => {
                // Frames still in flight from a connection that was already closed
                let Some(&client) = self.connections.get(&conn) else {
                    return;
                };
                let outbound = self.game_state.handle_packet(client, &data);
                self.dispatch(outbound);
            }
            ServerMessage::PeerClosed { conn } => {
                if let Some(client) = self.connections.remove(&conn) {
                    self.links.remove(&client);
                    let outbound = self.game_state.disconnect(client);
                    self.dispatch(outbound);
                }
            }
            ServerMessage::Datagram { data, addr } => {
                self.game_state
                    .handle_datagram(addr, &data, self.clock.now_ms());
            }
            ServerMessage::Shutdown => {}
        }
    }

    /// Sends one stream packet to every registered peer
    async fn publish_stream(&self) {
        let targets = self.game_state.clients().stream_addrs();
        if targets.is_empty() {
            return;
        }
        let packet = stream::stream_packet(self.game_state.clients(), self.clock.stamp());
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode stream packet: {}", e);
                return;
            }
        };
        for (client, addr) in targets {
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                debug!("Stream send to client {} at {} failed: {}", client, addr, e);
            }
        }
    }

    /// Registers with the configured directory from a background task
    fn register_with_directory(&self) {
        let Some(directory) = self.game_state.settings().directory.clone() else {
            return;
        };
        let entry = self.game_state.directory_entry();
        let packet = ClientPacket::DirectoryRegister {
            name: entry.name,
            port: entry.port,
            players: entry.players,
        };

        tokio::spawn(async move {
            let attempt = async {
                let bytes = packet
                    .encode()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let mut stream = TcpStream::connect(&directory).await?;
                write_frame(&mut stream, &bytes).await?;
                stream.shutdown().await
            };
            match timeout(DIRECTORY_TIMEOUT, attempt).await {
                Ok(Ok(())) => debug!("Registered with directory {}", directory),
                Ok(Err(e)) => warn!("Directory {} unreachable: {}", directory, e),
                Err(_) => warn!("Directory {} timed out", directory),
            }
        });
    }

    /// Main server loop coordinating all operations
    pub async fn run(mut self) -> io::Result<()> {
        // Initialize concurrent tasks
        self.spawn_acceptor();
        self.spawn_datagram_receiver();
        self.spawn_ctrl_c_handler();

        let mut stream_timer = interval(STREAM_INTERVAL);
        stream_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(DIRECTORY_HEARTBEAT);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let use_directory = self.game_state.settings().directory.is_some();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                message = self.server_rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                _ = stream_timer.tick() => self.publish_stream().await,
                _ = heartbeat.tick(), if use_directory => self.register_with_directory(),
            }
        }

        info!("Server on {} stopped", self.local_addr);
        for (_, link) in self.links.drain() {
            link.reader.abort();
        }
        Ok(())
    }
}

