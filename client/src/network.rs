use crate::game::{ClientGameState, TableEvent};
use crate::input::{parse_command, Command, MAX_SCRIPT_DEPTH};
use crate::rendering::{directory_lines, Renderer};
use crate::session::{ConnectionState, Session, SessionError};
use log::{debug, info, warn};
use shared::transport::{read_frame, write_frame, MAX_DATAGRAM};
use shared::{Channel, ClientPacket, CodecError, PackageLoader, ServerEntry, ServerPacket};
use std::collections::VecDeque;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

/// How long connecting or waiting on a directory may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Resend period of the stream registration until the first stream packet
pub const REGISTER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("no free nick, last tried {0:?}")]
    NickExhausted(String),
}

/// Whether the main loop keeps going after handling something
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
}

pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(format!("{}:{}", host, port)))
}

async fn connect_tcp(session: &mut Session, addr: SocketAddr) -> Result<TcpStream, ClientError> {
    let connected = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(timed_out("connect")),
    };
    match connected {
        Ok(stream) => {
            stream.set_nodelay(true)?;
            session.established()?;
            Ok(stream)
        }
        Err(e) => {
            session.closed()?;
            Err(e.into())
        }
    }
}

/// Asks a directory service for its server listing
pub async fn query_directory(addr: SocketAddr) -> Result<Vec<ServerEntry>, ClientError> {
    let mut session = Session::new();
    session.connect(true)?;
    let mut stream = connect_tcp(&mut session, addr).await?;

    write_frame(&mut stream, &ClientPacket::DirectoryQuery.encode()?).await?;
    let frame = match timeout(CONNECT_TIMEOUT, read_frame(&mut stream)).await {
        Ok(frame) => frame?,
        Err(_) => return Err(timed_out("directory reply").into()),
    };
    let _ = stream.shutdown().await;

    let mut servers = Vec::new();
    match frame.map(|bytes| ServerPacket::decode(&bytes)) {
        Some(Ok(packet)) if session.accepts(packet.header()) => {
            if let ServerPacket::DirectoryUpdate { servers: listed } = packet {
                servers = listed;
            }
        }
        Some(Ok(packet)) => warn!("Directory answered with {:?}", packet.header()),
        Some(Err(e)) => warn!("Malformed directory reply: {}", e),
        None => warn!("Directory closed the connection without a reply"),
    }
    session.closed()?;
    Ok(servers)
}

/// Prints a directory listing to stdout
pub async fn list_servers(addr: SocketAddr) -> Result<(), ClientError> {
    info!("Querying directory at {}", addr);
    let servers = query_directory(addr).await?;
    for line in directory_lines(&servers) {
        println!("{}", line);
    }
    Ok(())
}

fn read_script(path: &Path, depth: usize) -> io::Result<Vec<(String, usize)>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().map(|line| (line.to_string(), depth)).collect())
}

/// Console client of one table server
pub struct Client {
    writer: OwnedWriteHalf,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    reader: JoinHandle<()>,
    socket: UdpSocket,
    server_addr: SocketAddr,

    game_state: ClientGameState,
    renderer: Renderer<io::Stdout>,

    script: Option<PathBuf>,
    stream_seen: bool,
}

impl Client {
    pub async fn new(
        server_addr: SocketAddr,
        nick: &str,
        loader: Box<dyn PackageLoader>,
        script: Option<PathBuf>,
    ) -> Result<Self, ClientError> {
        let mut game_state = ClientGameState::new(nick, loader);
        game_state.session_mut().connect(false)?;
        info!("Connecting to {}...", server_addr);
        let stream = connect_tcp(game_state.session_mut(), server_addr).await?;
        let local = if server_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(local).await?;

        let (mut read_half, writer) = stream.into_split();
        let (tx, frames) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Connection error: {}", e);
                        break;
                    }
                }
            }
        });

        let colored = io::stdout().is_terminal();
        Ok(Client {
            writer,
            frames,
            reader,
            socket,
            server_addr,
            game_state,
            renderer: Renderer::new(io::stdout(), colored),
            script,
            stream_seen: false,
        })
    }

    /// Sends one packet on the channel its type travels on
    ///
    /// Lost datagrams are only logged; the stream is resent periodically.
    async fn send(&mut self, packet: &ClientPacket) -> Result<(), ClientError> {
        let bytes = packet.encode()?;
        match packet.header().channel() {
            Channel::Reliable => write_frame(&mut self.writer, &bytes).await?,
            Channel::Unreliable => {
                if let Err(e) = self.socket.send_to(&bytes, self.server_addr).await {
                    debug!("Stream datagram not sent: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn register_stream(&mut self) -> Result<(), ClientError> {
        match self.game_state.stream_registration() {
            Some(packet) => self.send(&packet).await,
            None => Ok(()),
        }
    }

    async fn handle_frame(&mut self, bytes: &[u8]) -> Result<Flow, ClientError> {
        let packet = match ServerPacket::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed packet: {}", e);
                return Ok(Flow::Continue);
            }
        };
        let events = self.game_state.apply(packet);
        let flow = self.handle_events(events).await?;
        for request in self.game_state.take_requests() {
            self.send(&request).await?;
        }
        Ok(flow)
    }

    async fn handle_events(&mut self, events: Vec<TableEvent>) -> Result<Flow, ClientError> {
        let mut flow = Flow::Continue;
        for event in events {
            self.renderer.event(&self.game_state, &event)?;
            match event {
                TableEvent::NickTaken { .. } => match self.game_state.retry_nick() {
                    Some(packet) => {
                        info!("Retrying as {:?}", self.game_state.nick());
                        self.send(&packet).await?;
                    }
                    None => {
                        return Err(ClientError::NickExhausted(
                            self.game_state.nick().to_string(),
                        ))
                    }
                },
                TableEvent::Joined { .. } => {
                    self.register_stream().await?;
                    if let Some(path) = self.script.take() {
                        if self.run_script(&path).await? == Flow::Quit {
                            flow = Flow::Quit;
                        }
                    }
                }
                TableEvent::Kicked { target, .. } if Some(target) == self.game_state.me() => {
                    flow = Flow::Quit;
                }
                TableEvent::Stream { stamp } => {
                    self.stream_seen = true;
                    if let Some(echo) = self.game_state.stream_echo(stamp) {
                        self.send(&echo).await?;
                    }
                }
                _ => {}
            }
        }
        Ok(flow)
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Result<(), ClientError> {
        if from != self.server_addr {
            debug!("Ignoring datagram from {}", from);
            return Ok(());
        }
        match ServerPacket::decode(bytes) {
            Ok(packet) if packet.header().channel() == Channel::Unreliable => {
                let events = self.game_state.apply(packet);
                self.handle_events(events).await?;
            }
            Ok(other) => debug!("Ignoring {:?} datagram", other.header()),
            Err(e) => debug!("Malformed datagram: {}", e),
        }
        Ok(())
    }

    /// Runs one command that is not `/script`
    async fn execute(&mut self, command: Command) -> Result<Flow, ClientError> {
        match command {
            Command::Quit => return Ok(Flow::Quit),
            Command::Table => self.renderer.table(&self.game_state)?,
            Command::Who => self.renderer.roster(&self.game_state)?,
            command => match self.game_state.intent_for(&command) {
                Some(packet) => self.send(&packet).await?,
                None => self.renderer.line("Nothing to do")?,
            },
        }
        Ok(Flow::Continue)
    }

    /// Feeds a script file through the command parser, following nested scripts
    async fn run_script(&mut self, path: &Path) -> Result<Flow, ClientError> {
        let mut pending: VecDeque<(String, usize)> = match read_script(path, 0) {
            Ok(lines) => lines.into(),
            Err(e) => {
                warn!("Cannot read script {}: {}", path.display(), e);
                return Ok(Flow::Continue);
            }
        };
        info!("Running script {}", path.display());

        while let Some((line, depth)) = pending.pop_front() {
            let command = match parse_command(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}: {}", path.display(), e);
                    continue;
                }
            };
            if let Command::Script(nested) = command {
                if depth + 1 >= MAX_SCRIPT_DEPTH {
                    warn!("Scripts nest too deep, skipping {}", nested);
                    continue;
                }
                match read_script(Path::new(&nested), depth + 1) {
                    Ok(lines) => {
                        for entry in lines.into_iter().rev() {
                            pending.push_front(entry);
                        }
                    }
                    Err(e) => warn!("Cannot read script {}: {}", nested, e),
                }
                continue;
            }
            if self.execute(command).await? == Flow::Quit {
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow, ClientError> {
        match parse_command(line) {
            Ok(Some(Command::Script(path))) => self.run_script(Path::new(&path)).await,
            Ok(Some(command)) => self.execute(command).await,
            Ok(None) => Ok(Flow::Continue),
            Err(e) => {
                self.renderer.line(&e.to_string())?;
                Ok(Flow::Continue)
            }
        }
    }

    pub async fn run(mut self) -> Result<(), ClientError> {
        let handshake = self.game_state.handshake_packet();
        self.send(&handshake).await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut register_interval = interval(REGISTER_INTERVAL);
        let mut buffer = [0u8; MAX_DATAGRAM];

        let result = loop {
            let step = tokio::select! {
                frame = self.frames.recv() => match frame {
                    Some(bytes) => self.handle_frame(&bytes).await,
                    None => {
                        info!("Server closed the connection");
                        Ok(Flow::Quit)
                    }
                },

                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => {
                        debug!("Input closed");
                        stdin_open = false;
                        Ok(Flow::Continue)
                    }
                    Err(e) => {
                        warn!("Cannot read input: {}", e);
                        stdin_open = false;
                        Ok(Flow::Continue)
                    }
                },

                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await.map(|_| Flow::Continue),
                    Err(e) => {
                        debug!("Error receiving datagram: {}", e);
                        Ok(Flow::Continue)
                    }
                },

                _ = register_interval.tick(), if !self.stream_seen => {
                    self.register_stream().await.map(|_| Flow::Continue)
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    Ok(Flow::Quit)
                },
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.close().await;
        result
    }

    async fn close(&mut self) {
        let session = self.game_state.session_mut();
        if session.state() == ConnectionState::Connected && session.disconnect().is_ok() {
            info!("Disconnecting");
        }
        if let Err(e) = self.writer.shutdown().await {
            debug!("Shutdown failed: {}", e);
        }
        self.reader.abort();
        if let Err(e) = self.game_state.session_mut().closed() {
            debug!("{}", e);
        }
    }
}
