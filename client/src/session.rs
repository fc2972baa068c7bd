//! Client connection state machine
//!
//! ```text
//! NotConnected -> Connecting -> Connected -> Disconnecting -> NotConnected
//!                          \-> ConnectedToDirectory -> NotConnected
//! ```
//!
//! The session also decides which server packets are meaningful in the
//! current state: a game connection only accepts the handshake outcome until
//! it has joined, and a directory connection only accepts the listing.

use shared::Header;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    ConnectedToDirectory,
    Disconnecting,
}

/// What happened to the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    Established,
    Joined,
    Disconnect,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot handle {event:?} while {from:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: SessionEvent,
    },
}

#[derive(Debug, Clone)]
pub struct Session {
    state: ConnectionState,
    directory: bool,
    joined: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::NotConnected,
            directory: false,
            joined: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// True when the current connection targets a directory service
    pub fn is_directory(&self) -> bool {
        self.directory
    }

    fn invalid(&self, event: SessionEvent) -> SessionError {
        SessionError::InvalidTransition {
            from: self.state,
            event,
        }
    }

    /// Starts connecting to a game server, or to a directory when `directory` is set
    pub fn connect(&mut self, directory: bool) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::NotConnected => {
                self.state = ConnectionState::Connecting;
                self.directory = directory;
                self.joined = false;
                Ok(())
            }
            _ => Err(self.invalid(SessionEvent::Connect)),
        }
    }

    /// The transport is up
    pub fn established(&mut self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Connecting => {
                self.state = if self.directory {
                    ConnectionState::ConnectedToDirectory
                } else {
                    ConnectionState::Connected
                };
                Ok(())
            }
            _ => Err(self.invalid(SessionEvent::Established)),
        }
    }

    /// The server accepted our handshake
    pub fn joined(&mut self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Connected if !self.joined => {
                self.joined = true;
                Ok(())
            }
            _ => Err(self.invalid(SessionEvent::Joined)),
        }
    }

    /// We are hanging up a game connection
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                Ok(())
            }
            _ => Err(self.invalid(SessionEvent::Disconnect)),
        }
    }

    /// The transport is gone, for whatever reason
    pub fn closed(&mut self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::NotConnected => Err(self.invalid(SessionEvent::Closed)),
            _ => {
                self.state = ConnectionState::NotConnected;
                self.joined = false;
                Ok(())
            }
        }
    }

    /// Whether a packet with `header` should be processed right now
    pub fn accepts(&self, header: Header) -> bool {
        match self.state {
            ConnectionState::Connected if self.joined => header != Header::DirectoryUpdate,
            ConnectionState::Connected => {
                matches!(header, Header::Handshake | Header::NickTaken)
            }
            ConnectionState::ConnectedToDirectory => header == Header::DirectoryUpdate,
            _ => false,
        }
    }
}
