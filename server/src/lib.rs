//! # Table Server Library
//!
//! This library provides the authoritative server for the shared tabletop.
//! It owns the canonical table, validates every client intent against it, and
//! rebroadcasts the resulting effect, tagged with the originating client id,
//! to every joined client including the sender.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Table
//! Clients never change shared state on their own. Create, select, move,
//! flip, own, rotate, remove and shuffle requests are checked against
//! selection and ownership before anything is applied, and the stack graph
//! is rebuilt after every change that can affect it.
//!
//! ### Peer Management
//! Handles the lifecycle of each connection:
//! - Client id assignment at connect time
//! - Handshake with protocol version and nick checks
//! - Release of held objects when a peer leaves or is kicked
//!
//! ### Telemetry Stream
//! Once a second every registered peer receives an unreliable datagram with
//! a timestamp and the round trips of all peers.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! All state lives in one loop that processes socket events in arrival
//! order. Background tasks only move bytes between sockets and channels.
//!
//! ### Two Channels
//! Table traffic uses length-prefixed frames over TCP. Only the telemetry
//! stream travels over UDP, on the same port number.
//!
//! ## Module Organization
//!
//! - `client_manager`: peer roster, nicks, admin flag, stream addresses
//! - `config`: command line and environment settings
//! - `game`: packet dispatch and validation over the shared table
//! - `network`: sockets, per-peer writer queues and the main loop
//! - `stream`: telemetry timestamps and round trip bookkeeping
//! - `directory`: the standalone server listing service
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Settings;
//! use server::network::Server;
//! use shared::DirPackageLoader;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::default();
//!     let loader = Box::new(DirPackageLoader::new(&settings.packages));
//!     let server = Server::bind(settings, loader).await?;
//!
//!     // Runs until ctrl-c
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod directory;
pub mod game;
pub mod network;
pub mod stream;
