//! # Table Client Library
//!
//! This library provides the console client for the shared tabletop. It keeps
//! a mirror of the server's table, turns typed commands into intents, and
//! prints what every participant does.
//!
//! ## Architecture Overview
//!
//! ### Server Authority
//! The client never changes the table on its own. A command becomes an
//! intent packet; the table only changes when the server's effect comes
//! back, which is the same packet every other client receives. Applying
//! effects in arrival order keeps every mirror identical to the server.
//!
//! ### Connection States
//! A connection moves through connecting, connected and disconnecting. Until
//! the handshake is accepted only the handshake outcome is processed, and a
//! directory connection only ever processes the server listing.
//!
//! ### Class Files
//! Object classes are read from the local package directory. Classes that
//! are missing there are drawn as zero-sized placeholders and requested from
//! the server, which streams the file back in chunks.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The table mirror:
//! - Applying server effects
//! - Roster with nicks and round trips
//! - Class downloads
//! - Translating commands into intents
//!
//! ### Input Module (`input`)
//! Parses typed lines and script lines into commands.
//!
//! ### Network Module (`network`)
//! TCP framing, the telemetry datagram echo, directory queries and the main
//! event loop.
//!
//! ### Rendering Module (`rendering`)
//! Text output for events, the table listing and the roster.
//!
//! ### Session Module (`session`)
//! The connection state machine and packet gating.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{resolve, Client};
//! use shared::DirPackageLoader;
//!
//! # async fn example() -> Result<(), client::network::ClientError> {
//! let addr = resolve("127.0.0.1", shared::DEFAULT_PORT).await?;
//! let loader = Box::new(DirPackageLoader::new("packages"));
//! let client = Client::new(addr, "Alice", loader, None).await?;
//!
//! // Reads commands from stdin until /quit
//! client.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod game;
pub mod input;
pub mod network;
pub mod rendering;
pub mod session;
