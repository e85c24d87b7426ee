//! ttyshare server
//!
//! Shares one long-running terminal program (typically an AI coding
//! assistant) with any number of WebSocket viewers. Each session owns a PTY
//! process, a terminal emulator and a scrollback ring; viewers that join late
//! are brought up to date with a chunked resync instead of a full replay.

pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod process;
pub mod registry;
pub mod ring_buffer;
pub mod screen;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod upload;
pub mod viewer;

pub use config::ServerConfig;
pub use error::{RelayError, Result};
pub use registry::SessionRegistry;
pub use server::{build_router, serve, shutdown_signal, AppState};
pub use session::Session;
