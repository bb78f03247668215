//! WebSocket server core
//!
//! Frame codec, upgrade handshake, connection registry and the
//! readiness-polled event loop that ties them together.

pub mod frame;
pub mod handshake;
pub mod poller;
pub mod registry;

mod connection;
mod server;

pub use connection::{Connection, MessageHandler};
pub use poller::{NixPoller, Poller};
pub use registry::{ConnectionRegistry, Entry};
pub use server::{
    ConnectHandler, DisconnectHandler, ErrorHandler, Server, ServerHandler, ServerOptions, Tick,
};
