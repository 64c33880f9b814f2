//! Local IPC for the daemon endpoint.
//!
//! Length-prefixed JSON-RPC 2.0 over `127.0.0.1` TCP connections.
//!
//! # Architecture
//!
//! - **Server**: Runs in the daemon, accepts connections, dispatches calls
//! - **Peer**: Per-connection client handles and their death links
//! - **Client**: Connects to a daemon and issues typed calls
//! - **Protocol**: Shared framing, method names and JSON-RPC types

pub mod client;
pub mod peer;
pub mod protocol;
pub mod server;

pub use client::DaemonClient;
pub use peer::{ClientHandle, ConnectionLifetime, DeathLink};
pub use protocol::{methods, IpcRequest, IpcResponse};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
