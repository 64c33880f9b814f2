//! Client handles and death notification.
//!
//! Every accepted connection is a client handle. When the connection closes
//! (clean EOF, reset, or server shutdown) every death link attached to its
//! handle fires once. Unlinking before the close cancels the notification.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Remote reference to a connected caller.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    peer: SocketAddr,
    closed: watch::Receiver<bool>,
    runtime: Handle,
}

/// Owned by the connection task. Dropping it marks the client dead.
#[derive(Debug)]
pub struct ConnectionLifetime {
    closed: watch::Sender<bool>,
}

impl ConnectionLifetime {
    /// Mark the connection closed now.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ConnectionLifetime {
    fn drop(&mut self) {
        let _ = self.closed.send(true);
    }
}

impl ClientHandle {
    /// Create a handle for a new connection from `peer`.
    ///
    /// Death links are spawned on `runtime`.
    pub fn new_pair(peer: SocketAddr, runtime: Handle) -> (ConnectionLifetime, ClientHandle) {
        let (tx, rx) = watch::channel(false);
        let handle = ClientHandle {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            closed: rx,
            runtime,
        };
        (ConnectionLifetime { closed: tx }, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection is still open.
    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow() && self.closed.has_changed().is_ok()
    }

    /// Run `recipient` once when this client's connection closes.
    ///
    /// Fires immediately if the connection is already closed.
    pub fn link_to_death<F>(&self, recipient: F) -> DeathLink
    where
        F: FnOnce() + Send + 'static,
    {
        let mut closed = self.closed.clone();
        let id = self.id;
        let task = self.runtime.spawn(async move {
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            debug!("Client {} died", id);
            recipient();
        });
        DeathLink { client_id: id, task }
    }
}

/// A live death-notification subscription.
#[derive(Debug)]
pub struct DeathLink {
    client_id: u64,
    task: JoinHandle<()>,
}

impl DeathLink {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Detach the subscription. The recipient will not run.
    pub fn unlink(self) {
        self.task.abort();
    }
}
