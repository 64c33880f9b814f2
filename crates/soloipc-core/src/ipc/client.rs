//! TCP IPC client for talking to a running daemon.
//!
//! The connection itself is the client handle the daemon tracks: a bind made
//! through a `DaemonClient` stays bound until `unbind()` is sent or the client
//! is dropped, which the daemon observes as client death.
//!
//! # Thread Safety
//!
//! The client uses a tokio `Mutex` to serialize access to the TCP stream,
//! allowing safe concurrent use from multiple async tasks.

use super::protocol::{methods, read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::IpcConfig;
use crate::daemon::{Binding, ComponentName, DaemonStatus, Intent};
use crate::error::COMPONENT_MISMATCH_CODE;
use crate::registry::ServiceRegistry;
use crate::{Result, SoloError};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// IPC client connected to a daemon endpoint.
#[derive(Debug)]
pub struct DaemonClient {
    stream: Mutex<TcpStream>,
    addr: SocketAddr,
    next_id: AtomicU64,
    /// PID of the daemon (for error reporting).
    pub daemon_pid: u32,
    /// Port of the daemon (for error reporting).
    pub daemon_port: u16,
}

impl DaemonClient {
    /// Connect to a daemon's IPC server.
    ///
    /// Uses the configured connection timeout from `IpcConfig`.
    pub async fn connect(addr: SocketAddr, pid: u32) -> Result<Self> {
        let lost = || SoloError::InstanceLost {
            pid,
            port: addr.port(),
        };
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| lost())?
            .map_err(|_| lost())?;

        debug!("IPC client connected to {} (PID {})", addr, pid);

        Ok(Self {
            stream: Mutex::new(stream),
            addr,
            next_id: AtomicU64::new(1),
            daemon_pid: pid,
            daemon_port: addr.port(),
        })
    }

    /// Connect to a local daemon listening on `port`.
    pub async fn connect_local(port: u16, pid: u32) -> Result<Self> {
        Self::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), pid).await
    }

    /// Connect to the daemon registered as discoverable for `component`.
    ///
    /// Returns `None` when no daemon retained itself under that name.
    pub async fn connect_discoverable(
        registry: &ServiceRegistry,
        component: &ComponentName,
    ) -> Result<Option<Self>> {
        match registry.lookup_discoverable(&component.service_name())? {
            Some(entry) => Ok(Some(Self::connect_local(entry.port, entry.pid).await?)),
            None => Ok(None),
        }
    }

    fn lost(&self) -> SoloError {
        SoloError::InstanceLost {
            pid: self.daemon_pid,
            port: self.daemon_port,
        }
    }

    /// Call a JSON-RPC method and wait for its result.
    ///
    /// If the connection is broken, returns `InstanceLost`.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = IpcRequest::new(method, params, id);
        let request_bytes = serde_json::to_vec(&request)?;

        let mut stream = self.stream.lock().await;
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, &request_bytes)
            .await
            .map_err(|_| self.lost())?;

        let response_bytes = read_frame(&mut reader)
            .await
            .map_err(|_| self.lost())?
            .ok_or_else(|| self.lost())?;

        let response: IpcResponse =
            serde_json::from_slice(&response_bytes).map_err(|e| SoloError::Json {
                message: format!("Failed to parse IPC response: {}", e),
                source: Some(e),
            })?;

        if let Some(err) = response.error {
            return Err(SoloError::Remote {
                code: err.code,
                message: err.message,
            });
        }

        response
            .result
            .ok_or_else(|| SoloError::Other("IPC response missing result".to_string()))
    }

    /// Send a notification. No response is read.
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let request = IpcRequest::notification(method, params);
        let request_bytes = serde_json::to_vec(&request)?;

        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &request_bytes)
            .await
            .map_err(|_| self.lost())
    }

    /// Bind to the daemon's service. `None` if the service declined or failed.
    pub async fn bind(&self, intent: &Intent) -> Result<Option<Binding>> {
        let result = self
            .call(methods::BIND, serde_json::json!({ "intent": intent }))
            .await?;
        Ok(match result {
            serde_json::Value::Null => None,
            binding => Some(binding),
        })
    }

    /// Negotiated disconnect.
    pub async fn unbind(&self) -> Result<()> {
        self.notify(methods::UNBIND, serde_json::json!({})).await
    }

    /// Forced shutdown through the formal interface.
    pub async fn stop(&self) -> Result<()> {
        self.notify(methods::STOP, serde_json::json!({})).await
    }

    /// Forced shutdown through the transport control method.
    pub async fn terminate(&self) -> Result<()> {
        self.notify(methods::TERMINATE, serde_json::json!({})).await
    }

    /// Ask the daemon to re-announce itself.
    ///
    /// Sent as a call so the caller learns whether the daemon is alive.
    pub async fn broadcast(&self) -> Result<()> {
        self.call(methods::BROADCAST, serde_json::json!({})).await?;
        Ok(())
    }

    /// Ask the registered holder of `service` to re-announce itself.
    ///
    /// The endpoint must be the daemon for `service` running as
    /// `daemon_pid` and must answer within `IpcConfig::REANNOUNCE_TIMEOUT`.
    /// Anything else on the port (another daemon after port reuse, a silent
    /// or foreign listener) is reported as `InstanceLost`.
    pub async fn reannounce(&self, service: &str) -> Result<()> {
        let params = serde_json::json!({ "service": service, "pid": self.daemon_pid });
        let reply = tokio::time::timeout(
            IpcConfig::REANNOUNCE_TIMEOUT,
            self.call(methods::BROADCAST, params),
        )
        .await;

        match reply {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(SoloError::Remote { code, message }))
                if code == COMPONENT_MISMATCH_CODE =>
            {
                debug!("Port {} is not {}: {}", self.daemon_port, service, message);
                Err(self.lost())
            }
            Ok(Err(SoloError::Json { message, .. })) => {
                debug!("Port {} does not speak the daemon protocol: {}", self.daemon_port, message);
                Err(self.lost())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(
                    "No re-announce reply from port {} within {:?}",
                    self.daemon_port,
                    IpcConfig::REANNOUNCE_TIMEOUT
                );
                Err(self.lost())
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(methods::PING, serde_json::json!({})).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        let value = self.call(methods::STATUS, serde_json::json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Get the address of the connected daemon.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
