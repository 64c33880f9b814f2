//! TCP IPC server for the daemon endpoint.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port), accepts connections and
//! dispatches JSON-RPC calls. Each connection is a [`ClientHandle`]; when the
//! connection task ends the handle's death links fire.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task. The dispatcher is shared via `Arc`.

use super::peer::ClientHandle;
use super::protocol::{methods, read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::IpcConfig;
use crate::{Result, SoloError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down the server.
    ///
    /// Stops accepting new connections and closes all active ones, which
    /// fires the death links of their client handles.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Receives the calls arriving on the daemon endpoint.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    /// Dispatch a JSON-RPC call made by `client` and return the result.
    async fn dispatch(
        &self,
        client: &ClientHandle,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, SoloError>;

    /// Forced termination requested through the control method.
    ///
    /// Called before request validation and normal dispatch.
    async fn terminate(&self);
}

/// IPC server that listens for client connections.
pub struct IpcServer;

impl IpcServer {
    /// Start the IPC server on a random local port.
    pub async fn start<D: IpcDispatch>(dispatch: Arc<D>) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(IpcConfig::BIND_ADDR).await?;
        Self::start_with_listener(listener, dispatch)
    }

    /// Start serving on an already-bound listener.
    ///
    /// The daemon binds first so it knows its port before claiming the
    /// registry slot, then attaches its dispatcher.
    pub fn start_with_listener<D: IpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
    ) -> Result<IpcServerHandle> {
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("IPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: IpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                let (lifetime, client) = ClientHandle::new_pair(
                                    peer_addr,
                                    tokio::runtime::Handle::current(),
                                );
                                debug!("IPC connection {} from {}", client.id(), peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, &*dispatch, &client, &mut conn_shutdown).await
                                {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                lifetime.close();
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: IpcDispatch>(
        mut stream: TcpStream,
        dispatch: &D,
        client: &ClientHandle,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let request_str = String::from_utf8(frame).map_err(|_| SoloError::Validation {
                field: "ipc_payload".to_string(),
                message: "Invalid UTF-8 in IPC frame".to_string(),
            })?;

            if let Some(response) = Self::process_request(&request_str, dispatch, client).await {
                let response_bytes = serde_json::to_vec(&response)?;
                write_frame(&mut writer, &response_bytes).await?;
            }
        }
    }

    /// Process one request. Returns `None` for notifications.
    async fn process_request<D: IpcDispatch>(
        request_str: &str,
        dispatch: &D,
        client: &ClientHandle,
    ) -> Option<IpcResponse> {
        let request: IpcRequest = match serde_json::from_str(request_str) {
            Ok(req) => req,
            Err(e) => {
                return Some(IpcResponse::error(None, -32700, format!("Parse error: {}", e)));
            }
        };

        if request.method == methods::TERMINATE {
            info!("Terminate requested by client {}", client.id());
            dispatch.terminate().await;
            return request
                .id
                .map(|id| IpcResponse::success(Some(id), serde_json::Value::Bool(true)));
        }

        if request.jsonrpc != "2.0" {
            return Some(IpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            ));
        }

        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let result = dispatch.dispatch(client, &request.method, params).await;

        match (request.id, result) {
            (None, Ok(_)) => None,
            (None, Err(e)) => {
                warn!("Notification {} failed: {}", request.method, e);
                None
            }
            (Some(id), Ok(result)) => Some(IpcResponse::success(Some(id), result)),
            (Some(id), Err(e)) => Some(IpcResponse::error(
                Some(id),
                e.to_rpc_error_code(),
                e.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct EchoDispatch {
        terminated: AtomicBool,
        notified: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl IpcDispatch for EchoDispatch {
        async fn dispatch(
            &self,
            client: &ClientHandle,
            method: &str,
            params: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, SoloError> {
            match method {
                "echo" => Ok(params),
                "whoami" => Ok(serde_json::json!(client.id())),
                "note" => {
                    self.notified.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
                "fail" => Err(SoloError::Other("test failure".to_string())),
                _ => Err(SoloError::MethodNotFound {
                    method: method.to_string(),
                }),
            }
        }

        async fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    async fn roundtrip(stream: &mut TcpStream, request: &IpcRequest) -> IpcResponse {
        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, &serde_json::to_vec(request).unwrap())
            .await
            .unwrap();
        let bytes = read_frame(&mut reader).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let dispatch = Arc::new(EchoDispatch::default());
        let mut handle = IpcServer::start(dispatch).await.unwrap();

        assert!(handle.port > 0);
        assert_eq!(handle.addr.ip(), std::net::Ipv4Addr::LOCALHOST);

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let request = IpcRequest::new("echo", serde_json::json!({"hello": "world"}), 1);
        let response = roundtrip(&mut stream, &request).await;

        assert!(response.error.is_none());
        assert_eq!(response.result, Some(serde_json::json!({"hello": "world"})));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_each_connection_is_a_distinct_client() {
        let dispatch = Arc::new(EchoDispatch::default());
        let mut handle = IpcServer::start(dispatch).await.unwrap();

        let mut a = TcpStream::connect(handle.addr()).await.unwrap();
        let mut b = TcpStream::connect(handle.addr()).await.unwrap();
        let whoami = IpcRequest::new("whoami", serde_json::json!({}), 1);

        let id_a = roundtrip(&mut a, &whoami).await.result.unwrap();
        let id_a_again = roundtrip(&mut a, &whoami).await.result.unwrap();
        let id_b = roundtrip(&mut b, &whoami).await.result.unwrap();

        assert_eq!(id_a, id_a_again);
        assert_ne!(id_a, id_b);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let dispatch = Arc::new(EchoDispatch::default());
        let mut handle = IpcServer::start(dispatch.clone()).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        {
            let (_, mut writer) = stream.split();
            let note = IpcRequest::notification("note", serde_json::json!({}));
            write_frame(&mut writer, &serde_json::to_vec(&note).unwrap())
                .await
                .unwrap();
        }

        // The next response on the stream belongs to the follow-up call.
        let echo = IpcRequest::new("echo", serde_json::json!("after"), 2);
        let response = roundtrip(&mut stream, &echo).await;
        assert_eq!(response.result, Some(serde_json::json!("after")));
        assert_eq!(dispatch.notified.load(Ordering::SeqCst), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_terminate_bypasses_version_check() {
        let dispatch = Arc::new(EchoDispatch::default());
        let mut handle = IpcServer::start(dispatch.clone()).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let mut request = IpcRequest::new(methods::TERMINATE, serde_json::json!({}), 3);
        request.jsonrpc = "1.0".to_string();
        let response = roundtrip(&mut stream, &request).await;

        assert!(response.error.is_none());
        assert!(dispatch.terminated.load(Ordering::SeqCst));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let dispatch = Arc::new(EchoDispatch::default());
        let mut handle = IpcServer::start(dispatch).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let response = roundtrip(&mut stream, &IpcRequest::new("fail", serde_json::json!({}), 2)).await;

        let err = response.error.unwrap();
        assert_eq!(err.code, -32603);
        assert!(err.message.contains("test failure"));

        let response = roundtrip(&mut stream, &IpcRequest::new("nope", serde_json::json!({}), 3)).await;
        assert_eq!(response.error.unwrap().code, -32601);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_invalid_json_returns_parse_error() {
        let dispatch = Arc::new(EchoDispatch::default());
        let mut handle = IpcServer::start(dispatch).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, b"not valid json").await.unwrap();

        let response_bytes = read_frame(&mut reader).await.unwrap().unwrap();
        let response: IpcResponse = serde_json::from_slice(&response_bytes).unwrap();
        assert_eq!(response.error.unwrap().code, -32700);

        handle.shutdown();
    }
}
