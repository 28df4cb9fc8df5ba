//! Control API Server
//!
//! Accept loop over a tokio `TcpListener`. Each connection carries one
//! request; the response closes it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::http::{read_request, Response};
use super::routes::handle_request;
use crate::forwarding::ForwardingManager;

/// Time allowed for a client to deliver its request
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the API server
pub struct ApiState {
    pub manager: Arc<ForwardingManager>,
    allow_origins: Vec<String>,
}

impl ApiState {
    pub fn new(manager: Arc<ForwardingManager>, allow_origins: Vec<String>) -> Self {
        Self {
            manager,
            allow_origins,
        }
    }

    /// Origin to echo back in `Access-Control-Allow-Origin`, if allowed
    fn cors_origin<'a>(&self, origin: Option<&'a str>) -> Option<&'a str> {
        let origin = origin?;
        self.allow_origins
            .iter()
            .any(|o| o == "*" || o == origin)
            .then_some(origin)
    }
}

/// Running server
pub struct ApiServer {
    local_addr: SocketAddr,
    /// Shutdown signal sender: send `true` to request server shutdown.
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ApiServer {
    /// Bind `addr` and start accepting
    pub async fn bind(addr: SocketAddr, state: Arc<ApiState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::serve(listener, state)
    }

    /// Start accepting on an already bound listener
    pub fn serve(listener: TcpListener, state: Arc<ApiState>) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        info!("[ApiServer] Listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                tokio::spawn(handle_connection(stream, peer, state.clone()));
                            }
                            Err(e) => {
                                warn!("[ApiServer] Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("[ApiServer] Shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Handle a single TCP connection: read the request, dispatch, respond.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ApiState>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (response, origin) =
        match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(&mut reader)).await {
            Ok(Ok(request)) => {
                debug!("[ApiServer] {} {} from {}", request.method, request.path, peer);
                let response = handle_request(&state.manager, &request).await;
                (response, request.origin)
            }
            Ok(Err(e)) => match e.response() {
                Some(response) => (response, None),
                None => return,
            },
            Err(_) => (Response::detail(408, "Request timed out"), None),
        };

    let bytes = response.to_bytes(state.cors_origin(origin.as_deref()));
    let _ = writer.write_all(&bytes).await;
    let _ = writer.shutdown().await;
}
