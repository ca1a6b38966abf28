//! Status endpoint
//!
//! Serves the cluster status over plain HTTP:
//! - `GET /api/health` returns the [`ClusterStatus`] as JSON
//! - `GET /api/queryactive` returns the names of the nodes currently up

use crate::replication::{ClusterStatus, ClusterSupervisor};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Source of cluster status
pub trait StatusSource: Send + Sync {
    fn cluster_status(&self) -> ClusterStatus;
}

impl StatusSource for ClusterSupervisor {
    fn cluster_status(&self) -> ClusterStatus {
        self.status()
    }
}

/// HTTP status server
pub struct StatusServer {
    source: Arc<dyn StatusSource>,
    listener: TcpListener,
}

impl StatusServer {
    /// Bind the status server
    pub async fn bind(addr: &str, source: Arc<dyn StatusSource>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Status server listening on {}", listener.local_addr()?);
        Ok(Self { source, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until the task is dropped
    pub async fn serve(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((mut stream, addr)) => {
                    let source = self.source.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_status_request(&mut stream, source.as_ref()).await {
                            error!("Error handling status request from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting status connection: {}", e);
                }
            }
        }
    }
}

/// Map a request line to a status code and JSON body
pub fn route(source: &dyn StatusSource, method: &str, path: &str) -> (&'static str, String) {
    let path = path.split('?').next().unwrap_or(path);
    match (method, path) {
        ("GET", "/api/health") => match serde_json::to_string_pretty(&source.cluster_status()) {
            Ok(body) => ("200 OK", body),
            Err(e) => ("500 Internal Server Error", error_body(&e.to_string())),
        },
        ("GET", "/api/queryactive") => {
            match serde_json::to_string(&source.cluster_status().active_nodes()) {
                Ok(body) => ("200 OK", body),
                Err(e) => ("500 Internal Server Error", error_body(&e.to_string())),
            }
        }
        _ => ("404 Not Found", error_body("not found")),
    }
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

async fn handle_status_request(stream: &mut TcpStream, source: &dyn StatusSource) -> Result<()> {
    let mut buffer = vec![0; 2048];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    debug!("Status request {} {}", method, path);

    let (status, body) = route(source, method, path);
    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Bind and serve the status API
pub async fn start_status_server(source: Arc<dyn StatusSource>, addr: &str) -> Result<()> {
    StatusServer::bind(addr, source).await?.serve().await
}
