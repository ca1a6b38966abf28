//! InfluxDB 1.x HTTP transport

use super::line_protocol::encode_points;
use super::{
    BatchPoints, ClientError, ClientResult, Connector, DbClient, PingInfo, Query, QueryResponse,
};
use crate::config::NodeConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const VERSION_HEADER: &str = "X-Influxdb-Version";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client bound to one node
pub struct HttpClient {
    client: Client,
    node: String,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl HttpClient {
    /// Create a new client for a configured node
    pub fn new(node: &NodeConfig) -> ClientResult<Self> {
        let timeout = node.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fluxsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Ok(Self {
            client,
            node: node.name.clone(),
            base_url: node.location.trim_end_matches('/').to_string(),
            username: non_empty(&node.admin_user),
            password: non_empty(&node.admin_passwd),
            timeout,
        })
    }

    fn build_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);

        if let Some(ref user) = self.username {
            req = req.basic_auth(user, self.password.as_ref());
        }

        req
    }

    async fn send(&self, req: RequestBuilder) -> ClientResult<Response> {
        req.send().await.map_err(|e| self.map_err(e))
    }

    fn map_err(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(self.timeout)
        } else if e.is_connect() {
            ClientError::Unavailable(format!("{}: {}", self.node, e))
        } else {
            ClientError::Http(e)
        }
    }

    async fn error_from(&self, response: Response) -> ClientError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        ClientError::Server { status, message }
    }
}

#[async_trait]
impl DbClient for HttpClient {
    async fn ping(&self) -> ClientResult<PingInfo> {
        let started = Instant::now();
        let response = self.send(self.build_request(Method::GET, "/ping")).await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let version = response
            .headers()
            .get(VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(PingInfo {
            latency: started.elapsed(),
            version,
        })
    }

    async fn query(&self, query: &Query) -> ClientResult<QueryResponse> {
        let command = query.command();
        debug!("[{}] query: {}", self.node, command);

        let mut form: Vec<(&str, &str)> = vec![("q", command.as_str()), ("epoch", "ns")];
        if let Some(ref db) = query.database {
            form.push(("db", db.as_str()));
        }
        if let Some(ref rp) = query.retention_policy {
            form.push(("rp", rp.as_str()));
        }

        let response = self
            .send(self.build_request(Method::POST, "/query").form(&form))
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let body: QueryResponse = response.json().await.map_err(|e| {
            ClientError::Protocol(format!("invalid query response from {}: {}", self.node, e))
        })?;

        body.into_result()
    }

    async fn write(&self, batch: &BatchPoints) -> ClientResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = encode_points(&batch.points);
        let params = [
            ("db", batch.database.as_str()),
            ("rp", batch.retention_policy.as_str()),
            ("precision", "ns"),
        ];

        let response = self
            .send(
                self.build_request(Method::POST, "/write")
                    .query(&params)
                    .body(body),
            )
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        debug!(
            "[{}] wrote {} points to {}.{}",
            self.node,
            batch.len(),
            batch.database,
            batch.retention_policy
        );
        Ok(())
    }
}

/// Connector producing [`HttpClient`]s
#[derive(Debug, Default, Clone)]
pub struct HttpConnector;

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, node: &NodeConfig) -> ClientResult<Arc<dyn DbClient>> {
        let client = HttpClient::new(node)?;
        Ok(Arc::new(client))
    }
}
