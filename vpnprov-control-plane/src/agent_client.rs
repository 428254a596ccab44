//! HTTP client for the management agent running next to each VPN server.
//!
//! Agents listen on HTTPS with self-signed certificates and expect a bearer
//! token. Peer mutations and commands answer with small JSON envelopes; a
//! `success: false` envelope is a rejection even when the status is 2xx.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpnprov_core::VpnServer;
use vpnprov_core::keys;

/// Whitelisted exec action that prints the interface public key.
pub const GET_PUBLIC_KEY_ACTION: &str = "get_public_key";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("agent rejected request: {0}")]
    Rejected(String),
    #[error("invalid agent response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTimeouts {
    pub health: Duration,
    pub peer: Duration,
    pub command: Duration,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(crate::defaults::AGENT_HEALTH_TIMEOUT_SECS),
            peer: Duration::from_secs(crate::defaults::AGENT_PEER_TIMEOUT_SECS),
            command: Duration::from_secs(crate::defaults::AGENT_COMMAND_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Serialize)]
struct AddPeerRequest<'a> {
    public_key: &'a str,
    allowed_ips: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    preshared_key: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RemovePeerRequest<'a> {
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct PeerResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

/// Result of a whitelisted command on the agent host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(rename = "code", default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    http: Client,
    base_url: String,
    token: String,
    timeouts: AgentTimeouts,
}

impl AgentClient {
    pub fn new(
        base_url: &str,
        token: &str,
        timeouts: AgentTimeouts,
    ) -> Result<Self, AgentError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeouts,
        })
    }

    pub fn for_server(server: &VpnServer, timeouts: AgentTimeouts) -> Result<Self, AgentError> {
        Self::new(&server.api_url, &server.api_token, timeouts)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str, timeout: Duration) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .timeout(timeout)
    }

    /// Probe `GET /health`. Any failure, including a timeout, reads as unhealthy.
    pub async fn health_check(&self) -> bool {
        let response = self
            .request(reqwest::Method::GET, "/health", self.timeouts.health)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(agent = %self.base_url, status = %resp.status(), "Agent health check failed");
                false
            }
            Err(e) => {
                debug!(agent = %self.base_url, error = %e, "Agent unreachable");
                false
            }
        }
    }

    /// Register a client peer on the server interface.
    pub async fn add_peer(
        &self,
        public_key: &str,
        preshared_key: Option<&str>,
        allowed_ips: &[String],
    ) -> Result<(), AgentError> {
        let body = AddPeerRequest {
            public_key,
            allowed_ips: allowed_ips.join(","),
            preshared_key,
        };
        let response = self
            .request(reqwest::Method::POST, "/wg/addpeer", self.timeouts.peer)
            .json(&body)
            .send()
            .await?;
        Self::peer_result(response).await?;
        info!(agent = %self.base_url, public_key, "Peer added");
        Ok(())
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<(), AgentError> {
        let response = self
            .request(reqwest::Method::POST, "/wg/removepeer", self.timeouts.peer)
            .json(&RemovePeerRequest { public_key })
            .send()
            .await?;
        Self::peer_result(response).await?;
        info!(agent = %self.base_url, public_key, "Peer removed");
        Ok(())
    }

    async fn peer_result(response: reqwest::Response) -> Result<(), AgentError> {
        let status = response.status();
        let body = response.text().await?;

        // Failed mutations usually still carry the envelope with the reason.
        let envelope = serde_json::from_str::<PeerResponse>(&body).ok();
        if !status.is_success() {
            let body = envelope
                .and_then(|env| env.error.or(env.stderr))
                .unwrap_or(body);
            return Err(AgentError::Status { status, body });
        }

        let envelope = envelope.ok_or_else(|| {
            AgentError::InvalidResponse(format!("unexpected peer response: {body}"))
        })?;
        if envelope.success {
            Ok(())
        } else {
            Err(AgentError::Rejected(
                envelope
                    .error
                    .or(envelope.stderr)
                    .unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    /// Run a whitelisted action through `POST /exec`.
    pub async fn execute_command(
        &self,
        action: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CommandOutput, AgentError> {
        let mut body = params;
        body.insert("action".to_string(), serde_json::Value::from(action));

        let response = self
            .request(reqwest::Method::POST, "/exec", self.timeouts.command)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(AgentError::Status { status, body });
        }

        let output: CommandOutput = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))?;
        debug!(agent = %self.base_url, action, exit_code = output.exit_code, "Command executed");
        Ok(output)
    }

    /// Fetch the server interface public key and check it is a WireGuard key.
    pub async fn get_server_public_key(&self) -> Result<String, AgentError> {
        let output = self
            .execute_command(GET_PUBLIC_KEY_ACTION, serde_json::Map::new())
            .await?;
        if output.exit_code != 0 {
            return Err(AgentError::Rejected(output.stderr.trim().to_string()));
        }

        let key = output.stdout.trim();
        if !keys::is_valid_key(key) {
            return Err(AgentError::InvalidResponse(format!(
                "not a WireGuard public key: {key:?}"
            )));
        }
        Ok(key.to_string())
    }
}

/// Health of one agent as seen by [`AgentRegistry::health_check_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHealth {
    pub server_id: Uuid,
    pub server_name: String,
    pub healthy: bool,
}

/// One cached client per server, rebuilt when the server's URL or token changes.
pub struct AgentRegistry {
    clients: RwLock<HashMap<Uuid, AgentClient>>,
    timeouts: AgentTimeouts,
}

impl AgentRegistry {
    pub fn new(timeouts: AgentTimeouts) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            timeouts,
        }
    }

    pub async fn client_for(&self, server: &VpnServer) -> Result<AgentClient, AgentError> {
        let expected_url = server.api_url.trim_end_matches('/');
        if let Some(client) = self.clients.read().await.get(&server.id) {
            if client.base_url == expected_url && client.token == server.api_token {
                return Ok(client.clone());
            }
        }

        let client = AgentClient::for_server(server, self.timeouts)?;
        self.clients.write().await.insert(server.id, client.clone());
        debug!(server_id = %server.id, agent = %client.base_url, "Agent client created");
        Ok(client)
    }

    /// Drop the cached client of a server.
    pub async fn forget(&self, server_id: Uuid) -> bool {
        self.clients.write().await.remove(&server_id).is_some()
    }

    /// Probe every active server concurrently.
    pub async fn health_check_all(&self, servers: &[VpnServer]) -> Vec<AgentHealth> {
        let probes = servers.iter().filter(|s| s.is_active).map(|server| async move {
            let healthy = match self.client_for(server).await {
                Ok(client) => client.health_check().await,
                Err(e) => {
                    warn!(server_id = %server.id, error = %e, "Could not build agent client");
                    false
                }
            };
            AgentHealth {
                server_id: server.id,
                server_name: server.name.clone(),
                healthy,
            }
        });
        join_all(probes).await
    }
}
