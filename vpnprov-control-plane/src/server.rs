use std::fs;
use std::sync::Arc;

use tracing::{error, info, warn};
use vpnprov_core::VpnServer;

use crate::agent_client::AgentRegistry;
use crate::allocator::AddressPoolAllocator;
use crate::config::Config;
use crate::orchestrator::{ProvisionSettings, Provisioner};
use crate::rest_server::{RestServer, RestServerConfig};
use crate::store::{ProvisioningStore, RedisStore};

/// Read the static server inventory.
pub fn load_servers(path: &str) -> Result<Vec<VpnServer>, Box<dyn std::error::Error>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read servers file {}: {}", path, e))?;
    let servers: Vec<VpnServer> = serde_json::from_str(&raw)
        .map_err(|e| format!("Failed to parse servers file {}: {}", path, e))?;
    Ok(servers)
}

/// Control plane startup logic
#[derive(Debug)]
pub struct ControlPlaneServer {
    config: Config,
}

impl ControlPlaneServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Wire up storage, pools and agents, then serve the REST API
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!(
            bind_address = %self.config.bind_address,
            "Starting VPN provisioning control plane"
        );

        let store = Arc::new(RedisStore::new(&self.config.redis_url).await.map_err(|e| {
            format!(
                "Failed to connect to Redis at {}: {}",
                self.config.redis_url, e
            )
        })?);

        let allocator = AddressPoolAllocator::new(store.clone());
        let servers = load_servers(&self.config.servers_file)?;
        for server in &servers {
            store.upsert_server(server).await?;
            let created = allocator.initialize_pool(server.id, &server.subnet).await?;
            info!(
                server_id = %server.id,
                name = %server.name,
                subnet = %server.subnet,
                created,
                "Server registered"
            );
        }

        let agents = Arc::new(AgentRegistry::new(self.config.agent_timeouts()));
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            store.clone(),
            allocator,
            agents.clone(),
            ProvisionSettings::from(&self.config),
        ));

        for server in &servers {
            if let Err(e) = provisioner.refresh_server_load(server.id).await {
                warn!(server_id = %server.id, error = %e, "Failed to refresh server load");
            }
        }

        let report = agents.health_check_all(&servers).await;
        let healthy = report.iter().filter(|h| h.healthy).count();
        for health in report.iter().filter(|h| !h.healthy) {
            warn!(
                server_id = %health.server_id,
                name = %health.server_name,
                "Agent is not healthy"
            );
        }
        info!(healthy, total = report.len(), "Agent health check completed");

        let rest_server = RestServer::new(
            RestServerConfig {
                listen_addr: self.config.bind_address,
                jwt_public_key_path: self.config.jwt_public_key_path.clone(),
            },
            provisioner,
        );

        match rest_server.run().await {
            Ok(()) => info!("Server shut down gracefully"),
            Err(e) => {
                error!(
                    error = %e,
                    bind_address = %self.config.bind_address,
                    "Server failed to start or encountered error"
                );
                return Err(e);
            }
        }

        info!("VPN provisioning control plane stopped");
        Ok(())
    }

    /// Initialize tracing/logging
    pub fn init_logging() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "vpnprov_control_plane=info,tower_http=warn".into()),
            )
            .init();
        info!("Logging initialized");
    }
}

/// Builder pattern for creating and configuring the server
pub struct ControlPlaneServerBuilder {
    config: Option<Config>,
}

impl ControlPlaneServerBuilder {
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<ControlPlaneServer, Box<dyn std::error::Error>> {
        let config = self.config.ok_or("Configuration is required")?;
        config.validate()?;
        Ok(ControlPlaneServer::new(config))
    }
}

impl Default for ControlPlaneServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = ControlPlaneServer::new(Config::default());
        assert_eq!(server.config.bind_address.port(), 8080);
    }

    #[test]
    fn test_server_builder_missing_config() {
        let result = ControlPlaneServerBuilder::new().build();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Configuration is required")
        );
    }

    #[test]
    fn test_load_servers_reports_missing_file() {
        let err = load_servers("/nonexistent/servers.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read servers file"));
    }

    #[test]
    fn test_servers_file_defaults() {
        let raw = r#"[{
            "id": "6f1c0f43-8f1e-4c39-9d2c-3c5d0f7d8a10",
            "name": "fra-1",
            "api_url": "https://10.0.0.5:8443",
            "api_token": "secret",
            "endpoint": "fra-1.vpn.example.net:51820",
            "subnet": "10.8.0.0/24",
            "max_users": 250,
            "status": "active"
        }]"#;
        let servers: Vec<VpnServer> = serde_json::from_str(raw).unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].is_active);
        assert!(servers[0].public_key.is_empty());
        assert_eq!(servers[0].current_users, 0);
    }
}
