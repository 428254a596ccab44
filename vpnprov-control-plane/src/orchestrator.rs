//! Generate, rotate and delete workflows for subscriber VPN configs.
//!
//! A generate call walks `Selecting -> Allocating -> KeyGenerating ->
//! AgentRegistering -> Persisting -> Active`. Once an address has been
//! allocated every failure rolls back by releasing it before the error is
//! surfaced. Peer removal during rotation, deletion and teardown is best
//! effort: the outcome is reported, never raised.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpnprov_core::keys::{self, WireGuardKeys};
use vpnprov_core::{
    AddressPoolEntry, ClientConfig, Subscription, SubscriptionStatus, VpnConfig, VpnServer,
};

use crate::agent_client::{AgentClient, AgentRegistry};
use crate::allocator::AddressPoolAllocator;
use crate::config::Config;
use crate::error::ProvisionError;
use crate::store::{ProvisioningStore, SubscriptionDirectory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Selecting,
    Allocating,
    KeyGenerating,
    AgentRegistering,
    Persisting,
    Active,
    RollingBack,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisionStage::Selecting => "selecting",
            ProvisionStage::Allocating => "allocating",
            ProvisionStage::KeyGenerating => "key_generating",
            ProvisionStage::AgentRegistering => "agent_registering",
            ProvisionStage::Persisting => "persisting",
            ProvisionStage::Active => "active",
            ProvisionStage::RollingBack => "rolling_back",
        };
        f.write_str(name)
    }
}

fn enter(subscription_id: Uuid, stage: ProvisionStage) {
    debug!(subscription_id = %subscription_id, stage = %stage, "Provisioning stage");
}

/// What happened to a peer we tried to remove from its agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeerCleanup {
    Removed,
    Failed { error: String },
}

impl PeerCleanup {
    pub fn is_removed(&self) -> bool {
        matches!(self, PeerCleanup::Removed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationOutcome {
    pub previous_address: std::net::Ipv4Addr,
    pub config: VpnConfig,
    pub peer_cleanup: PeerCleanup,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub config_id: Uuid,
    pub peer_cleanup: PeerCleanup,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownOutcome {
    pub deactivated_configs: usize,
    pub released_addresses: usize,
    pub failed_peer_removals: usize,
}

/// Client-side settings stamped into every rendered config.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: u16,
    pub use_preshared_keys: bool,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ProvisionSettings {
    fn from(config: &Config) -> Self {
        Self {
            client_allowed_ips: config.client_allowed_ips.clone(),
            persistent_keepalive: config.persistent_keepalive,
            use_preshared_keys: config.use_preshared_keys,
        }
    }
}

pub struct Provisioner {
    store: Arc<dyn ProvisioningStore>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
    allocator: AddressPoolAllocator,
    agents: Arc<AgentRegistry>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
        allocator: AddressPoolAllocator,
        agents: Arc<AgentRegistry>,
        settings: ProvisionSettings,
    ) -> Self {
        info!(
            use_preshared_keys = settings.use_preshared_keys,
            "Initializing provisioner"
        );
        Self {
            store,
            subscriptions,
            allocator,
            agents,
            settings,
        }
    }

    pub fn allocator(&self) -> &AddressPoolAllocator {
        &self.allocator
    }

    /// Create a new config for a subscription on `server_id`, or on the least
    /// loaded server with free addresses when none is given.
    pub async fn generate(
        &self,
        subscription_id: Uuid,
        server_id: Option<Uuid>,
        user_id: Uuid,
    ) -> Result<VpnConfig, ProvisionError> {
        let subscription = self.owned_subscription(subscription_id, user_id).await?;
        ensure_active(&subscription)?;

        let active = self.active_configs(subscription_id).await?.len();
        if active >= subscription.plan_max_configs as usize {
            return Err(ProvisionError::Conflict(format!(
                "subscription {subscription_id} already has {active} of {} configs",
                subscription.plan_max_configs
            )));
        }

        enter(subscription_id, ProvisionStage::Selecting);
        let server = self.select_server(server_id).await?;
        if self.allocator.available_count(server.id).await? == 0 {
            return Err(ProvisionError::PoolExhausted(format!(
                "no free address on server {}",
                server.name
            )));
        }

        enter(subscription_id, ProvisionStage::Allocating);
        let entry = self.allocator.allocate(server.id, subscription_id).await?;

        match self.provision_entry(&server, &entry, subscription_id).await {
            Ok(config) => {
                if let Err(e) = self.refresh_server_load(server.id).await {
                    warn!(server_id = %server.id, error = %e, "Failed to refresh server load");
                }
                enter(subscription_id, ProvisionStage::Active);
                info!(
                    subscription_id = %subscription_id,
                    server_id = %server.id,
                    config_id = %config.id,
                    address = %config.address,
                    "VPN config generated"
                );
                Ok(config)
            }
            Err(e) => {
                enter(subscription_id, ProvisionStage::RollingBack);
                error!(
                    subscription_id = %subscription_id,
                    server_id = %server.id,
                    address = %entry.address,
                    error = %e,
                    "Provisioning failed, releasing address"
                );
                if let Err(release_err) = self.allocator.release(entry.id).await {
                    error!(
                        entry_id = %entry.id,
                        error = %release_err,
                        "Failed to release address during rollback"
                    );
                }
                Err(e)
            }
        }
    }

    async fn provision_entry(
        &self,
        server: &VpnServer,
        entry: &AddressPoolEntry,
        subscription_id: Uuid,
    ) -> Result<VpnConfig, ProvisionError> {
        enter(subscription_id, ProvisionStage::KeyGenerating);
        let keys = keys::generate_keys(self.settings.use_preshared_keys)?;
        self.allocator.update_keys(entry.id, &keys).await?;

        enter(subscription_id, ProvisionStage::AgentRegistering);
        let agent = self.agents.client_for(server).await?;
        if !agent.health_check().await {
            return Err(ProvisionError::AgentUnavailable(format!(
                "agent for server {} failed its health check",
                server.name
            )));
        }
        let server_public_key = self.server_public_key(server, &agent).await?;
        let peer_ips = [format!("{}/32", entry.address)];
        agent
            .add_peer(&keys.public_key, keys.preshared_key.as_deref(), &peer_ips)
            .await?;

        enter(subscription_id, ProvisionStage::Persisting);
        let config = self.build_config(server, entry, subscription_id, &keys, server_public_key);
        if let Err(e) = self.store.insert_config(&config).await {
            let cleanup = remove_peer(&agent, &keys.public_key).await;
            log_cleanup(server.id, &cleanup);
            return Err(e.into());
        }
        Ok(config)
    }

    fn build_config(
        &self,
        server: &VpnServer,
        entry: &AddressPoolEntry,
        subscription_id: Uuid,
        keys: &WireGuardKeys,
        server_public_key: String,
    ) -> VpnConfig {
        let client = ClientConfig {
            private_key: keys.private_key.clone(),
            address: entry.address,
            dns: server.dns_servers.clone(),
            server_public_key,
            preshared_key: keys.preshared_key.clone(),
            endpoint: server.endpoint.clone(),
            allowed_ips: self.settings.client_allowed_ips.clone(),
            persistent_keepalive: self.settings.persistent_keepalive,
        };
        let now = Utc::now();
        VpnConfig {
            id: Uuid::new_v4(),
            subscription_id,
            server_id: server.id,
            address_entry_id: entry.id,
            address: entry.address,
            private_key: keys.private_key.clone(),
            public_key: keys.public_key.clone(),
            preshared_key: keys.preshared_key.clone(),
            config_text: client.render(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// The server key from inventory, learned from the agent when missing.
    async fn server_public_key(
        &self,
        server: &VpnServer,
        agent: &AgentClient,
    ) -> Result<String, ProvisionError> {
        if !server.public_key.is_empty() {
            return Ok(server.public_key.clone());
        }
        let public_key = agent.get_server_public_key().await?;
        let updated = VpnServer {
            public_key: public_key.clone(),
            ..server.clone()
        };
        self.store.upsert_server(&updated).await?;
        info!(server_id = %server.id, "Learned server public key from agent");
        Ok(public_key)
    }

    async fn select_server(&self, server_id: Option<Uuid>) -> Result<VpnServer, ProvisionError> {
        if let Some(server_id) = server_id {
            let server = self
                .store
                .get_server(server_id)
                .await?
                .ok_or_else(|| ProvisionError::NotFound(format!("server {server_id}")))?;
            if !server.accepts_peers() {
                return Err(ProvisionError::Validation(format!(
                    "server {} is not available",
                    server.name
                )));
            }
            return Ok(server);
        }

        let mut best: Option<VpnServer> = None;
        for server in self.store.list_servers().await? {
            if !server.accepts_peers() || self.allocator.available_count(server.id).await? == 0 {
                continue;
            }
            best = match best {
                Some(current) if !prefer(&server, &current) => Some(current),
                _ => Some(server),
            };
        }
        let server = best.ok_or_else(|| {
            ProvisionError::PoolExhausted("no active server has free addresses".to_string())
        })?;
        debug!(
            server_id = %server.id,
            load = server.load_ratio(),
            priority = server.priority,
            "Selected server"
        );
        Ok(server)
    }

    /// Replace the subscription's most recent active config with a fresh one
    /// on the same server. The old config is retired before the new one is
    /// generated, so a failed generate leaves the subscription without one.
    /// Rotation needs one free address besides the one being replaced.
    pub async fn rotate(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<RotationOutcome, ProvisionError> {
        let subscription = self.owned_subscription(subscription_id, user_id).await?;
        ensure_active(&subscription)?;

        let current = self
            .active_configs(subscription_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ProvisionError::NotFound(format!(
                    "active config for subscription {subscription_id}"
                ))
            })?;

        // Whoever flips the config inactive owns its peer and address.
        if !self.store.deactivate_config(current.id).await? {
            return Err(ProvisionError::NotFound(format!(
                "active config {} (already retired)",
                current.id
            )));
        }
        let peer_cleanup = self
            .cleanup_peer(current.server_id, &current.public_key)
            .await;
        info!(
            subscription_id = %subscription_id,
            config_id = %current.id,
            address = %current.address,
            "Retired config for rotation"
        );

        // The old address is still held here, so the new config lands on a
        // different one. It is returned to the pool whatever generate did.
        let generated = self
            .generate(subscription_id, Some(current.server_id), user_id)
            .await;
        self.allocator.release(current.address_entry_id).await?;
        if let Err(e) = self.refresh_server_load(current.server_id).await {
            warn!(server_id = %current.server_id, error = %e, "Failed to refresh server load");
        }
        let config = generated?;
        Ok(RotationOutcome {
            previous_address: current.address,
            config,
            peer_cleanup,
        })
    }

    pub async fn delete(
        &self,
        subscription_id: Uuid,
        config_id: Uuid,
        user_id: Uuid,
    ) -> Result<DeleteOutcome, ProvisionError> {
        self.owned_subscription(subscription_id, user_id).await?;

        let config = self
            .store
            .get_config(config_id)
            .await?
            .filter(|c| c.subscription_id == subscription_id && c.is_active)
            .ok_or_else(|| ProvisionError::NotFound(format!("config {config_id}")))?;

        if !self.store.deactivate_config(config.id).await? {
            return Err(ProvisionError::NotFound(format!("config {config_id}")));
        }
        let peer_cleanup = self.cleanup_peer(config.server_id, &config.public_key).await;
        self.allocator.release(config.address_entry_id).await?;
        self.refresh_server_load(config.server_id).await?;

        info!(
            subscription_id = %subscription_id,
            config_id = %config.id,
            address = %config.address,
            "VPN config deleted"
        );
        Ok(DeleteOutcome {
            config_id: config.id,
            peer_cleanup,
        })
    }

    /// A config that belongs to one of the user's subscriptions.
    pub async fn get_config(
        &self,
        config_id: Uuid,
        user_id: Uuid,
    ) -> Result<VpnConfig, ProvisionError> {
        let not_found = || ProvisionError::NotFound(format!("config {config_id}"));
        let config = self.store.get_config(config_id).await?.ok_or_else(not_found)?;
        match self.subscriptions.lookup(config.subscription_id).await? {
            Some(subscription) if subscription.user_id == user_id => Ok(config),
            _ => Err(not_found()),
        }
    }

    /// Active configs of a subscription, newest first.
    pub async fn get_subscription_configs(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<VpnConfig>, ProvisionError> {
        self.owned_subscription(subscription_id, user_id).await?;
        self.active_configs(subscription_id).await
    }

    /// Remove every peer and address of a cancelled subscription.
    pub async fn teardown_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<TeardownOutcome, ProvisionError> {
        let mut outcome = TeardownOutcome::default();
        let mut touched = BTreeSet::new();

        for config in self.active_configs(subscription_id).await? {
            if !self.store.deactivate_config(config.id).await? {
                continue;
            }
            outcome.deactivated_configs += 1;
            if !self
                .cleanup_peer(config.server_id, &config.public_key)
                .await
                .is_removed()
            {
                outcome.failed_peer_removals += 1;
            }
            touched.insert(config.server_id);
        }

        outcome.released_addresses = self.allocator.release_by_subscription(subscription_id).await?;
        for server_id in touched {
            self.refresh_server_load(server_id).await?;
        }

        info!(
            subscription_id = %subscription_id,
            deactivated = outcome.deactivated_configs,
            released = outcome.released_addresses,
            failed_peer_removals = outcome.failed_peer_removals,
            "Subscription torn down"
        );
        Ok(outcome)
    }

    /// Recompute `current_users` from the live count of active configs.
    pub async fn refresh_server_load(&self, server_id: Uuid) -> Result<u32, ProvisionError> {
        let active = self.store.count_active_for_server(server_id).await?;
        let current_users = u32::try_from(active).unwrap_or(u32::MAX);
        if !self.store.set_current_users(server_id, current_users).await? {
            return Err(ProvisionError::NotFound(format!("server {server_id}")));
        }
        debug!(server_id = %server_id, current_users, "Server load refreshed");
        Ok(current_users)
    }

    async fn owned_subscription(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
    ) -> Result<Subscription, ProvisionError> {
        let subscription = self
            .subscriptions
            .lookup(subscription_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(format!("subscription {subscription_id}")))?;
        if subscription.user_id != user_id {
            return Err(ProvisionError::Validation(format!(
                "subscription {subscription_id} does not belong to the caller"
            )));
        }
        Ok(subscription)
    }

    async fn active_configs(&self, subscription_id: Uuid) -> Result<Vec<VpnConfig>, ProvisionError> {
        let mut configs = self.store.configs_for_subscription(subscription_id).await?;
        configs.retain(|c| c.is_active);
        Ok(configs)
    }

    async fn cleanup_peer(&self, server_id: Uuid, public_key: &str) -> PeerCleanup {
        let cleanup = match self.store.get_server(server_id).await {
            Ok(Some(server)) => match self.agents.client_for(&server).await {
                Ok(agent) => remove_peer(&agent, public_key).await,
                Err(e) => PeerCleanup::Failed {
                    error: e.to_string(),
                },
            },
            Ok(None) => PeerCleanup::Failed {
                error: format!("server {server_id} not found"),
            },
            Err(e) => PeerCleanup::Failed {
                error: e.to_string(),
            },
        };
        log_cleanup(server_id, &cleanup);
        cleanup
    }
}

async fn remove_peer(agent: &AgentClient, public_key: &str) -> PeerCleanup {
    match agent.remove_peer(public_key).await {
        Ok(()) => PeerCleanup::Removed,
        Err(e) => PeerCleanup::Failed {
            error: e.to_string(),
        },
    }
}

fn log_cleanup(server_id: Uuid, cleanup: &PeerCleanup) {
    if let PeerCleanup::Failed { error } = cleanup {
        warn!(server_id = %server_id, error = %error, "Best-effort peer removal failed");
    }
}

fn ensure_active(subscription: &Subscription) -> Result<(), ProvisionError> {
    if subscription.status != SubscriptionStatus::Active {
        return Err(ProvisionError::Validation(format!(
            "subscription {} is {}",
            subscription.id, subscription.status
        )));
    }
    Ok(())
}

/// Lower load wins; equal load goes to the higher priority.
fn prefer(candidate: &VpnServer, current: &VpnServer) -> bool {
    match candidate.load_ratio().total_cmp(&current.load_ratio()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => candidate.priority > current.priority,
        std::cmp::Ordering::Greater => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnprov_core::ServerStatus;

    fn server(current_users: u32, max_users: u32, priority: i32) -> VpnServer {
        VpnServer {
            id: Uuid::new_v4(),
            name: format!("s-{current_users}"),
            api_url: "https://127.0.0.1:8443".to_string(),
            api_token: "t".to_string(),
            public_key: String::new(),
            endpoint: "vpn.example.net:51820".to_string(),
            dns_servers: vec![],
            subnet: "10.8.0.0/24".to_string(),
            max_users,
            current_users,
            status: ServerStatus::Active,
            priority,
            is_active: true,
        }
    }

    #[test]
    fn prefer_picks_lower_load_then_higher_priority() {
        assert!(prefer(&server(40, 100, 0), &server(90, 100, 0)));
        assert!(!prefer(&server(70, 100, 9), &server(40, 100, 0)));
        assert!(prefer(&server(50, 100, 2), &server(50, 100, 1)));
        assert!(!prefer(&server(50, 100, 1), &server(50, 100, 1)));
    }

    #[test]
    fn peer_cleanup_serializes_with_status_tag() {
        let failed = PeerCleanup::Failed {
            error: "timeout".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"status": "failed", "error": "timeout"})
        );
        assert_eq!(
            serde_json::to_value(PeerCleanup::Removed).unwrap(),
            serde_json::json!({"status": "removed"})
        );
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(ProvisionStage::AgentRegistering.to_string(), "agent_registering");
        assert_eq!(ProvisionStage::RollingBack.to_string(), "rolling_back");
    }
}
