#![allow(dead_code)]
// Shared fixtures: an in-memory store, mock agents and seeded servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;
use vpnprov_control_plane::store::{ProvisioningStore, StoreError};
use vpnprov_control_plane::{
    AddressPoolAllocator, AgentRegistry, AgentTimeouts, MemoryStore, ProvisionSettings,
    Provisioner,
};
use vpnprov_core::{ServerStatus, Subscription, SubscriptionStatus, VpnConfig, VpnServer, keys};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AGENT_TOKEN: &str = "agent-token";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub allocator: AddressPoolAllocator,
    pub provisioner: Arc<Provisioner>,
}

fn timeouts() -> AgentTimeouts {
    AgentTimeouts {
        health: std::time::Duration::from_secs(2),
        peer: std::time::Duration::from_secs(2),
        command: std::time::Duration::from_secs(2),
    }
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    build_harness(store.clone(), store)
}

/// Like [`harness`], but server and config records go through `FlakyStore`.
pub fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    (build_harness(store, flaky.clone()), flaky)
}

fn build_harness(store: Arc<MemoryStore>, records: Arc<dyn ProvisioningStore>) -> Harness {
    let allocator = AddressPoolAllocator::new(store.clone());
    let provisioner = Arc::new(Provisioner::new(
        records,
        store.clone(),
        allocator.clone(),
        Arc::new(AgentRegistry::new(timeouts())),
        ProvisionSettings::default(),
    ));
    Harness {
        store,
        allocator,
        provisioner,
    }
}

/// Wraps `MemoryStore` with switchable failures.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_inserts: AtomicBool,
    retire_first: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_inserts: AtomicBool::new(false),
            retire_first: AtomicBool::new(false),
        }
    }

    /// Make every `insert_config` fail.
    pub fn fail_inserts(&self) {
        self.fail_inserts.store(true, Ordering::SeqCst);
    }

    /// Make the next `deactivate_config` find its config already retired by
    /// somebody else.
    pub fn retire_before_next_deactivate(&self) {
        self.retire_first.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProvisioningStore for FlakyStore {
    async fn upsert_server(&self, server: &VpnServer) -> Result<(), StoreError> {
        self.inner.upsert_server(server).await
    }

    async fn get_server(&self, server_id: Uuid) -> Result<Option<VpnServer>, StoreError> {
        self.inner.get_server(server_id).await
    }

    async fn list_servers(&self) -> Result<Vec<VpnServer>, StoreError> {
        self.inner.list_servers().await
    }

    async fn set_current_users(
        &self,
        server_id: Uuid,
        current_users: u32,
    ) -> Result<bool, StoreError> {
        self.inner.set_current_users(server_id, current_users).await
    }

    async fn insert_config(&self, config: &VpnConfig) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection reset",
            ))));
        }
        self.inner.insert_config(config).await
    }

    async fn get_config(&self, config_id: Uuid) -> Result<Option<VpnConfig>, StoreError> {
        self.inner.get_config(config_id).await
    }

    async fn configs_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<VpnConfig>, StoreError> {
        self.inner.configs_for_subscription(subscription_id).await
    }

    async fn count_active_for_server(&self, server_id: Uuid) -> Result<u64, StoreError> {
        self.inner.count_active_for_server(server_id).await
    }

    async fn deactivate_config(&self, config_id: Uuid) -> Result<bool, StoreError> {
        if self.retire_first.swap(false, Ordering::SeqCst) {
            self.inner.deactivate_config(config_id).await?;
        }
        self.inner.deactivate_config(config_id).await
    }
}

pub fn server_record(name: &str, api_url: &str, subnet: &str) -> VpnServer {
    VpnServer {
        id: Uuid::new_v4(),
        name: name.to_string(),
        api_url: api_url.to_string(),
        api_token: AGENT_TOKEN.to_string(),
        public_key: keys::generate_key_pair().unwrap().public_key,
        endpoint: format!("{name}.vpn.example.net:51820"),
        dns_servers: vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()],
        subnet: subnet.to_string(),
        max_users: 100,
        current_users: 0,
        status: ServerStatus::Active,
        priority: 0,
        is_active: true,
    }
}

impl Harness {
    /// Store the server and carve out its pool.
    pub async fn add_server(&self, server: &VpnServer) {
        self.store.upsert_server(server).await.unwrap();
        self.allocator
            .initialize_pool(server.id, &server.subnet)
            .await
            .unwrap();
    }

    /// An active subscription and the user that owns it.
    pub async fn subscription(&self, max_configs: u32) -> (Uuid, Uuid) {
        self.subscription_with_status(max_configs, SubscriptionStatus::Active)
            .await
    }

    pub async fn subscription_with_status(
        &self,
        max_configs: u32,
        status: SubscriptionStatus,
    ) -> (Uuid, Uuid) {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status,
            plan_max_configs: max_configs,
        };
        let ids = (subscription.id, subscription.user_id);
        self.store.put_subscription(subscription).await;
        ids
    }
}

pub async fn mount_health(agent: &MockServer, status: u16) {
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(status).set_body_json(json!({"status": "ok", "version": "1.4.0"})),
        )
        .mount(agent)
        .await;
}

pub async fn mount_peer_endpoint(agent: &MockServer, endpoint: &str, status: u16, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(agent)
        .await;
}

/// An agent that accepts every peer mutation.
pub async fn healthy_agent() -> MockServer {
    let agent = MockServer::start().await;
    mount_health(&agent, 200).await;
    mount_peer_endpoint(&agent, "/wg/addpeer", 200, json!({"success": true})).await;
    mount_peer_endpoint(&agent, "/wg/removepeer", 200, json!({"success": true})).await;
    agent
}
