//! Persistence seams for the provisioning core.
//!
//! The allocator only talks to [`AddressPoolStore`]; the orchestrator talks to
//! [`ProvisioningStore`] for servers and configs and to
//! [`SubscriptionDirectory`] for the billing view of a subscription. Both
//! [`MemoryStore`] and [`RedisStore`] implement all three.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use uuid::Uuid;
use vpnprov_core::{AddressPoolEntry, Subscription, VpnConfig, VpnServer};

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Address table with an atomic "take the lowest free row" primitive.
#[async_trait]
pub trait AddressPoolStore: Send + Sync {
    /// Insert free entries for the given addresses, skipping ones the server
    /// already owns. Returns how many were created.
    async fn insert_addresses(
        &self,
        server_id: Uuid,
        addresses: &[Ipv4Addr],
    ) -> Result<usize, StoreError>;

    /// Atomically pick the numerically lowest free entry of `server_id`, mark
    /// it allocated to `subscription_id` and return it. Concurrent callers
    /// never observe the same entry as free.
    async fn claim_lowest_free(
        &self,
        server_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<AddressPoolEntry>, StoreError>;

    /// Mark an entry free. Returns false when it was already free or unknown.
    async fn release_entry(&self, entry_id: Uuid) -> Result<bool, StoreError>;

    async fn set_entry_keys(
        &self,
        entry_id: Uuid,
        private_key: &str,
        public_key: &str,
    ) -> Result<bool, StoreError>;

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<AddressPoolEntry>, StoreError>;

    async fn find_entry(
        &self,
        server_id: Uuid,
        address: Ipv4Addr,
    ) -> Result<Option<AddressPoolEntry>, StoreError>;

    /// Entries currently allocated to a subscription.
    async fn entries_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<AddressPoolEntry>, StoreError>;

    async fn count_free(&self, server_id: Uuid) -> Result<u64, StoreError>;

    async fn count_total(&self, server_id: Uuid) -> Result<u64, StoreError>;
}

/// Server inventory and peer config records.
#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    async fn upsert_server(&self, server: &VpnServer) -> Result<(), StoreError>;

    async fn get_server(&self, server_id: Uuid) -> Result<Option<VpnServer>, StoreError>;

    async fn list_servers(&self) -> Result<Vec<VpnServer>, StoreError>;

    async fn set_current_users(&self, server_id: Uuid, current_users: u32)
    -> Result<bool, StoreError>;

    async fn insert_config(&self, config: &VpnConfig) -> Result<(), StoreError>;

    async fn get_config(&self, config_id: Uuid) -> Result<Option<VpnConfig>, StoreError>;

    /// All configs of a subscription, active or not, newest first.
    async fn configs_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<VpnConfig>, StoreError>;

    async fn count_active_for_server(&self, server_id: Uuid) -> Result<u64, StoreError>;

    /// Flip a config to inactive. Returns false when it already was.
    async fn deactivate_config(&self, config_id: Uuid) -> Result<bool, StoreError>;
}

/// Read-only view of subscriptions owned by the billing side.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn lookup(&self, subscription_id: Uuid) -> Result<Option<Subscription>, StoreError>;
}
