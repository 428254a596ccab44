use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use vpnprov_core::{AddressPoolEntry, Subscription, VpnConfig, VpnServer};

use super::{AddressPoolStore, ProvisioningStore, StoreError, SubscriptionDirectory};

/// Address rows of one server, ordered numerically by address.
#[derive(Debug, Default)]
struct ServerPool {
    entries: BTreeMap<Ipv4Addr, AddressPoolEntry>,
}

/// In-process store.
///
/// Every server pool sits behind its own async mutex, so a claim on one server
/// is a single-writer critical section while claims on different servers run
/// in parallel.
#[derive(Default)]
pub struct MemoryStore {
    pools: RwLock<HashMap<Uuid, Arc<Mutex<ServerPool>>>>,
    // entry id -> (server id, address)
    entry_index: RwLock<HashMap<Uuid, (Uuid, Ipv4Addr)>>,
    servers: RwLock<HashMap<Uuid, VpnServer>>,
    configs: RwLock<HashMap<Uuid, VpnConfig>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the billing view of a subscription.
    pub async fn put_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription);
    }

    async fn pool(&self, server_id: Uuid) -> Option<Arc<Mutex<ServerPool>>> {
        self.pools.read().await.get(&server_id).cloned()
    }

    async fn pool_or_create(&self, server_id: Uuid) -> Arc<Mutex<ServerPool>> {
        if let Some(pool) = self.pool(server_id).await {
            return pool;
        }
        self.pools
            .write()
            .await
            .entry(server_id)
            .or_default()
            .clone()
    }

    async fn locate(&self, entry_id: Uuid) -> Option<(Arc<Mutex<ServerPool>>, Ipv4Addr)> {
        let (server_id, address) = *self.entry_index.read().await.get(&entry_id)?;
        let pool = self.pool(server_id).await?;
        Some((pool, address))
    }
}

#[async_trait]
impl AddressPoolStore for MemoryStore {
    async fn insert_addresses(
        &self,
        server_id: Uuid,
        addresses: &[Ipv4Addr],
    ) -> Result<usize, StoreError> {
        let pool = self.pool_or_create(server_id).await;
        let mut pool = pool.lock().await;
        let mut created = Vec::new();
        for address in addresses {
            if pool.entries.contains_key(address) {
                continue;
            }
            let entry = AddressPoolEntry::new(server_id, *address);
            created.push((entry.id, *address));
            pool.entries.insert(*address, entry);
        }
        let mut index = self.entry_index.write().await;
        for (entry_id, address) in &created {
            index.insert(*entry_id, (server_id, *address));
        }
        Ok(created.len())
    }

    async fn claim_lowest_free(
        &self,
        server_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<AddressPoolEntry>, StoreError> {
        let Some(pool) = self.pool(server_id).await else {
            return Ok(None);
        };
        let mut pool = pool.lock().await;
        let claimed = pool
            .entries
            .values_mut()
            .find(|entry| !entry.is_allocated)
            .map(|entry| {
                entry.mark_allocated(subscription_id, Utc::now());
                entry.clone()
            });
        Ok(claimed)
    }

    async fn release_entry(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let Some((pool, address)) = self.locate(entry_id).await else {
            return Ok(false);
        };
        let mut pool = pool.lock().await;
        Ok(pool
            .entries
            .get_mut(&address)
            .is_some_and(|entry| entry.mark_released(Utc::now())))
    }

    async fn set_entry_keys(
        &self,
        entry_id: Uuid,
        private_key: &str,
        public_key: &str,
    ) -> Result<bool, StoreError> {
        let Some((pool, address)) = self.locate(entry_id).await else {
            return Ok(false);
        };
        let mut pool = pool.lock().await;
        match pool.entries.get_mut(&address) {
            Some(entry) if entry.is_allocated => {
                entry.private_key = Some(private_key.to_string());
                entry.public_key = Some(public_key.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<AddressPoolEntry>, StoreError> {
        let Some((pool, address)) = self.locate(entry_id).await else {
            return Ok(None);
        };
        let pool = pool.lock().await;
        Ok(pool.entries.get(&address).cloned())
    }

    async fn find_entry(
        &self,
        server_id: Uuid,
        address: Ipv4Addr,
    ) -> Result<Option<AddressPoolEntry>, StoreError> {
        let Some(pool) = self.pool(server_id).await else {
            return Ok(None);
        };
        let pool = pool.lock().await;
        Ok(pool.entries.get(&address).cloned())
    }

    async fn entries_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<AddressPoolEntry>, StoreError> {
        let pools: Vec<_> = self.pools.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for pool in pools {
            let pool = pool.lock().await;
            out.extend(
                pool.entries
                    .values()
                    .filter(|e| e.is_allocated && e.subscription_id == Some(subscription_id))
                    .cloned(),
            );
        }
        Ok(out)
    }

    async fn count_free(&self, server_id: Uuid) -> Result<u64, StoreError> {
        let Some(pool) = self.pool(server_id).await else {
            return Ok(0);
        };
        let pool = pool.lock().await;
        Ok(pool.entries.values().filter(|e| !e.is_allocated).count() as u64)
    }

    async fn count_total(&self, server_id: Uuid) -> Result<u64, StoreError> {
        let Some(pool) = self.pool(server_id).await else {
            return Ok(0);
        };
        Ok(pool.lock().await.entries.len() as u64)
    }
}

#[async_trait]
impl ProvisioningStore for MemoryStore {
    async fn upsert_server(&self, server: &VpnServer) -> Result<(), StoreError> {
        self.servers.write().await.insert(server.id, server.clone());
        Ok(())
    }

    async fn get_server(&self, server_id: Uuid) -> Result<Option<VpnServer>, StoreError> {
        Ok(self.servers.read().await.get(&server_id).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<VpnServer>, StoreError> {
        let mut servers: Vec<_> = self.servers.read().await.values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn set_current_users(
        &self,
        server_id: Uuid,
        current_users: u32,
    ) -> Result<bool, StoreError> {
        let mut servers = self.servers.write().await;
        match servers.get_mut(&server_id) {
            Some(server) => {
                server.current_users = current_users;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_config(&self, config: &VpnConfig) -> Result<(), StoreError> {
        self.configs.write().await.insert(config.id, config.clone());
        Ok(())
    }

    async fn get_config(&self, config_id: Uuid) -> Result<Option<VpnConfig>, StoreError> {
        Ok(self.configs.read().await.get(&config_id).cloned())
    }

    async fn configs_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<VpnConfig>, StoreError> {
        let mut configs: Vec<_> = self
            .configs
            .read()
            .await
            .values()
            .filter(|c| c.subscription_id == subscription_id)
            .cloned()
            .collect();
        configs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(configs)
    }

    async fn count_active_for_server(&self, server_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .configs
            .read()
            .await
            .values()
            .filter(|c| c.server_id == server_id && c.is_active)
            .count() as u64)
    }

    async fn deactivate_config(&self, config_id: Uuid) -> Result<bool, StoreError> {
        let mut configs = self.configs.write().await;
        match configs.get_mut(&config_id) {
            Some(config) if config.is_active => {
                config.is_active = false;
                config.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SubscriptionDirectory for MemoryStore {
    async fn lookup(&self, subscription_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.read().await.get(&subscription_id).cloned())
    }
}
