use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, info};
use uuid::Uuid;
use vpnprov_core::{AddressPoolEntry, PoolStats, WireGuardKeys};

use crate::error::ProvisionError;
use crate::store::AddressPoolStore;

/// Only /24 pools are carved up.
pub const POOL_PREFIX_LEN: u8 = 24;

/// Host octets never handed to clients: network, server tunnel address, broadcast.
const RESERVED_HOST_OCTETS: [u8; 3] = [0, 1, 255];

/// Hands out tunnel addresses from per-server pools.
#[derive(Clone)]
pub struct AddressPoolAllocator {
    store: Arc<dyn AddressPoolStore>,
}

impl AddressPoolAllocator {
    pub fn new(store: Arc<dyn AddressPoolStore>) -> Self {
        Self { store }
    }

    /// Claim the lowest free address of `server_id` for `subscription_id`.
    pub async fn allocate(
        &self,
        server_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<AddressPoolEntry, ProvisionError> {
        match self
            .store
            .claim_lowest_free(server_id, subscription_id)
            .await?
        {
            Some(entry) => {
                info!(
                    server_id = %server_id,
                    subscription_id = %subscription_id,
                    address = %entry.address,
                    "Allocated address"
                );
                Ok(entry)
            }
            None => Err(ProvisionError::PoolExhausted(format!(
                "no free address on server {server_id}"
            ))),
        }
    }

    /// Return an entry to its pool. Releasing a free entry is a no-op.
    pub async fn release(&self, entry_id: Uuid) -> Result<(), ProvisionError> {
        if self.store.release_entry(entry_id).await? {
            info!(entry_id = %entry_id, "Released address");
        } else {
            debug!(entry_id = %entry_id, "Release skipped, entry already free");
        }
        Ok(())
    }

    pub async fn release_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<usize, ProvisionError> {
        let entries = self.store.entries_for_subscription(subscription_id).await?;
        let mut released = 0;
        for entry in entries {
            if self.store.release_entry(entry.id).await? {
                released += 1;
            }
        }
        info!(
            subscription_id = %subscription_id,
            released,
            "Released subscription addresses"
        );
        Ok(released)
    }

    pub async fn available_count(&self, server_id: Uuid) -> Result<u64, ProvisionError> {
        Ok(self.store.count_free(server_id).await?)
    }

    /// True when `address` is part of the server's pool and currently free.
    pub async fn is_available(
        &self,
        server_id: Uuid,
        address: Ipv4Addr,
    ) -> Result<bool, ProvisionError> {
        Ok(self
            .store
            .find_entry(server_id, address)
            .await?
            .is_some_and(|entry| !entry.is_allocated))
    }

    pub async fn pool_stats(&self, server_id: Uuid) -> Result<PoolStats, ProvisionError> {
        let total = self.store.count_total(server_id).await?;
        let available = self.store.count_free(server_id).await?;
        Ok(PoolStats::from_counts(total, available))
    }

    /// Create pool rows for every client address of a /24. Addresses the
    /// server already owns are left untouched, so this is safe to re-run.
    pub async fn initialize_pool(
        &self,
        server_id: Uuid,
        subnet_cidr: &str,
    ) -> Result<usize, ProvisionError> {
        let addresses = pool_addresses(subnet_cidr)?;
        let created = self.store.insert_addresses(server_id, &addresses).await?;
        info!(
            server_id = %server_id,
            subnet = %subnet_cidr,
            created,
            "Initialized address pool"
        );
        Ok(created)
    }

    /// Attach client key material to an allocated entry.
    pub async fn update_keys(
        &self,
        entry_id: Uuid,
        keys: &WireGuardKeys,
    ) -> Result<(), ProvisionError> {
        if self
            .store
            .set_entry_keys(entry_id, &keys.private_key, &keys.public_key)
            .await?
        {
            debug!(entry_id = %entry_id, "Attached keys to address entry");
            Ok(())
        } else {
            Err(ProvisionError::NotFound(format!(
                "allocated address entry {entry_id}"
            )))
        }
    }
}

/// Client addresses of a /24, lowest first.
pub fn pool_addresses(subnet_cidr: &str) -> Result<Vec<Ipv4Addr>, ProvisionError> {
    let net: Ipv4Net = subnet_cidr
        .trim()
        .parse()
        .map_err(|_| ProvisionError::UnsupportedSubnet(subnet_cidr.to_string()))?;
    if net.prefix_len() != POOL_PREFIX_LEN {
        return Err(ProvisionError::UnsupportedSubnet(format!(
            "{subnet_cidr}: only /{POOL_PREFIX_LEN} pools are supported"
        )));
    }

    let [a, b, c, _] = net.network().octets();
    Ok((0..=u8::MAX)
        .filter(|host| !RESERVED_HOST_OCTETS.contains(host))
        .map(|host| Ipv4Addr::new(a, b, c, host))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::store::MemoryStore;

    fn allocator() -> AddressPoolAllocator {
        AddressPoolAllocator::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn pool_addresses_skip_reserved_hosts() {
        let addresses = pool_addresses("10.8.0.0/24").expect("pool");
        assert_eq!(addresses.len(), 253);
        assert_eq!(addresses.first(), Some(&Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(addresses.last(), Some(&Ipv4Addr::new(10, 8, 0, 254)));
    }

    #[test]
    fn pool_addresses_normalize_host_bits() {
        let addresses = pool_addresses("10.8.0.77/24").expect("pool");
        assert_eq!(addresses[0], Ipv4Addr::new(10, 8, 0, 2));
    }

    #[test]
    fn other_prefixes_are_unsupported() {
        for cidr in ["10.8.0.0/16", "10.8.0.0/25", "not-a-subnet"] {
            assert!(matches!(
                pool_addresses(cidr),
                Err(ProvisionError::UnsupportedSubnet(_))
            ));
        }
    }

    #[tokio::test]
    async fn initialize_pool_is_idempotent() {
        let allocator = allocator();
        let server_id = Uuid::new_v4();
        assert_eq!(
            allocator
                .initialize_pool(server_id, "10.8.0.0/24")
                .await
                .unwrap(),
            253
        );
        assert_eq!(
            allocator
                .initialize_pool(server_id, "10.8.0.0/24")
                .await
                .unwrap(),
            0
        );
        let stats = allocator.pool_stats(server_id).await.unwrap();
        assert_eq!(stats.total, 253);
        assert_eq!(stats.available, 253);
    }

    #[tokio::test]
    async fn allocates_lowest_free_address_first() {
        let allocator = allocator();
        let server_id = Uuid::new_v4();
        allocator
            .initialize_pool(server_id, "10.9.0.0/24")
            .await
            .unwrap();

        let first = allocator.allocate(server_id, Uuid::new_v4()).await.unwrap();
        let second = allocator.allocate(server_id, Uuid::new_v4()).await.unwrap();
        assert_eq!(first.address, Ipv4Addr::new(10, 9, 0, 2));
        assert_eq!(second.address, Ipv4Addr::new(10, 9, 0, 3));
        assert!(first.allocated_at.is_some());

        allocator.release(first.id).await.unwrap();
        let third = allocator.allocate(server_id, Uuid::new_v4()).await.unwrap();
        assert_eq!(third.address, Ipv4Addr::new(10, 9, 0, 2));
    }

    #[tokio::test]
    async fn release_of_free_entry_is_noop() {
        let allocator = allocator();
        let server_id = Uuid::new_v4();
        allocator
            .initialize_pool(server_id, "10.10.0.0/24")
            .await
            .unwrap();
        let entry = allocator.allocate(server_id, Uuid::new_v4()).await.unwrap();

        allocator.release(entry.id).await.unwrap();
        let after_first = allocator.available_count(server_id).await.unwrap();
        allocator.release(entry.id).await.unwrap();
        assert_eq!(
            allocator.available_count(server_id).await.unwrap(),
            after_first
        );
        assert!(
            allocator
                .is_available(server_id, entry.address)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn release_by_subscription_frees_every_owned_entry() {
        let allocator = allocator();
        let server_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();
        allocator
            .initialize_pool(server_id, "10.11.0.0/24")
            .await
            .unwrap();
        allocator.allocate(server_id, subscription_id).await.unwrap();
        allocator.allocate(server_id, subscription_id).await.unwrap();
        allocator.allocate(server_id, Uuid::new_v4()).await.unwrap();

        assert_eq!(
            allocator
                .release_by_subscription(subscription_id)
                .await
                .unwrap(),
            2
        );
        assert_eq!(allocator.available_count(server_id).await.unwrap(), 252);
    }

    #[tokio::test]
    async fn update_keys_requires_known_entry() {
        let allocator = allocator();
        let keys = vpnprov_core::keys::generate_keys(false).unwrap();
        assert!(matches!(
            allocator.update_keys(Uuid::new_v4(), &keys).await,
            Err(ProvisionError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_never_share_an_address() {
        let store = Arc::new(MemoryStore::new());
        let allocator = AddressPoolAllocator::new(store.clone());
        let server_id = Uuid::new_v4();

        // Shrink the pool to three free entries.
        let addresses = [
            Ipv4Addr::new(10, 12, 0, 2),
            Ipv4Addr::new(10, 12, 0, 3),
            Ipv4Addr::new(10, 12, 0, 4),
        ];
        store.insert_addresses(server_id, &addresses).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..addresses.len() + 1 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator.allocate(server_id, Uuid::new_v4()).await
            }));
        }

        let mut granted = HashSet::new();
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(entry) => assert!(granted.insert(entry.address)),
                Err(ProvisionError::PoolExhausted(_)) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(granted.len(), addresses.len());
        assert_eq!(exhausted, 1);
        assert_eq!(allocator.available_count(server_id).await.unwrap(), 0);
    }
}
