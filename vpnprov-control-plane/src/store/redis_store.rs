//! Redis-backed store.
//!
//! Key layout:
//! - `vpnprov:pool:entry:{entry_id}` JSON [`AddressPoolEntry`]
//! - `vpnprov:pool:{server_id}:index` hash address -> entry id
//! - `vpnprov:pool:{server_id}:free` zset of free entry ids scored by the
//!   numeric address
//! - `vpnprov:subscription:{id}:entries` set of allocated entry ids
//! - `vpnprov:servers` set of server ids, `vpnprov:server:{id}` JSON server
//! - `vpnprov:config:{id}` JSON config, indexed by
//!   `vpnprov:subscription:{id}:configs` and `vpnprov:server:{id}:configs`
//! - `vpnprov:subscription:{id}` hash written by billing
//!   (`user_id`, `status`, `plan_max_configs`)
//!
//! Claiming and releasing run as Lua scripts, which Redis executes without
//! interleaving any other command; that is what gives allocation its
//! lock-and-skip semantics.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;
use vpnprov_core::{AddressPoolEntry, Subscription, SubscriptionStatus, VpnConfig, VpnServer};

use super::{AddressPoolStore, ProvisioningStore, StoreError, SubscriptionDirectory};

const KEY_PREFIX: &str = "vpnprov:";
const ENTRY_KEY_PREFIX: &str = "vpnprov:pool:entry:";
const SERVERS_KEY: &str = "vpnprov:servers";

fn entry_key(entry_id: Uuid) -> String {
    format!("{ENTRY_KEY_PREFIX}{entry_id}")
}

fn pool_index_key(server_id: Uuid) -> String {
    format!("{KEY_PREFIX}pool:{server_id}:index")
}

fn pool_free_key(server_id: Uuid) -> String {
    format!("{KEY_PREFIX}pool:{server_id}:free")
}

fn subscription_entries_key(subscription_id: Uuid) -> String {
    format!("{KEY_PREFIX}subscription:{subscription_id}:entries")
}

fn subscription_configs_key(subscription_id: Uuid) -> String {
    format!("{KEY_PREFIX}subscription:{subscription_id}:configs")
}

fn subscription_key(subscription_id: Uuid) -> String {
    format!("{KEY_PREFIX}subscription:{subscription_id}")
}

fn server_key(server_id: Uuid) -> String {
    format!("{KEY_PREFIX}server:{server_id}")
}

fn server_configs_key(server_id: Uuid) -> String {
    format!("{KEY_PREFIX}server:{server_id}:configs")
}

fn config_key(config_id: Uuid) -> String {
    format!("{KEY_PREFIX}config:{config_id}")
}

/// Sorted-set score of an address; numeric order equals address order.
fn address_score(address: Ipv4Addr) -> u32 {
    u32::from(address)
}

fn subscription_from_map(
    id: Uuid,
    mut m: HashMap<String, String>,
) -> Result<Option<Subscription>, StoreError> {
    if m.is_empty() {
        return Ok(None);
    }
    let key = subscription_key(id);
    let corrupt = |reason: &str| StoreError::Corrupt {
        key: key.clone(),
        reason: reason.to_string(),
    };

    let user_id = m
        .remove("user_id")
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or_else(|| corrupt("missing or invalid user_id"))?;
    let status = m
        .remove("status")
        .and_then(|s| s.parse::<SubscriptionStatus>().ok())
        .ok_or_else(|| corrupt("missing or invalid status"))?;
    let plan_max_configs = m
        .remove("plan_max_configs")
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(|| corrupt("missing or invalid plan_max_configs"))?;

    Ok(Some(Subscription {
        id,
        user_id,
        status,
        plan_max_configs,
    }))
}

const CLAIM_SCRIPT: &str = r#"
    local free_key = KEYS[1]
    local entry_prefix = ARGV[1]
    local subscription_id = ARGV[2]
    local now = ARGV[3]
    local subscription_entries = ARGV[4]

    local popped = redis.call('ZPOPMIN', free_key)
    if #popped == 0 then
        return false
    end

    local entry_id = popped[1]
    local entry_key = entry_prefix .. entry_id
    local raw = redis.call('GET', entry_key)
    if not raw then
        return redis.error_reply('pool entry missing: ' .. entry_id)
    end

    local entry = cjson.decode(raw)
    entry['is_allocated'] = true
    entry['subscription_id'] = subscription_id
    entry['allocated_at'] = now
    local encoded = cjson.encode(entry)
    redis.call('SET', entry_key, encoded)
    redis.call('SADD', subscription_entries, entry_id)
    return encoded
"#;

const RELEASE_SCRIPT: &str = r#"
    local entry_key = KEYS[1]
    local now = ARGV[1]
    local key_prefix = ARGV[2]

    local raw = redis.call('GET', entry_key)
    if not raw then
        return 0
    end

    local entry = cjson.decode(raw)
    if entry['is_allocated'] ~= true then
        return 0
    end

    local subscription_id = entry['subscription_id']
    entry['is_allocated'] = false
    entry['subscription_id'] = cjson.null
    entry['released_at'] = now
    redis.call('SET', entry_key, cjson.encode(entry))

    local a, b, c, d = string.match(entry['address'], '(%d+)%.(%d+)%.(%d+)%.(%d+)')
    local score = ((tonumber(a) * 256 + tonumber(b)) * 256 + tonumber(c)) * 256 + tonumber(d)
    redis.call('ZADD', key_prefix .. 'pool:' .. entry['server_id'] .. ':free', score, entry['id'])

    if type(subscription_id) == 'string' then
        redis.call('SREM', key_prefix .. 'subscription:' .. subscription_id .. ':entries', entry['id'])
    end
    return 1
"#;

const SET_KEYS_SCRIPT: &str = r#"
    local entry_key = KEYS[1]
    local raw = redis.call('GET', entry_key)
    if not raw then
        return 0
    end

    local entry = cjson.decode(raw)
    if entry['is_allocated'] ~= true then
        return 0
    end

    entry['private_key'] = ARGV[1]
    entry['public_key'] = ARGV[2]
    redis.call('SET', entry_key, cjson.encode(entry))
    return 1
"#;

const DEACTIVATE_SCRIPT: &str = r#"
    local config_key = KEYS[1]
    local raw = redis.call('GET', config_key)
    if not raw then
        return 0
    end

    local config = cjson.decode(raw)
    if config['is_active'] ~= true then
        return 0
    end

    config['is_active'] = false
    config['updated_at'] = ARGV[1]
    redis.call('SET', config_key, cjson.encode(config))
    return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    claim_script: Script,
    release_script: Script,
    set_keys_script: Script,
    deactivate_script: Script,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            claim_script: Script::new(CLAIM_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            set_keys_script: Script::new(SET_KEYS_SCRIPT),
            deactivate_script: Script::new(DEACTIVATE_SCRIPT),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        raw.map(|payload| serde_json::from_str(&payload))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Bulk-load JSON records, skipping ids whose record vanished.
    async fn mget_json<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<T>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        let mut out = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            match value {
                Some(payload) => out.push(serde_json::from_str(&payload)?),
                None => warn!(key = %key, "Indexed record missing; skipping"),
            }
        }
        Ok(out)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }
}

#[async_trait]
impl AddressPoolStore for RedisStore {
    async fn insert_addresses(
        &self,
        server_id: Uuid,
        addresses: &[Ipv4Addr],
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let index_key = pool_index_key(server_id);
        let free_key = pool_free_key(server_id);
        let mut created = 0;

        for address in addresses {
            let entry = AddressPoolEntry::new(server_id, *address);
            // Claim the (server, address) slot first; losers skip.
            let claimed: i64 = redis::cmd("HSETNX")
                .arg(&index_key)
                .arg(address.to_string())
                .arg(entry.id.to_string())
                .query_async(&mut conn)
                .await?;
            if claimed == 0 {
                continue;
            }

            // Record before free-list membership so a claim never pops an
            // id without a body.
            let payload = serde_json::to_string(&entry)?;
            let _: () = redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(entry_key(entry.id))
                .arg(payload)
                .ignore()
                .cmd("ZADD")
                .arg(&free_key)
                .arg(address_score(*address))
                .arg(entry.id.to_string())
                .ignore()
                .query_async(&mut conn)
                .await?;
            created += 1;
        }

        debug!(server_id = %server_id, created, "Pool addresses inserted");
        Ok(created)
    }

    async fn claim_lowest_free(
        &self,
        server_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<AddressPoolEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = self
            .claim_script
            .key(pool_free_key(server_id))
            .arg(ENTRY_KEY_PREFIX)
            .arg(subscription_id.to_string())
            .arg(Utc::now().to_rfc3339())
            .arg(subscription_entries_key(subscription_id))
            .invoke_async(&mut conn)
            .await?;
        claimed
            .map(|payload| serde_json::from_str(&payload))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn release_entry(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_script
            .key(entry_key(entry_id))
            .arg(Utc::now().to_rfc3339())
            .arg(KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn set_entry_keys(
        &self,
        entry_id: Uuid,
        private_key: &str,
        public_key: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .set_keys_script
            .key(entry_key(entry_id))
            .arg(private_key)
            .arg(public_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<AddressPoolEntry>, StoreError> {
        self.get_json(&entry_key(entry_id)).await
    }

    async fn find_entry(
        &self,
        server_id: Uuid,
        address: Ipv4Addr,
    ) -> Result<Option<AddressPoolEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let entry_id: Option<String> = redis::cmd("HGET")
            .arg(pool_index_key(server_id))
            .arg(address.to_string())
            .query_async(&mut conn)
            .await?;
        match entry_id {
            Some(id) => self.get_json(&format!("{ENTRY_KEY_PREFIX}{id}")).await,
            None => Ok(None),
        }
    }

    async fn entries_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<AddressPoolEntry>, StoreError> {
        let keys: Vec<String> = self
            .members(&subscription_entries_key(subscription_id))
            .await?
            .into_iter()
            .map(|id| format!("{ENTRY_KEY_PREFIX}{id}"))
            .collect();
        let entries: Vec<AddressPoolEntry> = self.mget_json(&keys).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.is_allocated && e.subscription_id == Some(subscription_id))
            .collect())
    }

    async fn count_free(&self, server_id: Uuid) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD")
            .arg(pool_free_key(server_id))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count_total(&self, server_id: Uuid) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("HLEN")
            .arg(pool_index_key(server_id))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ProvisioningStore for RedisStore {
    async fn upsert_server(&self, server: &VpnServer) -> Result<(), StoreError> {
        self.set_json(&server_key(server.id), server).await?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(SERVERS_KEY)
            .arg(server.id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_server(&self, server_id: Uuid) -> Result<Option<VpnServer>, StoreError> {
        self.get_json(&server_key(server_id)).await
    }

    async fn list_servers(&self) -> Result<Vec<VpnServer>, StoreError> {
        let mut ids = self.members(SERVERS_KEY).await?;
        ids.sort();
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{KEY_PREFIX}server:{id}"))
            .collect();
        let mut servers: Vec<VpnServer> = self.mget_json(&keys).await?;
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn set_current_users(
        &self,
        server_id: Uuid,
        current_users: u32,
    ) -> Result<bool, StoreError> {
        let key = server_key(server_id);
        let Some(mut server) = self.get_json::<VpnServer>(&key).await? else {
            return Ok(false);
        };
        server.current_users = current_users;
        self.set_json(&key, &server).await?;
        Ok(true)
    }

    async fn insert_config(&self, config: &VpnConfig) -> Result<(), StoreError> {
        let payload = serde_json::to_string(config)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(config_key(config.id))
            .arg(payload)
            .ignore()
            .cmd("SADD")
            .arg(subscription_configs_key(config.subscription_id))
            .arg(config.id.to_string())
            .ignore()
            .cmd("SADD")
            .arg(server_configs_key(config.server_id))
            .arg(config.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_config(&self, config_id: Uuid) -> Result<Option<VpnConfig>, StoreError> {
        self.get_json(&config_key(config_id)).await
    }

    async fn configs_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<VpnConfig>, StoreError> {
        let keys: Vec<String> = self
            .members(&subscription_configs_key(subscription_id))
            .await?
            .into_iter()
            .map(|id| format!("{KEY_PREFIX}config:{id}"))
            .collect();
        let mut configs: Vec<VpnConfig> = self.mget_json(&keys).await?;
        configs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(configs)
    }

    async fn count_active_for_server(&self, server_id: Uuid) -> Result<u64, StoreError> {
        let keys: Vec<String> = self
            .members(&server_configs_key(server_id))
            .await?
            .into_iter()
            .map(|id| format!("{KEY_PREFIX}config:{id}"))
            .collect();
        let configs: Vec<VpnConfig> = self.mget_json(&keys).await?;
        Ok(configs.iter().filter(|c| c.is_active).count() as u64)
    }

    async fn deactivate_config(&self, config_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deactivated: i64 = self
            .deactivate_script
            .key(config_key(config_id))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(deactivated == 1)
    }
}

#[async_trait]
impl SubscriptionDirectory for RedisStore {
    async fn lookup(&self, subscription_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(subscription_key(subscription_id))
            .query_async(&mut conn)
            .await?;
        subscription_from_map(subscription_id, fields)
    }
}
