use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operational status of a VPN server as set by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Maintenance,
    Offline,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Active => "active",
            ServerStatus::Maintenance => "maintenance",
            ServerStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ServerStatus::Active),
            "maintenance" => Ok(ServerStatus::Maintenance),
            "offline" => Ok(ServerStatus::Offline),
            other => Err(format!("unknown server status: {other}")),
        }
    }
}

/// A provisioning target: one WireGuard server fronted by a control-plane agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnServer {
    pub id: Uuid,
    pub name: String,
    /// Base URL of the agent control-plane API, e.g. `https://10.0.0.5:8443`.
    pub api_url: String,
    /// Bearer credential presented to the agent.
    pub api_token: String,
    /// Server WireGuard public key (base64). Empty until learned from the agent.
    #[serde(default)]
    pub public_key: String,
    /// Public endpoint clients dial, `host:port`.
    pub endpoint: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// Address-pool subnet in CIDR form.
    pub subnet: String,
    pub max_users: u32,
    #[serde(default)]
    pub current_users: u32,
    pub status: ServerStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl VpnServer {
    /// Relative load in `[0, 1]`; servers without capacity report full.
    pub fn load_ratio(&self) -> f64 {
        if self.max_users == 0 {
            return 1.0;
        }
        f64::from(self.current_users) / f64::from(self.max_users)
    }

    /// Whether the server may receive new peers at all.
    pub fn accepts_peers(&self) -> bool {
        self.is_active && self.status == ServerStatus::Active
    }
}

/// One candidate client address belonging to one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPoolEntry {
    pub id: Uuid,
    pub server_id: Uuid,
    pub address: Ipv4Addr,
    #[serde(default)]
    pub is_allocated: bool,
    #[serde(default)]
    pub subscription_id: Option<Uuid>,
    #[serde(default)]
    pub allocated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
    /// Key material generated for the current allocation; retained for audit
    /// after release but only meaningful while allocated.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl AddressPoolEntry {
    pub fn new(server_id: Uuid, address: Ipv4Addr) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            address,
            is_allocated: false,
            subscription_id: None,
            allocated_at: None,
            released_at: None,
            private_key: None,
            public_key: None,
        }
    }

    pub fn mark_allocated(&mut self, subscription_id: Uuid, now: DateTime<Utc>) {
        self.is_allocated = true;
        self.subscription_id = Some(subscription_id);
        self.allocated_at = Some(now);
    }

    /// Returns false when the entry was already free.
    pub fn mark_released(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_allocated {
            return false;
        }
        self.is_allocated = false;
        self.subscription_id = None;
        self.released_at = Some(now);
        true
    }
}

/// Durable record of a provisioned peer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnConfig {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub server_id: Uuid,
    pub address_entry_id: Uuid,
    pub address: Ipv4Addr,
    pub private_key: String,
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    pub config_text: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// `config_text` embeds the private key, so it is hidden along with the keys.
impl fmt::Debug for VpnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnConfig")
            .field("id", &self.id)
            .field("subscription_id", &self.subscription_id)
            .field("server_id", &self.server_id)
            .field("address_entry_id", &self.address_entry_id)
            .field("address", &self.address)
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("preshared_key", &self.preshared_key.as_ref().map(|_| "<redacted>"))
            .field("config_text", &"<redacted>")
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Pending,
    Suspended,
    Expired,
    Cancelled,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SubscriptionStatus::Active),
            "pending" => Ok(SubscriptionStatus::Pending),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "expired" => Ok(SubscriptionStatus::Expired),
            "cancelled" | "canceled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// What the billing side tells us about a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub plan_max_configs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: u64,
    pub allocated: u64,
    pub available: u64,
    /// Percentage of the pool in use.
    pub utilization: f64,
}

impl PoolStats {
    pub fn from_counts(total: u64, available: u64) -> Self {
        let allocated = total.saturating_sub(available);
        let utilization = if total == 0 {
            0.0
        } else {
            (allocated as f64 / total as f64) * 100.0
        };
        Self {
            total,
            allocated,
            available,
            utilization,
        }
    }
}
