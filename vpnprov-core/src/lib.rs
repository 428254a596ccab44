//! Shared types for the VPN provisioning control plane.
//!
//! - `model`: servers, address-pool entries, peer configs and the subscription
//!   view consumed from billing
//! - `keys`: X25519 key pairs and pre-shared keys
//! - `wg_config`: the `[Interface]`/`[Peer]` text handed to end users

pub mod keys;
pub mod model;
pub mod wg_config;

pub use keys::{KeyError, KeyPair, WireGuardKeys};
pub use model::{
    AddressPoolEntry, PoolStats, ServerStatus, Subscription, SubscriptionStatus, VpnConfig,
    VpnServer,
};
pub use wg_config::{ClientConfig, ConfigParseError};
