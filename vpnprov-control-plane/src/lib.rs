//! VPN provisioning control plane
//!
//! Hands out WireGuard client configs to subscribers and keeps the VPN
//! servers' peer tables in step with them:
//! - Per-server /24 address pools with atomic lowest-free allocation
//! - Client key generation and config rendering
//! - Remote agent calls to add and remove peers
//! - A REST API for subscribers, authenticated with RS256 JWTs
//!
//! ## Architecture
//!
//! - `config`: Configuration management and environment variable handling
//! - `store`: Storage traits with in-memory and Redis backends
//! - `allocator`: Address pool initialization, allocation and release
//! - `agent_client`: HTTP client for the per-server management agent
//! - `orchestrator`: Generate, rotate and delete workflows
//! - `rest_server`: Axum routes and error mapping
//! - `server`: Startup wiring and logging setup
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use vpnprov_control_plane::{Config, ControlPlaneServerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     vpnprov_control_plane::server::ControlPlaneServer::init_logging();
//!
//!     let config = Config::from_env()?;
//!     let server = ControlPlaneServerBuilder::new().with_config(config).build()?;
//!
//!     server.run().await
//! }
//! ```

pub mod agent_client;
pub mod allocator;
pub mod config;
pub mod orchestrator;
pub mod rest_server;
pub mod server;
pub mod store;

pub use agent_client::{AgentClient, AgentError, AgentRegistry, AgentTimeouts};
pub use allocator::AddressPoolAllocator;
pub use config::Config;
pub use error::{ConfigError, ProvisionError};
pub use orchestrator::{
    DeleteOutcome, PeerCleanup, ProvisionSettings, Provisioner, RotationOutcome,
};
pub use server::{ControlPlaneServer, ControlPlaneServerBuilder};
pub use store::{MemoryStore, RedisStore};

/// Current version of the provisioning control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};

    /// Default bind address for the REST API
    pub fn bind_address() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
    }
    pub const REDIS_URL: &str = "redis://127.0.0.1:6379/2";
    pub const JWT_PUBLIC_KEY_PATH: &str = "./certs/jwt_public.pem";
    pub const SERVERS_FILE: &str = "./servers.json";
    pub const AGENT_HEALTH_TIMEOUT_SECS: u64 = 5;
    pub const AGENT_PEER_TIMEOUT_SECS: u64 = 30;
    pub const AGENT_COMMAND_TIMEOUT_SECS: u64 = 60;
    /// Full tunnel for both address families
    pub const CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0, ::/0";
    pub const PERSISTENT_KEEPALIVE: u16 = vpnprov_core::wg_config::DEFAULT_PERSISTENT_KEEPALIVE;
}

/// Error types used throughout the control plane
pub mod error {
    use vpnprov_core::KeyError;

    use crate::agent_client::AgentError;
    use crate::store::StoreError;

    /// Configuration-related errors
    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("Invalid configuration value: {0}")]
        InvalidValue(String),
        #[error("File not found: {0}")]
        FileNotFound(String),
    }

    /// Everything a provisioning operation can fail with.
    #[derive(Debug, thiserror::Error)]
    pub enum ProvisionError {
        #[error("not found: {0}")]
        NotFound(String),
        #[error("validation failed: {0}")]
        Validation(String),
        #[error("conflict: {0}")]
        Conflict(String),
        #[error("address pool exhausted: {0}")]
        PoolExhausted(String),
        #[error("agent unavailable: {0}")]
        AgentUnavailable(String),
        #[error("agent error: {0}")]
        Agent(#[from] AgentError),
        #[error("unsupported subnet: {0}")]
        UnsupportedSubnet(String),
        #[error("key generation failed: {0}")]
        KeyGeneration(#[from] KeyError),
        #[error("storage error: {0}")]
        Store(#[from] StoreError),
    }

    impl ProvisionError {
        /// Stable machine-readable tag used in API error bodies.
        pub fn kind(&self) -> &'static str {
            match self {
                ProvisionError::NotFound(_) => "not_found",
                ProvisionError::Validation(_) => "validation",
                ProvisionError::Conflict(_) => "conflict",
                ProvisionError::PoolExhausted(_) => "pool_exhausted",
                ProvisionError::AgentUnavailable(_) => "agent_unavailable",
                ProvisionError::Agent(_) => "agent_error",
                ProvisionError::UnsupportedSubnet(_) => "unsupported_subnet",
                ProvisionError::KeyGeneration(_) => "key_generation",
                ProvisionError::Store(_) => "storage",
            }
        }

        /// Whether the same request may succeed later without any change.
        pub fn is_retryable(&self) -> bool {
            matches!(
                self,
                ProvisionError::PoolExhausted(_)
                    | ProvisionError::AgentUnavailable(_)
                    | ProvisionError::Agent(_)
                    | ProvisionError::Store(_)
            )
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn retryable_errors_are_capacity_or_infrastructure() {
            assert!(ProvisionError::PoolExhausted("s".into()).is_retryable());
            assert!(ProvisionError::AgentUnavailable("s".into()).is_retryable());
            assert!(!ProvisionError::Conflict("limit".into()).is_retryable());
            assert!(!ProvisionError::Validation("owner".into()).is_retryable());
            assert!(!ProvisionError::UnsupportedSubnet("10.0.0.0/16".into()).is_retryable());
        }

        #[test]
        fn kind_tags_are_snake_case() {
            assert_eq!(ProvisionError::NotFound("x".into()).kind(), "not_found");
            assert_eq!(
                ProvisionError::Agent(AgentError::Rejected("nope".into())).kind(),
                "agent_error"
            );
        }
    }
}
