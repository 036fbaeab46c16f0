// rendezvous-core/src/config.rs

//! Configuration management for the coordination service and its clients.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoordinationError, Result};

/// Upper bound for the heartbeat interval (one day).
const MAX_INTERVAL_MS: u64 = 86_400_000;
/// Upper bound for tolerated missed heartbeats.
const MAX_MISSING_HEARTBEATS: u32 = 1_000;
/// Upper bound for registration and barrier timeouts (thirty days).
const MAX_TIMEOUT_MS: u64 = 30 * 86_400_000;

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    pub coordinator: CoordinatorConfig,
    pub client: ClientConfig,
}

/// Policy for deriving a node's slice index when its registration omits one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceIndexPolicy {
    /// Distinct boot ids, visited in node id order, get consecutive slices.
    /// Processes sharing a host (same boot id) share a slice.
    #[default]
    BootId,
    /// Every node is its own slice, numbered by node id order.
    PerNode,
    /// All devices belong to slice 0.
    Single,
}

impl FromStr for SliceIndexPolicy {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "boot_id" | "boot-id" => Ok(Self::BootId),
            "per_node" | "per-node" => Ok(Self::PerNode),
            "single" => Ok(Self::Single),
            other => Err(CoordinationError::config(format!(
                "unknown slice index policy '{}'",
                other
            ))),
        }
    }
}

/// Coordinator service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address the gRPC server binds to.
    pub listen_address: String,
    /// Number of nodes in the cluster session.
    pub cluster_size: u32,
    /// Heartbeat cadence recommended to node agents, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats tolerated before a node is unhealthy.
    pub max_missing_heartbeats: u32,
    /// Interval between liveness sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
    /// Time allowed for all nodes to register, counted from the first registration.
    pub registration_timeout_ms: u64,
    /// Barrier timeout used when a caller does not supply one.
    pub barrier_timeout_ms: u64,
    /// Slice index derivation for nodes that do not report one.
    pub slice_index_policy: SliceIndexPolicy,
    /// Barrier whose release ends the session.
    pub shutdown_barrier_id: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:50051".to_string(),
            cluster_size: 1,
            heartbeat_interval_ms: 10_000,
            max_missing_heartbeats: 3,
            sweep_interval_ms: 1_000,
            registration_timeout_ms: 300_000,
            barrier_timeout_ms: 600_000,
            slice_index_policy: SliceIndexPolicy::BootId,
            shutdown_barrier_id: "shutdown".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Lease after which a silent node is declared unhealthy.
    pub fn lease(&self) -> Duration {
        self.heartbeat_interval()
            .checked_mul(self.max_missing_heartbeats)
            .unwrap_or(Duration::MAX)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    /// Apply environment variable overrides to coordinator configuration.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RDV_COORDINATOR_LISTEN_ADDRESS") {
            self.listen_address = val;
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_CLUSTER_SIZE") {
            if let Ok(v) = val.parse() {
                self.cluster_size = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_HEARTBEAT_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.heartbeat_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_MAX_MISSING_HEARTBEATS") {
            if let Ok(v) = val.parse() {
                self.max_missing_heartbeats = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_SWEEP_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.sweep_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_REGISTRATION_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.registration_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_BARRIER_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.barrier_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_SLICE_INDEX_POLICY") {
            if let Ok(v) = val.parse() {
                self.slice_index_policy = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_COORDINATOR_SHUTDOWN_BARRIER_ID") {
            self.shutdown_barrier_id = val;
        }
        self
    }

    /// Validate coordinator configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_empty() {
            return Err(CoordinationError::config(
                "coordinator.listen_address must not be empty",
            ));
        }
        if self.cluster_size == 0 {
            return Err(CoordinationError::config(
                "coordinator.cluster_size must be greater than 0",
            ));
        }
        if self.cluster_size > i32::MAX as u32 {
            return Err(CoordinationError::config(
                "coordinator.cluster_size does not fit a node id",
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(CoordinationError::config(
                "coordinator.heartbeat_interval_ms must be greater than 0",
            ));
        }
        if self.heartbeat_interval_ms > MAX_INTERVAL_MS {
            return Err(CoordinationError::config(format!(
                "coordinator.heartbeat_interval_ms must not exceed {}",
                MAX_INTERVAL_MS
            )));
        }
        if self.max_missing_heartbeats == 0 {
            return Err(CoordinationError::config(
                "coordinator.max_missing_heartbeats must be greater than 0",
            ));
        }
        if self.max_missing_heartbeats > MAX_MISSING_HEARTBEATS {
            return Err(CoordinationError::config(format!(
                "coordinator.max_missing_heartbeats must not exceed {}",
                MAX_MISSING_HEARTBEATS
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(CoordinationError::config(
                "coordinator.sweep_interval_ms must be greater than 0",
            ));
        }
        if self.sweep_interval_ms > self.heartbeat_interval_ms {
            return Err(CoordinationError::config(
                "coordinator.sweep_interval_ms must not exceed heartbeat_interval_ms",
            ));
        }
        if self.registration_timeout_ms == 0 {
            return Err(CoordinationError::config(
                "coordinator.registration_timeout_ms must be greater than 0",
            ));
        }
        if self.registration_timeout_ms > MAX_TIMEOUT_MS {
            return Err(CoordinationError::config(format!(
                "coordinator.registration_timeout_ms must not exceed {}",
                MAX_TIMEOUT_MS
            )));
        }
        if self.barrier_timeout_ms == 0 {
            return Err(CoordinationError::config(
                "coordinator.barrier_timeout_ms must be greater than 0",
            ));
        }
        if self.barrier_timeout_ms > MAX_TIMEOUT_MS {
            return Err(CoordinationError::config(format!(
                "coordinator.barrier_timeout_ms must not exceed {}",
                MAX_TIMEOUT_MS
            )));
        }
        if self.shutdown_barrier_id.is_empty() {
            return Err(CoordinationError::config(
                "coordinator.shutdown_barrier_id must not be empty",
            ));
        }
        Ok(())
    }
}

/// Node agent connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Coordinator address (host:port).
    pub address: String,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Maximum connection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Initial delay between connection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Upper bound for the backoff delay, in milliseconds.
    pub max_reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:50051".to_string(),
            connect_timeout_ms: 5_000,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Apply environment variable overrides to client configuration.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RDV_CLIENT_ADDRESS") {
            self.address = val;
        }
        if let Ok(val) = std::env::var("RDV_CLIENT_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_CLIENT_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(v) = val.parse() {
                self.max_reconnect_attempts = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_CLIENT_RECONNECT_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.reconnect_delay_ms = v;
            }
        }
        if let Ok(val) = std::env::var("RDV_CLIENT_MAX_RECONNECT_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.max_reconnect_delay_ms = v;
            }
        }
        self
    }

    /// Validate client configuration.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(CoordinationError::config("client.address must not be empty"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(CoordinationError::config(
                "client.connect_timeout_ms must be greater than 0",
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(CoordinationError::config(
                "client.max_reconnect_attempts must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl FromStr for RendezvousConfig {
    type Err = CoordinationError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CoordinationError::config_with_source("failed to parse TOML config", e))
    }
}

impl RendezvousConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinationError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `RDV_` followed by the section
    // name, e.g. `RDV_COORDINATOR_CLUSTER_SIZE` or `RDV_CLIENT_ADDRESS`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.coordinator = self.coordinator.with_env_overrides();
        self.client = self.client.with_env_overrides();
        self
    }

    // Validate all configuration values.
    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        self.client.validate()?;
        Ok(())
    }
}
