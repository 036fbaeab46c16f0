//! Cluster coordination.
//!
//! The building blocks of a coordination session, each usable on its own:
//!
//! - Topology aggregation and global device id assignment
//! - Named barriers across all nodes
//! - Heartbeat-based liveness tracking
//! - A blocking key-value store for small metadata blobs
//!
//! plus the gRPC client node agents use to reach the coordinator service.

mod client;
pub mod barrier;
pub mod health;
pub mod kv_store;
pub mod protocol;
pub mod retry;
pub mod topology;

use std::time::Duration;

use tokio::time::Instant;

/// Longest wait any deadline is allowed to describe.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("rendezvous.coordinator");
}

// Re-exports
pub use barrier::{AbortReason, BarrierManager, BarrierState};
pub use client::{CoordinatorClient, GrpcCoordinatorClient, HeartbeatTask, LivenessStream};
pub use health::HealthMonitor;
pub use kv_store::KeyValueStore;
pub use protocol::{
    Device, DeviceAttribute, GlobalTopology, HealthEvent, HealthStatus, HeartbeatAck,
    LivenessSnapshot, NodeLiveness, NodeTopology,
};
pub use retry::{retry_async, RetryConfig, RetryResult};
pub use topology::{build_global_topology, RegistrationPhase, Submission, TopologyAggregator};

/// `start + timeout`, capped so an oversized timeout cannot overflow.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start + timeout.min(FAR_FUTURE)
}
