//! Coordinator client implementation.
//!
//! This module provides the gRPC client node agents use to talk to the
//! coordinator service, plus a background heartbeat task.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use super::proto::coordinator_service_client::CoordinatorServiceClient;
use super::proto::{
    CancelBarrierRequest, EnterBarrierRequest, HeartbeatRequest, KeyValueDeleteRequest,
    KeyValueGetDirectoryRequest, KeyValueGetRequest, KeyValuePutRequest, WatchHealthRequest,
};
use super::protocol::{GlobalTopology, HeartbeatAck, LivenessSnapshot, NodeTopology};
use super::retry::{retry_async, RetryConfig, RetryResult};
use crate::config::ClientConfig;
use crate::error::{CoordinationError, Result};

/// Stream of liveness snapshots from `watch_health`.
pub type LivenessStream = Pin<Box<dyn Stream<Item = Result<LivenessSnapshot>> + Send>>;

/// Trait for coordinator client implementations.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Submit this node's devices and wait for the cluster-wide topology.
    async fn register_local_topology(&self, topology: NodeTopology) -> Result<GlobalTopology>;

    async fn heartbeat(&self, node_id: i32) -> Result<HeartbeatAck>;

    /// Follow liveness of one node, or of all nodes with `None`.
    async fn watch_health(&self, node_id: Option<i32>) -> Result<LivenessStream>;

    /// Block until every node reached `barrier_id`. `None` uses the
    /// coordinator's default timeout.
    async fn enter_barrier(
        &self,
        barrier_id: &str,
        node_id: i32,
        timeout: Option<Duration>,
    ) -> Result<()>;

    async fn cancel_barrier(&self, barrier_id: &str, reason: &str) -> Result<()>;

    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Read a key, waiting up to `timeout` for another node to write it.
    async fn kv_get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>>;

    async fn kv_delete(&self, key: &str) -> Result<()>;

    async fn kv_get_directory(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn is_connected(&self) -> bool;
}

/// gRPC-based coordinator client.
pub struct GrpcCoordinatorClient {
    config: ClientConfig,
    retry: RetryConfig,
    client: Option<CoordinatorServiceClient<Channel>>,
}

impl GrpcCoordinatorClient {
    pub fn new(config: ClientConfig) -> Self {
        let retry = RetryConfig::from(&config);
        Self {
            config,
            retry,
            client: None,
        }
    }

    /// Override the retry policy used for connecting and idempotent calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Connect to the coordinator service.
    pub async fn connect(&mut self) -> Result<()> {
        let channel = open_channel(&self.config).await?;
        self.client = Some(CoordinatorServiceClient::new(channel));
        Ok(())
    }

    /// Connect, backing off between failed attempts.
    pub async fn connect_with_retry(&mut self) -> Result<()> {
        let config = &self.config;
        let channel = retry_async(&self.retry, || async move {
            RetryResult::from(open_channel(config).await)
        })
        .await
        .map_err(|e| {
            CoordinationError::unavailable(format!(
                "failed to connect to coordinator at {} after {} retries: {}",
                config.address, self.retry.max_retries, e
            ))
        })?;

        tracing::info!("Connected to coordinator at {}", self.config.address);
        self.client = Some(CoordinatorServiceClient::new(channel));
        Ok(())
    }

    fn get_client(&self) -> Result<CoordinatorServiceClient<Channel>> {
        self.client
            .clone()
            .ok_or_else(|| CoordinationError::unavailable("not connected to coordinator"))
    }
}

async fn open_channel(config: &ClientConfig) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{}", config.address))
        .map_err(|e| {
            CoordinationError::invalid_argument(format!(
                "invalid coordinator address {}: {}",
                config.address, e
            ))
        })?
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms));

    endpoint.connect().await.map_err(|e| {
        CoordinationError::unavailable_with_source(
            format!("failed to connect to coordinator at {}", config.address),
            e,
        )
    })
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[async_trait]
impl CoordinatorClient for GrpcCoordinatorClient {
    async fn register_local_topology(&self, topology: NodeTopology) -> Result<GlobalTopology> {
        let mut client = self.get_client()?;
        let node_id = topology.node_id;

        let response = client
            .register_local_topology(Request::new(topology.into()))
            .await?;

        let global = GlobalTopology::try_from(response.into_inner())?;
        tracing::info!(
            "Node {} received global topology with {} devices",
            node_id,
            global.device_count()
        );
        Ok(global)
    }

    async fn heartbeat(&self, node_id: i32) -> Result<HeartbeatAck> {
        let client = self.get_client()?;

        retry_async(&self.retry, || {
            let mut client = client.clone();
            async move {
                let response = client
                    .heartbeat(Request::new(HeartbeatRequest { node_id }))
                    .await
                    .map(|r| HeartbeatAck::from(r.into_inner()))
                    .map_err(CoordinationError::from);
                RetryResult::from(response)
            }
        })
        .await
    }

    async fn watch_health(&self, node_id: Option<i32>) -> Result<LivenessStream> {
        let mut client = self.get_client()?;

        let stream = client
            .watch_health(Request::new(WatchHealthRequest { node_id }))
            .await?
            .into_inner()
            .map(|item| {
                item.map(LivenessSnapshot::from)
                    .map_err(CoordinationError::from)
            });

        Ok(Box::pin(stream))
    }

    async fn enter_barrier(
        &self,
        barrier_id: &str,
        node_id: i32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut client = self.get_client()?;

        let request = Request::new(EnterBarrierRequest {
            barrier_id: barrier_id.to_string(),
            node_id,
            timeout_ms: timeout.map(millis).unwrap_or(0),
        });

        client.enter_barrier(request).await?;
        tracing::debug!("Node {} passed barrier {}", node_id, barrier_id);
        Ok(())
    }

    async fn cancel_barrier(&self, barrier_id: &str, reason: &str) -> Result<()> {
        let mut client = self.get_client()?;

        client
            .cancel_barrier(Request::new(CancelBarrierRequest {
                barrier_id: barrier_id.to_string(),
                reason: reason.to_string(),
            }))
            .await?;
        Ok(())
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let client = self.get_client()?;

        retry_async(&self.retry, || {
            let mut client = client.clone();
            let request = KeyValuePutRequest {
                key: key.to_string(),
                value: value.clone(),
            };
            async move {
                let response = client
                    .kv_put(Request::new(request))
                    .await
                    .map(|_| ())
                    .map_err(CoordinationError::from);
                RetryResult::from(response)
            }
        })
        .await
    }

    async fn kv_get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        let mut client = self.get_client()?;

        let response = client
            .kv_get(Request::new(KeyValueGetRequest {
                key: key.to_string(),
                timeout_ms: millis(timeout),
            }))
            .await?;

        Ok(response.into_inner().value)
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        let client = self.get_client()?;

        retry_async(&self.retry, || {
            let mut client = client.clone();
            let key = key.to_string();
            async move {
                let response = client
                    .kv_delete(Request::new(KeyValueDeleteRequest { key }))
                    .await
                    .map(|_| ())
                    .map_err(CoordinationError::from);
                RetryResult::from(response)
            }
        })
        .await
    }

    async fn kv_get_directory(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut client = self.get_client()?;

        let response = client
            .kv_get_directory(Request::new(KeyValueGetDirectoryRequest {
                prefix: prefix.to_string(),
            }))
            .await?;

        Ok(response
            .into_inner()
            .entries
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}

/// Background heartbeat task that runs while the node agent is active.
///
/// Follows the cadence the coordinator recommends in its acks.
pub struct HeartbeatTask {
    client: Arc<dyn CoordinatorClient>,
    node_id: i32,
    interval: Duration,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl HeartbeatTask {
    pub fn new(
        client: Arc<dyn CoordinatorClient>,
        node_id: i32,
        interval: Duration,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            node_id,
            interval,
            shutdown,
        }
    }

    /// Run the heartbeat task until shutdown is signalled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session: Option<String> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ack = match self.client.heartbeat(self.node_id).await {
                        Ok(ack) => ack,
                        Err(e) => {
                            tracing::warn!("Heartbeat failed: {}", e);
                            continue;
                        }
                    };

                    if let Some(previous) = session.as_deref() {
                        if previous != ack.session_id {
                            tracing::warn!(
                                "Coordinator session changed from {} to {}",
                                previous,
                                ack.session_id
                            );
                        }
                    }
                    session = Some(ack.session_id);

                    let recommended = Duration::from_millis(ack.heartbeat_interval_ms);
                    if !recommended.is_zero() && recommended != self.interval {
                        tracing::debug!("Heartbeat interval set to {:?}", recommended);
                        self.interval = recommended;
                        ticker = tokio::time::interval_at(
                            tokio::time::Instant::now() + recommended,
                            recommended,
                        );
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Heartbeat task for node {} stopped", self.node_id);
    }
}
