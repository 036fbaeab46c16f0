//! In-memory state of a coordination session.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rendezvous_core::config::CoordinatorConfig;
use rendezvous_core::coordinator::{
    BarrierManager, GlobalTopology, HealthEvent, HealthMonitor, HeartbeatAck, KeyValueStore,
    LivenessSnapshot, NodeTopology, Submission, TopologyAggregator,
};
use rendezvous_core::Result;

/// One coordination session: topology, barriers, liveness and KV exchange.
///
/// Every entity carries its own synchronization, so calls on different
/// barriers, keys or nodes never wait on each other.
pub struct Coordinator {
    session_id: String,
    config: CoordinatorConfig,
    topology: TopologyAggregator,
    barriers: BarrierManager,
    health: Arc<HealthMonitor>,
    kv: KeyValueStore,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let health = Arc::new(HealthMonitor::new(
            session_id.clone(),
            config.heartbeat_interval(),
            config.max_missing_heartbeats,
        ));

        Self {
            topology: TopologyAggregator::new(
                config.cluster_size,
                config.registration_timeout(),
                config.slice_index_policy,
            ),
            barriers: BarrierManager::new(
                config.cluster_size,
                config.barrier_timeout(),
                health.clone(),
            ),
            health,
            kv: KeyValueStore::new(),
            shutdown: CancellationToken::new(),
            session_id,
            config,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Cancelled once the session has been torn down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Record a node's devices and wait for every node to register.
    pub async fn register_local_topology(&self, node: NodeTopology) -> Result<Arc<GlobalTopology>> {
        let node_id = node.node_id;
        let boot_id = node.boot_id.clone();
        let device_count = node.devices.len();

        match self.topology.submit(node).await? {
            Submission::New => {
                tracing::info!(
                    "Node {} registered {} devices (boot id {})",
                    node_id,
                    device_count,
                    boot_id
                );
            }
            Submission::Duplicate => {
                tracing::debug!("Node {} repeated its registration", node_id);
            }
            Submission::Restarted { previous_boot_id } => {
                tracing::warn!(
                    "Node {} re-registered after restart ({} -> {})",
                    node_id,
                    previous_boot_id,
                    boot_id
                );
            }
        }

        // Registration counts as proof of life
        if let Some(event) = self.health.register(node_id, &boot_id).await {
            self.barriers.on_health_change(event).await;
        }

        self.topology.wait_for_quorum().await
    }

    /// The global topology, if quorum has been reached.
    pub fn global_topology(&self) -> Option<Arc<GlobalTopology>> {
        self.topology.global_topology()
    }

    pub async fn heartbeat(&self, node_id: i32) -> Result<HeartbeatAck> {
        let (status, event) = self.health.heartbeat(node_id).await?;
        if let Some(event) = event {
            self.barriers.on_health_change(event).await;
        }

        Ok(HeartbeatAck {
            session_id: self.session_id.clone(),
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            status,
        })
    }

    /// Expire silent nodes and abort the barriers they block.
    pub async fn sweep_liveness(&self) -> Vec<HealthEvent> {
        let events = self.health.sweep().await;
        for event in &events {
            let aborted = self.barriers.on_health_change(*event).await;
            if !aborted.is_empty() {
                tracing::warn!(
                    "Node {} failure aborted barriers {:?}",
                    event.node_id,
                    aborted
                );
            }
        }
        events
    }

    pub async fn health_snapshot(&self, node_id: Option<i32>) -> Result<LivenessSnapshot> {
        self.health.snapshot(node_id).await
    }

    pub async fn watch_health(
        &self,
        node_id: Option<i32>,
    ) -> Result<ReceiverStream<LivenessSnapshot>> {
        self.health.watch(node_id).await
    }

    /// Block until all nodes reach `barrier_id`.
    ///
    /// Passing the shutdown barrier tears the session down.
    pub async fn enter_barrier(
        &self,
        barrier_id: &str,
        node_id: i32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.barriers.enter(barrier_id, node_id, timeout).await?;

        if barrier_id == self.config.shutdown_barrier_id {
            self.teardown().await;
        }
        Ok(())
    }

    pub async fn cancel_barrier(&self, barrier_id: &str, reason: &str) -> Result<()> {
        self.barriers.cancel(barrier_id, reason).await?;
        tracing::warn!("Barrier '{}' cancelled: {}", barrier_id, reason);
        Ok(())
    }

    pub async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.kv.put(key, value).await
    }

    pub async fn kv_get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.kv.get(key, timeout).await
    }

    pub async fn kv_delete(&self, key: &str) -> Result<()> {
        self.kv.delete(key).await
    }

    pub async fn kv_get_directory(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.kv.get_directory(prefix).await
    }

    async fn teardown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(
            "Shutdown barrier '{}' released, ending session {}",
            self.config.shutdown_barrier_id,
            self.session_id
        );
        self.kv.clear().await;
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_core::coordinator::{Device, HealthStatus};
    use rendezvous_core::CoordinationError;
    use tokio_stream::StreamExt;

    fn config(cluster_size: u32) -> CoordinatorConfig {
        CoordinatorConfig {
            cluster_size,
            ..Default::default()
        }
    }

    fn node(node_id: i32, boot_id: &str) -> NodeTopology {
        NodeTopology::new(node_id, boot_id).with_device(Device {
            local_ordinal: 0,
            name: "accel".to_string(),
            ..Default::default()
        })
    }

    async fn register_all(coordinator: &Arc<Coordinator>, cluster_size: i32) {
        let mut handles = Vec::new();
        for id in 0..cluster_size {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .register_local_topology(node(id, &format!("boot-{}", id)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_two_node_registration() {
        let coordinator = Arc::new(Coordinator::new(config(2)));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.register_local_topology(node(1, "b")).await })
        };
        let second = coordinator.register_local_topology(node(0, "a")).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.nodes[0].devices[0].global_device_id, 0);
        assert_eq!(second.nodes[1].devices[0].global_device_id, 1);
        assert!(coordinator.global_topology().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let coordinator = Arc::new(Coordinator::new(config(1)));

        let err = coordinator.heartbeat(0).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));

        register_all(&coordinator, 1).await;
        let ack = coordinator.heartbeat(0).await.unwrap();
        assert_eq!(ack.session_id, coordinator.session_id());
        assert_eq!(ack.heartbeat_interval_ms, 10_000);
        assert_eq!(ack.status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_aborts_pending_barrier() {
        let coordinator = Arc::new(Coordinator::new(config(2)));
        register_all(&coordinator, 2).await;

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.enter_barrier("step-1", 0, None).await })
        };

        let mut transitions = Vec::new();
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(10)).await;
            coordinator.heartbeat(0).await.unwrap();
            transitions.extend(coordinator.sweep_liveness().await);
        }

        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].node_id, 1);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::Aborted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_racing_sweep_does_not_poison_barriers() {
        let coordinator = Arc::new(Coordinator::new(config(2)));
        register_all(&coordinator, 2).await;

        // Node 1's heartbeat lands between the sweep and the delivery of its
        // failure to the barriers
        tokio::time::advance(Duration::from_secs(31)).await;
        coordinator.heartbeat(0).await.unwrap();
        let events = coordinator.health.sweep().await;
        assert_eq!(events.len(), 1);
        coordinator.heartbeat(1).await.unwrap();
        for event in events {
            assert!(coordinator.barriers.on_health_change(event).await.is_empty());
        }

        let snapshot = coordinator.health_snapshot(Some(1)).await.unwrap();
        assert_eq!(snapshot.status_of(1), Some(HealthStatus::Healthy));

        let other = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.enter_barrier("next", 1, None).await })
        };
        coordinator.enter_barrier("next", 0, None).await.unwrap();
        other.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reports_node_failure() {
        let coordinator = Arc::new(Coordinator::new(config(2)));
        register_all(&coordinator, 2).await;

        let mut stream = coordinator.watch_health(Some(1)).await.unwrap();
        assert_eq!(
            stream.next().await.unwrap().status_of(1),
            Some(HealthStatus::Healthy)
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        coordinator.sweep_liveness().await;

        let update = stream.next().await.unwrap();
        assert_eq!(update.session_id, coordinator.session_id());
        assert_eq!(update.status_of(1), Some(HealthStatus::Unhealthy));

        assert!(coordinator.watch_health(Some(7)).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_after_quorum_keeps_topology() {
        let coordinator = Arc::new(Coordinator::new(config(2)));
        register_all(&coordinator, 2).await;
        let before = coordinator.global_topology().unwrap();

        let after = coordinator
            .register_local_topology(node(1, "boot-1-restarted"))
            .await
            .unwrap();
        assert_eq!(after.nodes[1].boot_id, "boot-1-restarted");
        assert_eq!(
            after.nodes[1].devices[0].global_device_id,
            before.nodes[1].devices[0].global_device_id
        );

        let snapshot = coordinator.health_snapshot(Some(1)).await.unwrap();
        assert_eq!(snapshot.nodes[0].boot_id, "boot-1-restarted");
    }

    #[tokio::test]
    async fn test_shutdown_barrier_tears_down_session() {
        let coordinator = Arc::new(Coordinator::new(config(2)));
        register_all(&coordinator, 2).await;
        coordinator.kv_put("nccl/unique-id", b"blob".to_vec()).await.unwrap();

        let token = coordinator.shutdown_token();
        let other = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.enter_barrier("shutdown", 1, None).await })
        };
        coordinator.enter_barrier("shutdown", 0, None).await.unwrap();
        other.await.unwrap().unwrap();

        assert!(token.is_cancelled());
        assert!(coordinator.kv_get_directory("").await.is_empty());
    }

    #[tokio::test]
    async fn test_other_barriers_do_not_tear_down() {
        let coordinator = Arc::new(Coordinator::new(config(1)));
        register_all(&coordinator, 1).await;

        coordinator.enter_barrier("init", 0, None).await.unwrap();
        coordinator.cancel_barrier("later", "job aborted").await.unwrap();

        let err = coordinator.enter_barrier("later", 0, None).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Aborted { .. }));
        assert!(!coordinator.shutdown_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_kv_exchange_between_nodes() {
        let coordinator = Arc::new(Coordinator::new(config(2)));

        let reader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.kv_get("peers/0", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        coordinator.kv_put("peers/0", b"10.0.0.1:7000".to_vec()).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), b"10.0.0.1:7000");

        coordinator.kv_delete("peers/0").await.unwrap();
        let err = coordinator.kv_get("peers/0", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));
    }
}
