//! Named rendezvous barriers.
//!
//! A barrier is created by its first arrival and releases once every node of
//! the cluster has arrived. It aborts when its deadline passes, when a node
//! that has not arrived yet is reported unhealthy, or when it is cancelled.
//! Released and aborted are terminal: later calls on the same id return the
//! recorded outcome without blocking, and the id cannot be reused within the
//! session.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use super::deadline_after;
use super::health::HealthMonitor;
use super::protocol::{HealthEvent, HealthStatus};
use crate::error::{CoordinationError, Result};

/// Why a barrier was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    DeadlineExceeded,
    PeerFailed { node_id: i32 },
    Cancelled { reason: String },
}

/// Lifecycle of one barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierState {
    Pending,
    Released,
    Aborted(AbortReason),
}

impl BarrierState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

struct BarrierInner {
    arrived: BTreeSet<i32>,
    deadline: Instant,
}

struct Barrier {
    id: String,
    expected: u32,
    inner: Mutex<BarrierInner>,
    state_tx: watch::Sender<BarrierState>,
}

impl Barrier {
    fn new(id: String, expected: u32, deadline: Instant) -> Self {
        let (state_tx, _) = watch::channel(BarrierState::Pending);
        Self {
            id,
            expected,
            inner: Mutex::new(BarrierInner {
                arrived: BTreeSet::new(),
                deadline,
            }),
            state_tx,
        }
    }

    fn state(&self) -> BarrierState {
        self.state_tx.borrow().clone()
    }

    /// Move a pending barrier to a terminal state. Caller holds `inner`.
    fn settle(&self, inner: &BarrierInner, state: BarrierState) -> bool {
        let settled = self.state_tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state.clone();
                true
            }
        });

        if settled {
            match &state {
                BarrierState::Released => {
                    tracing::info!("Barrier '{}' released ({} nodes)", self.id, self.expected)
                }
                BarrierState::Aborted(reason) => tracing::warn!(
                    "Barrier '{}' aborted with {}/{} nodes arrived: {:?}",
                    self.id,
                    inner.arrived.len(),
                    self.expected,
                    reason
                ),
                BarrierState::Pending => {}
            }
        }
        settled
    }

    fn outcome(&self, state: &BarrierState) -> Result<()> {
        match state {
            BarrierState::Released => Ok(()),
            BarrierState::Aborted(AbortReason::DeadlineExceeded) => {
                Err(CoordinationError::deadline_exceeded(format!(
                    "barrier '{}' timed out before all {} nodes arrived",
                    self.id, self.expected
                )))
            }
            BarrierState::Aborted(AbortReason::PeerFailed { node_id }) => {
                Err(CoordinationError::aborted(format!(
                    "barrier '{}' aborted: node {} became unhealthy before arriving",
                    self.id, node_id
                )))
            }
            BarrierState::Aborted(AbortReason::Cancelled { reason }) => {
                Err(CoordinationError::aborted(format!(
                    "barrier '{}' cancelled: {}",
                    self.id, reason
                )))
            }
            BarrierState::Pending => Err(CoordinationError::aborted(format!(
                "barrier '{}' is still pending",
                self.id
            ))),
        }
    }
}

/// Owns every barrier of the session.
pub struct BarrierManager {
    cluster_size: u32,
    default_timeout: Duration,
    barriers: Mutex<HashMap<String, Arc<Barrier>>>,
    /// Source of truth for peer liveness; events are only a prompt to look.
    health: Arc<HealthMonitor>,
}

impl BarrierManager {
    pub fn new(cluster_size: u32, default_timeout: Duration, health: Arc<HealthMonitor>) -> Self {
        Self {
            cluster_size,
            default_timeout,
            barriers: Mutex::new(HashMap::new()),
            health,
        }
    }

    /// Arrive at `barrier_id` and wait for the outcome.
    ///
    /// `timeout` only matters for the first arrival, which fixes the
    /// barrier's deadline; `None` selects the default barrier timeout.
    /// Dropping the future abandons the wait but keeps the arrival.
    pub async fn enter(&self, barrier_id: &str, node_id: i32, timeout: Option<Duration>) -> Result<()> {
        if barrier_id.is_empty() {
            return Err(CoordinationError::invalid_argument("barrier id must not be empty"));
        }
        if node_id < 0 || node_id as u32 >= self.cluster_size {
            return Err(CoordinationError::invalid_argument(format!(
                "node id {} outside cluster of size {}",
                node_id, self.cluster_size
            )));
        }

        let now = Instant::now();
        let barrier = self
            .barrier(
                barrier_id,
                deadline_after(now, timeout.unwrap_or(self.default_timeout)),
            )
            .await;
        let mut state_rx = barrier.state_tx.subscribe();

        let deadline = {
            let mut inner = barrier.inner.lock().await;

            let state = barrier.state();
            if state.is_terminal() {
                return barrier.outcome(&state);
            }
            if now >= inner.deadline {
                barrier.settle(&inner, BarrierState::Aborted(AbortReason::DeadlineExceeded));
                return barrier.outcome(&barrier.state());
            }

            if !inner.arrived.insert(node_id) {
                tracing::debug!("Node {} re-entered barrier '{}'", node_id, barrier.id);
            }

            if inner.arrived.len() == barrier.expected as usize {
                barrier.settle(&inner, BarrierState::Released);
                return barrier.outcome(&barrier.state());
            }

            if let Some(peer) = self.first_unhealthy_absentee(&inner.arrived).await {
                barrier.settle(
                    &inner,
                    BarrierState::Aborted(AbortReason::PeerFailed { node_id: peer }),
                );
                return barrier.outcome(&barrier.state());
            }

            tracing::debug!(
                "Node {} waiting at barrier '{}' ({}/{})",
                node_id,
                barrier.id,
                inner.arrived.len(),
                barrier.expected
            );
            inner.deadline
        };

        let settled = tokio::time::timeout_at(deadline, async {
            state_rx
                .wait_for(BarrierState::is_terminal)
                .await
                .map(|state| state.clone())
        })
        .await;

        match settled {
            Ok(Ok(state)) => barrier.outcome(&state),
            Ok(Err(_)) => Err(CoordinationError::aborted("coordinator is shutting down")),
            Err(_) => {
                let inner = barrier.inner.lock().await;
                barrier.settle(&inner, BarrierState::Aborted(AbortReason::DeadlineExceeded));
                barrier.outcome(&barrier.state())
            }
        }
    }

    /// Abort a pending barrier. Cancelling an unknown id records it as aborted.
    pub async fn cancel(&self, barrier_id: &str, reason: &str) -> Result<()> {
        if barrier_id.is_empty() {
            return Err(CoordinationError::invalid_argument("barrier id must not be empty"));
        }

        let barrier = self
            .barrier(barrier_id, deadline_after(Instant::now(), self.default_timeout))
            .await;
        let inner = barrier.inner.lock().await;
        barrier.settle(
            &inner,
            BarrierState::Aborted(AbortReason::Cancelled {
                reason: reason.to_string(),
            }),
        );

        match barrier.state() {
            BarrierState::Released => Err(CoordinationError::failed_precondition(format!(
                "barrier '{}' already released",
                barrier_id
            ))),
            _ => Ok(()),
        }
    }

    /// Apply a liveness transition from the health monitor.
    ///
    /// Events may arrive late or out of order, so the node's current status
    /// decides: an unhealthy event for a node that has since recovered is
    /// ignored. Returns the ids of barriers aborted because of it.
    pub async fn on_health_change(&self, event: HealthEvent) -> Vec<String> {
        if event.current != HealthStatus::Unhealthy {
            return Vec::new();
        }
        if self.health.status(event.node_id).await != Some(HealthStatus::Unhealthy) {
            tracing::debug!(
                "Ignoring stale failure of node {}, it has recovered",
                event.node_id
            );
            return Vec::new();
        }

        let barriers: Vec<Arc<Barrier>> = self.barriers.lock().await.values().cloned().collect();
        let mut aborted = Vec::new();
        for barrier in barriers {
            let inner = barrier.inner.lock().await;
            if inner.arrived.contains(&event.node_id) {
                continue;
            }
            let reason = AbortReason::PeerFailed {
                node_id: event.node_id,
            };
            if barrier.settle(&inner, BarrierState::Aborted(reason)) {
                aborted.push(barrier.id.clone());
            }
        }
        aborted.sort();
        aborted
    }

    /// Current state of a barrier, if it exists.
    pub async fn state(&self, barrier_id: &str) -> Option<BarrierState> {
        let barriers = self.barriers.lock().await;
        barriers.get(barrier_id).map(|b| b.state())
    }

    /// Nodes that have arrived at a barrier, ascending.
    pub async fn arrived(&self, barrier_id: &str) -> Vec<i32> {
        let barrier = {
            let barriers = self.barriers.lock().await;
            match barriers.get(barrier_id) {
                Some(barrier) => barrier.clone(),
                None => return Vec::new(),
            }
        };
        let inner = barrier.inner.lock().await;
        inner.arrived.iter().copied().collect()
    }

    /// Lowest node id that has not arrived and is unhealthy right now.
    /// Nodes the health monitor does not track yet count as healthy.
    async fn first_unhealthy_absentee(&self, arrived: &BTreeSet<i32>) -> Option<i32> {
        for node_id in 0..self.cluster_size as i32 {
            if arrived.contains(&node_id) {
                continue;
            }
            if self.health.status(node_id).await == Some(HealthStatus::Unhealthy) {
                return Some(node_id);
            }
        }
        None
    }

    async fn barrier(&self, barrier_id: &str, deadline: Instant) -> Arc<Barrier> {
        let mut barriers = self.barriers.lock().await;
        barriers
            .entry(barrier_id.to_string())
            .or_insert_with(|| {
                Arc::new(Barrier::new(barrier_id.to_string(), self.cluster_size, deadline))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEARTBEAT: Duration = Duration::from_secs(1);

    /// A manager over `cluster_size` nodes, all registered and healthy.
    async fn manager(cluster_size: u32) -> (Arc<BarrierManager>, Arc<HealthMonitor>) {
        let health = Arc::new(HealthMonitor::new("session-1", HEARTBEAT, 3));
        for id in 0..cluster_size as i32 {
            health.register(id, &format!("boot-{}", id)).await;
        }
        let mgr = Arc::new(BarrierManager::new(
            cluster_size,
            Duration::from_secs(60),
            health.clone(),
        ));
        (mgr, health)
    }

    /// Let `node_id`'s lease run out while every other node keeps beating.
    async fn silence(health: &HealthMonitor, node_id: i32, cluster_size: u32) -> Vec<HealthEvent> {
        tokio::time::advance(HEARTBEAT * 4).await;
        for id in (0..cluster_size as i32).filter(|id| *id != node_id) {
            health.heartbeat(id).await.unwrap();
        }
        health.sweep().await
    }

    fn enter(
        mgr: &Arc<BarrierManager>,
        barrier_id: &'static str,
        node_id: i32,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.enter(barrier_id, node_id, Some(timeout)).await })
    }

    async fn wait_for_arrivals(mgr: &BarrierManager, barrier_id: &str, count: usize) {
        while mgr.arrived(barrier_id).await.len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_release_when_all_arrive() {
        let (mgr, _health) = manager(3).await;
        let waiters: Vec<_> = (0..3)
            .map(|id| enter(&mgr, "init", id, Duration::from_secs(10)))
            .collect();

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(mgr.state("init").await, Some(BarrierState::Released));

        // Terminal state is returned immediately to late callers
        mgr.enter("init", 1, None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_present_and_future_callers() {
        let (mgr, _health) = manager(3).await;
        let first = enter(&mgr, "init", 0, Duration::from_secs(5));
        let second = enter(&mgr, "init", 1, Duration::from_secs(5));

        for waiter in [first, second] {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, CoordinationError::DeadlineExceeded { .. }));
        }

        // The third node arrives too late and gets the recorded outcome
        let started = Instant::now();
        let err = mgr
            .enter("init", 2, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::DeadlineExceeded { .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_duplicate_arrival_not_double_counted() {
        let (mgr, _health) = manager(2).await;
        let first = enter(&mgr, "sync", 0, Duration::from_secs(10));
        let again = enter(&mgr, "sync", 0, Duration::from_secs(10));
        wait_for_arrivals(&mgr, "sync", 1).await;
        tokio::task::yield_now().await;

        assert_eq!(mgr.arrived("sync").await, vec![0]);
        assert_eq!(mgr.state("sync").await, Some(BarrierState::Pending));

        mgr.enter("sync", 1, None).await.unwrap();
        first.await.unwrap().unwrap();
        again.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_failure_aborts_waiters() {
        let (mgr, health) = manager(3).await;
        let a = enter(&mgr, "init", 0, Duration::from_secs(60));
        let b = enter(&mgr, "init", 1, Duration::from_secs(60));
        wait_for_arrivals(&mgr, "init", 2).await;

        let events = silence(&health, 2, 3).await;
        assert_eq!(events.len(), 1);
        let aborted = mgr.on_health_change(events[0]).await;
        assert_eq!(aborted, vec!["init".to_string()]);

        for waiter in [a, b] {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, CoordinationError::Aborted { .. }));
            assert!(err.to_string().contains("node 2"));
        }

        let err = mgr.enter("init", 2, None).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Aborted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_of_arrived_node_does_not_abort() {
        let (mgr, health) = manager(2).await;
        let a = enter(&mgr, "init", 0, Duration::from_secs(60));
        wait_for_arrivals(&mgr, "init", 1).await;

        let events = silence(&health, 0, 2).await;
        assert!(mgr.on_health_change(events[0]).await.is_empty());

        mgr.enter("init", 1, None).await.unwrap();
        a.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_entering_with_known_failed_peer_aborts() {
        let (mgr, health) = manager(3).await;
        silence(&health, 2, 3).await;

        let err = mgr.enter("phase-2", 0, None).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Aborted { .. }));
        assert!(err.to_string().contains("node 2"));

        // Recovery clears the peer for new barriers
        health.heartbeat(2).await.unwrap();
        let a = enter(&mgr, "phase-3", 0, Duration::from_secs(60));
        let b = enter(&mgr, "phase-3", 1, Duration::from_secs(60));
        wait_for_arrivals(&mgr, "phase-3", 2).await;
        mgr.enter("phase-3", 2, None).await.unwrap();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reported_after_recovery_is_ignored() {
        let (mgr, health) = manager(2).await;
        let events = silence(&health, 1, 2).await;
        assert_eq!(events[0].current, HealthStatus::Unhealthy);

        // The node recovers before its failure is delivered
        let (_, recovered) = health.heartbeat(1).await.unwrap();
        mgr.on_health_change(recovered.unwrap()).await;
        let waiter = enter(&mgr, "step", 0, Duration::from_secs(30));
        wait_for_arrivals(&mgr, "step", 1).await;
        assert!(mgr.on_health_change(events[0]).await.is_empty());

        // Neither the pending barrier nor a fresh one treats node 1 as failed
        mgr.enter("step", 1, None).await.unwrap();
        waiter.await.unwrap().unwrap();

        let waiter = enter(&mgr, "next", 0, Duration::from_secs(30));
        wait_for_arrivals(&mgr, "next", 1).await;
        mgr.enter("next", 1, None).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_untracked_node_counts_as_healthy() {
        let health = Arc::new(HealthMonitor::new("session-1", HEARTBEAT, 3));
        let mgr = Arc::new(BarrierManager::new(2, Duration::from_secs(60), health));

        let waiter = enter(&mgr, "init", 0, Duration::from_secs(10));
        wait_for_arrivals(&mgr, "init", 1).await;
        assert_eq!(mgr.state("init").await, Some(BarrierState::Pending));

        mgr.enter("init", 1, None).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_timeout_waits_without_overflow() {
        let (mgr, _health) = manager(2).await;
        let waiter = enter(&mgr, "init", 0, Duration::from_millis(u64::MAX));
        wait_for_arrivals(&mgr, "init", 1).await;

        mgr.enter("init", 1, Some(Duration::MAX)).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel() {
        let (mgr, _health) = manager(2).await;
        let waiter = enter(&mgr, "ckpt", 0, Duration::from_secs(60));
        wait_for_arrivals(&mgr, "ckpt", 1).await;

        mgr.cancel("ckpt", "operator request").await.unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("operator request"));

        // Cancelling an unknown barrier poisons it for later callers
        mgr.cancel("never", "skip").await.unwrap();
        assert!(mgr.enter("never", 1, None).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_released_barrier_fails() {
        let (mgr, _health) = manager(1).await;
        mgr.enter("done", 0, None).await.unwrap();

        let err = mgr.cancel("done", "too late").await.unwrap_err();
        assert!(matches!(err, CoordinationError::FailedPrecondition { .. }));
        assert_eq!(mgr.state("done").await, Some(BarrierState::Released));
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (mgr, _health) = manager(2).await;
        assert!(matches!(
            mgr.enter("", 0, None).await,
            Err(CoordinationError::InvalidArgument { .. })
        ));
        assert!(matches!(
            mgr.enter("init", 2, None).await,
            Err(CoordinationError::InvalidArgument { .. })
        ));
        assert!(mgr.state("init").await.is_none());
    }
}
