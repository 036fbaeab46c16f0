//! Heartbeat-based liveness tracking.
//!
//! Each registered node holds a lease renewed by its heartbeats. A periodic
//! sweep marks nodes whose lease ran out as unhealthy; that transition is
//! published once per outage, no matter how many heartbeats are missed. A
//! heartbeat from an unhealthy node brings it back to healthy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::protocol::{HealthEvent, HealthStatus, LivenessSnapshot, NodeLiveness};
use crate::error::{CoordinationError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const WATCH_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
struct LivenessRecord {
    boot_id: String,
    last_seen: Instant,
    last_seen_time: DateTime<Utc>,
    missed_heartbeats: u32,
    status: HealthStatus,
}

impl LivenessRecord {
    fn new(boot_id: String) -> Self {
        Self {
            boot_id,
            last_seen: Instant::now(),
            last_seen_time: Utc::now(),
            missed_heartbeats: 0,
            status: HealthStatus::Healthy,
        }
    }

    /// Renew the lease. Returns the previous status.
    fn touch(&mut self) -> HealthStatus {
        self.last_seen = Instant::now();
        self.last_seen_time = Utc::now();
        self.missed_heartbeats = 0;
        std::mem::replace(&mut self.status, HealthStatus::Healthy)
    }

    fn missed_since(&self, now: Instant, interval: Duration) -> u32 {
        let elapsed = now.saturating_duration_since(self.last_seen);
        (elapsed.as_millis() / interval.as_millis().max(1)) as u32
    }

    fn to_liveness(&self, node_id: i32, now: Instant, interval: Duration) -> NodeLiveness {
        NodeLiveness {
            node_id,
            boot_id: self.boot_id.clone(),
            status: self.status,
            last_heartbeat: self.last_seen_time,
            missed_heartbeats: self.missed_since(now, interval),
        }
    }
}

/// Tracks the liveness of every registered node.
pub struct HealthMonitor {
    session_id: String,
    heartbeat_interval: Duration,
    lease: Duration,
    records: RwLock<HashMap<i32, Mutex<LivenessRecord>>>,
    events_tx: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    /// A node is declared unhealthy after `max_missing_heartbeats` intervals
    /// without a heartbeat.
    pub fn new(
        session_id: impl Into<String>,
        heartbeat_interval: Duration,
        max_missing_heartbeats: u32,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session_id: session_id.into(),
            heartbeat_interval,
            lease: heartbeat_interval
                .checked_mul(max_missing_heartbeats.max(1))
                .unwrap_or(Duration::MAX),
            records: RwLock::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Start (or restart) tracking a node.
    ///
    /// A new boot id resets the record; the same boot id just renews the lease.
    pub async fn register(&self, node_id: i32, boot_id: &str) -> Option<HealthEvent> {
        {
            let records = self.records.read().await;
            if let Some(record) = records.get(&node_id) {
                let mut record = record.lock().await;
                if record.boot_id != boot_id {
                    tracing::warn!(
                        "Node {} restarted (boot id {} -> {}), resetting liveness",
                        node_id,
                        record.boot_id,
                        boot_id
                    );
                    record.boot_id = boot_id.to_string();
                }
                let previous = record.touch();
                return self.transition(node_id, previous, HealthStatus::Healthy);
            }
        }

        let mut records = self.records.write().await;
        records
            .entry(node_id)
            .or_insert_with(|| Mutex::new(LivenessRecord::new(boot_id.to_string())));
        tracing::debug!("Tracking liveness of node {}", node_id);
        None
    }

    /// Renew a node's lease.
    ///
    /// Returns the node's status after the heartbeat and the recovery event
    /// if the node was unhealthy.
    pub async fn heartbeat(&self, node_id: i32) -> Result<(HealthStatus, Option<HealthEvent>)> {
        let records = self.records.read().await;
        let record = records.get(&node_id).ok_or_else(|| {
            CoordinationError::not_found(format!("node {} is not registered", node_id))
        })?;

        let previous = record.lock().await.touch();
        let event = self.transition(node_id, previous, HealthStatus::Healthy);
        if event.is_some() {
            tracing::info!("Node {} recovered", node_id);
        }
        Ok((HealthStatus::Healthy, event))
    }

    /// Mark every node whose lease expired as unhealthy.
    ///
    /// Returns the transitions made by this sweep; a node already unhealthy
    /// produces no further events.
    pub async fn sweep(&self) -> Vec<HealthEvent> {
        let now = Instant::now();
        let records = self.records.read().await;
        let mut events = Vec::new();

        for (node_id, record) in records.iter() {
            let mut record = record.lock().await;
            record.missed_heartbeats = record.missed_since(now, self.heartbeat_interval);

            if record.status == HealthStatus::Healthy
                && now.saturating_duration_since(record.last_seen) > self.lease
            {
                record.status = HealthStatus::Unhealthy;
                tracing::warn!(
                    "Node {} missed {} heartbeats, marking unhealthy",
                    node_id,
                    record.missed_heartbeats
                );
                if let Some(event) =
                    self.transition(*node_id, HealthStatus::Healthy, HealthStatus::Unhealthy)
                {
                    events.push(event);
                }
            }
        }

        events.sort_by_key(|e| e.node_id);
        events
    }

    /// Liveness of one node or, with `None`, of every node.
    pub async fn snapshot(&self, node_id: Option<i32>) -> Result<LivenessSnapshot> {
        let now = Instant::now();
        let records = self.records.read().await;
        let mut nodes = Vec::new();

        match node_id {
            Some(id) => {
                let record = records.get(&id).ok_or_else(|| {
                    CoordinationError::not_found(format!("node {} is not registered", id))
                })?;
                nodes.push(record.lock().await.to_liveness(id, now, self.heartbeat_interval));
            }
            None => {
                for (id, record) in records.iter() {
                    nodes.push(record.lock().await.to_liveness(*id, now, self.heartbeat_interval));
                }
                nodes.sort_by_key(|n| n.node_id);
            }
        }

        Ok(LivenessSnapshot {
            session_id: self.session_id.clone(),
            nodes,
        })
    }

    /// Status of a single node, if it is tracked.
    pub async fn status(&self, node_id: i32) -> Option<HealthStatus> {
        let records = self.records.read().await;
        match records.get(&node_id) {
            Some(record) => Some(record.lock().await.status),
            None => None,
        }
    }

    /// Stream of liveness snapshots: the current one first, then one per
    /// status change matching `node_id`.
    ///
    /// Dropping the stream ends the subscription.
    pub async fn watch(
        self: &Arc<Self>,
        node_id: Option<i32>,
    ) -> Result<ReceiverStream<LivenessSnapshot>> {
        // Subscribe before taking the snapshot so no transition slips between them
        let mut events = self.events_tx.subscribe();
        let initial = self.snapshot(node_id).await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let monitor = self.clone();

        tokio::spawn(async move {
            if tx.send(initial).await.is_err() {
                return;
            }

            loop {
                let changed = tokio::select! {
                    _ = tx.closed() => break,
                    event = events.recv() => match event {
                        Ok(event) => node_id.map_or(true, |id| id == event.node_id),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Health watcher lagged by {} events", skipped);
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if !changed {
                    continue;
                }

                let snapshot = match monitor.snapshot(node_id).await {
                    Ok(snapshot) => snapshot,
                    Err(_) => break,
                };
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }

            tracing::debug!("Health watcher for {:?} released", node_id);
        });

        Ok(ReceiverStream::new(rx))
    }

    fn transition(
        &self,
        node_id: i32,
        previous: HealthStatus,
        current: HealthStatus,
    ) -> Option<HealthEvent> {
        if previous == current {
            return None;
        }
        let event = HealthEvent {
            node_id,
            previous,
            current,
        };
        // No subscribers is fine
        let _ = self.events_tx.send(event);
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn monitor() -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new("session-1", INTERVAL, 3))
    }

    #[test]
    fn test_lease_saturates_instead_of_overflowing() {
        let monitor = HealthMonitor::new("session-1", Duration::from_secs(u64::MAX / 2), 3);
        assert_eq!(monitor.lease(), Duration::MAX);
        assert_eq!(monitor.heartbeat_interval(), Duration::from_secs(u64::MAX / 2));
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let monitor = monitor();
        let err = monitor.heartbeat(4).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_missed_heartbeat_tolerated() {
        let monitor = monitor();
        monitor.register(0, "boot-a").await;

        tokio::time::advance(INTERVAL * 2).await;
        assert!(monitor.sweep().await.is_empty());

        let snapshot = monitor.snapshot(Some(0)).await.unwrap();
        assert_eq!(snapshot.nodes[0].missed_heartbeats, 2);
        assert_eq!(snapshot.nodes[0].status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_exactly_once() {
        let monitor = monitor();
        monitor.register(0, "boot-a").await;
        monitor.register(1, "boot-b").await;

        for _ in 0..4 {
            tokio::time::advance(INTERVAL).await;
            monitor.heartbeat(1).await.unwrap();
        }

        let events = monitor.sweep().await;
        assert_eq!(
            events,
            vec![HealthEvent {
                node_id: 0,
                previous: HealthStatus::Healthy,
                current: HealthStatus::Unhealthy,
            }]
        );

        // Further misses do not produce more transitions
        tokio::time::advance(INTERVAL * 5).await;
        monitor.heartbeat(1).await.unwrap();
        assert!(monitor.sweep().await.is_empty());
        assert_eq!(monitor.status(0).await, Some(HealthStatus::Unhealthy));
        assert_eq!(monitor.status(1).await, Some(HealthStatus::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_recovers_node() {
        let monitor = monitor();
        monitor.register(0, "boot-a").await;
        tokio::time::advance(monitor.lease() + Duration::from_secs(1)).await;
        assert_eq!(monitor.sweep().await.len(), 1);

        let (status, event) = monitor.heartbeat(0).await.unwrap();
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(event.unwrap().current, HealthStatus::Healthy);

        // A second outage is reported again
        tokio::time::advance(monitor.lease() + Duration::from_secs(1)).await;
        assert_eq!(monitor.sweep().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_record() {
        let monitor = monitor();
        monitor.register(0, "boot-a").await;
        tokio::time::advance(monitor.lease() + Duration::from_secs(1)).await;
        monitor.sweep().await;

        let event = monitor.register(0, "boot-a2").await;
        assert_eq!(event.unwrap().current, HealthStatus::Healthy);

        let snapshot = monitor.snapshot(Some(0)).await.unwrap();
        assert_eq!(snapshot.nodes[0].boot_id, "boot-a2");
        assert_eq!(snapshot.nodes[0].missed_heartbeats, 0);
    }

    #[tokio::test]
    async fn test_snapshot_filter() {
        let monitor = monitor();
        monitor.register(1, "b").await;
        monitor.register(0, "a").await;

        let all = monitor.snapshot(None).await.unwrap();
        assert_eq!(all.session_id, "session-1");
        let ids: Vec<i32> = all.nodes.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![0, 1]);

        assert_eq!(monitor.snapshot(Some(1)).await.unwrap().nodes.len(), 1);
        assert!(monitor.snapshot(Some(9)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sees_one_transition() {
        let monitor = monitor();
        monitor.register(0, "boot-a").await;
        monitor.register(1, "boot-b").await;

        let mut stream = monitor.watch(None).await.unwrap();
        let initial = stream.next().await.unwrap();
        assert_eq!(initial.status_of(0), Some(HealthStatus::Healthy));

        for _ in 0..6 {
            tokio::time::advance(INTERVAL).await;
            monitor.heartbeat(1).await.unwrap();
            monitor.sweep().await;
        }

        let update = stream.next().await.unwrap();
        assert_eq!(update.status_of(0), Some(HealthStatus::Unhealthy));
        assert_eq!(update.status_of(1), Some(HealthStatus::Healthy));

        let nothing_more = tokio::time::timeout(Duration::from_secs(60), stream.next()).await;
        assert!(nothing_more.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_filter_ignores_other_nodes() {
        let monitor = monitor();
        monitor.register(0, "boot-a").await;
        monitor.register(1, "boot-b").await;

        let mut stream = monitor.watch(Some(1)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().nodes.len(), 1);

        tokio::time::advance(INTERVAL * 2).await;
        monitor.heartbeat(1).await.unwrap();
        tokio::time::advance(INTERVAL * 2).await;
        // Node 0 fails, node 1 is still within its lease
        assert_eq!(monitor.sweep().await.len(), 1);

        let nothing = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_dropped_watch_leaves_others_running() {
        let monitor = monitor();
        monitor.register(0, "boot-a").await;

        let first = monitor.watch(None).await.unwrap();
        let mut second = monitor.watch(None).await.unwrap();
        drop(first);

        second.next().await.unwrap();
        monitor.register(0, "boot-a2").await;
        assert_eq!(monitor.status(0).await, Some(HealthStatus::Healthy));
        assert!(monitor.watch(Some(3)).await.is_err());
    }
}
