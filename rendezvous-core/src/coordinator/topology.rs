//! Cluster-wide topology aggregation.
//!
//! Every node registers its local device inventory once. When the configured
//! number of nodes has registered, the aggregator assigns global device ids
//! and slice indices and hands the same [`GlobalTopology`] to every caller.
//!
//! Global ids follow the total order of (node id, local ordinal): nodes are
//! visited by ascending id, devices by ascending local ordinal, and ids are
//! handed out from zero. Every node can therefore rely on the same indexing
//! without a second negotiation round.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use super::deadline_after;
use super::protocol::{GlobalTopology, NodeTopology};
use crate::config::SliceIndexPolicy;
use crate::error::{CoordinationError, Result};

/// Progress of the registration quorum.
#[derive(Debug, Clone)]
pub enum RegistrationPhase {
    /// Waiting for more nodes.
    Collecting,
    /// Every node registered; the topology is final for the session.
    Complete(Arc<GlobalTopology>),
    /// The registration window closed before quorum.
    Failed,
}

/// Effect of accepting one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// First registration of this node id.
    New,
    /// Identical payload for an already registered node (a retry).
    Duplicate,
    /// Same node id with a new boot id: the host restarted.
    Restarted { previous_boot_id: String },
}

struct AggregatorState {
    /// Registrations as reported, keyed by node id.
    nodes: BTreeMap<i32, NodeTopology>,
    /// End of the registration window; opened by the first registration.
    deadline: Option<Instant>,
}

/// Collects node registrations until quorum and publishes the result.
pub struct TopologyAggregator {
    cluster_size: u32,
    registration_timeout: Duration,
    policy: SliceIndexPolicy,
    state: Mutex<AggregatorState>,
    phase_tx: watch::Sender<RegistrationPhase>,
}

impl TopologyAggregator {
    pub fn new(cluster_size: u32, registration_timeout: Duration, policy: SliceIndexPolicy) -> Self {
        let (phase_tx, _) = watch::channel(RegistrationPhase::Collecting);
        Self {
            cluster_size,
            registration_timeout,
            policy,
            state: Mutex::new(AggregatorState {
                nodes: BTreeMap::new(),
                deadline: None,
            }),
            phase_tx,
        }
    }

    /// Record a node's registration without waiting for quorum.
    ///
    /// Completes the quorum when this is the last missing node.
    pub async fn submit(&self, node: NodeTopology) -> Result<Submission> {
        node.validate(self.cluster_size)?;

        let mut state = self.state.lock().await;
        let phase = self.phase_tx.borrow().clone();

        match phase {
            RegistrationPhase::Failed => return Err(self.window_closed()),
            RegistrationPhase::Complete(topology) => {
                return self.resubmit_after_quorum(&mut state, &topology, node);
            }
            RegistrationPhase::Collecting => {}
        }

        let now = Instant::now();
        if let Some(deadline) = state.deadline {
            if now >= deadline {
                self.close_window(&state);
                return Err(self.window_closed());
            }
        }

        let submission = match state.nodes.get(&node.node_id) {
            Some(existing) if existing.same_registration(&node) => Submission::Duplicate,
            Some(existing) if existing.boot_id != node.boot_id => Submission::Restarted {
                previous_boot_id: existing.boot_id.clone(),
            },
            Some(_) => {
                return Err(CoordinationError::already_exists(format!(
                    "node {} is already registered with a different device set",
                    node.node_id
                )));
            }
            None => Submission::New,
        };

        let node_id = node.node_id;
        if submission != Submission::Duplicate {
            state.nodes.insert(node_id, node);
        }
        let deadline = *state
            .deadline
            .get_or_insert_with(|| deadline_after(now, self.registration_timeout));

        tracing::debug!(
            "Node {} registered ({}/{}), window closes in {:?}",
            node_id,
            state.nodes.len(),
            self.cluster_size,
            deadline.saturating_duration_since(now)
        );

        if state.nodes.len() == self.cluster_size as usize {
            let topology = build_global_topology(state.nodes.values(), self.policy);
            tracing::info!(
                "All {} nodes registered, {} devices in global topology",
                self.cluster_size,
                topology.device_count()
            );
            self.phase_tx
                .send_replace(RegistrationPhase::Complete(Arc::new(topology)));
        }

        Ok(submission)
    }

    /// Wait until every node has registered or the registration window closes.
    ///
    /// Dropping the returned future abandons the wait without touching the
    /// registration that was already recorded.
    pub async fn wait_for_quorum(&self) -> Result<Arc<GlobalTopology>> {
        let mut phase_rx = self.phase_tx.subscribe();

        let deadline = {
            let state = self.state.lock().await;
            match &*self.phase_tx.borrow() {
                RegistrationPhase::Complete(topology) => return Ok(topology.clone()),
                RegistrationPhase::Failed => return Err(self.window_closed()),
                RegistrationPhase::Collecting => {}
            }
            state.deadline.ok_or_else(|| {
                CoordinationError::failed_precondition(
                    "no node has registered yet; register before waiting for quorum",
                )
            })?
        };

        let settled = tokio::time::timeout_at(deadline, async {
            phase_rx
                .wait_for(|phase| !matches!(phase, RegistrationPhase::Collecting))
                .await
                .map(|phase| phase.clone())
        })
        .await;

        let phase = match settled {
            Ok(Ok(phase)) => phase,
            Ok(Err(_)) => {
                return Err(CoordinationError::aborted("coordinator is shutting down"));
            }
            Err(_) => {
                let state = self.state.lock().await;
                self.close_window(&state);
                let phase = self.phase_tx.borrow().clone();
                phase
            }
        };

        match phase {
            RegistrationPhase::Complete(topology) => Ok(topology),
            RegistrationPhase::Failed | RegistrationPhase::Collecting => Err(self.window_closed()),
        }
    }

    /// Register and wait for quorum in one call.
    pub async fn register(&self, node: NodeTopology) -> Result<Arc<GlobalTopology>> {
        self.submit(node).await?;
        self.wait_for_quorum().await
    }

    /// The global topology, if quorum has been reached.
    pub fn global_topology(&self) -> Option<Arc<GlobalTopology>> {
        match &*self.phase_tx.borrow() {
            RegistrationPhase::Complete(topology) => Some(topology.clone()),
            _ => None,
        }
    }

    /// Node ids registered so far, ascending.
    pub async fn registered_nodes(&self) -> Vec<i32> {
        self.state.lock().await.nodes.keys().copied().collect()
    }

    fn resubmit_after_quorum(
        &self,
        state: &mut AggregatorState,
        topology: &GlobalTopology,
        node: NodeTopology,
    ) -> Result<Submission> {
        let existing = state.nodes.get_mut(&node.node_id).ok_or_else(|| {
            CoordinationError::failed_precondition(format!(
                "node {} joined after the cluster formed",
                node.node_id
            ))
        })?;

        if existing.same_registration(&node) {
            return Ok(Submission::Duplicate);
        }

        let unchanged = existing.same_devices(&node) && existing.slice_index == node.slice_index;
        if existing.boot_id == node.boot_id || !unchanged {
            return Err(CoordinationError::failed_precondition(format!(
                "topology of node {} changed after the cluster formed",
                node.node_id
            )));
        }

        // Restarted host with the same devices: keep its global ids.
        let previous_boot_id = std::mem::replace(&mut existing.boot_id, node.boot_id.clone());
        let mut updated = topology.clone();
        if let Some(entry) = updated.nodes.iter_mut().find(|n| n.node_id == node.node_id) {
            entry.boot_id = node.boot_id;
        }
        self.phase_tx
            .send_replace(RegistrationPhase::Complete(Arc::new(updated)));

        Ok(Submission::Restarted { previous_boot_id })
    }

    /// Fail the quorum if the window has elapsed. Caller holds the state lock.
    fn close_window(&self, state: &AggregatorState) {
        let expired = state
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        if !expired {
            return;
        }

        let closed = self.phase_tx.send_if_modified(|phase| {
            if matches!(phase, RegistrationPhase::Collecting) {
                *phase = RegistrationPhase::Failed;
                true
            } else {
                false
            }
        });

        if closed {
            let missing: Vec<i32> = (0..self.cluster_size as i32)
                .filter(|id| !state.nodes.contains_key(id))
                .collect();
            tracing::warn!(
                "Topology registration window closed with {}/{} nodes, missing {:?}",
                state.nodes.len(),
                self.cluster_size,
                missing
            );
        }
    }

    fn window_closed(&self) -> CoordinationError {
        CoordinationError::deadline_exceeded(format!(
            "not all {} nodes registered before the registration deadline",
            self.cluster_size
        ))
    }
}

/// Assign global device ids and slice indices.
///
/// Pure function of the registrations: the result does not depend on the
/// order they are supplied in.
pub fn build_global_topology<'a>(
    registrations: impl IntoIterator<Item = &'a NodeTopology>,
    policy: SliceIndexPolicy,
) -> GlobalTopology {
    let mut nodes: Vec<NodeTopology> = registrations.into_iter().cloned().collect();
    nodes.sort_by_key(|n| n.node_id);

    // Derived slice numbers never reuse one a node asked for explicitly
    let claimed: HashSet<i32> = nodes.iter().filter_map(|n| n.slice_index).collect();
    let mut next_free = 0i32;
    let mut allocate = || {
        while claimed.contains(&next_free) {
            next_free += 1;
        }
        next_free += 1;
        next_free - 1
    };

    let mut boot_slices: HashMap<String, i32> = HashMap::new();
    let mut next_global_id = 0i32;

    for node in nodes.iter_mut() {
        let slice_index = match node.slice_index {
            Some(explicit) => explicit,
            None => match policy {
                SliceIndexPolicy::BootId => match boot_slices.get(&node.boot_id) {
                    Some(shared) => *shared,
                    None => {
                        let slice = allocate();
                        boot_slices.insert(node.boot_id.clone(), slice);
                        slice
                    }
                },
                SliceIndexPolicy::PerNode => allocate(),
                SliceIndexPolicy::Single => 0,
            },
        };
        node.slice_index = Some(slice_index);

        node.devices.sort_by_key(|d| d.local_ordinal);
        for device in &mut node.devices {
            device.global_device_id = next_global_id;
            device.slice_index = slice_index;
            next_global_id += 1;
        }
    }

    GlobalTopology { nodes }
}
