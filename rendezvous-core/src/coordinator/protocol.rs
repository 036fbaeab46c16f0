//! Protocol wrapper types for coordinator messages.
//!
//! This module provides Rust-friendly wrapper types around the generated
//! protobuf messages, with conversion traits for ergonomic usage.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::{CoordinationError, Result};

// Re-export proto types for internal use
pub(crate) use super::proto;

/// Typed device property.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAttribute {
    String(String),
    Bool(bool),
    Int(i64),
    IntList(Vec<i64>),
    Float(f32),
}

impl TryFrom<proto::DeviceAttribute> for DeviceAttribute {
    type Error = CoordinationError;

    fn try_from(attr: proto::DeviceAttribute) -> Result<Self> {
        use proto::device_attribute::Attribute;

        match attr.attribute {
            Some(Attribute::StringValue(v)) => Ok(Self::String(v)),
            Some(Attribute::BoolValue(v)) => Ok(Self::Bool(v)),
            Some(Attribute::IntValue(v)) => Ok(Self::Int(v)),
            Some(Attribute::IntValues(list)) => Ok(Self::IntList(list.values)),
            Some(Attribute::FloatValue(v)) => Ok(Self::Float(v)),
            None => Err(CoordinationError::invalid_argument(
                "device attribute carries no value",
            )),
        }
    }
}

impl From<DeviceAttribute> for proto::DeviceAttribute {
    fn from(attr: DeviceAttribute) -> Self {
        use proto::device_attribute::Attribute;

        let attribute = match attr {
            DeviceAttribute::String(v) => Attribute::StringValue(v),
            DeviceAttribute::Bool(v) => Attribute::BoolValue(v),
            DeviceAttribute::Int(v) => Attribute::IntValue(v),
            DeviceAttribute::IntList(values) => Attribute::IntValues(proto::Int64List { values }),
            DeviceAttribute::Float(v) => Attribute::FloatValue(v),
        };
        Self {
            attribute: Some(attribute),
        }
    }
}

/// One accelerator attached to a node.
///
/// `global_device_id` and `slice_index` are assigned by the coordinator;
/// whatever a node agent puts there at registration time is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    /// Ordinal of the device within its node.
    pub local_ordinal: i32,
    pub name: String,
    pub vendor: String,
    pub device_kind: String,
    pub compute_capability: String,
    pub core_count: i32,
    /// Identifier of the fast-interconnect fabric the device sits on.
    pub fabric_uuid: String,
    pub shared_memory_per_block_optin: i32,
    /// Human-readable rendering supplied by the driver.
    pub display_string: String,
    pub debug_string: String,
    pub attributes: BTreeMap<String, DeviceAttribute>,
    pub global_device_id: i32,
    pub slice_index: i32,
}

impl Device {
    /// Compares everything a node reports about the device, ignoring the
    /// coordinator-assigned fields.
    pub fn same_inventory(&self, other: &Device) -> bool {
        self.local_ordinal == other.local_ordinal
            && self.name == other.name
            && self.vendor == other.vendor
            && self.device_kind == other.device_kind
            && self.compute_capability == other.compute_capability
            && self.core_count == other.core_count
            && self.fabric_uuid == other.fabric_uuid
            && self.shared_memory_per_block_optin == other.shared_memory_per_block_optin
            && self.display_string == other.display_string
            && self.debug_string == other.debug_string
            && self.attributes == other.attributes
    }
}

impl TryFrom<proto::Device> for Device {
    type Error = CoordinationError;

    fn try_from(device: proto::Device) -> Result<Self> {
        let ordinal = device.local_device_ordinal;
        let attributes = device
            .attributes
            .into_iter()
            .map(|(name, attr)| {
                DeviceAttribute::try_from(attr)
                    .map(|value| (name.clone(), value))
                    .map_err(|_| {
                        CoordinationError::invalid_argument(format!(
                            "attribute '{}' of device {} carries no value",
                            name, ordinal
                        ))
                    })
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            local_ordinal: device.local_device_ordinal,
            name: device.name,
            vendor: device.vendor,
            device_kind: device.device_kind,
            compute_capability: device.compute_capability,
            core_count: device.core_count,
            fabric_uuid: device.fabric_uuid,
            shared_memory_per_block_optin: device.shared_memory_per_block_optin,
            display_string: device.to_string,
            debug_string: device.debug_string,
            attributes,
            global_device_id: device.global_device_id,
            slice_index: device.slice_index,
        })
    }
}

impl From<Device> for proto::Device {
    fn from(device: Device) -> Self {
        Self {
            local_device_ordinal: device.local_ordinal,
            name: device.name,
            vendor: device.vendor,
            global_device_id: device.global_device_id,
            slice_index: device.slice_index,
            compute_capability: device.compute_capability,
            core_count: device.core_count,
            device_kind: device.device_kind,
            to_string: device.display_string,
            debug_string: device.debug_string,
            attributes: device
                .attributes
                .into_iter()
                .map(|(name, value)| (name, value.into()))
                .collect(),
            fabric_uuid: device.fabric_uuid,
            shared_memory_per_block_optin: device.shared_memory_per_block_optin,
        }
    }
}

/// Device inventory reported by one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTopology {
    pub node_id: i32,
    /// Identifies one OS-instance lifetime of the host.
    pub boot_id: String,
    pub devices: Vec<Device>,
    /// Explicit slice index; derived by the coordinator when absent.
    pub slice_index: Option<i32>,
}

impl NodeTopology {
    pub fn new(node_id: i32, boot_id: impl Into<String>) -> Self {
        Self {
            node_id,
            boot_id: boot_id.into(),
            devices: Vec::new(),
            slice_index: None,
        }
    }

    /// Add a device to this node.
    pub fn with_device(mut self, device: Device) -> Self {
        self.devices.push(device);
        self
    }

    /// Check a registration against the cluster size.
    pub fn validate(&self, cluster_size: u32) -> Result<()> {
        if self.node_id < 0 || self.node_id as u32 >= cluster_size {
            return Err(CoordinationError::invalid_argument(format!(
                "node id {} outside cluster of size {}",
                self.node_id, cluster_size
            )));
        }
        if self.boot_id.is_empty() {
            return Err(CoordinationError::invalid_argument(format!(
                "node {} registered without a boot id",
                self.node_id
            )));
        }
        if let Some(slice) = self.slice_index {
            if slice < 0 {
                return Err(CoordinationError::invalid_argument(format!(
                    "node {} has negative slice index {}",
                    self.node_id, slice
                )));
            }
        }

        let mut seen = HashSet::with_capacity(self.devices.len());
        for device in &self.devices {
            if device.local_ordinal < 0 {
                return Err(CoordinationError::invalid_argument(format!(
                    "node {} has negative local device ordinal {}",
                    self.node_id, device.local_ordinal
                )));
            }
            if !seen.insert(device.local_ordinal) {
                return Err(CoordinationError::invalid_argument(format!(
                    "node {} reports local device ordinal {} twice",
                    self.node_id, device.local_ordinal
                )));
            }
        }
        Ok(())
    }

    /// Whether both registrations describe the same set of devices.
    pub fn same_devices(&self, other: &NodeTopology) -> bool {
        if self.devices.len() != other.devices.len() {
            return false;
        }
        let mut mine: Vec<&Device> = self.devices.iter().collect();
        let mut theirs: Vec<&Device> = other.devices.iter().collect();
        mine.sort_by_key(|d| d.local_ordinal);
        theirs.sort_by_key(|d| d.local_ordinal);
        mine.iter().zip(theirs.iter()).all(|(a, b)| a.same_inventory(b))
    }

    /// Whether a repeated registration carries exactly the same payload.
    pub fn same_registration(&self, other: &NodeTopology) -> bool {
        self.node_id == other.node_id
            && self.boot_id == other.boot_id
            && self.slice_index == other.slice_index
            && self.same_devices(other)
    }
}

impl TryFrom<proto::NodeTopology> for NodeTopology {
    type Error = CoordinationError;

    fn try_from(node: proto::NodeTopology) -> Result<Self> {
        let devices = node
            .devices
            .into_iter()
            .map(Device::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            node_id: node.node_id,
            boot_id: node.boot_id,
            devices,
            slice_index: node.slice_index,
        })
    }
}

impl From<NodeTopology> for proto::NodeTopology {
    fn from(node: NodeTopology) -> Self {
        Self {
            node_id: node.node_id,
            boot_id: node.boot_id,
            devices: node.devices.into_iter().map(Into::into).collect(),
            slice_index: node.slice_index,
        }
    }
}

/// Cluster-wide topology, nodes ordered by node id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalTopology {
    pub nodes: Vec<NodeTopology>,
}

impl GlobalTopology {
    /// Look up a node by id.
    pub fn node(&self, node_id: i32) -> Option<&NodeTopology> {
        self.nodes
            .binary_search_by_key(&node_id, |n| n.node_id)
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    /// Total number of devices across all nodes.
    pub fn device_count(&self) -> usize {
        self.nodes.iter().map(|n| n.devices.len()).sum()
    }

    /// Iterate over every device in global id order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.nodes.iter().flat_map(|n| n.devices.iter())
    }
}

impl TryFrom<proto::GlobalTopology> for GlobalTopology {
    type Error = CoordinationError;

    fn try_from(topology: proto::GlobalTopology) -> Result<Self> {
        let mut nodes = topology
            .nodes
            .into_iter()
            .map(NodeTopology::try_from)
            .collect::<Result<Vec<_>>>()?;
        nodes.sort_by_key(|n| n.node_id);
        Ok(Self { nodes })
    }
}

impl From<GlobalTopology> for proto::GlobalTopology {
    fn from(topology: GlobalTopology) -> Self {
        Self {
            nodes: topology.nodes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Liveness status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
}

impl From<proto::HealthStatus> for HealthStatus {
    fn from(status: proto::HealthStatus) -> Self {
        match status {
            proto::HealthStatus::Unspecified => Self::Healthy,
            proto::HealthStatus::Healthy => Self::Healthy,
            proto::HealthStatus::Unhealthy => Self::Unhealthy,
        }
    }
}

impl From<HealthStatus> for proto::HealthStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => Self::Healthy,
            HealthStatus::Unhealthy => Self::Unhealthy,
        }
    }
}

impl From<i32> for HealthStatus {
    fn from(value: i32) -> Self {
        proto::HealthStatus::try_from(value)
            .unwrap_or(proto::HealthStatus::Unspecified)
            .into()
    }
}

/// Status transition published by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEvent {
    pub node_id: i32,
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

/// Liveness of one node as seen by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLiveness {
    pub node_id: i32,
    pub boot_id: String,
    pub status: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub missed_heartbeats: u32,
}

impl From<proto::NodeLiveness> for NodeLiveness {
    fn from(node: proto::NodeLiveness) -> Self {
        Self {
            node_id: node.node_id,
            boot_id: node.boot_id,
            status: HealthStatus::from(node.status),
            last_heartbeat: DateTime::from_timestamp_millis(node.last_heartbeat_ms)
                .unwrap_or_default(),
            missed_heartbeats: node.missed_heartbeats,
        }
    }
}

impl From<NodeLiveness> for proto::NodeLiveness {
    fn from(node: NodeLiveness) -> Self {
        Self {
            node_id: node.node_id,
            status: proto::HealthStatus::from(node.status) as i32,
            last_heartbeat_ms: node.last_heartbeat.timestamp_millis(),
            missed_heartbeats: node.missed_heartbeats,
            boot_id: node.boot_id,
        }
    }
}

/// Point-in-time view of cluster liveness, nodes ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LivenessSnapshot {
    pub session_id: String,
    pub nodes: Vec<NodeLiveness>,
}

impl LivenessSnapshot {
    pub fn status_of(&self, node_id: i32) -> Option<HealthStatus> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .map(|n| n.status)
    }
}

impl From<proto::LivenessSnapshot> for LivenessSnapshot {
    fn from(snapshot: proto::LivenessSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            nodes: snapshot.nodes.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<LivenessSnapshot> for proto::LivenessSnapshot {
    fn from(snapshot: LivenessSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            nodes: snapshot.nodes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Coordinator reply to a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatAck {
    pub session_id: String,
    /// Cadence the coordinator expects heartbeats at.
    pub heartbeat_interval_ms: u64,
    pub status: HealthStatus,
}

impl From<proto::HeartbeatResponse> for HeartbeatAck {
    fn from(response: proto::HeartbeatResponse) -> Self {
        Self {
            session_id: response.session_id,
            heartbeat_interval_ms: response.heartbeat_interval_ms,
            status: HealthStatus::from(response.status),
        }
    }
}

impl From<HeartbeatAck> for proto::HeartbeatResponse {
    fn from(ack: HeartbeatAck) -> Self {
        Self {
            session_id: ack.session_id,
            heartbeat_interval_ms: ack.heartbeat_interval_ms,
            status: proto::HealthStatus::from(ack.status) as i32,
        }
    }
}
