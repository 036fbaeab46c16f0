//! gRPC service implementation for the coordinator.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use rendezvous_core::coordinator::proto::coordinator_service_server::CoordinatorService;
use rendezvous_core::coordinator::proto::{
    CancelBarrierRequest, CancelBarrierResponse, EnterBarrierRequest, EnterBarrierResponse,
    GlobalTopology as ProtoGlobalTopology, HeartbeatRequest, HeartbeatResponse,
    KeyValueDeleteRequest, KeyValueDeleteResponse, KeyValueEntry, KeyValueGetDirectoryRequest,
    KeyValueGetDirectoryResponse, KeyValueGetRequest, KeyValueGetResponse, KeyValuePutRequest,
    KeyValuePutResponse, LivenessSnapshot as ProtoLivenessSnapshot,
    NodeTopology as ProtoNodeTopology, WatchHealthRequest,
};
use rendezvous_core::coordinator::NodeTopology;

use crate::state::Coordinator;

pub struct CoordinatorServiceImpl {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorServiceImpl {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[tonic::async_trait]
impl CoordinatorService for CoordinatorServiceImpl {
    async fn register_local_topology(
        &self,
        request: Request<ProtoNodeTopology>,
    ) -> Result<Response<ProtoGlobalTopology>, Status> {
        let node = NodeTopology::try_from(request.into_inner())?;
        let node_id = node.node_id;

        let topology = self.coordinator.register_local_topology(node).await?;
        tracing::debug!("Returning global topology to node {}", node_id);

        Ok(Response::new(topology.as_ref().clone().into()))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let ack = self.coordinator.heartbeat(req.node_id).await?;
        Ok(Response::new(ack.into()))
    }

    type WatchHealthStream =
        Pin<Box<dyn Stream<Item = Result<ProtoLivenessSnapshot, Status>> + Send + 'static>>;

    async fn watch_health(
        &self,
        request: Request<WatchHealthRequest>,
    ) -> Result<Response<Self::WatchHealthStream>, Status> {
        let req = request.into_inner();
        let snapshots = self.coordinator.watch_health(req.node_id).await?;

        tracing::debug!("Health watch opened for {:?}", req.node_id);
        let stream = snapshots.map(|snapshot| Ok(ProtoLivenessSnapshot::from(snapshot)));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn enter_barrier(
        &self,
        request: Request<EnterBarrierRequest>,
    ) -> Result<Response<EnterBarrierResponse>, Status> {
        let req = request.into_inner();
        let timeout = match req.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        self.coordinator
            .enter_barrier(&req.barrier_id, req.node_id, timeout)
            .await?;
        Ok(Response::new(EnterBarrierResponse {}))
    }

    async fn cancel_barrier(
        &self,
        request: Request<CancelBarrierRequest>,
    ) -> Result<Response<CancelBarrierResponse>, Status> {
        let req = request.into_inner();
        self.coordinator
            .cancel_barrier(&req.barrier_id, &req.reason)
            .await?;
        Ok(Response::new(CancelBarrierResponse {}))
    }

    async fn kv_put(
        &self,
        request: Request<KeyValuePutRequest>,
    ) -> Result<Response<KeyValuePutResponse>, Status> {
        let req = request.into_inner();
        self.coordinator.kv_put(&req.key, req.value).await?;
        Ok(Response::new(KeyValuePutResponse {}))
    }

    async fn kv_get(
        &self,
        request: Request<KeyValueGetRequest>,
    ) -> Result<Response<KeyValueGetResponse>, Status> {
        let req = request.into_inner();
        let value = self
            .coordinator
            .kv_get(&req.key, Duration::from_millis(req.timeout_ms))
            .await?;
        Ok(Response::new(KeyValueGetResponse { value }))
    }

    async fn kv_delete(
        &self,
        request: Request<KeyValueDeleteRequest>,
    ) -> Result<Response<KeyValueDeleteResponse>, Status> {
        let req = request.into_inner();
        self.coordinator.kv_delete(&req.key).await?;
        Ok(Response::new(KeyValueDeleteResponse {}))
    }

    async fn kv_get_directory(
        &self,
        request: Request<KeyValueGetDirectoryRequest>,
    ) -> Result<Response<KeyValueGetDirectoryResponse>, Status> {
        let req = request.into_inner();
        let entries = self
            .coordinator
            .kv_get_directory(&req.prefix)
            .await
            .into_iter()
            .map(|(key, value)| KeyValueEntry { key, value })
            .collect();
        Ok(Response::new(KeyValueGetDirectoryResponse { entries }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;

    use rendezvous_core::config::{ClientConfig, CoordinatorConfig};
    use rendezvous_core::coordinator::proto::coordinator_service_server::CoordinatorServiceServer;
    use rendezvous_core::coordinator::{
        CoordinatorClient, Device, DeviceAttribute, GrpcCoordinatorClient, HealthStatus,
    };
    use rendezvous_core::CoordinationError;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;

    async fn start_server(cluster_size: u32) -> (SocketAddr, Arc<Coordinator>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator = Arc::new(Coordinator::new(CoordinatorConfig {
            cluster_size,
            ..Default::default()
        }));

        let service = CoordinatorServiceImpl::new(coordinator.clone());
        tokio::spawn(async move {
            Server::builder()
                .add_service(CoordinatorServiceServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        (addr, coordinator)
    }

    async fn connect(addr: SocketAddr) -> GrpcCoordinatorClient {
        let mut client = GrpcCoordinatorClient::new(ClientConfig {
            address: addr.to_string(),
            ..Default::default()
        });
        client.connect_with_retry().await.unwrap();
        client
    }

    fn accelerator(ordinal: i32) -> Device {
        let mut attributes = BTreeMap::new();
        attributes.insert("coords".to_string(), DeviceAttribute::IntList(vec![0, 1, 0]));
        attributes.insert("core_on_chip".to_string(), DeviceAttribute::Int(ordinal as i64));
        attributes.insert("clock_ghz".to_string(), DeviceAttribute::Float(1.5));
        Device {
            local_ordinal: ordinal,
            name: format!("accel-{}", ordinal),
            vendor: "acme".to_string(),
            device_kind: "v5".to_string(),
            core_count: 2,
            attributes,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_registration_over_grpc() {
        let (addr, _coordinator) = start_server(2).await;
        let node0 = connect(addr).await;
        let node1 = connect(addr).await;

        let first = tokio::spawn(async move {
            node1
                .register_local_topology(
                    NodeTopology::new(1, "host-b")
                        .with_device(accelerator(0))
                        .with_device(accelerator(1)),
                )
                .await
        });
        let topology = node0
            .register_local_topology(NodeTopology::new(0, "host-a").with_device(accelerator(0)))
            .await
            .unwrap();
        let other = first.await.unwrap().unwrap();

        assert_eq!(topology, other);
        let ids: Vec<i32> = topology.devices().map(|d| d.global_device_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let device = &topology.nodes[1].devices[1];
        assert_eq!(device.attributes["coords"], DeviceAttribute::IntList(vec![0, 1, 0]));
        assert_eq!(device.attributes["clock_ghz"], DeviceAttribute::Float(1.5));
        assert_eq!(topology.nodes[0].slice_index, Some(0));
        assert_eq!(topology.nodes[1].slice_index, Some(1));
    }

    #[tokio::test]
    async fn test_status_codes_reach_client() {
        let (addr, coordinator) = start_server(1).await;
        let client = connect(addr).await;

        let err = client.heartbeat(0).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));

        let err = client
            .register_local_topology(NodeTopology::new(5, "host"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument { .. }));

        let err = client
            .kv_get("missing", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));

        client.cancel_barrier("init", "operator request").await.unwrap();
        let err = client.enter_barrier("init", 0, None).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Aborted { .. }));

        assert!(coordinator.global_topology().is_none());
    }

    #[tokio::test]
    async fn test_session_over_grpc() {
        let (addr, coordinator) = start_server(1).await;
        let client = connect(addr).await;

        client
            .register_local_topology(NodeTopology::new(0, "host-a").with_device(accelerator(0)))
            .await
            .unwrap();

        let ack = client.heartbeat(0).await.unwrap();
        assert_eq!(ack.session_id, coordinator.session_id());
        assert_eq!(ack.status, HealthStatus::Healthy);

        let mut health = client.watch_health(None).await.unwrap();
        let snapshot = health.next().await.unwrap().unwrap();
        assert_eq!(snapshot.status_of(0), Some(HealthStatus::Healthy));

        client.kv_put("addr/0", b"10.0.0.1".to_vec()).await.unwrap();
        client.kv_put("addr/1", b"10.0.0.2".to_vec()).await.unwrap();
        assert_eq!(
            client.kv_get("addr/0", Duration::from_secs(1)).await.unwrap(),
            b"10.0.0.1"
        );
        client.kv_delete("addr/1").await.unwrap();
        let entries = client.kv_get_directory("addr/").await.unwrap();
        assert_eq!(entries, vec![("addr/0".to_string(), b"10.0.0.1".to_vec())]);

        client
            .enter_barrier("init", 0, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let token = coordinator.shutdown_token();
        client.enter_barrier("shutdown", 0, None).await.unwrap();
        assert!(token.is_cancelled());
        assert!(coordinator.kv_get_directory("").await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_watch_filter_is_not_found() {
        let (addr, _coordinator) = start_server(1).await;
        let client = connect(addr).await;

        let err = match client.watch_health(Some(3)).await {
            Ok(_) => panic!("watch on unknown node succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, CoordinationError::NotFound { .. }));
    }
}
