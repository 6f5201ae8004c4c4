//! Implementation of gRPC methods from the CSI Node service.

use std::sync::Arc;

use tonic::{Code, Request, Response, Status};

use crate::{
    config,
    disk::Disk,
    error::CsiError,
    orchestrator::{Orchestrator, PublishRequest, StageRequest},
    registry::NodeRegistry,
};

use super::csi::*;

const BACKING_CLAIM_KEY: &str = "backingClaim";

pub struct NodeSvc {
    node_id: String,
    max_volumes_per_node: i64,
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<Orchestrator>,
}

impl NodeSvc {
    pub fn new(
        node_id: String,
        max_volumes_per_node: i64,
        registry: Arc<NodeRegistry>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        NodeSvc {
            node_id,
            max_volumes_per_node,
            registry,
            orchestrator,
        }
    }
}

fn require_non_empty(value: &str, field: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument {
            reason: format!("{} must not be empty", field),
        }
        .into());
    }
    Ok(())
}

fn is_block(capability: &Option<VolumeCapability>) -> Result<bool, Status> {
    match capability
        .as_ref()
        .and_then(|c| c.access_type.as_ref())
    {
        Some(volume_capability::AccessType::Block(_)) => Ok(true),
        Some(volume_capability::AccessType::Mount(_)) => Ok(false),
        None => Err(CsiError::InvalidArgument {
            reason: "volume_capability is required".to_string(),
        }
        .into()),
    }
}

#[tonic::async_trait]
impl node_server::Node for NodeSvc {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("NodeStageVolume request for {}", req.volume_id);

        require_non_empty(&req.volume_id, "volume_id")?;
        require_non_empty(&req.staging_target_path, "staging_target_path")?;
        let block_mode = is_block(&req.volume_capability)?;

        let lock = self.registry.lock_for(&req.volume_id);
        let _guard = lock.lock().await;

        let disk = Disk::deserialize_context(&req.volume_context)
            .map_err(|e| Status::from(CsiError::from(e)))?;
        let backing_claim = req
            .volume_context
            .get(BACKING_CLAIM_KEY)
            .cloned()
            .unwrap_or_default();

        let (fstype, mount_flags) = match req
            .volume_capability
            .as_ref()
            .and_then(|c| c.access_type.as_ref())
        {
            Some(volume_capability::AccessType::Mount(m)) => (
                if m.fs_type.is_empty() {
                    None
                } else {
                    Some(m.fs_type.clone())
                },
                m.mount_flags.clone(),
            ),
            _ => (None, vec![]),
        };

        self.orchestrator
            .stage(StageRequest {
                volume_id: req.volume_id,
                staging_path: req.staging_target_path,
                disk,
                backing_claim,
                block_mode,
                fstype,
                mount_flags,
            })
            .await
            .map_err(Status::from)?;

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("NodeUnstageVolume request for {}", req.volume_id);
        require_non_empty(&req.volume_id, "volume_id")?;

        let lock = self.registry.lock_for(&req.volume_id);
        let _guard = lock.lock().await;

        self.orchestrator
            .unstage(&req.volume_id)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("NodePublishVolume request for {}", req.volume_id);

        require_non_empty(&req.volume_id, "volume_id")?;
        require_non_empty(&req.staging_target_path, "staging_target_path")?;
        require_non_empty(&req.target_path, "target_path")?;
        let block_mode = is_block(&req.volume_capability)?;

        let mount_flags = match req
            .volume_capability
            .as_ref()
            .and_then(|c| c.access_type.as_ref())
        {
            Some(volume_capability::AccessType::Mount(m)) => m.mount_flags.clone(),
            _ => vec![],
        };

        let lock = self.registry.lock_for(&req.volume_id);
        let _guard = lock.lock().await;

        self.orchestrator
            .publish(PublishRequest {
                volume_id: req.volume_id,
                staging_path: req.staging_target_path,
                target_path: req.target_path,
                block_mode,
                readonly: req.readonly,
                mount_flags,
            })
            .await
            .map_err(Status::from)?;

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("NodeUnpublishVolume request for {}", req.volume_id);
        require_non_empty(&req.volume_id, "volume_id")?;
        require_non_empty(&req.target_path, "target_path")?;

        let lock = self.registry.lock_for(&req.volume_id);
        let _guard = lock.lock().await;

        self.orchestrator
            .unpublish(&req.target_path)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(
                    node_service_capability::Rpc {
                        r#type: node_service_capability::rpc::Type::StageUnstageVolume
                            as i32,
                    },
                )),
            }],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let mut segments = std::collections::HashMap::new();
        segments.insert(config::TOPOLOGY_KEY_NODE.to_string(), self.node_id.clone());

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: Some(Topology { segments }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_block_requires_a_capability() {
        assert!(is_block(&None).is_err());
    }

    #[test]
    fn is_block_detects_block_access_type() {
        let cap = Some(VolumeCapability {
            access_type: Some(volume_capability::AccessType::Block(
                volume_capability::BlockVolume {},
            )),
            access_mode: None,
        });
        assert!(is_block(&cap).unwrap());
    }
}
