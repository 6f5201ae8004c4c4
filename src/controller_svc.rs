//! Implementation of gRPC methods from the CSI Controller service.

use std::sync::Arc;

use tonic::{Code, Request, Response, Status};

use crate::{
    disk::{hostimg_path, Disk},
    error::CsiError,
    registry::ControllerRegistry,
};

use super::csi::*;

const BACKING_CLAIM_KEY: &str = "backingClaim";
const DISK_TYPE_PARAM: &str = "diskType";

pub struct ControllerSvc {
    registry: Arc<ControllerRegistry>,
}

impl ControllerSvc {
    pub fn new(registry: Arc<ControllerRegistry>) -> Self {
        ControllerSvc { registry }
    }
}

#[tonic::async_trait]
impl controller_server::Controller for ControllerSvc {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("CreateVolume request for {}", req.name);

        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument {
                reason: "name must not be empty".to_string(),
            }
            .into());
        }

        let size_bytes = req
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes.max(0) as u64)
            .unwrap_or(0);
        if size_bytes == 0 {
            return Err(CsiError::InvalidArgument {
                reason: "capacity_range.required_bytes must be > 0".to_string(),
            }
            .into());
        }

        let backing_claim = req
            .parameters
            .get(BACKING_CLAIM_KEY)
            .cloned()
            .ok_or_else(|| {
                Status::from(CsiError::InvalidArgument {
                    reason: format!("missing required parameter {}", BACKING_CLAIM_KEY),
                })
            })?;

        let disk_type = req
            .parameters
            .get(DISK_TYPE_PARAM)
            .map(String::as_str)
            .unwrap_or("hostimg");

        let params = req.parameters.clone();
        let make_disk = move |id: String| -> Disk {
            match disk_type {
                "iscsi" => Disk::Iscsi {
                    portal: params.get("portal").cloned().unwrap_or_default(),
                    port: params
                        .get("port")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(3260),
                    iqn: params.get("iqn").cloned().unwrap_or_default(),
                    lun: params
                        .get("lun")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(1),
                },
                _ => Disk::HostImg {
                    size: size_bytes,
                    img_path: hostimg_path(&id),
                },
            }
        };

        let record = self
            .registry
            .create_or_get(&req.name, size_bytes, make_disk)
            .map_err(CsiError::from)?;

        let mut volume_context = record.disk.serialize_context();
        volume_context.insert(BACKING_CLAIM_KEY.to_string(), backing_claim);

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: record.size_bytes as i64,
                volume_id: record.id,
                volume_context,
                accessible_topology: None,
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("DeleteVolume request for {}", req.volume_id);
        self.registry.delete(&req.volume_id);
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: controller_service_capability::rpc::Type::CreateDeleteVolume
                            as i32,
                    },
                )),
            }],
        }))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Code::Unimplemented.into())
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(Code::Unimplemented.into())
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        Err(Code::Unimplemented.into())
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Code::Unimplemented.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_volume_rejects_missing_backing_claim() {
        let svc = ControllerSvc::new(Arc::new(ControllerRegistry::default()));
        let req = Request::new(CreateVolumeRequest {
            name: "v1".to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: 4096,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![],
            parameters: Default::default(),
            accessibility_requirements: None,
        });
        let err = svc.create_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_is_idempotent_by_name() {
        let svc = ControllerSvc::new(Arc::new(ControllerRegistry::default()));
        let mut params = std::collections::HashMap::new();
        params.insert(BACKING_CLAIM_KEY.to_string(), "pvc-src".to_string());

        let make_req = || {
            Request::new(CreateVolumeRequest {
                name: "v1".to_string(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 4096,
                    limit_bytes: 0,
                }),
                volume_capabilities: vec![],
                parameters: params.clone(),
                accessibility_requirements: None,
            })
        };

        let a = svc.create_volume(make_req()).await.unwrap().into_inner();
        let b = svc.create_volume(make_req()).await.unwrap().into_inner();
        assert_eq!(
            a.volume.unwrap().volume_id,
            b.volume.unwrap().volume_id
        );
    }
}
