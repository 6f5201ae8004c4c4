//! Implementation of gRPC methods from CSI Identity gRPC service.

use std::collections::HashMap;

use tonic::{Code, Request, Response, Status};

use crate::config;

use super::csi::*;

const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, Default)]
pub struct Identity {}

#[tonic::async_trait]
impl identity_server::Identity for Identity {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        let name = config::config().driver_name.clone();
        debug!("GetPluginInfo request ({}:{})", name, PLUGIN_VERSION);

        Ok(Response::new(GetPluginInfoResponse {
            name,
            vendor_version: PLUGIN_VERSION.to_owned(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let caps = vec![
            plugin_capability::service::Type::ControllerService,
            plugin_capability::service::Type::VolumeAccessibilityConstraints,
        ];
        debug!("GetPluginCapabilities request: {:?}", caps);

        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| PluginCapability {
                    r#type: Some(plugin_capability::Type::Service(
                        plugin_capability::Service { r#type: c as i32 },
                    )),
                })
                .collect(),
        }))
    }

    /// There is no separate subsystem to wait on; readiness of this plugin
    /// is readiness of the gRPC server itself, so there's nothing a liveness
    /// probe can usefully ask beyond "did the call return".
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Err(Status::new(Code::Unimplemented, "Probe is not implemented"))
    }
}
