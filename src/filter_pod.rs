//! Filter Pod Controller: launches the per-volume filter sidecar as
//! a cluster pod, waits for it to become reachable, and dials its gRPC
//! channel. Built on kube-rs, mirroring the donor's use of `kube`/
//! `k8s-openapi` for cluster-facing resources.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod,
    PersistentVolumeClaimVolumeSource, PodSpec, SecurityContext, Volume, VolumeDevice,
};
use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    Client,
};
use snafu::{OptionExt, ResultExt};

use crate::{
    config,
    error::{DialSnafu, FilterPodError, KubeSnafu, NoPodIpSnafu},
    filter::filter_client::FilterClient,
};

/// A running filter pod bound to one volume, with its gRPC channel.
pub struct FilterPodHandle {
    pub name: String,
    pub namespace: String,
    pub ip: String,
    pub client: FilterClient<tonic::transport::Channel>,
}

pub struct FilterPodController {
    client: Client,
    namespace: String,
}

impl FilterPodController {
    pub async fn new(namespace: &str) -> Result<Self, FilterPodError> {
        let client = Client::try_default()
            .await
            .context(KubeSnafu)?;
        Ok(FilterPodController {
            client,
            namespace: namespace.to_string(),
        })
    }

    /// Create the pod, wait for it to reach `Running`, and dial it.
    /// Best-effort deletes the pod on any failure along the way.
    pub async fn create(
        &self,
        volume_id: &str,
        backing_claim: &str,
    ) -> Result<FilterPodHandle, FilterPodError> {
        let name = pod_name(volume_id);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        let pod = self.pod_manifest(&name, backing_claim);

        if let Err(source) = pods.create(&PostParams::default(), &pod).await {
            return Err(FilterPodError::Kube { source });
        }

        match self.wait_running_and_dial(&pods, &name).await {
            Ok((ip, client)) => Ok(FilterPodHandle {
                name,
                namespace: self.namespace.clone(),
                ip,
                client,
            }),
            Err(e) => {
                if let Err(del_err) =
                    pods.delete(&name, &DeleteParams::default()).await
                {
                    warn!(
                        "best-effort delete of filter pod {} failed after setup error: {}",
                        name, del_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Request deletion without waiting for termination (§4.4 delete
    /// sequence).
    pub async fn delete(&self, name: &str) {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(e) = pods.delete(name, &DeleteParams::default()).await {
            warn!("failed to delete filter pod {}: {}", name, e);
        }
    }

    async fn wait_running_and_dial(
        &self,
        pods: &Api<Pod>,
        name: &str,
    ) -> Result<(String, FilterClient<tonic::transport::Channel>), FilterPodError> {
        let deadline = config::POD_WATCH_TIMEOUT;
        let start = std::time::Instant::now();

        let pod = tokio::time::timeout(deadline, async {
            loop {
                let pod = pods.get(name).await?;
                match pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                {
                    Some("Running") => return Ok(pod),
                    Some("Failed") | Some("Unknown") => {
                        return Err(kube::Error::Api(kube::core::ErrorResponse {
                            status: "Failure".into(),
                            message: "pod entered a terminal non-running phase"
                                .into(),
                            reason: "PodFailed".into(),
                            code: 0,
                        }))
                    }
                    _ => tokio::time::sleep(std::time::Duration::from_millis(500))
                        .await,
                }
            }
        })
        .await
        .map_err(|_| FilterPodError::Timeout {
            name: name.to_string(),
            elapsed: start.elapsed(),
            reason: "watch deadline exceeded".to_string(),
        })?
        .context(KubeSnafu)?;

        let ip = pod
            .status
            .and_then(|s| s.pod_ip)
            .context(NoPodIpSnafu {
                name: name.to_string(),
            })?;

        let addr = format!("http://{}:{}", ip, config::FILTER_GRPC_PORT);
        let channel = tonic::transport::Endpoint::from_shared(addr.clone())
            .map_err(|e| FilterPodError::Dial {
                name: name.to_string(),
                addr: addr.clone(),
                source: e,
            })?
            .connect()
            .await
            .context(DialSnafu {
                name: name.to_string(),
                addr,
            })?;

        Ok((ip, FilterClient::new(channel)))
    }

    /// Dial an already-running filter pod by IP, without the create/watch
    /// sequence. Used when a driver restart loses the in-memory channel but
    /// the registry still has the pod's last-known address (unstage path).
    pub async fn dial(&self, ip: &str) -> Result<FilterClient<tonic::transport::Channel>, FilterPodError> {
        let addr = format!("http://{}:{}", ip, config::FILTER_GRPC_PORT);
        let channel = tonic::transport::Endpoint::from_shared(addr.clone())
            .map_err(|e| FilterPodError::Dial {
                name: ip.to_string(),
                addr: addr.clone(),
                source: e,
            })?
            .connect()
            .await
            .context(DialSnafu {
                name: ip.to_string(),
                addr,
            })?;
        Ok(FilterClient::new(channel))
    }

    fn pod_manifest(&self, name: &str, backing_claim: &str) -> Pod {
        let cfg = config::config();
        let args = vec![
            "--endpoint".to_string(),
            format!("tcp://0.0.0.0:{}", config::FILTER_GRPC_PORT),
            "--tgtport".to_string(),
            config::FILTER_TGT_PORT.to_string(),
            "--tgtcontrol".to_string(),
            cfg.tgt_control.clone(),
        ];

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "csif-filter".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "filter".to_string(),
                    image: Some(cfg.filter_image.clone()),
                    args: Some(args),
                    env: Some(vec![EnvVar {
                        name: "POD_IP".to_string(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: "status.podIP".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    volume_devices: Some(vec![VolumeDevice {
                        name: "bstore-src".to_string(),
                        device_path: config::FILTER_SRC_DEVICE_PATH.to_string(),
                    }]),
                    security_context: Some(SecurityContext {
                        privileged: Some(true),
                        capabilities: Some(Capabilities {
                            add: Some(vec!["SYS_ADMIN".to_string()]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "bstore-src".to_string(),
                    persistent_volume_claim: Some(
                        PersistentVolumeClaimVolumeSource {
                            claim_name: backing_claim.to_string(),
                            read_only: Some(false),
                        },
                    ),
                    ..Default::default()
                }]),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn pod_name(volume_id: &str) -> String {
    format!("csif-filter-{}", volume_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_name_is_derived_from_volume_id() {
        assert_eq!(pod_name("abc-123"), "csif-filter-abc-123");
    }
}
