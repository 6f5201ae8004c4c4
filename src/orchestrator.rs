//! Stage/Publish Orchestrator: the node-side state machine that
//! composes the Filter Pod Controller, Target Daemon Driver, Initiator
//! Client and Loop Device Helper into one reversible per-volume
//! attachment. Every forward step pushes a compensator; any later failure
//! unwinds the stack LIFO, logging but never aborting on a compensator's
//! own failure.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::Mutex as AsyncMutex;

use crate::{
    config,
    disk::Disk,
    error::{CsiError, StageError},
    filter::{CreateTargetRequest, DeleteTargetRequest},
    filter_pod::FilterPodController,
    format,
    iscsi_initiator::{IscsiConnector, IscsiInitiator},
    mount,
    registry::{Attachment, NodeRegistry},
    tgtd::TargetDaemonDriver,
};

pub struct StageRequest {
    pub volume_id: String,
    pub staging_path: String,
    pub disk: Disk,
    pub backing_claim: String,
    pub block_mode: bool,
    pub fstype: Option<String>,
    pub mount_flags: Vec<String>,
}

pub struct PublishRequest {
    pub volume_id: String,
    pub staging_path: String,
    pub target_path: String,
    pub block_mode: bool,
    pub readonly: bool,
    pub mount_flags: Vec<String>,
}

/// One reverse action: an already-built, not-yet-polled future that owns
/// everything it needs to run independently of the forward call stack. Each
/// forward step pushes one of these; `unwind` drives the stack LIFO,
/// awaiting (and thus running) each compensator in turn. A compensator never
/// returns an error — failures are logged internally and swallowed, so one
/// bad compensator can never stop the rest of the rollback.
type Compensator = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Drive every compensator on the stack, most-recently-pushed first.
async fn unwind(stack: Vec<Compensator>) {
    for comp in stack.into_iter().rev() {
        comp.await;
    }
}

pub struct Orchestrator {
    registry: Arc<NodeRegistry>,
    tgtd: Arc<AsyncMutex<TargetDaemonDriver>>,
    filter_ns: String,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        tgtd: Arc<AsyncMutex<TargetDaemonDriver>>,
        filter_ns: String,
    ) -> Self {
        Orchestrator {
            registry,
            tgtd,
            filter_ns,
        }
    }

    pub async fn stage(&self, req: StageRequest) -> Result<Attachment, CsiError> {
        if let Some(existing) = self.registry.get(&req.volume_id) {
            if !existing.staging_path.is_empty() || req.block_mode {
                return Ok(existing);
            }
        }

        let mut stack: Vec<Compensator> = Vec::new();
        match self.stage_inner(&req, &mut stack).await {
            Ok(attachment) => {
                self.registry.insert(&req.volume_id, attachment.clone());
                Ok(attachment)
            }
            Err(e) => {
                unwind(stack).await;
                Err(e)
            }
        }
    }

    async fn stage_inner(
        &self,
        req: &StageRequest,
        stack: &mut Vec<Compensator>,
    ) -> Result<Attachment, CsiError> {
        let step = |name: &'static str, reason: String| StageError::Step {
            step: name,
            volume_id: req.volume_id.clone(),
            reason,
        };

        // 1. DISK_ATTACHED
        let src_dev = req
            .disk
            .attach()
            .await
            .map_err(|e| step("disk_attach", e.to_string()))?;
        {
            let disk = req.disk.clone();
            stack.push(Box::pin(async move {
                if let Err(e) = disk.detach().await {
                    warn!("rollback: disk detach failed: {}", e);
                }
            }));
        }

        // 2. FILTER_UP
        let filter_ctl = FilterPodController::new(&self.filter_ns)
            .await
            .map_err(CsiError::from)?;
        let filter_pod = filter_ctl
            .create(&req.volume_id, &req.backing_claim)
            .await
            .map_err(CsiError::from)?;
        {
            let filter_ns = self.filter_ns.clone();
            let name = filter_pod.name.clone();
            stack.push(Box::pin(async move {
                if let Ok(ctl) = FilterPodController::new(&filter_ns).await {
                    ctl.delete(&name).await;
                }
            }));
        }

        // 3. LOCAL_TARGET_UP
        let local_target = {
            let mut driver = self.tgtd.lock().await;
            driver
                .create_disk(config::IQN_PREFIX_CLIENT, &src_dev)
                .map_err(|e| step("local_target_up", e.to_string()))?
        };
        {
            let tgtd = self.tgtd.clone();
            let target = local_target.clone();
            stack.push(Box::pin(async move {
                let mut driver = tgtd.lock().await;
                if let Err(e) = driver.delete_disk(&target) {
                    warn!("rollback: local target delete failed: {}", e);
                }
            }));
        }

        // 4. REMOTE_FILTER_SESSION
        let mut filter_client = filter_pod.client.clone();
        let reply = filter_client
            .create_target(CreateTargetRequest {})
            .await
            .map_err(|e| step("remote_filter_session", e.to_string()))?
            .into_inner();
        {
            let mut client = filter_client.clone();
            stack.push(Box::pin(async move {
                if let Err(e) = client.delete_target(DeleteTargetRequest {}).await {
                    warn!("rollback: filter DeleteTarget failed: {}", e);
                }
            }));
        }

        // 5. REMOTE_SESSION_UP
        let connector = IscsiConnector {
            portal: reply.portal.clone(),
            port: reply.port as u16,
            iqn: reply.iqn.clone(),
            lun: 1,
        };
        let out_dev = IscsiInitiator::connect(&connector)
            .await
            .map_err(|e| step("remote_session_up", e))?;
        {
            let iqn = connector.iqn.clone();
            let portal_arg = format!("{}:{}", connector.portal, connector.port);
            stack.push(Box::pin(async move {
                if let Err(e) = IscsiInitiator::disconnect(&iqn, &portal_arg).await {
                    warn!("rollback: iscsi logout of {} failed: {}", iqn, e);
                }
            }));
        }

        // 6. STAGED
        let staging_path = if req.block_mode {
            req.staging_path.clone()
        } else if mount::is_mountpoint(&req.staging_path) {
            req.staging_path.clone()
        } else {
            let fstype = req
                .fstype
                .clone()
                .unwrap_or_else(|| config::DEFAULT_FS.to_string());
            std::fs::create_dir_all(&req.staging_path).map_err(|e| {
                step("staged_mkdir", e.to_string())
            })?;
            format::probed_format(&req.volume_id, &out_dev, &fstype)
                .await
                .map_err(CsiError::from)?;
            mount::filesystem_mount(
                &out_dev,
                &req.staging_path,
                &fstype,
                &req.mount_flags,
            )
            .map_err(|source| {
                CsiError::from(StageError::Mount {
                    volume_id: req.volume_id.clone(),
                    source,
                })
            })?;
            req.staging_path.clone()
        };

        Ok(Attachment {
            staging_path,
            disk: req.disk.clone(),
            local_src_dev: src_dev,
            out_dev,
            local_target,
            filter_pod_name: filter_pod.name,
            filter_pod_ip: filter_pod.ip,
            filter_iqn: reply.iqn,
            filter_portal: reply.portal,
            filter_port: reply.port as u16,
            fstype: req.fstype.clone(),
        })
    }

    /// Idempotent teardown: an unknown volume id is success, so a retried
    /// unstage after a driver restart never fails just because the
    /// in-memory registry entry is already gone.
    pub async fn unstage(&self, volume_id: &str) -> Result<(), CsiError> {
        let Some(attachment) = self.registry.remove(volume_id) else {
            return Ok(());
        };

        let mut stack: Vec<Compensator> = Vec::new();

        if !attachment.staging_path.is_empty() {
            let path = attachment.staging_path.clone();
            stack.push(Box::pin(async move {
                if let Err(e) = mount::filesystem_unmount(&path) {
                    warn!("rollback: unmount of {} failed: {}", path, e);
                }
            }));
        }

        {
            let iqn = attachment.filter_iqn.clone();
            let portal_arg = format!("{}:{}", attachment.filter_portal, attachment.filter_port);
            stack.push(Box::pin(async move {
                if let Err(e) = IscsiInitiator::disconnect(&iqn, &portal_arg).await {
                    warn!("rollback: iscsi logout of {} failed: {}", iqn, e);
                }
            }));
        }

        if let Ok(ctl) = FilterPodController::new(&self.filter_ns).await {
            if !attachment.filter_pod_ip.is_empty() {
                if let Ok(mut client) = ctl.dial(&attachment.filter_pod_ip).await {
                    stack.push(Box::pin(async move {
                        if let Err(e) = client.delete_target(DeleteTargetRequest {}).await {
                            warn!("rollback: filter DeleteTarget failed: {}", e);
                        }
                    }));
                }
            }
            let name = attachment.filter_pod_name.clone();
            stack.push(Box::pin(async move {
                ctl.delete(&name).await;
            }));
        }

        {
            let tgtd = self.tgtd.clone();
            let target = attachment.local_target.clone();
            stack.push(Box::pin(async move {
                let mut driver = tgtd.lock().await;
                if let Err(e) = driver.delete_disk(&target) {
                    warn!("rollback: local target delete failed: {}", e);
                }
            }));
        }

        {
            let disk = attachment.disk.clone();
            stack.push(Box::pin(async move {
                if let Err(e) = disk.detach().await {
                    warn!("rollback: disk detach failed: {}", e);
                }
            }));
        }

        unwind(stack).await;
        Ok(())
    }

    pub async fn publish(&self, req: PublishRequest) -> Result<(), CsiError> {
        let attachment = self
            .registry
            .get(&req.volume_id)
            .ok_or(CsiError::VolumeNotFound {
                id: req.volume_id.clone(),
            })?;

        if req.block_mode {
            if let Some(existing) = mount::find_mount(None, Some(&req.target_path)) {
                if existing.source.to_string_lossy() != attachment.out_dev {
                    return Err(CsiError::AlreadyExists {
                        reason: format!(
                            "{} is already mounted from a different device",
                            req.target_path
                        ),
                    });
                }
                return Ok(());
            }
        } else if let Some(existing) = mount::find_mount(None, Some(&req.target_path)) {
            if existing.source.to_string_lossy() != attachment.staging_path {
                return Err(CsiError::AlreadyExists {
                    reason: format!(
                        "{} is already mounted from a different source",
                        req.target_path
                    ),
                });
            }
            let mut wanted = req.mount_flags.clone();
            if req.readonly {
                wanted.push("ro".to_string());
            }
            if !mount::subset(&wanted, &existing.options) {
                return Err(CsiError::AlreadyExists {
                    reason: format!(
                        "{} is already mounted with incompatible flags",
                        req.target_path
                    ),
                });
            }
            return Ok(());
        }

        let result = if req.block_mode {
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&req.target_path)
                .map_err(|e| CsiError::Internal {
                    reason: format!("creating block target path: {}", e),
                })
                .and_then(|_| {
                    mount::blockdevice_mount(
                        &attachment.out_dev,
                        &req.target_path,
                        req.readonly,
                    )
                    .map(|_| ())
                    .map_err(|e| CsiError::Internal {
                        reason: format!("bind-mounting block device: {}", e),
                    })
                })
        } else {
            std::fs::create_dir_all(&req.target_path)
                .map_err(|e| CsiError::Internal {
                    reason: format!("creating mount target path: {}", e),
                })
                .and_then(|_| {
                    mount::bind_mount(&attachment.staging_path, &req.target_path, false)
                        .map_err(|e| CsiError::Internal {
                            reason: format!("bind-mounting staging path: {}", e),
                        })
                })
                .and_then(|_| {
                    if req.readonly {
                        let mut flags = req.mount_flags.clone();
                        flags.push("ro".to_string());
                        mount::bind_remount(&req.target_path, &flags)
                            .map(|_| ())
                            .map_err(|e| CsiError::Internal {
                                reason: format!("remounting readonly: {}", e),
                            })
                    } else {
                        Ok(())
                    }
                })
        };

        if result.is_err() {
            let _ = std::fs::remove_file(&req.target_path);
            let _ = std::fs::remove_dir(&req.target_path);
        }
        result
    }

    pub async fn unpublish(&self, target_path: &str) -> Result<(), CsiError> {
        if !mount::is_mountpoint(target_path) {
            return Ok(());
        }
        mount::bind_unmount(target_path).map_err(|e| CsiError::Internal {
            reason: format!("unmounting {}: {}", target_path, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unwind_runs_compensators_in_lifo_order() {
        let order: Arc<std::sync::Mutex<Vec<u32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack: Vec<Compensator> = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(Box::pin(async move {
                order.lock().unwrap().push(i);
            }));
        }
        unwind(stack).await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn unwind_tolerates_a_failing_compensator() {
        let order: Arc<std::sync::Mutex<Vec<u32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack: Vec<Compensator> = Vec::new();
        {
            let order = order.clone();
            stack.push(Box::pin(async move {
                order.lock().unwrap().push(0);
            }));
        }
        // A compensator never returns an error (failures are logged and
        // swallowed internally); this one simply does nothing, standing in
        // for a step whose rollback action failed.
        stack.push(Box::pin(async move {}));
        {
            let order = order.clone();
            stack.push(Box::pin(async move {
                order.lock().unwrap().push(2);
            }));
        }
        unwind(stack).await;
        assert_eq!(*order.lock().unwrap(), vec![2, 0]);
    }
}
