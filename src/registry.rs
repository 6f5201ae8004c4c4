//! Volume Registry: in-memory bookkeeping on both sides of the
//! plugin. The controller-side registry tracks provisioned volumes and
//! gives `CreateVolume` its name-based idempotency; the node-side registry
//! tracks what is currently staged on this node and gives every volume its
//! own serialization lock for the compensator chain in `orchestrator.rs`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::Mutex as AsyncMutex;

use crate::{disk::Disk, error::RegistryError, tgtd::Target};

/// A volume as seen by the controller: just enough to answer `CreateVolume`
/// idempotently and to hand the node a `Disk` to rehydrate.
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub disk: Disk,
}

#[derive(Default)]
pub struct ControllerRegistry {
    inner: Mutex<HashMap<String, VolumeRecord>>,
}

impl ControllerRegistry {
    /// Idempotent create: a pre-existing volume with the same name and size
    /// is returned as-is; a mismatched size is a conflict.
    pub fn create_or_get(
        &self,
        name: &str,
        size_bytes: u64,
        make_disk: impl FnOnce(String) -> Disk,
    ) -> Result<VolumeRecord, RegistryError> {
        let mut map = self.inner.lock().expect("not poisoned");

        if let Some(existing) = map.values().find(|v| v.name == name) {
            if existing.size_bytes != size_bytes {
                return Err(RegistryError::SizeMismatch {
                    name: name.to_string(),
                    requested: size_bytes,
                    existing: existing.size_bytes,
                });
            }
            return Ok(existing.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let record = VolumeRecord {
            id: id.clone(),
            name: name.to_string(),
            size_bytes,
            disk: make_disk(id.clone()),
        };
        map.insert(id, record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<VolumeRecord, RegistryError> {
        self.inner
            .lock()
            .expect("not poisoned")
            .get(id)
            .cloned()
            .context(id)
    }

    /// Delete is idempotent: deleting an absent volume is not an error.
    pub fn delete(&self, id: &str) {
        self.inner.lock().expect("not poisoned").remove(id);
    }
}

trait NotFoundExt<T> {
    fn context(self, id: &str) -> Result<T, RegistryError>;
}

impl<T> NotFoundExt<T> for Option<T> {
    fn context(self, id: &str) -> Result<T, RegistryError> {
        self.ok_or_else(|| RegistryError::VolumeNotFound { id: id.to_string() })
    }
}

/// What a staged volume looks like on the node: everything needed to
/// compensate/unstage it again, set once `NodeStageVolume` completes and
/// read back by `NodeUnstageVolume`/`NodePublishVolume`.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub staging_path: String,
    pub disk: Disk,
    pub local_src_dev: String,
    pub out_dev: String,
    pub local_target: Target,
    pub filter_pod_name: String,
    pub filter_pod_ip: String,
    pub filter_iqn: String,
    pub filter_portal: String,
    pub filter_port: u16,
    pub fstype: Option<String>,
}

#[derive(Default)]
pub struct NodeRegistry {
    attachments: Mutex<HashMap<String, Attachment>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NodeRegistry {
    /// Get (creating if absent) the serialization lock for `volume_id`. All
    /// of stage/unstage/publish/unpublish for a volume hold this for their
    /// entire duration).
    pub fn lock_for(&self, volume_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .expect("not poisoned")
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn insert(&self, volume_id: &str, attachment: Attachment) {
        self.attachments
            .lock()
            .expect("not poisoned")
            .insert(volume_id.to_string(), attachment);
    }

    pub fn get(&self, volume_id: &str) -> Option<Attachment> {
        self.attachments
            .lock()
            .expect("not poisoned")
            .get(volume_id)
            .cloned()
    }

    pub fn remove(&self, volume_id: &str) -> Option<Attachment> {
        self.attachments
            .lock()
            .expect("not poisoned")
            .remove(volume_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_disk(id: String) -> Disk {
        Disk::HostImg {
            size: 4096,
            img_path: format!("/csi-csif-hostimg/{}", id),
        }
    }

    #[test]
    fn create_or_get_is_idempotent_by_name_and_size() {
        let reg = ControllerRegistry::default();
        let a = reg.create_or_get("vol-a", 4096, fake_disk).unwrap();
        let b = reg.create_or_get("vol-a", 4096, fake_disk).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn create_or_get_rejects_size_mismatch() {
        let reg = ControllerRegistry::default();
        reg.create_or_get("vol-a", 4096, fake_disk).unwrap();
        let err = reg.create_or_get("vol-a", 8192, fake_disk).unwrap_err();
        assert!(matches!(err, RegistryError::SizeMismatch { .. }));
    }

    #[test]
    fn get_missing_volume_errors() {
        let reg = ControllerRegistry::default();
        assert!(matches!(
            reg.get("missing"),
            Err(RegistryError::VolumeNotFound { .. })
        ));
    }

    #[test]
    fn lock_for_returns_the_same_mutex_for_repeated_calls() {
        let reg = NodeRegistry::default();
        let a = reg.lock_for("vol-a");
        let b = reg.lock_for("vol-a");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
