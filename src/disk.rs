//! The `Disk` tagged variant: the node-side representation of where the
//! bytes behind a volume actually live, and how to turn that into a local
//! block-device path. Round-trips through the CSI "volume context" as a
//! flat string map; the `diskType` key selects the variant on the way
//! back in.

use std::{collections::HashMap, fs::OpenOptions, path::PathBuf};

use snafu::{OptionExt, ResultExt};

use crate::{
    config,
    error::{
        AllocateImgSnafu, ContextSnafu, DeviceError, LoopAttachSnafu,
        LoopDetachSnafu, RemoveImgSnafu,
    },
    iscsi_initiator::{IscsiConnector, IscsiInitiator},
    loopdev_util::LoopDevice,
};

const DISK_TYPE_KEY: &str = "diskType";
const DISK_TYPE_HOSTIMG: &str = "hostimg";
const DISK_TYPE_ISCSI: &str = "iscsi";

/// A disk descriptor, created by the controller and serialized into the
/// volume context; rehydrated on the node during `NodeStageVolume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disk {
    /// A file on the node host, attached as a loop device on stage.
    HostImg { size: u64, img_path: String },
    /// A pre-existing remote SCSI logical unit.
    Iscsi {
        portal: String,
        port: u16,
        iqn: String,
        lun: u16,
    },
}

impl Disk {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Disk::HostImg { .. } => DISK_TYPE_HOSTIMG,
            Disk::Iscsi { .. } => DISK_TYPE_ISCSI,
        }
    }

    /// Opaque string map carried through the orchestrator's volume context.
    pub fn serialize_context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        match self {
            Disk::HostImg { size, img_path } => {
                ctx.insert(DISK_TYPE_KEY.to_string(), DISK_TYPE_HOSTIMG.into());
                ctx.insert("size".to_string(), size.to_string());
                ctx.insert("imgPath".to_string(), img_path.clone());
            }
            Disk::Iscsi {
                portal,
                port,
                iqn,
                lun,
            } => {
                ctx.insert(DISK_TYPE_KEY.to_string(), DISK_TYPE_ISCSI.into());
                ctx.insert("portal".to_string(), portal.clone());
                ctx.insert("port".to_string(), port.to_string());
                ctx.insert("iqn".to_string(), iqn.clone());
                ctx.insert("lun".to_string(), lun.to_string());
            }
        }
        ctx
    }

    /// Dispatch by `diskType` to the matching constructor.
    pub fn deserialize_context(
        ctx: &HashMap<String, String>,
    ) -> Result<Disk, DeviceError> {
        let tag = ctx.get(DISK_TYPE_KEY).context(ContextSnafu {
            key: DISK_TYPE_KEY.to_string(),
            reason: "missing".to_string(),
        })?;

        let get = |key: &'static str| -> Result<&str, DeviceError> {
            ctx.get(key)
                .map(String::as_str)
                .context(ContextSnafu {
                    key: key.to_string(),
                    reason: "missing".to_string(),
                })
        };
        let parse_u64 = |key: &'static str| -> Result<u64, DeviceError> {
            get(key)?.parse::<u64>().map_err(|e| {
                DeviceError::Context {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            })
        };
        let parse_u16 = |key: &'static str| -> Result<u16, DeviceError> {
            get(key)?.parse::<u16>().map_err(|e| {
                DeviceError::Context {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            })
        };

        match tag.as_str() {
            DISK_TYPE_HOSTIMG => Ok(Disk::HostImg {
                size: parse_u64("size")?,
                img_path: get("imgPath")?.to_string(),
            }),
            DISK_TYPE_ISCSI => Ok(Disk::Iscsi {
                portal: get("portal")?.to_string(),
                port: parse_u16("port")?,
                iqn: get("iqn")?.to_string(),
                lun: parse_u16("lun")?,
            }),
            other => Err(DeviceError::Context {
                key: DISK_TYPE_KEY.to_string(),
                reason: format!("unknown disk type {}", other),
            }),
        }
    }

    /// Attach the backing device, yielding the local block-device path that
    /// feeds into the local target.
    pub async fn attach(&self) -> Result<String, DeviceError> {
        match self {
            Disk::HostImg { size, img_path } => {
                ensure_hostimg_file(img_path, *size)?;
                let dev = LoopDevice::attach(img_path).context(
                    LoopAttachSnafu {
                        path: img_path.clone(),
                    },
                )?;
                Ok(dev)
            }
            Disk::Iscsi {
                portal,
                port,
                iqn,
                lun,
            } => {
                let connector = IscsiConnector {
                    portal: portal.clone(),
                    port: *port,
                    iqn: iqn.clone(),
                    lun: *lun,
                };
                IscsiInitiator::connect(&connector)
                    .await
                    .map_err(|message| DeviceError::Iscsi { message })
            }
        }
    }

    /// Reverse of `attach`.
    pub async fn detach(&self) -> Result<(), DeviceError> {
        match self {
            Disk::HostImg { img_path, .. } => {
                if let Err(source) = LoopDevice::detach(img_path) {
                    return Err(DeviceError::LoopDetach {
                        path: img_path.clone(),
                        source,
                    });
                }
                if let Err(source) = std::fs::remove_file(img_path) {
                    if source.kind() != std::io::ErrorKind::NotFound {
                        return Err(DeviceError::RemoveImg {
                            path: img_path.clone(),
                            source,
                        });
                    }
                }
                Ok(())
            }
            Disk::Iscsi { portal, port, iqn, .. } => {
                IscsiInitiator::disconnect(iqn, &format!("{}:{}", portal, port))
                    .await
                    .map_err(|message| DeviceError::Iscsi { message })
            }
        }
    }
}

/// Idempotent file allocation: create only if absent, sized via
/// `File::set_len` (a sparse allocation, the Rust-idiomatic analogue of the
/// original's `createImg`).
fn ensure_hostimg_file(path: &str, size: u64) -> Result<(), DeviceError> {
    let path_buf = PathBuf::from(path);
    if let Some(parent) = path_buf.parent() {
        std::fs::create_dir_all(parent).context(AllocateImgSnafu {
            path: path.to_string(),
        })?;
        let _ = std::fs::set_permissions(
            parent,
            std::os::unix::fs::PermissionsExt::from_mode(0o750),
        );
    }

    if path_buf.exists() {
        return Ok(());
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path_buf)
        .context(AllocateImgSnafu {
            path: path.to_string(),
        })?;
    file.set_len(size).context(AllocateImgSnafu {
        path: path.to_string(),
    })?;
    info!(
        "allocated {} backing file {}",
        bytesize::ByteSize::b(size).to_string_as(true),
        path
    );
    Ok(())
}

/// Path used for `HostImg` backing files of a given volume id.
pub fn hostimg_path(volume_id: &str) -> String {
    format!("{}/{}", config::HOSTIMG_DIR, volume_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostimg_context_round_trips() {
        let disk = Disk::HostImg {
            size: 1073741824,
            img_path: "/var/lib/csif/img/pvc-1".to_string(),
        };
        let ctx = disk.serialize_context();
        assert_eq!(ctx.get(DISK_TYPE_KEY).map(String::as_str), Some(DISK_TYPE_HOSTIMG));
        assert_eq!(Disk::deserialize_context(&ctx).unwrap(), disk);
    }

    #[test]
    fn iscsi_context_round_trips() {
        let disk = Disk::Iscsi {
            portal: "10.0.0.5".to_string(),
            port: 3260,
            iqn: "iqn.com.pooh64.csi.csif.filter:pvc-1".to_string(),
            lun: 0,
        };
        let ctx = disk.serialize_context();
        assert_eq!(ctx.get(DISK_TYPE_KEY).map(String::as_str), Some(DISK_TYPE_ISCSI));
        assert_eq!(Disk::deserialize_context(&ctx).unwrap(), disk);
    }

    #[test]
    fn deserialize_context_rejects_unknown_type() {
        let mut ctx = HashMap::new();
        ctx.insert(DISK_TYPE_KEY.to_string(), "bogus".to_string());
        assert!(Disk::deserialize_context(&ctx).is_err());
    }

    #[test]
    fn deserialize_context_rejects_missing_type() {
        let ctx = HashMap::new();
        assert!(Disk::deserialize_context(&ctx).is_err());
    }

    #[test]
    fn ensure_hostimg_file_is_idempotent_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pvc-1");
        let path = path.to_str().unwrap();

        ensure_hostimg_file(path, 4096).unwrap();
        let meta = std::fs::metadata(path).unwrap();
        assert_eq!(meta.len(), 4096);

        // A second call must not truncate or re-allocate an existing file.
        ensure_hostimg_file(path, 8192).unwrap();
        let meta = std::fs::metadata(path).unwrap();
        assert_eq!(meta.len(), 4096);
    }
}
