//! Target Daemon Driver: owns one SCSI target daemon process and
//! drives it exclusively through its admin-tool CLI, the same
//! subprocess-wrapping idiom as `iscsi_initiator.rs` and `format.rs`. Treated
//! as an opaque subprocess interface — callers only see target ids and
//! iqn/portal/port, never daemon internals.

use std::{collections::BTreeSet, process::Command};

use crate::{
    config,
    error::TgtdError,
};

/// One allocated LUN on the daemon this process owns.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: u32,
    pub iqn: String,
    pub lun: u16,
}

/// Drives a single `tgtd`-family daemon instance (the node's own, or the one
/// inside a filter pod). Holds the set of target ids currently in use so it
/// can allocate the smallest free one without asking the daemon.
pub struct TargetDaemonDriver {
    daemon: Option<std::process::Child>,
    control: String,
    port: u16,
    used_ids: BTreeSet<u32>,
}

const LUN: u16 = 1;

impl TargetDaemonDriver {
    /// Spawn the daemon (or adopt an already-running one bound to the same
    /// control socket) and return a driver for it.
    pub fn spawn(port: u16, control: &str) -> Result<Self, TgtdError> {
        let daemon = Command::new("tgtd")
            .args([
                "-f",
                "--iscsi",
                &format!("portal=0.0.0.0:{}", port),
                "--control-port",
                "0",
                "-C",
                control,
            ])
            .spawn();

        let daemon = match daemon {
            Ok(child) => Some(child),
            // Daemon may already be running under this control socket from a
            // previous process in this container; admin-tool calls still
            // work against it.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => None,
            Err(source) => return Err(TgtdError::Spawn { source }),
        };

        Ok(TargetDaemonDriver {
            daemon,
            control: control.to_string(),
            port,
            used_ids: BTreeSet::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Create a target exposing `dev_path`, named `<iqn_prefix>:<id>`, at
    /// LUN 1, with a forward sequence of tgtadm calls and LIFO rollback on
    /// any failure.
    pub fn create_disk(
        &mut self,
        iqn_prefix: &str,
        dev_path: &str,
    ) -> Result<Target, TgtdError> {
        let id = self.alloc_id()?;
        let iqn = format!("{}:{}", iqn_prefix, id);

        if let Err(e) = self.tgtadm(&[
            "--mode", "target", "--op", "new", "--tid", &id.to_string(), "-T", &iqn,
        ]) {
            self.used_ids.remove(&id);
            return Err(e);
        }

        if let Err(e) = self.tgtadm(&[
            "--mode",
            "logicalunit",
            "--op",
            "new",
            "--tid",
            &id.to_string(),
            "--lun",
            &LUN.to_string(),
            "-b",
            dev_path,
        ]) {
            self.delete_target(id);
            self.used_ids.remove(&id);
            return Err(e);
        }

        if let Err(e) = self.tgtadm(&[
            "--mode",
            "target",
            "--op",
            "bind",
            "--tid",
            &id.to_string(),
            "-I",
            "ALL",
        ]) {
            self.delete_lun(id);
            self.delete_target(id);
            self.used_ids.remove(&id);
            return Err(e);
        }

        Ok(Target { id, iqn, lun: LUN })
    }

    /// Tear down a target created by `create_disk`. The LUN is removed
    /// first; its failure is logged and does not block the target removal
    /// that follows, since deleting the target removes any LUNs it still
    /// has. Only the target deletion's outcome is returned; the id is freed
    /// only once the target itself is actually gone, so a failed target
    /// delete leaves the slot allocated rather than letting a later
    /// `alloc_id` hand out an id whose stale target was never torn down.
    pub fn delete_disk(&mut self, target: &Target) -> Result<(), TgtdError> {
        if let Err(e) = self.delete_lun_checked(target.id) {
            warn!("failed to remove lun for target {}: {}", target.id, e);
        }
        let result = self.delete_target_checked(target.id);
        if result.is_ok() {
            self.used_ids.remove(&target.id);
        }
        result
    }

    fn delete_lun_checked(&self, id: u32) -> Result<(), TgtdError> {
        self.tgtadm(&[
            "--mode",
            "logicalunit",
            "--op",
            "delete",
            "--tid",
            &id.to_string(),
            "--lun",
            &LUN.to_string(),
        ])
    }

    fn delete_target_checked(&self, id: u32) -> Result<(), TgtdError> {
        self.tgtadm(&["--mode", "target", "--op", "delete", "--tid", &id.to_string()])
    }

    fn delete_lun(&self, id: u32) {
        let _ = self.delete_lun_checked(id);
    }

    fn delete_target(&self, id: u32) {
        let _ = self.delete_target_checked(id);
    }

    /// Smallest free id in `[1, MAX_TARGETS)`.
    fn alloc_id(&mut self) -> Result<u32, TgtdError> {
        let max = config::MAX_TARGETS;
        for candidate in 1..max {
            if self.used_ids.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(TgtdError::NoFreeTargetId { capacity: max })
    }

    fn tgtadm(&self, args: &[&str]) -> Result<(), TgtdError> {
        let mut full = vec!["--lld", "iscsi", "-C", self.control.as_str()];
        full.extend_from_slice(args);

        let step = args
            .iter()
            .position(|a| *a == "--op")
            .and_then(|i| args.get(i + 1))
            .copied()
            .unwrap_or("unknown")
            .to_string();

        let output = Command::new("tgtadm")
            .args(&full)
            .output()
            .map_err(|source| TgtdError::Spawn { source })?;

        if !output.status.success() {
            return Err(TgtdError::AdminTool {
                tool: "tgtadm".to_string(),
                step,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

impl Drop for TargetDaemonDriver {
    fn drop(&mut self) {
        if let Some(mut child) = self.daemon.take() {
            let _ = child.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> TargetDaemonDriver {
        TargetDaemonDriver {
            daemon: None,
            control: "csif-test".to_string(),
            port: 9820,
            used_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn alloc_id_picks_smallest_free() {
        let mut d = driver();
        assert_eq!(d.alloc_id().unwrap(), 1);
        assert_eq!(d.alloc_id().unwrap(), 2);
        d.used_ids.remove(&1);
        assert_eq!(d.alloc_id().unwrap(), 1);
    }

    #[test]
    fn alloc_id_exhausted_errors() {
        let mut d = driver();
        for _ in 1..config::MAX_TARGETS {
            d.alloc_id().unwrap();
        }
        assert!(matches!(
            d.alloc_id(),
            Err(TgtdError::NoFreeTargetId { .. })
        ));
    }
}
