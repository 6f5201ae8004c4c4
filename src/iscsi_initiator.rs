//! Initiator Client: drives the node's iSCSI initiator through the
//! `iscsiadm` CLI, the same subprocess-wrapping idiom used throughout this
//! plugin for other admin tools (see `format.rs`, `tgtd.rs`).

use std::process::Command;

use regex::Regex;

/// Everything needed to log in to one LUN behind one portal.
pub struct IscsiConnector {
    pub portal: String,
    pub port: u16,
    pub iqn: String,
    pub lun: u16,
}

pub struct IscsiInitiator;

impl IscsiInitiator {
    /// Discover, login, then resolve the resulting block device path.
    /// Idempotent: a session that is already logged in is left alone and its
    /// device path is simply re-resolved.
    pub async fn connect(c: &IscsiConnector) -> Result<String, String> {
        let portal_arg = format!("{}:{}", c.portal, c.port);

        if !Self::session_exists(&c.iqn, &portal_arg)? {
            run_iscsiadm(&[
                "-m",
                "discovery",
                "-t",
                "sendtargets",
                "-p",
                &portal_arg,
            ])?;
            run_iscsiadm(&[
                "-m", "node", "-T", &c.iqn, "-p", &portal_arg, "--login",
            ])?;
        }

        Self::resolve_device_path(c).await
    }

    /// Logout and remove the node record. Idempotent: missing sessions are
    /// not an error.
    pub async fn disconnect(iqn: &str, portal_arg: &str) -> Result<(), String> {
        if !Self::session_exists(iqn, portal_arg)? {
            return Ok(());
        }
        run_iscsiadm(&["-m", "node", "-T", iqn, "-p", portal_arg, "--logout"])?;
        // Best-effort: stale node records don't block future logins, but we
        // don't want them piling up.
        let _ = run_iscsiadm(&["-m", "node", "-T", iqn, "-p", portal_arg, "-o", "delete"]);
        Ok(())
    }

    fn session_exists(iqn: &str, portal_arg: &str) -> Result<bool, String> {
        let output = Command::new("iscsiadm")
            .args(["-m", "session"])
            .output()
            .map_err(|e| format!("failed to run iscsiadm -m session: {}", e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .any(|line| session_line_matches(line, portal_arg, iqn)))
    }

    /// Resolve the session to its `/dev/sdX` path via the stable
    /// `/dev/disk/by-path` symlink udev creates for iSCSI LUNs, waiting
    /// briefly for the symlink to appear after login.
    async fn resolve_device_path(c: &IscsiConnector) -> Result<String, String> {
        let link = format!(
            "/dev/disk/by-path/ip-{}:{}-iscsi-{}-lun-{}",
            c.portal, c.port, c.iqn, c.lun
        );

        for _ in 0..50 {
            if let Ok(target) = std::fs::canonicalize(&link) {
                return Ok(target.to_string_lossy().into_owned());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        Err(format!("by-path link {} never appeared", link))
    }
}

/// Match one line of `iscsiadm -m session` output against a portal and IQN,
/// the same `(?P<portal>...),[[:digit:]]+ +(?P<target>iqn\....)` shape used
/// to parse discovery output.
fn session_line_matches(line: &str, portal_arg: &str, iqn: &str) -> bool {
    lazy_static! {
        static ref SESSION: Regex = Regex::new(
            r"(?P<portal>[[:digit:]]+(\.[[:digit:]]+){3}:[[:digit:]]+),[[:digit:]]+ +(?P<target>iqn\.[^ ]+)"
        )
        .unwrap();
    }
    SESSION
        .captures(line)
        .map_or(false, |c| &c["portal"] == portal_arg && &c["target"] == iqn)
}

fn run_iscsiadm(args: &[&str]) -> Result<String, String> {
    let output = Command::new("iscsiadm")
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute iscsiadm {:?}: {}", args, e))?;

    if !output.status.success() {
        return Err(format!(
            "iscsiadm {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_line_matches_portal_and_iqn() {
        let line =
            "tcp: [12] 10.0.0.5:3260,1 iqn.com.pooh64.csi.csif.filter:pvc-1 (non-flash)";
        assert!(session_line_matches(
            line,
            "10.0.0.5:3260",
            "iqn.com.pooh64.csi.csif.filter:pvc-1"
        ));
    }

    #[test]
    fn session_line_rejects_mismatched_portal() {
        let line = "tcp: [12] 10.0.0.6:3260,1 iqn.com.pooh64.csi.csif.filter:pvc-1";
        assert!(!session_line_matches(
            line,
            "10.0.0.5:3260",
            "iqn.com.pooh64.csi.csif.filter:pvc-1"
        ));
    }
}
