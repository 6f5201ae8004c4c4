//! Utility function for formatting a device with filesystem

use std::process::Command;

use blkid::probe::Probe;

use crate::error::StageError;

/// We probe the device for a filesystem, if there we leave it as is. We do
/// not check at current -- if the FS is the desired FS. This is done with the
/// mindset of, never over write/delete data.
pub(crate) async fn probed_format(
    volume_id: &str,
    device: &str,
    fstype: &str,
) -> Result<(), StageError> {
    let fail = |reason: String| StageError::Step {
        step: "format",
        volume_id: volume_id.to_string(),
        reason,
    };

    let probe = Probe::new_from_filename(device)
        .map_err(|_| fail("failed to init device probing".into()))?;

    probe
        .do_probe()
        .map_err(|_| fail("failed to probe device".into()))?;

    // blkid used char **data as a buffer to fill in the value of the
    // TYPE we are looking for or returns NULL on failure. The
    // library then does a CStr::from_ptr().to_str() which will fail
    // if we are NULL. Therefor is_err() here means no value for the given
    // TYPE, and thus no filesystem.
    match probe.lookup_value("TYPE") {
        Err(_) => {
            debug!("Formatting device {} with a {} filesystem", device, fstype);
            let output = Command::new(format!("mkfs.{}", fstype))
                .arg(device)
                .output()
                .map_err(|e| fail(format!("failed to execute mkfs: {}", e)))?;
            trace!(
                "Output of mkfs.{} command: {}",
                fstype,
                String::from_utf8_lossy(&output.stdout)
            );
            if !output.status.success() {
                return Err(fail(format!(
                    "mkfs.{} on {} failed: {}",
                    fstype,
                    device,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
            info!("Device {} formatted with {} filesystem", device, fstype);
        }
        Ok(fs) => {
            info!(
                "Skipping format: device {} contains a preexisting {} filesystem",
                device, fs
            );
        }
    }

    Ok(())
}
