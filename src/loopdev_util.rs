//! Loop Device Helper: thin wrapper around the `loopdev` crate giving
//! attach/detach/lookup by backing-file path instead of by `/dev/loopN`.

use glob::glob;
use loopdev::{LoopControl, LoopDevice as RawLoopDevice};

pub struct LoopDevice;

impl LoopDevice {
    /// Attach `img_path` to the next free `/dev/loopN`, returning its path.
    /// Idempotent: if `img_path` is already attached, returns the existing
    /// device instead of attaching a second time.
    pub fn attach(img_path: &str) -> Result<String, std::io::Error> {
        if let Some(existing) = Self::lookup(img_path)? {
            return Ok(existing);
        }

        let control = LoopControl::open()?;
        let dev = control.next_free()?;
        dev.attach_file(img_path)?;
        dev.path()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "loop device has no path after attach",
                )
            })
    }

    /// Detach whichever loop device currently backs `img_path`, if any.
    pub fn detach(img_path: &str) -> Result<(), std::io::Error> {
        match Self::lookup(img_path)? {
            Some(dev_path) => RawLoopDevice::open(dev_path).and_then(|d| d.detach()),
            None => Ok(()),
        }
    }

    /// Scan `/dev/loop*` for the device currently backed by `img_path`.
    fn lookup(img_path: &str) -> Result<Option<String>, std::io::Error> {
        let target = std::fs::canonicalize(img_path).unwrap_or_else(|_| img_path.into());

        let candidates = glob("/dev/loop*").expect("invalid glob pattern").flatten();
        for path in candidates {
            let is_whole_device = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("loop"))
                .map_or(false, |suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()));
            if !is_whole_device {
                continue;
            }
            let dev = RawLoopDevice::open(&path)?;
            if let Ok(info) = dev.info() {
                let backing = String::from_utf8_lossy(&info.lo_file_name)
                    .trim_end_matches('\0')
                    .to_string();
                if std::path::Path::new(&backing) == target {
                    return Ok(Some(path.to_string_lossy().into_owned()));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_none_for_unattached_path() {
        // No real loop devices exist in the test sandbox, so any path not
        // actively attached must resolve to None rather than erroring.
        let result = LoopDevice::lookup("/nonexistent/path/for/test");
        assert!(matches!(result, Ok(None)));
    }
}
