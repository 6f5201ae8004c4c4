//! Error hierarchy for the plugin. Each component that can fail owns a
//! `snafu` enum; `CsiError` is the single place those are mapped onto
//! `tonic::Status` gRPC codes.

use snafu::Snafu;
use tonic::{Code, Status};

/// Failures attaching/detaching a `Disk` backend (loop device, iSCSI login).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeviceError {
    #[snafu(display("failed to allocate backing file {}: {}", path, source))]
    AllocateImg {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("loop attach of {} failed: {}", path, source))]
    LoopAttach {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("loop detach of {} failed: {}", path, source))]
    LoopDetach {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove backing file {}: {}", path, source))]
    RemoveImg {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("iscsi initiator error: {}", message))]
    Iscsi { message: String },
    #[snafu(display("malformed volume context key {}: {}", key, reason))]
    Context { key: String, reason: String },
}

/// Failures from the target-daemon driver (admin-tool subprocess calls).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TgtdError {
    #[snafu(display("no free target id (capacity {})", capacity))]
    NoFreeTargetId { capacity: u32 },
    #[snafu(display(
        "admin tool '{}' {} failed (exit {:?}): {}",
        tool,
        step,
        code,
        stderr
    ))]
    AdminTool {
        tool: String,
        step: String,
        code: Option<i32>,
        stderr: String,
    },
    #[snafu(display("failed to spawn target daemon: {}", source))]
    Spawn { source: std::io::Error },
}

/// Failures managing the per-volume filter pod.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FilterPodError {
    #[snafu(display("kube api error: {}", source))]
    Kube { source: kube::Error },
    #[snafu(display(
        "filter pod {} did not reach Running within {:?}: {}",
        name,
        elapsed,
        reason
    ))]
    Timeout {
        name: String,
        elapsed: std::time::Duration,
        reason: String,
    },
    #[snafu(display("filter pod {} has no IP address yet", name))]
    NoPodIp { name: String },
    #[snafu(display("failed to dial filter pod {} at {}: {}", name, addr, source))]
    Dial {
        name: String,
        addr: String,
        source: tonic::transport::Error,
    },
}

/// Failures from the node-side stage/publish state machine. Wraps the step
/// name so the compensator chain can log exactly where a chain broke.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StageError {
    #[snafu(display("step {} failed for volume {}: {}", step, volume_id, reason))]
    Step {
        step: &'static str,
        volume_id: String,
        reason: String,
    },
    #[snafu(display("mount error for volume {}: {}", volume_id, source))]
    Mount {
        volume_id: String,
        source: std::io::Error,
    },
}

/// Failures from the in-memory volume/attachment registries.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    #[snafu(display("volume {} not found", id))]
    VolumeNotFound { id: String },
    #[snafu(display(
        "volume {} already exists with a different size ({} requested, {} existing)",
        name,
        requested,
        existing
    ))]
    SizeMismatch {
        name: String,
        requested: u64,
        existing: u64,
    },
}

/// Top-level error used at the gRPC boundary. Every component error type has
/// a `From` impl below; call sites propagate with `?` and the conversion to
/// `tonic::Status` happens once, at the RPC handler return.
#[derive(Debug, Snafu)]
pub enum CsiError {
    #[snafu(display("{}", source))]
    Device { source: DeviceError },
    #[snafu(display("{}", source))]
    Tgtd { source: TgtdError },
    #[snafu(display("{}", source))]
    FilterPod { source: FilterPodError },
    #[snafu(display("{}", source))]
    Stage { source: StageError },
    #[snafu(display("volume not found: {}", id))]
    VolumeNotFound { id: String },
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: String },
    #[snafu(display("already exists: {}", reason))]
    AlreadyExists { reason: String },
    #[snafu(display("not implemented: {}", reason))]
    Unimplemented { reason: String },
    #[snafu(display("internal error: {}", reason))]
    Internal { reason: String },
}

impl From<DeviceError> for CsiError {
    fn from(source: DeviceError) -> Self {
        CsiError::Device { source }
    }
}

impl From<TgtdError> for CsiError {
    fn from(source: TgtdError) -> Self {
        CsiError::Tgtd { source }
    }
}

impl From<FilterPodError> for CsiError {
    fn from(source: FilterPodError) -> Self {
        CsiError::FilterPod { source }
    }
}

impl From<StageError> for CsiError {
    fn from(source: StageError) -> Self {
        CsiError::Stage { source }
    }
}

impl From<RegistryError> for CsiError {
    fn from(source: RegistryError) -> Self {
        match source {
            RegistryError::SizeMismatch { name, requested, existing } => {
                CsiError::AlreadyExists {
                    reason: RegistryError::SizeMismatch {
                        name,
                        requested,
                        existing,
                    }
                    .to_string(),
                }
            }
            RegistryError::VolumeNotFound { id } => {
                CsiError::VolumeNotFound { id }
            }
        }
    }
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        let code = match &err {
            CsiError::InvalidArgument { .. } => Code::InvalidArgument,
            CsiError::AlreadyExists { .. } => Code::AlreadyExists,
            CsiError::Unimplemented { .. } => Code::Unimplemented,
            CsiError::VolumeNotFound { .. } => Code::NotFound,
            _ => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}
