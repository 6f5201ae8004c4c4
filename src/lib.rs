//! csif: a CSI plugin that provisions volumes backed by either a loopback
//! image file or a pre-existing iSCSI LUN, and stages them onto nodes
//! through a per-volume filter pod sidecar (see `SPEC_FULL.md`).

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

#[allow(dead_code)]
#[allow(clippy::type_complexity)]
#[allow(clippy::unit_arg)]
#[allow(clippy::redundant_closure)]
#[allow(clippy::enum_variant_names)]
#[allow(clippy::upper_case_acronyms)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

#[allow(dead_code)]
#[allow(clippy::enum_variant_names)]
pub(crate) mod filter {
    tonic::include_proto!("csif.filter.v1");
}

pub mod config;
pub mod controller_svc;
pub mod disk;
pub mod error;
pub mod filter_pod;
pub mod filter_svc;
pub(crate) mod format;
pub mod identity;
pub(crate) mod iscsi_initiator;
pub(crate) mod loopdev_util;
pub mod mount;
pub mod node_svc;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub(crate) mod shutdown_event;
pub mod tgtd;
