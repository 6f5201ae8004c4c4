//! Process-wide tunables that are not simple per-request parameters. Set
//! once at startup from parsed CLI args, read from anywhere via the
//! `lazy_static`-guarded accessor, mirroring the donor's `config()` pattern.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// Target IDs live in `[1, MAX_TARGETS)`; 0 is reserved.
pub const MAX_TARGETS: u32 = 128;

/// Bound on the filter pod watch.
pub const POD_WATCH_TIMEOUT: Duration = Duration::from_secs(100);

/// Filesystem probed/mounted when the caller does not request a type.
pub const DEFAULT_FS: &str = "ext4";

/// Fixed device path at which the backing claim is mounted block-raw inside
/// the filter pod.
pub const FILTER_SRC_DEVICE_PATH: &str = "/dev/csi-csif-bstore-src";

/// Fake backing store the filter pod exports when it has no real device of
/// its own to re-export.
pub const FILTER_FAKE_BSTORE_PATH: &str = "/csi-csif-fake-bstore.img";
pub const FILTER_FAKE_BSTORE_SIZE: u64 = 16 * 1024 * 1024;

/// Directory holding `HostImg` backing files on the node.
pub const HOSTIMG_DIR: &str = "/csi-csif-hostimg";

/// Default TCP ports for the two target daemons.
pub const FILTER_TGT_PORT: u16 = 9821;
pub const FILTER_GRPC_PORT: u16 = 9822;

/// IQN prefixes, distinct per role.
pub const IQN_PREFIX_FILTER: &str = "iqn.com.pooh64.csi.csif.filter";
pub const IQN_PREFIX_CLIENT: &str = "iqn.com.pooh64.csi.csif.client";

pub const TOPOLOGY_KEY_NODE: &str = "topology.csif.csi/node";

/// Global configuration parameters, populated once from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node id advertised in `NodeGetInfo`.
    pub node_id: String,
    /// Driver name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// Cap on `max_volumes_per_node` reported to the orchestrator.
    pub max_volumes_per_node: i64,
    /// Container image reference used when templating filter pods.
    pub filter_image: String,
    /// TCP port the node's own target daemon listens on.
    pub tgt_port: u16,
    /// Control-socket identifier isolating the node's target daemon.
    pub tgt_control: String,
    /// Filesystems probed/supported on this node, first is the default.
    pub supported_filesystems: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: String::new(),
            driver_name: "csif.csi.pooh64.io".to_string(),
            max_volumes_per_node: 0,
            filter_image: String::new(),
            tgt_port: 9820,
            tgt_control: "csif".to_string(),
            supported_filesystems: vec![
                DEFAULT_FS.to_string(),
                "xfs".to_string(),
            ],
        }
    }
}

/// Get a mutex guard over the process-wide `Config`.
pub fn config<'a>() -> MutexGuard<'a, Config> {
    lazy_static! {
        static ref CONFIG: Arc<Mutex<Config>> =
            Arc::new(Mutex::new(Config::default()));
    }
    CONFIG.lock().expect("not poisoned")
}
