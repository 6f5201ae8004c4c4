//! csif-plugin: the node/controller CSI binary. Parses its CLI
//! surface, seeds the process-wide `config`, starts this node's own target
//! daemon, and serves the Identity/Controller/Node services until a
//! shutdown signal arrives.

use std::{io::Write, sync::Arc};

use chrono::Local;
use clap::{Arg, Command};
use env_logger::{Builder, Env};
use tokio::sync::Mutex as AsyncMutex;

use csif::{
    config, controller_svc::ControllerSvc, identity::Identity, node_svc::NodeSvc,
    orchestrator::Orchestrator, registry::{ControllerRegistry, NodeRegistry}, server,
    tgtd::TargetDaemonDriver,
};

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter_expr = format!("csif={}", level);
    let mut builder = Builder::from_env(Env::default().default_filter_or(filter_expr));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {} {}] {}",
            Local::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        println!("csif-plugin: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let matches = Command::new("csif-plugin")
        .about("CSI node/controller plugin for csif volumes")
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .value_name("URL")
                .default_value("unix://tmp/csi.sock")
                .help("gRPC listen endpoint, unix://<path> or tcp://<host:port>"),
        )
        .arg(
            Arg::new("nodeid")
                .long("nodeid")
                .value_name("ID")
                .required(true)
                .help("unique id of the node this process runs on"),
        )
        .arg(
            Arg::new("drivername")
                .long("drivername")
                .value_name("NAME")
                .default_value("csif.csi.pooh64.io")
                .help("driver name reported by GetPluginInfo"),
        )
        .arg(
            Arg::new("maxvolumespernode")
                .long("maxvolumespernode")
                .value_name("N")
                .default_value("0")
                .help("cap reported by NodeGetInfo; 0 means unbounded"),
        )
        .arg(
            Arg::new("filteraddr")
                .long("filteraddr")
                .value_name("IMAGE")
                .required(true)
                .help("container image reference used to template filter pods"),
        )
        .arg(
            Arg::new("tgtport")
                .long("tgtport")
                .value_name("PORT")
                .default_value("9820")
                .help("TCP port this node's own target daemon listens on"),
        )
        .arg(
            Arg::new("tgtcontrol")
                .long("tgtcontrol")
                .value_name("NAME")
                .default_value("csif")
                .help("control-socket identifier for this node's target daemon"),
        )
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .value_name("NS")
                .default_value("default")
                .help("namespace filter pods are created in"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(clap::ArgAction::Count)
                .help("increase log verbosity (-v debug, -vv trace)"),
        )
        .get_matches();

    init_logging(matches.get_count("v"));
    color_backtrace::install();

    let node_id = matches.get_one::<String>("nodeid").unwrap().clone();
    let driver_name = matches.get_one::<String>("drivername").unwrap().clone();
    let max_volumes_per_node: i64 = matches
        .get_one::<String>("maxvolumespernode")
        .unwrap()
        .parse()
        .map_err(|e| format!("invalid --maxvolumespernode: {}", e))?;
    let filter_image = matches.get_one::<String>("filteraddr").unwrap().clone();
    let tgt_port: u16 = matches
        .get_one::<String>("tgtport")
        .unwrap()
        .parse()
        .map_err(|e| format!("invalid --tgtport: {}", e))?;
    let tgt_control = matches.get_one::<String>("tgtcontrol").unwrap().clone();
    let namespace = matches.get_one::<String>("namespace").unwrap().clone();
    let endpoint = matches.get_one::<String>("endpoint").unwrap().clone();

    {
        let mut cfg = config::config();
        cfg.node_id = node_id.clone();
        cfg.driver_name = driver_name;
        cfg.max_volumes_per_node = max_volumes_per_node;
        cfg.filter_image = filter_image;
        cfg.tgt_port = tgt_port;
        cfg.tgt_control = tgt_control.clone();
        let supported = cfg.supported_filesystems.clone();
        cfg.supported_filesystems = csif::mount::probe_filesystems(&supported);
    }

    let tgtd = TargetDaemonDriver::spawn(tgt_port, &tgt_control)
        .map_err(|e| format!("failed to start target daemon: {}", e))?;
    let tgtd = Arc::new(AsyncMutex::new(tgtd));

    let controller_registry = Arc::new(ControllerRegistry::default());
    let node_registry = Arc::new(NodeRegistry::default());
    let orchestrator = Arc::new(Orchestrator::new(
        node_registry.clone(),
        tgtd,
        namespace,
    ));

    let identity = Identity::default();
    let controller = ControllerSvc::new(controller_registry);
    let node = NodeSvc::new(node_id, max_volumes_per_node, node_registry, orchestrator);

    server::run_plugin(&endpoint, identity, controller, node).await
}
