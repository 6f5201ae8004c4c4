//! csif-filter: the sidecar binary run inside each filter pod.
//! Owns its own target daemon and answers `CreateTarget`/`DeleteTarget` for
//! exactly one backing claim per pod lifetime.

use std::io::Write;

use chrono::Local;
use clap::{Arg, Command};
use env_logger::{Builder, Env};

use csif::{filter_svc::FilterService, server};

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
        println!("csif-filter: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let matches = Command::new("csif-filter")
        .about("sidecar exposing one backing claim as an iSCSI target")
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .value_name("URL")
                .default_value("tcp://0.0.0.0:9822")
                .help("gRPC listen endpoint, unix://<path> or tcp://<host:port>"),
        )
        .arg(
            Arg::new("tgtport")
                .long("tgtport")
                .value_name("PORT")
                .default_value("9821")
                .help("TCP port this pod's target daemon listens on"),
        )
        .arg(
            Arg::new("tgtcontrol")
                .long("tgtcontrol")
                .value_name("NAME")
                .default_value("csif-filter")
                .help("control-socket identifier for this pod's target daemon"),
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

    let tgt_port: u16 = matches
        .get_one::<String>("tgtport")
        .unwrap()
        .parse()
        .map_err(|e| format!("invalid --tgtport: {}", e))?;
    let tgt_control = matches.get_one::<String>("tgtcontrol").unwrap().clone();
    let endpoint = matches.get_one::<String>("endpoint").unwrap().clone();

    // The portal advertised to callers is this pod's own address, which the
    // node learns independently (its own kube watch, see filter_pod.rs) and
    // dials directly; this pod only needs to know its target-daemon's
    // advertised IP, which for a pod's loopback-reachable iscsi target is
    // simply the pod's own IP as seen by its network namespace.
    let portal = std::env::var("POD_IP").unwrap_or_else(|_| "0.0.0.0".to_string());

    let filter_svc = FilterService::new(portal, tgt_port, &tgt_control);

    server::run_filter(&endpoint, filter_svc).await
}
