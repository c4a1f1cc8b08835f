#[macro_use]
extern crate tracing;

use std::{path::PathBuf, process, sync::Arc, time::Duration};

use ed25519_dalek::VerifyingKey;
use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;

use cmix_node::{
    node::{Instance, InstanceConfig, LoopbackTransport},
    settings::Settings,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Configuration file path", about = "Path to the configuration file")]
struct Opt {
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        node: node_settings,
        group: group_settings,
        permissioning: permissioning_settings,
        metrics: metrics_settings,
        log: log_settings,
        ..
    } = settings;

    FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    if node_settings.use_gpu {
        warn!("the GPU backend is unsupported, running phase graphs on the CPU");
    }
    if node_settings.disable_streaming {
        warn!("disabling streamed hand-off is unsupported, streaming stays on");
    }

    let group = group_settings.group().unwrap_or_else(|err| {
        eprintln!("invalid group parameters: {}", err);
        process::exit(1);
    });
    let verifying_key = VerifyingKey::from_bytes(&permissioning_settings.verifying_key)
        .unwrap_or_else(|err| {
            eprintln!("invalid permissioning key: {}", err);
            process::exit(1);
        });

    let instance = Instance::new(InstanceConfig {
        group: Arc::new(group),
        node_id: node_settings.node_id(),
        network: LoopbackTransport::new(),
        secrets: Arc::new(cmix_node::node::InMemorySecrets::new()),
        verifying_key: Some(verifying_key),
        keep_buffers: node_settings.keep_buffers,
        recovered_error_path: node_settings.recovered_error_path,
        metric_log_path: metrics_settings.log_path,
        rng_seed: node_settings.rng_seed,
    });
    let handles = instance.start();
    info!(
        permissioning = %permissioning_settings.address,
        "node is up, waiting for round descriptors",
    );

    tokio::select! {
        biased;

        _ = signal::ctrl_c() => {}
        _ = futures::future::join_all(handles) => {}
    }

    if let Err(err) = instance.shut_down(Duration::from_secs(5)).await {
        warn!(error = %err, "the resource queue did not drain in time");
    }
}
