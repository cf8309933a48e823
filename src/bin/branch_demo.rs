//! Minimal standalone branch: joins a network, logs discovery and
//! session events, and echoes any broadcast it receives back as JSON
//! on stdout.

use clap::Parser;
use tracing::{error, info};
use yogi_core::branch::Branch;
use yogi_core::config::{BranchConfig, BranchConfigJson};
use yogi_core::manager::{BranchEvent, EVENT_ALL};
use yogi_core::payload::Encoding;

#[derive(Parser)]
#[command(name = "yogi-branch-demo", about = "Join a Yogi network and log branch events")]
struct Args {
    #[arg(short, long)]
    name: Option<String>,

    #[arg(short = 'N', long, default_value = "demo")]
    network_name: String,

    #[arg(short = 'P', long, default_value = "")]
    network_password: String,

    #[arg(long)]
    ghost: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("yogi_core=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let cfg = match BranchConfig::from_json(BranchConfigJson {
        name: args.name,
        network_name: Some(args.network_name),
        network_password: Some(args.network_password),
        ghost_mode: Some(args.ghost),
        ..Default::default()
    }) {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {e}");
            return;
        }
    };

    let branch = match Branch::create(cfg).await {
        Ok(b) => b,
        Err(e) => {
            error!("failed to create branch: {e}");
            return;
        }
    };

    info!(uuid = %branch.uuid(), port = branch.tcp_port(), "branch running");

    let recv_handle = {
        let rx = branch
            .receive_broadcast(Encoding::Json, vec![0u8; 4096])
            .await;
        tokio::spawn(async move {
            if let Ok(Ok((uuid, bytes, truncated))) = rx.await {
                info!(
                    source = %uuid,
                    truncated,
                    payload = %String::from_utf8_lossy(&bytes),
                    "broadcast received"
                );
            }
        })
    };

    loop {
        let event_rx = branch.await_event(EVENT_ALL).await;
        match event_rx.await {
            Ok(Ok(event)) => log_event(&event),
            Ok(Err(_)) | Err(_) => break,
        }
    }

    recv_handle.abort();
    branch.destroy().await;
}

fn log_event(event: &BranchEvent) {
    match event {
        BranchEvent::Discovered { uuid, tcp_server_address } => {
            info!(%uuid, %tcp_server_address, "branch discovered")
        }
        BranchEvent::Queried { uuid, info } => {
            info!(%uuid, name = %info.name, path = %info.path, "branch queried")
        }
        BranchEvent::ConnectFinished { uuid, result_code } => {
            info!(%uuid, result_code, "connect finished")
        }
        BranchEvent::ConnectionLost { uuid, result_code } => {
            info!(%uuid, result_code, "connection lost")
        }
    }
}
