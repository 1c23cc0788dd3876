use std::time::Duration;

use clap::Args;
use lifecycle::Controller;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{error, info, warn};

use super::{GlobalArgs, build_controller};
use crate::error::DaemonResult;

#[derive(Args)]
pub struct ServeArgs {
    /// Owners whose sandboxes are reconciled against the provider periodically
    #[arg(long = "reconcile-owner", value_name = "OWNER")]
    pub reconcile_owners: Vec<String>,

    /// Seconds between reconcile sweeps
    #[arg(long, default_value_t = 300)]
    pub reconcile_every: u64,
}

/// Consume scheduled lifecycle messages until SIGTERM or SIGINT.
pub async fn run_serve(global: &GlobalArgs, args: ServeArgs) -> DaemonResult<()> {
    let config = global.load_config().await?;
    let controller = build_controller(&config).await?;

    if !controller.scheduler().health_check().await {
        warn!("delay store unreachable at startup, consumer will keep retrying");
    }
    controller.start().await;
    info!(
        queue = %controller.scheduler().config().queue_name,
        "lifecycle consumer running"
    );

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut sweep = tokio::time::interval(Duration::from_secs(args.reconcile_every.max(1)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sweep.tick(), if !args.reconcile_owners.is_empty() => {
                reconcile_all(&controller, &args.reconcile_owners).await;
            }
        }
    }

    controller.shutdown().await;
    info!("lifecycle consumer stopped");
    Ok(())
}

async fn reconcile_all(controller: &Controller, owners: &[String]) {
    for owner in owners {
        match controller.reconcile_owner(owner).await {
            Ok(report) => info!(
                owner_id = %owner,
                checked = report.checked,
                paused = report.paused.len(),
                resumed = report.resumed.len(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                "reconcile sweep"
            ),
            Err(e) => error!(owner_id = %owner, error = %e, "reconcile sweep failed"),
        }
    }
}

/// Wait for a signal, or pend forever if the handler could not be installed.
async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
