//! gatewayd - signed-command gateway daemon
//!
//! This daemon:
//! 1. Loads configuration (`QGATE_CONFIG` file + `QGATE_*` overrides)
//! 2. Opens the gateway context (database, cache, schemas, artifact store)
//! 3. Serves the HTTP API
//! 4. Runs the periodic maintenance sweeps

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use quantum_gateway::{api::ApiServer, maintenance, Gateway, GatewayConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = GatewayConfig::load()?;
    let api_addr = config.api_addr.clone();
    let cleanup_interval = config.cleanup_interval;
    let gateway = Gateway::open(config)?;

    let readiness = gateway.readiness();
    if !readiness.ready {
        for (check, status) in &readiness.checks {
            if status != "ok" {
                log::warn!("startup check {check}: {status}");
            }
        }
    }

    let api_handle = ApiServer::new(api_addr, gateway.clone()).spawn()?;
    let maintenance_handle = maintenance::spawn(gateway.clone(), cleanup_interval)?;
    log::info!(
        "gatewayd {} serving on {}",
        env!("CARGO_PKG_VERSION"),
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {err}"))?;

    log::info!("gatewayd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    maintenance_handle.stop()?;

    Ok(())
}
