//! Background sweeps: expired artifacts, durable nonces, stale uploads,
//! finished jobs and expired cache entries, once per cleanup interval.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::dispatcher::{Gateway, MaintenanceReport};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub struct MaintenanceHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("maintenance thread panicked"))?;
        }
        Ok(())
    }
}

pub fn spawn(gateway: Arc<Gateway>, interval: Duration) -> Result<MaintenanceHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let join = std::thread::Builder::new()
        .name("maintenance".to_string())
        .spawn(move || run(&gateway, interval, &flag))?;
    Ok(MaintenanceHandle {
        shutdown,
        join: Some(join),
    })
}

fn run(gateway: &Gateway, interval: Duration, shutdown: &AtomicBool) {
    let mut next = Instant::now() + interval;
    while !shutdown.load(Ordering::SeqCst) {
        if Instant::now() < next {
            std::thread::sleep(SHUTDOWN_POLL.min(interval));
            continue;
        }
        let report = gateway.run_maintenance();
        if report != MaintenanceReport::default() {
            log::info!(
                "maintenance: {} expired artifacts, {} nonces, {} stale uploads, \
                 {} jobs evicted, {} cache entries purged",
                report.expired_artifacts,
                report.expired_nonces,
                report.stale_uploads,
                report.evicted_jobs,
                report.expired_cache_entries
            );
        }
        next = Instant::now() + interval;
    }
}
