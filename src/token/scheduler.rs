use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::TokenManager;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Background thread running `TokenManager::run_maintenance` on a fixed
/// interval. The manager is shared behind a mutex with ad-hoc callers.
pub struct MaintenanceScheduler {
    manager: Arc<Mutex<TokenManager>>,
    interval: Duration,
}

#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Completed maintenance passes so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("maintenance thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl MaintenanceScheduler {
    pub fn new(manager: Arc<Mutex<TokenManager>>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub fn spawn(self) -> Result<MaintenanceHandle> {
        if self.interval.is_zero() {
            return Err(anyhow!("maintenance interval must be > 0"));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let passes = Arc::new(AtomicU64::new(0));
        let shutdown_thread = shutdown.clone();
        let passes_thread = passes.clone();
        let join = std::thread::Builder::new()
            .name("token-maintenance".to_string())
            .spawn(move || {
                run_schedule(
                    self.manager,
                    self.interval,
                    shutdown_thread,
                    passes_thread,
                )
            })?;
        log::info!("token maintenance scheduled every {:?}", self.interval);
        Ok(MaintenanceHandle {
            shutdown,
            passes,
            join: Some(join),
        })
    }
}

fn run_schedule(
    manager: Arc<Mutex<TokenManager>>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
) {
    let mut next_run = Instant::now() + interval;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if Instant::now() < next_run {
            std::thread::sleep(POLL_INTERVAL.min(interval));
            continue;
        }
        next_run = Instant::now() + interval;
        match run_once(&manager) {
            Ok(()) => {
                passes.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => log::error!("token maintenance failed: {:#}", err),
        }
    }
    log::info!("token maintenance stopped");
}

fn run_once(manager: &Mutex<TokenManager>) -> Result<()> {
    let mut guard = manager
        .lock()
        .map_err(|_| anyhow!("token manager lock poisoned"))?;
    guard.run_maintenance()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, HOUR_MS};
    use crate::crypto::{DeviceFingerprint, MIN_KDF_ITERATIONS};
    use crate::storage::InMemoryCredentialStore;
    use crate::token::{StoreTokenRequest, TokenSettings, TokenType};

    #[test]
    fn sweeps_in_background_until_stopped() {
        let clock = Arc::new(ManualClock::new(1_000));
        let fp = DeviceFingerprint::new(b"devsecret:sched", "device-1").unwrap();
        let mut manager = TokenManager::open(
            TokenSettings::default(),
            Box::new(InMemoryCredentialStore::default()),
            &fp,
            MIN_KDF_ITERATIONS,
            clock.clone(),
        )
        .unwrap();
        manager
            .store_token(StoreTokenRequest::new("v", TokenType::Access, "u", "o", "d"))
            .unwrap();
        clock.advance(2 * HOUR_MS);

        let shared = Arc::new(Mutex::new(manager));
        let handle = MaintenanceScheduler::new(shared.clone(), Duration::from_millis(10))
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while (handle.passes() == 0 || !shared.lock().unwrap().is_empty())
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(shared.lock().unwrap().is_empty());
        assert!(handle.passes() >= 1);
        handle.stop().unwrap();
    }

    #[test]
    fn zero_interval_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let fp = DeviceFingerprint::new(b"devsecret:sched", "device-1").unwrap();
        let manager = TokenManager::open(
            TokenSettings::default(),
            Box::new(InMemoryCredentialStore::default()),
            &fp,
            MIN_KDF_ITERATIONS,
            clock,
        )
        .unwrap();
        let scheduler = MaintenanceScheduler::new(Arc::new(Mutex::new(manager)), Duration::ZERO);
        assert!(scheduler.spawn().is_err());
    }
}
