//! Liveness watchdog and cooperative shutdown
//!
//! The watchdog mirrors a classic `alarm(2)` pattern: armed at startup,
//! re-armed on every payload or control byte, and terminal when it fires. A
//! user interrupt shortens the window to a small grace period so the session
//! can still send its teardown messages before the process dies.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

/// Silence window before the client gives up.
pub const ALARM_TIME: Duration = Duration::from_secs(2 * 60);

/// Window left for graceful teardown after a user interrupt.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

pub struct Watchdog {
    epoch: Instant,
    deadline_ms: AtomicU64,
    interrupted: AtomicBool,
    window: Duration,
}

impl Watchdog {
    pub fn new(window: Duration) -> Arc<Self> {
        let watchdog = Self {
            epoch: Instant::now(),
            deadline_ms: AtomicU64::new(window.as_millis() as u64),
            interrupted: AtomicBool::new(false),
            window,
        };
        Arc::new(watchdog)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Push the deadline one full window out. Called for every byte of
    /// activity.
    pub fn rearm(&self) {
        self.deadline_ms.store(
            self.now_ms() + self.window.as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    /// User interrupt: switch the expiry message and leave only the grace
    /// window.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.deadline_ms.store(
            self.now_ms() + INTERRUPT_GRACE.as_millis() as u64,
            Ordering::SeqCst,
        );
    }

    pub fn expired(&self) -> bool {
        self.now_ms() > self.deadline_ms.load(Ordering::Relaxed)
    }

    pub fn expiry_message(&self) -> String {
        if self.interrupted.load(Ordering::SeqCst) {
            "ERROR: user break".to_string()
        } else {
            format!(
                "ERROR: more than {} seconds no activity",
                self.window.as_secs()
            )
        }
    }

    /// Spawn the monitor task; expiry ends the process with status 1.
    pub fn watch(self: &Arc<Self>) {
        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if watchdog.expired() {
                    eprintln!("{}", watchdog.expiry_message());
                    std::process::exit(1);
                }
            }
        });
    }
}

/// Cooperative stop flag, observed at every loop head, plus a broadcast
/// channel to wake pending selects.
#[derive(Clone)]
pub struct Shutdown {
    stop: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn trigger(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_set(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}
