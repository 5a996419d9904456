//! Cooperative rate limiter: given a speed limit in operations per tick
//! window, sleeps between scan units so the Instance never exceeds its
//! configured budget. Sleep is interruptible by `stop` through a
//! `tokio::sync::Notify`, standing in for the control waitqueue.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

pub struct SpeedGovernor {
    tick: Duration,
    limit: AtomicU32,
    scans_this_tick: AtomicU64,
    wake: Arc<Notify>,
}

impl SpeedGovernor {
    pub fn new(tick: Duration, limit: u32) -> Self {
        SpeedGovernor {
            tick,
            limit: AtomicU32::new(limit),
            scans_this_tick: AtomicU64::new(0),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Interrupts any in-progress sleep, called by `stop`.
    pub fn interrupt(&self) {
        self.wake.notify_waiters();
    }

    /// Called after one unit of scan work. Sleeps for however long the
    /// configured limit demands, or returns immediately if the governor is
    /// uncapped (`limit == 0`) or `running` has gone false.
    pub async fn control_speed(&self, running: &(dyn Fn() -> bool + Send + Sync)) {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }

        let tick_millis = self.tick.as_millis().max(1) as u64;
        let count = self.scans_this_tick.fetch_add(1, Ordering::Relaxed) + 1;

        let sleep_for = if limit as u64 > tick_millis {
            // More than one scan allowed per millisecond-tick: sleep a full
            // tick every `limit / tick` scans.
            let per_tick = (limit as u64 / tick_millis).max(1);
            if count % per_tick == 0 {
                Some(self.tick)
            } else {
                None
            }
        } else {
            // Fewer than one scan per tick: sleep `tick / limit` ticks
            // after every scan.
            let ticks = tick_millis / limit as u64;
            Some(Duration::from_millis(ticks.max(1)))
        };

        if let Some(duration) = sleep_for {
            if !running() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    pub fn reset_tick(&self) {
        self.scans_this_tick.store(0, Ordering::Relaxed);
    }
}
