// All lease deadlines are expressed in uptime: whole seconds since host
// boot. uptime must be monotonic within a boot and reset to (effectively)
// zero across a reboot, since a rebooted acceptor cannot honor a
// pre-reboot lease. We anchor on an `Instant` so wall-clock adjustments
// (NTP slew, operator date -s) never move it backwards.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic uptime and the wall-clock boot time, as described
/// in the lease protocol's clock requirements. `Clock` is deliberately a
/// trait so tests can drive lease logic with a fake clock instead of
/// waiting on real host uptime.
pub trait Clock: Send + Sync {
    fn uptime(&self) -> i64;
    fn boot_time(&self) -> SystemTime;
}

/// Reads boot time from `/proc/stat`'s `btime` line and derives uptime
/// from an `Instant` captured at construction, so in-process uptime never
/// regresses even when the host clock does. Falls back to treating
/// process start as boot time when `/proc/stat` is unavailable (non-Linux
/// hosts, sandboxes without procfs); this is logged once.
pub struct HostClock {
    boot_time: SystemTime,
    started_at: Instant,
    uptime_at_start: i64,
}

impl HostClock {
    pub fn new() -> Self {
        let started_at = Instant::now();
        let now = SystemTime::now();
        match read_proc_stat_btime() {
            Some(btime_secs) => {
                let boot_time = UNIX_EPOCH + std::time::Duration::from_secs(btime_secs.max(0) as u64);
                let uptime_at_start = now
                    .duration_since(boot_time)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                HostClock { boot_time, started_at, uptime_at_start }
            }
            None => {
                tracing::warn!(
                    target: crate::LOG_TARGET,
                    "unable to read /proc/stat btime; uptime measured from process start"
                );
                HostClock { boot_time: now, started_at, uptime_at_start: 0 }
            }
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn uptime(&self) -> i64 {
        self.uptime_at_start + self.started_at.elapsed().as_secs() as i64
    }

    fn boot_time(&self) -> SystemTime {
        self.boot_time
    }
}

fn read_proc_stat_btime() -> Option<i64> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
pub struct FakeClock {
    pub uptime: std::sync::atomic::AtomicI64,
    pub boot_time: SystemTime,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(uptime: i64) -> Self {
        FakeClock { uptime: std::sync::atomic::AtomicI64::new(uptime), boot_time: SystemTime::now() }
    }

    pub fn advance(&self, secs: i64) {
        self.uptime.fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn uptime(&self) -> i64 {
        self.uptime.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn boot_time(&self) -> SystemTime {
        self.boot_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new(10);
        assert_eq!(clock.uptime(), 10);
        clock.advance(5);
        assert_eq!(clock.uptime(), 15);
    }

    #[test]
    fn host_clock_uptime_is_nonnegative_and_monotonic() {
        let clock = HostClock::new();
        let first = clock.uptime();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let second = clock.uptime();
        assert!(first >= 0);
        assert!(second >= first);
    }
}
