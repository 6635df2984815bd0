//! Periodic cpu/memory sampling for the hosted server process.

use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;
use warden_types::{StatusSnapshot, WatchdogState};

use crate::support::resource_sample_interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSample {
    /// CPU usage in hundredths of a percent.
    pub cpu_percent_x100: u32,
    pub rss_bytes: u64,
}

pub type SharedSample = Arc<Mutex<Option<ResourceSample>>>;

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

#[cfg(target_os = "linux")]
async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm")).await.ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

fn cpu_percent_x100(
    prev_ticks: u64,
    prev_at: tokio::time::Instant,
    ticks: u64,
    now: tokio::time::Instant,
) -> u32 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0;
    }
    let delta = ticks.saturating_sub(prev_ticks) as f64;
    let x100 = (delta / ticks_per_sec() as f64 / dt * 100.0 * 100.0).round();
    if x100.is_finite() {
        x100.clamp(0.0, u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Sample cpu/rss for `pid` on a fixed interval while the instance is
/// Online with this pid, publishing into `out`. Exits (and clears the
/// published sample) the moment the loop leaves Online.
pub fn spawn_sampler(status: watch::Receiver<StatusSnapshot>, pid: u32, out: SharedSample) {
    tokio::spawn(async move {
        let interval = resource_sample_interval();
        let mut last: Option<(u64, tokio::time::Instant)> = None;

        loop {
            {
                let snap = status.borrow().clone();
                if snap.state != WatchdogState::Online || snap.pid != Some(pid) {
                    break;
                }
            }

            let now = tokio::time::Instant::now();
            let Some(ticks) = read_proc_cpu_ticks(pid).await else {
                break;
            };
            let rss_bytes = read_proc_rss_bytes(pid).await.unwrap_or(0);
            let cpu = last
                .map(|(prev_ticks, prev_at)| cpu_percent_x100(prev_ticks, prev_at, ticks, now))
                .unwrap_or(0);
            last = Some((ticks, now));

            *out.lock().expect("sample lock") = Some(ResourceSample {
                cpu_percent_x100: cpu,
                rss_bytes,
            });
            tracing::trace!(pid, cpu_percent_x100 = cpu, rss_bytes, "resource sample");

            tokio::time::sleep(interval).await;
        }

        *out.lock().expect("sample lock") = None;
    });
}
