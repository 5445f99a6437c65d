//! Resource sampling of a running target.
//!
//! Linux reads `/proc`, other unix systems ask `ps`, everything else only
//! reports liveness. Sampling never fails: problems show up as flags on the
//! returned [`ResourceSample`].

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Point-in-time view of the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub alive: bool,
    pub zombie: bool,
    /// The OS refused to tell us about the process
    pub query_failed: bool,
}

impl ResourceSample {
    pub fn running(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            alive: true,
            ..Default::default()
        }
    }

    pub fn exited() -> Self {
        Self::default()
    }

    pub fn zombie() -> Self {
        Self {
            alive: true,
            zombie: true,
            ..Default::default()
        }
    }

    pub fn denied() -> Self {
        Self {
            alive: true,
            query_failed: true,
            ..Default::default()
        }
    }
}

/// Remembers the previous CPU reading so usage is reported per interval
#[derive(Debug, Clone)]
pub struct CpuTracker {
    started: Instant,
    last: Option<(Instant, f64)>,
}

impl CpuTracker {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            last: None,
        }
    }

    /// Percent of one core used since the previous call, given total CPU seconds so far
    pub fn update(&mut self, cpu_seconds: f64) -> f64 {
        let now = Instant::now();
        let (since, prev) = self.last.unwrap_or((self.started, 0.0));
        self.last = Some((now, cpu_seconds));
        let wall = now.duration_since(since).as_secs_f64();
        if wall <= f64::EPSILON {
            return 0.0;
        }
        ((cpu_seconds - prev).max(0.0) / wall * 100.0).max(0.0)
    }
}

/// Sample a live process by pid
#[cfg(target_os = "linux")]
pub fn sample_pid(pid: u32, cpu: &mut CpuTracker) -> ResourceSample {
    use std::io::ErrorKind;

    let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => return ResourceSample::exited(),
        Err(_) => return ResourceSample::denied(),
    };
    let Some(stat) = ProcStat::parse(&stat) else {
        return ResourceSample::denied();
    };
    if stat.state == 'Z' {
        return ResourceSample::zombie();
    }
    if stat.state == 'X' {
        return ResourceSample::exited();
    }

    let ticks = clock_ticks();
    let cpu_percent = cpu.update((stat.utime + stat.stime) as f64 / ticks);
    let memory_percent = match mem_total_bytes() {
        Some(total) if total > 0 => stat.rss_pages as f64 * page_size() / total as f64 * 100.0,
        _ => 0.0,
    };
    ResourceSample::running(cpu_percent, memory_percent)
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn sample_pid(pid: u32, cpu: &mut CpuTracker) -> ResourceSample {
    let _ = cpu;
    let output = std::process::Command::new("ps")
        .args(["-o", "state=,%cpu=,%mem=", "-p", &pid.to_string()])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            parse_ps_line(&String::from_utf8_lossy(&out.stdout)).unwrap_or_else(ResourceSample::denied)
        }
        // ps exits non-zero when the pid is gone
        Ok(_) => ResourceSample::exited(),
        Err(_) => ResourceSample::denied(),
    }
}

#[cfg(not(unix))]
pub fn sample_pid(_pid: u32, _cpu: &mut CpuTracker) -> ResourceSample {
    ResourceSample::running(0.0, 0.0)
}

/// Fields of `/proc/<pid>/stat` we care about
#[derive(Debug, Clone, PartialEq)]
pub struct ProcStat {
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub rss_pages: u64,
}

impl ProcStat {
    pub fn parse(content: &str) -> Option<Self> {
        // the command name may contain spaces and parentheses
        let rest = &content[content.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        Some(Self {
            state: fields.first()?.chars().next()?,
            utime: fields.get(11)?.parse().ok()?,
            stime: fields.get(12)?.parse().ok()?,
            rss_pages: fields.get(21)?.parse().ok()?,
        })
    }
}

/// Parse one `ps -o state=,%cpu=,%mem=` line
pub fn parse_ps_line(line: &str) -> Option<ResourceSample> {
    let mut parts = line.split_whitespace();
    let state = parts.next()?;
    let cpu: f64 = parts.next()?.parse().ok()?;
    let mem: f64 = parts.next()?.parse().ok()?;
    if state.starts_with('Z') {
        return Some(ResourceSample::zombie());
    }
    Some(ResourceSample::running(cpu, mem))
}

#[cfg(target_os = "linux")]
fn clock_ticks() -> f64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

#[cfg(target_os = "linux")]
fn page_size() -> f64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as f64 } else { 4096.0 }
}

#[cfg(target_os = "linux")]
fn mem_total_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total(&meminfo)
}

pub fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_proc_stat_with_odd_name() {
        let line = "4242 (my (odd) app) S 1 4242 4242 0 -1 4194560 1234 0 0 0 150 25 0 0 20 0 3 0 987 123456789 2048 18446744073709551615";
        let stat = ProcStat::parse(line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.utime, 150);
        assert_eq!(stat.stime, 25);
        assert_eq!(stat.rss_pages, 2048);
        assert_eq!(ProcStat::parse("garbage"), None);
    }

    #[test]
    fn test_ps_line() {
        assert_eq!(
            parse_ps_line("R    99.5  2.0\n"),
            Some(ResourceSample::running(99.5, 2.0))
        );
        assert_eq!(parse_ps_line("Z+ 0.0 0.0"), Some(ResourceSample::zombie()));
        assert_eq!(parse_ps_line(""), None);
    }

    #[test]
    fn test_mem_total() {
        let meminfo = "MemTotal:       16318480 kB\nMemFree:         1000 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16318480 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB"), None);
    }

    #[test]
    fn test_cpu_tracker_uses_interval() {
        let started = Instant::now() - Duration::from_secs(2);
        let mut tracker = CpuTracker::new(started);
        // one CPU second over roughly two wall seconds
        let first = tracker.update(1.0);
        assert!((40.0..=55.0).contains(&first), "got {}", first);
        // no CPU used since the last reading
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.update(1.0), 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_self_is_alive() {
        let mut tracker = CpuTracker::new(Instant::now());
        let sample = sample_pid(std::process::id(), &mut tracker);
        assert!(sample.alive);
        assert!(!sample.zombie);
        assert!(sample.memory_percent > 0.0);
    }
}
