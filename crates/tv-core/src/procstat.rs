//! Process self-metrics from procfs.
//!
//! Both the daemon (aggregate service statistics) and each worker (its
//! `statistic_stream` broadcasts) report their own CPU share and resident
//! set.  On non-Linux hosts both read as zero.

/// Tracks CPU time between samples so the load can be reported as a
/// fraction of one core over the sampling window.
#[derive(Debug, Default)]
pub struct ProcSampler {
    last_cpu_ticks: u64,
    last_wall_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcSample {
    /// Fraction of one core used since the previous sample, 0.0..=n_cores.
    pub cpu_load: f64,
    pub rss_bytes: u64,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, now_ms: i64) -> ProcSample {
        let Some((cpu_ticks, rss_bytes)) = read_self_stat() else {
            return ProcSample::default();
        };

        let mut cpu_load = 0.0;
        if self.last_wall_ms > 0 && now_ms > self.last_wall_ms {
            let tick_ms = 1000.0 / clock_ticks_per_sec();
            let used_ms = cpu_ticks.saturating_sub(self.last_cpu_ticks) as f64 * tick_ms;
            cpu_load = used_ms / (now_ms - self.last_wall_ms) as f64;
        }
        self.last_cpu_ticks = cpu_ticks;
        self.last_wall_ms = now_ms;

        ProcSample {
            cpu_load,
            rss_bytes,
        }
    }
}

fn clock_ticks_per_sec() -> f64 {
    // _SC_CLK_TCK is 100 on every mainstream kernel config.
    100.0
}

/// Returns (utime+stime in clock ticks, rss in bytes).
#[cfg(target_os = "linux")]
fn read_self_stat() -> Option<(u64, u64)> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Field 2 (comm) may contain spaces; skip past the closing paren.
    let rest = stat.rsplit_once(") ")?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: field index 11 = utime, 12 = stime, 21 = rss (pages),
    // counting from the state field as 0.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;
    Some((utime + stime, rss_pages * 4096))
}

#[cfg(not(target_os = "linux"))]
fn read_self_stat() -> Option<(u64, u64)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn rss_is_nonzero_on_linux() {
        let mut sampler = ProcSampler::new();
        let sample = sampler.sample(1_000);
        assert!(sample.rss_bytes > 0);
    }

    #[test]
    fn first_sample_reports_zero_load() {
        let mut sampler = ProcSampler::new();
        let sample = sampler.sample(1_000);
        assert_eq!(sample.cpu_load, 0.0);
    }
}
