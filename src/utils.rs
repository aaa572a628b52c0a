/// Returns the monotonic clock in nanoseconds.
///
/// Reads `CLOCK_MONOTONIC` directly so timestamps are immune to wall-clock
/// steps and cheap enough to take on both ends of every round.
///
/// # Panics
///
/// Panics if `clock_gettime` fails. `CLOCK_MONOTONIC` is mandatory on
/// every supported platform, so a failure here is a broken environment,
/// not a condition to hand back as a bogus zero timestamp.
#[cfg(unix)]
pub fn mono_time_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(
        rc,
        0,
        "clock_gettime(CLOCK_MONOTONIC) failed: {}",
        std::io::Error::last_os_error()
    );
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

/// Collects per-round latency samples and renders them as a
/// human-readable report or a single CSV row.
///
/// Used by the ping-pong driver; samples are nanoseconds.
pub struct LatencyStats {
    samples: Vec<u64>,
    sorted: bool,
}

impl LatencyStats {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            sorted: true,
        }
    }

    pub fn record(&mut self, nanos: u64) {
        self.samples.push(nanos);
        self.sorted = false;
    }

    /// Records the time elapsed since `start_ns`, a timestamp previously
    /// taken with [`mono_time_ns`].
    pub fn record_since(&mut self, start_ns: u64) {
        self.record(mono_time_ns().saturating_sub(start_ns));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            self.samples.sort_unstable();
            self.sorted = true;
        }
    }

    /// The `p`-quantile by nearest-rank, `0.0 <= p <= 1.0`.
    ///
    /// # Panics
    ///
    /// Panics on an empty collection or a `p` outside `[0, 1]`.
    pub fn quantile(&mut self, p: f64) -> u64 {
        assert!(!self.samples.is_empty());
        assert!((0.0..=1.0).contains(&p));
        self.ensure_sorted();
        let idx = ((self.samples.len() - 1) as f64 * p).round() as usize;
        self.samples[idx]
    }

    pub fn min(&mut self) -> u64 {
        self.quantile(0.0)
    }

    pub fn max(&mut self) -> u64 {
        self.quantile(1.0)
    }

    pub fn mean(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u128 = self.samples.iter().map(|&s| s as u128).sum();
        (sum / self.samples.len() as u128) as u64
    }

    const QUANTILES: [(&'static str, f64); 7] = [
        ("p50", 0.5),
        ("p75", 0.75),
        ("p90", 0.9),
        ("p95", 0.95),
        ("p99", 0.99),
        ("p99.9", 0.999),
        ("p99.99", 0.9999),
    ];

    /// Multi-line human-readable report.
    pub fn report(&mut self, title: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("{title}: {} rounds\n", self.len()));
        out.push_str(&format!(
            "  min {} ns, mean {} ns, max {} ns\n",
            self.min(),
            self.mean(),
            self.max()
        ));
        for (label, p) in Self::QUANTILES {
            out.push_str(&format!("  {label:>7}: {} ns\n", self.quantile(p)));
        }
        out
    }

    /// CSV header matching [`csv_row`](Self::csv_row).
    pub fn csv_header() -> String {
        let mut cols = vec!["name", "n", "min", "mean", "max"];
        cols.extend(Self::QUANTILES.iter().map(|(label, _)| *label));
        cols.join(",")
    }

    /// One CSV row with the same statistics as the report.
    pub fn csv_row(&mut self, title: &str) -> String {
        let mut cols = vec![
            title.to_string(),
            self.len().to_string(),
            self.min().to_string(),
            self.mean().to_string(),
            self.max().to_string(),
        ];
        cols.extend(
            Self::QUANTILES
                .iter()
                .map(|&(_, p)| self.quantile(p).to_string()),
        );
        cols.join(",")
    }
}
