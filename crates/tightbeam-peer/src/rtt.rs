//! Round-trip-time and jitter tracking.

/// Which round-trip statistic to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RttStat {
    /// Smallest observed round-trip time.
    MinRtt,
    /// Largest observed round-trip time.
    MaxRtt,
    /// Smoothed average round-trip time.
    AvgRtt,
    /// Smallest observed jitter.
    MinJitter,
    /// Largest observed jitter.
    MaxJitter,
    /// Smoothed average jitter.
    AvgJitter,
}

/// Smoothed RTT/jitter statistics with bounded history.
///
/// Jitter is the absolute difference between consecutive samples. The
/// averages converge over roughly `NUM_SAMPLES` observations.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    min_rtt: f32,
    max_rtt: f32,
    avg_rtt: f32,
    jitter_min: f32,
    jitter_max: f32,
    jitter_avg: f32,
    last_rtt: f32,
}

const NUM_SAMPLES: f32 = 100.0;

impl RttEstimator {
    /// Creates an estimator with no samples yet.
    pub fn new() -> Self {
        Self {
            min_rtt: f32::MAX,
            max_rtt: 0.0,
            avg_rtt: -1.0,
            jitter_min: f32::MAX,
            jitter_max: 0.0,
            jitter_avg: -1.0,
            last_rtt: -1.0,
        }
    }

    /// Records one round-trip sample in seconds.
    pub fn record(&mut self, rtt: f32) {
        if self.last_rtt > -1.0 {
            let jitter = (rtt - self.last_rtt).abs();
            self.jitter_min = self.jitter_min.min(jitter);
            self.jitter_max = self.jitter_max.max(jitter);
            self.jitter_avg = if self.jitter_avg > -1.0 {
                self.jitter_avg * (NUM_SAMPLES - 1.0) / NUM_SAMPLES + jitter / NUM_SAMPLES
            } else {
                jitter
            };
        }
        self.min_rtt = self.min_rtt.min(rtt);
        self.max_rtt = self.max_rtt.max(rtt);
        self.avg_rtt = if self.avg_rtt > -1.0 {
            self.avg_rtt * (NUM_SAMPLES - 1.0) / NUM_SAMPLES + rtt / NUM_SAMPLES
        } else {
            rtt
        };
        self.last_rtt = rtt;
    }

    /// Smoothed average RTT, or `None` before the first sample.
    pub fn avg_rtt(&self) -> Option<f32> {
        (self.avg_rtt >= 0.0).then_some(self.avg_rtt)
    }

    /// The most recent sample, or `None` before the first.
    pub fn last_rtt(&self) -> Option<f32> {
        (self.last_rtt >= 0.0).then_some(self.last_rtt)
    }

    /// Reads one statistic; `None` before enough samples exist.
    pub fn stat(&self, kind: RttStat) -> Option<f32> {
        match kind {
            RttStat::MinRtt => (self.min_rtt < f32::MAX).then_some(self.min_rtt),
            RttStat::MaxRtt => self.avg_rtt().map(|_| self.max_rtt),
            RttStat::AvgRtt => self.avg_rtt(),
            RttStat::MinJitter => (self.jitter_min < f32::MAX).then_some(self.jitter_min),
            RttStat::MaxJitter => (self.jitter_avg >= 0.0).then_some(self.jitter_max),
            RttStat::AvgJitter => (self.jitter_avg >= 0.0).then_some(self.jitter_avg),
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_samples_reads_none() {
        let rtt = RttEstimator::new();
        for kind in [
            RttStat::MinRtt,
            RttStat::MaxRtt,
            RttStat::AvgRtt,
            RttStat::MinJitter,
            RttStat::MaxJitter,
            RttStat::AvgJitter,
        ] {
            assert_eq!(rtt.stat(kind), None);
        }
    }

    #[test]
    fn test_first_sample_seeds_average() {
        let mut rtt = RttEstimator::new();
        rtt.record(0.2);
        assert_eq!(rtt.stat(RttStat::AvgRtt), Some(0.2));
        assert_eq!(rtt.stat(RttStat::MinRtt), Some(0.2));
        assert_eq!(rtt.stat(RttStat::MaxRtt), Some(0.2));
        // Jitter needs two samples.
        assert_eq!(rtt.stat(RttStat::AvgJitter), None);
    }

    #[test]
    fn test_min_max_and_jitter() {
        let mut rtt = RttEstimator::new();
        rtt.record(0.1);
        rtt.record(0.3);
        rtt.record(0.2);

        assert_eq!(rtt.stat(RttStat::MinRtt), Some(0.1));
        assert_eq!(rtt.stat(RttStat::MaxRtt), Some(0.3));
        let max_jitter = rtt.stat(RttStat::MaxJitter).unwrap();
        assert!((max_jitter - 0.2).abs() < 1e-6);
        let min_jitter = rtt.stat(RttStat::MinJitter).unwrap();
        assert!((min_jitter - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_average_converges_slowly() {
        let mut rtt = RttEstimator::new();
        rtt.record(0.1);
        for _ in 0..20 {
            rtt.record(0.5);
        }
        let avg = rtt.stat(RttStat::AvgRtt).unwrap();
        assert!(avg > 0.1 && avg < 0.5, "smoothed average moves gradually, got {}", avg);
    }
}
