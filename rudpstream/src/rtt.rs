//! RTT estimation using Jacobson/Karels smoothing.
//!
//! SRTT   = 7/8 * SRTT  + 1/8 * sample
//! RTTVAR = 3/4 * RTTVAR + 1/4 * |SRTT - sample|
//! RTO    = max(min_rtt, SRTT + 4 * RTTVAR)
//!
//! Per-segment backoff doubles the RTO on consecutive expiries, capped
//! at `8 * SRTT` (see `rto_cap`). Samples must come from first
//! transmissions only (Karn's rule); the caller enforces that.

use std::time::Duration;

/// RTT estimator with a configurable minimum-RTT floor.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Floor below which RTO never drops.
    min_rtt: Duration,
    /// Smoothed RTT.
    srtt: Option<Duration>,
    /// RTT variance.
    rttvar: Option<Duration>,
    /// Current base retransmission timeout.
    rto: Duration,
}

impl RttEstimator {
    pub fn new(min_rtt: Duration) -> Self {
        Self {
            min_rtt,
            srtt: None,
            rttvar: None,
            // until the first sample, wait a full second
            rto: Duration::from_secs(1).max(min_rtt),
        }
    }

    /// Update the estimator with a new RTT sample.
    pub fn update(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
            Some(srtt) => {
                let diff = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                let rttvar = self.rttvar.unwrap_or(diff);
                self.rttvar = Some((rttvar * 3 + diff) / 4);
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }

        if let (Some(srtt), Some(rttvar)) = (self.srtt, self.rttvar) {
            self.rto = (srtt + rttvar * 4).max(self.min_rtt);
        }
    }

    /// Current smoothed RTT; the floor until the first sample arrives.
    pub fn srtt(&self) -> Duration {
        self.srtt.unwrap_or(self.min_rtt)
    }

    /// Base retransmission timeout for a fresh segment.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Upper bound for backed-off per-segment timeouts.
    pub fn rto_cap(&self) -> Duration {
        (self.srtt() * 8).max(self.rto)
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: Duration = Duration::from_millis(80);

    #[test]
    fn first_sample_initializes() {
        let mut est = RttEstimator::new(FLOOR);
        est.update(Duration::from_millis(200));
        assert_eq!(est.srtt(), Duration::from_millis(200));
        // RTO = srtt + 4 * (srtt / 2)
        assert_eq!(est.rto(), Duration::from_millis(600));
    }

    #[test]
    fn subsequent_samples_smooth() {
        let mut est = RttEstimator::new(FLOOR);
        est.update(Duration::from_millis(100));
        est.update(Duration::from_millis(120));

        // SRTT = 7/8 * 100 + 1/8 * 120 = 102.5ms
        let srtt = est.srtt();
        assert!(
            srtt.as_millis() >= 102 && srtt.as_millis() <= 103,
            "srtt = {srtt:?}"
        );
    }

    #[test]
    fn floor_applies() {
        let mut est = RttEstimator::new(FLOOR);
        est.update(Duration::from_micros(200));
        assert!(est.rto() >= FLOOR);
    }

    #[test]
    fn cap_is_eight_srtt() {
        let mut est = RttEstimator::new(FLOOR);
        est.update(Duration::from_millis(100));
        assert_eq!(est.rto_cap(), Duration::from_millis(800));
    }
}
