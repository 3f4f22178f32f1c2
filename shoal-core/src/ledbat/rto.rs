//! Round-trip time estimation and retransmission timeout (RFC 6298).

use std::time::Duration;

const INITIAL_RTO: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTO.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                // rttvar = 3/4 rttvar + 1/4 |srtt - rtt|, srtt = 7/8 srtt + 1/8 rtt
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto);
    }

    /// Double the timeout after a loss, up to `max_rto`.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, or the initial RTO before any sample.
    pub fn rtt(&self) -> Duration {
        self.srtt.unwrap_or(self.rto)
    }
}
