use std::time::Duration;

use relaybox_protocol::TransferProgress;
use tokio::time::Instant;

/// Whole-transfer throughput and ETA.
///
/// Only time spent running counts: [`Self::stop`] banks the current run so
/// a paused transfer does not dilute its rate.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    total_bytes: u64,
    total_chunks: u32,
    bytes: u64,
    chunks: u32,
    banked: Duration,
    running_since: Option<Instant>,
}

impl ThroughputMeter {
    pub fn new(total_bytes: u64, total_chunks: u32) -> Self {
        Self {
            total_bytes,
            total_chunks,
            bytes: 0,
            chunks: 0,
            banked: Duration::ZERO,
            running_since: None,
        }
    }

    /// Starts (or restarts after a pause) the active-time clock.
    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.banked += since.elapsed();
        }
    }

    /// Records one completed chunk of `bytes` plaintext bytes.
    pub fn record_chunk(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.chunks += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.banked + self.running_since.map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// Average bytes/second over the active time. Zero before any time has
    /// elapsed.
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs
    }

    /// Estimated time to finish, if a rate is known.
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.total_bytes.saturating_sub(self.bytes);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            chunks_completed: self.chunks,
            total_chunks: self.total_chunks,
            bytes_transferred: self.bytes,
            total_bytes: self.total_bytes,
            elapsed_ms: self.elapsed().as_millis() as u64,
            throughput_bps: self.bytes_per_second(),
            eta_ms: self.eta().map(|d| d.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_and_eta() {
        let mut meter = ThroughputMeter::new(4000, 4);
        assert_eq!(meter.bytes_per_second(), 0.0);
        assert_eq!(meter.eta(), None);

        meter.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        meter.record_chunk(1000);

        assert!((meter.bytes_per_second() - 500.0).abs() < 1e-6);
        assert_eq!(meter.eta(), Some(Duration::from_secs(6)));

        let p = meter.snapshot();
        assert_eq!(p.chunks_completed, 1);
        assert_eq!(p.total_chunks, 4);
        assert_eq!(p.elapsed_ms, 2000);
        assert_eq!(p.eta_ms, Some(6000));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_is_not_counted() {
        let mut meter = ThroughputMeter::new(2000, 2);
        meter.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        meter.record_chunk(1000);
        meter.stop();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(meter.elapsed(), Duration::from_secs(1));

        meter.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        meter.record_chunk(1000);
        assert_eq!(meter.elapsed(), Duration::from_secs(2));
        assert_eq!(meter.eta(), Some(Duration::ZERO));
    }
}
