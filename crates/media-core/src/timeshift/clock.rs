//! Per-stream clock model.
//!
//! A two-state Kalman filter estimates the offset and drift of a remote RTP
//! clock against the local monotonic clock. The state is `[offset, drift]`
//! with the measurement `measured_offset = arrival − rtp_ts / sample_rate`;
//! feeding it every packet gives a playout reference that is immune to
//! per-packet network jitter.

use std::time::Instant;

// Empirically chosen filter constants; may require tuning.
const INITIAL_UNCERTAINTY: f64 = 1.0;
const PROCESS_NOISE_Q: f64 = 1e-5;
const MEASUREMENT_NOISE_R: f64 = 1e-2;

/// Kalman offset/drift estimator for one stream.
#[derive(Debug, Clone)]
pub struct StreamClock {
    sample_rate: f64,
    offset: f64,
    drift: f64,
    p: [[f64; 2]; 2],
    process_noise: f64,
    measurement_noise: f64,
    // Epoch all time arithmetic is relative to; fixed at construction so
    // offsets stay small.
    epoch: Instant,
    last_update: Option<Instant>,
    last_innovation: f64,
    last_measured_offset: f64,
    initialized: bool,
}

impl StreamClock {
    /// Creates an uninitialized clock for a stream at `sample_rate`.
    pub fn new(sample_rate: f64) -> Self {
        StreamClock {
            sample_rate,
            offset: 0.0,
            drift: 0.0,
            p: [[INITIAL_UNCERTAINTY, 0.0], [0.0, INITIAL_UNCERTAINTY]],
            process_noise: PROCESS_NOISE_Q,
            measurement_noise: MEASUREMENT_NOISE_R,
            epoch: Instant::now(),
            last_update: None,
            last_innovation: 0.0,
            last_measured_offset: 0.0,
            initialized: false,
        }
    }

    /// Clears the filter back to its initial state.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.offset = 0.0;
        self.drift = 0.0;
        self.p = [[INITIAL_UNCERTAINTY, 0.0], [0.0, INITIAL_UNCERTAINTY]];
        self.last_update = None;
        self.last_innovation = 0.0;
        self.last_measured_offset = 0.0;
    }

    /// Feeds one packet's `(rtp_timestamp, arrival_time)` pair.
    pub fn update(&mut self, rtp_timestamp: u32, arrival_time: Instant) {
        let rtp_time_sec = rtp_timestamp as f64 / self.sample_rate;
        let arrival_sec = self.instant_to_sec(arrival_time);
        let measured_offset = arrival_sec - rtp_time_sec;
        self.last_measured_offset = measured_offset;

        if !self.initialized {
            self.offset = measured_offset;
            self.drift = 0.0;
            self.last_update = Some(arrival_time);
            self.initialized = true;
            return;
        }

        let last_update = self.last_update.expect("initialized implies last_update");
        let delta_t = if arrival_time > last_update {
            (arrival_time - last_update).as_secs_f64()
        } else {
            0.0
        };
        if delta_t == 0.0 {
            // Same-instant updates carry no new timing information and would
            // degenerate the covariance prediction.
            return;
        }
        self.last_update = Some(arrival_time);

        // Predict: offset advances by drift, covariance inflates by Q.
        self.offset += self.drift * delta_t;
        self.p[0][0] += delta_t * (2.0 * self.p[1][0] + delta_t * self.p[1][1]) + self.process_noise;
        self.p[0][1] += delta_t * self.p[1][1];
        self.p[1][0] += delta_t * self.p[1][1];
        self.p[1][1] += self.process_noise;

        // Innovate against the measured offset.
        let innovation = measured_offset - self.offset;
        self.last_innovation = innovation;
        let innovation_covariance = self.p[0][0] + self.measurement_noise;
        let k0 = self.p[0][0] / innovation_covariance;
        let k1 = self.p[1][0] / innovation_covariance;

        self.offset += k0 * innovation;
        self.drift += k1 * innovation;

        let p00 = self.p[0][0];
        let p01 = self.p[0][1];
        self.p[0][0] -= k0 * p00;
        self.p[0][1] -= k0 * p01;
        self.p[1][0] -= k1 * p00;
        self.p[1][1] -= k1 * p01;
    }

    /// Projects the expected arrival instant for an RTP timestamp.
    ///
    /// Returns `None` before the first update.
    pub fn expected_arrival_time(&self, rtp_timestamp: u32) -> Option<Instant> {
        if !self.initialized {
            return None;
        }
        let rtp_time_sec = rtp_timestamp as f64 / self.sample_rate;
        let expected_sec = rtp_time_sec + self.offset;
        Some(self.sec_to_instant(expected_sec))
    }

    /// Whether the filter has seen at least one packet.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Estimated offset in seconds.
    pub fn offset_seconds(&self) -> f64 {
        self.offset
    }

    /// Estimated drift in parts per million.
    pub fn drift_ppm(&self) -> f64 {
        self.drift * 1e6
    }

    /// Innovation of the latest update, in seconds.
    pub fn last_innovation_seconds(&self) -> f64 {
        self.last_innovation
    }

    /// Raw measured offset of the latest update, in seconds.
    pub fn last_measured_offset_seconds(&self) -> f64 {
        self.last_measured_offset
    }

    /// Time of the latest accepted update.
    pub fn last_update_time(&self) -> Option<Instant> {
        self.last_update
    }

    fn instant_to_sec(&self, t: Instant) -> f64 {
        if t >= self.epoch {
            (t - self.epoch).as_secs_f64()
        } else {
            -(self.epoch - t).as_secs_f64()
        }
    }

    fn sec_to_instant(&self, sec: f64) -> Instant {
        if sec >= 0.0 {
            self.epoch + std::time::Duration::from_secs_f64(sec)
        } else {
            self.epoch - std::time::Duration::from_secs_f64(-sec)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE_RATE: f64 = 48000.0;

    fn samples_to_duration(samples: u32) -> Duration {
        Duration::from_secs_f64(samples as f64 / SAMPLE_RATE)
    }

    #[test]
    fn initial_state() {
        let clock = StreamClock::new(SAMPLE_RATE);
        assert!(!clock.is_initialized());
        assert_eq!(clock.offset_seconds(), 0.0);
        assert_eq!(clock.drift_ppm(), 0.0);
        assert!(clock.expected_arrival_time(0).is_none());
    }

    #[test]
    fn initializes_on_first_update() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        let t0 = Instant::now();
        clock.update(0, t0);
        assert!(clock.is_initialized());
        // Immediately after the first update the model reproduces it.
        let predicted = clock.expected_arrival_time(0).unwrap();
        let diff = if predicted > t0 { predicted - t0 } else { t0 - predicted };
        assert!(diff < Duration::from_micros(1));
    }

    #[test]
    fn stable_clock_shows_no_drift() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        let t0 = Instant::now();
        for i in 0..100u32 {
            let rtp_ts = i * 480; // 10 ms steps
            clock.update(rtp_ts, t0 + samples_to_duration(rtp_ts));
        }
        assert!(clock.drift_ppm().abs() < 50.0);
    }

    #[test]
    fn detects_significant_drift() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        let t0 = Instant::now();
        // Remote clock runs 0.1% fast: packets arrive early and earlier.
        let drift_ratio = 1.001;
        for i in 0..200u32 {
            let rtp_ts = i * 480;
            let arrival =
                t0 + Duration::from_secs_f64(rtp_ts as f64 / SAMPLE_RATE / drift_ratio);
            clock.update(rtp_ts, arrival);
        }
        let drift = clock.drift_ppm().abs();
        assert!(drift > 500.0, "drift {drift} ppm");
        assert!(drift < 2000.0, "drift {drift} ppm");
    }

    #[test]
    fn predicts_future_arrivals() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        let t0 = Instant::now();
        for i in 0..=10u32 {
            let rtp_ts = i * 480;
            clock.update(rtp_ts, t0 + samples_to_duration(rtp_ts));
        }
        let future_ts = 20 * 480;
        let predicted = clock.expected_arrival_time(future_ts).unwrap();
        let expected = t0 + samples_to_duration(future_ts);
        let diff = if predicted > expected {
            predicted - expected
        } else {
            expected - predicted
        };
        assert!(diff < Duration::from_millis(10));
    }

    #[test]
    fn reset_clears_initialization() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        clock.update(0, Instant::now());
        assert!(clock.is_initialized());
        clock.reset();
        assert!(!clock.is_initialized());
    }

    #[test]
    fn survives_jitter() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        let t0 = Instant::now();
        for i in 0..100u32 {
            let rtp_ts = i * 480;
            let jitter_ms = ((i * 7) % 11) as i64 - 5;
            let ideal = t0 + samples_to_duration(rtp_ts);
            let arrival = if jitter_ms >= 0 {
                ideal + Duration::from_millis(jitter_ms as u64)
            } else {
                ideal - Duration::from_millis((-jitter_ms) as u64)
            };
            clock.update(rtp_ts, arrival);
        }
        assert!(clock.drift_ppm().is_finite());
        assert!(clock.is_initialized());
    }

    #[test]
    fn zero_delta_updates_are_skipped() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        let t0 = Instant::now();
        clock.update(0, t0);
        let offset = clock.offset_seconds();
        // Same arrival instant again: no state change.
        clock.update(480, t0);
        assert_eq!(clock.offset_seconds(), offset);
    }

    #[test]
    fn reports_innovation_for_late_packet() {
        let mut clock = StreamClock::new(SAMPLE_RATE);
        let t0 = Instant::now();
        clock.update(0, t0);
        clock.update(480, t0 + Duration::from_millis(50));
        assert!(clock.last_innovation_seconds().abs() * 1000.0 > 1.0);
    }
}
