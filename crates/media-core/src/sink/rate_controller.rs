//! Adaptive drain-rate control for a sink's sources.
//!
//! Watches how much audio is queued per source ahead of the mixer, smooths
//! it with an EWMA, and asks sources sitting above the target level to play
//! slightly fast until they drain. Commands only go out when the ratio
//! moves by a meaningful delta.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::settings::AudioEngineSettings;

/// Backlog metrics sampled from the mixer's input queues.
#[derive(Debug, Clone, Default)]
pub struct InputBufferMetrics {
    /// Total buffered audio across sources, in milliseconds.
    pub total_ms: f64,
    /// Average per-source backlog in milliseconds.
    pub avg_per_source_ms: f64,
    /// Largest per-source backlog in milliseconds.
    pub max_per_source_ms: f64,
    /// Total queued chunks.
    pub queued_blocks: usize,
    /// Sources currently feeding the sink.
    pub active_sources: usize,
    /// Duration of one chunk in milliseconds.
    pub block_duration_ms: f64,
    /// Whether the sample is meaningful.
    pub valid: bool,
    /// Per-source backlog in milliseconds.
    pub per_source_ms: HashMap<String, f64>,
}

/// Receives `(instance_id, ratio)` drain commands.
pub type RateCommandCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

struct ControllerState {
    per_source_smoothed_ms: HashMap<String, f64>,
    last_commanded_ratio: HashMap<String, f64>,
}

/// Per-sink backlog smoother and rate commander.
pub struct SinkRateController {
    sink_id: String,
    settings: Arc<AudioEngineSettings>,
    smoothed_total_ms: Mutex<f64>,
    state: Mutex<ControllerState>,
    callback: Mutex<Option<RateCommandCallback>>,
}

impl SinkRateController {
    /// Creates a controller for the named sink.
    pub fn new(sink_id: impl Into<String>, settings: Arc<AudioEngineSettings>) -> Self {
        SinkRateController {
            sink_id: sink_id.into(),
            settings,
            smoothed_total_ms: Mutex::new(0.0),
            state: Mutex::new(ControllerState {
                per_source_smoothed_ms: HashMap::new(),
                last_commanded_ratio: HashMap::new(),
            }),
            callback: Mutex::new(None),
        }
    }

    /// Installs the command sink.
    pub fn set_rate_command_callback(&self, callback: RateCommandCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Feeds one backlog sample and dispatches any needed rate commands.
    pub fn update_drain_ratio(&self, metrics: &InputBufferMetrics) {
        if !metrics.valid {
            return;
        }
        let tuning = &self.settings.rate_controller_tuning;
        let alpha = tuning.smoothing_alpha;

        {
            let mut smoothed = self.smoothed_total_ms.lock();
            *smoothed = *smoothed * (1.0 - alpha) + metrics.avg_per_source_ms * alpha;
        }

        let callback = self.callback.lock().clone();
        let mut state = self.state.lock();
        for (instance_id, &backlog_ms) in &metrics.per_source_ms {
            let smoothed = state
                .per_source_smoothed_ms
                .entry(instance_id.clone())
                .or_insert(backlog_ms);
            *smoothed = *smoothed * (1.0 - alpha) + backlog_ms * alpha;
            let smoothed = *smoothed;

            let ratio = self.drain_ratio_for_level(smoothed);
            let last = state
                .last_commanded_ratio
                .get(instance_id)
                .copied()
                .unwrap_or(1.0);
            if (ratio - last).abs() >= tuning.command_epsilon {
                debug!(
                    sink = %self.sink_id,
                    instance = %instance_id,
                    backlog_ms = smoothed,
                    ratio,
                    "issuing drain rate command"
                );
                state
                    .last_commanded_ratio
                    .insert(instance_id.clone(), ratio);
                if let Some(callback) = &callback {
                    callback(instance_id, ratio);
                }
            }
        }
    }

    /// Forgets a removed source.
    pub fn remove_source(&self, instance_id: &str) {
        let mut state = self.state.lock();
        state.per_source_smoothed_ms.remove(instance_id);
        state.last_commanded_ratio.remove(instance_id);
    }

    /// Smoothed average backlog across sources, in milliseconds.
    pub fn smoothed_buffer_level_ms(&self) -> f64 {
        *self.smoothed_total_ms.lock()
    }

    /// Maps a smoothed backlog level to a drain ratio.
    fn drain_ratio_for_level(&self, buffer_ms: f64) -> f64 {
        let tuning = &self.settings.rate_controller_tuning;
        let target = self.settings.mixer_tuning.target_buffer_level_ms.max(1.0);
        let excess = ((buffer_ms - target) / target).max(0.0);
        (1.0 + tuning.drain_gain * excess).clamp(1.0, tuning.max_drain_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metrics(per_source: &[(&str, f64)], block_ms: f64) -> InputBufferMetrics {
        let total: f64 = per_source.iter().map(|(_, ms)| ms).sum();
        InputBufferMetrics {
            total_ms: total,
            avg_per_source_ms: total / per_source.len().max(1) as f64,
            max_per_source_ms: per_source.iter().map(|(_, ms)| *ms).fold(0.0, f64::max),
            queued_blocks: (total / block_ms) as usize,
            active_sources: per_source.len(),
            block_duration_ms: block_ms,
            valid: true,
            per_source_ms: per_source
                .iter()
                .map(|(id, ms)| (id.to_string(), *ms))
                .collect(),
        }
    }

    fn controller() -> (SinkRateController, Arc<Mutex<Vec<(String, f64)>>>) {
        let controller =
            SinkRateController::new("sink-test", Arc::new(AudioEngineSettings::default()));
        let commands: Arc<Mutex<Vec<(String, f64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&commands);
        controller.set_rate_command_callback(Arc::new(move |id, ratio| {
            sink.lock().push((id.to_string(), ratio));
        }));
        (controller, commands)
    }

    #[test]
    fn backlog_at_target_stays_at_unity() {
        let (controller, commands) = controller();
        for _ in 0..20 {
            controller.update_drain_ratio(&metrics(&[("src-1", 50.0)], 6.0));
        }
        // Ratio stays 1.0, so no command is ever issued.
        assert!(commands.lock().is_empty());
    }

    #[test]
    fn excess_backlog_raises_ratio_within_bounds() {
        let (controller, commands) = controller();
        for _ in 0..50 {
            controller.update_drain_ratio(&metrics(&[("src-1", 150.0)], 6.0));
        }
        let commands = commands.lock();
        assert!(!commands.is_empty());
        let (_, last_ratio) = commands.last().unwrap();
        // 150 ms vs 50 ms target: excess 2.0 → 1 + 0.1·2 = 1.2, clamped 1.05.
        assert!((*last_ratio - 1.05).abs() < 1e-6, "ratio {last_ratio}");
        for (_, ratio) in commands.iter() {
            assert!(*ratio >= 1.0 && *ratio <= 1.05);
        }
    }

    #[test]
    fn small_changes_are_suppressed() {
        let (controller, _) = controller();
        let counter = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&counter);
        controller.set_rate_command_callback(Arc::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        // A steady backlog converges; once converged, no more commands.
        for _ in 0..200 {
            controller.update_drain_ratio(&metrics(&[("src-1", 80.0)], 6.0));
        }
        let after_convergence = counter.load(Ordering::SeqCst);
        for _ in 0..50 {
            controller.update_drain_ratio(&metrics(&[("src-1", 80.0)], 6.0));
        }
        assert_eq!(counter.load(Ordering::SeqCst), after_convergence);
    }

    #[test]
    fn invalid_metrics_are_ignored() {
        let (controller, commands) = controller();
        let mut m = metrics(&[("src-1", 500.0)], 6.0);
        m.valid = false;
        controller.update_drain_ratio(&m);
        assert!(commands.lock().is_empty());
        assert_eq!(controller.smoothed_buffer_level_ms(), 0.0);
    }

    #[test]
    fn removed_sources_are_forgotten() {
        let (controller, _) = controller();
        for _ in 0..10 {
            controller.update_drain_ratio(&metrics(&[("src-1", 150.0)], 6.0));
        }
        controller.remove_source("src-1");
        assert!(controller
            .state
            .lock()
            .per_source_smoothed_ms
            .is_empty());
    }
}
