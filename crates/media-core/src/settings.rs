//! Engine tuning knobs.
//!
//! One `AudioEngineSettings` instance is shared (via `Arc`) by every
//! component. The values here are tunables, not configuration-file schema;
//! parsing lives with the management layer.

use serde::{Deserialize, Serialize};

/// Timeshift manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeshiftTuning {
    /// How often the global ring is pruned.
    pub cleanup_interval_ms: u64,
    /// A dispatch later than this counts as a late packet.
    pub late_packet_threshold_ms: f64,
    /// Minimum desired buffer level per stream.
    pub target_buffer_level_ms: f64,
    /// Upper clamp on the adaptive portion of the delay (0 disables).
    pub max_adaptive_delay_ms: f64,
    /// Base backlog recovery rate in ms of audio per wall second.
    pub target_recovery_rate_ms_per_sec: f64,
    /// Additional recovery per millisecond of lateness.
    pub catchup_boost_gain: f64,
    /// Hard ceiling on the computed catch-up rate.
    pub absolute_max_playback_rate: f64,
    /// Operator-facing ceiling on the applied playback rate.
    pub max_playback_rate: f64,
    /// Lateness beyond which packets are dropped once the rate is maxed.
    pub max_catchup_lag_ms: f64,
    /// Longest the scheduler sleeps without re-evaluating.
    pub loop_max_sleep_ms: u64,
    /// Hard cap on a consumer's queued packets (0 = dynamic cap only).
    pub max_processor_queue_packets: usize,
    /// Wall-clock duration of audio retained in the global ring.
    pub max_buffer_duration_sec: u64,
}

impl Default for TimeshiftTuning {
    fn default() -> Self {
        TimeshiftTuning {
            cleanup_interval_ms: 1000,
            late_packet_threshold_ms: 10.0,
            target_buffer_level_ms: 15.0,
            max_adaptive_delay_ms: 0.0,
            target_recovery_rate_ms_per_sec: 20.0,
            catchup_boost_gain: 0.0005,
            absolute_max_playback_rate: 1.05,
            max_playback_rate: 1.02,
            max_catchup_lag_ms: 5000.0,
            loop_max_sleep_ms: 10,
            max_processor_queue_packets: 96,
            max_buffer_duration_sec: 300,
        }
    }
}

/// Sink mixer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerTuning {
    /// Grace period granted to an active source with no chunk ready.
    pub grace_period_timeout_ms: u64,
    /// Poll interval inside the grace period.
    pub grace_period_poll_interval_ms: u64,
    /// Target buffered audio per source feeding this sink.
    pub target_buffer_level_ms: f64,
    /// MP3 bitrate in kbit/s.
    pub mp3_bitrate_kbps: u32,
    /// Suspend MP3 encoding when the output queue exceeds this depth.
    pub mp3_output_queue_max_size: usize,
}

impl Default for MixerTuning {
    fn default() -> Self {
        MixerTuning {
            grace_period_timeout_ms: 12,
            grace_period_poll_interval_ms: 1,
            target_buffer_level_ms: 50.0,
            mp3_bitrate_kbps: 192,
            mp3_output_queue_max_size: 10,
        }
    }
}

/// Sink rate controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateControllerTuning {
    /// EWMA smoothing factor for backlog levels.
    pub smoothing_alpha: f64,
    /// Proportional gain from relative backlog excess to drain ratio.
    pub drain_gain: f64,
    /// Ceiling on the drain ratio.
    pub max_drain_ratio: f64,
    /// Minimum ratio change worth emitting a command for.
    pub command_epsilon: f64,
}

impl Default for RateControllerTuning {
    fn default() -> Self {
        RateControllerTuning {
            smoothing_alpha: 0.2,
            drain_gain: 0.1,
            max_drain_ratio: 1.05,
            command_epsilon: 0.001,
        }
    }
}

/// Source processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProcessorTuning {
    /// Sleep between command-queue polls.
    pub command_loop_sleep_ms: u64,
}

impl Default for SourceProcessorTuning {
    fn default() -> Self {
        SourceProcessorTuning {
            command_loop_sleep_ms: 20,
        }
    }
}

/// Per-source DSP tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorTuning {
    /// Oversampling factor applied around the EQ stage.
    pub oversampling_factor: u32,
    /// DC-removal high-pass cutoff.
    pub dc_filter_cutoff_hz: f32,
    /// Soft clipper threshold.
    pub soft_clip_threshold: f32,
    /// Soft clipper knee width.
    pub soft_clip_knee: f32,
    /// Noise shaping factor applied to the dither error accumulator.
    pub dither_noise_shaping_factor: f32,
}

impl Default for ProcessorTuning {
    fn default() -> Self {
        ProcessorTuning {
            oversampling_factor: 2,
            dc_filter_cutoff_hz: 20.0,
            soft_clip_threshold: 0.8,
            soft_clip_knee: 0.2,
            dither_noise_shaping_factor: 0.25,
        }
    }
}

/// Profiler output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerSettings {
    /// Emit periodic scheduler profiling lines.
    pub enabled: bool,
    /// Interval between profiling lines.
    pub log_interval_ms: u64,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        ProfilerSettings {
            enabled: false,
            log_interval_ms: 1000,
        }
    }
}

/// Telemetry output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Emit periodic telemetry lines.
    pub enabled: bool,
    /// Interval between telemetry lines.
    pub log_interval_ms: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        TelemetrySettings {
            enabled: true,
            log_interval_ms: 30000,
        }
    }
}

/// All engine tuning, shared across components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioEngineSettings {
    /// Timeshift manager tuning.
    pub timeshift_tuning: TimeshiftTuning,
    /// Sink mixer tuning.
    pub mixer_tuning: MixerTuning,
    /// Sink rate controller tuning.
    pub rate_controller_tuning: RateControllerTuning,
    /// Source processor tuning.
    pub source_processor_tuning: SourceProcessorTuning,
    /// DSP tuning.
    pub processor_tuning: ProcessorTuning,
    /// Profiler settings.
    pub profiler: ProfilerSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
}
