//! Global packet ring and playout scheduler.
//!
//! A single worker thread owns the ordered ring of [`TaggedAudioPacket`]s
//! and a map of consumers, each with a dense read cursor into the ring. For
//! every consumer the scheduler computes the ideal playout time of the next
//! packet from the stream's [`StreamClock`] plus the desired latency, and
//! dispatches due packets into the consumer's bounded queue — trimming,
//! never blocking. Late streams are caught up with a bounded playback-rate
//! boost; unmanageably late packets are dropped and counted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::settings::AudioEngineSettings;
use crate::timeshift::StreamClock;
use crate::types::TaggedAudioPacket;
use crate::utils::{PushResult, ThreadSafeQueue};

/// Queue type consumers receive packets on.
pub type PacketQueue = ThreadSafeQueue<TaggedAudioPacket>;

const PROCESSING_BUDGET_ALPHA: f64 = 0.2;
// Allow ~250 ms of disagreement between an RTP jump and the wall clock
// before declaring a new session.
const RTP_CONTINUITY_SLACK_SECONDS: f64 = 0.25;
// RTP jumps beyond this fraction of a second of frames trigger the
// continuity test.
const RTP_RESET_THRESHOLD_SECONDS: f64 = 0.2;

/// One consumer of the ring.
struct ProcessorTargetInfo {
    target_queue: Arc<PacketQueue>,
    source_tag_filter: String,
    is_wildcard: bool,
    wildcard_prefix: String,
    bound_source_tag: String,
    next_packet_read_index: usize,
    current_delay_ms: i32,
    current_timeshift_backshift_sec: f32,
    drain_ratio: f64,
}

impl ProcessorTargetInfo {
    fn active_tag(&self) -> &str {
        if self.is_wildcard {
            &self.bound_source_tag
        } else {
            &self.source_tag_filter
        }
    }

    /// Matches the packet tag against the filter, binding a wildcard on its
    /// first match.
    fn match_and_bind(&mut self, actual_tag: &str) -> bool {
        if !self.is_wildcard {
            return actual_tag == self.source_tag_filter;
        }
        if !self.bound_source_tag.is_empty() {
            return self.bound_source_tag == actual_tag;
        }
        if actual_tag.starts_with(&self.wildcard_prefix) {
            info!(
                prefix = %self.wildcard_prefix,
                bound = %actual_tag,
                "bound wildcard consumer to source"
            );
            self.bound_source_tag = actual_tag.to_string();
            return true;
        }
        false
    }
}

/// Per-stream timing state and telemetry counters.
#[derive(Default)]
struct StreamTimingState {
    clock: Option<StreamClock>,
    is_first_packet: bool,
    last_rtp_timestamp: u32,
    last_wallclock: Option<Instant>,
    last_played_rtp_timestamp: u32,
    sample_rate: u32,
    samples_per_chunk: u32,

    target_buffer_level_ms: f64,
    current_buffer_level_ms: f64,
    current_playback_rate: f64,

    total_packets: u64,
    late_packets: u64,
    lagging_events: u64,
    tm_packets_discarded: u64,
    tm_buffer_underruns: u64,

    arrival_error_ms_sum: f64,
    arrival_error_ms_abs_sum: f64,
    arrival_error_ms_max: f64,
    arrival_error_ms_min: f64,
    arrival_error_samples: u64,

    playout_deviation_ms_sum: f64,
    playout_deviation_ms_abs_sum: f64,
    playout_deviation_ms_max: f64,
    playout_deviation_ms_min: f64,
    playout_deviation_samples: u64,

    head_lag_ms_sum: f64,
    head_lag_ms_max: f64,
    head_lag_ms_last: f64,
    head_lag_samples: u64,

    clock_innovation_abs_sum_ms: f64,
    clock_innovation_samples: u64,
}

impl StreamTimingState {
    fn fresh() -> Self {
        StreamTimingState {
            is_first_packet: true,
            current_playback_rate: 1.0,
            ..Default::default()
        }
    }

    fn record_clock_sample(&mut self, clock: &StreamClock, received: Instant) {
        if let Some(expected) = clock.expected_arrival_time(self.last_rtp_timestamp) {
            let error_ms = signed_ms(received, expected);
            self.arrival_error_ms_sum += error_ms;
            self.arrival_error_ms_abs_sum += error_ms.abs();
            if self.arrival_error_samples == 0 {
                self.arrival_error_ms_max = error_ms;
                self.arrival_error_ms_min = error_ms;
            } else {
                self.arrival_error_ms_max = self.arrival_error_ms_max.max(error_ms);
                self.arrival_error_ms_min = self.arrival_error_ms_min.min(error_ms);
            }
            self.arrival_error_samples += 1;
        }
        self.clock_innovation_abs_sum_ms += clock.last_innovation_seconds().abs() * 1000.0;
        self.clock_innovation_samples += 1;
    }
}

/// Everything guarded by the ring mutex.
struct RingState {
    ring: VecDeque<TaggedAudioPacket>,
    targets: HashMap<String, HashMap<String, ProcessorTargetInfo>>,
    last_cleanup: Instant,
    last_iteration_finish: Option<Instant>,
    smoothed_processing_per_packet_us: f64,
    budget_initialized: bool,
    profiling_dispatched: u64,
    profiling_dropped: u64,
}

struct Inner {
    settings: Arc<AudioEngineSettings>,
    data: Mutex<RingState>,
    run_cv: Condvar,
    timing: Mutex<HashMap<String, StreamTimingState>>,
    stop_flag: AtomicBool,
    state_version: AtomicU64,
    total_packets_added: AtomicU64,
}

/// Snapshot of one stream's timing state.
#[derive(Debug, Clone, Default)]
pub struct StreamTimingSnapshot {
    /// Packets accepted for this stream.
    pub total_packets: u64,
    /// Packets dispatched later than the late threshold.
    pub late_packets: u64,
    /// Cleanup evictions that removed packets this stream's consumer still
    /// owed.
    pub lagging_events: u64,
    /// Packets the scheduler discarded (unmanageable backlog, queue trims).
    pub tm_packets_discarded: u64,
    /// Consumer underruns observed.
    pub tm_buffer_underruns: u64,
    /// Current adaptive buffer target in milliseconds.
    pub target_buffer_level_ms: f64,
    /// Last applied playback rate.
    pub current_playback_rate: f64,
    /// Mean signed arrival error (ms).
    pub avg_arrival_error_ms: f64,
    /// Max signed arrival error (ms).
    pub max_arrival_error_ms: f64,
    /// Min signed arrival error (ms).
    pub min_arrival_error_ms: f64,
    /// Mean signed playout deviation (ms).
    pub avg_playout_deviation_ms: f64,
    /// Max playout deviation (ms).
    pub max_playout_deviation_ms: f64,
    /// Last head-of-queue lag (ms).
    pub last_head_lag_ms: f64,
    /// Max head-of-queue lag (ms).
    pub max_head_lag_ms: f64,
    /// Clock offset estimate (ms).
    pub clock_offset_ms: f64,
    /// Clock drift estimate (ppm).
    pub clock_drift_ppm: f64,
    /// Mean absolute Kalman innovation (ms).
    pub avg_abs_clock_innovation_ms: f64,
}

/// Aggregate manager statistics.
#[derive(Debug, Clone, Default)]
pub struct TimeshiftManagerStats {
    /// Packets ever accepted into the ring.
    pub total_packets_added: u64,
    /// Current ring depth.
    pub global_buffer_size: usize,
    /// Read cursor per consumer instance.
    pub processor_read_indices: HashMap<String, usize>,
    /// Per-stream timing snapshots.
    pub streams: HashMap<String, StreamTimingSnapshot>,
}

/// The global timeshift buffer and its scheduler thread.
pub struct TimeshiftManager {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl TimeshiftManager {
    /// Creates a stopped manager.
    pub fn new(settings: Arc<AudioEngineSettings>) -> Self {
        info!(
            max_buffer_duration_sec = settings.timeshift_tuning.max_buffer_duration_sec,
            "initializing timeshift manager"
        );
        TimeshiftManager {
            inner: Arc::new(Inner {
                settings,
                data: Mutex::new(RingState {
                    ring: VecDeque::new(),
                    targets: HashMap::new(),
                    last_cleanup: Instant::now(),
                    last_iteration_finish: None,
                    smoothed_processing_per_packet_us: 0.0,
                    budget_initialized: false,
                    profiling_dispatched: 0,
                    profiling_dropped: 0,
                }),
                run_cv: Condvar::new(),
                timing: Mutex::new(HashMap::new()),
                stop_flag: AtomicBool::new(false),
                state_version: AtomicU64::new(0),
                total_packets_added: AtomicU64::new(0),
            }),
            thread: None,
        }
    }

    /// Launches the scheduler thread.
    pub fn start(&mut self) -> crate::Result<()> {
        if self.thread.is_some() {
            warn!("timeshift manager already running");
            return Ok(());
        }
        self.inner.stop_flag.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("timeshift-manager".into())
            .spawn(move || inner.run())
            .map_err(std::io::Error::other)?;
        self.thread = Some(handle);
        info!("timeshift manager started");
        Ok(())
    }

    /// Signals the scheduler thread and joins it.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            {
                let data = self.inner.data.lock();
                let consumers: usize = data.targets.values().map(|m| m.len()).sum();
                info!(
                    buffer = data.ring.len(),
                    consumers, "stopping timeshift manager"
                );
            }
            self.inner.stop_flag.store(true, Ordering::SeqCst);
            self.inner.bump_state_version();
            if handle.join().is_err() {
                warn!("timeshift manager thread panicked");
            }
            info!("timeshift manager stopped");
        }
    }

    /// Accepts one packet into the global ring.
    ///
    /// Packets without an RTP timestamp or with a non-positive sample rate
    /// cannot be scheduled and are rejected.
    pub fn add_packet(&self, packet: TaggedAudioPacket) {
        self.inner.add_packet(packet);
    }

    /// Registers a consumer.
    ///
    /// With a positive `initial_timeshift_sec` the cursor starts at the
    /// first packet newer than `now − delay − backshift`; otherwise it
    /// points at the ring's end. A trailing `*` in `source_tag` makes it a
    /// wildcard prefix that binds on first match.
    pub fn register_processor(
        &self,
        instance_id: &str,
        source_tag: &str,
        target_queue: Arc<PacketQueue>,
        initial_delay_ms: i32,
        initial_timeshift_sec: f32,
    ) {
        self.inner.register_processor(
            instance_id,
            source_tag,
            target_queue,
            initial_delay_ms,
            initial_timeshift_sec,
        );
    }

    /// Removes a consumer.
    pub fn unregister_processor(&self, instance_id: &str, source_tag: &str) {
        self.inner.unregister_processor(instance_id, source_tag);
    }

    /// Updates a consumer's static delay.
    pub fn update_processor_delay(&self, instance_id: &str, delay_ms: i32) {
        self.inner.update_processor_delay(instance_id, delay_ms);
    }

    /// Updates a consumer's timeshift backshift and re-resolves its cursor.
    pub fn update_processor_timeshift(&self, instance_id: &str, timeshift_sec: f32) {
        self.inner.update_processor_timeshift(instance_id, timeshift_sec);
    }

    /// Installs a drain ratio for a consumer (from the sink rate
    /// controller); dispatched packets carry at least this playback rate.
    pub fn update_processor_playback_rate(&self, instance_id: &str, ratio: f64) {
        self.inner.update_processor_playback_rate(instance_id, ratio);
    }

    /// Forgets a stream entirely: timing state, wildcard bindings, queued
    /// packets of its consumers.
    pub fn reset_stream_state(&self, source_tag: &str) {
        self.inner.reset_stream_state(source_tag);
    }

    /// Snapshots manager statistics.
    pub fn stats(&self) -> TimeshiftManagerStats {
        self.inner.stats()
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Drop for TimeshiftManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn bump_state_version(&self) {
        self.state_version.fetch_add(1, Ordering::SeqCst);
        self.run_cv.notify_all();
    }

    fn add_packet(&self, packet: TaggedAudioPacket) {
        if self.stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let Some(rtp_timestamp) = packet.rtp_timestamp else {
            return;
        };
        if packet.sample_rate == 0 {
            return;
        }

        let mut data = self.data.lock();
        let mut timing = self.timing.lock();

        let reset_threshold_frames =
            (packet.sample_rate as f64 * RTP_RESET_THRESHOLD_SECONDS) as u32;

        let state = timing
            .entry(packet.source_tag.clone())
            .or_insert_with(StreamTimingState::fresh);

        if !state.is_first_packet && state.clock.is_some() && reset_threshold_frames > 0 {
            let delta = rtp_timestamp
                .wrapping_sub(state.last_rtp_timestamp)
                .min(state.last_rtp_timestamp.wrapping_sub(rtp_timestamp));
            let mut should_reset = delta > reset_threshold_frames;

            if should_reset {
                if let Some(last_wallclock) = state.last_wallclock {
                    if packet.received_time > last_wallclock {
                        let gap_sec = (packet.received_time - last_wallclock).as_secs_f64();
                        let expected_frames =
                            (gap_sec * packet.sample_rate as f64).round() as u64;
                        let slack_frames = (packet.sample_rate as f64
                            * RTP_CONTINUITY_SLACK_SECONDS)
                            .round() as u64;
                        let lower = expected_frames.saturating_sub(slack_frames);
                        let upper = expected_frames + slack_frames;
                        if (lower..=upper).contains(&(delta as u64)) {
                            // The jump matches elapsed wall time: the source
                            // paused, it did not restart.
                            should_reset = false;
                            debug!(
                                source = %packet.source_tag,
                                delta,
                                expected_frames,
                                "rtp jump matches wall-clock advance, keeping timing state"
                            );
                        }
                    }
                }
            }

            if should_reset {
                info!(
                    source = %packet.source_tag,
                    delta,
                    "rtp discontinuity, resetting stream timing state"
                );
                let reset_position = data.ring.len();
                for instances in data.targets.values_mut() {
                    for target in instances.values_mut() {
                        if target.active_tag() == packet.source_tag
                            || (target.is_wildcard
                                && target.bound_source_tag == packet.source_tag)
                        {
                            target.next_packet_read_index = reset_position;
                            let drained = target.target_queue.drain();
                            if drained > 0 {
                                debug!(
                                    instance = %target.source_tag_filter,
                                    drained,
                                    "drained stale packets after discontinuity"
                                );
                            }
                        }
                    }
                }
                *state = StreamTimingState::fresh();
                self.state_version.fetch_add(1, Ordering::SeqCst);
                self.run_cv.notify_one();
            }
        }

        if state.is_first_packet {
            state.target_buffer_level_ms = self.settings.timeshift_tuning.target_buffer_level_ms;
        }
        state.total_packets += 1;

        if state.clock.is_none() {
            state.clock = Some(StreamClock::new(packet.sample_rate as f64));
        }
        let clock = state.clock.as_mut().expect("created above");
        clock.update(rtp_timestamp, packet.received_time);

        state.is_first_packet = false;
        state.last_rtp_timestamp = rtp_timestamp;
        state.last_wallclock = Some(packet.received_time);
        state.sample_rate = packet.sample_rate;
        state.samples_per_chunk = packet.frames() as u32;
        let clock_copy = state.clock.clone().expect("created above");
        state.record_clock_sample(&clock_copy, packet.received_time);

        drop(timing);

        data.ring.push_back(packet);
        drop(data);

        self.total_packets_added.fetch_add(1, Ordering::Relaxed);
        self.bump_state_version();
    }

    fn register_processor(
        &self,
        instance_id: &str,
        source_tag: &str,
        target_queue: Arc<PacketQueue>,
        initial_delay_ms: i32,
        initial_timeshift_sec: f32,
    ) {
        info!(
            instance_id,
            source_tag, initial_delay_ms, initial_timeshift_sec, "registering processor"
        );
        let is_wildcard = source_tag.ends_with('*');
        let wildcard_prefix = if is_wildcard {
            source_tag[..source_tag.len() - 1].to_string()
        } else {
            String::new()
        };

        let mut info = ProcessorTargetInfo {
            target_queue,
            source_tag_filter: source_tag.to_string(),
            is_wildcard,
            wildcard_prefix,
            bound_source_tag: if is_wildcard {
                String::new()
            } else {
                source_tag.to_string()
            },
            next_packet_read_index: 0,
            current_delay_ms: initial_delay_ms,
            current_timeshift_backshift_sec: initial_timeshift_sec,
            drain_ratio: 1.0,
        };

        {
            let mut data = self.data.lock();
            info.next_packet_read_index = if initial_timeshift_sec > 0.0 && !data.ring.is_empty() {
                let target_past = Instant::now()
                    - Duration::from_millis(initial_delay_ms.max(0) as u64)
                    - Duration::from_secs_f64(initial_timeshift_sec as f64);
                data.ring
                    .iter()
                    .position(|p| p.received_time >= target_past)
                    .unwrap_or(data.ring.len())
            } else if initial_timeshift_sec > 0.0 {
                0
            } else {
                data.ring.len()
            };
            debug!(
                instance_id,
                read_index = info.next_packet_read_index,
                "processor cursor resolved"
            );
            data.targets
                .entry(source_tag.to_string())
                .or_default()
                .insert(instance_id.to_string(), info);
        }
        self.bump_state_version();
    }

    fn unregister_processor(&self, instance_id: &str, source_tag: &str) {
        info!(instance_id, source_tag, "unregistering processor");
        {
            let mut data = self.data.lock();
            if let Some(instances) = data.targets.get_mut(source_tag) {
                instances.remove(instance_id);
                if instances.is_empty() {
                    data.targets.remove(source_tag);
                }
            }
        }
        self.bump_state_version();
    }

    fn update_processor_delay(&self, instance_id: &str, delay_ms: i32) {
        let mut found = false;
        {
            let mut data = self.data.lock();
            for instances in data.targets.values_mut() {
                if let Some(target) = instances.get_mut(instance_id) {
                    target.current_delay_ms = delay_ms;
                    found = true;
                    break;
                }
            }
        }
        if !found {
            warn!(instance_id, "delay update for unknown processor");
        }
        self.bump_state_version();
    }

    fn update_processor_timeshift(&self, instance_id: &str, timeshift_sec: f32) {
        let mut found = false;
        {
            let mut data = self.data.lock();
            let RingState { ring, targets, .. } = &mut *data;
            for instances in targets.values_mut() {
                if let Some(target) = instances.get_mut(instance_id) {
                    found = true;
                    target.current_timeshift_backshift_sec = timeshift_sec;
                    target.next_packet_read_index = if ring.is_empty() {
                        0
                    } else {
                        let target_past = Instant::now()
                            - Duration::from_millis(target.current_delay_ms.max(0) as u64)
                            - Duration::from_secs_f64(timeshift_sec.max(0.0) as f64);
                        ring.iter()
                            .position(|p| p.received_time >= target_past)
                            .unwrap_or(ring.len())
                    };
                    info!(
                        instance_id,
                        timeshift_sec,
                        read_index = target.next_packet_read_index,
                        "timeshift updated"
                    );
                    break;
                }
            }
        }
        if !found {
            warn!(instance_id, "timeshift update for unknown processor");
        }
        self.bump_state_version();
    }

    fn update_processor_playback_rate(&self, instance_id: &str, ratio: f64) {
        let mut data = self.data.lock();
        for instances in data.targets.values_mut() {
            if let Some(target) = instances.get_mut(instance_id) {
                target.drain_ratio = ratio.max(1.0);
                return;
            }
        }
        warn!(instance_id, "playback rate update for unknown processor");
    }

    fn reset_stream_state(&self, source_tag: &str) {
        info!(source_tag, "resetting stream state");
        {
            let mut data = self.data.lock();
            let reset_position = data.ring.len();
            for instances in data.targets.values_mut() {
                for target in instances.values_mut() {
                    let direct = !target.is_wildcard && target.source_tag_filter == source_tag;
                    let bound = target.is_wildcard && target.bound_source_tag == source_tag;
                    if !direct && !bound {
                        continue;
                    }
                    target.next_packet_read_index = reset_position;
                    if target.is_wildcard {
                        target.bound_source_tag.clear();
                    }
                    target.target_queue.drain();
                }
            }
        }
        self.timing.lock().remove(source_tag);
        self.bump_state_version();
    }

    fn run(self: Arc<Self>) {
        info!("timeshift scheduler loop started");
        let mut last_processed_version = self.state_version.load(Ordering::SeqCst);
        let mut profiler_last_log = Instant::now();

        while !self.stop_flag.load(Ordering::SeqCst) {
            self.dispatch_due_packets();

            let cleanup_interval =
                Duration::from_millis(self.settings.timeshift_tuning.cleanup_interval_ms);
            let cleanup_due = self.data.lock().last_cleanup.elapsed() > cleanup_interval;
            if cleanup_due {
                self.cleanup_ring();
                self.data.lock().last_cleanup = Instant::now();
            }

            if self.settings.profiler.enabled {
                let interval = Duration::from_millis(self.settings.profiler.log_interval_ms.max(1));
                if profiler_last_log.elapsed() >= interval {
                    profiler_last_log = Instant::now();
                    let mut data = self.data.lock();
                    let consumers: usize = data.targets.values().map(|m| m.len()).sum();
                    info!(
                        buffer = data.ring.len(),
                        consumers,
                        dispatched = data.profiling_dispatched,
                        dropped = data.profiling_dropped,
                        budget_us = data.smoothed_processing_per_packet_us,
                        "timeshift profiler"
                    );
                    data.profiling_dispatched = 0;
                    data.profiling_dropped = 0;
                }
            }

            let mut data = self.data.lock();
            let wakeup = self.next_wakeup_time(&data);
            // Sleep until the deadline unless the state version moves; the
            // deadline itself is bounded by loop_max_sleep.
            while !self.stop_flag.load(Ordering::SeqCst)
                && self.state_version.load(Ordering::SeqCst) == last_processed_version
            {
                if self.run_cv.wait_until(&mut data, wakeup).timed_out() {
                    break;
                }
            }
            last_processed_version = self.state_version.load(Ordering::SeqCst);
        }
        info!("timeshift scheduler loop exiting");
    }

    /// Pushes every due packet to its consumers. Called from the scheduler
    /// thread; takes the ring lock for the full pass.
    fn dispatch_due_packets(&self) {
        let iteration_start = Instant::now();
        let mut packets_processed: usize = 0;

        let tuning = &self.settings.timeshift_tuning;
        let mut data = self.data.lock();
        if data.ring.is_empty() {
            return;
        }
        let RingState {
            ring,
            targets,
            profiling_dispatched,
            profiling_dropped,
            ..
        } = &mut *data;

        for instances in targets.values_mut() {
            for (instance_id, target) in instances.iter_mut() {
                while target.next_packet_read_index < ring.len() {
                    let candidate = &ring[target.next_packet_read_index];

                    if !target.match_and_bind(&candidate.source_tag) {
                        target.next_packet_read_index += 1;
                        continue;
                    }

                    let (Some(rtp_ts), true) =
                        (candidate.rtp_timestamp, candidate.sample_rate > 0)
                    else {
                        target.next_packet_read_index += 1;
                        continue;
                    };

                    // Timing state lives under its own mutex; hold it only
                    // long enough to read the clock and bump counters.
                    let mut timing = self.timing.lock();
                    let Some(state) = timing.get_mut(&candidate.source_tag) else {
                        drop(timing);
                        target.next_packet_read_index += 1;
                        continue;
                    };
                    let Some(expected_arrival) = state
                        .clock
                        .as_ref()
                        .and_then(|c| c.expected_arrival_time(rtp_ts))
                    else {
                        drop(timing);
                        target.next_packet_read_index += 1;
                        continue;
                    };

                    let timeshift_backshift_ms =
                        f64::from(target.current_timeshift_backshift_sec.max(0.0)) * 1000.0;
                    let mut base_latency_ms = f64::from(target.current_delay_ms)
                        .max(tuning.target_buffer_level_ms);
                    if tuning.max_adaptive_delay_ms > 0.0 {
                        base_latency_ms = base_latency_ms.min(tuning.max_adaptive_delay_ms);
                    }
                    let desired_latency_ms = base_latency_ms + timeshift_backshift_ms;
                    state.target_buffer_level_ms = desired_latency_ms;

                    let now = Instant::now();
                    let ideal_playout =
                        expected_arrival + Duration::from_secs_f64(desired_latency_ms / 1000.0);

                    let head_lag_ms = signed_ms(now, ideal_playout).max(0.0);
                    state.head_lag_ms_last = head_lag_ms;
                    state.head_lag_ms_sum += head_lag_ms;
                    state.head_lag_ms_max = state.head_lag_ms_max.max(head_lag_ms);
                    state.head_lag_samples += 1;

                    if ideal_playout > now {
                        // Not due yet; the wakeup computation will sleep
                        // until (just before) this playout time.
                        state.current_playback_rate = 1.0;
                        drop(timing);
                        break;
                    }

                    let lateness_ms = signed_ms(now, ideal_playout);
                    if lateness_ms > tuning.late_packet_threshold_ms {
                        state.late_packets += 1;
                    }
                    state.playout_deviation_ms_sum += lateness_ms;
                    state.playout_deviation_ms_abs_sum += lateness_ms.abs();
                    state.playout_deviation_ms_max =
                        state.playout_deviation_ms_max.max(lateness_ms);
                    state.playout_deviation_ms_min =
                        state.playout_deviation_ms_min.min(lateness_ms);
                    state.playout_deviation_samples += 1;

                    let catchup = compute_catchup_rate(lateness_ms, tuning);
                    let desired_rate = catchup
                        .max(target.drain_ratio)
                        .clamp(1.0, tuning.max_playback_rate);

                    let backlog_unmanageable = tuning.max_catchup_lag_ms > 0.0
                        && lateness_ms > tuning.max_catchup_lag_ms
                        && catchup >= tuning.absolute_max_playback_rate - 1e-3;
                    if backlog_unmanageable {
                        state.tm_packets_discarded += 1;
                        *profiling_dropped += 1;
                        warn!(
                            instance = %instance_id,
                            lateness_ms,
                            "dropping packet, backlog exceeds catch-up limit"
                        );
                        drop(timing);
                        target.next_packet_read_index += 1;
                        continue;
                    }

                    state.current_buffer_level_ms = 0.0;
                    state.current_playback_rate = desired_rate;
                    state.last_played_rtp_timestamp = rtp_ts;
                    drop(timing);

                    let mut packet = candidate.clone();
                    packet.playback_rate = desired_rate;
                    crate::utils::sentinel::log_packet_sentinel("timeshift_dispatch", &packet);

                    // Bound the consumer queue by chunks of audio: the
                    // desired latency divided by this packet's duration.
                    let chunk_ms = packet.duration_ms().max(1.0);
                    let mut dynamic_cap =
                        (desired_latency_ms / chunk_ms).ceil().max(1.0) as usize;
                    if tuning.max_processor_queue_packets > 0 {
                        dynamic_cap = dynamic_cap.min(tuning.max_processor_queue_packets);
                    }

                    let mut trimmed = 0usize;
                    while target.target_queue.len() >= dynamic_cap {
                        if target.target_queue.try_pop().is_none() {
                            break;
                        }
                        trimmed += 1;
                    }
                    if trimmed > 0 {
                        self.count_discards(&candidate.source_tag, trimmed as u64);
                        *profiling_dropped += trimmed as u64;
                        warn!(
                            instance = %instance_id,
                            trimmed,
                            cap = dynamic_cap,
                            "trimmed consumer queue to catch up"
                        );
                    }

                    let mut push_result =
                        target.target_queue.push_bounded(packet.clone(), dynamic_cap, false);
                    if push_result == PushResult::QueueFull {
                        if target.target_queue.try_pop().is_some() {
                            self.count_discards(&candidate.source_tag, 1);
                            *profiling_dropped += 1;
                            push_result =
                                target.target_queue.push_bounded(packet, dynamic_cap, false);
                        }
                    }
                    match push_result {
                        PushResult::Pushed => {
                            *profiling_dispatched += 1;
                            packets_processed += 1;
                        }
                        PushResult::QueueStopped | PushResult::QueueFull => {
                            self.count_discards(&candidate.source_tag, 1);
                            *profiling_dropped += 1;
                            warn!(
                                instance = %instance_id,
                                ?push_result,
                                "consumer queue rejected packet"
                            );
                        }
                    }

                    target.next_packet_read_index += 1;
                }
            }
        }

        let iteration_end = Instant::now();
        data.last_iteration_finish = Some(iteration_end);
        if packets_processed > 0 {
            let per_packet_us = (iteration_end - iteration_start).as_secs_f64() * 1e6
                / packets_processed as f64;
            if data.budget_initialized {
                data.smoothed_processing_per_packet_us = data.smoothed_processing_per_packet_us
                    * (1.0 - PROCESSING_BUDGET_ALPHA)
                    + per_packet_us * PROCESSING_BUDGET_ALPHA;
            } else {
                data.smoothed_processing_per_packet_us = per_packet_us;
                data.budget_initialized = true;
            }
        }
    }

    fn count_discards(&self, source_tag: &str, count: u64) {
        let mut timing = self.timing.lock();
        if let Some(state) = timing.get_mut(source_tag) {
            state.tm_packets_discarded += count;
        }
    }

    /// Evicts ring packets older than the retention window, shifting every
    /// cursor down and attributing misses.
    fn cleanup_ring(&self) {
        let mut data = self.data.lock();
        if data.ring.is_empty() {
            return;
        }
        let oldest_allowed = Instant::now()
            - Duration::from_secs(self.settings.timeshift_tuning.max_buffer_duration_sec);

        let remove_count = data
            .ring
            .iter()
            .take_while(|p| p.received_time < oldest_allowed)
            .count();
        if remove_count == 0 {
            return;
        }
        debug!(remove_count, "cleanup evicting expired ring packets");

        let RingState { ring, targets, .. } = &mut *data;
        for instances in targets.values_mut() {
            for (instance_id, target) in instances.iter_mut() {
                if target.next_packet_read_index < remove_count {
                    // The cursor sat inside the evicted block. Only count a
                    // lagging event if that block held packets this consumer
                    // was bound to play; otherwise it was merely idle.
                    let bound_tag = target.active_tag().to_string();
                    let truly_lagging = !bound_tag.is_empty()
                        && ring
                            .iter()
                            .skip(target.next_packet_read_index)
                            .take(remove_count - target.next_packet_read_index)
                            .any(|p| p.source_tag == bound_tag);
                    if truly_lagging {
                        warn!(
                            instance = %instance_id,
                            index = target.next_packet_read_index,
                            remove_count,
                            "consumer lagged behind cleanup, forcing catch-up"
                        );
                        let mut timing = self.timing.lock();
                        if let Some(state) = timing.get_mut(&bound_tag) {
                            state.lagging_events += 1;
                        }
                    }
                    target.next_packet_read_index = 0;
                } else {
                    target.next_packet_read_index -= remove_count;
                }
            }
        }
        ring.drain(..remove_count);
    }

    /// Earliest instant the scheduler must wake at: the nearest consumer
    /// playout (minus the smoothed processing budget), the next cleanup, or
    /// the max-sleep bound — whichever comes first.
    fn next_wakeup_time(&self, data: &RingState) -> Instant {
        let tuning = &self.settings.timeshift_tuning;
        let now = Instant::now();
        let reference_now = data
            .last_iteration_finish
            .map(|t| t.max(now))
            .unwrap_or(now);

        let next_cleanup =
            data.last_cleanup + Duration::from_millis(tuning.cleanup_interval_ms);
        let max_sleep = reference_now + Duration::from_millis(tuning.loop_max_sleep_ms);

        let mut earliest: Option<Instant> = None;
        let timing = self.timing.lock();
        for instances in data.targets.values() {
            for target in instances.values() {
                let Some(packet) = data.ring.get(target.next_packet_read_index) else {
                    continue;
                };
                let Some(rtp_ts) = packet.rtp_timestamp else {
                    continue;
                };
                let Some(state) = timing.get(&packet.source_tag) else {
                    continue;
                };
                let Some(expected) = state
                    .clock
                    .as_ref()
                    .and_then(|c| c.expected_arrival_time(rtp_ts))
                else {
                    continue;
                };

                let timeshift_ms =
                    f64::from(target.current_timeshift_backshift_sec.max(0.0)) * 1000.0;
                let mut base_latency_ms =
                    f64::from(target.current_delay_ms).max(tuning.target_buffer_level_ms);
                if tuning.max_adaptive_delay_ms > 0.0 {
                    base_latency_ms = base_latency_ms.min(tuning.max_adaptive_delay_ms);
                }
                let desired_latency_ms = base_latency_ms + timeshift_ms;
                let effective_latency_ms = desired_latency_ms.max(state.target_buffer_level_ms);

                let ideal_playout =
                    expected + Duration::from_secs_f64(effective_latency_ms / 1000.0);

                let mut candidate = ideal_playout;
                if data.budget_initialized && data.smoothed_processing_per_packet_us > 0.0 {
                    let budget =
                        Duration::from_micros(data.smoothed_processing_per_packet_us as u64);
                    if ideal_playout > reference_now {
                        candidate = if budget < ideal_playout - reference_now {
                            ideal_playout - budget
                        } else {
                            reference_now
                        };
                    }
                }
                earliest = Some(match earliest {
                    Some(e) => e.min(candidate),
                    None => candidate,
                });
            }
        }

        let earliest = earliest.unwrap_or(reference_now).max(reference_now);
        earliest.min(next_cleanup).min(max_sleep)
    }

    fn stats(&self) -> TimeshiftManagerStats {
        let mut stats = TimeshiftManagerStats {
            total_packets_added: self.total_packets_added.load(Ordering::Relaxed),
            ..Default::default()
        };
        {
            let data = self.data.lock();
            stats.global_buffer_size = data.ring.len();
            for instances in data.targets.values() {
                for (instance_id, target) in instances {
                    stats
                        .processor_read_indices
                        .insert(instance_id.clone(), target.next_packet_read_index);
                }
            }
        }
        let timing = self.timing.lock();
        for (tag, state) in timing.iter() {
            let snapshot = StreamTimingSnapshot {
                total_packets: state.total_packets,
                late_packets: state.late_packets,
                lagging_events: state.lagging_events,
                tm_packets_discarded: state.tm_packets_discarded,
                tm_buffer_underruns: state.tm_buffer_underruns,
                target_buffer_level_ms: state.target_buffer_level_ms,
                current_playback_rate: state.current_playback_rate,
                avg_arrival_error_ms: mean(state.arrival_error_ms_sum, state.arrival_error_samples),
                max_arrival_error_ms: state.arrival_error_ms_max,
                min_arrival_error_ms: state.arrival_error_ms_min,
                avg_playout_deviation_ms: mean(
                    state.playout_deviation_ms_sum,
                    state.playout_deviation_samples,
                ),
                max_playout_deviation_ms: state.playout_deviation_ms_max,
                last_head_lag_ms: state.head_lag_ms_last,
                max_head_lag_ms: state.head_lag_ms_max,
                clock_offset_ms: state
                    .clock
                    .as_ref()
                    .map(|c| c.offset_seconds() * 1000.0)
                    .unwrap_or(0.0),
                clock_drift_ppm: state.clock.as_ref().map(|c| c.drift_ppm()).unwrap_or(0.0),
                avg_abs_clock_innovation_ms: mean(
                    state.clock_innovation_abs_sum_ms,
                    state.clock_innovation_samples,
                ),
            };
            stats.streams.insert(tag.clone(), snapshot);
        }
        stats
    }
}

/// Catch-up rate for a backlog: base recovery plus a lateness-proportional
/// boost, capped by the absolute maximum and the operator ceiling.
fn compute_catchup_rate(backlog_ms: f64, tuning: &crate::settings::TimeshiftTuning) -> f64 {
    if backlog_ms <= 0.5 {
        return 1.0;
    }
    let max_increment = tuning.absolute_max_playback_rate - 1.0;
    if max_increment <= 0.0 {
        return 1.0;
    }
    let increment = (tuning.target_recovery_rate_ms_per_sec / 1000.0
        + tuning.catchup_boost_gain * backlog_ms)
        .min(max_increment);
    (1.0 + increment).clamp(1.0, tuning.max_playback_rate)
}

fn signed_ms(a: Instant, b: Instant) -> f64 {
    if a >= b {
        (a - b).as_secs_f64() * 1000.0
    } else {
        -((b - a).as_secs_f64() * 1000.0)
    }
}

fn mean(sum: f64, samples: u64) -> f64 {
    if samples == 0 {
        0.0
    } else {
        sum / samples as f64
    }
}
