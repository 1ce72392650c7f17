//! Source input processor: command handling plus the DSP pump.
//!
//! One thread per source consumes the bounded packet queue the timeshift
//! manager fills, runs each packet through the [`AudioProcessor`], and
//! splits the 32-bit output into fixed [`crate::OUTPUT_CHUNK_SAMPLES`]-sample
//! chunks for the sink mixer. A format change in the incoming packets tears
//! the DSP chain down and rebuilds it with the current volume, EQ and
//! speaker layout preserved. Delay, timeshift and playback-rate commands
//! don't touch audio here; they are reported upward to the timeshift
//! manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dsp::{AudioProcessor, AudioProcessorConfig};
use crate::settings::AudioEngineSettings;
use crate::timeshift::PacketQueue;
use crate::types::{ControlCommand, ProcessedAudioChunk, SourceProcessorConfig, SpeakerLayout, TaggedAudioPacket};
use crate::utils::{sentinel, ThreadSafeQueue};
use crate::{Result, EQ_BANDS, OUTPUT_CHUNK_SAMPLES};

/// Queue of processed chunks flowing into a sink mixer.
pub type ChunkQueue = ThreadSafeQueue<ProcessedAudioChunk>;

/// Queue of control commands for one processor.
pub type CommandQueue = ThreadSafeQueue<ControlCommand>;

/// Scheduling-related state reported upward from command handling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeshiftUpdate {
    /// New static delay in milliseconds.
    Delay(i32),
    /// New timeshift backshift in seconds.
    Timeshift(f32),
    /// New drain playback-rate ratio from a sink rate controller.
    PlaybackRate(f64),
}

/// Receives `(instance_id, update)` whenever a scheduling command arrives.
pub type TimeshiftUpdateCallback = Box<dyn Fn(&str, TimeshiftUpdate) + Send + Sync>;

struct DspState {
    processor: Option<AudioProcessor>,
    current_format: Option<(u16, u32, u16)>,
    volume: f32,
    eq: [f32; EQ_BANDS],
    speaker_layouts: HashMap<u16, SpeakerLayout>,
}

/// One per-source worker.
pub struct SourceInputProcessor {
    config: SourceProcessorConfig,
    settings: Arc<AudioEngineSettings>,
    input_queue: Arc<PacketQueue>,
    output_queue: Arc<ChunkQueue>,
    command_queue: Arc<CommandQueue>,
    dsp: Arc<Mutex<DspState>>,
    timeshift_callback: Arc<Mutex<Option<TimeshiftUpdateCallback>>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceInputProcessor {
    /// Creates a stopped processor around its three queues.
    pub fn new(
        config: SourceProcessorConfig,
        input_queue: Arc<PacketQueue>,
        output_queue: Arc<ChunkQueue>,
        command_queue: Arc<CommandQueue>,
        settings: Arc<AudioEngineSettings>,
    ) -> Self {
        info!(instance = %config.instance_id, source = %config.source_tag, "initializing source processor");
        let dsp = DspState {
            processor: None,
            current_format: None,
            volume: config.initial_volume,
            eq: config.initial_eq,
            speaker_layouts: HashMap::new(),
        };
        SourceInputProcessor {
            config,
            settings,
            input_queue,
            output_queue,
            command_queue,
            dsp: Arc::new(Mutex::new(dsp)),
            timeshift_callback: Arc::new(Mutex::new(None)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Installs the upward reporting callback; call before `start`.
    pub fn set_timeshift_callback(&self, callback: TimeshiftUpdateCallback) {
        *self.timeshift_callback.lock() = Some(callback);
    }

    /// The unique instance id.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// The source tag (or wildcard filter) this processor consumes.
    pub fn source_tag(&self) -> &str {
        &self.config.source_tag
    }

    /// The packet queue the timeshift manager should dispatch into.
    pub fn input_queue(&self) -> Arc<PacketQueue> {
        Arc::clone(&self.input_queue)
    }

    /// The chunk queue a sink mixer should consume.
    pub fn output_queue(&self) -> Arc<ChunkQueue> {
        Arc::clone(&self.output_queue)
    }

    /// Launches the pump thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            warn!(instance = %self.config.instance_id, "source processor already running");
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        let worker = Worker {
            config: self.config.clone(),
            settings: Arc::clone(&self.settings),
            input_queue: Arc::clone(&self.input_queue),
            output_queue: Arc::clone(&self.output_queue),
            command_queue: Arc::clone(&self.command_queue),
            dsp: Arc::clone(&self.dsp),
            timeshift_callback: Arc::clone(&self.timeshift_callback),
            stop_flag: Arc::clone(&self.stop_flag),
        };
        let handle = std::thread::Builder::new()
            .name(format!("source-{}", self.config.instance_id))
            .spawn(move || worker.run())
            .map_err(std::io::Error::other)?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stops the pump thread and both queues.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            info!(instance = %self.config.instance_id, "stopping source processor");
            self.stop_flag.store(true, Ordering::SeqCst);
            self.input_queue.stop();
            self.command_queue.stop();
            if handle.join().is_err() {
                error!(instance = %self.config.instance_id, "source processor thread panicked");
            }
        }
    }
}

impl Drop for SourceInputProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    config: SourceProcessorConfig,
    settings: Arc<AudioEngineSettings>,
    input_queue: Arc<PacketQueue>,
    output_queue: Arc<ChunkQueue>,
    command_queue: Arc<CommandQueue>,
    dsp: Arc<Mutex<DspState>>,
    timeshift_callback: Arc<Mutex<Option<TimeshiftUpdateCallback>>>,
    stop_flag: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        info!(instance = %self.config.instance_id, "source processor loop started");
        let poll = Duration::from_millis(self.settings.source_processor_tuning.command_loop_sleep_ms);
        let mut working_buffer: Vec<i32> = Vec::with_capacity(OUTPUT_CHUNK_SAMPLES * 4);
        let mut pending_origin: Option<Instant> = None;
        let mut pending_sentinel = false;

        while !self.stop_flag.load(Ordering::SeqCst) {
            self.process_commands();

            let Some(packet) = self.input_queue.pop_timeout(poll) else {
                if self.input_queue.is_stopped() {
                    break;
                }
                continue;
            };

            sentinel::log_packet_sentinel("source_processor", &packet);
            if !packet.format_is_valid() {
                warn!(
                    instance = %self.config.instance_id,
                    channels = packet.channels,
                    bit_depth = packet.bit_depth,
                    sample_rate = packet.sample_rate,
                    bytes = packet.audio_data.len(),
                    "dropping packet with invalid format"
                );
                continue;
            }

            let processed = self.process_packet(&packet);
            let Some(samples) = processed else { continue };
            if samples.is_empty() {
                continue;
            }

            if pending_origin.is_none() {
                pending_origin = Some(packet.received_time);
            }
            pending_sentinel |= packet.is_sentinel;
            working_buffer.extend_from_slice(&samples);

            while working_buffer.len() >= OUTPUT_CHUNK_SAMPLES {
                let rest = working_buffer.split_off(OUTPUT_CHUNK_SAMPLES);
                let chunk = ProcessedAudioChunk {
                    audio_data: std::mem::replace(&mut working_buffer, rest),
                    produced_time: Instant::now(),
                    origin_time: pending_origin,
                    is_sentinel: pending_sentinel,
                };
                sentinel::log_chunk_sentinel("source_processor_emit", &chunk);
                pending_sentinel = false;
                pending_origin = None;
                self.output_queue.push(chunk);
            }
        }
        info!(instance = %self.config.instance_id, "source processor loop exiting");
    }

    /// Drains the command queue without blocking.
    fn process_commands(&self) {
        while let Some(command) = self.command_queue.try_pop() {
            match command {
                ControlCommand::SetVolume(volume) => {
                    let mut dsp = self.dsp.lock();
                    dsp.volume = volume;
                    if let Some(processor) = dsp.processor.as_mut() {
                        processor.set_volume(volume);
                    }
                }
                ControlCommand::SetEq(eq) => {
                    let mut dsp = self.dsp.lock();
                    dsp.eq = eq;
                    if let Some(processor) = dsp.processor.as_mut() {
                        processor.set_equalizer(&eq);
                    }
                }
                ControlCommand::SetSpeakerLayout {
                    input_channels,
                    layout,
                } => {
                    let mut dsp = self.dsp.lock();
                    let applies_now = dsp
                        .current_format
                        .map(|(ch, _, _)| ch == input_channels)
                        .unwrap_or(false);
                    if applies_now {
                        if let Some(processor) = dsp.processor.as_mut() {
                            if layout.auto_mode {
                                processor.use_auto_speaker_mix();
                            } else {
                                processor.set_speaker_mix_matrix(&layout.matrix);
                            }
                        }
                    }
                    dsp.speaker_layouts.insert(input_channels, layout);
                }
                ControlCommand::SetDelay(delay_ms) => {
                    self.report(TimeshiftUpdate::Delay(delay_ms));
                }
                ControlCommand::SetTimeshift(backshift_sec) => {
                    self.report(TimeshiftUpdate::Timeshift(backshift_sec));
                }
                ControlCommand::SetPlaybackRate(ratio) => {
                    self.report(TimeshiftUpdate::PlaybackRate(ratio));
                }
            }
        }
    }

    fn report(&self, update: TimeshiftUpdate) {
        if let Some(callback) = self.timeshift_callback.lock().as_ref() {
            callback(&self.config.instance_id, update);
        }
    }

    /// Rebuilds the DSP chain if the packet's format differs from the
    /// current one, then runs the packet through it.
    fn process_packet(&self, packet: &TaggedAudioPacket) -> Option<Vec<i32>> {
        let format = (packet.channels, packet.sample_rate, packet.bit_depth);
        let mut dsp = self.dsp.lock();

        if dsp.current_format != Some(format) || dsp.processor.is_none() {
            if let Some(old) = dsp.current_format {
                warn!(
                    instance = %self.config.instance_id,
                    ?old,
                    new = ?format,
                    "input format changed, rebuilding audio processor"
                );
            } else {
                info!(instance = %self.config.instance_id, format = ?format, "initializing audio processor");
            }

            let config = AudioProcessorConfig {
                input_channels: packet.channels,
                output_channels: self.config.output_channels,
                input_bit_depth: packet.bit_depth,
                input_sample_rate: packet.sample_rate,
                output_sample_rate: self.config.output_samplerate,
                volume: dsp.volume,
            };
            match AudioProcessor::new(config, self.settings.processor_tuning.clone()) {
                Ok(mut processor) => {
                    processor.set_equalizer(&dsp.eq.clone());
                    if let Some(layout) = dsp.speaker_layouts.get(&packet.channels) {
                        if !layout.auto_mode {
                            processor.set_speaker_mix_matrix(&layout.matrix.clone());
                        }
                    }
                    dsp.processor = Some(processor);
                    dsp.current_format = Some(format);
                }
                Err(err) => {
                    // Leave the processor unset; the next packet retries.
                    error!(instance = %self.config.instance_id, %err, "audio processor rebuild failed");
                    dsp.processor = None;
                    dsp.current_format = None;
                    return None;
                }
            }
        }

        let processor = dsp.processor.as_mut()?;
        match processor.process(&packet.audio_data, packet.playback_rate) {
            Ok(samples) => Some(samples),
            Err(err) => {
                debug!(instance = %self.config.instance_id, %err, "packet processing failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn make_processor() -> SourceInputProcessor {
        let config = SourceProcessorConfig {
            instance_id: "inst-1".into(),
            source_tag: "src-a".into(),
            output_channels: 2,
            output_samplerate: 48000,
            ..Default::default()
        };
        SourceInputProcessor::new(
            config,
            Arc::new(PacketQueue::new()),
            Arc::new(ChunkQueue::new()),
            Arc::new(CommandQueue::new()),
            Arc::new(AudioEngineSettings::default()),
        )
    }

    fn packet(bytes: usize) -> TaggedAudioPacket {
        TaggedAudioPacket {
            source_tag: "src-a".into(),
            rtp_timestamp: Some(0),
            sample_rate: 48000,
            channels: 2,
            bit_depth: 16,
            audio_data: vec![0u8; bytes],
            ..Default::default()
        }
    }

    #[test]
    fn emits_fixed_size_chunks() {
        let mut proc = make_processor();
        let input = proc.input_queue();
        let output = proc.output_queue();
        proc.start().unwrap();

        // 1152 bytes = 576 16-bit samples per packet; passthrough format, so
        // two packets yield exactly two 576-sample chunks.
        input.push(packet(1152));
        input.push(packet(1152));

        let chunk = output
            .pop_timeout(Duration::from_secs(2))
            .expect("first chunk");
        assert_eq!(chunk.audio_data.len(), OUTPUT_CHUNK_SAMPLES);
        let chunk = output
            .pop_timeout(Duration::from_secs(2))
            .expect("second chunk");
        assert_eq!(chunk.audio_data.len(), OUTPUT_CHUNK_SAMPLES);

        proc.stop();
    }

    #[test]
    fn format_change_rebuilds_and_continues() {
        let mut proc = make_processor();
        let input = proc.input_queue();
        let output = proc.output_queue();
        proc.start().unwrap();

        input.push(packet(1152));
        // Switch to mono mid-stream; the processor rebuilds and keeps going.
        let mut mono = packet(1152);
        mono.channels = 1;
        input.push(mono);

        let chunk = output
            .pop_timeout(Duration::from_secs(2))
            .expect("chunk after format change");
        assert_eq!(chunk.audio_data.len(), OUTPUT_CHUNK_SAMPLES);
        proc.stop();
    }

    #[test]
    fn invalid_packets_are_dropped() {
        let mut proc = make_processor();
        let input = proc.input_queue();
        let output = proc.output_queue();
        proc.start().unwrap();

        let mut bad = packet(1151); // not whole frames
        bad.audio_data.truncate(1151);
        input.push(bad);
        assert!(output.pop_timeout(Duration::from_millis(100)).is_none());
        proc.stop();
    }

    #[test]
    fn scheduling_commands_report_upward() {
        let proc = make_processor();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        proc.set_timeshift_callback(Box::new(move |instance, update| {
            assert_eq!(instance, "inst-1");
            match update {
                TimeshiftUpdate::Delay(50) | TimeshiftUpdate::Timeshift(_) => {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }));

        let worker = Worker {
            config: proc.config.clone(),
            settings: Arc::clone(&proc.settings),
            input_queue: proc.input_queue(),
            output_queue: proc.output_queue(),
            command_queue: Arc::clone(&proc.command_queue),
            dsp: Arc::clone(&proc.dsp),
            timeshift_callback: Arc::clone(&proc.timeshift_callback),
            stop_flag: Arc::clone(&proc.stop_flag),
        };
        proc.command_queue.push(ControlCommand::SetDelay(50));
        proc.command_queue.push(ControlCommand::SetTimeshift(1.5));
        worker.process_commands();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn volume_command_applies_to_live_processor() {
        let proc = make_processor();
        let worker = Worker {
            config: proc.config.clone(),
            settings: Arc::clone(&proc.settings),
            input_queue: proc.input_queue(),
            output_queue: proc.output_queue(),
            command_queue: Arc::clone(&proc.command_queue),
            dsp: Arc::clone(&proc.dsp),
            timeshift_callback: Arc::clone(&proc.timeshift_callback),
            stop_flag: Arc::clone(&proc.stop_flag),
        };
        // Build the processor by pushing one packet through.
        assert!(worker.process_packet(&packet(1152)).is_some());
        proc.command_queue.push(ControlCommand::SetVolume(0.25));
        worker.process_commands();
        assert_eq!(proc.dsp.lock().volume, 0.25);
    }
}
