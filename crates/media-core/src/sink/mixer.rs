//! Sink mixer: synchronized mixing, Scream framing and emission.
//!
//! One thread per sink. Each cycle pops at most one chunk per source,
//! granting previously active sources a short grace period before they are
//! marked inactive, sums the active chunks into a 32-bit mix, downscales to
//! the sink's bit depth in Scream byte order, and emits 1157-byte frames
//! over UDP (and TCP when a stream is installed). An optional MP3 branch
//! encodes the same mix, gated on its consumer keeping up.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mp3lame_encoder::{Birtate, Builder as LameBuilder, Encoder as LameEncoder, FlushNoGap, InterleavedPcm};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::dsp::{AudioProcessor, AudioProcessorConfig};
use crate::settings::AudioEngineSettings;
use crate::sink::{InputBufferMetrics, SinkRateController};
use crate::source::ChunkQueue;
use crate::types::{EncodedMp3Frame, ProcessedAudioChunk, SinkMixerConfig};
use crate::utils::{sentinel, ThreadSafeQueue};
use crate::{Error, Result, SCREAM_HEADER_SIZE, SCREAM_PACKET_SIZE_BYTES, SINK_CHUNK_SIZE_BYTES, SINK_MIXING_BUFFER_SAMPLES};

/// Queue MP3 frames are pushed onto for an external consumer.
pub type Mp3Queue = ThreadSafeQueue<EncodedMp3Frame>;

struct InputState {
    queue: Arc<ChunkQueue>,
    active: bool,
    buffer: Vec<i32>,
    ready: bool,
}

struct Shared {
    inputs: Mutex<HashMap<String, InputState>>,
    tcp: Mutex<Option<TcpStream>>,
    stop_flag: AtomicBool,
}

/// One sink's mixing and emission engine.
pub struct SinkAudioMixer {
    config: SinkMixerConfig,
    settings: Arc<AudioEngineSettings>,
    shared: Arc<Shared>,
    mp3_queue: Option<Arc<Mp3Queue>>,
    rate_controller: Arc<SinkRateController>,
    scream_header: [u8; SCREAM_HEADER_SIZE],
    thread: Option<JoinHandle<()>>,
}

impl SinkAudioMixer {
    /// Creates a stopped mixer. Fails on an impossible output format.
    pub fn new(
        config: SinkMixerConfig,
        settings: Arc<AudioEngineSettings>,
        mp3_queue: Option<Arc<Mp3Queue>>,
    ) -> Result<Self> {
        if !matches!(config.output_bitdepth, 8 | 16 | 24 | 32) {
            return Err(Error::InvalidState(format!(
                "unsupported sink bit depth {}",
                config.output_bitdepth
            )));
        }
        if config.output_channels == 0 || config.output_channels > 8 {
            return Err(Error::InvalidState(format!(
                "invalid sink channel count {}",
                config.output_channels
            )));
        }
        if config.output_samplerate == 0 {
            return Err(Error::InvalidState("zero sink sample rate".into()));
        }

        let scream_header = build_scream_header(&config);
        let rate_controller = Arc::new(SinkRateController::new(
            config.sink_id.clone(),
            Arc::clone(&settings),
        ));
        info!(
            sink = %config.sink_id,
            rate = config.output_samplerate,
            depth = config.output_bitdepth,
            channels = config.output_channels,
            "initialized sink mixer"
        );

        Ok(SinkAudioMixer {
            config,
            settings,
            shared: Arc::new(Shared {
                inputs: Mutex::new(HashMap::new()),
                tcp: Mutex::new(None),
                stop_flag: AtomicBool::new(false),
            }),
            mp3_queue,
            rate_controller,
            scream_header,
            thread: None,
        })
    }

    /// Wires a source's chunk queue into this sink.
    pub fn add_input_queue(&self, instance_id: &str, queue: Arc<ChunkQueue>) {
        let mut inputs = self.shared.inputs.lock();
        inputs.insert(
            instance_id.to_string(),
            InputState {
                queue,
                active: false,
                buffer: vec![0i32; SINK_MIXING_BUFFER_SAMPLES],
                ready: false,
            },
        );
        info!(sink = %self.config.sink_id, instance = %instance_id, "added input queue");
    }

    /// Detaches a source.
    pub fn remove_input_queue(&self, instance_id: &str) {
        self.shared.inputs.lock().remove(instance_id);
        self.rate_controller.remove_source(instance_id);
        info!(sink = %self.config.sink_id, instance = %instance_id, "removed input queue");
    }

    /// Installs (or clears) the TCP emission stream.
    pub fn set_tcp_stream(&self, stream: Option<TcpStream>) {
        if let Some(stream) = &stream {
            if let Err(err) = stream.set_nonblocking(true) {
                warn!(sink = %self.config.sink_id, %err, "failed to set TCP stream non-blocking");
            }
        }
        *self.shared.tcp.lock() = stream;
    }

    /// The rate controller observing this sink's backlog.
    pub fn rate_controller(&self) -> Arc<SinkRateController> {
        Arc::clone(&self.rate_controller)
    }

    /// Binds the UDP socket and launches the mixer thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            warn!(sink = %self.config.sink_id, "mixer already running");
            return Ok(());
        }

        let destination: SocketAddr = format!("{}:{}", self.config.output_ip, self.config.output_port)
            .parse()
            .map_err(|e| Error::InvalidState(format!("bad sink destination: {e}")))?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // EF PHB: low-latency forwarding for the audio stream.
        let dscp_tos = 46 << 2;
        if let Err(err) = socket.set_tos(dscp_tos) {
            warn!(sink = %self.config.sink_id, %err, "failed to set DSCP on UDP socket");
        }
        let udp: UdpSocket = socket.into();

        let mp3_queue = if self.config.enable_mp3 {
            self.mp3_queue.clone()
        } else {
            None
        };

        self.shared.stop_flag.store(false, Ordering::SeqCst);
        let worker = Worker {
            config: self.config.clone(),
            settings: Arc::clone(&self.settings),
            shared: Arc::clone(&self.shared),
            rate_controller: Arc::clone(&self.rate_controller),
            scream_header: self.scream_header,
            udp,
            destination,
            payload: vec![0u8; SINK_CHUNK_SIZE_BYTES * 2],
            payload_write_pos: 0,
            mixing_buffer: vec![0i32; SINK_MIXING_BUFFER_SAMPLES],
            mp3_queue,
        };
        let handle = std::thread::Builder::new()
            .name(format!("sink-{}", self.config.sink_id))
            .spawn(move || worker.run())
            .map_err(std::io::Error::other)?;
        self.thread = Some(handle);
        info!(sink = %self.config.sink_id, "mixer thread started");
        Ok(())
    }

    /// Stops the mixer thread, flushing the MP3 branch.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            info!(sink = %self.config.sink_id, "stopping mixer");
            self.shared.stop_flag.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                error!(sink = %self.config.sink_id, "mixer thread panicked");
            }
        }
    }
}

impl Drop for SinkAudioMixer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds the 5-byte Scream header for a sink format.
fn build_scream_header(config: &SinkMixerConfig) -> [u8; SCREAM_HEADER_SIZE] {
    let is_44100_base = config.output_samplerate % 44100 == 0;
    let base = if is_44100_base { 44100 } else { 48000 };
    let mult = (config.output_samplerate / base).max(1) as u8;
    [
        (mult & 0x7F) | ((is_44100_base as u8) << 7),
        config.output_bitdepth as u8,
        config.output_channels as u8,
        config.output_chlayout1,
        config.output_chlayout2,
    ]
}

struct Worker {
    config: SinkMixerConfig,
    settings: Arc<AudioEngineSettings>,
    shared: Arc<Shared>,
    rate_controller: Arc<SinkRateController>,
    scream_header: [u8; SCREAM_HEADER_SIZE],
    udp: UdpSocket,
    destination: SocketAddr,
    payload: Vec<u8>,
    payload_write_pos: usize,
    mixing_buffer: Vec<i32>,
    mp3_queue: Option<Arc<Mp3Queue>>,
}

impl Worker {
    fn run(mut self) {
        info!(sink = %self.config.sink_id, "mixer loop entered");
        let grace_timeout =
            Duration::from_millis(self.settings.mixer_tuning.grace_period_timeout_ms);
        let grace_poll =
            Duration::from_millis(self.settings.mixer_tuning.grace_period_poll_interval_ms);

        // The LAME handle lives and dies on this thread.
        let mut mp3 = self.mp3_queue.take().and_then(|queue| {
            match Mp3Branch::new(&self.config, &self.settings, queue) {
                Ok(branch) => Some(branch),
                Err(err) => {
                    error!(sink = %self.config.sink_id, %err, "mp3 branch disabled");
                    None
                }
            }
        });

        while !self.shared.stop_flag.load(Ordering::SeqCst) {
            let got_data = self.collect_source_chunks(grace_timeout, grace_poll);
            if self.shared.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if !got_data {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            self.mix_cycle();
            self.publish_backlog_metrics();

            if let Some(mp3) = &mut mp3 {
                mp3.encode(&self.config, &self.mixing_buffer);
            }

            self.downscale_into_payload();
            while self.payload_write_pos >= SINK_CHUNK_SIZE_BYTES {
                self.emit_frame();
            }
        }

        if let Some(mp3) = &mut mp3 {
            mp3.flush();
        }
        info!(sink = %self.config.sink_id, "mixer loop exited");
    }

    /// Pops one chunk per source, holding a grace window for previously
    /// active sources that are momentarily empty. Returns whether any chunk
    /// arrived this cycle.
    fn collect_source_chunks(&mut self, grace_timeout: Duration, grace_poll: Duration) -> bool {
        let mut inputs = self.shared.inputs.lock();
        let mut any_ready = false;
        let mut lagging: Vec<String> = Vec::new();

        for (instance_id, input) in inputs.iter_mut() {
            input.ready = false;
            match input.queue.try_pop() {
                Some(chunk) => {
                    if self.accept_chunk(instance_id, input, chunk) {
                        any_ready = true;
                        if !input.active {
                            info!(sink = %self.config.sink_id, instance = %instance_id, "source became active");
                        }
                        input.active = true;
                    }
                }
                None => {
                    if input.active {
                        lagging.push(instance_id.clone());
                    }
                }
            }
        }

        if !lagging.is_empty() {
            let deadline = Instant::now() + grace_timeout;
            while !lagging.is_empty() && Instant::now() < deadline {
                std::thread::sleep(grace_poll);
                if self.shared.stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                lagging.retain(|instance_id| {
                    let Some(input) = inputs.get_mut(instance_id) else {
                        return false;
                    };
                    match input.queue.try_pop() {
                        Some(chunk) => {
                            if self.accept_chunk(instance_id, input, chunk) {
                                any_ready = true;
                            }
                            false
                        }
                        None => true,
                    }
                });
            }
            for instance_id in lagging {
                if let Some(input) = inputs.get_mut(&instance_id) {
                    info!(sink = %self.config.sink_id, instance = %instance_id, "source timed out grace period, marking inactive");
                    input.active = false;
                }
            }
        }

        any_ready
    }

    fn accept_chunk(&self, instance_id: &str, input: &mut InputState, chunk: ProcessedAudioChunk) -> bool {
        if chunk.audio_data.len() != SINK_MIXING_BUFFER_SAMPLES {
            error!(
                sink = %self.config.sink_id,
                instance = %instance_id,
                samples = chunk.audio_data.len(),
                "discarding chunk with unexpected sample count"
            );
            return false;
        }
        sentinel::log_chunk_sentinel("sink_mixer", &chunk);
        input.buffer.copy_from_slice(&chunk.audio_data);
        input.ready = true;
        true
    }

    /// Sums this cycle's ready chunks into the mixing buffer with
    /// saturation.
    fn mix_cycle(&mut self) {
        self.mixing_buffer.fill(0);
        let inputs = self.shared.inputs.lock();
        let mut active_sources = 0usize;
        for input in inputs.values() {
            if !input.active || !input.ready {
                continue;
            }
            active_sources += 1;
            for (slot, &sample) in self.mixing_buffer.iter_mut().zip(input.buffer.iter()) {
                let sum = *slot as i64 + sample as i64;
                *slot = sum.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            }
        }
        debug!(sink = %self.config.sink_id, active_sources, "mixed cycle");
    }

    /// Samples per-source backlog for the rate controller.
    fn publish_backlog_metrics(&self) {
        let frames_per_chunk =
            SINK_MIXING_BUFFER_SAMPLES as f64 / self.config.output_channels as f64;
        let block_ms = frames_per_chunk * 1000.0 / self.config.output_samplerate as f64;

        let inputs = self.shared.inputs.lock();
        let mut metrics = InputBufferMetrics {
            block_duration_ms: block_ms,
            valid: true,
            ..Default::default()
        };
        for (instance_id, input) in inputs.iter() {
            if !input.active {
                continue;
            }
            let blocks = input.queue.len();
            let ms = blocks as f64 * block_ms;
            metrics.queued_blocks += blocks;
            metrics.total_ms += ms;
            metrics.max_per_source_ms = metrics.max_per_source_ms.max(ms);
            metrics.active_sources += 1;
            metrics.per_source_ms.insert(instance_id.clone(), ms);
        }
        drop(inputs);
        if metrics.active_sources > 0 {
            metrics.avg_per_source_ms = metrics.total_ms / metrics.active_sources as f64;
            self.rate_controller.update_drain_ratio(&metrics);
        }
    }

    /// Downscales the 32-bit mix to the sink bit depth, appending to the
    /// payload accumulator in the Scream wire byte order (the top bytes of
    /// each sample, least significant first).
    fn downscale_into_payload(&mut self) {
        let byte_depth = self.config.output_bitdepth as usize / 8;
        let needed = self.mixing_buffer.len() * byte_depth;
        if self.payload_write_pos + needed > self.payload.len() {
            error!(
                sink = %self.config.sink_id,
                write_pos = self.payload_write_pos,
                needed,
                "payload accumulator overflow, dropping cycle"
            );
            return;
        }

        let mut pos = self.payload_write_pos;
        for &sample in &self.mixing_buffer {
            match self.config.output_bitdepth {
                8 => {
                    // 8-bit Scream samples are unsigned.
                    self.payload[pos] = (((sample >> 24) & 0xFF) as u8) ^ 0x80;
                    pos += 1;
                }
                16 => {
                    self.payload[pos] = ((sample >> 16) & 0xFF) as u8;
                    self.payload[pos + 1] = ((sample >> 24) & 0xFF) as u8;
                    pos += 2;
                }
                24 => {
                    self.payload[pos] = ((sample >> 8) & 0xFF) as u8;
                    self.payload[pos + 1] = ((sample >> 16) & 0xFF) as u8;
                    self.payload[pos + 2] = ((sample >> 24) & 0xFF) as u8;
                    pos += 3;
                }
                _ => {
                    self.payload[pos] = (sample & 0xFF) as u8;
                    self.payload[pos + 1] = ((sample >> 8) & 0xFF) as u8;
                    self.payload[pos + 2] = ((sample >> 16) & 0xFF) as u8;
                    self.payload[pos + 3] = ((sample >> 24) & 0xFF) as u8;
                    pos += 4;
                }
            }
        }
        self.payload_write_pos = pos;
    }

    /// Sends one 1157-byte Scream frame and shifts the accumulator.
    fn emit_frame(&mut self) {
        let mut frame = [0u8; SCREAM_PACKET_SIZE_BYTES];
        frame[..SCREAM_HEADER_SIZE].copy_from_slice(&self.scream_header);
        frame[SCREAM_HEADER_SIZE..].copy_from_slice(&self.payload[..SINK_CHUNK_SIZE_BYTES]);

        if let Err(err) = self.udp.send_to(&frame, self.destination) {
            error!(sink = %self.config.sink_id, %err, "UDP send failed");
        }

        let mut tcp_guard = self.shared.tcp.lock();
        if let Some(stream) = tcp_guard.as_mut() {
            use std::io::Write;
            match stream.write(&frame) {
                Ok(n) if n != frame.len() => {
                    warn!(sink = %self.config.sink_id, sent = n, "partial TCP write, frame dropped");
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    // Receiver is slow; drop the TCP copy only.
                    debug!(sink = %self.config.sink_id, "TCP would block, dropping frame copy");
                }
                Err(err) => {
                    error!(sink = %self.config.sink_id, %err, "TCP send failed, marking stream dead");
                    *tcp_guard = None;
                }
            }
        }
        drop(tcp_guard);

        // Shift any residue to the front of the accumulator.
        let remaining = self.payload_write_pos - SINK_CHUNK_SIZE_BYTES;
        self.payload.copy_within(
            SINK_CHUNK_SIZE_BYTES..SINK_CHUNK_SIZE_BYTES + remaining,
            0,
        );
        self.payload_write_pos = remaining;
    }
}

/// The gated MP3 side channel.
struct Mp3Branch {
    queue: Arc<Mp3Queue>,
    encoder: LameEncoder,
    preprocessor: AudioProcessor,
    encode_buffer: Vec<MaybeUninit<u8>>,
    active: bool,
    max_queue: usize,
}

impl Mp3Branch {
    fn new(
        config: &SinkMixerConfig,
        settings: &Arc<AudioEngineSettings>,
        queue: Arc<Mp3Queue>,
    ) -> Result<Self> {
        let mut builder =
            LameBuilder::new().ok_or_else(|| Error::Mp3Encoder("lame init failed".into()))?;
        builder
            .set_num_channels(2)
            .map_err(|e| Error::Mp3Encoder(format!("channels: {e:?}")))?;
        builder
            .set_sample_rate(config.output_samplerate)
            .map_err(|e| Error::Mp3Encoder(format!("sample rate: {e:?}")))?;
        builder
            .set_brate(bitrate_setting(settings.mixer_tuning.mp3_bitrate_kbps))
            .map_err(|e| Error::Mp3Encoder(format!("bitrate: {e:?}")))?;
        builder
            .set_quality(mp3lame_encoder::Quality::Best)
            .map_err(|e| Error::Mp3Encoder(format!("quality: {e:?}")))?;
        let encoder = builder
            .build()
            .map_err(|e| Error::Mp3Encoder(format!("build: {e:?}")))?;

        // The mix is at the sink's channel count; LAME wants stereo.
        let preprocessor = AudioProcessor::new(
            AudioProcessorConfig {
                input_channels: config.output_channels,
                output_channels: 2,
                input_bit_depth: 32,
                input_sample_rate: config.output_samplerate,
                output_sample_rate: config.output_samplerate,
                volume: 1.0,
            },
            settings.processor_tuning.clone(),
        )?;

        Ok(Mp3Branch {
            queue,
            encoder,
            preprocessor,
            encode_buffer: Vec::new(),
            active: true,
            max_queue: settings.mixer_tuning.mp3_output_queue_max_size,
        })
    }

    fn encode(&mut self, config: &SinkMixerConfig, mix: &[i32]) {
        // Gate on the consumer: a backed-up queue means nobody is reading.
        if self.queue.len() > self.max_queue {
            if self.active {
                info!(sink = %config.sink_id, "mp3 queue full, pausing encoding");
                self.active = false;
            }
            return;
        }
        if !self.active {
            info!(sink = %config.sink_id, "mp3 queue drained, resuming encoding");
            self.active = true;
        }

        let bytes: Vec<u8> = mix.iter().flat_map(|s| s.to_le_bytes()).collect();
        let stereo = match self.preprocessor.process(&bytes, 1.0) {
            Ok(samples) => samples,
            Err(err) => {
                error!(sink = %config.sink_id, %err, "mp3 preprocessing failed");
                return;
            }
        };
        if stereo.is_empty() {
            return;
        }
        let pcm: Vec<i16> = stereo.iter().map(|&s| (s >> 16) as i16).collect();

        let needed = pcm.len() * 5 / 4 + 7200;
        if self.encode_buffer.len() < needed {
            self.encode_buffer.resize(needed, MaybeUninit::uninit());
        }
        match self.encoder.encode(InterleavedPcm(&pcm), &mut self.encode_buffer) {
            Ok(written) if written > 0 => {
                let data = unsafe {
                    std::slice::from_raw_parts(self.encode_buffer.as_ptr() as *const u8, written)
                }
                .to_vec();
                self.queue.push(EncodedMp3Frame { data });
            }
            Ok(_) => {}
            Err(err) => error!(sink = %config.sink_id, ?err, "mp3 encoding failed"),
        }
    }

    fn flush(&mut self) {
        if self.encode_buffer.len() < 7200 {
            self.encode_buffer.resize(7200, MaybeUninit::uninit());
        }
        match self.encoder.flush::<FlushNoGap>(&mut self.encode_buffer) {
            Ok(written) if written > 0 => {
                let data = unsafe {
                    std::slice::from_raw_parts(self.encode_buffer.as_ptr() as *const u8, written)
                }
                .to_vec();
                self.queue.push(EncodedMp3Frame { data });
                info!(flushed = written, "flushed mp3 encoder");
            }
            Ok(_) => {}
            Err(err) => error!(?err, "mp3 flush failed"),
        }
    }
}

fn bitrate_setting(kbps: u32) -> Birtate {
    match kbps {
        0..=64 => Birtate::Kbps64,
        65..=96 => Birtate::Kbps96,
        97..=128 => Birtate::Kbps128,
        129..=160 => Birtate::Kbps160,
        161..=192 => Birtate::Kbps192,
        193..=224 => Birtate::Kbps224,
        225..=256 => Birtate::Kbps256,
        _ => Birtate::Kbps320,
    }
}
