//! End-to-end pipeline test: packets in, Scream frames out.
//!
//! Wires a timeshift manager, a source processor and a sink mixer together
//! the way the engine runs in production, injects PCM packets, and verifies
//! Scream-framed UDP output at a local socket.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use screamrouter_media_core::settings::AudioEngineSettings;
use screamrouter_media_core::sink::SinkAudioMixer;
use screamrouter_media_core::source::{CommandQueue, SourceInputProcessor};
use screamrouter_media_core::timeshift::{PacketQueue, TimeshiftManager};
use screamrouter_media_core::types::{
    ControlCommand, SinkMixerConfig, SourceProcessorConfig, TaggedAudioPacket,
};
use screamrouter_media_core::{SCREAM_PACKET_SIZE_BYTES, SINK_CHUNK_SIZE_BYTES};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One packet of 288 stereo frames carrying a 1 kHz sine, phase-continuous
/// across packets (the DSP chain may engage for catch-up playback rates and
/// needs a real signal).
fn sine_packet(tag: &str, rtp_ts: u32, received: Instant, amplitude: f32) -> TaggedAudioPacket {
    let mut audio_data = Vec::with_capacity(SINK_CHUNK_SIZE_BYTES);
    for frame in 0..SINK_CHUNK_SIZE_BYTES / 4 {
        let t = (rtp_ts as usize + frame) as f32 / 48000.0;
        let value = ((t * 1000.0 * std::f32::consts::TAU).sin() * amplitude) as i16;
        audio_data.extend_from_slice(&value.to_le_bytes()); // left
        audio_data.extend_from_slice(&value.to_le_bytes()); // right
    }
    TaggedAudioPacket {
        source_tag: tag.into(),
        received_time: received,
        rtp_timestamp: Some(rtp_ts),
        sample_rate: 48000,
        channels: 2,
        bit_depth: 16,
        chlayout1: 0x03,
        chlayout2: 0x00,
        audio_data,
        ..Default::default()
    }
}

#[test]
fn packets_reach_the_wire_as_scream_frames() {
    init_tracing();
    // Receiver socket stands in for a Scream sink on the network.
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let sink_port = receiver.local_addr().unwrap().port();

    let settings = Arc::new(AudioEngineSettings::default());

    let mut timeshift = TimeshiftManager::new(Arc::clone(&settings));
    timeshift.start().unwrap();

    let source_config = SourceProcessorConfig {
        instance_id: "inst-e2e".into(),
        source_tag: "e2e-source".into(),
        output_channels: 2,
        output_samplerate: 48000,
        ..Default::default()
    };
    let mut source = SourceInputProcessor::new(
        source_config,
        Arc::new(PacketQueue::new()),
        Arc::new(screamrouter_media_core::source::ChunkQueue::new()),
        Arc::new(CommandQueue::new()),
        Arc::clone(&settings),
    );

    timeshift.register_processor("inst-e2e", "e2e-source", source.input_queue(), 0, 0.0);
    source.start().unwrap();

    let mixer_config = SinkMixerConfig {
        sink_id: "sink-e2e".into(),
        output_ip: "127.0.0.1".into(),
        output_port: sink_port,
        output_bitdepth: 16,
        output_samplerate: 48000,
        output_channels: 2,
        output_chlayout1: 0x03,
        output_chlayout2: 0x00,
        enable_mp3: false,
    };
    let mut mixer = SinkAudioMixer::new(mixer_config, Arc::clone(&settings), None).unwrap();
    mixer.add_input_queue("inst-e2e", source.output_queue());
    mixer.start().unwrap();

    // Inject packets received slightly in the past so they are due without
    // building an unmanageable backlog.
    let base = Instant::now() - Duration::from_millis(200);
    for i in 0..30u32 {
        timeshift.add_packet(sine_packet(
            "e2e-source",
            i * 288,
            base + Duration::from_millis(i as u64 * 6),
            16000.0,
        ));
    }

    let mut frame = [0u8; 4096];
    let (len, _) = receiver.recv_from(&mut frame).expect("scream frame arrives");
    assert_eq!(len, SCREAM_PACKET_SIZE_BYTES);
    // Header: 48 kHz, 16-bit, stereo, standard mask.
    assert_eq!(&frame[..5], &[0x01, 0x10, 0x02, 0x03, 0x00]);
    // Payload carries the sine at roughly its injected level.
    let mut max_abs = 0i32;
    for pair in frame[5..len].chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as i32;
        max_abs = max_abs.max(sample.abs());
    }
    assert!(
        (2000..=24000).contains(&max_abs),
        "unexpected payload peak {max_abs}"
    );

    mixer.stop();
    source.stop();
    timeshift.stop();
}

#[test]
fn volume_command_shapes_the_wire_output() {
    init_tracing();
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let sink_port = receiver.local_addr().unwrap().port();

    let settings = Arc::new(AudioEngineSettings::default());
    let mut timeshift = TimeshiftManager::new(Arc::clone(&settings));
    timeshift.start().unwrap();

    let command_queue = Arc::new(CommandQueue::new());
    let source_config = SourceProcessorConfig {
        instance_id: "inst-vol".into(),
        source_tag: "vol-source".into(),
        output_channels: 2,
        output_samplerate: 48000,
        ..Default::default()
    };
    let mut source = SourceInputProcessor::new(
        source_config,
        Arc::new(PacketQueue::new()),
        Arc::new(screamrouter_media_core::source::ChunkQueue::new()),
        Arc::clone(&command_queue),
        Arc::clone(&settings),
    );
    timeshift.register_processor("inst-vol", "vol-source", source.input_queue(), 0, 0.0);
    source.start().unwrap();

    let mixer_config = SinkMixerConfig {
        sink_id: "sink-vol".into(),
        output_ip: "127.0.0.1".into(),
        output_port: sink_port,
        output_bitdepth: 16,
        output_samplerate: 48000,
        output_channels: 2,
        output_chlayout1: 0x03,
        output_chlayout2: 0x00,
        enable_mp3: false,
    };
    let mut mixer = SinkAudioMixer::new(mixer_config, Arc::clone(&settings), None).unwrap();
    mixer.add_input_queue("inst-vol", source.output_queue());
    mixer.start().unwrap();

    // Mute the source, then stream a loud constant.
    command_queue.push(ControlCommand::SetVolume(0.0));
    std::thread::sleep(Duration::from_millis(100));

    let base = Instant::now() - Duration::from_millis(200);
    for i in 0..40u32 {
        timeshift.add_packet(sine_packet(
            "vol-source",
            i * 288,
            base + Duration::from_millis(i as u64 * 6),
            16000.0,
        ));
    }

    let mut frame = [0u8; 4096];
    let (len, _) = receiver.recv_from(&mut frame).expect("scream frame arrives");
    assert_eq!(len, SCREAM_PACKET_SIZE_BYTES);
    // With the source muted, the payload is (near) digital silence; allow a
    // little dither noise.
    let mut max_abs = 0i32;
    for pair in frame[5..len].chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as i32;
        max_abs = max_abs.max(sample.abs());
    }
    assert!(max_abs < 256, "muted output peaked at {max_abs}");

    mixer.stop();
    source.stop();
    timeshift.stop();
}
