//! The per-source DSP chain.
//!
//! Fixed-point intermediate format is signed 32-bit. One call processes one
//! packet's worth of interleaved frames through:
//!
//! scale → volume (+soft clip) → upsample → split → speaker mix (+soft clip)
//! → DC removal → EQ → merge → downsample → noise-shaped dither
//!
//! Construction is all-or-nothing: if a resampler or filter cannot be built
//! the constructor fails and the caller retries on the next packet. When the
//! chain detects that nothing would change the audio it short-circuits to a
//! straight bit-depth conversion.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use samplerate::{ConverterType, Samplerate};
use tracing::{debug, warn};

use crate::settings::ProcessorTuning;
use crate::{Error, Result, EQ_BANDS, MAX_CHANNELS};

use super::speaker_mix::default_speaker_mix;

/// ISO 1/3-octave centers for the 18 peaking bands.
const EQ_FREQUENCIES: [f32; EQ_BANDS] = [
    65.406_39,
    92.498_604,
    130.812_78,
    184.997_21,
    261.625_57,
    369.994_42,
    523.251_1,
    739.988_4,
    1046.502_3,
    1479.976_8,
    2093.004_5,
    2959.953_6,
    4186.009,
    5919.907,
    8372.018,
    11839.814,
    16744.036,
    20000.0,
];

const I32_SCALE: f64 = 2147483648.0; // 2^31
const I32_MAX_F: f32 = 2147483647.0;

/// Static format configuration for one processor instance.
#[derive(Debug, Clone)]
pub struct AudioProcessorConfig {
    /// Input channel count.
    pub input_channels: u16,
    /// Output channel count.
    pub output_channels: u16,
    /// Input bit depth.
    pub input_bit_depth: u16,
    /// Input sample rate.
    pub input_sample_rate: u32,
    /// Output sample rate.
    pub output_sample_rate: u32,
    /// Initial gain.
    pub volume: f32,
}

type MixMatrix = [[f32; MAX_CHANNELS]; MAX_CHANNELS];

/// Converter state wrapper. libsamplerate state is plain heap data with no
/// thread affinity; only one thread ever drives a processor at a time.
struct Converter(Samplerate);

unsafe impl Send for Converter {}

impl Converter {
    fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self> {
        Ok(Converter(Samplerate::new(
            ConverterType::SincBestQuality,
            from_rate,
            to_rate,
            channels,
        )?))
    }
}

/// The DSP chain for one source.
pub struct AudioProcessor {
    config: AudioProcessorConfig,
    tuning: ProcessorTuning,
    volume: f32,
    eq: [f32; EQ_BANDS],
    speaker_mix: MixMatrix,
    auto_speaker_mix: bool,

    upsampler: Converter,
    downsampler: Converter,
    // Quantized rate the upsampler is currently configured for.
    upsampler_from_rate: u32,

    eq_filters: Vec<Vec<DirectForm2Transposed<f32>>>,
    dc_filters: Vec<DirectForm2Transposed<f32>>,

    dither_rng: SmallRng,
    dither_error: f32,

    passthrough_cache: Option<bool>,
}

impl AudioProcessor {
    /// Builds the full chain, failing without side effects if any stage
    /// cannot be constructed.
    pub fn new(config: AudioProcessorConfig, tuning: ProcessorTuning) -> Result<Self> {
        if config.input_channels == 0 || config.input_channels as usize > MAX_CHANNELS {
            return Err(Error::ProcessorConstruction(format!(
                "input channels {} out of range",
                config.input_channels
            )));
        }
        if config.output_channels == 0 || config.output_channels as usize > MAX_CHANNELS {
            return Err(Error::ProcessorConstruction(format!(
                "output channels {} out of range",
                config.output_channels
            )));
        }
        if !matches!(config.input_bit_depth, 8 | 16 | 24 | 32) {
            return Err(Error::ProcessorConstruction(format!(
                "bit depth {} unsupported",
                config.input_bit_depth
            )));
        }
        if config.input_sample_rate == 0 || config.output_sample_rate == 0 {
            return Err(Error::ProcessorConstruction("zero sample rate".into()));
        }
        let oversample = tuning.oversampling_factor.max(1);

        let upsampler = Converter::new(
            config.input_sample_rate,
            config.output_sample_rate * oversample,
            config.input_channels as usize,
        )?;
        let downsampler = Converter::new(
            config.output_sample_rate * oversample,
            config.output_sample_rate,
            config.output_channels as usize,
        )?;

        let filter_rate = (config.output_sample_rate * oversample) as f32;
        let eq = [1.0f32; EQ_BANDS];
        let eq_filters = build_eq_filters(&eq, config.output_channels, filter_rate)?;
        let dc_filters = build_dc_filters(
            config.output_channels,
            filter_rate,
            tuning.dc_filter_cutoff_hz,
        )?;

        let speaker_mix = default_speaker_mix(config.input_channels, config.output_channels);
        let upsampler_from_rate = config.input_sample_rate;

        Ok(AudioProcessor {
            volume: config.volume,
            config,
            tuning,
            eq,
            speaker_mix,
            auto_speaker_mix: true,
            upsampler,
            downsampler,
            upsampler_from_rate,
            eq_filters,
            dc_filters,
            dither_rng: SmallRng::from_entropy(),
            dither_error: 0.0,
            passthrough_cache: None,
        })
    }

    /// Sets the gain applied in the volume stage.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        self.passthrough_cache = None;
    }

    /// Replaces the EQ curve and rebuilds the band filters.
    pub fn set_equalizer(&mut self, eq: &[f32; EQ_BANDS]) {
        let oversample = self.tuning.oversampling_factor.max(1);
        let filter_rate = (self.config.output_sample_rate * oversample) as f32;
        match build_eq_filters(eq, self.config.output_channels, filter_rate) {
            Ok(filters) => {
                self.eq = *eq;
                self.eq_filters = filters;
                self.passthrough_cache = None;
            }
            Err(err) => warn!(%err, "keeping previous EQ, rebuild failed"),
        }
    }

    /// Installs an explicit speaker mix matrix.
    pub fn set_speaker_mix_matrix(&mut self, matrix: &MixMatrix) {
        self.speaker_mix = *matrix;
        self.auto_speaker_mix = false;
        self.passthrough_cache = None;
    }

    /// Restores the built-in matrix for the configured channel pair.
    pub fn use_auto_speaker_mix(&mut self) {
        self.speaker_mix =
            default_speaker_mix(self.config.input_channels, self.config.output_channels);
        self.auto_speaker_mix = true;
        self.passthrough_cache = None;
    }

    /// Current input format triple `(channels, sample_rate, bit_depth)`.
    pub fn input_format(&self) -> (u16, u32, u16) {
        (
            self.config.input_channels,
            self.config.input_sample_rate,
            self.config.input_bit_depth,
        )
    }

    /// Runs the chain over one packet of interleaved frames.
    ///
    /// `input` must hold a whole number of frames. `playback_rate` scales
    /// the effective input rate for this packet only (scheduler catch-up).
    /// Returns interleaved 32-bit samples at the output rate and channel
    /// count.
    pub fn process(&mut self, input: &[u8], playback_rate: f64) -> Result<Vec<i32>> {
        let bytes_per_sample = self.config.input_bit_depth as usize / 8;
        let frame_bytes = bytes_per_sample * self.config.input_channels as usize;
        if frame_bytes == 0 || input.len() % frame_bytes != 0 {
            return Err(Error::MalformedInput(format!(
                "payload of {} bytes is not whole {}-byte frames",
                input.len(),
                frame_bytes
            )));
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }

        // 1. Scale to the 32-bit intermediate (MSB-aligned).
        let mut samples = scale_to_i32(input, self.config.input_bit_depth);

        if !self.processing_required(playback_rate) {
            // Straight bit-depth conversion.
            return Ok(samples);
        }

        // 2. Volume with soft clip on every sample.
        let threshold = self.tuning.soft_clip_threshold;
        let knee = self.tuning.soft_clip_knee;
        if self.volume != 1.0 {
            for sample in &mut samples {
                let mut value = (*sample as f64 / I32_SCALE) as f32;
                value *= self.volume;
                value = soft_clip(value, threshold, knee);
                *sample = (value * I32_MAX_F) as i32;
            }
        }

        // 3. Upsample to the oversampled output rate.
        let oversample = self.tuning.oversampling_factor.max(1);
        let oversampled_rate = self.config.output_sample_rate * oversample;
        let effective_input_rate = quantize_rate(self.config.input_sample_rate, playback_rate);
        let upsampled = if effective_input_rate == oversampled_rate {
            samples
        } else {
            if effective_input_rate != self.upsampler_from_rate {
                self.upsampler = Converter::new(
                    effective_input_rate,
                    oversampled_rate,
                    self.config.input_channels as usize,
                )?;
                self.upsampler_from_rate = effective_input_rate;
            }
            resample_i32(&self.upsampler, &samples)?
        };

        // 4. Split interleaved samples into per-channel lanes.
        let in_channels = self.config.input_channels as usize;
        let out_channels = self.config.output_channels as usize;
        let frames = upsampled.len() / in_channels;
        let mut channel_lanes: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); in_channels];
        for (i, sample) in upsampled.iter().enumerate() {
            channel_lanes[i % in_channels].push((*sample as f64 / I32_SCALE) as f32);
        }

        // 5. Speaker mix into the output channel lanes, soft-clipped.
        let mut mixed_lanes: Vec<Vec<f32>> = vec![vec![0.0; frames]; out_channels];
        for (out_ch, lane) in mixed_lanes.iter_mut().enumerate() {
            for (frame, slot) in lane.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (in_ch, input_lane) in channel_lanes.iter().enumerate() {
                    acc += input_lane[frame] * self.speaker_mix[in_ch][out_ch];
                }
                *slot = soft_clip(acc, threshold, knee);
            }
        }

        // 6. DC removal per output channel.
        for (out_ch, lane) in mixed_lanes.iter_mut().enumerate() {
            let filter = &mut self.dc_filters[out_ch];
            for sample in lane.iter_mut() {
                *sample = filter.run(*sample);
            }
        }

        // 7. Equalizer: only bands whose gain differs from unity run.
        let active_bands: Vec<usize> = (0..EQ_BANDS).filter(|&b| self.eq[b] != 1.0).collect();
        if !active_bands.is_empty() {
            for (out_ch, lane) in mixed_lanes.iter_mut().enumerate() {
                for &band in &active_bands {
                    let filter = &mut self.eq_filters[out_ch][band];
                    for sample in lane.iter_mut() {
                        *sample = filter.run(*sample);
                    }
                }
                for sample in lane.iter_mut() {
                    *sample = soft_clip(*sample, threshold, knee);
                }
            }
        }

        // 8. Merge back to interleaved 32-bit.
        let mut merged = vec![0i32; frames * out_channels];
        for (out_ch, lane) in mixed_lanes.iter().enumerate() {
            for (frame, sample) in lane.iter().enumerate() {
                merged[frame * out_channels + out_ch] = (sample * I32_MAX_F) as i32;
            }
        }

        // 9. Downsample from the oversampled rate to the output rate.
        let mut output = if oversample == 1 {
            merged
        } else {
            resample_i32(&self.downsampler, &merged)?
        };

        // 10. Noise-shaped dither sized to the input quantization step.
        self.apply_dither(&mut output);

        Ok(output)
    }

    /// True when any stage would alter the audio.
    fn processing_required(&mut self, playback_rate: f64) -> bool {
        if playback_rate != 1.0 {
            return true;
        }
        if let Some(cached) = self.passthrough_cache {
            return cached;
        }
        let required = self.processing_required_check();
        self.passthrough_cache = Some(required);
        required
    }

    fn processing_required_check(&self) -> bool {
        if self.config.input_sample_rate != self.config.output_sample_rate {
            return true;
        }
        if self.volume != 1.0 {
            return true;
        }
        if self.config.input_channels != self.config.output_channels {
            return true;
        }
        for i in 0..self.config.input_channels as usize {
            for o in 0..self.config.output_channels as usize {
                let expected = if i == o { 1.0 } else { 0.0 };
                if self.speaker_mix[i][o] != expected {
                    return true;
                }
            }
        }
        self.eq.iter().any(|&g| g != 1.0)
    }

    fn apply_dither(&mut self, samples: &mut [i32]) {
        let amplitude = 1.0f32 / (1u64 << (self.config.input_bit_depth - 1)) as f32;
        let shaping = self.tuning.dither_noise_shaping_factor;
        for sample in samples {
            let mut value = (*sample as f64 / I32_SCALE) as f32;
            value += self.dither_error * shaping;
            // Triangular PDF: difference of two uniform draws.
            let dither: f32 = (self.dither_rng.gen::<f32>() - self.dither_rng.gen::<f32>()) * amplitude;
            value += dither;
            value = value.clamp(-1.0, 1.0);
            let quantized = (value * I32_MAX_F) as i32;
            self.dither_error = value - quantized as f32 / I32_MAX_F;
            *sample = quantized;
        }
    }
}

/// Widens packed samples to MSB-aligned 32-bit.
fn scale_to_i32(input: &[u8], bit_depth: u16) -> Vec<i32> {
    match bit_depth {
        8 => input
            .iter()
            // 8-bit PCM is unsigned, centered at 128.
            .map(|&b| ((b as i32 - 128) << 24))
            .collect(),
        16 => input
            .chunks_exact(2)
            .map(|c| (i16::from_le_bytes([c[0], c[1]]) as i32) << 16)
            .collect(),
        24 => input
            .chunks_exact(3)
            .map(|c| {
                let raw = c[0] as i32 | (c[1] as i32) << 8 | (c[2] as i32) << 16;
                ((raw << 8) >> 8) << 8
            })
            .collect(),
        32 => input
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        _ => Vec::new(),
    }
}

/// Identity below the knee, smoothstep blend into a rational saturator
/// inside it, pure saturation above.
fn soft_clip(sample: f32, threshold: f32, knee: f32) -> f32 {
    let knee_start = threshold - knee / 2.0;
    let knee_end = threshold + knee / 2.0;
    let magnitude = sample.abs();
    if magnitude <= knee_start {
        return sample;
    }
    let sign = if sample > 0.0 { 1.0 } else { -1.0 };
    let over = magnitude - knee_start;
    let saturated = sign * (knee_start + over / (1.0 + (over / (knee_end - knee_start)).powi(2)));
    if magnitude >= knee_end {
        saturated
    } else {
        let t = over / knee;
        let smooth_t = t * t * (3.0 - 2.0 * t);
        sample * (1.0 - smooth_t) + saturated * smooth_t
    }
}

fn resample_i32(converter: &Converter, samples: &[i32]) -> Result<Vec<i32>> {
    let floats: Vec<f32> = samples
        .iter()
        .map(|&s| (s as f64 / I32_SCALE) as f32)
        .collect();
    let resampled = converter.0.process(&floats)?;
    Ok(resampled
        .iter()
        .map(|&f| (f.clamp(-1.0, 1.0) * I32_MAX_F) as i32)
        .collect())
}

/// Quantizes `rate * playback_rate` to whole hertz so converter rebuilds
/// only happen on meaningful ratio changes.
fn quantize_rate(rate: u32, playback_rate: f64) -> u32 {
    ((rate as f64 * playback_rate).round() as u32).max(1)
}

fn build_eq_filters(
    eq: &[f32; EQ_BANDS],
    channels: u16,
    sample_rate: f32,
) -> Result<Vec<Vec<DirectForm2Transposed<f32>>>> {
    if sample_rate <= 0.0 {
        return Err(Error::ProcessorConstruction(
            "invalid sample rate for EQ filters".into(),
        ));
    }
    let mut per_channel = Vec::with_capacity(channels as usize);
    for _ in 0..channels {
        let mut bands = Vec::with_capacity(EQ_BANDS);
        for (band, &center) in EQ_FREQUENCIES.iter().enumerate() {
            let gain_db = 10.0 * (eq[band] - 1.0);
            let f0 = center.min(sample_rate * 0.499);
            let coeffs = Coefficients::<f32>::from_params(
                Type::PeakingEQ(gain_db),
                sample_rate.hz(),
                f0.hz(),
                1.0,
            )
            .map_err(|e| Error::ProcessorConstruction(format!("EQ band {band}: {e:?}")))?;
            bands.push(DirectForm2Transposed::<f32>::new(coeffs));
        }
        per_channel.push(bands);
    }
    Ok(per_channel)
}

fn build_dc_filters(
    channels: u16,
    sample_rate: f32,
    cutoff_hz: f32,
) -> Result<Vec<DirectForm2Transposed<f32>>> {
    if sample_rate <= 0.0 {
        return Err(Error::ProcessorConstruction(
            "invalid sample rate for DC filters".into(),
        ));
    }
    let f0 = cutoff_hz.min(sample_rate * 0.499);
    let mut filters = Vec::with_capacity(channels as usize);
    for _ in 0..channels {
        let coeffs = Coefficients::<f32>::from_params(
            Type::HighPass,
            sample_rate.hz(),
            f0.hz(),
            std::f32::consts::FRAC_1_SQRT_2,
        )
        .map_err(|e| Error::ProcessorConstruction(format!("DC filter: {e:?}")))?;
        filters.push(DirectForm2Transposed::<f32>::new(coeffs));
    }
    debug!(channels, cutoff_hz, "built DC removal filters");
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(input_rate: u32, output_rate: u32, in_ch: u16, out_ch: u16) -> AudioProcessorConfig {
        AudioProcessorConfig {
            input_channels: in_ch,
            output_channels: out_ch,
            input_bit_depth: 16,
            input_sample_rate: input_rate,
            output_sample_rate: output_rate,
            volume: 1.0,
        }
    }

    fn tuning() -> ProcessorTuning {
        ProcessorTuning::default()
    }

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn passthrough_is_bit_exact() {
        let mut proc = AudioProcessor::new(config(48000, 48000, 2, 2), tuning()).unwrap();
        let input: Vec<i16> = vec![100, -200, 300, -400, 0, 32000];
        let output = proc.process(&pcm16(&input), 1.0).unwrap();
        let expected: Vec<i32> = input.iter().map(|&s| (s as i32) << 16).collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn rejects_partial_frames() {
        let mut proc = AudioProcessor::new(config(48000, 48000, 2, 2), tuning()).unwrap();
        assert!(proc.process(&[0u8; 3], 1.0).is_err());
    }

    fn sine16(amplitude: f32, freq_hz: f32, rate: f32, frames: usize, channels: usize) -> Vec<i16> {
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let value =
                ((i as f32 * freq_hz / rate * std::f32::consts::TAU).sin() * amplitude) as i16;
            for _ in 0..channels {
                out.push(value);
            }
        }
        out
    }

    #[test]
    fn volume_scales_output() {
        let mut proc = AudioProcessor::new(config(48000, 48000, 1, 1), tuning()).unwrap();
        proc.set_volume(0.5);
        // 100 ms of 1 kHz sine so resampler latency and filter transients
        // wash out of the RMS.
        let samples = sine16(16000.0, 1000.0, 48000.0, 4800, 1);
        let output = proc.process(&pcm16(&samples), 1.0).unwrap();
        assert!(!output.is_empty());
        let input_rms = rms(&samples.iter().map(|&s| (s as i32) << 16).collect::<Vec<_>>());
        let output_rms = rms(&output);
        let ratio = output_rms / input_rms;
        assert!((0.4..0.6).contains(&ratio), "gain ratio {ratio}");
    }

    #[test]
    fn stereo_to_mono_downmix_averages() {
        let mut proc = AudioProcessor::new(config(48000, 48000, 2, 1), tuning()).unwrap();
        // Identical sine on both channels: the 0.5/0.5 fold reproduces it.
        let samples = sine16(12000.0, 1000.0, 48000.0, 4800, 2);
        let output = proc.process(&pcm16(&samples), 1.0).unwrap();
        assert!(!output.is_empty());
        let mono_rms = rms(&samples
            .iter()
            .step_by(2)
            .map(|&s| (s as i32) << 16)
            .collect::<Vec<_>>());
        let output_rms = rms(&output);
        let ratio = output_rms / mono_rms;
        assert!((0.8..1.2).contains(&ratio), "fold ratio {ratio}");
    }

    #[test]
    fn upsampling_changes_sample_count() {
        let mut proc = AudioProcessor::new(config(44100, 48000, 1, 1), tuning()).unwrap();
        // 100 ms at 44.1 kHz in, about 100 ms at 48 kHz out; the sinc
        // converter holds back priming frames on the first call.
        let samples = sine16(1000.0, 440.0, 44100.0, 4410, 1);
        let output = proc.process(&pcm16(&samples), 1.0).unwrap();
        assert!(output.len() <= 4800 + 32, "len {}", output.len());
        assert!(output.len() >= 4800 - 1024, "len {}", output.len());
    }

    #[test]
    fn flat_eq_bands_are_bypassed() {
        let mut proc = AudioProcessor::new(config(48000, 48000, 1, 1), tuning()).unwrap();
        // Force the non-passthrough path with a tiny volume change, then
        // verify the flat EQ stage does not blow up the signal.
        proc.set_volume(0.999);
        let samples = sine16(10000.0, 500.0, 48000.0, 4800, 1);
        let output = proc.process(&pcm16(&samples), 1.0).unwrap();
        assert!(!output.is_empty());
        let input_rms = rms(&samples.iter().map(|&s| (s as i32) << 16).collect::<Vec<_>>());
        let ratio = rms(&output) / input_rms;
        assert!((0.8..1.2).contains(&ratio), "flat-EQ ratio {ratio}");
    }

    #[test]
    fn eq_gain_boosts_band_energy() {
        let mut proc = AudioProcessor::new(config(48000, 48000, 1, 1), tuning()).unwrap();
        let mut eq = [1.0f32; EQ_BANDS];
        eq[8] = 2.0; // +10 dB at ~1 kHz
        proc.set_equalizer(&eq);

        let samples = sine16(4000.0, 1046.5, 48000.0, 4800, 1);
        let output = proc.process(&pcm16(&samples), 1.0).unwrap();

        let input_rms = rms(&samples.iter().map(|&s| (s as i32) << 16).collect::<Vec<_>>());
        let output_rms = rms(&output);
        assert!(
            output_rms > input_rms * 1.5,
            "EQ boost missing: {output_rms} vs {input_rms}"
        );
    }

    #[test]
    fn soft_clip_is_identity_below_knee() {
        assert_eq!(soft_clip(0.5, 0.8, 0.2), 0.5);
        assert_eq!(soft_clip(-0.5, 0.8, 0.2), -0.5);
        // Above the knee the output is bounded and monotone.
        let clipped = soft_clip(1.5, 0.8, 0.2);
        assert!(clipped < 1.0 && clipped > 0.7);
        assert_eq!(soft_clip(-1.5, 0.8, 0.2), -clipped);
    }

    #[test]
    fn construction_is_all_or_nothing() {
        let mut bad = config(48000, 48000, 2, 2);
        bad.input_channels = 0;
        assert!(AudioProcessor::new(bad, tuning()).is_err());

        let mut bad = config(48000, 48000, 2, 2);
        bad.input_bit_depth = 12;
        assert!(AudioProcessor::new(bad, tuning()).is_err());

        let mut bad = config(48000, 48000, 2, 2);
        bad.output_sample_rate = 0;
        assert!(AudioProcessor::new(bad, tuning()).is_err());
    }

    #[test]
    fn playback_rate_drains_faster() {
        let mut proc = AudioProcessor::new(config(48000, 48000, 1, 1), tuning()).unwrap();
        let input = pcm16(&vec![1000i16; 4800]);
        // 2% faster playback consumes the same input into ~2% fewer output
        // frames (converter priming makes the first call run short).
        let output = proc.process(&input, 1.02).unwrap();
        assert!(output.len() < 4800);
        assert!(output.len() > 3500);
    }

    #[test]
    fn scale_to_i32_alignments() {
        assert_eq!(scale_to_i32(&[0x00, 0x40], 16), vec![0x4000 << 16]);
        assert_eq!(scale_to_i32(&[0x01, 0x02, 0x03], 24), vec![0x030201 << 8]);
        assert_eq!(
            scale_to_i32(&[0x04, 0x03, 0x02, 0x01], 32),
            vec![0x01020304]
        );
        // 8-bit is unsigned, centered.
        assert_eq!(scale_to_i32(&[128], 8), vec![0]);
        assert_eq!(scale_to_i32(&[129], 8), vec![1 << 24]);
    }

    fn rms(samples: &[i32]) -> f64 {
        let sum: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64 / I32_SCALE;
                v * v
            })
            .sum();
        (sum / samples.len() as f64).sqrt()
    }
}
