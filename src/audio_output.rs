use cpal::{
    traits::{DeviceTrait as _, StreamTrait},
    Stream, StreamConfig,
};
use log::{error, info, warn};
use rb::{RbConsumer as _, RbInspector, RbProducer as _, RB as _};
use samplerate::{ConverterType, Samplerate};
use std::{
    mem,
    ops::Mul,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use thiserror::Error;

use crate::{
    decode::StreamParams,
    position::{MixSpec, PositionTracker, SampleFormat},
    OutputFactory, PlayerConfig,
};

#[derive(Error, Debug)]
pub enum AudioOutputError {
    #[error("No output device available")]
    NoDevice,

    #[error("Could not query output device: {0}")]
    DeviceQuery(String),

    #[error("Could not open output stream: {0}")]
    OpenStream(#[from] cpal::BuildStreamError),

    #[error("Could not start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Could not set up resampler: {0}")]
    Resampler(String),
}

/// Open the output stream on `device`, reporting everything it plays to
/// `tracker`.
pub fn open_output(
    device: &cpal::Device,
    config: &PlayerConfig,
    tracker: Arc<PositionTracker>,
) -> Result<Box<dyn AudioOutput>, AudioOutputError> {
    // In theory this could be different per platform, with other outputs like
    // pipewire or something else
    Ok(Box::new(CpalOutput::new(device, config, tracker)?))
}

/// Turns planar samples into interleaved frames of `output_channels`.
///
/// Mono input is copied to both the left and right outputs, any extra output
/// channels are silent.
pub fn interleave(planar: &[f32], channels: usize, output_channels: usize) -> Vec<f32> {
    if channels == 0 || output_channels == 0 {
        return Vec::new();
    }

    let channel_len = planar.len() / channels;
    let mut interleaved = vec![0.; channel_len * output_channels];
    for (i, frame) in interleaved.chunks_exact_mut(output_channels).enumerate() {
        for (ch, s) in frame.iter_mut().enumerate() {
            *s = match ch {
                c if c < 2 && channels == 1 => planar[i],
                c if c < channels => planar[(c * channel_len) + i],
                _ => 0.0,
            }
        }
    }
    interleaved
}

pub trait AudioOutput {
    /// Write some planar samples into the buffer to be played.
    fn write(&mut self, decoded: &[f32]);

    /// Flush the remaining samples from the resampler.
    fn flush(&mut self);

    /// Call on a seek to prevent audio weirdness.
    fn seek_flush(&mut self);

    /// Set the volume (amplitude) of the output.
    fn set_volume(&mut self, vol: Volume);

    /// Get the volume (amplitude) of the output.
    fn volume(&self) -> Volume;

    /// Output silence instead of draining the buffer while paused.
    fn set_paused(&mut self, paused: bool);

    fn is_paused(&self) -> bool;

    fn params(&self) -> StreamConfig;

    /// Get the input stream parameters.
    fn input_params(&self) -> Option<StreamParams>;

    /// Update input stream parameters, used for internal calculations.
    fn update_input_params(&mut self, params: StreamParams) -> Result<(), AudioOutputError>;

    /// Gets the current level of the buffer in samples.
    fn buffer_level(&self) -> usize;

    /// Gets the capacity of the buffer in samples.
    fn buffer_capacity(&self) -> usize;

    /// The buffer level below which more samples should be decoded.
    fn buffer_healthy(&self) -> usize;

    /// Calculates the delay until the buffer is empty and the last sample plays.
    fn buffer_delay(&self) -> Duration {
        let samples_per_second = self.params().channels as u64 * self.params().sample_rate.0 as u64;
        if samples_per_second == 0 {
            return Duration::ZERO;
        }
        let delay_microseconds = (self.buffer_level() as u64 * 1_000_000) / samples_per_second;

        Duration::from_micros(delay_microseconds)
    }

    /// Get the buffer's fullness as a percentage.
    fn buffer_percent(&self) -> f32 {
        if self.buffer_capacity() == 0 {
            return 0.0;
        }
        (self.buffer_level() as f32 / self.buffer_capacity() as f32) * 100.0
    }
}

pub struct CpalOutput {
    ring_buf: rb::SpscRb<f32>,
    ring_buf_producer: rb::Producer<f32>,
    resampler: Option<Samplerate>,
    volume: Volume,
    channels: u16,
    state: bool,
    paused: Arc<AtomicBool>,

    input_params: Option<StreamParams>,
    output_stream: Stream,
    output_params: StreamConfig,
}

impl CpalOutput {
    fn new(
        device: &cpal::Device,
        config: &PlayerConfig,
        tracker: Arc<PositionTracker>,
    ) -> Result<Self, AudioOutputError> {
        // Ensure that the stream has a valid output sample rate.
        // Always prefer the configured rate, but adapt as needed.
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioOutputError::DeviceQuery(e.to_string()))?;
        let out_hz = supported_rate(
            config.sample_rate,
            configs.map(|c| (c.min_sample_rate().0, c.max_sample_rate().0)),
        );
        if out_hz != config.sample_rate {
            warn!("output rate can't be set to {}, using {out_hz}", config.sample_rate)
        }

        // Ensure the stream has a valid output channel count
        let mut out_ch = config.channels;
        if let Ok(c) = device.default_output_config() {
            out_ch = c.channels();
        }
        if out_ch != config.channels {
            warn!("output channel count can't be set to {}, using {out_ch}", config.channels)
        }

        let output_params = cpal::StreamConfig {
            channels: out_ch,
            sample_rate: cpal::SampleRate(out_hz),
            buffer_size: cpal::BufferSize::Default,
        };

        tracker.set_spec(MixSpec {
            frequency: out_hz,
            format: SampleFormat::F32,
            channels: out_ch,
        });

        let ring_len = ring_len(config.buffer_ms, &output_params);
        let ring_buf = rb::SpscRb::new(ring_len);
        let (ring_buf_producer, ring_buf_consumer) = (ring_buf.producer(), ring_buf.consumer());

        let paused = Arc::new(AtomicBool::new(false));
        let output_stream = device.build_output_stream(
            &output_params,
            {
                let paused = Arc::clone(&paused);
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if paused.load(Ordering::Acquire) {
                        data.iter_mut().for_each(|s| *s = 0f32);
                        return;
                    }

                    // Write out as many samples as possible from the ring buffer to the audio
                    // output.
                    let written = ring_buf_consumer.read(data).unwrap_or(0);

                    // Mute any remaining samples.
                    data[written..].iter_mut().for_each(|s| *s = 0f32);

                    tracker.on_mix(written * mem::size_of::<f32>());
                }
            },
            move |err| error!("audio output error: {}", err),
            None,
        )?;

        Ok(Self {
            ring_buf,
            ring_buf_producer,
            resampler: None,
            volume: config.volume,
            channels: out_ch,
            state: false,
            paused,

            input_params: None,
            output_stream,
            output_params,
        })
    }
}

/// The rate closest to `wanted` within any of the device's `(min, max)`
/// ranges, `wanted` itself when the device reports none.
fn supported_rate<I: IntoIterator<Item = (u32, u32)>>(wanted: u32, ranges: I) -> u32 {
    ranges
        .into_iter()
        .map(|(min, max)| wanted.clamp(min, max.max(min)))
        .min_by_key(|rate| rate.abs_diff(wanted))
        .unwrap_or(wanted)
}

/// Ring buffer length in samples for `buffer_ms` of audio.
fn ring_len(buffer_ms: usize, params: &StreamConfig) -> usize {
    (((buffer_ms * params.sample_rate.0 as usize) / 1000) * params.channels as usize).max(1)
}

impl AudioOutput for CpalOutput {
    fn write(&mut self, decoded: &[f32]) {
        // Do nothing if there are no audio frames.
        if decoded.is_empty() {
            warn!("decoded length was 0");
            return;
        }

        if !self.state {
            // If the stream isn't playing, do that
            if let Err(e) = self.output_stream.play() {
                error!("could not start output stream: {e}");
                return;
            }
            self.state = true
        }

        // Interleave samples
        let decoded = interleave(decoded, self.channels as usize, self.output_params.channels as usize);

        // Resample if resampler exists
        let mut processed_samples = if let Some(resampler) = &mut self.resampler {
            match resampler.process(&decoded) {
                Ok(resampled) => resampled,
                Err(e) => {
                    warn!("dropping packet, resampling failed: {e}");
                    return;
                }
            }
        } else {
            decoded
        };

        // Set the sample amplitude (volume) for every sample
        // This is obviously not necessary if the volume is not changed
        if self.volume != 1.0 {
            processed_samples
                .iter_mut()
                .for_each(|s| *s = self.volume.mul(*s));
        }

        // Write all samples to the ring buffer.
        let mut offset = 0;
        while let Some(written) = self
            .ring_buf_producer
            .write_blocking(&processed_samples[offset..])
        {
            offset += written;
        }
    }

    fn seek_flush(&mut self) {
        if let Some(resampler) = &mut self.resampler {
            if let Err(e) = resampler.reset() {
                warn!("could not reset resampler: {e}");
            }
        }

        self.ring_buf.clear();
    }

    fn flush(&mut self) {
        // If there is a resampler, then it may need to be flushed
        // depending on the number of samples it has.
        if let Some(resampler) = &mut self.resampler {
            let mut remaining_samples = resampler.process_last(&[]).unwrap_or_default();

            while let Some(written) = self.ring_buf_producer.write_blocking(&remaining_samples) {
                remaining_samples = remaining_samples[written..].to_vec();
            }
        }

        // Flush is best-effort, ignore the returned result.
        self.state = false;
    }

    fn set_volume(&mut self, vol: Volume) {
        self.volume = vol
    }

    fn volume(&self) -> Volume {
        self.volume
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::Release)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn params(&self) -> StreamConfig {
        self.output_params.clone()
    }

    fn input_params(&self) -> Option<StreamParams> {
        self.input_params
    }

    fn update_input_params(&mut self, params: StreamParams) -> Result<(), AudioOutputError> {
        // If the sample rate is not equal to the output sample rate,
        // create a resampler to correct it
        if params.rate != self.output_params.sample_rate.0 {
            let resample_ratio = params.rate as f64 / self.output_params.sample_rate.0 as f64;
            info!(
                "resampling {} Hz to {} Hz ({:0.4}), packet size of {} frames",
                params.rate, self.output_params.sample_rate.0, resample_ratio, params.packet_size,
            );

            // Chose samplerate conversion based on how extreme the sample ratio is
            let (converter, name) = match resample_ratio {
                r if r <= 2.0 => (ConverterType::SincBestQuality, "best quality sinc"),
                r if r <= 3.0 => (ConverterType::SincMediumQuality, "medium quality sinc"),
                r if r <= 4.0 => (ConverterType::SincFastest, "fastest sinc"),
                _ => (ConverterType::Linear, "linear"),
            };
            info!("chose {name} for sample rate conversion");

            self.resampler = Some(
                Samplerate::new(
                    converter,
                    params.rate,
                    self.output_params.sample_rate.0,
                    self.output_params.channels as usize,
                )
                .map_err(|e| AudioOutputError::Resampler(e.to_string()))?,
            );
        } else {
            self.resampler = None;
        };

        self.input_params = Some(params);
        self.channels = params.channels;

        Ok(())
    }

    fn buffer_level(&self) -> usize {
        self.ring_buf.count()
    }

    fn buffer_capacity(&self) -> usize {
        self.ring_buf.capacity()
    }

    fn buffer_healthy(&self) -> usize {
        self.ring_buf.capacity() - (self.ring_buf.capacity() / 5)
    }
}

/// An output without a device.
///
/// Samples are "played" the moment they are written, which makes it useful
/// for dry runs and for driving the player in tests. With
/// [`NullOutput::realtime`] the writer is held back to playback speed.
pub struct NullOutput {
    tracker: Arc<PositionTracker>,
    volume: Volume,
    paused: bool,
    realtime: bool,
    samples_played: u64,
    peak: f32,

    input_params: Option<StreamParams>,
    output_params: StreamConfig,
}

impl NullOutput {
    pub fn new(config: &PlayerConfig, tracker: Arc<PositionTracker>) -> Self {
        let output_params = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        tracker.set_spec(spec_of(&output_params));

        Self {
            tracker,
            volume: config.volume,
            paused: false,
            realtime: false,
            samples_played: 0,
            peak: 0.0,
            input_params: None,
            output_params,
        }
    }

    /// Factory for [`crate::Player::with_output`].
    pub fn factory(realtime: bool) -> OutputFactory {
        Box::new(move |config: &PlayerConfig, tracker: Arc<PositionTracker>| {
            let output = NullOutput::new(config, tracker);
            let output = if realtime { output.realtime() } else { output };
            Ok(Box::new(output) as Box<dyn AudioOutput>)
        })
    }

    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Interleaved samples written since the output was opened.
    pub fn samples_played(&self) -> u64 {
        self.samples_played
    }

    /// Largest absolute sample value written, after volume.
    pub fn peak(&self) -> f32 {
        self.peak
    }
}

fn spec_of(params: &StreamConfig) -> MixSpec {
    MixSpec {
        frequency: params.sample_rate.0,
        format: SampleFormat::F32,
        channels: params.channels,
    }
}

impl AudioOutput for NullOutput {
    fn write(&mut self, decoded: &[f32]) {
        if decoded.is_empty() || self.paused {
            return;
        }

        let in_channels = self
            .input_params
            .map(|p| p.channels)
            .unwrap_or(self.output_params.channels);
        let frames = interleave(decoded, in_channels as usize, self.output_params.channels as usize);

        self.peak = frames
            .iter()
            .map(|s| self.volume.mul(*s).abs())
            .fold(self.peak, f32::max);
        self.samples_played += frames.len() as u64;

        let len_bytes = frames.len() * mem::size_of::<f32>();
        self.tracker.on_mix(len_bytes);

        if self.realtime {
            thread::sleep(self.tracker.spec().bytes_to_duration(len_bytes as u64));
        }
    }

    fn flush(&mut self) {}

    fn seek_flush(&mut self) {}

    fn set_volume(&mut self, vol: Volume) {
        self.volume = vol
    }

    fn volume(&self) -> Volume {
        self.volume
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn params(&self) -> StreamConfig {
        self.output_params.clone()
    }

    fn input_params(&self) -> Option<StreamParams> {
        self.input_params
    }

    fn update_input_params(&mut self, params: StreamParams) -> Result<(), AudioOutputError> {
        // There is no device to satisfy, so just follow the stream's rate
        if params.rate != self.output_params.sample_rate.0 {
            self.output_params.sample_rate = cpal::SampleRate(params.rate);
            self.tracker.set_spec(spec_of(&self.output_params));
        }
        self.input_params = Some(params);

        Ok(())
    }

    fn buffer_level(&self) -> usize {
        0
    }

    fn buffer_capacity(&self) -> usize {
        0
    }

    fn buffer_healthy(&self) -> usize {
        1
    }
}

/// Linear amplitude between 0.0 and 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volume(f32);

impl Default for Volume {
    fn default() -> Self {
        Self(1.0)
    }
}

impl Volume {
    pub fn new(vol: f32) -> Self {
        let vol = vol.clamp(0.0, 1.0);

        Volume(vol)
    }

    /// From the 0 to 100 scale the controls use, clamped.
    pub fn from_percent(percent: u8) -> Self {
        Volume::new(percent.min(100) as f32 / 100.0)
    }

    pub fn set(&mut self, vol: f32) {
        let vol = vol.clamp(0.0, 1.0);

        self.0 = vol
    }

    pub fn as_f32(&self) -> f32 {
        self.0
    }

    pub fn percent(&self) -> u8 {
        (self.0 * 100.0).round() as u8
    }
}

impl std::ops::Mul<f32> for Volume {
    type Output = f32;

    fn mul(self, rhs: f32) -> Self::Output {
        self.0 * rhs
    }
}

impl PartialEq<f32> for Volume {
    fn eq(&self, other: &f32) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_a_rate_from_any_supported_range() {
        // The wanted rate sits in the first range, not the last
        assert_eq!(supported_rate(44_100, [(8_000, 48_000), (88_200, 192_000)]), 44_100);
        assert_eq!(supported_rate(96_000, [(8_000, 48_000), (88_200, 192_000)]), 96_000);
        assert_eq!(supported_rate(60_000, [(8_000, 48_000), (88_200, 192_000)]), 48_000);
        assert_eq!(supported_rate(22_050, [(44_100, 48_000)]), 44_100);
        assert_eq!(supported_rate(44_100, std::iter::empty()), 44_100);
    }

    #[test]
    fn interleaves_stereo() {
        let planar = [1.0, 2.0, 3.0, -1.0, -2.0, -3.0];
        assert_eq!(interleave(&planar, 2, 2), vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn mono_goes_to_both_sides() {
        let planar = [0.5, 0.25];
        assert_eq!(interleave(&planar, 1, 2), vec![0.5, 0.5, 0.25, 0.25]);
        assert_eq!(interleave(&planar, 1, 3), vec![0.5, 0.5, 0.0, 0.25, 0.25, 0.0]);
    }

    #[test]
    fn extra_input_channels_are_dropped() {
        let planar = [1.0, 2.0, 3.0];
        assert_eq!(interleave(&planar, 3, 2), vec![1.0, 2.0]);
        assert!(interleave(&planar, 0, 2).is_empty());
    }

    #[test]
    fn volume_clamps_and_converts() {
        assert_eq!(Volume::new(1.5), 1.0);
        assert_eq!(Volume::new(-0.5), 0.0);
        assert_eq!(Volume::from_percent(50), 0.5);
        assert_eq!(Volume::from_percent(250), 1.0);
        assert_eq!(Volume::new(0.333).percent(), 33);

        let mut v = Volume::default();
        v.set(0.25);
        assert_eq!(v * 2.0, 0.5);
    }

    #[test]
    fn null_output_reports_to_tracker() {
        let config = PlayerConfig {
            sample_rate: 1000,
            channels: 2,
            volume: Volume::new(0.5),
            ..Default::default()
        };
        let tracker = Arc::new(PositionTracker::default());
        let mut out = NullOutput::new(&config, Arc::clone(&tracker));
        out.update_input_params(StreamParams { rate: 1000, channels: 1, packet_size: 500 })
            .unwrap();

        // 500 mono frames become 1000 stereo samples, half a second at 1 kHz
        out.write(&[1.0; 500]);
        assert_eq!(out.samples_played(), 1000);
        assert_eq!(out.peak(), 0.5);
        assert_eq!(tracker.bytes(), 4000);

        out.set_paused(true);
        out.write(&[1.0; 500]);
        assert_eq!(out.samples_played(), 1000);
    }

    #[test]
    fn null_output_follows_stream_rate() {
        let tracker = Arc::new(PositionTracker::default());
        let mut out = NullOutput::new(&PlayerConfig::default(), Arc::clone(&tracker));
        out.update_input_params(StreamParams { rate: 22_050, channels: 2, packet_size: 1024 })
            .unwrap();

        assert_eq!(out.params().sample_rate.0, 22_050);
        assert_eq!(tracker.spec().frequency, 22_050);
        assert_eq!(out.buffer_delay(), Duration::ZERO);
    }
}
