#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mixdeck::decode::StreamParams;
use mixdeck::{
    AudioOutput, AudioOutputError, MixSpec, OutputFactory, PlayerConfig, PositionTracker,
    SampleFormat, Volume,
};
use tempfile::TempDir;

/// Write a sine wave WAV of the given length and return its path.
pub fn sine_wav(dir: &TempDir, name: &str, rate: u32, channels: u16, length: Duration) -> PathBuf {
    let path = dir.path().join(name);
    write_sine(&path, rate, channels, length);
    path
}

pub fn write_sine(path: &Path, rate: u32, channels: u16, length: Duration) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();

    let frames = (length.as_secs_f64() * rate as f64) as u64;
    for i in 0..frames {
        let t = i as f64 / rate as f64;
        let sample = ((t * 440.0 * std::f64::consts::TAU).sin() * 0.5 * i16::MAX as f64) as i16;
        for _ in 0..channels {
            writer.write_sample(sample).unwrap();
        }
    }
    writer.finalize().unwrap();
}

/// What a [`StuckOutput`] saw, readable after the player is gone.
#[derive(Default)]
pub struct OutputEvents {
    pub dropped: AtomicBool,
    /// Set when the tracker was paused while the device still played
    pub pause_out_of_step: AtomicBool,
}

/// An output that plays everything at once but never drains its buffer,
/// like a device whose tail is never heard.
pub struct StuckOutput {
    tracker: Arc<PositionTracker>,
    events: Arc<OutputEvents>,
    volume: Volume,
    paused: bool,
    input_params: Option<StreamParams>,
    output_params: cpal::StreamConfig,
}

impl StuckOutput {
    pub fn factory(events: Arc<OutputEvents>) -> OutputFactory {
        Box::new(move |config: &PlayerConfig, tracker: Arc<PositionTracker>| {
            let output = StuckOutput {
                tracker,
                events,
                volume: config.volume,
                paused: false,
                input_params: None,
                output_params: cpal::StreamConfig {
                    channels: config.channels,
                    sample_rate: cpal::SampleRate(config.sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                },
            };
            Ok(Box::new(output) as Box<dyn AudioOutput>)
        })
    }
}

impl AudioOutput for StuckOutput {
    fn write(&mut self, decoded: &[f32]) {
        if !self.paused {
            self.tracker.on_mix(decoded.len() * std::mem::size_of::<f32>());
        }
    }

    fn flush(&mut self) {}

    fn seek_flush(&mut self) {}

    fn set_volume(&mut self, vol: Volume) {
        self.volume = vol;
    }

    fn volume(&self) -> Volume {
        self.volume
    }

    fn set_paused(&mut self, paused: bool) {
        // The device must stop before the tracker, and the tracker must run
        // again before the device does
        if self.tracker.is_paused() && (paused || self.paused) {
            self.events.pause_out_of_step.store(true, Ordering::SeqCst);
        }
        self.paused = paused;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn params(&self) -> cpal::StreamConfig {
        self.output_params.clone()
    }

    fn input_params(&self) -> Option<StreamParams> {
        self.input_params
    }

    fn update_input_params(&mut self, params: StreamParams) -> Result<(), AudioOutputError> {
        // Samples go to the tracker as decoded, planar at the stream's rate
        self.tracker.set_spec(MixSpec {
            frequency: params.rate,
            format: SampleFormat::F32,
            channels: params.channels,
        });
        self.input_params = Some(params);
        Ok(())
    }

    fn buffer_level(&self) -> usize {
        1
    }

    fn buffer_capacity(&self) -> usize {
        2
    }

    fn buffer_healthy(&self) -> usize {
        2
    }
}

impl Drop for StuckOutput {
    fn drop(&mut self) {
        self.events.dropped.store(true, Ordering::SeqCst);
    }
}
