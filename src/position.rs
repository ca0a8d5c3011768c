//! Elapsed-time tracking driven by the output's mix callback.
//!
//! The audio callback reports how many bytes it handed to the device. Those
//! bytes are turned back into time using the mixer's sample rate, sample
//! format and channel count, and the time since the last callback is added
//! on top so the reported position keeps moving between callbacks.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// Sample encodings the mixer can be opened with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S8,
    U16,
    S16,
    S32,
    #[default]
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> u64 {
        match self {
            SampleFormat::U8 | SampleFormat::S8 => 1,
            SampleFormat::U16 | SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }
}

/// The format the mixer was actually opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixSpec {
    pub frequency: u32,
    pub format: SampleFormat,
    pub channels: u16,
}

impl Default for MixSpec {
    fn default() -> Self {
        Self {
            frequency: 44_100,
            format: SampleFormat::F32,
            channels: 2,
        }
    }
}

impl MixSpec {
    /// Size of one frame (one sample for every channel) in bytes.
    pub fn bytes_per_frame(&self) -> u64 {
        self.channels as u64 * self.format.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.frequency as u64 * self.bytes_per_frame()
    }

    /// Converts a byte count at this spec into playback time.
    pub fn bytes_to_duration(&self, bytes: u64) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }

        let micros = (bytes as u128 * 1_000_000) / bps as u128;
        Duration::from_micros(micros as u64)
    }

    /// Converts a playback time into a frame-aligned byte count.
    pub fn duration_to_bytes(&self, pos: Duration) -> u64 {
        let frames = (pos.as_nanos() * self.frequency as u128) / 1_000_000_000;
        frames as u64 * self.bytes_per_frame()
    }
}

/// Length of a fully decoded buffer of `byte_len` bytes.
///
/// Returns `None` if the format has no channels or no sample rate.
pub fn song_length(byte_len: u64, spec: MixSpec) -> Option<Duration> {
    if spec.channels == 0 || spec.frequency == 0 {
        return None;
    }

    let frames = byte_len / spec.bytes_per_frame();
    Some(Duration::from_secs_f64(frames as f64 / spec.frequency as f64))
}

const NO_MIX: u64 = u64::MAX;

/// Byte counter fed by the output callback.
///
/// Shared between the real-time callback (writer) and any number of readers,
/// so everything the callback touches is atomic.
#[derive(Debug)]
pub struct PositionTracker {
    spec: RwLock<MixSpec>,
    bytes: AtomicU64,
    paused: AtomicBool,

    epoch: Instant,
    /// Nanoseconds after `epoch` of the last counted callback
    last_mix: AtomicU64,
    /// Size of the last counted callback buffer
    last_mix_len: AtomicU64,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new(MixSpec::default())
    }
}

impl PositionTracker {
    pub fn new(spec: MixSpec) -> Self {
        Self {
            spec: RwLock::new(spec),
            bytes: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            epoch: Instant::now(),
            last_mix: AtomicU64::new(NO_MIX),
            last_mix_len: AtomicU64::new(0),
        }
    }

    pub fn spec(&self) -> MixSpec {
        *self.spec.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Update the mix format once the output device settles on one.
    ///
    /// The counter is reset because old bytes no longer mean the same thing.
    pub fn set_spec(&self, spec: MixSpec) {
        *self.spec.write().unwrap_or_else(|e| e.into_inner()) = spec;
        self.reset();
    }

    /// Called by the output for every buffer handed to the device.
    pub fn on_mix(&self, len_bytes: usize) {
        self.on_mix_at(len_bytes, Instant::now())
    }

    fn on_mix_at(&self, len_bytes: usize, now: Instant) {
        if self.is_paused() || len_bytes == 0 {
            return;
        }

        self.bytes.fetch_add(len_bytes as u64, Ordering::AcqRel);
        self.last_mix_len.store(len_bytes as u64, Ordering::Release);
        self.last_mix.store(self.nanos_since_epoch(now), Ordering::Release);
    }

    /// Total bytes counted so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn position(&self) -> Duration {
        self.position_at(Instant::now())
    }

    fn position_at(&self, now: Instant) -> Duration {
        let spec = self.spec();
        let counted = spec.bytes_to_duration(self.bytes());

        if self.is_paused() {
            return counted;
        }

        let last_mix = self.last_mix.load(Ordering::Acquire);
        if last_mix == NO_MIX {
            return counted;
        }

        // Never run ahead of what the device was actually given
        let since = Duration::from_nanos(self.nanos_since_epoch(now).saturating_sub(last_mix));
        let ceiling = spec.bytes_to_duration(self.last_mix_len.load(Ordering::Acquire));

        counted + since.min(ceiling)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);

        // The time spent paused must not be extrapolated on resume
        self.last_mix.store(NO_MIX, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Release);
        self.last_mix.store(NO_MIX, Ordering::Release);
        self.last_mix_len.store(0, Ordering::Release);
    }

    /// Re-synchronise the counter after a seek.
    pub fn seek_to(&self, pos: Duration) {
        let bytes = self.spec().duration_to_bytes(pos);
        self.bytes.store(bytes, Ordering::Release);
        self.last_mix.store(NO_MIX, Ordering::Release);
        self.last_mix_len.store(0, Ordering::Release);
    }

    fn nanos_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }
}
