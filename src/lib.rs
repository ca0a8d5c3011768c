mod audio_output;
pub mod control;
pub mod decode;
pub mod playlist;
pub mod position;
pub mod utils;

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub use audio_output::{
    interleave, open_output, AudioOutput, AudioOutputError, CpalOutput, NullOutput, Volume,
};
use cpal::traits::HostTrait as _;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use decode::{Decoder, DecoderError};
use fluent_uri::Uri;
use log::{debug, error, info, warn};
pub use position::{MixSpec, PositionTracker, SampleFormat};
use thiserror::Error;
use utils::UriError;

enum InternalMessage {
    /// Set a volume level
    Volume(Volume),

    /// Seek to a specified duration
    Seek(Duration),

    /// Set up the thread with a new stream
    LoadNew(Uri<String>),

    Play,
    Pause,
    Resume,

    /// Drop the current stream
    Stop,

    /// Call once to kill the receiving thread
    Destroy,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum State {
    #[default]
    Stopped,
    Playing,
    Paused,
    Errored(String),
}

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Internal decoder error: {0}")]
    DecoderError(#[from] DecoderError),

    #[error("Audio output error: {0}")]
    OutputError(#[from] AudioOutputError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error("Nothing is loaded, the operation is invalid")]
    NothingLoaded,

    #[error("The stream has finished decoding, only its tail is playing")]
    Draining,

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("The playback thread has gone away")]
    ThreadGone,
}

/// Settings for the mixer side of the player.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Preferred output rate, the device may force another one
    pub sample_rate: u32,
    /// Preferred output channel count
    pub channels: u16,
    /// Length of the output ring buffer
    pub buffer_ms: usize,
    /// Volume applied when the output opens
    pub volume: Volume,
    /// How often the play loop samples the position
    pub poll_interval: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            buffer_ms: 200,
            volume: Volume::from_percent(50),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Builds the audio output on the playback thread.
pub type OutputFactory = Box<
    dyn FnOnce(&PlayerConfig, Arc<PositionTracker>) -> Result<Box<dyn AudioOutput>, AudioOutputError>
        + Send,
>;

/// Handle to a playback thread.
///
/// Every control is forwarded to the thread, which owns the decoder and the
/// audio output. Position comes straight from the [`PositionTracker`] that the
/// output's mix callback feeds.
pub struct Player {
    volume: Volume,
    config: PlayerConfig,

    state: Arc<RwLock<State>>,
    duration: Arc<RwLock<Option<Duration>>>,
    loaded: Arc<AtomicBool>,
    tracker: Arc<PositionTracker>,

    internal_send: channel::Sender<InternalMessage>,
    internal_recvback: channel::Receiver<Result<(), PlayerError>>,

    uri_current: Option<Uri<String>>,
}

impl Player {
    /// Open the default output device.
    pub fn new(config: PlayerConfig) -> Result<Player, PlayerError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioOutputError::NoDevice)?;

        Self::with_device(config, device)
    }

    pub fn with_device(config: PlayerConfig, device: cpal::Device) -> Result<Player, PlayerError> {
        Self::with_output(
            config,
            Box::new(move |config: &PlayerConfig, tracker: Arc<PositionTracker>| {
                open_output(&device, config, tracker)
            }),
        )
    }

    /// Start the playback thread with a custom output.
    pub fn with_output(config: PlayerConfig, factory: OutputFactory) -> Result<Player, PlayerError> {
        let (internal_send, internal_recv) = channel::bounded(1);
        let (internal_sendback, internal_recvback) = channel::bounded(1);

        let state = Arc::new(RwLock::new(State::Stopped));
        let duration = Arc::new(RwLock::new(None));
        let loaded = Arc::new(AtomicBool::new(false));
        let tracker = Arc::new(PositionTracker::default());

        thread::Builder::new()
            .name("audio_player".to_string())
            .spawn({
                let config = config.clone();
                let state = Arc::clone(&state);
                let duration = Arc::clone(&duration);
                let loaded = Arc::clone(&loaded);
                let tracker = Arc::clone(&tracker);
                move || {
                    let audio_output = match factory(&config, Arc::clone(&tracker)) {
                        Ok(mut o) => {
                            o.set_volume(config.volume);
                            let _ = internal_sendback.send(Ok(()));
                            o
                        }
                        Err(e) => {
                            let _ = internal_sendback.send(Err(e.into()));
                            return;
                        }
                    };

                    player_loop(PlayerState {
                        audio_output,
                        decoder: None,
                        draining: false,
                        internal_recv,
                        internal_send: internal_sendback,
                        state,
                        duration,
                        loaded,
                        tracker,
                    })
                }
            })
            .map_err(|e| PlayerError::Playback(e.to_string()))?;

        // Wait for the output to open
        internal_recvback.recv().map_err(|_| PlayerError::ThreadGone)??;

        Ok(Self {
            volume: config.volume,
            config,
            state,
            duration,
            loaded,
            tracker,
            uri_current: None,
            internal_send,
            internal_recvback,
        })
    }

    fn send_recv(&mut self, message: InternalMessage) -> Result<(), PlayerError> {
        self.internal_send.send(message).map_err(|_| PlayerError::ThreadGone)?;
        self.internal_recvback.recv().map_err(|_| PlayerError::ThreadGone)?
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Load a new stream.
    ///
    /// This immediately overrides the previous one, flushing the buffer. The
    /// player is left stopped at the start of the stream.
    pub fn load_new(&mut self, uri: &Uri<String>) -> Result<(), PlayerError> {
        info!("loading {uri}");
        self.send_recv(InternalMessage::LoadNew(uri.clone()))?;
        self.uri_current = Some(uri.clone());

        Ok(())
    }

    pub fn load_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PlayerError> {
        let uri = utils::path_to_uri(&path)?;
        self.load_new(&uri)
    }

    /// The stream last given to [`Player::load_new`].
    pub fn current_uri(&self) -> Option<&Uri<String>> {
        self.uri_current.as_ref()
    }

    /// Start playing.
    ///
    /// A stream that was stopped or ran to its end is loaded again and starts
    /// from the beginning.
    pub fn play(&mut self) -> Result<(), PlayerError> {
        if !self.loaded.load(Ordering::Acquire) {
            let uri = self.uri_current.clone().ok_or(PlayerError::NothingLoaded)?;
            self.send_recv(InternalMessage::LoadNew(uri))?;
        }

        self.send_recv(InternalMessage::Play)
    }

    /// Pause if playing, otherwise do nothing.
    pub fn pause(&mut self) -> Result<(), PlayerError> {
        self.send_recv(InternalMessage::Pause)
    }

    /// Resume if paused, otherwise do nothing.
    pub fn resume(&mut self) -> Result<(), PlayerError> {
        self.send_recv(InternalMessage::Resume)
    }

    /// Halt playback and unload the stream.
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        self.send_recv(InternalMessage::Stop)
    }

    /// Get the volume
    pub fn volume(&self) -> Volume {
        self.volume
    }

    /// Set the volume
    pub fn set_volume(&mut self, vol: Volume) -> Result<(), PlayerError> {
        self.volume = vol;
        self.internal_send
            .send(InternalMessage::Volume(vol))
            .map_err(|_| PlayerError::ThreadGone)
    }

    pub fn volume_percent(&self) -> u8 {
        self.volume.percent()
    }

    pub fn set_volume_percent(&mut self, percent: u8) -> Result<(), PlayerError> {
        self.set_volume(Volume::from_percent(percent))
    }

    pub fn state(&self) -> State {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), State::Playing | State::Paused)
    }

    /// Jump to `pos` in the loaded stream.
    ///
    /// Once the decoder has run out the state stays [`State::Playing`] until
    /// the buffered tail is heard, and seeking then fails with
    /// [`PlayerError::Draining`].
    pub fn seek(&mut self, pos: Duration) -> Result<(), PlayerError> {
        self.send_recv(InternalMessage::Seek(pos))
    }

    /// Elapsed time of the loaded stream, `None` if nothing is loaded.
    pub fn position(&self) -> Option<Duration> {
        if !self.loaded.load(Ordering::Acquire) {
            return None;
        }

        let pos = self.tracker.position();
        Some(match self.duration() {
            Some(d) => pos.min(d),
            None => pos,
        })
    }

    pub fn duration(&self) -> Option<Duration> {
        *self.duration.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Playback progress between 0 and 1, if the length is known.
    pub fn progress(&self) -> Option<f64> {
        let (pos, len) = (self.position()?, self.duration()?);
        if len.is_zero() {
            return None;
        }
        Some((pos.as_secs_f64() / len.as_secs_f64()).clamp(0.0, 1.0))
    }

    /// Block until the current stream finishes, checking every `poll`.
    ///
    /// Once the position reaches the duration playback is halted, so a
    /// stream whose tail never drains still ends.
    pub fn wait_until_finished(&mut self, poll: Duration) -> Result<(), PlayerError> {
        loop {
            thread::sleep(poll);
            if self.check_finished()? {
                return Ok(());
            }
        }
    }

    /// Load `uri`, play it and wait for it to end.
    pub fn play_blocking(&mut self, uri: &Uri<String>) -> Result<(), PlayerError> {
        self.load_new(uri)?;
        self.play()?;
        let poll = self.config.poll_interval;
        self.wait_until_finished(poll)
    }

    /// One step of the play loop: true once the stream is over.
    ///
    /// A playing stream whose position reached its duration is halted here.
    pub fn check_finished(&mut self) -> Result<bool, PlayerError> {
        match self.state() {
            State::Playing => (),
            State::Paused => return Ok(false),
            State::Stopped => return Ok(true),
            State::Errored(e) => return Err(PlayerError::Playback(e)),
        }

        if let (Some(pos), Some(len)) = (self.position(), self.duration()) {
            if pos >= len {
                debug!("position reached the end, halting");
                self.stop()?;
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Run the play loop for `player` on a background thread.
///
/// `on_tick` gets the position and duration every `poll`. The player stays
/// usable from other threads through the mutex, which is only held while
/// sampling.
pub fn spawn_watcher<F>(
    player: Arc<Mutex<Player>>,
    poll: Duration,
    mut on_tick: F,
) -> Result<JoinHandle<Result<(), PlayerError>>, PlayerError>
where
    F: FnMut(Option<Duration>, Option<Duration>) + Send + 'static,
{
    thread::Builder::new()
        .name("play_watcher".to_string())
        .spawn(move || loop {
            thread::sleep(poll);
            let (finished, pos, len) = {
                let mut player = player.lock().map_err(|_| PlayerError::ThreadGone)?;
                let finished = player.check_finished()?;
                (finished, player.position(), player.duration())
            };
            on_tick(pos, len);
            if finished {
                return Ok(());
            }
        })
        .map_err(|e| PlayerError::Playback(e.to_string()))
}

impl Drop for Player {
    fn drop(&mut self) {
        // Waits behind a queued volume change, fails only if the thread is gone
        let _ = self.internal_send.send(InternalMessage::Destroy);
    }
}

const LOOP_DELAY_US: Duration = Duration::from_micros(5000);
pub const BUFFER_MAX: usize = 240_000;

struct PlayerState {
    audio_output: Box<dyn AudioOutput>,
    decoder: Option<Box<dyn Decoder>>,

    /// The decoder ran out and the output is playing what is left
    draining: bool,

    internal_recv: Receiver<InternalMessage>,
    internal_send: Sender<Result<(), PlayerError>>,
    state: Arc<RwLock<State>>,
    duration: Arc<RwLock<Option<Duration>>>,
    loaded: Arc<AtomicBool>,
    tracker: Arc<PositionTracker>,
}

impl PlayerState {
    fn set_state(&self, state: State) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn state(&self) -> State {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn reply(&self, result: Result<(), PlayerError>) {
        let _ = self.internal_send.send(result);
    }

    /// Bytes the device plays must always reach the tracker, so the device
    /// stops before the tracker does and the tracker starts before it.
    fn set_paused(&mut self, paused: bool) {
        if paused {
            self.audio_output.set_paused(true);
            self.tracker.set_paused(true);
        } else {
            self.tracker.set_paused(false);
            self.audio_output.set_paused(false);
        }
    }

    /// Drop the stream and return to the stopped state.
    fn unload(&mut self, state: State) {
        self.decoder = None;
        self.draining = false;
        self.audio_output.seek_flush();
        self.set_paused(false);
        self.tracker.reset();
        self.loaded.store(false, Ordering::Release);
        self.set_state(state);
    }

    fn load(&mut self, uri: &Uri<String>) -> Result<(), PlayerError> {
        self.unload(State::Stopped);

        let decoder = utils::pick_format(uri)?;
        let params = decoder.params();
        self.audio_output.update_input_params(params)?;
        self.tracker.reset();

        let duration = decoder.duration();
        info!(
            "loaded {uri}: {} Hz, {} channels, length {:?}",
            params.rate, params.channels, duration
        );
        *self.duration.write().unwrap_or_else(|e| e.into_inner()) = duration;

        self.decoder = Some(decoder);
        self.loaded.store(true, Ordering::Release);

        Ok(())
    }

    /// Handle one message, returning false when the thread should exit.
    fn handle(&mut self, message: InternalMessage) -> bool {
        match message {
            InternalMessage::LoadNew(uri) => {
                let result = self.load(&uri);
                self.reply(result);
            }
            InternalMessage::Play => {
                if self.decoder.is_none() && !self.draining {
                    self.reply(Err(PlayerError::NothingLoaded));
                    return true;
                }
                self.set_paused(false);
                self.set_state(State::Playing);
                self.reply(Ok(()));
            }
            InternalMessage::Pause => {
                if self.state() == State::Playing {
                    self.set_paused(true);
                    self.set_state(State::Paused);
                }
                self.reply(Ok(()));
            }
            InternalMessage::Resume => {
                if self.state() == State::Paused {
                    self.set_paused(false);
                    self.set_state(State::Playing);
                }
                self.reply(Ok(()));
            }
            InternalMessage::Stop => {
                self.unload(State::Stopped);
                self.reply(Ok(()));
            }
            InternalMessage::Volume(v) => {
                self.audio_output.set_volume(v);
                info!("volume is now {:0.0}%", v.as_f32() * 100.0);
            }
            InternalMessage::Seek(p) => {
                let result = match self.decoder.as_mut() {
                    Some(d) => d.seek(p).map_err(PlayerError::from),
                    None if self.draining => Err(PlayerError::Draining),
                    None => Err(PlayerError::NothingLoaded),
                };
                if result.is_ok() {
                    self.audio_output.seek_flush();
                    self.tracker.seek_to(p);
                }
                self.reply(result);
            }
            InternalMessage::Destroy => {
                warn!("destroying playback thread");
                // A paused stream never drains, so drop the tail instead of flushing it
                self.audio_output.seek_flush();
                return false;
            }
        }

        true
    }
}

fn player_loop(mut p_state: PlayerState) {
    // Set thread priority to avoid stutters
    #[cfg(target_os = "windows")]
    {
        use thread_priority::*;
        if set_current_thread_priority(ThreadPriority::Os(WinAPIThreadPriority::TimeCritical.into())).is_err() {
            warn!("failed to set playback thread priority");
        };
    }

    let mut output_buffer = vec![0f32; BUFFER_MAX];

    'external: loop {
        let timer = Instant::now();
        // Check if there are any internal commands to process
        loop {
            match p_state.internal_recv.try_recv() {
                Ok(r) => {
                    if !p_state.handle(r) {
                        break 'external;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("player handle is gone, shutting down");
                    break 'external;
                }
            }
        }

        if p_state.state() == State::Playing {
            if p_state.draining {
                // Wait for the last samples to reach the device
                if p_state.audio_output.buffer_level() == 0 {
                    debug!("end of stream reached");
                    p_state.unload(State::Stopped);
                }
            } else if p_state.decoder.is_none() {
                p_state.set_state(State::Stopped);
            } else {
                // Only decode when buffer is below the healthy mark
                while p_state.audio_output.buffer_level() < p_state.audio_output.buffer_healthy() {
                    if timer.elapsed() > LOOP_DELAY_US {
                        // Never get stuck in here too long, but if this happens the
                        // decoding speed is too slow
                        break;
                    }

                    let Some(decoder) = p_state.decoder.as_mut() else {
                        break;
                    };
                    match decoder.next_packet_to_buf(&mut output_buffer) {
                        Ok(len) => p_state.audio_output.write(&output_buffer[0..len]),
                        Err(DecoderError::EndOfStream) => {
                            // Let the buffered audio play out before stopping
                            p_state.decoder = None;
                            p_state.audio_output.flush();
                            p_state.draining = true;
                            continue 'external;
                        }
                        Err(DecoderError::DecodeTimeout) => {
                            warn!("decoder is not keeping up");
                            break;
                        }
                        Err(de) => {
                            error!("fatal decoder error: {de}");
                            p_state.unload(State::Errored(de.to_string()));
                            continue 'external;
                        }
                    }
                }
            }
        }

        // Prevent this from hogging a core
        thread::sleep(LOOP_DELAY_US.saturating_sub(timer.elapsed()));
    }
}
