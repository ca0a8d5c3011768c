#![cfg(feature = "symphonia")]

mod common;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use common::{OutputEvents, StuckOutput};

use mixdeck::control::{self, Command, Outcome};
use mixdeck::decode::media_duration;
use mixdeck::{spawn_watcher, NullOutput, Player, PlayerConfig, PlayerError, State};

const POLL: Duration = Duration::from_millis(20);

fn stuck_player(events: &Arc<OutputEvents>) -> Player {
    let config = PlayerConfig {
        poll_interval: POLL,
        ..Default::default()
    };
    Player::with_output(config, StuckOutput::factory(Arc::clone(events))).unwrap()
}

fn player(realtime: bool) -> Player {
    let config = PlayerConfig {
        poll_interval: POLL,
        ..Default::default()
    };
    Player::with_output(config, NullOutput::factory(realtime)).unwrap()
}

#[test]
fn plays_to_the_end_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "short.wav", 44_100, 2, Duration::from_millis(500));

    let mut player = player(false);
    player.load_path(&song).unwrap();
    assert_eq!(player.state(), State::Stopped);
    assert_eq!(player.position(), Some(Duration::ZERO));

    let len = player.duration().unwrap();
    assert!(len.abs_diff(Duration::from_millis(500)) < Duration::from_millis(10));

    player.play().unwrap();
    player.wait_until_finished(POLL).unwrap();

    assert_eq!(player.state(), State::Stopped);
    assert_eq!(player.position(), None);
    assert!(!player.is_active());
}

#[test]
fn play_blocking_returns_after_the_song() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "mono.wav", 22_050, 1, Duration::from_millis(300));
    let uri = mixdeck::utils::path_to_uri(&song).unwrap();

    let mut player = player(false);
    player.play_blocking(&uri).unwrap();

    assert_eq!(player.state(), State::Stopped);
    assert_eq!(player.current_uri(), Some(&uri));
}

#[test]
fn nothing_loaded() {
    let mut player = player(false);

    assert!(matches!(player.play(), Err(PlayerError::NothingLoaded)));
    assert!(matches!(player.seek(Duration::from_secs(1)), Err(PlayerError::NothingLoaded)));
    assert_eq!(player.position(), None);
    assert_eq!(player.progress(), None);

    // Pausing and resuming an idle player is harmless
    player.pause().unwrap();
    player.resume().unwrap();
    assert_eq!(player.state(), State::Stopped);
}

#[test]
fn missing_and_broken_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut player = player(false);

    let missing = dir.path().join("nope.wav");
    assert!(matches!(player.load_path(&missing), Err(PlayerError::Uri(_))));

    let broken = dir.path().join("broken.wav");
    fs::write(&broken, b"this is not audio at all").unwrap();
    assert!(matches!(player.load_path(&broken), Err(PlayerError::DecoderError(_))));
    assert_eq!(player.position(), None);
}

#[test]
fn pause_holds_the_position() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "long.wav", 44_100, 2, Duration::from_secs(3));

    let mut player = player(true);
    player.load_path(&song).unwrap();
    player.play().unwrap();
    assert_eq!(player.state(), State::Playing);
    sleep(Duration::from_millis(300));

    player.pause().unwrap();
    assert_eq!(player.state(), State::Paused);
    let held = player.position().unwrap();
    assert!(held > Duration::ZERO);

    sleep(Duration::from_millis(250));
    assert_eq!(player.position(), Some(held));
    assert!(!player.check_finished().unwrap());

    player.resume().unwrap();
    assert_eq!(player.state(), State::Playing);
    sleep(Duration::from_millis(250));
    assert!(player.position().unwrap() > held);

    player.stop().unwrap();
}

#[test]
fn seek_moves_the_position() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "seek.wav", 44_100, 2, Duration::from_secs(5));

    let mut player = player(true);
    player.load_path(&song).unwrap();
    player.play().unwrap();
    sleep(Duration::from_millis(100));

    player.seek(Duration::from_secs(3)).unwrap();
    let pos = player.position().unwrap();
    assert!(pos >= Duration::from_secs(3), "{pos:?}");
    assert!(pos < Duration::from_millis(3500), "{pos:?}");

    let progress = player.progress().unwrap();
    assert!((0.6..0.7).contains(&progress), "{progress}");

    player.stop().unwrap();
}

#[test]
fn play_after_stop_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "again.wav", 44_100, 2, Duration::from_secs(3));

    let mut player = player(true);
    player.load_path(&song).unwrap();
    player.play().unwrap();
    sleep(Duration::from_millis(700));
    assert!(player.position().unwrap() >= Duration::from_millis(500));

    player.stop().unwrap();
    assert_eq!(player.state(), State::Stopped);
    assert_eq!(player.position(), None);

    player.play().unwrap();
    assert_eq!(player.state(), State::Playing);
    assert!(player.position().unwrap() < Duration::from_millis(500));

    player.stop().unwrap();
}

#[test]
fn volume_controls() {
    let mut player = player(false);
    assert_eq!(player.volume_percent(), 50);

    player.set_volume_percent(80).unwrap();
    assert_eq!(player.volume_percent(), 80);

    assert_eq!(control::apply(&mut player, Command::VolumeUp).unwrap(), Outcome::Continue);
    assert_eq!(player.volume_percent(), 85);

    control::apply(&mut player, Command::Volume(100)).unwrap();
    control::apply(&mut player, Command::VolumeUp).unwrap();
    assert_eq!(player.volume_percent(), 100);

    control::apply(&mut player, Command::Volume(3)).unwrap();
    control::apply(&mut player, Command::VolumeDown).unwrap();
    assert_eq!(player.volume_percent(), 0);
}

#[test]
fn commands_drive_the_player() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "cmd.wav", 44_100, 2, Duration::from_secs(3));

    let mut player = player(true);
    player.load_path(&song).unwrap();

    // Toggling a loaded, stopped player starts it
    control::apply(&mut player, "p".parse().unwrap()).unwrap();
    assert_eq!(player.state(), State::Playing);
    control::apply(&mut player, "p".parse().unwrap()).unwrap();
    assert_eq!(player.state(), State::Paused);
    control::apply(&mut player, "resume".parse().unwrap()).unwrap();
    assert_eq!(player.state(), State::Playing);

    assert_eq!(control::apply(&mut player, Command::Next).unwrap(), Outcome::Next);
    assert_eq!(control::apply(&mut player, Command::Previous).unwrap(), Outcome::Previous);
    assert_eq!(control::apply(&mut player, Command::Quit).unwrap(), Outcome::Quit);
    assert_eq!(player.state(), State::Playing);

    control::apply(&mut player, "s".parse().unwrap()).unwrap();
    assert_eq!(player.state(), State::Stopped);
}

#[test]
fn watcher_runs_until_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "watched.wav", 44_100, 2, Duration::from_millis(600));

    let mut player = player(true);
    player.load_path(&song).unwrap();
    player.play().unwrap();
    let player = Arc::new(Mutex::new(player));

    let ticks = Arc::new(Mutex::new(Vec::new()));
    let handle = spawn_watcher(Arc::clone(&player), Duration::from_millis(50), {
        let ticks = Arc::clone(&ticks);
        move |pos, len| ticks.lock().unwrap().push((pos, len))
    })
    .unwrap();

    // The player stays usable while the watcher runs
    player.lock().unwrap().set_volume_percent(30).unwrap();

    handle.join().unwrap().unwrap();

    let player = player.lock().unwrap();
    assert_eq!(player.state(), State::Stopped);
    assert_eq!(player.volume_percent(), 30);

    let ticks = ticks.lock().unwrap();
    assert!(ticks.len() > 1);
    assert!(ticks.iter().any(|(pos, _)| pos.is_some()));
    assert!(ticks.iter().all(|(_, len)| len.is_some()));
}

#[test]
fn reads_media_duration() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "length.wav", 48_000, 2, Duration::from_millis(1500));

    let len = media_duration(&song).unwrap();
    assert!(len.abs_diff(Duration::from_millis(1500)) < Duration::from_millis(10));
    assert_eq!(media_duration(dir.path().join("missing.wav")), None);
}

#[test]
fn halts_a_stream_whose_tail_never_drains() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "tail.wav", 44_100, 2, Duration::from_millis(500));

    let events = Arc::new(OutputEvents::default());
    let mut player = stuck_player(&events);
    player.load_path(&song).unwrap();
    player.play().unwrap();

    // Everything is decoded at once, after which only the tail is left
    sleep(Duration::from_millis(200));
    assert_eq!(player.state(), State::Playing);
    assert!(matches!(player.seek(Duration::ZERO), Err(PlayerError::Draining)));

    player.wait_until_finished(POLL).unwrap();
    assert_eq!(player.state(), State::Stopped);
    assert_eq!(player.position(), None);
}

#[test]
fn dropping_the_player_closes_the_output() {
    let events = Arc::new(OutputEvents::default());
    let mut player = stuck_player(&events);

    // Leaves a message queued that the thread doesn't answer
    player.set_volume_percent(20).unwrap();
    drop(player);

    let start = Instant::now();
    while !events.dropped.load(Ordering::SeqCst) {
        assert!(start.elapsed() < Duration::from_secs(2), "playback thread never exited");
        sleep(Duration::from_millis(10));
    }
}

#[test]
fn device_pauses_before_the_clock() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "steps.wav", 44_100, 2, Duration::from_secs(2));

    let events = Arc::new(OutputEvents::default());
    let mut player = stuck_player(&events);
    player.load_path(&song).unwrap();
    player.play().unwrap();

    player.pause().unwrap();
    player.resume().unwrap();
    player.pause().unwrap();
    player.stop().unwrap();

    assert!(!events.pause_out_of_step.load(Ordering::SeqCst));
}

#[test]
fn refused_commands_keep_the_song() {
    let dir = tempfile::tempdir().unwrap();
    let song = common::sine_wav(&dir, "keep.wav", 44_100, 2, Duration::from_secs(3));

    let mut player = player(true);
    player.load_path(&song).unwrap();
    player.play().unwrap();
    control::apply(&mut player, Command::Stop).unwrap();

    // Nothing to seek in after a stop
    assert!(control::apply(&mut player, Command::Seek(Duration::from_secs(1))).is_err());
    assert_eq!(
        control::apply_or_warn(&mut player, Command::Seek(Duration::from_secs(1))),
        Outcome::Continue
    );

    assert_eq!(control::apply_or_warn(&mut player, Command::TogglePause), Outcome::Continue);
    assert_eq!(player.state(), State::Playing);
    assert_eq!(control::apply_or_warn(&mut player, Command::Next), Outcome::Next);

    player.stop().unwrap();
}
