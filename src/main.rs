use std::io::{self, BufRead as _, Write as _};
use std::path::PathBuf;
use std::thread::{self, sleep};

use anyhow::{bail, Context as _};
use chrono::Duration;
use clap::Parser;
use crossbeam::channel::{self, Receiver};

use mixdeck::control::{self, Command, Outcome};
use mixdeck::playlist::{Entry, Playlist, DEFAULT_EXTENSIONS};
use mixdeck::{NullOutput, Player, PlayerConfig, State, Volume};

#[derive(Parser, Debug)]
#[command(version, about = "Plays files, folders and internet radio from the terminal.",
          long_about = "Plays files, folders and internet radio from the terminal.\n\n\
                        While playing, type a command and press enter: \
                        p (pause/resume), n (next), b (previous), + / - (volume), \
                        v <0-100>, seek <mm:ss>, s (stop), q (quit).")]
struct Invocation {
    /// Files, folders or http(s) URLs to play, in order.
    inputs: Vec<String>,
    /// A text file with one path or URL per line.
    #[arg(short, long)]
    list: Option<PathBuf>,
    /// A text file of `name=url` radio stations.
    #[arg(short, long)]
    stations: Option<PathBuf>,
    /// Starting volume, 0 to 100.
    #[arg(short, long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: u8,
    /// Preferred output sample rate.
    #[arg(long, default_value_t = 44_100)]
    rate: u32,
    /// Output buffer length in milliseconds.
    #[arg(long, default_value_t = 200)]
    buffer_ms: usize,
    /// Decode without an audio device, at playback speed.
    #[arg(long)]
    null_output: bool,
    /// Don't print the timer.
    #[arg(short, long)]
    quiet: bool,
}

const TIMER_REFRESH: std::time::Duration = std::time::Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    colog::init();
    let invocation = Invocation::parse();

    let mut playlist = build_playlist(&invocation)?;
    if playlist.is_empty() {
        bail!("nothing to play, give a file, folder, URL, --list or --stations");
    }

    let config = PlayerConfig {
        sample_rate: invocation.rate,
        buffer_ms: invocation.buffer_ms,
        volume: Volume::from_percent(invocation.volume),
        ..Default::default()
    };
    let mut player = if invocation.null_output {
        Player::with_output(config, NullOutput::factory(true))?
    } else {
        Player::new(config)?
    };

    let commands = spawn_command_reader();

    let mut next = playlist.next().cloned();
    while let Some(entry) = next.take() {
        match play_entry(&mut player, &entry, &commands, invocation.quiet) {
            Ok(Outcome::Quit) => break,
            Ok(Outcome::Previous) => next = playlist.previous().cloned(),
            Ok(_) => next = playlist.next().cloned(),
            Err(e) => {
                log::error!("could not play \"{}\": {e:#}", entry.display_name());
                next = playlist.next().cloned();
            }
        }
    }

    player.stop()?;
    println!("Done");
    Ok(())
}

fn build_playlist(invocation: &Invocation) -> anyhow::Result<Playlist> {
    let mut playlist = Playlist::new();

    for input in &invocation.inputs {
        if PathBuf::from(input).is_dir() {
            let found = Playlist::scan_dir(input, DEFAULT_EXTENSIONS)?;
            playlist.extend(found.entries().iter().cloned());
        } else {
            playlist.push(Entry::new(input.as_str()));
        }
    }
    if let Some(list) = &invocation.list {
        playlist.extend(Playlist::from_paths_file(list)?.entries().iter().cloned());
    }
    if let Some(stations) = &invocation.stations {
        playlist.extend(Playlist::from_stations_file(stations)?.entries().iter().cloned());
    }

    Ok(playlist)
}

/// Read commands from stdin on their own thread.
fn spawn_command_reader() -> Receiver<Command> {
    let (send, recv) = channel::unbounded();
    let _ = thread::Builder::new()
        .name("command_reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(c) => {
                        if send.send(c).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("{e}"),
                }
            }
        });
    recv
}

fn play_entry(
    player: &mut Player,
    entry: &Entry,
    commands: &Receiver<Command>,
    quiet: bool,
) -> anyhow::Result<Outcome> {
    let uri = entry.to_uri()?;
    println!("Playing \"{}\"", entry.display_name());
    player.load_new(&uri).context("loading")?;
    player.play()?;

    // Set by a stop command, so the track waits to be played again instead
    // of counting as finished
    let mut held = false;
    loop {
        sleep(TIMER_REFRESH);

        while let Ok(command) = commands.try_recv() {
            match control::apply_or_warn(player, command) {
                Outcome::Continue => (),
                other => {
                    end_timer(quiet);
                    return Ok(other);
                }
            }
            held = command == Command::Stop || (held && player.state() == State::Stopped);
        }

        if !quiet {
            print_timer(player.position(), player.duration(), player.progress())?;
        }
        if held {
            continue;
        }

        match player.check_finished() {
            Ok(true) => break,
            Ok(false) => (),
            Err(e) => {
                end_timer(quiet);
                return Err(e.into());
            }
        }
    }

    end_timer(quiet);
    Ok(Outcome::Next)
}

fn format_time(time: Option<std::time::Duration>) -> String {
    match time.and_then(|t| Duration::from_std(t).ok()) {
        Some(p) => format!(
            "{:02}:{:02}:{:02}.{:03}",
            p.num_seconds() / 3600,
            (p.num_seconds() / 60) % 60,
            p.num_seconds() % 60,
            p.num_milliseconds() % 1000
        ),
        None => "--:--:--.---".to_string(),
    }
}

fn print_timer(
    pos: Option<std::time::Duration>,
    len: Option<std::time::Duration>,
    progress: Option<f64>,
) -> io::Result<()> {
    let percent = match progress {
        Some(p) => format!(" {:3.0}%", p * 100.0),
        None => String::new(),
    };

    print!("{} / {}{}\r", format_time(pos), format_time(len), percent);
    io::stdout().flush()
}

fn end_timer(quiet: bool) {
    if !quiet {
        println!();
    }
}
