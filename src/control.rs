//! Commands a front-end can send to the player.

use std::{str::FromStr, time::Duration};

use log::{info, warn};
use thiserror::Error;

use crate::{Player, PlayerError, State};

/// How far one volume step moves, in percent.
pub const VOLUME_STEP: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TogglePause,
    Pause,
    Resume,
    Next,
    Previous,
    Stop,
    VolumeUp,
    VolumeDown,
    Volume(u8),
    Seek(Duration),
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command \"{0}\"")]
    Unknown(String),

    #[error("\"{0}\" needs an argument")]
    MissingArgument(String),

    #[error("Invalid volume \"{0}\", expected 0 to 100")]
    InvalidVolume(String),

    #[error("Invalid time \"{0}\", expected seconds, mm:ss or hh:mm:ss")]
    InvalidTime(String),
}

/// Parse `90`, `1:30` or `1:01:30` into a duration.
pub fn parse_time(input: &str) -> Result<Duration, ControlError> {
    let invalid = || ControlError::InvalidTime(input.to_string());

    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() > 3 {
        return Err(invalid());
    }

    let (last, rest) = parts.split_last().ok_or_else(invalid)?;
    let seconds: f64 = last.parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds < 0.0 || (!rest.is_empty() && seconds >= 60.0) {
        return Err(invalid());
    }

    let mut whole = 0u64;
    for (i, part) in rest.iter().enumerate() {
        let v: u64 = part.parse().map_err(|_| invalid())?;
        // minutes are capped only when hours are given
        if i == 1 && v >= 60 {
            return Err(invalid());
        }
        whole = whole
            .checked_mul(60)
            .and_then(|w| w.checked_add(v))
            .ok_or_else(invalid)?;
    }

    let whole = whole.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid)?;
    let fraction = Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
    whole.checked_add(fraction).ok_or_else(invalid)
}

impl FromStr for Command {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next().ok_or(ControlError::Empty)?.to_lowercase();
        let arg = words.next();

        let needs_arg = || arg.ok_or_else(|| ControlError::MissingArgument(verb.clone()));

        Ok(match verb.as_str() {
            "p" | "space" | "toggle" => Command::TogglePause,
            "pause" => Command::Pause,
            "resume" | "r" => Command::Resume,
            "n" | "next" | ">" => Command::Next,
            "b" | "prev" | "previous" | "<" => Command::Previous,
            "s" | "stop" => Command::Stop,
            "+" | "up" => Command::VolumeUp,
            "-" | "down" => Command::VolumeDown,
            "v" | "vol" | "volume" => {
                let a = needs_arg()?;
                let v: u8 = a.parse().map_err(|_| ControlError::InvalidVolume(a.to_string()))?;
                if v > 100 {
                    return Err(ControlError::InvalidVolume(a.to_string()));
                }
                Command::Volume(v)
            }
            "seek" | "g" => Command::Seek(parse_time(needs_arg()?)?),
            "q" | "quit" | "exit" => Command::Quit,
            _ => return Err(ControlError::Unknown(verb.clone())),
        })
    }
}

/// What the front-end should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Next,
    Previous,
    Quit,
}

/// Forward `command` to `player`.
pub fn apply(player: &mut Player, command: Command) -> Result<Outcome, PlayerError> {
    match command {
        Command::TogglePause => match player.state() {
            State::Playing => player.pause()?,
            State::Paused => player.resume()?,
            _ => player.play()?,
        },
        Command::Pause => player.pause()?,
        Command::Resume => player.resume()?,
        Command::Stop => player.stop()?,
        Command::VolumeUp => {
            let v = player.volume_percent().saturating_add(VOLUME_STEP).min(100);
            player.set_volume_percent(v)?;
        }
        Command::VolumeDown => {
            let v = player.volume_percent().saturating_sub(VOLUME_STEP);
            player.set_volume_percent(v)?;
        }
        Command::Volume(v) => player.set_volume_percent(v)?,
        Command::Seek(pos) => player.seek(pos)?,
        Command::Next => return Ok(Outcome::Next),
        Command::Previous => return Ok(Outcome::Previous),
        Command::Quit => return Ok(Outcome::Quit),
    }
    info!("{command:?} -> {:?}, volume {}%", player.state(), player.volume_percent());

    Ok(Outcome::Continue)
}

/// Like [`apply`], but a command the player refuses is only logged.
///
/// A bad seek or a pause with nothing loaded must not end the current song.
pub fn apply_or_warn(player: &mut Player, command: Command) -> Outcome {
    match apply(player, command) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("{command:?} failed: {e}");
            Outcome::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_forms() {
        assert_eq!("p".parse(), Ok(Command::TogglePause));
        assert_eq!("  NEXT ".parse(), Ok(Command::Next));
        assert_eq!("<".parse(), Ok(Command::Previous));
        assert_eq!("+".parse(), Ok(Command::VolumeUp));
        assert_eq!("v 40".parse(), Ok(Command::Volume(40)));
        assert_eq!("q".parse(), Ok(Command::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("".parse::<Command>(), Err(ControlError::Empty));
        assert_eq!("dance".parse::<Command>(), Err(ControlError::Unknown("dance".to_string())));
        assert_eq!("v".parse::<Command>(), Err(ControlError::MissingArgument("v".to_string())));
        assert_eq!("v 101".parse::<Command>(), Err(ControlError::InvalidVolume("101".to_string())));
        assert_eq!("v loud".parse::<Command>(), Err(ControlError::InvalidVolume("loud".to_string())));
    }

    #[test]
    fn huge_seek_is_an_error() {
        assert_eq!(
            "seek 1e30".parse::<Command>(),
            Err(ControlError::InvalidTime("1e30".to_string()))
        );
    }

    #[test]
    fn parses_seek_times() {
        assert_eq!("seek 90".parse(), Ok(Command::Seek(Duration::from_secs(90))));
        assert_eq!("seek 1:30".parse(), Ok(Command::Seek(Duration::from_secs(90))));
        assert_eq!(parse_time("1:02:03"), Ok(Duration::from_secs(3723)));
        assert_eq!(parse_time("0.5"), Ok(Duration::from_millis(500)));
        // minutes may run long without hours
        assert_eq!(parse_time("75:00"), Ok(Duration::from_secs(4500)));
    }

    #[test]
    fn rejects_bad_times() {
        for bad in [
            "",
            "1:60",
            "1:60:00",
            "a:10",
            "-3",
            "1:2:3:4",
            "inf",
            "1e30",
            "999999999999999999:00",
            "99999999999999999:59:00",
        ] {
            assert!(parse_time(bad).is_err(), "{bad} should not parse");
        }
    }
}
