//! Where songs come from: a directory, a file of paths, or a list of radio
//! stations.

use std::{
    fs,
    path::{Path, PathBuf},
};

use fluent_uri::Uri;
use log::{debug, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::utils::{self, UriError};

/// Extensions picked up when scanning a directory.
pub const DEFAULT_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "wav", "m4a", "aac"];

#[derive(Error, Debug)]
pub enum PlaylistError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not scan {path}: {source}")]
    Scan {
        path: PathBuf,
        source: walkdir::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PlaylistError + '_ {
    move |source| PlaylistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Display name, stations have one
    pub name: Option<String>,
    /// Local path or URL
    pub location: String,
}

impl Entry {
    pub fn new<S: Into<String>>(location: S) -> Self {
        Self {
            name: None,
            location: location.into(),
        }
    }

    pub fn named<S: Into<String>, L: Into<String>>(name: S, location: L) -> Self {
        Self {
            name: Some(name.into()),
            location: location.into(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.location)
    }

    pub fn to_uri(&self) -> Result<Uri<String>, UriError> {
        utils::make_uri(&self.location)
    }
}

/// An ordered list of entries with a cursor.
///
/// The cursor starts before the first entry, so the first call to
/// [`Playlist::next`] yields entry 0.
#[derive(Debug, Default, Clone)]
pub struct Playlist {
    entries: Vec<Entry>,
    cursor: Option<usize>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every file directly inside `dir` whose extension is in `extensions`,
    /// in name order.
    pub fn scan_dir<P: AsRef<Path>>(dir: P, extensions: &[&str]) -> Result<Self, PlaylistError> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(true)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|source| PlaylistError::Scan {
                path: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();

            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
            if matches {
                paths.push(path);
            }
        }
        debug!("found {} songs in {}", paths.len(), dir.display());

        Ok(paths
            .into_iter()
            .map(|p| Entry::new(p.to_string_lossy()))
            .collect())
    }

    /// One path or URL per line, blank lines ignored.
    pub fn from_paths_file<P: AsRef<Path>>(path: P) -> Result<Self, PlaylistError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(io_err(path))?;

        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(Entry::new)
            .collect())
    }

    /// `name=url` per line.
    pub fn from_stations_file<P: AsRef<Path>>(path: P) -> Result<Self, PlaylistError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(io_err(path))?;

        let mut playlist = Playlist::new();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.split_once('=') {
                Some((name, url)) if !url.trim().is_empty() => {
                    playlist.push(Entry::named(name.trim(), url.trim()))
                }
                _ => warn!("skipping station line without a url: {line}"),
            }
        }

        Ok(playlist)
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn current(&self) -> Option<&Entry> {
        self.entries.get(self.cursor?)
    }

    /// Advance and return the new current entry, `None` past the end.
    pub fn next(&mut self) -> Option<&Entry> {
        let next = self.cursor.map_or(0, |c| c + 1);
        if next >= self.entries.len() {
            self.cursor = Some(self.entries.len());
            return None;
        }
        self.cursor = Some(next);
        self.current()
    }

    /// Step back, staying on the first entry.
    pub fn previous(&mut self) -> Option<&Entry> {
        if self.entries.is_empty() {
            return None;
        }
        let prev = self.cursor.map_or(0, |c| c.saturating_sub(1)).min(self.entries.len() - 1);
        self.cursor = Some(prev);
        self.current()
    }
}

impl FromIterator<Entry> for Playlist {
    fn from_iter<T: IntoIterator<Item = Entry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            cursor: None,
        }
    }
}

impl Extend<Entry> for Playlist {
    fn extend<T: IntoIterator<Item = Entry>>(&mut self, iter: T) {
        self.entries.extend(iter)
    }
}
