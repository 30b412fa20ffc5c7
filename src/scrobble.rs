//! Scrobble reports and the scrobbler contract.
//!
//! A [`ScrobbleEntry`] is one durable report that a track finished playing
//! (or, for now-playing pushes, just started). Entries waiting for a
//! successful submission live in a [`PendingQueue`], ordered by the time the
//! play started. [`Scrobbler`] is the contract the playback monitor drives;
//! [`build`] fabricates a scrobbler from its configuration section.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    audioscrobbler::{self, AudioScrobbler},
    config::{self, Section},
    mpd::Song,
    reactor::Reactor,
    transport::TlsContext,
};

/// Errors surfaced by scrobbler operations and fabrication.
#[derive(Error, Debug)]
pub enum Error {
    /// The instance's fail latch is set; nothing is sent until restart.
    #[error("one or more previous scrobbles failed")]
    Failed,

    #[error(transparent)]
    Config(#[from] config::Error),

    #[error("invalid target URL: {0}")]
    Target(#[from] url::ParseError),

    #[error("unknown scrobbler protocol: {0}")]
    UnknownProtocol(String),

    #[error(transparent)]
    Submit(#[from] audioscrobbler::SubmitError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// One track report.
///
/// Tag fields are plain strings with the empty string meaning "not known";
/// they are omitted from the persisted form. `timestamp` is when the play
/// started (epoch seconds) and doubles as the queue identity: two entries
/// with the same timestamp are indistinguishable to the retry queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrobbleEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artist: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub track: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub album: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub track_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mbid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub album_artist: String,

    /// Track length in seconds.
    #[serde(default, skip_serializing_if = "zero_u64")]
    pub duration: u64,

    /// When the play started, in epoch seconds.
    #[serde(default, skip_serializing_if = "zero_i64")]
    pub timestamp: i64,

    /// How long the track actually played, in seconds.
    #[serde(default, skip_serializing_if = "zero_u64")]
    pub elapsed: u64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn zero_u64(value: &u64) -> bool {
    *value == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn zero_i64(value: &i64) -> bool {
    *value == 0
}

impl ScrobbleEntry {
    /// Fills out an entry with the tags of an MPD song.
    ///
    /// `timestamp` and `elapsed` are playback state, not song state; the
    /// caller sets them from its own accounting.
    #[must_use]
    pub fn from_song(song: &Song) -> Self {
        Self {
            artist: song.artist.clone(),
            track: song.title.clone(),
            album: song.album.clone(),
            track_number: song.track.clone(),
            mbid: song.mbid.clone(),
            album_artist: song.album_artist.clone(),
            duration: song.duration,
            ..Self::default()
        }
    }
}

/// Entries awaiting a successful submission, oldest play first.
///
/// Keyed strictly by `timestamp`: inserting an entry whose timestamp is
/// already present keeps the existing entry and drops the new one.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: BTreeMap<i64, ScrobbleEntry>,
}

impl PendingQueue {
    /// Inserts an entry unless one with the same timestamp is already queued.
    pub fn insert(&mut self, entry: ScrobbleEntry) {
        self.entries.entry(entry.timestamp).or_insert(entry);
    }

    /// Puts back entries that failed to submit.
    pub fn restore<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = ScrobbleEntry>,
    {
        for entry in entries {
            self.insert(entry);
        }
    }

    /// Removes and returns up to `max` entries with the oldest timestamps.
    pub fn take_oldest(&mut self, max: usize) -> Vec<ScrobbleEntry> {
        let keys: Vec<i64> = self.entries.keys().take(max).copied().collect();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clones the queued entries in timestamp order, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ScrobbleEntry> {
        self.entries.values().cloned().collect()
    }
}

impl FromIterator<ScrobbleEntry> for PendingQueue {
    fn from_iter<I: IntoIterator<Item = ScrobbleEntry>>(iter: I) -> Self {
        let mut queue = Self::default();
        queue.restore(iter);
        queue
    }
}

/// The contract a scrobbling back-end implements.
///
/// Calls are made synchronously from the playback monitor; implementations
/// schedule their network work on the reactor and return without blocking.
pub trait Scrobbler: Send {
    /// Whether a finished track qualifies for scrobbling at all.
    fn check_preconditions(&self, entry: &ScrobbleEntry) -> bool;

    /// Best-effort push of the track that just started playing.
    ///
    /// Failures are logged, never retried and never cached.
    fn now_playing(&self, entry: &ScrobbleEntry) -> Result<(), Error>;

    /// Durably reports a finished track.
    ///
    /// The entry is queued before submission and survives failures and
    /// process restarts until a batch containing it is acknowledged.
    fn scrobble(&self, entry: &ScrobbleEntry) -> Result<(), Error>;

    /// An explicit retry opportunity for queued entries.
    fn flush(&self) {}
}

/// Fabricates the scrobbler a configuration section describes.
///
/// The section name selects the protocol. A fabrication error skips only
/// this scrobbler; the caller decides whether any remain.
pub fn build(
    section: &Section,
    reactor: &Reactor,
    tls: &TlsContext,
) -> Result<Box<dyn Scrobbler>, Error> {
    match section.name() {
        "as20" => Ok(Box::new(AudioScrobbler::from_section(
            section,
            reactor.clone(),
            tls.clone(),
        )?)),
        other => Err(Error::UnknownProtocol(other.to_string())),
    }
}

/// Runs the interactive authentication flow for the named protocol.
pub fn authenticate(
    protocol: &str,
    handle: &tokio::runtime::Handle,
    tls: &TlsContext,
    target: Option<&str>,
    api_key: Option<&str>,
    api_secret: Option<&str>,
) -> Result<(), Error> {
    match protocol {
        "as20" => audioscrobbler::authenticate(handle, tls, target, api_key, api_secret),
        other => Err(Error::UnknownProtocol(other.to_string())),
    }
}
