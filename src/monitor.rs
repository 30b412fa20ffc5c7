//! The control loop: watch MPD, feed the scrobblers.
//!
//! Runs on its own (blocking) thread. Between player events it sits in
//! MPD's idle wait; the signal handler interrupts that wait through the
//! connection's [`InterruptHandle`](crate::mpd::InterruptHandle). All
//! scrobbler calls made from here only schedule network work and return.
//!
//! A scrobbler whose call fails is dropped from the active set for the rest
//! of the process; the loop itself fails only when no scrobbler remains.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

use crate::{
    mpd::{self, Client, PlayState, Song},
    scrobble::{self, ScrobbleEntry, Scrobbler},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("no scrobblers left")]
    NoScrobblers,

    #[error(transparent)]
    Mpd(#[from] mpd::Error),
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Tracks the current song and how long it has actually played.
///
/// Elapsed time accumulates across play/pause transitions with the wall
/// clock; MPD's own elapsed counter only seeds it at startup (the daemon may
/// attach mid-song).
#[derive(Debug)]
struct StateTracker {
    song: Option<Song>,
    /// When the current song started, in epoch seconds.
    start: i64,

    last_play: i64,
    elapsed: u64,
    paused: bool,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            song: None,
            start: 0,
            last_play: 0,
            elapsed: 0,
            paused: true,
        }
    }

    fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            let played = epoch_now().saturating_sub(self.last_play);
            self.elapsed += u64::try_from(played).unwrap_or_default();
        }
    }

    fn play(&mut self) {
        if self.paused {
            self.paused = false;
            self.last_play = epoch_now();
        }
    }

    fn new_song(&mut self, song: Song) {
        self.song = Some(song);
        self.start = epoch_now();
        self.elapsed = 0;
        self.paused = true;
        self.play();
    }

    fn clear(&mut self) {
        self.pause();
        self.song = None;
    }

    fn set_elapsed(&mut self, elapsed: u64) {
        self.elapsed = elapsed;
    }

    fn song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    fn start(&self) -> i64 {
        self.start
    }

    fn elapsed(&self) -> u64 {
        self.elapsed
    }
}

/// Runs `task` against every active scrobbler, dropping the ones that fail.
fn run_scrobbler_task<F>(scrobblers: &mut Vec<Box<dyn Scrobbler>>, mut task: F) -> Result<(), Error>
where
    F: FnMut(&dyn Scrobbler) -> Result<(), scrobble::Error>,
{
    scrobblers.retain(|scrobbler| match task(scrobbler.as_ref()) {
        Ok(()) => true,
        Err(e) => {
            error!("scrobbler operation failed: {e}");
            false
        }
    });

    if scrobblers.is_empty() {
        return Err(Error::NoScrobblers);
    }
    Ok(())
}

fn handle_player_event(
    client: &mut Client,
    tracker: &mut StateTracker,
    scrobblers: &mut Vec<Box<dyn Scrobbler>>,
) -> Result<(), Error> {
    let status = client.status()?;
    let current = client.current_song()?;

    if status.state == PlayState::Play {
        tracker.play();
    } else {
        tracker.pause();
    }

    let changed = match (&current, tracker.song()) {
        (Some(now), Some(before)) => now.id != before.id,
        (None, None) => false,
        _ => true,
    };
    if !changed {
        return Ok(());
    }

    // The previous song is over; report it if it played long enough.
    if let Some(finished) = tracker.song().cloned() {
        tracker.pause();
        let mut entry = ScrobbleEntry::from_song(&finished);
        entry.timestamp = tracker.start();
        entry.elapsed = tracker.elapsed();

        run_scrobbler_task(scrobblers, |scrobbler| {
            if scrobbler.check_preconditions(&entry) {
                scrobbler.scrobble(&entry)
            } else {
                Ok(())
            }
        })?;
    }

    match current {
        Some(song) => {
            let entry = ScrobbleEntry::from_song(&song);
            tracker.new_song(song);
            run_scrobbler_task(scrobblers, |scrobbler| scrobbler.now_playing(&entry))?;
        }
        None => tracker.clear(),
    }

    Ok(())
}

/// Watches MPD until `stop` is raised or no scrobbler remains.
pub fn run(
    client: &mut Client,
    scrobblers: &mut Vec<Box<dyn Scrobbler>>,
    stop: &AtomicBool,
) -> Result<(), Error> {
    let mut tracker = StateTracker::new();

    // Entries reloaded from a previous run should not wait for the next
    // song change.
    for scrobbler in scrobblers.iter() {
        scrobbler.flush();
    }

    let song = client.current_song()?;
    let status = client.status()?;
    if let Some(song) = song {
        if status.state == PlayState::Play {
            let entry = ScrobbleEntry::from_song(&song);
            tracker.new_song(song);
            tracker.set_elapsed(status.elapsed);
            run_scrobbler_task(scrobblers, |scrobbler| scrobbler.now_playing(&entry))?;
        }
    }

    while !stop.load(Ordering::SeqCst) {
        let changed = client.idle(&["player"])?;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if changed.is_empty() {
            continue;
        }

        if changed.iter().any(|subsystem| subsystem == "player") {
            debug!("received player event");
            handle_player_event(client, &mut tracker, scrobblers)?;
        } else {
            error!("received unknown event: {changed:?}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording {
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Scrobbler for Recording {
        fn check_preconditions(&self, entry: &ScrobbleEntry) -> bool {
            entry.duration > 30 && entry.elapsed > 240.min(entry.duration / 2)
        }

        fn now_playing(&self, entry: &ScrobbleEntry) -> Result<(), scrobble::Error> {
            if self.fail {
                return Err(scrobble::Error::Failed);
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("now_playing {}", entry.track));
            Ok(())
        }

        fn scrobble(&self, entry: &ScrobbleEntry) -> Result<(), scrobble::Error> {
            if self.fail {
                return Err(scrobble::Error::Failed);
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("scrobble {}", entry.track));
            Ok(())
        }
    }

    #[test]
    fn failing_scrobblers_are_dropped() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut scrobblers: Vec<Box<dyn Scrobbler>> = vec![
            Box::new(Recording {
                fail: true,
                calls: Arc::clone(&calls),
            }),
            Box::new(Recording {
                fail: false,
                calls: Arc::clone(&calls),
            }),
        ];

        let entry = ScrobbleEntry {
            track: "Something".to_string(),
            ..ScrobbleEntry::default()
        };
        run_scrobbler_task(&mut scrobblers, |s| s.now_playing(&entry)).unwrap();

        assert_eq!(scrobblers.len(), 1);
        assert_eq!(calls.lock().unwrap().as_slice(), ["now_playing Something"]);
    }

    #[test]
    fn losing_every_scrobbler_is_fatal() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut scrobblers: Vec<Box<dyn Scrobbler>> = vec![Box::new(Recording {
            fail: true,
            calls,
        })];

        let entry = ScrobbleEntry::default();
        let result = run_scrobbler_task(&mut scrobblers, |s| s.scrobble(&entry));
        assert!(matches!(result, Err(Error::NoScrobblers)));
    }

    #[test]
    fn tracker_seeds_and_resets() {
        let mut tracker = StateTracker::new();
        assert!(tracker.song().is_none());

        let song = Song {
            title: "Something".to_string(),
            id: 9,
            ..Song::default()
        };
        tracker.new_song(song);
        assert!(tracker.start() > 0);
        assert_eq!(tracker.elapsed(), 0);

        // Attaching mid-song: MPD's counter seeds the accounting.
        tracker.set_elapsed(95);
        assert_eq!(tracker.elapsed(), 95);

        tracker.pause();
        assert!(tracker.elapsed() >= 95);

        tracker.clear();
        assert!(tracker.song().is_none());
    }
}
