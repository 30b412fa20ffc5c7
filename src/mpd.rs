//! Blocking client for the MPD text protocol.
//!
//! The playback monitor talks to MPD synchronously by design: it spends its
//! life inside a blocking `idle` wait and only wakes up for player events.
//! This wrapper covers the handful of commands the daemon needs —
//! `currentsong`, `status`, `idle`/`noidle` — over a plain TCP connection.
//!
//! An [`InterruptHandle`] clones the socket so another thread (the signal
//! handler) can abort an in-progress idle wait by sending `noidle`; that is
//! the only cross-thread access the protocol permits.

use std::{
    io::{self, BufRead, BufReader, Write},
    net::TcpStream,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),

    /// An `ACK` failure response from the server.
    #[error("MPD error: {0}")]
    Server(String),

    #[error("malformed MPD response: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Player state as reported by `status`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PlayState {
    Play,
    Pause,
    Stop,
}

/// Snapshot of the `status` fields the daemon cares about.
#[derive(Copy, Clone, Debug)]
pub struct Status {
    pub state: PlayState,
    /// Elapsed time within the current song, in whole seconds.
    pub elapsed: u64,
}

impl Status {
    fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut state = None;
        let mut elapsed = 0;

        for (key, value) in pairs {
            match key.as_str() {
                "state" => {
                    state = Some(match value.as_str() {
                        "play" => PlayState::Play,
                        "pause" => PlayState::Pause,
                        "stop" => PlayState::Stop,
                        other => {
                            return Err(Error::Protocol(format!("unknown player state: {other}")))
                        }
                    });
                }
                "elapsed" => {
                    elapsed = value.parse::<f64>().unwrap_or_default() as u64;
                }
                // Older servers only report "time: elapsed:total".
                "time" => {
                    if elapsed == 0 {
                        if let Some((head, _)) = value.split_once(':') {
                            elapsed = head.parse().unwrap_or_default();
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            state: state.ok_or_else(|| Error::Protocol("status without state".to_string()))?,
            elapsed,
        })
    }
}

/// Snapshot of the current song.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Song {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub track: String,
    pub mbid: String,
    pub album_artist: String,
    /// Track length in whole seconds.
    pub duration: u64,
    /// Queue song id; the identity used to detect song changes.
    pub id: u64,
    /// Position in the queue.
    pub pos: u64,
}

impl Song {
    fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut song = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "Artist" => song.artist = value.clone(),
                "Title" => song.title = value.clone(),
                "Album" => song.album = value.clone(),
                "Track" => song.track = value.clone(),
                "MUSICBRAINZ_TRACKID" => song.mbid = value.clone(),
                "AlbumArtist" => song.album_artist = value.clone(),
                "duration" => song.duration = value.parse::<f64>().unwrap_or_default() as u64,
                "Time" => {
                    if song.duration == 0 {
                        song.duration = value.parse().unwrap_or_default();
                    }
                }
                "Id" => song.id = value.parse().unwrap_or_default(),
                "Pos" => song.pos = value.parse().unwrap_or_default(),
                _ => {}
            }
        }
        song
    }
}

/// One connection to the MPD server.
pub struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    /// Connects and checks the server greeting.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        let reader = BufReader::new(stream.try_clone()?);
        let mut client = Self { stream, reader };

        let greeting = client.read_line()?;
        let Some(version) = greeting.strip_prefix("OK MPD ") else {
            return Err(Error::Protocol(format!(
                "unexpected greeting: {greeting}"
            )));
        };
        debug!("connected to MPD {version}");

        Ok(client)
    }

    /// A handle that can abort this connection's idle wait from another
    /// thread.
    pub fn interrupt_handle(&self) -> Result<InterruptHandle> {
        Ok(InterruptHandle {
            stream: self.stream.try_clone()?,
        })
    }

    /// The currently playing song, if any.
    pub fn current_song(&mut self) -> Result<Option<Song>> {
        let pairs = self.command("currentsong")?;
        if pairs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Song::from_pairs(&pairs)))
    }

    /// The player status.
    pub fn status(&mut self) -> Result<Status> {
        Status::from_pairs(&self.command("status")?)
    }

    /// Blocks until something changes in the given subsystems (or the wait
    /// is interrupted via [`InterruptHandle`]), returning the changed
    /// subsystem names. An interrupted wait returns an empty list.
    pub fn idle(&mut self, subsystems: &[&str]) -> Result<Vec<String>> {
        let command = if subsystems.is_empty() {
            "idle".to_string()
        } else {
            format!("idle {}", subsystems.join(" "))
        };

        Ok(self
            .command(&command)?
            .into_iter()
            .filter(|(key, _)| key == "changed")
            .map(|(_, value)| value)
            .collect())
    }

    /// Sends one command and collects the key-value response lines.
    fn command(&mut self, command: &str) -> Result<Vec<(String, String)>> {
        self.stream.write_all(format!("{command}\n").as_bytes())?;

        let mut pairs = Vec::new();
        loop {
            let line = self.read_line()?;
            if line == "OK" {
                return Ok(pairs);
            }
            if let Some(detail) = line.strip_prefix("ACK ") {
                return Err(Error::Server(detail.to_string()));
            }
            match line.split_once(':') {
                Some((key, value)) => {
                    pairs.push((key.to_string(), value.trim_start().to_string()));
                }
                None => return Err(Error::Protocol(format!("unexpected line: {line}"))),
            }
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(Error::Protocol("connection closed by server".to_string()));
        }
        Ok(line.trim_end_matches('\n').to_string())
    }
}

/// Aborts an in-progress idle wait by writing `noidle` on a cloned socket.
pub struct InterruptHandle {
    stream: TcpStream,
}

impl InterruptHandle {
    /// Best-effort interrupt; a failure here only delays shutdown until the
    /// next player event, so it is logged and swallowed.
    pub fn interrupt(&self) {
        if let Err(e) = (&self.stream).write_all(b"noidle\n") {
            warn!("failed to interrupt MPD idle wait: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, thread};

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn song_parses_tags_and_numbers() {
        let song = Song::from_pairs(&pairs(&[
            ("file", "music/x.flac"),
            ("Artist", "Someone"),
            ("Title", "Something"),
            ("Album", "Somewhere"),
            ("Track", "4"),
            ("AlbumArtist", "Someone Else"),
            ("MUSICBRAINZ_TRACKID", "11111111-2222-3333-4444-555555555555"),
            ("Time", "181"),
            ("duration", "180.772"),
            ("Pos", "3"),
            ("Id", "17"),
        ]));

        assert_eq!(song.artist, "Someone");
        assert_eq!(song.title, "Something");
        assert_eq!(song.album, "Somewhere");
        assert_eq!(song.track, "4");
        assert_eq!(song.album_artist, "Someone Else");
        assert_eq!(song.duration, 180);
        assert_eq!(song.id, 17);
        assert_eq!(song.pos, 3);
    }

    #[test]
    fn song_falls_back_to_integer_time() {
        let song = Song::from_pairs(&pairs(&[("Time", "181")]));
        assert_eq!(song.duration, 181);
    }

    #[test]
    fn status_parses_state_and_elapsed() {
        let status =
            Status::from_pairs(&pairs(&[("state", "play"), ("elapsed", "12.345")])).unwrap();
        assert_eq!(status.state, PlayState::Play);
        assert_eq!(status.elapsed, 12);

        let old = Status::from_pairs(&pairs(&[("state", "pause"), ("time", "42:180")])).unwrap();
        assert_eq!(old.elapsed, 42);

        assert!(Status::from_pairs(&pairs(&[("elapsed", "1")])).is_err());
    }

    #[test]
    fn talks_to_a_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"OK MPD 0.23.5\n").unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());

            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "currentsong\n");
            socket
                .write_all(b"file: x.flac\nArtist: Someone\nTitle: Something\nduration: 180.5\nId: 7\nOK\n")
                .unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "status\n");
            socket.write_all(b"ACK [2@0] {status} not today\n").unwrap();
        });

        let mut client = Client::connect(&addr.ip().to_string(), addr.port()).unwrap();

        let song = client.current_song().unwrap().expect("a song");
        assert_eq!(song.artist, "Someone");
        assert_eq!(song.duration, 180);
        assert_eq!(song.id, 7);

        assert!(matches!(client.status(), Err(Error::Server(_))));

        server.join().unwrap();
    }

    #[test]
    fn idle_collects_changed_subsystems() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"OK MPD 0.23.5\n").unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());

            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "idle player\n");

            // Interrupt arrives while idling; answer with no events.
            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "noidle\n");
            socket.write_all(b"OK\n").unwrap();
        });

        let mut client = Client::connect(&addr.ip().to_string(), addr.port()).unwrap();
        let handle = client.interrupt_handle().unwrap();
        let interrupter = thread::spawn(move || {
            // Give the idle command time to hit the wire first.
            thread::sleep(std::time::Duration::from_millis(50));
            handle.interrupt();
        });

        let changed = client.idle(&["player"]).unwrap();
        assert!(changed.is_empty());

        interrupter.join().unwrap();
        server.join().unwrap();
    }
}
