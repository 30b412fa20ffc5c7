//! End-to-end submission scenarios against a scripted local endpoint.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use url::Url;

use scrobd::{
    audioscrobbler::AudioScrobbler,
    reactor::Reactor,
    scrobble::{Error, ScrobbleEntry, Scrobbler},
    transport::TlsContext,
};

/// What the fake service does with one request.
enum Reply {
    /// Answer 200 with a JSON body.
    Json(&'static str),
    /// Drop the connection without answering.
    Hangup,
}

struct FakeApi {
    url: Url,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl FakeApi {
    fn request_count(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }

    fn body(&self, index: usize) -> String {
        self.bodies.lock().unwrap()[index].clone()
    }
}

/// Serves the scripted replies in order, recording each request body.
async fn serve(replies: Vec<Reply>) -> FakeApi {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bodies = Arc::new(Mutex::new(Vec::new()));

    let record = Arc::clone(&bodies);
    tokio::spawn(async move {
        for reply in replies {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = read_request(&mut socket).await;
            record.lock().unwrap().push(body);

            match reply {
                Reply::Json(json) => {
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        json.len(),
                        json
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                Reply::Hangup => drop(socket),
            }
        }
    });

    FakeApi {
        url: Url::parse(&format!("http://{addr}/2.0/")).unwrap(),
        bodies,
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let length = content_length(&head);
            while buf.len() < pos + 4 + length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return String::from_utf8_lossy(&buf[pos + 4..]).to_string();
        }

        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return String::new();
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn engine(url: Url, store: Option<PathBuf>) -> (AudioScrobbler, Reactor) {
    let reactor = Reactor::new(tokio::runtime::Handle::current());
    let scrobbler = AudioScrobbler::new(
        url,
        "key".to_string(),
        "secret".to_string(),
        "session".to_string(),
        store,
        reactor.clone(),
        TlsContext::new(),
    );
    (scrobbler, reactor)
}

fn entry(timestamp: i64) -> ScrobbleEntry {
    ScrobbleEntry {
        artist: "Someone".to_string(),
        track: format!("Track {timestamp}"),
        duration: 300,
        elapsed: 300,
        timestamp,
        ..ScrobbleEntry::default()
    }
}

fn seed_store(dir: &tempfile::TempDir, entries: &[ScrobbleEntry]) -> PathBuf {
    let path = dir.path().join("cache.json");
    std::fs::write(&path, serde_json::to_vec(entries).unwrap()).unwrap();
    path
}

// Scenario A: an accepted batch leaves nothing behind.
#[tokio::test]
async fn accepted_batch_empties_the_queue() {
    let api = serve(vec![Reply::Json("{}")]).await;

    let dir = tempfile::tempdir().unwrap();
    let store = seed_store(&dir, &[entry(1), entry(2), entry(3)]);
    let (scrobbler, reactor) = engine(api.url.clone(), Some(store));
    assert_eq!(scrobbler.pending(), 3);

    scrobbler.flush();
    reactor.drain().await;

    assert_eq!(scrobbler.pending(), 0);
    assert!(!scrobbler.failed());
    assert_eq!(api.request_count(), 1);

    let body = api.body(0);
    assert!(body.contains("method=track.scrobble"));
    assert!(body.contains("sk=session"));
    assert!(body.contains("timestamp%5B0%5D=1"));
    assert!(body.contains("timestamp%5B2%5D=3"));
    assert!(body.contains("&api_sig="));
}

// Scenario B: a network failure keeps the entry queued; the next successful
// submission drains it.
#[tokio::test]
async fn network_failure_requeues_until_success() {
    let api = serve(vec![Reply::Hangup, Reply::Json("{}")]).await;
    let (scrobbler, reactor) = engine(api.url.clone(), None);

    scrobbler.scrobble(&entry(10)).unwrap();
    reactor.drain().await;

    assert_eq!(scrobbler.pending(), 1);
    assert!(!scrobbler.failed());

    scrobbler.scrobble(&entry(11)).unwrap();
    reactor.drain().await;

    assert_eq!(scrobbler.pending(), 0);
    assert_eq!(api.request_count(), 2);

    // The retried batch carried both entries.
    let body = api.body(1);
    assert!(body.contains("timestamp%5B0%5D=10"));
    assert!(body.contains("timestamp%5B1%5D=11"));
}

// Scenario C: an unrecognized API error code trips the latch; afterwards
// every call fails without touching the network.
#[tokio::test]
async fn api_error_trips_the_latch() {
    let api = serve(vec![Reply::Json(r#"{"message":"boom","error":9}"#)]).await;
    let (scrobbler, reactor) = engine(api.url.clone(), None);

    scrobbler.scrobble(&entry(20)).unwrap();
    reactor.drain().await;

    assert!(scrobbler.failed());
    assert_eq!(scrobbler.pending(), 1);
    assert_eq!(api.request_count(), 1);

    assert!(matches!(scrobbler.scrobble(&entry(21)), Err(Error::Failed)));
    assert!(matches!(
        scrobbler.now_playing(&entry(21)),
        Err(Error::Failed)
    ));
    reactor.drain().await;
    assert_eq!(api.request_count(), 1);
    assert_eq!(scrobbler.pending(), 1);
}

// The two service-unavailable codes are transient: re-queue, no latch.
#[tokio::test]
async fn transient_codes_do_not_trip_the_latch() {
    for code in ["11", "16"] {
        let reply = match code {
            "11" => Reply::Json(r#"{"message":"service offline","error":11}"#),
            _ => Reply::Json(r#"{"message":"temporarily unavailable","error":16}"#),
        };
        let api = serve(vec![reply]).await;
        let (scrobbler, reactor) = engine(api.url.clone(), None);

        scrobbler.scrobble(&entry(30)).unwrap();
        reactor.drain().await;

        assert!(!scrobbler.failed(), "code {code} must not latch");
        assert_eq!(scrobbler.pending(), 1);

        // The instance still accepts work.
        scrobbler.scrobble(&entry(31)).unwrap();
        reactor.drain().await;
    }
}

// Scenario D: sixty entries drain as a capped batch of the fifty oldest,
// then an automatically triggered round for the rest.
#[tokio::test]
async fn batches_cap_at_fifty_oldest_first() {
    let api = serve(vec![Reply::Json("{}"), Reply::Json("{}")]).await;

    let entries: Vec<ScrobbleEntry> = (0..60).map(|i| entry(1000 + i)).collect();
    let dir = tempfile::tempdir().unwrap();
    let store = seed_store(&dir, &entries);
    let (scrobbler, reactor) = engine(api.url.clone(), Some(store));
    assert_eq!(scrobbler.pending(), 60);

    scrobbler.flush();
    reactor.drain().await;

    assert_eq!(scrobbler.pending(), 0);
    assert_eq!(api.request_count(), 2);

    let first = api.body(0);
    assert_eq!(first.matches("timestamp%5B").count(), 50);
    assert!(first.contains("timestamp%5B0%5D=1000"));
    assert!(first.contains("timestamp%5B49%5D=1049"));
    assert!(!first.contains("=1050&") && !first.ends_with("=1050"));

    let second = api.body(1);
    assert_eq!(second.matches("timestamp%5B").count(), 10);
    assert!(second.contains("timestamp%5B0%5D=1050"));
    assert!(second.contains("timestamp%5B9%5D=1059"));
}

// A failed now-playing push is logged only: nothing queued, nothing latched.
#[tokio::test]
async fn now_playing_is_best_effort() {
    let api = serve(vec![Reply::Hangup]).await;
    let (scrobbler, reactor) = engine(api.url.clone(), None);

    scrobbler.now_playing(&entry(40)).unwrap();
    reactor.drain().await;

    assert_eq!(api.request_count(), 1);
    assert_eq!(scrobbler.pending(), 0);
    assert!(!scrobbler.failed());

    let body = api.body(0);
    assert!(body.contains("method=track.updateNowPlaying"));
    assert!(!body.contains("timestamp"));
}

// Serializing, reloading and serializing again yields the same entries.
#[tokio::test]
async fn persisted_queue_round_trips() {
    let entries = vec![
        ScrobbleEntry {
            artist: "Someone".to_string(),
            track: "Something".to_string(),
            duration: 200,
            timestamp: 100,
            elapsed: 150,
            ..ScrobbleEntry::default()
        },
        ScrobbleEntry {
            track: "Sparse".to_string(),
            timestamp: 200,
            ..ScrobbleEntry::default()
        },
    ];

    let dir = tempfile::tempdir().unwrap();
    let store = seed_store(&dir, &entries);

    let url = Url::parse("http://127.0.0.1:9/2.0/").unwrap();
    let (scrobbler, _reactor) = engine(url.clone(), Some(store.clone()));
    assert_eq!(scrobbler.pending(), 2);
    drop(scrobbler);

    let first_pass: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&store).unwrap()).unwrap();
    assert_eq!(first_pass, serde_json::to_value(&entries).unwrap());

    let (scrobbler, _reactor) = engine(url, Some(store.clone()));
    assert_eq!(scrobbler.pending(), 2);
    drop(scrobbler);

    let second_pass: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&store).unwrap()).unwrap();
    assert_eq!(second_pass, first_pass);
}
