//! AudioScrobbler 2.0 back-end: the scrobble reliability engine.
//!
//! Finished tracks go into a timestamp-ordered pending queue that survives
//! submission failures and process restarts (it is written to the configured
//! cache file at shutdown and reloaded at construction). Submission is
//! coalesced: up to fifty of the oldest entries per signed `track.scrobble`
//! call, triggered after every insert and again after every acknowledged
//! batch until the queue drains. Failed batches are put back and wait for
//! the next trigger. An API-reported error sets the sticky fail latch —
//! except the two transient "service unavailable" codes — after which every
//! call on this instance fails without touching the network until the
//! process restarts. Now-playing pushes are best-effort: fire, log on
//! failure, forget.

use std::{
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use http::{header, Method};
use serde::Deserialize;
use thiserror::Error;
use tokio::runtime::Handle;
use url::Url;

use crate::{
    config::Section,
    exchange::Exchange,
    reactor::Reactor,
    scrobble::{self, PendingQueue, Scrobbler, ScrobbleEntry},
    signing::{urlencode, SignedForm},
    transport::{self, TlsContext},
};

/// Built-in service endpoint.
pub const DEFAULT_TARGET: &str = "https://ws.audioscrobbler.com/2.0/";

// These two are public in every client implementation.
const DEFAULT_API_KEY: &str = "72f47a2e17a2c43d4e284d35939c791f";
const DEFAULT_API_SECRET: &str = "da9cf6b88d9a7262517958d7535e61e0";

/// Fixed number of entries per coalesced submission.
const BATCH_SIZE: usize = 50;

/// API error codes that do not trip the fail latch.
const CODE_SERVICE_OFFLINE: i64 = 11;
const CODE_SERVICE_UNAVAILABLE: i64 = 16;

/// A track a finished play must exceed to be worth reporting.
const MIN_DURATION_SECS: u64 = 30;

/// Played time beyond which a track always qualifies.
const MAX_REQUIRED_PLAYED_SECS: u64 = 240;

/// One submission attempt's failure.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("http failure: {0}")]
    Exchange(#[from] transport::Error),

    #[error("unparseable response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("api returned an error: {0} (code {1})")]
    Api(String, i64),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Simple acknowledgement or error, the response shape of most calls.
#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: i64,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: i64,
    session: Option<Session>,
}

#[derive(Debug, Deserialize)]
struct Session {
    key: String,
    #[serde(default)]
    subscriber: u64,
    #[serde(default)]
    name: String,
}

/// AudioScrobbler 2.0 scrobbler instance.
///
/// Cheap to clone; clones share the queue, latch and target.
#[derive(Clone)]
pub struct AudioScrobbler {
    inner: Arc<Inner>,
}

struct Inner {
    target: Url,
    api_key: String,
    api_secret: String,
    session_key: String,
    store: Option<PathBuf>,

    queue: Mutex<PendingQueue>,
    failed: AtomicBool,

    reactor: Reactor,
    tls: TlsContext,
}

impl AudioScrobbler {
    /// Creates an instance against `target`, reloading any cached entries
    /// from `store`.
    ///
    /// A missing or unreadable cache is logged and ignored; the queue simply
    /// starts empty and the file is rewritten at shutdown.
    #[must_use]
    pub fn new(
        target: Url,
        api_key: String,
        api_secret: String,
        session_key: String,
        store: Option<PathBuf>,
        reactor: Reactor,
        tls: TlsContext,
    ) -> Self {
        debug!("scrobble target: {target}");

        let mut queue = PendingQueue::default();
        if let Some(path) = &store {
            match fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<Vec<ScrobbleEntry>>(&bytes) {
                    Ok(entries) => {
                        debug!("reloaded {} cached scrobbles", entries.len());
                        queue.restore(entries);
                    }
                    Err(e) => error!("cannot read scrobble cache (ignoring): {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(
                        "no scrobble cache at {}; it will be written at shutdown",
                        path.display()
                    );
                }
                Err(e) => error!("cannot read scrobble cache (ignoring): {e}"),
            }
        }

        Self {
            inner: Arc::new(Inner {
                target,
                api_key,
                api_secret,
                session_key,
                store,
                queue: Mutex::new(queue),
                failed: AtomicBool::new(false),
                reactor,
                tls,
            }),
        }
    }

    /// Fabricates an instance from its configuration section.
    ///
    /// `session` is required. `api_key` and `api_secret` must be given
    /// together — providing only one is usually a mistake on the user's part
    /// and fails fabrication — or both default to the built-in public
    /// values.
    pub fn from_section(
        section: &Section,
        reactor: Reactor,
        tls: TlsContext,
    ) -> Result<Self, scrobble::Error> {
        let session_key = section.get("session")?.to_string();
        let store = if section.has("store") {
            Some(PathBuf::from(section.get("store")?))
        } else {
            None
        };
        let target = Url::parse(&section.get_or("url", DEFAULT_TARGET))?;

        let (api_key, api_secret) = if section.has("api_key") || section.has("api_secret") {
            (
                section.get("api_key")?.to_string(),
                section.get("api_secret")?.to_string(),
            )
        } else {
            (DEFAULT_API_KEY.to_string(), DEFAULT_API_SECRET.to_string())
        };

        Ok(Self::new(
            target,
            api_key,
            api_secret,
            session_key,
            store,
            reactor,
            tls,
        ))
    }

    /// Number of entries awaiting submission.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock_queue().len()
    }

    /// Whether the fail latch has been tripped.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }
}

impl Scrobbler for AudioScrobbler {
    fn check_preconditions(&self, entry: &ScrobbleEntry) -> bool {
        let required = MAX_REQUIRED_PLAYED_SECS.min(entry.duration / 2);
        entry.duration > MIN_DURATION_SECS && entry.elapsed > required
    }

    fn now_playing(&self, entry: &ScrobbleEntry) -> Result<(), scrobble::Error> {
        if self.failed() {
            return Err(scrobble::Error::Failed);
        }

        let mut form = SignedForm::new(&self.inner.api_secret);
        form.set("method", "track.updateNowPlaying");
        form.set("api_key", &self.inner.api_key);
        form.set("sk", &self.inner.session_key);
        form.add_track(entry, "");

        let inner = Arc::clone(&self.inner);
        let body = form.encode();
        self.inner.reactor.spawn(async move {
            match inner.post(body).await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        error!("now playing send failed, status: {}", status.as_u16());
                    }
                }
                Err(e) => error!("request error when sending now playing: {e}"),
            }
        });

        Ok(())
    }

    fn scrobble(&self, entry: &ScrobbleEntry) -> Result<(), scrobble::Error> {
        if self.failed() {
            return Err(scrobble::Error::Failed);
        }

        self.inner.lock_queue().insert(entry.clone());
        self.inner.trigger_submit();
        Ok(())
    }

    fn flush(&self) {
        self.inner.trigger_submit();
    }
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends one POST to the target with a form body.
    async fn post(&self, body: String) -> Result<http::Response<String>, transport::Error> {
        let mut exchange = Exchange::new(self.target.clone(), &self.tls)?;
        let request = exchange.request_mut();
        *request.method_mut() = Method::POST;
        request.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        *request.body_mut() = body;
        exchange.run().await
    }

    /// Takes the next batch off the queue and schedules its submission.
    ///
    /// Re-entrant: called after every insert and again by the completion of
    /// each acknowledged batch, so the queue keeps draining until it is
    /// empty or a failure stops the chain.
    fn trigger_submit(self: &Arc<Self>) {
        let batch = {
            let mut queue = self.lock_queue();
            if self.failed.load(Ordering::SeqCst) || queue.is_empty() {
                return;
            }
            queue.take_oldest(BATCH_SIZE)
        };

        let mut form = SignedForm::new(&self.api_secret);
        form.set("method", "track.scrobble");
        form.set("api_key", &self.api_key);
        form.set("sk", &self.session_key);
        for (index, entry) in batch.iter().enumerate() {
            let suffix = format!("[{index}]");
            form.add_track(entry, &suffix);
            form.set(format!("timestamp{suffix}"), entry.timestamp.to_string());
        }
        let body = form.encode();

        let inner = Arc::clone(self);
        self.reactor.spawn(async move {
            match inner.submit_batch(body).await {
                Ok(()) => {
                    // Batch acknowledged; keep going until the queue is
                    // empty or another failure occurs.
                    inner.trigger_submit();
                }
                Err(e) => {
                    inner.lock_queue().restore(batch);
                    error!("scrobble failed: {e}");
                }
            }
        });
    }

    /// Submits one batch body and interprets the response.
    ///
    /// A response with a non-empty message is an API error: the two
    /// transient service-unavailable codes leave the latch alone, every
    /// other code trips it. Either way the attempt fails and the caller
    /// re-queues the batch.
    async fn submit_batch(&self, body: String) -> Result<(), SubmitError> {
        let response = self.post(body).await?;
        let ack: ApiResponse = serde_json::from_str(response.body())?;

        if !ack.message.is_empty() {
            match ack.error {
                CODE_SERVICE_OFFLINE | CODE_SERVICE_UNAVAILABLE => {}
                _ => {
                    self.failed.store(true, Ordering::SeqCst);
                }
            }
            return Err(SubmitError::Api(ack.message, ack.error));
        }

        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let Some(path) = &self.store else { return };

        let entries = self
            .queue
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();

        match fs::File::create(path) {
            Ok(file) => {
                if let Err(e) = serde_json::to_writer(file, &entries) {
                    error!("cannot write scrobble cache to {}: {e}", path.display());
                }
            }
            Err(e) => error!("cannot write scrobble cache to {}: {e}", path.display()),
        }
    }
}

/// Requests an unauthorized token (step 1 of the bootstrap).
async fn request_token(
    target: &Url,
    api_key: &str,
    tls: &TlsContext,
) -> Result<String, SubmitError> {
    let mut url = target.clone();
    url.query_pairs_mut()
        .append_pair("method", "auth.getToken")
        .append_pair("format", "json")
        .append_pair("api_key", api_key);

    let exchange = Exchange::new(url, tls).map_err(SubmitError::Exchange)?;
    let response = exchange.run().await?;
    let token: TokenResponse = serde_json::from_str(response.body())?;

    if !token.message.is_empty() {
        return Err(SubmitError::Api(token.message, token.error));
    }
    if token.token.is_empty() {
        return Err(SubmitError::Malformed("no token in response".to_string()));
    }
    Ok(token.token)
}

/// Exchanges an authorized token for a session key (step 2).
async fn request_session(
    target: &Url,
    api_key: &str,
    api_secret: &str,
    token: &str,
    tls: &TlsContext,
) -> Result<String, SubmitError> {
    let mut form = SignedForm::new(api_secret);
    form.set("method", "auth.getSession");
    form.set("api_key", api_key);
    form.set("token", token);

    let mut exchange = Exchange::new(target.clone(), tls).map_err(SubmitError::Exchange)?;
    *exchange.request_mut().method_mut() = Method::POST;
    exchange.request_mut().headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    *exchange.request_mut().body_mut() = form.encode();

    let response = exchange.run().await?;
    let session: SessionResponse = serde_json::from_str(response.body())?;

    if !session.message.is_empty() {
        return Err(SubmitError::Api(session.message, session.error));
    }
    let session = session
        .session
        .ok_or_else(|| SubmitError::Malformed("no session in response".to_string()))?;
    debug!(
        "session belongs to {} (subscriber: {})",
        session.name, session.subscriber
    );
    Ok(session.key)
}

/// Runs the interactive authentication flow.
///
/// Blocks between the two steps until the operator confirms they have
/// authorized the token out-of-band. A failing session exchange reports the
/// token so the operator can retry step 2 by hand.
pub fn authenticate(
    handle: &Handle,
    tls: &TlsContext,
    target: Option<&str>,
    api_key: Option<&str>,
    api_secret: Option<&str>,
) -> Result<(), scrobble::Error> {
    debug!("starting auth process");

    let target = Url::parse(target.unwrap_or(DEFAULT_TARGET))?;
    let api_key = api_key.unwrap_or(DEFAULT_API_KEY);
    let api_secret = api_secret.unwrap_or(DEFAULT_API_SECRET);

    let token = match handle.block_on(request_token(&target, api_key, tls)) {
        Ok(token) => token,
        Err(e) => {
            error!("failed to get token: {e}");
            return Err(e.into());
        }
    };

    info!(
        "to authenticate, open https://www.last.fm/api/auth?api_key={}&token={}\n\
         and press enter\n\
         NOTE: your URL could be different, depending on your service",
        urlencode(api_key),
        urlencode(&token)
    );

    // Wait for the operator to finish the out-of-band authorization.
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    match handle.block_on(request_session(&target, api_key, api_secret, &token, tls)) {
        Ok(session) => {
            info!("your session: {session}");
            Ok(())
        }
        Err(e) => {
            error!("failed to get session: {e}\nyour token was: {token}");
            Err(e.into())
        }
    }
}
