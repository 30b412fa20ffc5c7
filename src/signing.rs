//! Canonical parameter signing and form encoding.
//!
//! Every outbound AudioScrobbler 2.0 call carries the same shape of payload:
//! a flat set of string parameters, percent-encoded and joined as a form
//! body, closed by `format=json` and an `api_sig` — the lowercase-hex MD5 of
//! all keys and values in ascending key order with the shared secret
//! appended. [`SignedForm`] holds the parameters and produces both.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use url::form_urlencoded;

use crate::scrobble::ScrobbleEntry;

/// Percent-encodes one key or value for a form body.
///
/// Space becomes `+`, unreserved characters pass through, everything else is
/// `%XX`-escaped.
#[must_use]
pub fn urlencode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// A set of request parameters signed with a shared secret.
///
/// Parameters are kept in ascending key order; insertion order never affects
/// the signature or the serialized form.
#[derive(Clone, Debug)]
pub struct SignedForm {
    params: BTreeMap<String, String>,
    secret: String,
}

impl SignedForm {
    /// Creates an empty form that will be signed with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            params: BTreeMap::new(),
            secret: secret.into(),
        }
    }

    /// Sets the parameter `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Sets `key` only when `value` is non-empty.
    fn set_tag(&mut self, key: String, value: &str) {
        if !value.is_empty() {
            self.params.insert(key, value.to_string());
        }
    }

    /// Adds all track fields of `entry`, keyed with `suffix`.
    ///
    /// Batch submissions index their entries with a `[n]` suffix; single
    /// calls pass an empty one. The timestamp is playback state and is added
    /// separately by callers that need it.
    pub fn add_track(&mut self, entry: &ScrobbleEntry, suffix: &str) {
        self.set_tag(format!("artist{suffix}"), &entry.artist);
        self.set_tag(format!("track{suffix}"), &entry.track);
        self.set_tag(format!("album{suffix}"), &entry.album);
        self.set_tag(format!("trackNumber{suffix}"), &entry.track_number);
        self.set_tag(format!("mbid{suffix}"), &entry.mbid);
        self.set_tag(format!("albumArtist{suffix}"), &entry.album_artist);
        self.set(format!("duration{suffix}"), entry.duration.to_string());
    }

    /// Computes the request signature.
    ///
    /// The digest input is every key immediately followed by its value, in
    /// ascending key order, then the shared secret; the result is the
    /// lowercase hex encoding.
    #[must_use]
    pub fn sign(&self) -> String {
        let mut digest = Md5::new();
        for (key, value) in &self.params {
            digest.update(key);
            digest.update(value);
        }
        digest.update(&self.secret);
        format!("{:x}", digest.finalize())
    }

    /// Serializes the parameters, the `format=json` marker and the signature
    /// into a form body.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut body = String::new();
        for (key, value) in &self.params {
            if !body.is_empty() {
                body.push('&');
            }
            body.push_str(&urlencode(key));
            body.push('=');
            body.push_str(&urlencode(value));
        }
        body.push_str("&format=json");
        body.push_str("&api_sig=");
        body.push_str(&self.sign());
        body
    }
}
