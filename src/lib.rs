//! MPD scrobbling daemon.
//!
//! Watches an MPD server for playback events and reports finished and
//! now-playing tracks to an AudioScrobbler 2.0 service. Reports survive
//! transient API failures and process restarts: they wait in a persistent
//! queue and are submitted in signed, coalesced batches.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

pub mod audioscrobbler;
pub mod config;
pub mod exchange;
pub mod monitor;
pub mod mpd;
pub mod reactor;
pub mod scrobble;
pub mod signal;
pub mod signing;
pub mod transport;
