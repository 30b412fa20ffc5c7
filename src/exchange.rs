//! One asynchronous HTTP request/response exchange.
//!
//! An [`Exchange`] is created from a target URL, starts out as a default
//! `GET` with `Host` and user-agent headers, and may be customized before
//! being consumed exactly once by [`Exchange::run`]. The run drives the
//! whole exchange as a single sequential task — resolve, connect, write,
//! read — so the request stays alive until its result is produced and no
//! caller retention is needed. Resolution is skipped when the host is a
//! literal IP address. Any stage failure short-circuits with the
//! originating error; the result is produced exactly once either way.

use std::net::{IpAddr, SocketAddr};

use http::{header, HeaderValue, Method, Request, Response};
use tokio::net::lookup_host;
use url::{Host, Position, Url};

use crate::transport::{self, Error, TlsContext, Transport};

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A single request, from target URL to response.
pub struct Exchange {
    url: Url,
    transport: Box<dyn Transport>,
    request: Request<String>,
}

impl Exchange {
    /// Creates an exchange against `url`, selecting the transport variant by
    /// its scheme.
    ///
    /// The prepared request is a `GET` for the URL's path and query with
    /// `Host` and `User-Agent` set; use [`request_mut`](Self::request_mut)
    /// to change the method, body or headers before running.
    pub fn new(url: Url, tls: &TlsContext) -> Result<Self, Error> {
        let transport = transport::for_url(&url, tls)?;

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidTarget("target has no host".to_string()))?;
        let target = match &url[Position::BeforePath..Position::AfterQuery] {
            "" => "/",
            target => target,
        };

        let request = Request::builder()
            .method(Method::GET)
            .uri(target)
            .header(header::HOST, host)
            .header(header::USER_AGENT, USER_AGENT)
            .body(String::new())
            .map_err(|e| Error::InvalidTarget(e.to_string()))?;

        Ok(Self {
            url,
            transport,
            request,
        })
    }

    /// The request as it will be sent, for customization before the run.
    pub fn request_mut(&mut self) -> &mut Request<String> {
        &mut self.request
    }

    /// Runs the exchange to completion.
    ///
    /// Stages run strictly in order; the first failing stage ends the run
    /// with its error and no partial result is ever produced.
    pub async fn run(mut self) -> Result<Response<String>, Error> {
        let length = self.request.body().len();
        if length > 0 || self.request.method() != Method::GET {
            self.request
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
        // One exchange per connection; lets the peer delimit bodies by EOF.
        self.request
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));

        let port = self
            .url
            .port()
            .unwrap_or_else(|| self.transport.default_port());

        let addrs: Vec<SocketAddr> = match self.url.host() {
            Some(Host::Ipv4(addr)) => vec![SocketAddr::new(IpAddr::V4(addr), port)],
            Some(Host::Ipv6(addr)) => vec![SocketAddr::new(IpAddr::V6(addr), port)],
            Some(Host::Domain(domain)) => lookup_host((domain, port))
                .await
                .map_err(Error::Dns)?
                .collect(),
            None => return Err(Error::InvalidTarget("target has no host".to_string())),
        };

        debug!(
            "> {} {}{}",
            self.request.method(),
            self.url.host_str().unwrap_or_default(),
            self.request.uri()
        );

        self.transport.connect(&addrs).await?;
        self.transport.write(&self.request).await?;
        let response = self.transport.read().await?;

        debug!("< {} ({} bytes)", response.status(), response.body().len());
        Ok(response)
    }
}
