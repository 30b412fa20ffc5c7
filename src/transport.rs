//! Transport abstraction over plaintext and TLS-secured HTTP.
//!
//! One [`Transport`] contract, two variants selected once by the target
//! URL's scheme: [`Plain`] speaks HTTP/1.1 over a bare TCP stream, [`Tls`]
//! wraps the same framing in rustls with the server name fixed at
//! construction. Each variant performs one connect, one full request write
//! and one full response read; retry policy lives entirely with the caller.
//!
//! Failures classify into DNS, connect, TLS and I/O so the reliability
//! engine can log them meaningfully; this layer never retries.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use url::{Host, Url};

/// Transport-level failure, classified by stage.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported protocol: {0}")]
    UnsupportedScheme(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("name resolution failed: {0}")]
    Dns(#[source] io::Error),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transport is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;

/// One connect/write/read exchange over HTTP or HTTPS.
///
/// `connect` accepts either a single literal address or a name-resolution
/// result set and tries each address in order. `write` and `read` each
/// transfer one full message. Implementations report every failure through
/// their return value exactly once and never retry.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the connection.
    async fn connect(&mut self, addrs: &[SocketAddr]) -> Result<()>;

    /// Writes one full request message.
    async fn write(&mut self, request: &Request<String>) -> Result<()>;

    /// Reads one full response message.
    async fn read(&mut self) -> Result<Response<String>>;

    /// Port used when the target URL does not name one.
    fn default_port(&self) -> u16;
}

/// Shared TLS client configuration.
///
/// Built once by the process entry point from the platform's native root
/// certificates and handed to every component that opens `https` targets.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<rustls::ClientConfig>,
}

impl TlsContext {
    /// Loads the native root certificates and builds the client config.
    ///
    /// Unloadable roots are logged and skipped. An empty root store is not
    /// fatal here; certificate verification fails per connection instead,
    /// and plaintext targets never need the roots at all.
    #[must_use]
    pub fn new() -> Self {
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            warn!("skipping a native root certificate: {error}");
        }

        let mut roots = rustls::RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!("loaded {added} native root certificates ({ignored} ignored)");
        if roots.is_empty() {
            warn!("no usable native root certificates; HTTPS targets will fail verification");
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Selects the transport variant for `url` by its scheme.
///
/// `http` and `https` are matched case-insensitively; any other scheme is an
/// unsupported-protocol error. The choice is made once; a transport never
/// re-selects after construction.
pub fn for_url(url: &Url, tls: &TlsContext) -> Result<Box<dyn Transport>> {
    match url.scheme().to_ascii_lowercase().as_str() {
        "http" => Ok(Box::new(Plain::new())),
        "https" => Ok(Box::new(Tls::new(tls, &host_of(url)?)?)),
        other => Err(Error::UnsupportedScheme(other.to_string())),
    }
}

/// The target host as a bare name or address, without IPv6 brackets.
fn host_of(url: &Url) -> Result<String> {
    match url.host() {
        Some(Host::Domain(domain)) => Ok(domain.to_string()),
        Some(Host::Ipv4(addr)) => Ok(addr.to_string()),
        Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
        None => Err(Error::InvalidTarget("target has no host".to_string())),
    }
}

/// Tries each address in order, keeping the last failure for the error.
async fn connect_tcp(addrs: &[SocketAddr]) -> Result<TcpStream> {
    let mut last: Option<io::Error> = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last = Some(e);
            }
        }
    }

    Err(match last {
        Some(e) => Error::Connect(e),
        None => Error::InvalidTarget("no addresses to connect to".to_string()),
    })
}

/// Plaintext HTTP transport.
pub struct Plain {
    stream: Option<TcpStream>,
}

impl Plain {
    #[must_use]
    pub fn new() -> Self {
        Self { stream: None }
    }
}

impl Default for Plain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for Plain {
    async fn connect(&mut self, addrs: &[SocketAddr]) -> Result<()> {
        self.stream = Some(connect_tcp(addrs).await?);
        Ok(())
    }

    async fn write(&mut self, request: &Request<String>) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        stream.write_all(&wire::encode_request(request)).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Response<String>> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        wire::read_response(stream).await
    }

    fn default_port(&self) -> u16 {
        80
    }
}

/// TLS-secured HTTP transport.
///
/// The server name for SNI and certificate verification is fixed when the
/// transport is created, before any connect; the handshake runs right after
/// the TCP connect succeeds.
pub struct Tls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    stream: Option<TlsStream<TcpStream>>,
}

impl Tls {
    pub fn new(tls: &TlsContext, host: &str) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::InvalidTarget(format!("invalid TLS server name: {host}")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::clone(&tls.config)),
            server_name,
            stream: None,
        })
    }
}

#[async_trait]
impl Transport for Tls {
    async fn connect(&mut self, addrs: &[SocketAddr]) -> Result<()> {
        let tcp = connect_tcp(addrs).await?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn write(&mut self, request: &Request<String>) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        stream.write_all(&wire::encode_request(request)).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Response<String>> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        wire::read_response(stream).await
    }

    fn default_port(&self) -> u16 {
        443
    }
}

/// HTTP/1.1 message framing shared by both transport variants.
pub(crate) mod wire {
    use super::{
        AsyncRead, AsyncReadExt, Error, HeaderMap, HeaderName, HeaderValue, Request, Response,
        Result, StatusCode,
    };

    /// Upper bound on the response header block.
    const MAX_HEAD: usize = 16 * 1024;

    /// Serializes one request message.
    pub(crate) fn encode_request(request: &Request<String>) -> Vec<u8> {
        let target = request
            .uri()
            .path_and_query()
            .map_or("/", http::uri::PathAndQuery::as_str);

        let mut buf = Vec::with_capacity(256 + request.body().len());
        buf.extend_from_slice(request.method().as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(target.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");

        for (name, value) in request.headers() {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(request.body().as_bytes());
        buf
    }

    /// Reads one full response message.
    ///
    /// The body is delimited by `Content-Length`, chunked framing, or the
    /// end of the stream; requests always carry `Connection: close`, so the
    /// peer closing the connection is the normal last resort.
    pub(crate) async fn read_response<S>(stream: &mut S) -> Result<Response<String>>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::with_capacity(4096);
        let head_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos;
            }
            if buf.len() > MAX_HEAD {
                return Err(Error::Malformed("response header block too large".into()));
            }
            if read_some(stream, &mut buf).await? == 0 {
                return Err(Error::Malformed(
                    "connection closed before response headers".into(),
                ));
            }
        };

        let (status, headers) = parse_head(&buf[..head_end])?;
        let mut body = buf.split_off(head_end + 4);

        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());
        let chunked = headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

        if chunked {
            loop {
                if let Some(decoded) = dechunk(&body) {
                    body = decoded;
                    break;
                }
                if read_some(stream, &mut body).await? == 0 {
                    return Err(Error::Malformed(
                        "connection closed inside chunked response body".into(),
                    ));
                }
            }
        } else if let Some(length) = content_length {
            while body.len() < length {
                if read_some(stream, &mut body).await? == 0 {
                    return Err(Error::Malformed(
                        "connection closed before full response body".into(),
                    ));
                }
            }
            body.truncate(length);
        } else {
            while read_some(stream, &mut body).await? > 0 {}
        }

        let body = String::from_utf8(body)
            .map_err(|_| Error::Malformed("response body is not valid UTF-8".into()))?;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    async fn read_some<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<usize>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Parses the status line and header block.
    pub(crate) fn parse_head(head: &[u8]) -> Result<(StatusCode, HeaderMap)> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::Malformed("response headers are not valid UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| Error::Malformed("missing status line".into()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(Error::Malformed(format!(
                "unexpected protocol version: {version}"
            )));
        }
        let status = parts
            .next()
            .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
            .ok_or_else(|| Error::Malformed(format!("bad status line: {status_line}")))?;

        let mut headers = HeaderMap::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Malformed(format!("bad header line: {line}")))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| Error::Malformed(format!("bad header name: {name}")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| Error::Malformed(format!("bad header value in: {line}")))?;
            headers.append(name, value);
        }

        Ok((status, headers))
    }

    /// Decodes chunked framing, or `None` when the framing is incomplete.
    ///
    /// Trailer fields after the terminating zero-size chunk are ignored.
    pub(crate) fn dechunk(data: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        let mut rest = data;
        loop {
            let line_end = find(rest, b"\r\n")?;
            let size_line = std::str::from_utf8(&rest[..line_end]).ok()?;
            let size_field = size_line.split(';').next()?.trim();
            let size = usize::from_str_radix(size_field, 16).ok()?;
            rest = &rest[line_end + 2..];

            if size == 0 {
                return Some(out);
            }
            if rest.len() < size + 2 {
                return None;
            }
            out.extend_from_slice(&rest[..size]);
            rest = &rest[size..];
            if !rest.starts_with(b"\r\n") {
                return None;
            }
            rest = &rest[2..];
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}
