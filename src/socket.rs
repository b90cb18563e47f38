// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use socket2::{SockRef, TcpKeepalive};
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::either::Either;
use tracing::{debug, instrument};
use url::Url;

pub mod proxy;
pub mod tls;

pub use tls::{cert_store_from_pem, provider};

/// A connection to a remote endpoint, TLS wrapped for secure schemes.
pub type Stream = Either<TcpStream, tokio_rustls::client::TlsStream<TcpStream>>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url {0}: {1}")]
    InvalidUrl(String, String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("failed to connect to {0}: {1}")]
    Connect(String, io::Error),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("tls handshake error: {0}")]
    Handshake(io::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify the peer chain against the cert store, then the hostname.
    #[default]
    Peer,
    /// Accept any peer certificate.
    None,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    Any,
    Tls12,
    Tls13,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub verify_mode: VerifyMode,
    /// Trust anchors for peer verification. The platform roots are used when unset.
    pub cert_store: Option<Arc<RootCertStore>>,
    /// Overrides the host name used for SNI and certificate verification.
    pub hostname: Option<String>,
    pub ssl_version: TlsVersion,
    pub http_proxy_uri: Option<Url>,
}

/// Whether the scheme of `url` calls for TLS.
pub fn is_secure(url: &Url) -> Result<bool, Error> {
    match url.scheme() {
        "https" | "wss" => Ok(true),
        "http" | "ws" => Ok(false),
        other => Err(Error::UnsupportedScheme(other.to_string())),
    }
}

pub fn host_of(url: &Url) -> Result<String, Error> {
    match url.host() {
        Some(url::Host::Domain(d)) => Ok(d.to_string()),
        Some(url::Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(url::Host::Ipv6(ip)) => Ok(ip.to_string()),
        None => Err(Error::InvalidUrl(url.to_string(), "missing host".to_string())),
    }
}

pub fn port_of(url: &Url) -> Result<u16, Error> {
    url.port_or_known_default()
        .ok_or_else(|| Error::InvalidUrl(url.to_string(), "missing port".to_string()))
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Opens a connection to `url`, tunnelling through the configured proxy and wrapping the
/// socket in TLS for `https`/`wss`.
#[instrument(skip_all, fields(host = url.host_str().unwrap_or_default()))]
pub async fn connect(url: &Url, options: &ConnectOptions) -> Result<Stream, Error> {
    let secure = is_secure(url)?;
    let host = host_of(url)?;
    let port = port_of(url)?;

    let tcp = match &options.http_proxy_uri {
        Some(proxy_uri) => proxy::connect(proxy_uri, &host, port).await?,
        None => TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| Error::Connect(authority(&host, port), e))?,
    };
    tcp.set_nodelay(true)?;
    debug!(peer = %authority(&host, port), secure, "connected");

    if !secure {
        return Ok(Either::Left(tcp));
    }
    let server_name = options.hostname.as_deref().unwrap_or(&host);
    let stream = tls::connect(tcp, server_name, options).await?;
    Ok(Either::Right(stream))
}

/// Listener is a wrapper for TcpListener with sane defaults. Notably, setting NODELAY and
/// keepalives on accepted connections.
pub struct Listener {
    listener: TcpListener,
    keepalive: Option<Duration>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Listener {
            listener: TcpListener::bind(addr).await?,
            keepalive: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn set_keepalive(&mut self, keepalive: Option<Duration>) {
        self.keepalive = keepalive;
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        if let Some(time) = self.keepalive {
            let ka = TcpKeepalive::new().with_time(time);
            let res = SockRef::from(&stream).set_tcp_keepalive(&ka);
            tracing::trace!("set keepalive: {:?}", res);
        }
        Ok((stream, remote))
    }
}
