//! A trait to represent a stream

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_native_tls::{TlsConnector, TlsStream};
use async_trait::async_trait;
use log::debug;
use pin_project::pin_project;
use tokio::io::{AsyncRead as Read, AsyncWrite as Write, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout as with_timeout;

use crate::smtp::client::mock::MockStream;
use crate::smtp::error::Error;

/// Parameters to use for secure clients
pub struct ClientTlsParameters {
    /// A connector from `native-tls`
    pub connector: TlsConnector,
    /// The domain to send during the TLS handshake
    pub domain: String,
}

impl fmt::Debug for ClientTlsParameters {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ClientTlsParameters")
            .field("connector", &"TlsConnector")
            .field("domain", &self.domain)
            .finish()
    }
}

impl ClientTlsParameters {
    /// Creates a `ClientTlsParameters`
    pub fn new(domain: String, connector: TlsConnector) -> ClientTlsParameters {
        ClientTlsParameters { connector, domain }
    }

    /// Certificates are checked against the system trust store.
    pub fn system_default(domain: String) -> ClientTlsParameters {
        ClientTlsParameters::new(domain, TlsConnector::new())
    }
}

/// Represents the different types of underlying network streams
#[pin_project(project = NetworkStreamProj)]
pub enum NetworkStream {
    /// Plain TCP stream
    Tcp(#[pin] TcpStream),
    /// Encrypted TCP stream
    Tls(#[pin] TlsStream<TcpStream>),
    /// Mock stream
    Mock(#[pin] MockStream),
}

impl fmt::Debug for NetworkStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            NetworkStream::Tcp(ref s) => f.debug_tuple("Tcp").field(s).finish(),
            NetworkStream::Tls(ref s) => f.debug_tuple("Tls").field(s.get_ref()).finish(),
            NetworkStream::Mock(ref s) => f.debug_tuple("Mock").field(s).finish(),
        }
    }
}

impl NetworkStream {
    /// Is the NetworkStream encrypted
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_encrypted(&self) -> bool {
        match *self {
            NetworkStream::Tls(_) => true,
            _ => false,
        }
    }
}

impl Read for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            NetworkStreamProj::Tcp(s) => s.poll_read(cx, buf),
            NetworkStreamProj::Tls(s) => s.poll_read(cx, buf),
            NetworkStreamProj::Mock(s) => s.poll_read(cx, buf),
        }
    }
}

impl Write for NetworkStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.project() {
            NetworkStreamProj::Tcp(s) => s.poll_write(cx, buf),
            NetworkStreamProj::Tls(s) => s.poll_write(cx, buf),
            NetworkStreamProj::Mock(s) => s.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.project() {
            NetworkStreamProj::Tcp(s) => s.poll_flush(cx),
            NetworkStreamProj::Tls(s) => s.poll_flush(cx),
            NetworkStreamProj::Mock(s) => s.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.project() {
            NetworkStreamProj::Tcp(s) => s.poll_shutdown(cx),
            NetworkStreamProj::Tls(s) => s.poll_shutdown(cx),
            NetworkStreamProj::Mock(s) => s.poll_shutdown(cx),
        }
    }
}

/// Opens connections and upgrades them to TLS.
///
/// A failed `upgrade_tls` drops the stream, which closes it.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a plaintext connection to `host:port`
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<NetworkStream, Error>;

    /// Upgrades to TLS connection
    async fn upgrade_tls(
        &self,
        stream: NetworkStream,
        tls_parameters: &ClientTlsParameters,
    ) -> Result<NetworkStream, Error>;
}

/// Connects over TCP and upgrades with `native-tls`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<NetworkStream, Error> {
        // Resolution and the TCP handshake share one deadline.
        match timeout {
            Some(duration) => with_timeout(duration, open_tcp(host, port)).await?,
            None => open_tcp(host, port).await,
        }
    }

    async fn upgrade_tls(
        &self,
        stream: NetworkStream,
        tls_parameters: &ClientTlsParameters,
    ) -> Result<NetworkStream, Error> {
        match stream {
            NetworkStream::Tcp(stream) => {
                let tls_stream = tls_parameters
                    .connector
                    .connect(&tls_parameters.domain, stream)
                    .await?;
                Ok(NetworkStream::Tls(tls_stream))
            }
            NetworkStream::Tls(_) => Ok(stream),
            NetworkStream::Mock(_) => Err(Error::Client("a mock stream cannot be encrypted")),
        }
    }
}

async fn open_tcp(host: &str, port: u16) -> Result<NetworkStream, Error> {
    let mut addresses = lookup_host((host, port)).await?;

    let server_addr = match addresses.next() {
        Some(addr) => addr,
        None => return Err(Error::Resolution),
    };

    debug!("connecting to {}", server_addr);

    Ok(NetworkStream::Tcp(TcpStream::connect(server_addr).await?))
}
