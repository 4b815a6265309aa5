use crate::{Error, Transport};
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::{
    client::legacy::connect::{Connected, Connection},
    rt::TokioIo,
};
use rustls::{pki_types::ServerName, ClientConfig};
use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{net::TcpStream, time};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Dials plaintext and TLS connections for a `hyper-util` client.
#[derive(Clone, Debug)]
pub struct HttpsConnector {
    source: ConfigSource,
    connect_timeout: time::Duration,
    handshake_timeout: time::Duration,
}

/// Where a connector obtains its TLS client configuration.
#[derive(Clone, Debug)]
pub enum ConfigSource {
    Fixed(Arc<ClientConfig>),
    Reloading(Transport),
}

/// An established upstream connection.
#[derive(Debug)]
pub enum Conn {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>),
}

// === impl HttpsConnector ===

impl HttpsConnector {
    pub fn new(
        source: ConfigSource,
        connect_timeout: time::Duration,
        handshake_timeout: time::Duration,
    ) -> Self {
        Self {
            source,
            connect_timeout,
            handshake_timeout,
        }
    }

    async fn connect(self, uri: Uri) -> Result<Conn, Error> {
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            scheme => return Err(Error::UnsupportedScheme(scheme.unwrap_or_default().to_string())),
        };
        let host = uri
            .host()
            .ok_or(Error::MissingHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

        let tcp = time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        tcp.set_nodelay(true)?;
        if !tls {
            return Ok(Conn::Plain(TokioIo::new(tcp)));
        }

        // The configuration is read once per connection so that rotated credentials apply to new
        // connections without disturbing established ones.
        let config = match &self.source {
            ConfigSource::Fixed(config) => config.clone(),
            ConfigSource::Reloading(transport) => transport.client_config(),
        };
        let name = ServerName::try_from(host.clone()).map_err(|_| Error::ServerName(host))?;
        let stream = time::timeout(
            self.handshake_timeout,
            TlsConnector::from(config).connect(name, tcp),
        )
        .await
        .map_err(|_| Error::HandshakeTimeout)??;
        Ok(Conn::Tls(TokioIo::new(stream)))
    }
}

impl tower::Service<Uri> for HttpsConnector {
    type Response = Conn;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Conn, Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

// === impl Conn ===

impl Connection for Conn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Self::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl Write for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Self::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_flush(cx),
            Self::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Self::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}
