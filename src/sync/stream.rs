//! The session transport: a TCP stream, upgradable in place to TLS after
//! the `EncryptRdy` info step.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use openssl::ssl::{Ssl, SslAcceptor, SslConnector, SslContext, SslFiletype, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// Certificate material for the encrypted mode. Without it a session can
/// only refuse encryption.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

pub(crate) enum NetStream {
    Plain(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
    /// Transient state while upgrading.
    Gone,
}

impl NetStream {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, NetStream::Tls(_))
    }

    /// Performs the TLS handshake on the underlying socket. Server side
    /// presents the configured certificate; the client verifies none, as
    /// authenticity comes from the login exchange.
    pub async fn upgrade(&mut self, is_server: bool, tls: Option<&TlsConfig>) -> io::Result<()> {
        let plain = match std::mem::replace(self, NetStream::Gone) {
            NetStream::Plain(s) => s,
            other => {
                *self = other;
                return Ok(()); // already encrypted
            }
        };

        let ctx = if is_server {
            server_context(tls.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no TLS certificate configured")
            })?)?
        } else {
            client_context()?
        };

        let ssl = Ssl::new(&ctx).map_err(to_io)?;
        let mut stream = SslStream::new(ssl, plain).map_err(to_io)?;
        let result = if is_server {
            Pin::new(&mut stream).accept().await
        } else {
            Pin::new(&mut stream).connect().await
        };
        result.map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))?;

        *self = NetStream::Tls(Box::new(stream));
        Ok(())
    }
}

fn server_context(tls: &TlsConfig) -> io::Result<SslContext> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).map_err(to_io)?;
    acceptor.set_certificate_chain_file(&tls.cert_file).map_err(to_io)?;
    acceptor.set_private_key_file(&tls.key_file, SslFiletype::PEM).map_err(to_io)?;
    acceptor.set_verify(SslVerifyMode::NONE);
    Ok(acceptor.build().into_context())
}

fn client_context() -> io::Result<SslContext> {
    let mut connector = SslConnector::builder(SslMethod::tls()).map_err(to_io)?;
    connector.set_verify(SslVerifyMode::NONE);
    Ok(connector.build().into_context())
}

fn to_io<E: std::error::Error>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            NetStream::Gone => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            NetStream::Gone => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            NetStream::Gone => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            NetStream::Gone => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}
