use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;

/// Any bidirectional byte stream the proxy can tunnel over. Hijack
/// handlers receive the client socket behind this trait.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// An outbound stream that is either plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// plain TCP
  Tcp(TcpStream),
  /// TLS client session
  Tls(Box<ClientTlsStream<TcpStream>>),
}

impl From<TcpStream> for MaybeTlsStream {
  fn from(stream: TcpStream) -> Self {
    MaybeTlsStream::Tcp(stream)
  }
}

impl From<ClientTlsStream<TcpStream>> for MaybeTlsStream {
  fn from(stream: ClientTlsStream<TcpStream>) -> Self {
    MaybeTlsStream::Tls(Box::new(stream))
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// A stream with some already-read bytes pushed back in front of it.
///
/// A hijacked `CONNECT` socket may have tunnel bytes (typically the TLS
/// ClientHello) sitting in the request parser's buffer; they must be replayed
/// before any fresh reads from the socket.
#[derive(Debug)]
pub struct Rewind<T> {
  prefix: Vec<u8>,
  offset: usize,
  inner: T,
}

impl<T> Rewind<T> {
  pub(crate) fn new(prefix: Vec<u8>, inner: T) -> Self {
    Rewind {
      prefix,
      offset: 0,
      inner,
    }
  }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if this.offset < this.prefix.len() {
      let remaining = &this.prefix[this.offset..];
      let n = std::cmp::min(remaining.len(), buf.remaining());
      buf.put_slice(&remaining[..n]);
      this.offset += n;
      if this.offset == this.prefix.len() {
        this.prefix = Vec::new();
        this.offset = 0;
      }
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
