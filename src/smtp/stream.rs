//! Unified plain/TLS connection stream.
//!
//! The session state machine reads and writes through this enum and never
//! sees the concrete transport, which is what lets STARTTLS swap the socket
//! for its TLS wrapper mid-session.

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

pub enum MailStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Placeholder held only inside the STARTTLS upgrade; never observable
    /// by I/O.
    Upgrading,
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MailStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            MailStream::Upgrading => panic!("read on a stream mid-upgrade"),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MailStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            MailStream::Upgrading => panic!("write on a stream mid-upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MailStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            MailStream::Upgrading => panic!("flush on a stream mid-upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MailStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            MailStream::Upgrading => panic!("shutdown on a stream mid-upgrade"),
        }
    }
}
