//! Byte-stream transports a [`Connection`](crate::Connection) can run over.

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, Stdin, Stdout, WriteHalf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// A bidirectional byte stream, split into independently owned halves.
///
/// The read half feeds the framing decoder; the write half is owned by the
/// connection's single writer task.
pub trait Transport: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// The process's stdin/stdout, as used by editors launching a language
/// server.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioTransport;

impl Transport for StdioTransport {
    type Reader = Stdin;
    type Writer = Stdout;

    fn split(self) -> (Stdin, Stdout) {
        (tokio::io::stdin(), tokio::io::stdout())
    }
}

/// Any reader/writer pair.
#[derive(Debug)]
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<S> StreamTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits a single duplex stream (e.g. `tokio::io::duplex`) into a
    /// transport.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self { reader, writer }
    }
}

impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Reader = R;
    type Writer = W;

    fn split(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl Transport for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.into_split()
    }
}
