use crate::errors::Result;
use mio::net::TcpStream;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use std::io::{self, Read, Write};

#[cfg(feature = "native-tls")]
mod native_tls;

#[cfg(feature = "native-tls")]
pub(crate) use self::native_tls::TlsHandshakeStream;
#[cfg(feature = "native-tls")]
pub use self::native_tls::{TlsConnector, TlsStream};

/// Transport a connection can drive: nonblocking reads and writes plus
/// registration with the reactor's poll.
pub trait IoStream: Read + Write + Evented + 'static {}

impl IoStream for TcpStream {}

/// A transport still completing its own handshake (e.g. TLS) before it can
/// carry AMQP traffic.
pub(crate) trait HandshakeStream: Evented {
    type Stream: IoStream;

    /// Try to make progress, returning the finished stream once the
    /// handshake completes.
    fn progress_handshake(&mut self) -> Result<Option<Self::Stream>>;
}

/// Type-erased transport owned by the connection.
pub(crate) struct Stream(Box<dyn IoStream>);

impl Stream {
    pub(crate) fn new<S: IoStream>(stream: S) -> Stream {
        Stream(Box::new(stream))
    }
}

impl Read for Stream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for Stream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Evented for Stream {
    #[inline]
    fn register(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.register(poll, token, interest, opts)
    }

    #[inline]
    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.reregister(poll, token, interest, opts)
    }

    #[inline]
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.0.deregister(poll)
    }
}
