use super::{HandshakeStream, IoStream};
use crate::errors::*;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use native_tls::{HandshakeError, MidHandshakeTlsStream};
use snafu::ResultExt;
use std::io::{self, Read, Write};

/// Newtype wrapper around a `native_tls::TlsConnector` so the connection can
/// drive its handshake from the reactor.
pub struct TlsConnector(native_tls::TlsConnector);

impl TlsConnector {
    pub(crate) fn connect<S>(&self, domain: &str, stream: S) -> Result<TlsHandshakeStream<S>>
    where
        S: Read + Write,
    {
        let transition = Some(match self.0.connect(domain, stream) {
            Ok(s) => TlsTransition::Ready(s),
            Err(HandshakeError::WouldBlock(s)) => TlsTransition::Handshaking(s),
            Err(HandshakeError::Failure(err)) => Err(err).context(TlsHandshakeSnafu)?,
        });
        Ok(TlsHandshakeStream { transition })
    }
}

impl From<native_tls::TlsConnector> for TlsConnector {
    fn from(inner: native_tls::TlsConnector) -> TlsConnector {
        TlsConnector(inner)
    }
}

enum TlsTransition<S> {
    Handshaking(MidHandshakeTlsStream<S>),
    Ready(native_tls::TlsStream<S>),
}

impl<S: Read + Write> TlsTransition<S> {
    fn get_ref(&self) -> &S {
        match self {
            TlsTransition::Handshaking(s) => s.get_ref(),
            TlsTransition::Ready(s) => s.get_ref(),
        }
    }
}

/// A TLS session partway through its handshake. Nonblocking sockets surface
/// WouldBlock mid-handshake; the reactor retries on readiness until the
/// session is ready to carry frames.
pub(crate) struct TlsHandshakeStream<S> {
    // None only transiently inside progress_handshake, or after the finished
    // stream has been handed out.
    transition: Option<TlsTransition<S>>,
}

impl<S: Evented + Read + Write + 'static> HandshakeStream for TlsHandshakeStream<S> {
    type Stream = TlsStream<S>;

    fn progress_handshake(&mut self) -> Result<Option<Self::Stream>> {
        let mid = match self.transition.take().unwrap() {
            TlsTransition::Handshaking(mid) => mid,
            TlsTransition::Ready(s) => return Ok(Some(TlsStream(s))),
        };

        match mid.handshake() {
            Ok(s) => Ok(Some(TlsStream(s))),
            Err(HandshakeError::WouldBlock(s)) => {
                self.transition = Some(TlsTransition::Handshaking(s));
                Ok(None)
            }
            Err(HandshakeError::Failure(err)) => Err(err).context(TlsHandshakeSnafu)?,
        }
    }
}

impl<S: Evented + Read + Write> Evented for TlsHandshakeStream<S> {
    #[inline]
    fn register(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.transition
            .as_ref()
            .unwrap()
            .get_ref()
            .register(poll, token, interest, opts)
    }

    #[inline]
    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.transition
            .as_ref()
            .unwrap()
            .get_ref()
            .reregister(poll, token, interest, opts)
    }

    #[inline]
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.transition.as_ref().unwrap().get_ref().deregister(poll)
    }
}

/// An established TLS session over an underlying nonblocking stream.
pub struct TlsStream<S>(native_tls::TlsStream<S>);

impl<S: Evented + Read + Write + 'static> IoStream for TlsStream<S> {}

impl<S: Read + Write> Read for TlsStream<S> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<S: Evented + Read + Write> Evented for TlsStream<S> {
    #[inline]
    fn register(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.get_ref().register(poll, token, interest, opts)
    }

    #[inline]
    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.get_ref().reregister(poll, token, interest, opts)
    }

    #[inline]
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.0.get_ref().deregister(poll)
    }
}
