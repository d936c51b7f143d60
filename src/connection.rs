use crate::auth::{Auth, Sasl};
use crate::channel::Channel;
use crate::connection_options::ConnectionOptions;
use crate::engine::{ConnectionEvent, Engine};
use crate::errors::*;
use crate::event_loop::{Reactor, HEARTBEAT, STREAM};
use crate::serialize::{IntoAmqpClass, MethodKind, TryFromAmqpClass};
use crate::stream::{IoStream, Stream};
use amq_protocol::protocol::basic::AMQPProperties;
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::FieldTable;
use crossbeam_channel::Receiver;
use log::{debug, trace};
use mio::{PollOpt, Ready};
use mio_extras::timer::Timeout;
use snafu::ResultExt;
use std::io::{self, Read};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 8 * 1024;

/// A single AMQP connection over one transport stream, driven cooperatively
/// from the reactor it was built with.
///
/// Nothing runs in the background: [`run_once`](#method.run_once) (or
/// [`run`](#method.run)) must be called to move bytes and time forward.
/// Everything that happens is reported through [`events`](#method.events).
pub struct Connection<A: Sasl = Auth> {
    reactor: Reactor,
    stream: Stream,
    engine: Engine<A>,
    events_rx: Receiver<ConnectionEvent>,
    heartbeat_timeout: Option<Timeout>,
    // A complete frame is already buffered; the next turn should drain it
    // without waiting on I/O.
    drain_scheduled: bool,
}

impl Connection {
    /// Open a connection to an AMQP URL (`amqp://` or `amqps://`).
    pub fn open_url(reactor: Reactor, url: &str) -> Result<Connection> {
        self::amqp_url::open(reactor, url)
    }
}

impl<A: Sasl> Connection<A> {
    /// Begin a connection over an established transport. The protocol
    /// preamble is queued immediately; the handshake proceeds as the
    /// connection is run.
    pub fn open<S: IoStream>(
        reactor: Reactor,
        stream: S,
        options: ConnectionOptions<A>,
    ) -> Result<Connection<A>> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut engine = Engine::new(options, events_tx);
        reactor
            .poll
            .register(
                &stream,
                STREAM,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .context(IoSnafu)?;
        engine.on_connected();
        Ok(Connection {
            reactor,
            stream: Stream::new(stream),
            engine,
            events_rx,
            heartbeat_timeout: None,
            drain_scheduled: false,
        })
    }

    /// Notifications from the connection, in the order they occurred.
    pub fn events(&self) -> &Receiver<ConnectionEvent> {
        &self.events_rx
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    pub fn server_properties(&self) -> &FieldTable {
        self.engine.server_properties()
    }

    /// The user name this connection authenticated as, if the mechanism
    /// carries one.
    pub fn user(&self) -> Option<&str> {
        self.engine.user()
    }

    /// Run one scheduler turn: wait for I/O readiness or a timer (unless a
    /// drained frame is already pending), then read, dispatch at most one
    /// frame, tick heartbeats, and flush writes.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = if self.drain_scheduled {
            Some(Duration::from_millis(0))
        } else {
            timeout
        };
        self.reactor
            .poll
            .poll(&mut self.reactor.events, timeout)
            .context(IoSnafu)?;

        let mut readable = false;
        let mut heartbeat_fired = false;
        for event in self.reactor.events.iter() {
            match event.token() {
                STREAM => {
                    if event.readiness().is_readable() {
                        readable = true;
                    }
                }
                HEARTBEAT => heartbeat_fired = true,
                _ => unreachable!(),
            }
        }

        if readable {
            self.read_stream();
        }
        if heartbeat_fired {
            self.heartbeat_fired();
        }

        // one frame per turn bounds latency no matter how many frames a
        // single read delivered
        self.drain_scheduled = self.engine.drain_one();

        self.ensure_heartbeat_scheduled();
        self.flush();
        Ok(())
    }

    /// Drive the connection until it is closed.
    pub fn run(&mut self) -> Result<()> {
        while !self.engine.is_closed() {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Gracefully close the connection, driving the reactor until the
    /// server's close-ok arrives or the transport drops.
    pub fn close(&mut self) -> Result<()> {
        self.engine.close()?;
        debug!("closing connection");
        while !self.engine.is_closed() {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Register a channel, allocating the lowest unused id when none is
    /// requested. The connection must be open.
    pub fn create_channel(&mut self, channel_id: Option<u16>) -> Result<u16> {
        self.engine.create_channel(channel_id)
    }

    pub fn channel(&mut self, channel_id: u16) -> Option<&mut Channel> {
        self.engine.channel_mut(channel_id)
    }

    /// Remove a channel from the routing table, returning it if present.
    pub fn remove_channel(&mut self, channel_id: u16) -> Option<Channel> {
        self.engine.remove_channel(channel_id)
    }

    /// Write a method frame without expecting a reply.
    pub fn send_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        self.engine.send_method(channel_id, method)
    }

    /// Write a content header and body for a channel-level publish.
    pub fn send_content(
        &mut self,
        channel_id: u16,
        class_id: u16,
        content: &[u8],
        properties: &AMQPProperties,
    ) -> Result<()> {
        self.engine.send_content(channel_id, class_id, content, properties)
    }

    /// Write a method frame and register interest in its reply: `on_success`
    /// runs when the next method frame on the channel's reply queue matches
    /// one of `expected`, `on_failure` otherwise. Replies resolve in FIFO
    /// order relative to the requests issued on the same channel.
    pub fn call_expect<M, S, F>(
        &mut self,
        channel_id: u16,
        method: M,
        expected: &'static [MethodKind],
        on_success: S,
        on_failure: F,
    ) -> Result<()>
    where
        M: IntoAmqpClass,
        S: FnOnce(AMQPClass) + 'static,
        F: FnOnce(Error) + 'static,
    {
        self.engine
            .call_expect(channel_id, method, expected, on_success, on_failure)
    }

    /// Like [`call_expect`](#method.call_expect), but for a reply type known
    /// at compile time. This is the form the channel-operations layer uses
    /// for method classes the connection core does not itself interpret:
    /// `call(id, channel.close, ...)` with `T = channel::CloseOk` expects a
    /// `channel.close-ok` on that channel's reply queue.
    pub fn call<M, T, S, F>(
        &mut self,
        channel_id: u16,
        method: M,
        on_success: S,
        on_failure: F,
    ) -> Result<()>
    where
        M: IntoAmqpClass,
        T: TryFromAmqpClass + 'static,
        S: FnOnce(T) + 'static,
        F: FnOnce(Error) + 'static,
    {
        self.engine.call(channel_id, method, on_success, on_failure)
    }

    fn read_stream(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.engine
                        .handle_disconnect("socket closed by peer".to_string());
                    return;
                }
                Ok(n) => {
                    trace!("read {} bytes", n);
                    self.engine.feed(&chunk[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.engine.handle_disconnect(err.to_string());
                    return;
                }
            }
        }
    }

    fn heartbeat_fired(&mut self) {
        // the timer is edge triggered; drain all expirations
        while self.reactor.timer.poll().is_some() {}
        self.heartbeat_timeout = None;
        self.engine.heartbeat_tick(Instant::now());
    }

    fn ensure_heartbeat_scheduled(&mut self) {
        if self.heartbeat_timeout.is_none() {
            if let Some(interval) = self.engine.tick_interval() {
                self.heartbeat_timeout = Some(self.reactor.timer.set_timeout(interval, ()));
            }
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.engine.write_to(&mut self.stream) {
            self.engine.handle_disconnect(err.to_string());
        }
    }
}

impl<A: Sasl> Drop for Connection<A> {
    fn drop(&mut self) {
        if let Some(timeout) = self.heartbeat_timeout.take() {
            let _ = self.reactor.timer.cancel_timeout(&timeout);
        }
    }
}

mod amqp_url {
    use super::*;
    use mio::net::TcpStream;
    use percent_encoding::percent_decode;
    use std::borrow::Cow;
    use std::net::{SocketAddr, TcpStream as StdTcpStream};
    use std::path::PathBuf;
    use url::Url;

    #[derive(Debug, PartialEq)]
    enum Scheme {
        Amqp,
        Amqps,
    }

    #[derive(Debug, Default, PartialEq)]
    struct TlsParams {
        ca: Option<PathBuf>,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
        verify: bool,
    }

    pub(super) fn open(reactor: Reactor, url: &str) -> Result<Connection> {
        let mut url = parse(url)?;
        let scheme = populate_host_and_port(&mut url)?;
        let (options, tls) = decode(&url)?;

        match scheme {
            Scheme::Amqp => {
                let stream = connect_tcp(&url, &options)?;
                Connection::open(reactor, stream, options)
            }
            #[cfg(feature = "native-tls")]
            Scheme::Amqps => open_amqps(reactor, &url, options, &tls),
            #[cfg(not(feature = "native-tls"))]
            Scheme::Amqps => {
                let _ = tls;
                TlsFeatureNotEnabledSnafu.fail()
            }
        }
    }

    fn invalid(url: &str) -> Error {
        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .build()
    }

    fn parse(url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(parsed) => Ok(parsed),
            // the url crate rejects userinfo next to an omitted host
            // ("amqp://user:pass@/") before we get a chance to default it;
            // splice the default host in and parse again
            Err(url::ParseError::EmptyHost) => {
                let spliced = splice_default_host(url).ok_or_else(|| invalid(url))?;
                Url::parse(&spliced).map_err(|_| invalid(url))
            }
            Err(_) => Err(invalid(url)),
        }
    }

    fn splice_default_host(url: &str) -> Option<String> {
        let authority = url.find("://")? + 3;
        let authority_end = url[authority..]
            .find(|c| c == '/' || c == '?' || c == '#')
            .map_or(url.len(), |i| authority + i);
        let host = url[authority..authority_end].rfind('@')? + authority + 1;
        let mut spliced = String::with_capacity(url.len() + "localhost".len());
        spliced.push_str(&url[..host]);
        spliced.push_str("localhost");
        spliced.push_str(&url[host..]);
        Some(spliced)
    }

    fn populate_host_and_port(url: &mut Url) -> Result<Scheme> {
        if !url.has_host() || url.host_str() == Some("") {
            url.set_host(Some("localhost"))
                .map_err(|_| invalid(url.as_str()))?;
        }
        let (scheme, default_port) = match url.scheme() {
            "amqp" | "rabbitmq" => (Scheme::Amqp, 5672),
            "amqps" | "rabbitmqs" => (Scheme::Amqps, 5671),
            _ => return Err(invalid(url.as_str())),
        };
        let port = url.port().unwrap_or(default_port);
        url.set_port(Some(port))
            .map_err(|_| invalid(url.as_str()))?;
        Ok(scheme)
    }

    fn decode(url: &Url) -> Result<(ConnectionOptions<Auth>, TlsParams)> {
        fn decoded(s: &str) -> Cow<str> {
            percent_decode(s.as_bytes()).decode_utf8_lossy()
        }
        let invalid_url = || invalid(url.as_str());

        let mut options = ConnectionOptions::default();
        let mut tls = TlsParams {
            verify: true,
            ..TlsParams::default()
        };

        if let Some(mut path_segments) = url.path_segments() {
            // first next() always yields a segment, per the url docs
            let vhost = path_segments.next().unwrap();

            // "amqp://host" has no vhost (default "/") while "amqp://host/"
            // has a vhost of ""; the url lib cannot distinguish them, so an
            // empty segment keeps the default and "" cannot be specified
            if vhost != "" {
                options = options.virtual_host(decoded(vhost));
            }
            if path_segments.next().is_some() {
                return Err(invalid_url());
            }
        }

        if url.username() != "" || url.password().is_some() {
            let username = match url.username() {
                "" => "guest",
                other => other,
            };
            options = options.auth(Auth::AmqpLain {
                username: decoded(username).to_string(),
                password: decoded(url.password().unwrap_or("guest")).to_string(),
            });
        }

        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "heartbeat" => {
                    let v = v.parse::<u16>().map_err(|_| invalid_url())?;
                    options = options.heartbeat(v);
                }
                "connection_timeout" => {
                    let v = v.parse::<u64>().map_err(|_| invalid_url())?;
                    options = options.connection_timeout(Some(Duration::from_millis(v)));
                }
                "ca" => tls.ca = Some(PathBuf::from(v.as_ref())),
                "cert" => tls.cert = Some(PathBuf::from(v.as_ref())),
                "key" => tls.key = Some(PathBuf::from(v.as_ref())),
                "verify" => {
                    // hex-encoded flag; 0 disables certificate verification
                    let v = u32::from_str_radix(v.as_ref(), 16).map_err(|_| invalid_url())?;
                    tls.verify = v != 0;
                }
                _ => return Err(invalid_url()),
            }
        }
        if tls.cert.is_some() != tls.key.is_some() {
            return Err(invalid_url());
        }

        Ok((options, tls))
    }

    fn connect_tcp(url: &Url, options: &ConnectionOptions<Auth>) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = url.socket_addrs(|| None).context(IoSnafu)?;
        let mut last_err = invalid(url.as_str());
        for addr in addrs {
            let result = match options.connection_timeout {
                Some(timeout) => StdTcpStream::connect_timeout(&addr, timeout),
                None => StdTcpStream::connect(&addr),
            };
            match result {
                Ok(stream) => {
                    stream.set_nonblocking(true).context(IoSnafu)?;
                    return TcpStream::from_stream(stream).context(IoSnafu);
                }
                Err(err) => last_err = Error::Io { source: err },
            }
        }
        Err(last_err)
    }

    #[cfg(feature = "native-tls")]
    fn open_amqps(
        mut reactor: Reactor,
        url: &Url,
        options: ConnectionOptions<Auth>,
        tls: &TlsParams,
    ) -> Result<Connection> {
        use crate::stream::HandshakeStream;
        use crate::stream::TlsConnector;

        let connector = TlsConnector::from(build_connector(tls)?);
        let domain = match url.domain() {
            Some(domain) => domain.to_string(),
            None => return Err(invalid(url.as_str())),
        };

        let tcp = connect_tcp(url, &options)?;
        let mut handshake = connector.connect(&domain, tcp)?;

        // drive the TLS handshake to completion before the AMQP handshake
        // takes over the stream registration
        reactor
            .poll
            .register(
                &handshake,
                STREAM,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .context(IoSnafu)?;
        let stream = loop {
            if let Some(stream) = handshake.progress_handshake()? {
                break stream;
            }
            reactor
                .poll
                .poll(&mut reactor.events, None)
                .context(IoSnafu)?;
        };
        reactor.poll.deregister(&stream).context(IoSnafu)?;

        Connection::open(reactor, stream, options)
    }

    #[cfg(feature = "native-tls")]
    fn build_connector(tls: &TlsParams) -> Result<native_tls::TlsConnector> {
        use std::fs;

        let mut builder = native_tls::TlsConnector::builder();
        if let Some(ca) = &tls.ca {
            let pem = fs::read(ca).context(IoSnafu)?;
            let cert = native_tls::Certificate::from_pem(&pem).context(TlsConfigSnafu)?;
            builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
            let cert_pem = fs::read(cert).context(IoSnafu)?;
            let key_pem = fs::read(key).context(IoSnafu)?;
            let identity =
                native_tls::Identity::from_pkcs8(&cert_pem, &key_pem).context(TlsConfigSnafu)?;
            builder.identity(identity);
        }
        if !tls.verify {
            builder.danger_accept_invalid_certs(true);
        }
        builder.build().context(TlsConfigSnafu)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn decode_s(s: &str) -> Result<(ConnectionOptions<Auth>, TlsParams)> {
            decode(&parse(s).unwrap())
        }

        fn options_of(s: &str) -> ConnectionOptions<Auth> {
            decode_s(s).unwrap().0
        }

        #[test]
        fn empty_default() {
            assert_eq!(options_of("amqp://"), ConnectionOptions::default());
            assert_eq!(options_of("amqps://"), ConnectionOptions::default());
        }

        #[test]
        fn vhost() {
            assert_eq!(
                options_of("amqp:///vhost"),
                ConnectionOptions::default().virtual_host("vhost")
            );
            assert_eq!(
                options_of("amqp:///v%2fhost"),
                ConnectionOptions::default().virtual_host("v/host")
            );
            assert!(decode_s("amqp:///vhost/nonescapedslash").is_err());
        }

        #[test]
        fn user_pass() {
            assert_eq!(
                options_of("amqp://user:pass@/"),
                ConnectionOptions::default().auth(Auth::AmqpLain {
                    username: "user".to_string(),
                    password: "pass".to_string(),
                })
            );
            assert_eq!(
                options_of("amqp://user%61:pass%62@/"),
                ConnectionOptions::default().auth(Auth::AmqpLain {
                    username: "usera".to_string(),
                    password: "passb".to_string(),
                })
            );
        }

        #[test]
        fn userinfo_with_omitted_host() {
            // credentials next to a defaulted host must survive parsing
            let url = parse("amqp://user:pass@/vhost").unwrap();
            assert_eq!(url.host_str(), Some("localhost"));
            assert_eq!(
                decode(&url).unwrap().0,
                ConnectionOptions::default()
                    .virtual_host("vhost")
                    .auth(Auth::AmqpLain {
                        username: "user".to_string(),
                        password: "pass".to_string(),
                    })
            );

            // a port with no host has no userinfo to anchor the splice
            assert!(parse("amqp://:5672/").is_err());
        }

        #[test]
        fn heartbeat() {
            assert_eq!(
                options_of("amqp://?heartbeat=13"),
                ConnectionOptions::default().heartbeat(13)
            );
            assert!(decode_s("amqp://?heartbeat=x").is_err());
        }

        #[test]
        fn connection_timeout() {
            assert_eq!(
                options_of("amqp://?connection_timeout=13"),
                ConnectionOptions::default().connection_timeout(Some(Duration::from_millis(13)))
            );
        }

        #[test]
        fn tls_params() {
            let (_, tls) = decode_s("amqps://?ca=/etc/ca.pem&cert=c.pem&key=k.pem").unwrap();
            assert_eq!(tls.ca.as_deref(), Some(std::path::Path::new("/etc/ca.pem")));
            assert!(tls.verify);

            let (_, tls) = decode_s("amqps://?verify=0").unwrap();
            assert!(!tls.verify);

            // cert without key is incomplete
            assert!(decode_s("amqps://?cert=c.pem").is_err());
        }

        #[test]
        fn unknown_query_param() {
            assert!(decode_s("amqp://?nope=1").is_err());
        }

        #[test]
        fn scheme_and_port() {
            let mut url = Url::parse("amqp://host").unwrap();
            assert_eq!(populate_host_and_port(&mut url).unwrap(), Scheme::Amqp);
            assert_eq!(url.port(), Some(5672));

            let mut url = Url::parse("amqps://host").unwrap();
            assert_eq!(populate_host_and_port(&mut url).unwrap(), Scheme::Amqps);
            assert_eq!(url.port(), Some(5671));

            let mut url = Url::parse("rabbitmq://").unwrap();
            assert_eq!(populate_host_and_port(&mut url).unwrap(), Scheme::Amqp);
            assert_eq!(url.host_str(), Some("localhost"));

            let mut url = Url::parse("http://host").unwrap();
            assert!(populate_host_and_port(&mut url).is_err());
        }
    }
}
