mod state;

use crate::auth::Sasl;
use crate::channel::Channel;
use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::frame_buffer::FrameBuffer;
use crate::heartbeats::HeartbeatClock;
use crate::registry::ChannelRegistry;
use crate::reply_queue::ReplyQueue;
use crate::serialize::{
    IntoAmqpClass, MethodKind, OutputBuffer, SealableOutputBuffer, TryFromAmqpFrame,
};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPProperties;
use amq_protocol::protocol::connection::{AMQPMethod as AmqpConnection, Close, CloseOk};
use amq_protocol::protocol::constants::REPLY_SUCCESS;
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::FieldTable;
use crossbeam_channel::Sender;
use log::{trace, warn};
use snafu::ResultExt;
use std::io;
use std::time::{Duration, Instant};

pub(crate) use self::state::ConnectionState;

// Bound on the inbound buffer until the server's tune tells us its frame max.
const INITIAL_BUFFER_MAX: usize = 128 * 1024;

/// Notifications the connection surfaces to the application.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Transport established; handshake beginning.
    Connected,
    /// Handshake complete; the connection is usable.
    Opened,
    /// Graceful close acknowledged by the server.
    Closed,
    /// Transport dropped or the server initiated a close.
    Disconnected { reason: String },
    /// A recoverable protocol or transport problem.
    Error { error: Error },
}

pub(crate) fn frame_channel(frame: &AMQPFrame) -> u16 {
    match frame {
        AMQPFrame::Method(channel_id, _) => *channel_id,
        AMQPFrame::Header(channel_id, _, _) => *channel_id,
        AMQPFrame::Body(channel_id, _) => *channel_id,
        AMQPFrame::Heartbeat(channel_id) => *channel_id,
        _ => 0,
    }
}

/// Everything the state machine needs to mutate while processing a frame.
/// Split out from [`Engine`] so `ConnectionState::process` can borrow the
/// state and the rest of the engine disjointly.
pub(crate) struct Inner<A: Sasl> {
    pub(super) options: ConnectionOptions<A>,
    pub(super) outbuf: SealableOutputBuffer,
    pub(super) frame_buffer: FrameBuffer,
    pub(super) channels: ChannelRegistry<Channel>,
    pub(super) replies0: ReplyQueue,
    pub(super) heartbeat: Option<HeartbeatClock>,
    pub(super) server_properties: FieldTable,
    user: Option<String>,
    pub(super) open: bool,
    events_tx: Sender<ConnectionEvent>,
}

impl<A: Sasl> Inner<A> {
    fn new(options: ConnectionOptions<A>, events_tx: Sender<ConnectionEvent>) -> Inner<A> {
        let user = options.auth.username();
        Inner {
            options,
            outbuf: SealableOutputBuffer::new(OutputBuffer::with_protocol_header()),
            frame_buffer: FrameBuffer::new(INITIAL_BUFFER_MAX),
            channels: ChannelRegistry::new(),
            replies0: ReplyQueue::new(),
            heartbeat: None,
            server_properties: FieldTable::new(),
            user,
            open: false,
            events_tx,
        }
    }

    pub(super) fn emit(&self, event: ConnectionEvent) {
        // a dropped receiver just means nobody is listening anymore
        let _ = self.events_tx.send(event);
    }

    pub(super) fn push_method<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
    ) -> Result<()> {
        self.outbuf.push_method(channel_id, method)
    }

    /// Server-initiated close: acknowledge politely, then go quiet.
    pub(super) fn acknowledge_server_close(&mut self, close: Close) -> Result<()> {
        warn!(
            "server closed connection (code={} message={})",
            close.reply_code, close.reply_text
        );
        self.open = false;
        self.push_method(0, AmqpConnection::CloseOk(CloseOk {}))?;
        self.outbuf.seal();
        for (_, mut channel) in self.channels.drain() {
            channel.set_open(false);
        }
        self.emit(ConnectionEvent::Disconnected {
            reason: close.reply_text,
        });
        Ok(())
    }

    fn call_expect<M, S, F>(
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
        if channel_id != 0 && self.channels.get_mut(channel_id).is_none() {
            return UnavailableChannelIdSnafu { channel_id }.fail();
        }
        self.push_method(channel_id, method)?;

        let queue = if channel_id == 0 {
            &mut self.replies0
        } else {
            // checked above
            self.channels.get_mut(channel_id).unwrap().reply_queue()
        };
        queue.next(move |frame| match frame {
            AMQPFrame::Method(_, class) => {
                let matched = MethodKind::of(&class).map_or(false, |kind| expected.contains(&kind));
                if matched {
                    on_success(class)
                } else {
                    on_failure(
                        UnexpectedReplySnafu {
                            expected: format!("{:?}", expected),
                            received: format!("{:?}", class),
                        }
                        .build(),
                    )
                }
            }
            _ => on_failure(ReplyNotMethodSnafu.build()),
        });
        Ok(())
    }

    fn call<M, T, S, F>(
        &mut self,
        channel_id: u16,
        method: M,
        on_success: S,
        on_failure: F,
    ) -> Result<()>
    where
        M: IntoAmqpClass,
        T: TryFromAmqpFrame + 'static,
        S: FnOnce(T) + 'static,
        F: FnOnce(Error) + 'static,
    {
        if channel_id != 0 && self.channels.get_mut(channel_id).is_none() {
            return UnavailableChannelIdSnafu { channel_id }.fail();
        }
        self.push_method(channel_id, method)?;

        let queue = if channel_id == 0 {
            &mut self.replies0
        } else {
            // checked above
            self.channels.get_mut(channel_id).unwrap().reply_queue()
        };
        queue.next(move |frame| match T::try_from_frame(channel_id, frame) {
            Ok(reply) => on_success(reply),
            Err(error) => on_failure(error),
        });
        Ok(())
    }
}

/// The sans-I/O connection engine: feed it inbound bytes, drain its outbound
/// buffer to the transport, and tick it from a timer. All protocol sequencing
/// lives here; the event loop around it only moves bytes and time.
pub(crate) struct Engine<A: Sasl> {
    state: ConnectionState,
    inner: Inner<A>,
}

impl<A: Sasl> Engine<A> {
    pub(crate) fn new(options: ConnectionOptions<A>, events_tx: Sender<ConnectionEvent>) -> Engine<A> {
        Engine {
            state: ConnectionState::Start,
            inner: Inner::new(options, events_tx),
        }
    }

    /// The transport is up. The protocol preamble is already queued; this
    /// only tells the application.
    pub(crate) fn on_connected(&mut self) {
        self.inner.emit(ConnectionEvent::Connected);
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.inner.frame_buffer.feed(bytes);
    }

    /// Drain and dispatch at most one frame. Returns true if another
    /// complete frame is still buffered, so the caller can schedule another
    /// turn instead of looping inline.
    pub(crate) fn drain_one(&mut self) -> bool {
        match self.inner.frame_buffer.drain_one() {
            Ok(Some(frame)) => {
                if let Err(error) = self.state.process(&mut self.inner, frame) {
                    self.inner.emit(ConnectionEvent::Error { error });
                }
            }
            Ok(None) => (),
            // desync; the buffer already discarded itself
            Err(err) => warn!("{}", err),
        }
        self.inner.frame_buffer.has_complete_frame()
    }

    /// Write a method frame and register an expectation for its reply on the
    /// given channel's queue. Expectations resolve in FIFO order relative to
    /// frame arrival.
    pub(crate) fn call_expect<M, S, F>(
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
        self.inner
            .call_expect(channel_id, method, expected, on_success, on_failure)
    }

    /// Like [`call_expect`](#method.call_expect), but the expected reply is a
    /// single method type known at compile time. This is the form the
    /// channel-operations layer uses for methods outside the connection
    /// class, e.g. expecting `channel.open-ok` after `channel.open`.
    pub(crate) fn call<M, T, S, F>(
        &mut self,
        channel_id: u16,
        method: M,
        on_success: S,
        on_failure: F,
    ) -> Result<()>
    where
        M: IntoAmqpClass,
        T: TryFromAmqpFrame + 'static,
        S: FnOnce(T) + 'static,
        F: FnOnce(Error) + 'static,
    {
        self.inner.call(channel_id, method, on_success, on_failure)
    }

    /// Write a method frame without registering any expectation. Used by the
    /// channel-operations layer for fire-and-forget methods.
    pub(crate) fn send_method<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
    ) -> Result<()> {
        self.inner.push_method(channel_id, method)
    }

    pub(crate) fn send_content(
        &mut self,
        channel_id: u16,
        class_id: u16,
        content: &[u8],
        properties: &AMQPProperties,
    ) -> Result<()> {
        self.inner
            .outbuf
            .push_content_header(channel_id, class_id, content.len(), properties)?;
        self.inner.outbuf.push_content_body(channel_id, content)
    }

    /// Begin a graceful close. The close-ok arrives later through the normal
    /// dispatch path; nothing else goes out after the close request.
    pub(crate) fn close(&mut self) -> Result<()> {
        snafu::ensure!(self.inner.open, ConnectionNotOpenSnafu);
        self.inner.open = false;
        self.inner.push_method(
            0,
            AmqpConnection::Close(Close {
                reply_code: u16::from(REPLY_SUCCESS),
                reply_text: "goodbye".to_string(),
                class_id: 0,
                method_id: 0,
            }),
        )?;
        self.inner.outbuf.seal();
        self.state = ConnectionState::Closing;
        Ok(())
    }

    /// Transport dropped out from under us; no graceful protocol close is
    /// attempted.
    pub(crate) fn handle_disconnect(&mut self, reason: String) {
        self.inner.open = false;
        self.inner.outbuf.clear();
        self.inner.outbuf.seal();
        for (_, mut channel) in self.inner.channels.drain() {
            channel.set_open(false);
        }
        self.inner.emit(ConnectionEvent::Disconnected { reason });
        self.state = ConnectionState::Closed;
    }

    pub(crate) fn heartbeat_tick(&mut self, now: Instant) {
        if let Some(clock) = &mut self.inner.heartbeat {
            if clock.should_send(now) {
                trace!("tx side quiet; sending heartbeat");
                self.inner.outbuf.push_heartbeat();
            }
        }
    }

    pub(crate) fn tick_interval(&self) -> Option<Duration> {
        self.inner.heartbeat.as_ref().map(HeartbeatClock::tick_interval)
    }

    pub(crate) fn create_channel(&mut self, channel_id: Option<u16>) -> Result<u16> {
        snafu::ensure!(self.inner.open, ConnectionNotOpenSnafu);
        self.inner.channels.insert(channel_id, |id| {
            let mut channel = Channel::new(id);
            channel.set_open(true);
            Ok((channel, id))
        })
    }

    pub(crate) fn channel_mut(&mut self, channel_id: u16) -> Option<&mut Channel> {
        self.inner.channels.get_mut(channel_id)
    }

    pub(crate) fn remove_channel(&mut self, channel_id: u16) -> Option<Channel> {
        let mut channel = self.inner.channels.remove(channel_id)?;
        channel.set_open(false);
        Some(channel)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.open
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub(crate) fn server_properties(&self) -> &FieldTable {
        &self.inner.server_properties
    }

    pub(crate) fn user(&self) -> Option<&str> {
        self.inner.user.as_deref()
    }

    pub(crate) fn wants_write(&self) -> bool {
        !self.inner.outbuf.is_empty()
    }

    /// Flush as much of the outbound buffer as the stream will take.
    /// Stops cleanly on WouldBlock; any bytes written count as tx activity
    /// for heartbeat purposes.
    pub(crate) fn write_to<S: io::Write>(&mut self, stream: &mut S) -> Result<()> {
        while !self.inner.outbuf.is_empty() {
            match stream.write(&self.inner.outbuf[0..]) {
                Ok(0) => return UnexpectedSocketCloseSnafu.fail(),
                Ok(n) => {
                    self.inner.outbuf.drain_written(n);
                    if let Some(clock) = &mut self.inner.heartbeat {
                        clock.record_tx(Instant::now());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err).context(IoSnafu),
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn inbound_buffer_max(&self) -> usize {
        self.inner.frame_buffer.max_size()
    }
}
