use super::{frame_channel, ConnectionEvent, Inner};
use crate::auth::Sasl;
use crate::errors::*;
use crate::heartbeats::HeartbeatClock;
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::AMQPClass;
use log::{debug, trace};
use std::time::Instant;

/// Progress of the connection-level negotiation. Each handshake state
/// advances only on the one server frame it expects; a mismatch is an error
/// and the state stays put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Start,
    Tune,
    Open,
    Steady,
    Closing,
    Closed,
}

fn wrong_frame<T>(expected: &'static str, frame: &AMQPFrame) -> Result<T> {
    HandshakeWrongServerFrameSnafu {
        expected,
        received: format!("{:?}", frame),
    }
    .fail()
}

impl ConnectionState {
    pub(crate) fn process<A: Sasl>(
        &mut self,
        inner: &mut Inner<A>,
        frame: AMQPFrame,
    ) -> Result<()> {
        // heartbeats carry no payload; they only stamp the rx clock
        if let AMQPFrame::Heartbeat(0) = frame {
            trace!("received heartbeat");
            if let Some(clock) = &mut inner.heartbeat {
                clock.record_rx(Instant::now());
            }
            return Ok(());
        }

        match self {
            ConnectionState::Start => {
                let start = match frame {
                    AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Start(start))) => {
                        start
                    }
                    frame => return wrong_frame("connection.start", &frame),
                };
                debug!("received connection.start; sending start-ok");
                let (start_ok, server_properties) = inner.options.make_start_ok(start)?;
                inner.server_properties = server_properties;
                inner.push_method(0, AmqpConnection::StartOk(start_ok))?;
                *self = ConnectionState::Tune;
            }
            ConnectionState::Tune => {
                let tune = match frame {
                    AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Tune(tune))) => tune,
                    AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Secure(_))) => {
                        return SaslSecureNotSupportedSnafu.fail();
                    }
                    frame => return wrong_frame("connection.tune", &frame),
                };
                debug!("received connection.tune; sending tune-ok and open");
                let tune_ok = inner.options.make_tune_ok(tune)?;
                inner.channels.set_channel_max(tune_ok.channel_max);
                if tune_ok.frame_max != 0 {
                    // the negotiated frame max bounds the inbound buffer
                    inner.frame_buffer.set_max_size(tune_ok.frame_max as usize);
                }
                inner.heartbeat = HeartbeatClock::new(tune_ok.heartbeat, Instant::now());
                inner.push_method(0, AmqpConnection::TuneOk(tune_ok))?;
                inner.push_method(0, AmqpConnection::Open(inner.options.make_open()))?;
                *self = ConnectionState::Open;
            }
            ConnectionState::Open => match frame {
                AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::OpenOk(_))) => {
                    debug!("received connection.open-ok; connection is open");
                    inner.open = true;
                    inner.emit(ConnectionEvent::Opened);
                    *self = ConnectionState::Steady;
                }
                AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Close(close))) => {
                    // server refused the open (bad vhost, acl)
                    inner.acknowledge_server_close(close)?;
                    *self = ConnectionState::Closed;
                }
                frame => return wrong_frame("connection.open-ok", &frame),
            },
            ConnectionState::Steady => match frame {
                AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Close(close))) => {
                    inner.acknowledge_server_close(close)?;
                    *self = ConnectionState::Closed;
                }
                frame => match frame_channel(&frame) {
                    0 => inner.replies0.push(frame),
                    channel_id => match inner.channels.get_mut(channel_id) {
                        Some(channel) => channel.push_or_consume(frame),
                        None => {
                            return ReceivedFrameWithBogusChannelIdSnafu { channel_id }.fail();
                        }
                    },
                },
            },
            ConnectionState::Closing => match frame {
                AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::CloseOk(_))) => {
                    debug!("received connection.close-ok; connection closed cleanly");
                    inner.emit(ConnectionEvent::Closed);
                    *self = ConnectionState::Closed;
                }
                frame => trace!("discarding frame received while closing: {:?}", frame),
            },
            ConnectionState::Closed => return FrameUnexpectedSnafu.fail(),
        }
        Ok(())
    }
}
