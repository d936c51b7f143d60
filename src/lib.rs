#![allow(dead_code)]

mod auth;
mod channel;
mod connection;
mod connection_options;
mod engine;
mod errors;
mod event_loop;
mod frame_buffer;
mod heartbeats;
mod registry;
mod reply_queue;
mod serialize;
mod stream;

pub use auth::{Auth, Sasl};
pub use channel::Channel;
pub use connection::Connection;
pub use connection_options::ConnectionOptions;
pub use engine::ConnectionEvent;
pub use errors::{Error, Result};
pub use event_loop::Reactor;
pub use reply_queue::ReplyQueue;
pub use serialize::{IntoAmqpClass, MethodKind, TryFromAmqpClass};
pub use stream::IoStream;

#[cfg(feature = "native-tls")]
pub use stream::{TlsConnector, TlsStream};

pub use amq_protocol::frame::AMQPFrame;
pub use amq_protocol::protocol::basic::AMQPProperties as AmqpProperties;
pub use amq_protocol::protocol::AMQPClass;
pub use amq_protocol::types::AMQPValue as AmqpValue;
pub use amq_protocol::types::FieldTable;
