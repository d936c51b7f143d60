use snafu::Snafu;
use std::io;

/// A type alias for handling errors throughout amqplite.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error that can occur from amqplite.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    #[snafu(display("received malformed data - expected AMQP frame"))]
    MalformedFrame,

    #[snafu(display("I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("invalid AMQP URL: {}", url))]
    InvalidUrl { url: String },

    #[cfg(feature = "native-tls")]
    #[snafu(display("TLS handshake failed: {}", source))]
    TlsHandshake { source: native_tls::Error },

    #[cfg(feature = "native-tls")]
    #[snafu(display("invalid TLS configuration: {}", source))]
    TlsConfig { source: native_tls::Error },

    #[snafu(display(
        "requested auth mechanism {} unavailable (server offers: {})",
        requested,
        available
    ))]
    UnsupportedAuthMechanism { available: String, requested: String },

    #[snafu(display(
        "requested locale {} unavailable (server offers: {})",
        requested,
        available
    ))]
    UnsupportedLocale { available: String, requested: String },

    #[snafu(display("credentials cannot be encoded for the SASL response"))]
    InvalidCredentials,

    #[snafu(display("server frame max {} is too small (min = {})", requested, min))]
    FrameMaxTooSmall { requested: u32, min: u32 },

    #[snafu(display("SASL secure/secure-ok exchanges are not supported"))]
    SaslSecureNotSupported,

    #[snafu(display("amqps URLs require the native-tls feature"))]
    TlsFeatureNotEnabled,

    #[snafu(display("handshake failed - expected {} but received {}", expected, received))]
    HandshakeWrongServerFrame {
        expected: &'static str,
        received: String,
    },

    #[snafu(display("received reply is not a method frame"))]
    ReplyNotMethod,

    #[snafu(display("expected reply of type {} but received {}", expected, received))]
    UnexpectedReply { expected: String, received: String },

    #[snafu(display("AMQP protocol error - received unexpected frame"))]
    FrameUnexpected,

    #[snafu(display("no more channel ids are available"))]
    ExhaustedChannelIds,

    #[snafu(display("requested channel id {} is unavailable", channel_id))]
    UnavailableChannelId { channel_id: u16 },

    #[snafu(display("received frame for nonexistent channel {}", channel_id))]
    ReceivedFrameWithBogusChannelId { channel_id: u16 },

    #[snafu(display("connection is not open"))]
    ConnectionNotOpen,

    #[snafu(display("internal serialization error (this is a bug in amqplite)"))]
    InternalSerializationError,
}
