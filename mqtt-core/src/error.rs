use thiserror::Error;

/// Failures raised by the codec layer.
///
/// The codec performs no I/O; every variant here is a pure function of the
/// bytes it was given.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A fifth continuation byte would be required to decode the Remaining Length.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// The fixed header names a packet type outside 1..=14.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// The declared Remaining Length does not leave room for a fixed header byte.
    #[error("packet too short")]
    PacketTooShort,

    /// A variable-header or payload field did not parse per the packet's grammar.
    #[error("malformed packet body")]
    MalformedBody,

    /// A serializer was asked to emit more bytes than the caller's buffer holds.
    #[error("encoded packet exceeds buffer capacity")]
    BufferOverflow,
}
