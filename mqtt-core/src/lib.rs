//! Pure, allocation-light encoding and decoding of MQTT 3.1.1 control packets.
//!
//! This crate performs no I/O: [`frame::next_frame`] frames a packet off a
//! byte slice, [`decode::parse_body`] (or [`Packet::parse`]) interprets the
//! body, and the `encode` methods on the packet types serialize a packet
//! back into a caller-provided buffer.

#[macro_use]
extern crate bitflags;

mod encode;
mod error;
mod frame;
mod packet;

pub mod decode;

pub use encode::encode_ping_resp;
pub use error::CodecError;
pub use frame::{next_frame, write_remaining_length, Frame};
pub use packet::{
    Connect, ConnectAck, ConnectAckFlags, ConnectFlags, ConnectReturnCode, FixedHeader, LastWill,
    Packet, PacketId, Publish, PublishAck, PublishComplete, PublishFlags, PublishReceived,
    PublishRelease, QoS, Subscribe, SubscribeAck, SubscribeReturnCode, Type, Unsubscribe,
    UnsubscribeAck, PROTOCOL_LEVEL, PROTOCOL_NAME,
};
