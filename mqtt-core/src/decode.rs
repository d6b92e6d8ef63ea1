use core::convert::TryFrom;
use core::str;

use nom::{
    bytes::complete::{tag, take, take_while_m_n},
    combinator::{map, map_opt, map_res, recognize, verify},
    error::{context, ParseError},
    multi::{length_data, many1},
    number::complete::{be_u16, be_u8},
    sequence::{pair, tuple},
    IResult,
};

use crate::packet::*;

impl FixedHeader {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(
            tuple((
                map_res(
                    be_u8,
                    |b| -> Result<_, num_enum::TryFromPrimitiveError<Type>> {
                        let packet_type = Type::try_from((b >> 4) & 0x0F)?;
                        let packet_flags = b & 0x0F;

                        Ok((packet_type, packet_flags))
                    },
                ),
                variable_length,
            )),
            |((packet_type, packet_flags), remaining_length)| FixedHeader {
                packet_type,
                packet_flags,
                remaining_length,
            },
        )(input)
    }
}

const CONTINUATION_BIT: u8 = 0x80;

fn variable_length<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], usize, E> {
    context(
        "variable length",
        map(
            verify(
                recognize(pair(
                    take_while_m_n(0, 3, |b| (b & CONTINUATION_BIT) != 0),
                    verify(be_u8, |b| (b & CONTINUATION_BIT) == 0),
                )),
                |s: &[u8]| s.len() <= 4,
            ),
            |s: &[u8]| {
                s.iter().enumerate().fold(0, |value, (i, b)| {
                    value + (usize::from(*b & !CONTINUATION_BIT) << (7 * i))
                })
            },
        ),
    )(input)
}

/// Text fields in the Control Packets described later are encoded as UTF-8 strings.
fn utf8_str<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context("utf8 string", map_res(length_data(be_u16), str::from_utf8))(input)
}

const CLIENT_ID_MAX_LEN: usize = 127;

/// The Client Identifier (ClientId) identifies the Client to the Server.
///
/// Each Client connecting to the Server has a unique ClientId.
/// The ClientId MUST be used by Clients and by Servers to identify state
/// that they hold relating to this MQTT Session between the Client and the Server [MQTT-3.1.3-2].
///
/// The spec here treats the field as an opaque byte string up to 127 bytes
/// (rather than the RFC's stricter 1-23 alphanumeric minimum a server is
/// merely required to *accept*); an empty id is allowed through and
/// synthesized by the session layer.
fn client_id<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context(
        "client id",
        verify(utf8_str, |s: &str| s.len() <= CLIENT_ID_MAX_LEN),
    )(input)
}

/// The Topic Name identifies the information channel to which payload data is published.
///
/// The label attached to an Application Message which is matched against the Subscriptions known to the Server.
/// The Server sends a copy of the Application Message to each Client that has a matching Subscription.
fn topic_name<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context(
        "topic name",
        verify(utf8_str, |s: &str| s.bytes().all(|c| c != b'#')),
    )(input)
}

/// An expression contained in a Subscription, to indicate an interest in one or more topics.
///
/// A Topic Filter can include wildcard characters.
fn topic_filter<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context("topic filter", utf8_str)(input)
}

/// A Subscription comprises a Topic Filter and a maximum QoS.
/// A Subscription is associated with a single Session.
/// A Session can contain more than one Subscription.
/// Each Subscription within a session has a different Topic Filter.
fn subscription<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], (&'a str, QoS), E> {
    context(
        "subscription",
        tuple((topic_filter, context("QoS", map_res(be_u8, QoS::try_from)))),
    )(input)
}

fn packet_id<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], PacketId, E> {
    context("packet_id", be_u16)(input)
}

impl Packet<'_> {
    pub fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Packet<'a>, E> {
        let (input, fixed_header) = FixedHeader::parse(input)?;
        let (remaining, body) = take(fixed_header.remaining_length)(input)?;
        let (_, packet) =
            parse_body(fixed_header.packet_type, fixed_header.packet_flags, body)?;

        Ok((remaining, packet))
    }
}

/// Parse a packet body already sliced to `remaining_length` by the framer (see
/// [`crate::frame::next_frame`]), given the packet type and flags from the fixed header.
pub fn parse_body<'a, E: ParseError<&'a [u8]>>(
    packet_type: Type,
    packet_flags: u8,
    body: &'a [u8],
) -> IResult<&'a [u8], Packet<'a>, E> {
    match packet_type {
        Type::CONNECT => map(Connect::parse, Packet::Connect)(body),
        Type::CONNACK => map(ConnectAck::parse, Packet::ConnectAck)(body),
        Type::PUBLISH => map(
            |i| Publish::parse(PublishFlags::from_bits_truncate(packet_flags), i),
            Packet::Publish,
        )(body),
        Type::PUBACK => map(PublishAck::parse, Packet::PublishAck)(body),
        Type::PUBREC => map(PublishReceived::parse, Packet::PublishReceived)(body),
        Type::PUBREL => map(PublishRelease::parse, Packet::PublishRelease)(body),
        Type::PUBCOMP => map(PublishComplete::parse, Packet::PublishComplete)(body),
        Type::SUBSCRIBE => map(Subscribe::parse, Packet::Subscribe)(body),
        Type::SUBACK => map(SubscribeAck::parse, Packet::SubscribeAck)(body),
        Type::UNSUBSCRIBE => map(Unsubscribe::parse, Packet::Unsubscribe)(body),
        Type::UNSUBACK => map(UnsubscribeAck::parse, Packet::UnsubscribeAck)(body),
        Type::PINGREQ => Ok((&body[..0], Packet::Ping)),
        Type::PINGRESP => Ok((&body[..0], Packet::Pong)),
        Type::DISCONNECT => Ok((&body[..0], Packet::Disconnect)),
    }
}

impl Connect<'_> {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Connect<'a>, E> {
        let (input, (_, _, flags, keep_alive)) = tuple((
            context("protocol name", tag(PROTOCOL_NAME)),
            context(
                "protocol level",
                verify(be_u8, |&level| level == PROTOCOL_LEVEL),
            ),
            context("flags", map_opt(be_u8, ConnectFlags::from_bits)),
            context("keepalive", be_u16),
        ))(input)?;
        let (input, client_id) = client_id(input)?;
        let (input, last_will) = if flags.contains(ConnectFlags::LAST_WILL) {
            let (input, (topic, message)) = tuple((
                context("will topic", utf8_str),
                context("will message", length_data(be_u16)),
            ))(input)?;
            let qos = flags.qos().ok_or_else(|| {
                nom::Err::Error(E::from_error_kind(input, nom::error::ErrorKind::Verify))
            })?;

            (
                input,
                Some(LastWill {
                    qos,
                    retain: flags.contains(ConnectFlags::WILL_RETAIN),
                    topic,
                    message,
                }),
            )
        } else {
            (input, None)
        };
        let (input, username) = if flags.contains(ConnectFlags::USERNAME) {
            context("username", map(utf8_str, Some))(input)?
        } else {
            (input, None)
        };
        let (input, password) = if flags.contains(ConnectFlags::PASSWORD) {
            context("password", map(length_data(be_u16), Some))(input)?
        } else {
            (input, None)
        };

        Ok((
            input,
            Connect {
                clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
                keep_alive,
                client_id,
                last_will,
                username,
                password,
            },
        ))
    }
}

impl ConnectAck {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(
            tuple((
                context("flags", map_opt(be_u8, ConnectAckFlags::from_bits)),
                context("return code", map_res(be_u8, ConnectReturnCode::try_from)),
            )),
            |(flags, return_code)| ConnectAck {
                session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
                return_code,
            },
        )(input)
    }
}

impl Publish<'_> {
    fn parse<'a, E: ParseError<&'a [u8]>>(
        flags: PublishFlags,
        input: &'a [u8],
    ) -> IResult<&'a [u8], Publish<'a>, E> {
        let dup = flags.contains(PublishFlags::DUP);
        let qos = flags.qos().ok_or_else(|| {
            nom::Err::Error(E::from_error_kind(input, nom::error::ErrorKind::Verify))
        })?;
        let retain = flags.contains(PublishFlags::RETAIN);
        let (input, topic) = topic_name(input)?;
        let (payload, packet_id) = if qos >= QoS::AtLeastOnce {
            map(packet_id, Some)(input)?
        } else {
            (input, None)
        };

        Ok((
            &[][..],
            Publish {
                dup,
                qos,
                retain,
                topic,
                packet_id,
                payload,
            },
        ))
    }
}

impl PublishAck {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(packet_id, |packet_id| Self { packet_id })(input)
    }
}

impl PublishReceived {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(packet_id, |packet_id| Self { packet_id })(input)
    }
}

impl PublishRelease {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(packet_id, |packet_id| Self { packet_id })(input)
    }
}

impl PublishComplete {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(packet_id, |packet_id| Self { packet_id })(input)
    }
}

impl Subscribe<'_> {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Subscribe<'a>, E> {
        map(
            tuple((packet_id, many1(subscription))),
            |(packet_id, subscriptions)| Subscribe {
                packet_id,
                subscriptions,
            },
        )(input)
    }
}

impl SubscribeAck {
    pub const FAILURE: u8 = 0x80;
    const QOS_MASK: u8 = 0x3;

    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(
            tuple((
                packet_id,
                many1(context(
                    "return code",
                    map_res(be_u8, |b| {
                        if (b & Self::FAILURE) == 0 {
                            QoS::try_from(b & Self::QOS_MASK).map(SubscribeReturnCode::Success)
                        } else {
                            Ok(SubscribeReturnCode::Failure)
                        }
                    }),
                )),
            )),
            |(packet_id, status)| SubscribeAck { packet_id, status },
        )(input)
    }
}

impl Unsubscribe<'_> {
    fn parse<'a, E: ParseError<&'a [u8]>>(
        input: &'a [u8],
    ) -> IResult<&'a [u8], Unsubscribe<'a>, E> {
        map(
            tuple((packet_id, many1(topic_filter))),
            |(packet_id, topic_filters)| Unsubscribe {
                packet_id,
                topic_filters,
            },
        )(input)
    }
}

impl UnsubscribeAck {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(packet_id, |packet_id| Self { packet_id })(input)
    }
}
