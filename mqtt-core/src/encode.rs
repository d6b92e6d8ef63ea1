use crate::error::CodecError;
use crate::frame::write_remaining_length;
use crate::packet::{
    ConnectAck, ConnectAckFlags, PacketId, Publish, PublishAck, SubscribeAck, Type,
    UnsubscribeAck,
};

fn put_u16(out: &mut [u8], offset: usize, value: u16) -> Result<usize, CodecError> {
    out.get_mut(offset..offset + 2)
        .ok_or(CodecError::BufferOverflow)?
        .copy_from_slice(&value.to_be_bytes());
    Ok(offset + 2)
}

fn put_bytes(out: &mut [u8], offset: usize, bytes: &[u8]) -> Result<usize, CodecError> {
    let end = offset + bytes.len();
    out.get_mut(offset..end)
        .ok_or(CodecError::BufferOverflow)?
        .copy_from_slice(bytes);
    Ok(end)
}

impl ConnectAck {
    /// Serialize a 4-byte CONNACK.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        if out.len() < 4 {
            return Err(CodecError::BufferOverflow);
        }
        out[0] = (Type::CONNACK as u8) << 4;
        out[1] = 2;
        out[2] = if self.session_present {
            ConnectAckFlags::SESSION_PRESENT.bits()
        } else {
            0
        };
        out[3] = self.return_code as u8;
        Ok(4)
    }
}

impl PublishAck {
    /// Serialize a 4-byte PUBACK.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        encode_packet_id_only(out, Type::PUBACK, self.packet_id)
    }
}

impl UnsubscribeAck {
    /// Serialize a 4-byte UNSUBACK.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        encode_packet_id_only(out, Type::UNSUBACK, self.packet_id)
    }
}

fn encode_packet_id_only(
    out: &mut [u8],
    packet_type: Type,
    packet_id: PacketId,
) -> Result<usize, CodecError> {
    if out.len() < 4 {
        return Err(CodecError::BufferOverflow);
    }
    out[0] = (packet_type as u8) << 4;
    out[1] = 2;
    out[2..4].copy_from_slice(&packet_id.to_be_bytes());
    Ok(4)
}

/// Serialize a 2-byte PINGRESP.
pub fn encode_ping_resp(out: &mut [u8]) -> Result<usize, CodecError> {
    if out.len() < 2 {
        return Err(CodecError::BufferOverflow);
    }
    out[0] = (Type::PINGRESP as u8) << 4;
    out[1] = 0;
    Ok(2)
}

impl SubscribeAck {
    /// Serialize a SUBACK: packet id followed by one return-code byte per
    /// requested filter, in order.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let remaining_length = 2 + self.status.len();
        let mut rem_buf = [0u8; 4];
        let rem_bytes = write_remaining_length(&mut rem_buf, remaining_length)?;

        if out.len() < 1 {
            return Err(CodecError::BufferOverflow);
        }
        out[0] = (Type::SUBACK as u8) << 4;
        let mut offset = put_bytes(out, 1, &rem_buf[..rem_bytes])?;
        offset = put_u16(out, offset, self.packet_id)?;

        let codes_end = offset + self.status.len();
        let dst = out
            .get_mut(offset..codes_end)
            .ok_or(CodecError::BufferOverflow)?;
        for (slot, code) in dst.iter_mut().zip(self.status.iter()) {
            *slot = u8::from(*code);
        }
        Ok(codes_end)
    }
}

impl Publish<'_> {
    /// Serialize a PUBLISH: topic, packet id (QoS > 0 only), payload.
    ///
    /// Fails with [`CodecError::BufferOverflow`] rather than writing a
    /// truncated packet if `out` is too small.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let topic_len =
            u16::try_from(self.topic.len()).map_err(|_| CodecError::BufferOverflow)?;
        let has_packet_id = self.packet_id.is_some();
        let variable_header_len = 2 + self.topic.len() + if has_packet_id { 2 } else { 0 };
        let remaining_length = variable_header_len + self.payload.len();

        let mut rem_buf = [0u8; 4];
        let rem_bytes = write_remaining_length(&mut rem_buf, remaining_length)?;

        if out.is_empty() {
            return Err(CodecError::BufferOverflow);
        }
        out[0] = ((Type::PUBLISH as u8) << 4) | self.flags().bits();

        let mut offset = put_bytes(out, 1, &rem_buf[..rem_bytes])?;
        offset = put_u16(out, offset, topic_len)?;
        offset = put_bytes(out, offset, self.topic.as_bytes())?;
        if let Some(packet_id) = self.packet_id {
            offset = put_u16(out, offset, packet_id)?;
        }
        offset = put_bytes(out, offset, self.payload)?;

        Ok(offset)
    }
}
