use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::connection::ConnectionError;
use crate::defines::*;
use crate::frame::{BasicProperties, FieldTable, FieldValue, Frame, FrameError, FramePayload, Method};

pub struct FrameReader<'buffer> {
    data: &'buffer [u8],
}

impl<'buffer> FrameReader<'buffer> {
    pub fn new(data: &'buffer [u8]) -> FrameReader<'buffer> {
        Self { data }
    }

    pub fn read_frame(&mut self, frame_type: u8, channel: u16) -> Result<Frame, FrameError> {
        let payload = match frame_type {
            AMQP_FRAME_TYPE_METHOD => FramePayload::Method(self.read_method_frame()?),
            AMQP_FRAME_TYPE_HEADER => self.read_header_frame()?,
            AMQP_FRAME_TYPE_CONTENT => FramePayload::Content(self.read_remaining_bytes()),
            AMQP_FRAME_TYPE_HEARTBEAT => FramePayload::Heartbeat(),
            _ => return Err(FrameError::InvalidFrameType(frame_type)),
        };

        Ok(Frame { channel, payload })
    }

    fn read_method_frame(&mut self) -> Result<Method, FrameError> {
        let class_id = self.read_u16()?;
        let method_id = self.read_u16()?;

        match (class_id, method_id) {
            (AMQP_CLASS_CONNECTION, AMQP_METHOD_CONNECTION_CLOSE) => {
                let reply_code = self.read_u16()?;
                let reply_text = self.read_short_string()?;
                let class_id = self.read_u16()?;
                let method_id = self.read_u16()?;
                Ok(Method::ConnectionClose(reply_code, reply_text, class_id, method_id))
            },
            (AMQP_CLASS_CONNECTION, AMQP_METHOD_CONNECTION_CLOSE_OK) => {
                Ok(Method::ConnectionCloseOk())
            },
            (AMQP_CLASS_CHANNEL, AMQP_METHOD_CHANNEL_OPEN) => {
                let _ = self.read_short_string()?;   // deprecated arg
                Ok(Method::ChannelOpen())
            },
            (AMQP_CLASS_CHANNEL, AMQP_METHOD_CHANNEL_OPEN_OK) => {
                let _ = self.read_long_string()?;    // deprecated arg
                Ok(Method::ChannelOpenOk())
            },
            (AMQP_CLASS_CHANNEL, AMQP_METHOD_CHANNEL_CLOSE) => {
                let reply_code = self.read_u16()?;
                let reply_text = self.read_short_string()?;
                let class_id = self.read_u16()?;
                let method_id = self.read_u16()?;
                Ok(Method::ChannelClose(reply_code, reply_text, class_id, method_id))
            },
            (AMQP_CLASS_CHANNEL, AMQP_METHOD_CHANNEL_CLOSE_OK) => {
                Ok(Method::ChannelCloseOk())
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_DECLARE) => {
                let _ = self.read_u16()?;            // reserved
                let name = self.read_short_string()?;
                let flags = self.read_u8()?;
                let arguments = self.read_table()?;
                Ok(Method::QueueDeclare(name, flags, arguments))
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_DECLARE_OK) => {
                let name = self.read_short_string()?;
                let message_count = self.read_u32()?;
                let consumer_count = self.read_u32()?;
                Ok(Method::QueueDeclareOk(name, message_count, consumer_count))
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_BIND) => {
                let _ = self.read_u16()?;            // reserved
                let name = self.read_short_string()?;
                let exchange = self.read_short_string()?;
                let routing_key = self.read_short_string()?;
                let flags = self.read_u8()?;
                let arguments = self.read_table()?;
                Ok(Method::QueueBind(name, exchange, routing_key, flags, arguments))
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_BIND_OK) => {
                Ok(Method::QueueBindOk())
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_UNBIND) => {
                let _ = self.read_u16()?;            // reserved
                let name = self.read_short_string()?;
                let exchange = self.read_short_string()?;
                let routing_key = self.read_short_string()?;
                let arguments = self.read_table()?;
                Ok(Method::QueueUnbind(name, exchange, routing_key, arguments))
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_UNBIND_OK) => {
                Ok(Method::QueueUnbindOk())
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_PURGE) => {
                let _ = self.read_u16()?;            // reserved
                let name = self.read_short_string()?;
                let flags = self.read_u8()?;
                Ok(Method::QueuePurge(name, flags))
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_PURGE_OK) => {
                let message_count = self.read_u32()?;
                Ok(Method::QueuePurgeOk(message_count))
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_DELETE) => {
                let _ = self.read_u16()?;            // reserved
                let name = self.read_short_string()?;
                let flags = self.read_u8()?;
                Ok(Method::QueueDelete(name, flags))
            },
            (AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_DELETE_OK) => {
                let message_count = self.read_u32()?;
                Ok(Method::QueueDeleteOk(message_count))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_CONSUME) => {
                let _ = self.read_u16()?;            // reserved
                let queue = self.read_short_string()?;
                let tag = self.read_short_string()?;
                let flags = self.read_u8()?;
                let arguments = self.read_table()?;
                Ok(Method::BasicConsume(queue, tag, flags, arguments))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_CONSUME_OK) => {
                let tag = self.read_short_string()?;
                Ok(Method::BasicConsumeOk(tag))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_CANCEL) => {
                let tag = self.read_short_string()?;
                let flags = self.read_u8()?;
                Ok(Method::BasicCancel(tag, flags))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_CANCEL_OK) => {
                let tag = self.read_short_string()?;
                Ok(Method::BasicCancelOk(tag))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_GET) => {
                let _ = self.read_u16()?;            // reserved
                let queue = self.read_short_string()?;
                let flags = self.read_u8()?;
                Ok(Method::BasicGet(queue, flags))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_GET_OK) => {
                let delivery_tag = self.read_u64()?;
                let redelivered = self.read_u8()?;
                let exchange = self.read_short_string()?;
                let routing_key = self.read_short_string()?;
                let message_count = self.read_u32()?;
                Ok(Method::BasicGetOk(delivery_tag, redelivered & 1 != 0, exchange, routing_key, message_count))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_GET_EMPTY) => {
                let _ = self.read_short_string()?;   // deprecated arg
                Ok(Method::BasicGetEmpty())
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_DELIVER) => {
                let consumer_tag = self.read_short_string()?;
                let delivery_tag = self.read_u64()?;
                let redelivered = self.read_u8()?;
                let exchange = self.read_short_string()?;
                let routing_key = self.read_short_string()?;
                Ok(Method::BasicDeliver(consumer_tag, delivery_tag, redelivered & 1 != 0, exchange, routing_key))
            },
            (AMQP_CLASS_BASIC, AMQP_METHOD_BASIC_ACK) => {
                let delivery_tag = self.read_u64()?;
                let flags = self.read_u8()?;
                Ok(Method::BasicAck(delivery_tag, flags & 1 != 0))
            },
            (_, _) => Err(FrameError::UnsupportedMethod(class_id, method_id)),
        }
    }

    fn read_header_frame(&mut self) -> Result<FramePayload, FrameError> {
        let class_id = self.read_u16()?;
        let _ = self.read_u16()?;                    // weight, unused
        let body_size = self.read_u64()?;
        let mask = self.read_u16()?;
        let mut properties = BasicProperties::default();

        if (mask & (1 << AMQP_BASIC_PROPERTY_CONTENT_TYPE_BIT)) != 0 {
            properties.content_type = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_CONTENT_ENCODING_BIT)) != 0 {
            properties.content_encoding = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_HEADERS_BIT)) != 0 {
            properties.headers = Some(self.read_table()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_DELIVERY_MODE_BIT)) != 0 {
            properties.delivery_mode = Some(self.read_u8()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_PRIORITY_BIT)) != 0 {
            properties.priority = Some(self.read_u8()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_CORRELATION_ID_BIT)) != 0 {
            properties.correlation_id = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_REPLY_TO_BIT)) != 0 {
            properties.reply_to = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_EXPIRATION_BIT)) != 0 {
            properties.expiration = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_MESSAGE_ID_BIT)) != 0 {
            properties.message_id = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_TIMESTAMP_BIT)) != 0 {
            properties.timestamp = Some(self.read_u64()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_TYPE_BIT)) != 0 {
            properties.message_type = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_USER_ID_BIT)) != 0 {
            properties.user_id = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_APP_ID_BIT)) != 0 {
            properties.app_id = Some(self.read_short_string()?);
        }

        if (mask & (1 << AMQP_BASIC_PROPERTY_CLUSTER_ID_BIT)) != 0 {
            properties.cluster_id = Some(self.read_short_string()?);
        }

        Ok(FramePayload::Header(class_id, body_size, properties))
    }

    fn take(&mut self, count: usize) -> Result<&'buffer [u8], FrameError> {
        if self.data.len() < count {
            return Err(FrameError::BufferTooShort);
        }

        let (head, rest) = self.data.split_at(count);
        self.data = rest;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn read_i8(&mut self) -> Result<i8, FrameError> {
        Ok(self.take(1)?[0] as i8)
    }

    fn read_u16(&mut self) -> Result<u16, FrameError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i16(&mut self) -> Result<i16, FrameError> {
        Ok(self.read_u16()? as i16)
    }

    fn read_u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, FrameError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> Result<u64, FrameError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_i64(&mut self) -> Result<i64, FrameError> {
        Ok(self.read_u64()? as i64)
    }

    fn read_f32(&mut self) -> Result<f32, FrameError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_f64(&mut self) -> Result<f64, FrameError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_remaining_bytes(&mut self) -> Vec<u8> {
        let result = self.data.to_vec();
        self.data = &self.data[self.data.len()..];

        result
    }

    fn read_short_string(&mut self) -> Result<String, FrameError> {
        let length = self.read_u8()? as usize;
        Ok(String::from_utf8(self.take(length)?.to_vec())?)
    }

    fn read_long_string(&mut self) -> Result<String, FrameError> {
        let length = self.read_u32()? as usize;
        Ok(String::from_utf8(self.take(length)?.to_vec())?)
    }

    fn bytes_available(&self) -> usize {
        self.data.len()
    }

    fn read_table(&mut self) -> Result<FieldTable, FrameError> {
        let mut bytes_to_read = self.read_u32()? as usize;
        let mut result = FieldTable::new();

        while bytes_to_read > 0 {
            let bytes_before = self.bytes_available();
            let key = self.read_short_string()?;

            let value_type = self.read_u8()?;
            let value = self.read_value(value_type)?;

            result.insert(key, value);
            bytes_to_read = bytes_to_read.saturating_sub(bytes_before - self.bytes_available());
        }

        Ok(result)
    }

    fn read_array(&mut self) -> Result<Vec<FieldValue>, FrameError> {
        let mut bytes_to_read = self.read_u32()? as usize;
        let mut result = Vec::new();

        while bytes_to_read > 0 {
            let bytes_before = self.bytes_available();

            let value_type = self.read_u8()?;
            let value = self.read_value(value_type)?;

            result.push(value);
            bytes_to_read = bytes_to_read.saturating_sub(bytes_before - self.bytes_available());
        }

        Ok(result)
    }

    fn read_value(&mut self, value_type: u8) -> Result<FieldValue, FrameError> {
        match value_type {
            b't' => Ok(FieldValue::Bool(self.read_u8()? > 0)),
            b'b' => Ok(FieldValue::I8(self.read_i8()?)),
            b'B' => Ok(FieldValue::U8(self.read_u8()?)),
            b'U' => Ok(FieldValue::I16(self.read_i16()?)),
            b'u' => Ok(FieldValue::U16(self.read_u16()?)),
            b'I' => Ok(FieldValue::I32(self.read_i32()?)),
            b'i' => Ok(FieldValue::U32(self.read_u32()?)),
            b'L' => Ok(FieldValue::I64(self.read_i64()?)),
            b'l' => Ok(FieldValue::U64(self.read_u64()?)),
            b'f' => Ok(FieldValue::Float(self.read_f32()?)),
            b'd' => Ok(FieldValue::Double(self.read_f64()?)),
            b'D' => Ok(FieldValue::Decimal(self.read_u8()?, self.read_u32()?)),
            b's' => Ok(FieldValue::ShortString(self.read_short_string()?)),
            b'S' => Ok(FieldValue::LongString(self.read_long_string()?)),
            b'T' => Ok(FieldValue::Timestamp(self.read_u64()?)),
            b'V' => Ok(FieldValue::Void),
            b'F' => Ok(FieldValue::Table(self.read_table()?)),
            b'A' => Ok(FieldValue::Array(self.read_array()?)),
            _ => Err(FrameError::InvalidFieldType(value_type)),
        }
    }
}

pub struct FrameDecoder {
    frame_max: u32,
}

impl FrameDecoder {
    pub fn new(frame_max: u32) -> Self {
        Self { frame_max }
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ConnectionError> {
        if src.len() < AMQP_FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        if length > self.frame_max as usize {
            return Err(ConnectionError::FrameTooLarge { size: length, max: self.frame_max });
        }

        if src.len() < AMQP_FRAME_HEADER_SIZE + length + 1 {
            src.reserve(AMQP_FRAME_HEADER_SIZE + length + 1 - src.len());
            return Ok(None);
        }

        let frame_type = src.get_u8();
        let channel = src.get_u16();
        let _ = src.get_u32();
        let payload = src.split_to(length);

        let frame_end = src.get_u8();
        if frame_end != AMQP_FRAME_END {
            return Err(ConnectionError::FrameEndInvalid(frame_end));
        }

        Ok(Some(FrameReader::new(&payload).read_frame(frame_type, channel)?))
    }
}
