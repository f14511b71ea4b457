use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

use crate::connection::ConnectionError;
use crate::defines::*;
use crate::frame::{BasicProperties, FieldTable, FieldValue, Frame, FramePayload, Method};

#[derive(Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = ConnectionError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ConnectionError> {
        match &frame.payload {
            FramePayload::Method(_) => dst.put_u8(AMQP_FRAME_TYPE_METHOD),
            FramePayload::Header(_, _, _) => dst.put_u8(AMQP_FRAME_TYPE_HEADER),
            FramePayload::Content(_) => dst.put_u8(AMQP_FRAME_TYPE_CONTENT),
            FramePayload::Heartbeat() => dst.put_u8(AMQP_FRAME_TYPE_HEARTBEAT),
        }

        dst.put_u16(frame.channel);

        let size_offset = dst.len();
        dst.put_u32(0);   // placeholder for the payload size

        match frame.payload {
            FramePayload::Method(method) => write_method(dst, &method),
            FramePayload::Header(class_id, body_size, properties) => {
                write_header(dst, class_id, body_size, &properties)
            },
            FramePayload::Content(data) => dst.put_slice(&data),
            FramePayload::Heartbeat() => (),
        }

        let payload_size = (dst.len() - size_offset - 4) as u32;
        dst[size_offset..size_offset + 4].copy_from_slice(&payload_size.to_be_bytes());

        dst.put_u8(AMQP_FRAME_END);
        Ok(())
    }
}

fn write_method(target: &mut BytesMut, method: &Method) {
    match method {
        Method::ConnectionClose(reply_code, reply_text, class_id, method_id) => {
            target.put_u16(AMQP_CLASS_CONNECTION);
            target.put_u16(AMQP_METHOD_CONNECTION_CLOSE);
            target.put_u16(*reply_code);
            write_short_string(target, reply_text);
            target.put_u16(*class_id);
            target.put_u16(*method_id);
        },
        Method::ConnectionCloseOk() => {
            target.put_u16(AMQP_CLASS_CONNECTION);
            target.put_u16(AMQP_METHOD_CONNECTION_CLOSE_OK);
        },
        Method::ChannelOpen() => {
            target.put_u16(AMQP_CLASS_CHANNEL);
            target.put_u16(AMQP_METHOD_CHANNEL_OPEN);
            write_short_string(target, "");    // deprecated but necessary
        },
        Method::ChannelOpenOk() => {
            target.put_u16(AMQP_CLASS_CHANNEL);
            target.put_u16(AMQP_METHOD_CHANNEL_OPEN_OK);
            write_long_string(target, "");     // deprecated but necessary
        },
        Method::ChannelClose(reply_code, reply_text, class_id, method_id) => {
            target.put_u16(AMQP_CLASS_CHANNEL);
            target.put_u16(AMQP_METHOD_CHANNEL_CLOSE);
            target.put_u16(*reply_code);
            write_short_string(target, reply_text);
            target.put_u16(*class_id);
            target.put_u16(*method_id);
        },
        Method::ChannelCloseOk() => {
            target.put_u16(AMQP_CLASS_CHANNEL);
            target.put_u16(AMQP_METHOD_CHANNEL_CLOSE_OK);
        },
        Method::QueueDeclare(name, flags, arguments) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_DECLARE);
            target.put_u16(0);      // reserved
            write_short_string(target, name);
            target.put_u8(*flags);
            write_table(target, arguments);
        },
        Method::QueueDeclareOk(name, message_count, consumer_count) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_DECLARE_OK);
            write_short_string(target, name);
            target.put_u32(*message_count);
            target.put_u32(*consumer_count);
        },
        Method::QueueBind(name, exchange, routing_key, flags, arguments) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_BIND);
            target.put_u16(0);      // reserved
            write_short_string(target, name);
            write_short_string(target, exchange);
            write_short_string(target, routing_key);
            target.put_u8(*flags);
            write_table(target, arguments);
        },
        Method::QueueBindOk() => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_BIND_OK);
        },
        Method::QueueUnbind(name, exchange, routing_key, arguments) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_UNBIND);
            target.put_u16(0);      // reserved
            write_short_string(target, name);
            write_short_string(target, exchange);
            write_short_string(target, routing_key);
            write_table(target, arguments);
        },
        Method::QueueUnbindOk() => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_UNBIND_OK);
        },
        Method::QueuePurge(name, flags) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_PURGE);
            target.put_u16(0);      // reserved
            write_short_string(target, name);
            target.put_u8(*flags);
        },
        Method::QueuePurgeOk(message_count) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_PURGE_OK);
            target.put_u32(*message_count);
        },
        Method::QueueDelete(name, flags) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_DELETE);
            target.put_u16(0);      // reserved
            write_short_string(target, name);
            target.put_u8(*flags);
        },
        Method::QueueDeleteOk(message_count) => {
            target.put_u16(AMQP_CLASS_QUEUE);
            target.put_u16(AMQP_METHOD_QUEUE_DELETE_OK);
            target.put_u32(*message_count);
        },
        Method::BasicConsume(queue, tag, flags, arguments) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_CONSUME);
            target.put_u16(0);      // reserved
            write_short_string(target, queue);
            write_short_string(target, tag);
            target.put_u8(*flags);
            write_table(target, arguments);
        },
        Method::BasicConsumeOk(tag) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_CONSUME_OK);
            write_short_string(target, tag);
        },
        Method::BasicCancel(tag, flags) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_CANCEL);
            write_short_string(target, tag);
            target.put_u8(*flags);
        },
        Method::BasicCancelOk(tag) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_CANCEL_OK);
            write_short_string(target, tag);
        },
        Method::BasicGet(queue, flags) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_GET);
            target.put_u16(0);      // reserved
            write_short_string(target, queue);
            target.put_u8(*flags);
        },
        Method::BasicGetOk(delivery_tag, redelivered, exchange, routing_key, message_count) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_GET_OK);
            target.put_u64(*delivery_tag);
            target.put_u8(*redelivered as u8);
            write_short_string(target, exchange);
            write_short_string(target, routing_key);
            target.put_u32(*message_count);
        },
        Method::BasicGetEmpty() => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_GET_EMPTY);
            write_short_string(target, "");    // deprecated but necessary
        },
        Method::BasicDeliver(consumer_tag, delivery_tag, redelivered, exchange, routing_key) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_DELIVER);
            write_short_string(target, consumer_tag);
            target.put_u64(*delivery_tag);
            target.put_u8(*redelivered as u8);
            write_short_string(target, exchange);
            write_short_string(target, routing_key);
        },
        Method::BasicAck(delivery_tag, multiple) => {
            target.put_u16(AMQP_CLASS_BASIC);
            target.put_u16(AMQP_METHOD_BASIC_ACK);
            target.put_u64(*delivery_tag);
            // `multiple` travels as bit 0 of the packed argument octet
            target.put_u8(*multiple as u8);
        },
    }
}

fn write_header(target: &mut BytesMut, class_id: u16, body_size: u64, properties: &BasicProperties) {
    target.put_u16(class_id);
    target.put_u16(0);      // weight, unused
    target.put_u64(body_size);

    // property mask, filled in after the fields are written
    let mask_offset = target.len();
    target.put_u16(0);

    let mut mask: u16 = 0;

    if let Some(value) = &properties.content_type {
        mask |= 1 << AMQP_BASIC_PROPERTY_CONTENT_TYPE_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.content_encoding {
        mask |= 1 << AMQP_BASIC_PROPERTY_CONTENT_ENCODING_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.headers {
        mask |= 1 << AMQP_BASIC_PROPERTY_HEADERS_BIT;
        write_table(target, value);
    }

    if let Some(value) = properties.delivery_mode {
        mask |= 1 << AMQP_BASIC_PROPERTY_DELIVERY_MODE_BIT;
        target.put_u8(value);
    }

    if let Some(value) = properties.priority {
        mask |= 1 << AMQP_BASIC_PROPERTY_PRIORITY_BIT;
        target.put_u8(value);
    }

    if let Some(value) = &properties.correlation_id {
        mask |= 1 << AMQP_BASIC_PROPERTY_CORRELATION_ID_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.reply_to {
        mask |= 1 << AMQP_BASIC_PROPERTY_REPLY_TO_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.expiration {
        mask |= 1 << AMQP_BASIC_PROPERTY_EXPIRATION_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.message_id {
        mask |= 1 << AMQP_BASIC_PROPERTY_MESSAGE_ID_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = properties.timestamp {
        mask |= 1 << AMQP_BASIC_PROPERTY_TIMESTAMP_BIT;
        target.put_u64(value);
    }

    if let Some(value) = &properties.message_type {
        mask |= 1 << AMQP_BASIC_PROPERTY_TYPE_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.user_id {
        mask |= 1 << AMQP_BASIC_PROPERTY_USER_ID_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.app_id {
        mask |= 1 << AMQP_BASIC_PROPERTY_APP_ID_BIT;
        write_short_string(target, value);
    }

    if let Some(value) = &properties.cluster_id {
        mask |= 1 << AMQP_BASIC_PROPERTY_CLUSTER_ID_BIT;
        write_short_string(target, value);
    }

    target[mask_offset..mask_offset + 2].copy_from_slice(&mask.to_be_bytes());
}

fn write_short_string(buffer: &mut BytesMut, value: &str) {
    assert!(value.len() < u8::MAX as usize);

    buffer.put_u8(value.len() as u8);
    buffer.put_slice(value.as_bytes());
}

fn write_long_string(buffer: &mut BytesMut, value: &str) {
    buffer.put_u32(value.len() as u32);
    buffer.put_slice(value.as_bytes());
}

fn write_table(buffer: &mut BytesMut, value: &FieldTable) {
    // size placeholder, filled once the entries are in place
    let size_offset = buffer.len();
    buffer.put_u32(0);

    value.iter().for_each(|(key, value)| {
        write_short_string(buffer, key);
        write_value(buffer, value);
    });

    let payload_size = (buffer.len() - size_offset - 4) as u32;
    buffer[size_offset..size_offset + 4].copy_from_slice(&payload_size.to_be_bytes());
}

fn write_array(buffer: &mut BytesMut, value: &[FieldValue]) {
    let size_offset = buffer.len();
    buffer.put_u32(0);

    value.iter().for_each(|value| {
        write_value(buffer, value);
    });

    let payload_size = (buffer.len() - size_offset - 4) as u32;
    buffer[size_offset..size_offset + 4].copy_from_slice(&payload_size.to_be_bytes());
}

fn write_value(buffer: &mut BytesMut, value: &FieldValue) {
    match value {
        FieldValue::Void => {
            buffer.put_u8(b'V');
        },
        FieldValue::Bool(value) => {
            buffer.put_u8(b't');
            buffer.put_u8(*value as u8);
        },
        FieldValue::I8(value) => {
            buffer.put_u8(b'b');
            buffer.put_i8(*value);
        },
        FieldValue::U8(value) => {
            buffer.put_u8(b'B');
            buffer.put_u8(*value);
        },
        FieldValue::I16(value) => {
            buffer.put_u8(b'U');
            buffer.put_i16(*value);
        },
        FieldValue::U16(value) => {
            buffer.put_u8(b'u');
            buffer.put_u16(*value);
        },
        FieldValue::I32(value) => {
            buffer.put_u8(b'I');
            buffer.put_i32(*value);
        },
        FieldValue::U32(value) => {
            buffer.put_u8(b'i');
            buffer.put_u32(*value);
        },
        FieldValue::I64(value) => {
            buffer.put_u8(b'L');
            buffer.put_i64(*value);
        },
        FieldValue::U64(value) => {
            buffer.put_u8(b'l');
            buffer.put_u64(*value);
        },
        FieldValue::Float(value) => {
            buffer.put_u8(b'f');
            buffer.put_f32(*value);
        },
        FieldValue::Double(value) => {
            buffer.put_u8(b'd');
            buffer.put_f64(*value);
        },
        FieldValue::Decimal(scale, value) => {
            buffer.put_u8(b'D');
            buffer.put_u8(*scale);
            buffer.put_u32(*value);
        },
        FieldValue::ShortString(value) => {
            buffer.put_u8(b's');
            write_short_string(buffer, value);
        },
        FieldValue::LongString(value) => {
            buffer.put_u8(b'S');
            write_long_string(buffer, value);
        },
        FieldValue::Timestamp(value) => {
            buffer.put_u8(b'T');
            buffer.put_u64(*value);
        },
        FieldValue::Array(value) => {
            buffer.put_u8(b'A');
            write_array(buffer, value);
        },
        FieldValue::Table(value) => {
            buffer.put_u8(b'F');
            write_table(buffer, value);
        },
    }
}
