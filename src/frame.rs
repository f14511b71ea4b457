use std::collections::HashMap;
use std::string::FromUtf8Error;

use thiserror::Error;

pub type FieldTable = HashMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Float(f32),
    Double(f64),
    Decimal(u8, u32),
    ShortString(String),
    LongString(String),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionClose(u16, String, u16, u16),
    ConnectionCloseOk(),
    ChannelOpen(),
    ChannelOpenOk(),
    ChannelClose(u16, String, u16, u16),
    ChannelCloseOk(),
    QueueDeclare(String, u8, FieldTable),
    QueueDeclareOk(String, u32, u32),
    QueueBind(String, String, String, u8, FieldTable),
    QueueBindOk(),
    QueueUnbind(String, String, String, FieldTable),
    QueueUnbindOk(),
    QueuePurge(String, u8),
    QueuePurgeOk(u32),
    QueueDelete(String, u8),
    QueueDeleteOk(u32),
    BasicConsume(String, String, u8, FieldTable),
    BasicConsumeOk(String),
    BasicCancel(String, u8),
    BasicCancelOk(String),
    BasicGet(String, u8),
    BasicGetOk(u64, bool, String, String, u32),
    BasicGetEmpty(),
    BasicDeliver(String, u64, bool, String, String),
    BasicAck(u64, bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Method(Method),
    Header(u16, u64, BasicProperties),
    Content(Vec<u8>),
    Heartbeat(),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub payload: FramePayload,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("frame payload shorter than its fields require")]
    BufferTooShort,
    #[error("unknown frame type {0}")]
    InvalidFrameType(u8),
    #[error("unsupported method {0}.{1}")]
    UnsupportedMethod(u16, u16),
    #[error("unknown field-value tag {0:#04x}")]
    InvalidFieldType(u8),
    #[error("short string is not valid UTF-8")]
    InvalidUtf8(#[from] FromUtf8Error),
}
