use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use futures::{SinkExt, StreamExt};
use log::{debug, error};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::spawn_local;
use tokio::time::{self, Duration, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::channel::ChannelCore;
use crate::defines::*;
use crate::frame::{Frame, FrameError, FramePayload, Method};
use crate::frame_reader::FrameDecoder;
use crate::frame_writer::FrameEncoder;
use crate::queue::Queue;

#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("malformed frame: {0}")]
    FrameFormat(#[from] FrameError),
    #[error("frame of {size} bytes exceeds the negotiated maximum of {max}")]
    FrameTooLarge { size: usize, max: u32 },
    #[error("invalid frame end marker {0:#04x}")]
    FrameEndInvalid(u8),
    #[error("no traffic for two heartbeat intervals")]
    HeartbeatTimeout,
    #[error("frame for unknown channel {0}")]
    ChannelUnknown(u16),
    #[error("reply did not match the pending request on channel {0}")]
    UnexpectedReply(u16),
    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection closed by server: {1} ({0})")]
    ConnectionClosedByServer(u16, String, u16, u16),
    #[error("channel closed by server: {1} ({0})")]
    ChannelClosedByServer(u16, String, u16, u16),
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        Self::Io(error.kind())
    }
}

// Values negotiated by the connection handshake, which happens outside
// this crate.
#[derive(Debug, Clone, Copy)]
pub struct TuneParams {
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Default for TuneParams {
    fn default() -> Self {
        Self { frame_max: 131_072, heartbeat: 0 }
    }
}

pub struct Connection {
    ptr: Rc<ConnectionInternal>,
}

impl Connection {
    // Must run inside a tokio LocalSet; the I/O tasks are spawned locally.
    pub fn attach<T>(transport: T, tune: TuneParams) -> Self
    where
        T: AsyncRead + AsyncWrite + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let ptr = Rc::new(ConnectionInternal::new(writer_tx, tune.heartbeat));

        let (read_half, write_half) = tokio::io::split(transport);
        let reader = FramedRead::new(read_half, FrameDecoder::new(tune.frame_max));
        let writer = FramedWrite::new(write_half, FrameEncoder::new());

        ptr.start_io_handler(reader, writer, writer_rx, ptr.clone());

        Self { ptr }
    }

    pub fn queue(&self, name: &str) -> Result<Queue, ConnectionError> {
        self.ptr.is_valid()?;

        let number = self.ptr.next_channel.get();
        self.ptr.next_channel.set(number + 1);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Rc::new(ChannelCore::new(number, name, self.ptr.writer_queue.clone(), events_tx));
        self.ptr.channels.borrow_mut().insert(number, channel.clone());

        channel.send_method(Method::ChannelOpen());

        Ok(Queue::new(Rc::downgrade(&channel), events_rx))
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.ptr.last_error.borrow().clone()
    }

    pub async fn close(self) {
        if self.ptr.is_valid().is_err() {
            return;
        }

        let frame = Frame {
            channel: 0,
            payload: FramePayload::Method(Method::ConnectionClose(AMQP_REPLY_SUCCESS, "shutdown".to_string(), 0, 0)),
        };

        let _ = self.ptr.writer_queue.send(Some(frame));
        self.ptr.close_signal.notified().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.ptr.mark_closed(ConnectionError::ConnectionClosed);
    }
}

pub(crate) struct ConnectionInternal {
    channels: RefCell<HashMap<u16, Rc<ChannelCore>>>,
    next_channel: Cell<u16>,
    writer_queue: UnboundedSender<Option<Frame>>,
    heartbeat: u16,
    last_frame_at: Cell<Instant>,
    last_error: RefCell<Option<ConnectionError>>,
    close_signal: Notify,
}

impl ConnectionInternal {
    fn new(writer_queue: UnboundedSender<Option<Frame>>, heartbeat: u16) -> Self {
        Self {
            channels: RefCell::new(HashMap::new()),
            next_channel: Cell::new(1),
            writer_queue,
            heartbeat,
            last_frame_at: Cell::new(Instant::now()),
            last_error: RefCell::new(None),
            close_signal: Notify::new(),
        }
    }

    fn is_valid(&self) -> Result<(), ConnectionError> {
        match &*self.last_error.borrow() {
            None => Ok(()),
            Some(error) => Err(error.clone()),
        }
    }

    fn handle_channel_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        let channel = self.channels.borrow().get(&frame.channel).cloned();
        match channel {
            None => Err(ConnectionError::ChannelUnknown(frame.channel)),
            Some(channel) => channel.handle_frame(frame),
        }
    }

    fn handle_connection_frame(&self, frame: Frame) {
        match frame.payload {
            FramePayload::Heartbeat() => {
                let echo = Frame { channel: 0, payload: FramePayload::Heartbeat() };
                let _ = self.writer_queue.send(Some(echo));
            },
            FramePayload::Method(Method::ConnectionClose(reply_code, reply_text, class_id, method_id)) => {
                let reply = Frame { channel: 0, payload: FramePayload::Method(Method::ConnectionCloseOk()) };
                let _ = self.writer_queue.send(Some(reply));

                self.mark_closed(ConnectionError::ConnectionClosedByServer(reply_code, reply_text, class_id, method_id));
                self.close_signal.notify_one();
            },
            FramePayload::Method(Method::ConnectionCloseOk()) => {
                self.mark_closed(ConnectionError::ConnectionClosed);
                self.close_signal.notify_one();
            },
            other => debug!("ignoring connection-level frame {:?}", other),
        }
    }

    // First error wins; every live channel is failed with a copy of it.
    fn mark_closed(&self, error: ConnectionError) {
        if self.last_error.borrow().is_some() {
            return;
        }

        *self.last_error.borrow_mut() = Some(error.clone());
        let _ = self.writer_queue.send(None);

        for channel in self.channels.borrow().values() {
            channel.fail(&error);
        }
    }

    fn start_io_handler<T>(
        &self,
        mut reader: FramedRead<ReadHalf<T>, FrameDecoder>,
        mut writer: FramedWrite<WriteHalf<T>, FrameEncoder>,
        mut writer_rx: UnboundedReceiver<Option<Frame>>,
        connection: Rc<ConnectionInternal>,
    ) where
        T: AsyncRead + AsyncWrite + 'static,
    {
        let conn = connection.clone();
        spawn_local(async move {
            while conn.last_error.borrow().is_none() {
                match reader.next().await {
                    Some(Ok(frame)) => {
                        conn.last_frame_at.set(Instant::now());

                        if frame.channel == 0 {
                            conn.handle_connection_frame(frame);
                        } else if let Err(error) = conn.handle_channel_frame(frame) {
                            error!("fatal protocol error: {}", error);
                            conn.mark_closed(error);
                            conn.close_signal.notify_one();
                            break;
                        }
                    },
                    Some(Err(ConnectionError::FrameFormat(FrameError::UnsupportedMethod(class_id, method_id)))) => {
                        debug!("ignoring unsupported method {}.{}", class_id, method_id);
                        conn.last_frame_at.set(Instant::now());
                    },
                    Some(Err(error)) => {
                        error!("connection failed: {}", error);
                        conn.mark_closed(error);

                        // close() may be waiting for connection.close-ok;
                        // signal to avoid a deadlock
                        conn.close_signal.notify_one();
                        break;
                    },
                    None => {
                        conn.mark_closed(ConnectionError::ConnectionClosed);
                        conn.close_signal.notify_one();
                        break;
                    },
                }
            }
        });

        let conn = connection.clone();
        spawn_local(async move {
            while let Some(entry) = writer_rx.recv().await {
                match entry {
                    Some(frame) => {
                        if let Err(error) = writer.send(frame).await {
                            error!("connection write error: {}", error);
                            conn.mark_closed(error);
                            conn.close_signal.notify_one();
                            break;
                        }
                    },
                    None => break,
                }
            }
        });

        if self.heartbeat > 0 {
            let conn = connection;
            spawn_local(async move {
                let interval = Duration::from_secs(conn.heartbeat as u64);
                let mut ticker = time::interval_at(Instant::now() + interval, interval);

                loop {
                    ticker.tick().await;

                    if conn.last_error.borrow().is_some() {
                        break;
                    }

                    if conn.last_frame_at.get().elapsed() >= interval * 2 {
                        error!("heartbeat timeout");
                        conn.mark_closed(ConnectionError::HeartbeatTimeout);
                        conn.close_signal.notify_one();
                        break;
                    }

                    let heartbeat = Frame { channel: 0, payload: FramePayload::Heartbeat() };
                    let _ = conn.writer_queue.send(Some(heartbeat));
                }
            });
        }
    }
}
