use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::ConnectionError;
use crate::defines::*;
use crate::frame::{Frame, FramePayload, Method};
use crate::queue::{self, ErrorKind, Event, QueueState};
use crate::{ConsumeFlags, DeclareFlags, RemoveFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expected {
    DeclareOk,
    BindOk,
    UnbindOk,
    PurgeOk,
    DeleteOk,
    ConsumeOk,
    CancelOk,
    Get,
}

// Operations recorded while the channel is still opening, replayed in call
// order once channel.open-ok arrives.
#[derive(Debug)]
pub(crate) enum DeferredOp {
    Declare(DeclareFlags),
    Bind(String, String),
    Unbind(String, String),
    Purge,
    Remove(RemoveFlags),
    Consume(ConsumeFlags),
    Cancel,
    Get,
    Ack(u64),
}

pub(crate) struct ChannelCore {
    pub(crate) number: u16,
    writer: UnboundedSender<Option<Frame>>,
    state: Cell<ChannelState>,
    pending: RefCell<VecDeque<Expected>>,
    deferred: RefCell<Vec<DeferredOp>>,
    pub(crate) queue: RefCell<QueueState>,
    events: UnboundedSender<Event>,
    last_error: RefCell<Option<ConnectionError>>,
}

impl ChannelCore {
    pub(crate) fn new(
        number: u16,
        queue_name: &str,
        writer: UnboundedSender<Option<Frame>>,
        events: UnboundedSender<Event>,
    ) -> Self {
        Self {
            number,
            writer,
            state: Cell::new(ChannelState::Opening),
            pending: RefCell::new(VecDeque::new()),
            deferred: RefCell::new(Vec::new()),
            queue: RefCell::new(QueueState::new(queue_name)),
            events,
            last_error: RefCell::new(None),
        }
    }

    pub(crate) fn last_error(&self) -> Option<ConnectionError> {
        self.last_error.borrow().clone()
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub(crate) fn send_method(&self, method: Method) {
        let frame = Frame {
            channel: self.number,
            payload: FramePayload::Method(method),
        };

        let _ = self.writer.send(Some(frame));
    }

    pub(crate) fn expect(&self, reply: Expected) {
        self.pending.borrow_mut().push_back(reply);
    }

    pub(crate) fn defer(&self, op: DeferredOp) {
        self.deferred.borrow_mut().push(op);
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn confirm(&self, got: Expected) -> Result<(), ConnectionError> {
        match self.pending.borrow_mut().pop_front() {
            Some(expected) if expected == got => Ok(()),
            _ => Err(ConnectionError::UnexpectedReply(self.number)),
        }
    }

    pub(crate) fn begin_close(&self) -> bool {
        match self.state.get() {
            ChannelState::Closing | ChannelState::Closed => false,
            _ => {
                self.state.set(ChannelState::Closing);
                self.send_method(Method::ChannelClose(AMQP_REPLY_SUCCESS, "OK".to_string(), 0, 0));
                true
            },
        }
    }

    pub(crate) fn handle_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        match frame.payload {
            FramePayload::Method(Method::ChannelOpenOk()) => {
                if self.state.get() != ChannelState::Opening {
                    warn!("channel {}: unexpected channel.open-ok", self.number);
                    return Ok(());
                }

                self.state.set(ChannelState::Open);
                debug!("channel {} open", self.number);

                let deferred: Vec<DeferredOp> = self.deferred.borrow_mut().drain(..).collect();
                for op in deferred {
                    queue::replay(self, op);
                }

                Ok(())
            },
            FramePayload::Method(Method::ChannelClose(reply_code, reply_text, class_id, method_id)) => {
                self.send_method(Method::ChannelCloseOk());
                self.fail(&ConnectionError::ChannelClosedByServer(reply_code, reply_text, class_id, method_id));
                Ok(())
            },
            FramePayload::Method(Method::ChannelCloseOk()) => {
                if self.state.get() == ChannelState::Closing {
                    self.state.set(ChannelState::Closed);
                    self.pending.borrow_mut().clear();
                    self.queue.borrow_mut().reset();
                } else {
                    warn!("channel {}: unexpected channel.close-ok", self.number);
                }

                Ok(())
            },
            FramePayload::Method(method) => {
                if self.state.get() == ChannelState::Closed {
                    debug!("channel {}: dropping method after close", self.number);
                    return Ok(());
                }

                self.handle_class_method(method)
            },
            FramePayload::Header(_, body_size, properties) => {
                if self.state.get() != ChannelState::Closed {
                    let ready = self.queue.borrow_mut().apply_header(body_size, properties);
                    if ready {
                        self.emit(Event::MessageReceived);
                    }
                }

                Ok(())
            },
            FramePayload::Content(data) => {
                if self.state.get() != ChannelState::Closed {
                    let ready = self.queue.borrow_mut().apply_body(&data);
                    if ready {
                        self.emit(Event::MessageReceived);
                    }
                }

                Ok(())
            },
            FramePayload::Heartbeat() => Ok(()),
        }
    }

    fn handle_class_method(&self, method: Method) -> Result<(), ConnectionError> {
        match method {
            Method::QueueDeclareOk(name, message_count, consumer_count) => {
                self.confirm(Expected::DeclareOk)?;
                debug!("queue {} declared, {} messages, {} consumers", name, message_count, consumer_count);
                self.queue.borrow_mut().on_declare_ok(&name);
                self.emit(Event::Declared);
                Ok(())
            },
            Method::QueueBindOk() => {
                self.confirm(Expected::BindOk)?;
                self.emit(Event::Bound);
                Ok(())
            },
            Method::QueueUnbindOk() => {
                self.confirm(Expected::UnbindOk)?;
                self.emit(Event::Unbound);
                Ok(())
            },
            Method::QueuePurgeOk(message_count) => {
                self.confirm(Expected::PurgeOk)?;
                self.emit(Event::Purged(message_count));
                Ok(())
            },
            Method::QueueDeleteOk(message_count) => {
                self.confirm(Expected::DeleteOk)?;
                debug!("queue removed, {} messages purged", message_count);
                self.queue.borrow_mut().on_delete_ok();
                self.emit(Event::Removed);
                Ok(())
            },
            Method::BasicConsumeOk(tag) => {
                self.confirm(Expected::ConsumeOk)?;
                debug!("channel {}: consuming with tag {}", self.number, tag);
                self.queue.borrow_mut().on_consume_ok(&tag);
                self.emit(Event::Consuming(tag));
                Ok(())
            },
            Method::BasicCancelOk(tag) => {
                self.confirm(Expected::CancelOk)?;
                self.queue.borrow_mut().on_cancel_ok();
                self.emit(Event::Cancelled(tag));
                Ok(())
            },
            Method::BasicGetOk(delivery_tag, redelivered, exchange, routing_key, _) => {
                self.confirm(Expected::Get)?;
                self.queue.borrow_mut().begin_get(delivery_tag, redelivered, exchange, routing_key);
                Ok(())
            },
            Method::BasicGetEmpty() => {
                self.confirm(Expected::Get)?;
                self.emit(Event::Empty);
                Ok(())
            },
            Method::BasicDeliver(consumer_tag, delivery_tag, redelivered, exchange, routing_key) => {
                self.queue.borrow_mut().begin_delivery(&consumer_tag, delivery_tag, redelivered, exchange, routing_key);
                Ok(())
            },
            other => {
                debug!("channel {}: ignoring method {:?}", self.number, other);
                Ok(())
            },
        }
    }

    // Peer-initiated close or connection teardown; at most one terminal
    // error event fires per channel, and the error sticks for later callers.
    pub(crate) fn fail(&self, error: &ConnectionError) {
        if self.state.get() == ChannelState::Closed {
            return;
        }

        self.state.set(ChannelState::Closed);
        self.pending.borrow_mut().clear();
        self.deferred.borrow_mut().clear();
        self.queue.borrow_mut().reset();

        let (kind, reply_code, reply_text) = match error {
            ConnectionError::ChannelClosedByServer(reply_code, reply_text, _, _)
            | ConnectionError::ConnectionClosedByServer(reply_code, reply_text, _, _) => {
                (ErrorKind::from_reply_code(*reply_code), *reply_code, reply_text.clone())
            },
            other => (ErrorKind::ChannelClosed, 0, other.to_string()),
        };

        *self.last_error.borrow_mut() = Some(error.clone());
        self.emit(Event::Error { kind, reply_code, reply_text });
    }
}
