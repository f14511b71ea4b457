use std::collections::{HashSet, VecDeque};
use std::rc::Weak;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{ChannelCore, ChannelState, DeferredOp, Expected};
use crate::connection::ConnectionError;
use crate::defines::*;
use crate::frame::{BasicProperties, FieldTable, Method};
use crate::{ConsumeFlags, DeclareFlags, RemoveFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AccessRefused,
    NotFound,
    ResourceLocked,
    PreconditionFailed,
    ChannelClosed,
}

impl ErrorKind {
    pub(crate) fn from_reply_code(reply_code: u16) -> Self {
        match reply_code {
            AMQP_REPLY_ACCESS_REFUSED => Self::AccessRefused,
            AMQP_REPLY_NOT_FOUND => Self::NotFound,
            AMQP_REPLY_RESOURCE_LOCKED => Self::ResourceLocked,
            AMQP_REPLY_PRECONDITION_FAILED => Self::PreconditionFailed,
            _ => Self::ChannelClosed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Declared,
    Removed,
    Bound,
    Unbound,
    Purged(u32),
    Consuming(String),
    Cancelled(String),
    MessageReceived,
    Empty,
    Error { kind: ErrorKind, reply_code: u16, reply_text: String },
}

#[derive(Debug, Clone)]
pub struct Message {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
    remaining: u64,
    header_seen: bool,
    discard: bool,
}

impl Message {
    fn new(delivery_tag: u64, exchange: String, routing_key: String, redelivered: bool, discard: bool) -> Self {
        Self {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties: BasicProperties::default(),
            payload: Vec::new(),
            remaining: 0,
            header_seen: false,
            discard,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.header_seen && self.remaining == 0
    }
}

pub(crate) struct QueueState {
    name: String,
    declared: bool,
    consuming: bool,
    consume_pending: bool,
    cancel_pending: bool,
    consumer_tag: Option<String>,
    no_ack: bool,
    unacked: HashSet<u64>,
    inbound: VecDeque<Message>,
}

impl QueueState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            declared: false,
            consuming: false,
            consume_pending: false,
            cancel_pending: false,
            consumer_tag: None,
            no_ack: true,
            unacked: HashSet::new(),
            inbound: VecDeque::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_declared(&self) -> bool {
        self.declared
    }

    pub(crate) fn is_consuming(&self) -> bool {
        self.consuming
    }

    pub(crate) fn consumer_tag(&self) -> Option<String> {
        self.consumer_tag.clone()
    }

    pub(crate) fn set_consumer_tag(&mut self, tag: &str) {
        self.consumer_tag = Some(tag.to_string());
    }

    pub(crate) fn no_ack(&self) -> bool {
        self.no_ack
    }

    pub(crate) fn set_no_ack(&mut self, no_ack: bool) {
        self.no_ack = no_ack;
    }

    pub(crate) fn consume_pending(&self) -> bool {
        self.consume_pending
    }

    pub(crate) fn set_consume_pending(&mut self) {
        self.consume_pending = true;
    }

    pub(crate) fn set_cancel_pending(&mut self) {
        self.cancel_pending = true;
    }

    pub(crate) fn on_declare_ok(&mut self, server_name: &str) {
        self.declared = true;
        if self.name.is_empty() {
            self.name = server_name.to_string();
        }
    }

    pub(crate) fn on_delete_ok(&mut self) {
        self.declared = false;
    }

    pub(crate) fn on_consume_ok(&mut self, tag: &str) {
        self.consuming = true;
        self.consume_pending = false;
        self.consumer_tag = Some(tag.to_string());
    }

    pub(crate) fn on_cancel_ok(&mut self) {
        self.consuming = false;
        self.cancel_pending = false;
        self.consumer_tag = None;
    }

    pub(crate) fn reset(&mut self) {
        self.declared = false;
        self.consuming = false;
        self.consume_pending = false;
        self.cancel_pending = false;
        self.consumer_tag = None;
        self.unacked.clear();
        self.inbound.retain(|message| message.is_complete() && !message.discard);
    }

    pub(crate) fn begin_delivery(
        &mut self,
        consumer_tag: &str,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    ) {
        let matches = self.consumer_tag.as_deref() == Some(consumer_tag) && !self.cancel_pending;
        if !matches {
            warn!("dropping delivery {} for consumer tag {}", delivery_tag, consumer_tag);
        }

        self.inbound.push_back(Message::new(delivery_tag, exchange, routing_key, redelivered, !matches));
    }

    pub(crate) fn begin_get(&mut self, delivery_tag: u64, redelivered: bool, exchange: String, routing_key: String) {
        self.inbound.push_back(Message::new(delivery_tag, exchange, routing_key, redelivered, false));
    }

    // Returns true when the head message became complete and should be
    // announced to the consumer.
    pub(crate) fn apply_header(&mut self, body_size: u64, properties: BasicProperties) -> bool {
        match self.inbound.back_mut() {
            None => {
                warn!("content-header without a preceding method frame");
                false
            },
            Some(message) => {
                message.header_seen = true;
                message.remaining = body_size;
                message.properties = properties;
                self.settle_tail()
            },
        }
    }

    pub(crate) fn apply_body(&mut self, data: &[u8]) -> bool {
        match self.inbound.back_mut() {
            None => {
                warn!("content-body without a preceding method frame");
                false
            },
            Some(message) => {
                if !message.header_seen {
                    warn!("content-body without a content-header");
                    return false;
                }

                message.payload.extend_from_slice(data);
                message.remaining = message.remaining.saturating_sub(data.len() as u64);
                self.settle_tail()
            },
        }
    }

    fn settle_tail(&mut self) -> bool {
        let complete = self.inbound.back().map_or(false, Message::is_complete);
        if !complete {
            return false;
        }

        if self.inbound.back().map_or(false, |message| message.discard) {
            self.inbound.pop_back();
            return false;
        }

        if !self.no_ack {
            if let Some(message) = self.inbound.back() {
                self.unacked.insert(message.delivery_tag);
            }
        }

        self.inbound.len() == 1
    }

    pub(crate) fn take_ack(&mut self, delivery_tag: u64) -> bool {
        self.unacked.remove(&delivery_tag)
    }

    pub(crate) fn has_complete_message(&self) -> bool {
        self.inbound.front().map_or(false, Message::is_complete)
    }

    pub(crate) fn next_message(&mut self) -> Option<Message> {
        if self.has_complete_message() {
            self.inbound.pop_front()
        } else {
            None
        }
    }
}

fn send_declare(channel: &ChannelCore, flags: DeclareFlags) {
    let name = channel.queue.borrow().name().to_string();
    channel.send_method(Method::QueueDeclare(name, flags.into(), FieldTable::new()));

    if !flags.has_no_wait() {
        channel.expect(Expected::DeclareOk);
    }
}

fn send_remove(channel: &ChannelCore, flags: RemoveFlags) {
    let name = channel.queue.borrow().name().to_string();
    channel.send_method(Method::QueueDelete(name, flags.into()));

    if !flags.has_no_wait() {
        channel.expect(Expected::DeleteOk);
    }
}

fn send_purge(channel: &ChannelCore) {
    let name = channel.queue.borrow().name().to_string();
    channel.send_method(Method::QueuePurge(name, 0));
    channel.expect(Expected::PurgeOk);
}

fn send_bind(channel: &ChannelCore, exchange: String, routing_key: String) {
    let name = channel.queue.borrow().name().to_string();
    channel.send_method(Method::QueueBind(name, exchange, routing_key, 0, FieldTable::new()));
    channel.expect(Expected::BindOk);
}

fn send_unbind(channel: &ChannelCore, exchange: String, routing_key: String) {
    let name = channel.queue.borrow().name().to_string();
    channel.send_method(Method::QueueUnbind(name, exchange, routing_key, FieldTable::new()));
    channel.expect(Expected::UnbindOk);
}

fn send_consume(channel: &ChannelCore, flags: ConsumeFlags) {
    let (name, tag) = {
        let queue = channel.queue.borrow();
        (queue.name().to_string(), queue.consumer_tag().unwrap_or_default())
    };

    channel.send_method(Method::BasicConsume(name, tag.clone(), flags.into(), FieldTable::new()));

    if flags.has_no_wait() {
        // no consume-ok will arrive; the caller-supplied tag is authoritative
        channel.queue.borrow_mut().on_consume_ok(&tag);
    } else {
        channel.expect(Expected::ConsumeOk);
    }
}

fn send_cancel(channel: &ChannelCore) {
    let tag = channel.queue.borrow().consumer_tag().unwrap_or_default();
    channel.send_method(Method::BasicCancel(tag, 0));
    channel.expect(Expected::CancelOk);
}

fn send_get(channel: &ChannelCore) {
    let (name, no_ack) = {
        let queue = channel.queue.borrow();
        (queue.name().to_string(), queue.no_ack())
    };

    channel.send_method(Method::BasicGet(name, no_ack as u8));
    channel.expect(Expected::Get);
}

fn send_ack(channel: &ChannelCore, delivery_tag: u64) {
    channel.send_method(Method::BasicAck(delivery_tag, false));
}

pub(crate) fn replay(channel: &ChannelCore, op: DeferredOp) {
    match op {
        DeferredOp::Declare(flags) => send_declare(channel, flags),
        DeferredOp::Bind(exchange, routing_key) => send_bind(channel, exchange, routing_key),
        DeferredOp::Unbind(exchange, routing_key) => send_unbind(channel, exchange, routing_key),
        DeferredOp::Purge => send_purge(channel),
        DeferredOp::Remove(flags) => send_remove(channel, flags),
        DeferredOp::Consume(flags) => send_consume(channel, flags),
        DeferredOp::Cancel => send_cancel(channel),
        DeferredOp::Get => send_get(channel),
        DeferredOp::Ack(delivery_tag) => send_ack(channel, delivery_tag),
    }
}

pub struct Queue {
    channel: Weak<ChannelCore>,
    events: UnboundedReceiver<Event>,
}

impl Queue {
    pub(crate) fn new(channel: Weak<ChannelCore>, events: UnboundedReceiver<Event>) -> Self {
        Self { channel, events }
    }

    fn with_channel<R>(&self, action: impl FnOnce(&ChannelCore) -> R) -> Option<R> {
        self.channel.upgrade().map(|channel| action(&channel))
    }

    pub fn name(&self) -> String {
        self.with_channel(|channel| channel.queue.borrow().name().to_string())
            .unwrap_or_default()
    }

    pub fn is_declared(&self) -> bool {
        self.with_channel(|channel| channel.queue.borrow().is_declared()).unwrap_or(false)
    }

    pub fn is_consuming(&self) -> bool {
        self.with_channel(|channel| channel.queue.borrow().is_consuming()).unwrap_or(false)
    }

    pub fn consumer_tag(&self) -> Option<String> {
        self.with_channel(|channel| channel.queue.borrow().consumer_tag()).flatten()
    }

    pub fn set_consumer_tag(&self, tag: &str) {
        self.with_channel(|channel| channel.queue.borrow_mut().set_consumer_tag(tag));
    }

    pub fn no_ack(&self) -> bool {
        self.with_channel(|channel| channel.queue.borrow().no_ack()).unwrap_or(true)
    }

    pub fn set_no_ack(&self, no_ack: bool) {
        self.with_channel(|channel| channel.queue.borrow_mut().set_no_ack(no_ack));
    }

    pub fn declare(&self, flags: DeclareFlags) -> bool {
        self.with_channel(|channel| match channel.state() {
            ChannelState::Closing | ChannelState::Closed => false,
            ChannelState::Opening => {
                channel.defer(DeferredOp::Declare(flags));
                true
            },
            ChannelState::Open => {
                send_declare(channel, flags);
                true
            },
        })
        .unwrap_or(false)
    }

    pub fn remove(&self, flags: RemoveFlags) -> bool {
        self.with_channel(|channel| {
            if !channel.queue.borrow().is_declared() {
                debug!("removing an undeclared queue, ignoring");
                return false;
            }

            match channel.state() {
                ChannelState::Closing | ChannelState::Closed => false,
                ChannelState::Opening => {
                    channel.defer(DeferredOp::Remove(flags));
                    true
                },
                ChannelState::Open => {
                    send_remove(channel, flags);
                    true
                },
            }
        })
        .unwrap_or(false)
    }

    pub fn purge(&self) -> bool {
        self.with_channel(|channel| match channel.state() {
            ChannelState::Closing | ChannelState::Closed => false,
            ChannelState::Opening => {
                channel.defer(DeferredOp::Purge);
                true
            },
            ChannelState::Open => {
                send_purge(channel);
                true
            },
        })
        .unwrap_or(false)
    }

    pub fn bind(&self, exchange: &str, routing_key: &str) -> bool {
        self.with_channel(|channel| match channel.state() {
            ChannelState::Closing | ChannelState::Closed => false,
            ChannelState::Opening => {
                channel.defer(DeferredOp::Bind(exchange.to_string(), routing_key.to_string()));
                true
            },
            ChannelState::Open => {
                send_bind(channel, exchange.to_string(), routing_key.to_string());
                true
            },
        })
        .unwrap_or(false)
    }

    pub fn unbind(&self, exchange: &str, routing_key: &str) -> bool {
        self.with_channel(|channel| match channel.state() {
            ChannelState::Closing | ChannelState::Closed => false,
            ChannelState::Opening => {
                channel.defer(DeferredOp::Unbind(exchange.to_string(), routing_key.to_string()));
                true
            },
            ChannelState::Open => {
                send_unbind(channel, exchange.to_string(), routing_key.to_string());
                true
            },
        })
        .unwrap_or(false)
    }

    pub fn consume(&self, flags: ConsumeFlags) -> bool {
        self.with_channel(|channel| {
            {
                let queue = channel.queue.borrow();
                if queue.is_consuming() || queue.consume_pending() {
                    return false;
                }

                // without a reply there is no way to learn the broker-assigned tag
                if flags.has_no_wait() && queue.consumer_tag().unwrap_or_default().is_empty() {
                    return false;
                }
            }

            match channel.state() {
                ChannelState::Closing | ChannelState::Closed => false,
                ChannelState::Opening => {
                    channel.queue.borrow_mut().set_consume_pending();
                    channel.defer(DeferredOp::Consume(flags));
                    true
                },
                ChannelState::Open => {
                    channel.queue.borrow_mut().set_consume_pending();
                    send_consume(channel, flags);
                    true
                },
            }
        })
        .unwrap_or(false)
    }

    pub fn cancel(&self) -> bool {
        self.with_channel(|channel| {
            {
                let queue = channel.queue.borrow();
                if !queue.is_consuming() {
                    return false;
                }

                match queue.consumer_tag() {
                    Some(tag) if !tag.is_empty() => (),
                    _ => return false,
                }
            }

            match channel.state() {
                ChannelState::Closing | ChannelState::Closed => false,
                ChannelState::Opening => {
                    channel.queue.borrow_mut().set_cancel_pending();
                    channel.defer(DeferredOp::Cancel);
                    true
                },
                ChannelState::Open => {
                    channel.queue.borrow_mut().set_cancel_pending();
                    send_cancel(channel);
                    true
                },
            }
        })
        .unwrap_or(false)
    }

    pub fn get(&self) -> bool {
        self.with_channel(|channel| match channel.state() {
            ChannelState::Closing | ChannelState::Closed => false,
            ChannelState::Opening => {
                channel.defer(DeferredOp::Get);
                true
            },
            ChannelState::Open => {
                send_get(channel);
                true
            },
        })
        .unwrap_or(false)
    }

    pub fn ack(&self, message: &Message) -> bool {
        self.with_channel(|channel| {
            if !channel.queue.borrow_mut().take_ack(message.delivery_tag) {
                return false;
            }

            match channel.state() {
                ChannelState::Closing | ChannelState::Closed => false,
                ChannelState::Opening => {
                    channel.defer(DeferredOp::Ack(message.delivery_tag));
                    true
                },
                ChannelState::Open => {
                    send_ack(channel, message.delivery_tag);
                    true
                },
            }
        })
        .unwrap_or(false)
    }

    pub fn close(&self) -> bool {
        self.with_channel(|channel| channel.begin_close()).unwrap_or(false)
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.with_channel(|channel| channel.last_error()).flatten()
    }

    pub fn has_complete_message(&self) -> bool {
        self.with_channel(|channel| channel.queue.borrow().has_complete_message())
            .unwrap_or(false)
    }

    pub fn next_message(&self) -> Option<Message> {
        self.with_channel(|channel| channel.queue.borrow_mut().next_message()).flatten()
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::frame::{Frame, FramePayload};

    struct Fixture {
        channel: Rc<ChannelCore>,
        queue: Queue,
        writer: UnboundedReceiver<Option<Frame>>,
    }

    fn fixture(name: &str) -> Fixture {
        let (writer_tx, writer) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Rc::new(ChannelCore::new(1, name, writer_tx, events_tx));
        let queue = Queue::new(Rc::downgrade(&channel), events_rx);
        Fixture { channel, queue, writer }
    }

    fn open(fixture: &Fixture) {
        fixture
            .channel
            .handle_frame(Frame { channel: 1, payload: FramePayload::Method(Method::ChannelOpenOk()) })
            .unwrap();
    }

    fn feed(fixture: &Fixture, method: Method) {
        fixture
            .channel
            .handle_frame(Frame { channel: 1, payload: FramePayload::Method(method) })
            .unwrap();
    }

    fn feed_content(fixture: &Fixture, body_size: u64, chunks: &[&[u8]]) {
        fixture
            .channel
            .handle_frame(Frame {
                channel: 1,
                payload: FramePayload::Header(AMQP_CLASS_BASIC, body_size, BasicProperties::default()),
            })
            .unwrap();

        for chunk in chunks {
            fixture
                .channel
                .handle_frame(Frame { channel: 1, payload: FramePayload::Content(chunk.to_vec()) })
                .unwrap();
        }
    }

    fn sent(fixture: &mut Fixture) -> Method {
        match fixture.writer.try_recv().expect("frame expected").expect("sentinel not expected") {
            Frame { payload: FramePayload::Method(method), .. } => method,
            other => panic!("method frame expected, got {:?}", other),
        }
    }

    fn event(fixture: &mut Fixture) -> Event {
        fixture.queue.events.try_recv().expect("event expected")
    }

    fn start_consuming(fixture: &mut Fixture, tag: &str) {
        assert!(fixture.queue.consume(ConsumeFlags::new()));
        assert!(matches!(sent(fixture), Method::BasicConsume(_, _, _, _)));
        feed(fixture, Method::BasicConsumeOk(tag.to_string()));
        assert_eq!(event(fixture), Event::Consuming(tag.to_string()));
    }

    #[test]
    fn declare_adopts_the_server_assigned_name() {
        let mut fixture = fixture("");
        open(&fixture);

        assert!(fixture.queue.declare(DeclareFlags::new()));
        assert!(matches!(sent(&mut fixture), Method::QueueDeclare(name, _, _) if name.is_empty()));

        feed(&fixture, Method::QueueDeclareOk("amq.gen-abc123".to_string(), 0, 0));
        assert_eq!(event(&mut fixture), Event::Declared);
        assert!(fixture.queue.is_declared());
        assert_eq!(fixture.queue.name(), "amq.gen-abc123");
    }

    #[test]
    fn declare_keeps_the_requested_name() {
        let mut fixture = fixture("orders");
        open(&fixture);

        assert!(fixture.queue.declare(DeclareFlags::new().durable(true)));
        assert!(matches!(sent(&mut fixture), Method::QueueDeclare(_, flags, _) if flags == 0b0000_0010));

        feed(&fixture, Method::QueueDeclareOk("orders".to_string(), 3, 1));
        assert_eq!(event(&mut fixture), Event::Declared);
        assert_eq!(fixture.queue.name(), "orders");
    }

    #[test]
    fn remove_requires_a_declared_queue() {
        let mut fixture = fixture("orders");
        open(&fixture);
        assert!(!fixture.queue.remove(RemoveFlags::new()));

        assert!(fixture.queue.declare(DeclareFlags::new()));
        let _ = sent(&mut fixture);
        feed(&fixture, Method::QueueDeclareOk("orders".to_string(), 0, 0));
        let _ = event(&mut fixture);

        assert!(fixture.queue.remove(RemoveFlags::new().if_unused(true)));
        assert!(matches!(sent(&mut fixture), Method::QueueDelete(_, flags) if flags == 0b0000_0001));

        feed(&fixture, Method::QueueDeleteOk(0));
        assert_eq!(event(&mut fixture), Event::Removed);
        assert!(!fixture.queue.is_declared());
    }

    #[test]
    fn purge_reports_the_message_count() {
        let mut fixture = fixture("orders");
        open(&fixture);

        assert!(fixture.queue.purge());
        assert!(matches!(sent(&mut fixture), Method::QueuePurge(_, _)));
        feed(&fixture, Method::QueuePurgeOk(3));
        assert_eq!(event(&mut fixture), Event::Purged(3));
    }

    #[test]
    fn unbind_reverses_a_binding() {
        let mut fixture = fixture("orders");
        open(&fixture);

        assert!(fixture.queue.bind("amq.topic", "route"));
        assert!(matches!(sent(&mut fixture), Method::QueueBind(_, _, key, _, _) if key == "route"));
        feed(&fixture, Method::QueueBindOk());
        assert_eq!(event(&mut fixture), Event::Bound);

        assert!(fixture.queue.unbind("amq.topic", "route"));
        assert!(matches!(sent(&mut fixture), Method::QueueUnbind(_, exchange, _, _) if exchange == "amq.topic"));
        feed(&fixture, Method::QueueUnbindOk());
        assert_eq!(event(&mut fixture), Event::Unbound);
    }

    #[test]
    fn no_wait_declare_expects_no_reply() {
        let mut fixture = fixture("orders");
        open(&fixture);

        assert!(fixture.queue.declare(DeclareFlags::new().no_wait(true)));
        assert!(matches!(sent(&mut fixture), Method::QueueDeclare(_, flags, _) if flags & 0b1_0000 != 0));
        assert!(!fixture.queue.is_declared());

        // the reply queue is empty, so the next operation matches its own reply
        assert!(fixture.queue.purge());
        let _ = sent(&mut fixture);
        feed(&fixture, Method::QueuePurgeOk(0));
        assert_eq!(event(&mut fixture), Event::Purged(0));
    }

    #[test]
    fn consume_is_rejected_while_already_consuming() {
        let mut fixture = fixture("orders");
        open(&fixture);

        start_consuming(&mut fixture, "tag-1");
        assert!(fixture.queue.is_consuming());
        assert_eq!(fixture.queue.consumer_tag().as_deref(), Some("tag-1"));
        assert!(!fixture.queue.consume(ConsumeFlags::new()));
    }

    #[test]
    fn cancel_round_trip_clears_the_consumer() {
        let mut fixture = fixture("orders");
        open(&fixture);
        start_consuming(&mut fixture, "tag-1");

        assert!(fixture.queue.cancel());
        assert!(matches!(sent(&mut fixture), Method::BasicCancel(tag, _) if tag == "tag-1"));
        feed(&fixture, Method::BasicCancelOk("tag-1".to_string()));
        assert_eq!(event(&mut fixture), Event::Cancelled("tag-1".to_string()));

        assert!(!fixture.queue.is_consuming());
        assert!(!fixture.queue.cancel());
    }

    #[test]
    fn cancel_requires_a_consumer_tag() {
        let mut fixture = fixture("orders");
        open(&fixture);
        assert!(!fixture.queue.cancel());

        start_consuming(&mut fixture, "tag-1");
        fixture.queue.set_consumer_tag("");
        assert!(!fixture.queue.cancel());
    }

    #[test]
    fn delivery_reassembles_across_body_frames() {
        let mut fixture = fixture("orders");
        open(&fixture);
        start_consuming(&mut fixture, "tag-1");

        feed(&fixture, Method::BasicDeliver("tag-1".to_string(), 7, false, "".to_string(), "orders".to_string()));
        feed_content(&fixture, 11, &[b"hello ", b"world"]);

        assert_eq!(event(&mut fixture), Event::MessageReceived);
        assert!(fixture.queue.has_complete_message());

        let message = fixture.queue.next_message().unwrap();
        assert_eq!(message.delivery_tag, 7);
        assert_eq!(message.payload, b"hello world");
        assert!(fixture.queue.next_message().is_none());
    }

    #[test]
    fn zero_length_body_completes_at_the_header() {
        let mut fixture = fixture("orders");
        open(&fixture);
        start_consuming(&mut fixture, "tag-1");

        feed(&fixture, Method::BasicDeliver("tag-1".to_string(), 8, false, "".to_string(), "orders".to_string()));
        feed_content(&fixture, 0, &[]);

        assert_eq!(event(&mut fixture), Event::MessageReceived);
        assert_eq!(fixture.queue.next_message().unwrap().payload, b"");
    }

    #[test]
    fn deliveries_for_a_foreign_consumer_tag_are_dropped() {
        let mut fixture = fixture("orders");
        open(&fixture);
        start_consuming(&mut fixture, "tag-1");

        feed(&fixture, Method::BasicDeliver("tag-9".to_string(), 5, false, "".to_string(), "orders".to_string()));
        feed_content(&fixture, 4, &[b"junk"]);

        assert!(fixture.queue.events.try_recv().is_err());
        assert!(!fixture.queue.has_complete_message());
    }

    #[test]
    fn deliveries_are_dropped_while_a_cancel_is_in_flight() {
        let mut fixture = fixture("orders");
        open(&fixture);
        start_consuming(&mut fixture, "tag-1");

        assert!(fixture.queue.cancel());
        let _ = sent(&mut fixture);

        feed(&fixture, Method::BasicDeliver("tag-1".to_string(), 6, false, "".to_string(), "orders".to_string()));
        feed_content(&fixture, 4, &[b"late"]);
        assert!(fixture.queue.events.try_recv().is_err());
        assert!(!fixture.queue.has_complete_message());
    }

    #[test]
    fn acked_tags_come_from_deliveries_and_ack_only_once() {
        let mut fixture = fixture("orders");
        open(&fixture);
        fixture.queue.set_no_ack(false);
        start_consuming(&mut fixture, "tag-1");

        feed(&fixture, Method::BasicDeliver("tag-1".to_string(), 21, true, "".to_string(), "orders".to_string()));
        feed_content(&fixture, 2, &[b"ok"]);
        let _ = event(&mut fixture);

        let message = fixture.queue.next_message().unwrap();
        assert!(message.redelivered);

        assert!(fixture.queue.ack(&message));
        assert!(matches!(sent(&mut fixture), Method::BasicAck(21, false)));
        assert!(!fixture.queue.ack(&message));
    }

    #[test]
    fn ack_of_an_unknown_tag_is_local_misuse() {
        let mut fixture = fixture("orders");
        open(&fixture);
        fixture.queue.set_no_ack(false);
        start_consuming(&mut fixture, "tag-1");

        feed(&fixture, Method::BasicDeliver("tag-1".to_string(), 3, false, "".to_string(), "orders".to_string()));
        feed_content(&fixture, 2, &[b"ok"]);
        let _ = event(&mut fixture);

        let mut message = fixture.queue.next_message().unwrap();
        message.delivery_tag = 99;
        assert!(!fixture.queue.ack(&message));
        assert!(fixture.writer.try_recv().is_err());
    }

    #[test]
    fn get_empty_emits_the_empty_event() {
        let mut fixture = fixture("orders");
        open(&fixture);

        assert!(fixture.queue.get());
        assert!(matches!(sent(&mut fixture), Method::BasicGet(_, no_ack) if no_ack == 1));
        feed(&fixture, Method::BasicGetEmpty());
        assert_eq!(event(&mut fixture), Event::Empty);
    }

    #[test]
    fn get_ok_builds_a_message_without_tag_filtering() {
        let mut fixture = fixture("orders");
        open(&fixture);

        assert!(fixture.queue.get());
        let _ = sent(&mut fixture);
        feed(&fixture, Method::BasicGetOk(41, false, "".to_string(), "orders".to_string(), 0));
        feed_content(&fixture, 3, &[b"got"]);

        assert_eq!(event(&mut fixture), Event::MessageReceived);
        assert_eq!(fixture.queue.next_message().unwrap().payload, b"got");
    }

    #[test]
    fn operations_fail_after_the_terminal_error() {
        let mut fixture = fixture("orders");
        open(&fixture);

        assert!(fixture.queue.declare(DeclareFlags::new().passive(true)));
        let _ = sent(&mut fixture);
        feed(&fixture, Method::ChannelClose(404, "no queue 'orders'".to_string(), AMQP_CLASS_QUEUE, AMQP_METHOD_QUEUE_DECLARE));

        assert_eq!(
            event(&mut fixture),
            Event::Error { kind: ErrorKind::NotFound, reply_code: 404, reply_text: "no queue 'orders'".to_string() }
        );
        assert!(matches!(
            fixture.queue.error(),
            Some(ConnectionError::ChannelClosedByServer(404, _, _, _))
        ));
        assert!(!fixture.queue.declare(DeclareFlags::new()));
        assert!(!fixture.queue.purge());
        assert!(!fixture.queue.get());
    }
}
