// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker for tests.
//!
//! Models the parts of an AMQP broker the queue relies on: queue declaration
//! with equivalence checks, the default exchange, per-queue message TTL with
//! dead-lettering, per-channel prefetch, round-robin dispatch across
//! consumers, ack / nack, consumer cancellation and channel close.

use crate::{
    broker::{BrokerChannel, BrokerConnection, DeliveryStream, InboundDelivery},
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc;

/// Broker-side operations, in the order the broker saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Declared(String),
    Conflict(String),
    Published(String),
    Delivered(u64),
    Acked(u64),
    Nacked { delivery_tag: u64, requeue: bool },
    Cancelled(String),
    Closed(u64),
}

#[derive(Clone)]
struct Message {
    id: u64,
    data: Vec<u8>,
    properties: BasicProperties,
    redelivered: bool,
}

struct Queue {
    def: QueueDefinition,
    messages: VecDeque<Message>,
}

struct Consumer {
    tag: String,
    queue: String,
    channel: u64,
    tx: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: Message,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    consumers: Vec<Consumer>,
    unacked: HashMap<u64, Unacked>,
    prefetch: HashMap<u64, u16>,
    closed: HashSet<u64>,
    cursor: HashMap<String, usize>,
    published: Vec<(String, BasicProperties)>,
    events: Vec<Event>,
    channels: u64,
    next_tag: u64,
    next_message: u64,
}

impl State {
    fn has_capacity(&self, channel: u64) -> bool {
        let limit = self.prefetch.get(&channel).copied().unwrap_or(0);
        if limit == 0 {
            return true;
        }

        let in_flight = self.unacked.values().filter(|u| u.channel == channel).count();
        in_flight < limit as usize
    }

    /// Hands queued messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self) {
        loop {
            let mut progressed = false;
            let names: Vec<String> = self.queues.keys().cloned().collect();

            for name in names {
                if self.queues[&name].messages.is_empty() {
                    continue;
                }

                let ready: Vec<usize> = self
                    .consumers
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.queue == name && self.has_capacity(c.channel))
                    .map(|(i, _)| i)
                    .collect();
                if ready.is_empty() {
                    continue;
                }

                let cursor = self.cursor.entry(name.clone()).or_default();
                let picked = ready[*cursor % ready.len()];
                *cursor += 1;

                let Some(message) = self
                    .queues
                    .get_mut(&name)
                    .and_then(|q| q.messages.pop_front())
                else {
                    continue;
                };

                self.next_tag += 1;
                let delivery_tag = self.next_tag;
                let consumer = &self.consumers[picked];
                let delivery = InboundDelivery {
                    delivery_tag,
                    redelivered: message.redelivered,
                    data: message.data.clone(),
                    properties: message.properties.clone(),
                };

                if consumer.tx.send(Ok(delivery)).is_err() {
                    if let Some(q) = self.queues.get_mut(&name) {
                        q.messages.push_front(message);
                    }
                    self.consumers.remove(picked);
                    progressed = true;
                    continue;
                }

                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel: consumer.channel,
                        queue: name.clone(),
                        message,
                    },
                );
                self.events.push(Event::Delivered(delivery_tag));
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(q) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            q.messages.push_front(message);
        }
    }

    fn expire(&mut self, queue: &str, id: u64) {
        let Some(source) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = source.messages.iter().position(|m| m.id == id) else {
            return;
        };
        let Some(message) = source.messages.remove(pos) else {
            return;
        };

        let target = source.def.dead_letter_routing_key().map(str::to_owned);
        if let Some(target) = target.and_then(|t| self.queues.get_mut(&t)) {
            target.messages.push_back(message);
        }

        self.dispatch();
    }
}

/// Shared handle to an in-memory broker.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub(crate) fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.lock().queues.get(name).map(|q| q.def.clone())
    }

    pub(crate) fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of declare calls seen for `name`.
    pub(crate) fn declarations(&self, name: &str) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Declared(n) if n == name))
            .count()
    }

    pub(crate) fn depth(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub(crate) fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    pub(crate) fn consumers(&self) -> usize {
        self.lock().consumers.len()
    }

    pub(crate) fn channels_opened(&self) -> u64 {
        self.lock().channels
    }

    pub(crate) fn published(&self) -> Vec<(String, BasicProperties)> {
        self.lock().published.clone()
    }

    /// Drops every subscription, as a broker does when queues vanish.
    pub(crate) fn drop_consumers(&self) {
        self.lock().consumers.clear();
    }
}

#[async_trait]
impl BrokerConnection for FakeBroker {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.lock();
        state.channels += 1;

        Ok(Arc::new(FakeChannel {
            broker: self.clone(),
            id: state.channels,
        }))
    }
}

struct FakeChannel {
    broker: FakeBroker,
    id: u64,
}

impl FakeChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = self.broker.lock();
        if state.closed.contains(&self.id) {
            return Err(AmqpError::ChannelError(format!("channel {} is closed", self.id)));
        }
        Ok(state)
    }

    fn schedule_expiry(&self, queue: &str, id: u64, ttl: i64) {
        let broker = self.broker.clone();
        let queue = queue.to_owned();
        let ttl = Duration::from_millis(ttl.max(0) as u64);

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            broker.lock().expire(&queue, id);
        });
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.events.push(Event::Declared(def.name().to_owned()));

        match state.queues.get(def.name()) {
            Some(existing) if existing.def != *def => {
                state.events.push(Event::Conflict(def.name().to_owned()));
                state.closed.insert(self.id);
                Err(AmqpError::ConfigurationConflict(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    Queue {
                        def: def.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.prefetch.insert(self.id, prefetch);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self
            .open_state()
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        state.events.push(Event::Published(queue.to_owned()));
        state.published.push((queue.to_owned(), properties.clone()));

        state.next_message += 1;
        let id = state.next_message;

        // The default exchange drops messages routed to unknown queues.
        let Some(target) = state.queues.get_mut(queue) else {
            return Ok(());
        };
        target.messages.push_back(Message {
            id,
            data: payload.to_vec(),
            properties,
            redelivered: false,
        });
        let ttl = target.def.message_ttl();

        state.dispatch();
        drop(state);

        if let Some(ttl) = ttl {
            self.schedule_expiry(queue, id, ttl);
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            state.closed.insert(self.id);
            return Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.push(Consumer {
            tag: consumer_tag.to_owned(),
            queue: queue.to_owned(),
            channel: self.id,
            tx,
        });
        state.dispatch();

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(AmqpError::AckMessageError);
        }

        state.events.push(Event::Acked(delivery_tag));
        state.dispatch();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::NackMessageError);
        };

        state.events.push(Event::Nacked {
            delivery_tag,
            requeue,
        });
        if requeue {
            state.requeue(unacked);
        }
        state.dispatch();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.consumers.retain(|c| c.tag != consumer_tag);
        state.events.push(Event::Cancelled(consumer_tag.to_owned()));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self
            .open_state()
            .map_err(|err| AmqpError::CloseChannelError(err.to_string()))?;

        state.closed.insert(self.id);
        state.consumers.retain(|c| c.channel != self.id);

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                state.requeue(unacked);
            }
        }

        state.events.push(Event::Closed(self.id));
        state.dispatch();
        Ok(())
    }
}
