// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides the send path of the queue. Payloads are encoded as
//! UTF-8 JSON, routed either to the main queue or to a delay queue, and
//! published on the shared publish channel with the trace context of the
//! caller in their headers.

use crate::{
    channel::ChannelManager,
    delay::{self, Route},
    errors::AmqpError,
    otel,
};
use lapin::{types::ShortString, BasicProperties};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages kept in memory only
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// AMQP delivery mode of messages written to disk
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Per-call options of an enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Time to wait before the message becomes visible to listeners.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        EnqueueOptions { delay: Some(delay) }
    }
}

/// Publishes messages into the main queue or its delay queues.
pub struct AmqpPublisher {
    channels: Arc<ChannelManager>,
    delayed_queue_prefix: String,
    durable: bool,
}

impl AmqpPublisher {
    pub fn new(channels: Arc<ChannelManager>, delayed_queue_prefix: &str, durable: bool) -> Self {
        AmqpPublisher {
            channels,
            delayed_queue_prefix: delayed_queue_prefix.to_owned(),
            durable,
        }
    }

    /// Publishes one message.
    ///
    /// Returns once the broker client accepted the message. Encoding happens
    /// before any broker interaction.
    pub async fn enqueue<T>(&self, message: &T, options: EnqueueOptions) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = encode(message)?;
        self.publish_all(&[payload], options).await
    }

    /// Publishes several messages, in order, with the same options.
    ///
    /// Nothing is published if any message fails to encode.
    pub async fn enqueue_many<T>(
        &self,
        messages: &[T],
        options: EnqueueOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize,
    {
        let payloads = messages
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>, _>>()?;

        if payloads.is_empty() {
            return Ok(());
        }

        self.publish_all(&payloads, options).await
    }

    async fn publish_all(
        &self,
        payloads: &[Vec<u8>],
        options: EnqueueOptions,
    ) -> Result<(), AmqpError> {
        let main_queue = self.channels.main_queue().name();
        let route = delay::route(
            options.delay,
            &self.delayed_queue_prefix,
            main_queue,
            self.durable,
        )?;

        let channel = self.channels.publish_channel().await?;
        delay::prepare_route(channel.as_ref(), &route).await?;

        let target = route.target(main_queue);
        for payload in payloads {
            channel.publish(target, payload, self.properties()).await?;
        }

        debug!(
            queue = target,
            count = payloads.len(),
            delayed = matches!(route, Route::Delayed(_)),
            "message(s) published"
        );

        Ok(())
    }

    fn properties(&self) -> BasicProperties {
        let delivery_mode = if self.durable {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::inject_current())
    }
}

/// Encodes a payload as UTF-8 JSON.
pub fn encode<T>(message: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::EncodingError(err.to_string())
    })
}
