// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Listener
//!
//! This module provides the receive path of the queue. Each call to
//! [`Listener::listen`] opens its own channel, declares the main queue,
//! limits the channel to one unacknowledged delivery and subscribes with
//! explicit acknowledgement. Deliveries are then handled strictly one at a
//! time until the cancellation signal fires.
//!
//! Shutdown order:
//! 1. stop taking deliveries (the in-flight one, if any, is completed and
//!    settled first)
//! 2. cancel the subscription and wait for the broker to confirm it
//! 3. requeue deliveries buffered client-side that never reached the handler
//! 4. close the channel

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    channel::{release, ChannelManager},
    consumer::consume,
    errors::AmqpError,
    handler::MessageHandler,
    otel,
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Maximum number of unacknowledged deliveries per listener.
pub const PREFETCH: u16 = 1;

/// Per-call options of a listen session.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Stops the session once cancelled. Without one, the session only ends
    /// on failure.
    pub signal: Option<CancellationToken>,
}

impl ListenOptions {
    pub fn with_signal(signal: CancellationToken) -> Self {
        ListenOptions {
            signal: Some(signal),
        }
    }
}

/// Consumes the main queue.
pub struct Listener {
    channels: Arc<ChannelManager>,
    native_retrial: bool,
}

impl Listener {
    pub fn new(channels: Arc<ChannelManager>, native_retrial: bool) -> Self {
        Listener {
            channels,
            native_retrial,
        }
    }

    /// Runs a listen session until `options.signal` is cancelled.
    ///
    /// Resolves with `Ok(())` once the subscription is cancelled and its
    /// channel closed. Setup failures and the loss of the subscription
    /// resolve with an error; handler failures never do.
    pub async fn listen<T, H>(&self, handler: H, options: ListenOptions) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send,
        H: MessageHandler<T>,
    {
        let signal = options.signal.unwrap_or_default();
        let queue = self.channels.main_queue().name().to_owned();

        let channel = self.channels.listen_channel().await?;
        let (consumer_tag, mut deliveries) = match subscribe(channel.as_ref(), &queue).await {
            Ok(subscription) => subscription,
            Err(err) => {
                release(channel.as_ref()).await;
                return Err(err);
            }
        };

        debug!(queue = %queue, consumer_tag = %consumer_tag, "consumer subscribed");

        let tracer = global::tracer(otel::TRACER_NAME);

        loop {
            tokio::select! {
                biased;

                _ = signal.cancelled() => break,

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        match consume(
                            &tracer,
                            delivery,
                            &queue,
                            &handler,
                            channel.as_ref(),
                            self.native_retrial,
                        )
                        .await
                        {
                            Ok(outcome) => debug!(outcome = ?outcome, "delivery settled"),
                            Err(err) => error!(error = err.to_string(), "error consume msg"),
                        }
                    }

                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        release(channel.as_ref()).await;
                        return Err(err);
                    }

                    None => {
                        error!(consumer_tag = %consumer_tag, "consumer closed by the broker");
                        release(channel.as_ref()).await;
                        return Err(AmqpError::ConsumerClosed(consumer_tag));
                    }
                },
            }
        }

        shutdown(channel.as_ref(), &consumer_tag, deliveries).await
    }
}

async fn subscribe(
    channel: &dyn BrokerChannel,
    queue: &str,
) -> Result<(String, DeliveryStream), AmqpError> {
    channel.qos(PREFETCH).await?;

    let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
    let deliveries = channel.consume(queue, &consumer_tag).await?;

    Ok((consumer_tag, deliveries))
}

async fn shutdown(
    channel: &dyn BrokerChannel,
    consumer_tag: &str,
    mut deliveries: DeliveryStream,
) -> Result<(), AmqpError> {
    debug!(consumer_tag = consumer_tag, "cancelling consumer...");

    if let Err(err) = channel.cancel(consumer_tag).await {
        release(channel).await;
        return Err(err);
    }

    // Delivered before the cancel took effect but never handed to the handler.
    while let Some(Some(Ok(delivery))) = deliveries.next().now_or_never() {
        warn!(
            delivery_tag = delivery.delivery_tag,
            "returning undispatched delivery to the queue"
        );
        if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
            release(channel).await;
            return Err(err);
        }
    }
    drop(deliveries);

    channel.close().await?;
    debug!(consumer_tag = consumer_tag, "consumer cancelled and channel closed");

    Ok(())
}
