// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! This module processes one delivery of a listener: it decodes the JSON
//! payload, opens a consumer span, runs the handler to completion and then
//! settles the delivery with the broker.
//!
//! Settlement never depends on whether the handler succeeded: the delivery
//! is acked either way. With native retrial enabled, a failed handler nacks
//! the delivery with requeue instead so the broker redelivers it.

use crate::{
    broker::{BrokerChannel, InboundDelivery},
    errors::AmqpError,
    handler::MessageHandler,
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The handler succeeded and the delivery was acked.
    Handled,
    /// The handler failed and the delivery was acked anyway.
    Failed,
    /// The handler failed and the delivery was requeued.
    Requeued,
    /// The payload could not be decoded; the delivery was acked without
    /// reaching the handler.
    Undecodable,
}

/// Processes one delivery of `queue`.
///
/// Returns an error only when the broker refused the ack or nack.
pub(crate) async fn consume<T, H>(
    tracer: &BoxedTracer,
    delivery: InboundDelivery,
    queue: &str,
    handler: &H,
    channel: &dyn BrokerChannel,
    native_retrial: bool,
) -> Result<Outcome, AmqpError>
where
    T: DeserializeOwned + Send,
    H: MessageHandler<T> + ?Sized,
{
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, queue);

    debug!(
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "received: {}",
        queue
    );

    let message = match serde_json::from_slice::<T>(&delivery.data) {
        Ok(message) => message,
        Err(err) => {
            let err = AmqpError::DecodingError(err.to_string());
            error!(
                error = err.to_string(),
                delivery_tag = delivery.delivery_tag,
                "removing message from queue"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });

            channel.ack(delivery.delivery_tag).await?;
            return Ok(Outcome::Undecodable);
        }
    };

    let result = AssertUnwindSafe(handler.handle(&ctx, message))
        .catch_unwind()
        .await;

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            warn!(error = err.to_string(), "error while handling msg");
            span.record_error(&*err);
            Some(Cow::from(err.to_string()))
        }
        Err(_) => {
            error!("handler panicked while handling msg");
            Some(Cow::from("handler panicked"))
        }
    };

    let Some(description) = failure else {
        debug!("message successfully processed");
        channel.ack(delivery.delivery_tag).await?;
        span.set_status(Status::Ok);
        return Ok(Outcome::Handled);
    };

    span.set_status(Status::Error { description });

    if native_retrial {
        warn!(
            delivery_tag = delivery.delivery_tag,
            "requeuing message for redelivery"
        );
        channel.nack(delivery.delivery_tag, true).await?;
        return Ok(Outcome::Requeued);
    }

    channel.ack(delivery.delivery_tag).await?;
    Ok(Outcome::Failed)
}
