// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Delivery
//!
//! Delayed delivery is built from two broker primitives: per-queue message
//! TTL and dead-lettering. A message delayed by `d` milliseconds is published
//! to a queue named `<prefix><d>` that nobody consumes. That queue expires its
//! messages after `d` milliseconds and dead-letters them through the default
//! exchange into the main queue, where listeners pick them up.
//!
//! The queue name is a pure function of the delay, so every delay of the same
//! magnitude, from any process, shares one queue with one set of declare
//! parameters. Delay queues are auto-delete and are never removed explicitly.

use crate::{broker::BrokerChannel, errors::AmqpError, queue::QueueDefinition};
use std::time::Duration;
use tracing::{debug, error};

/// Where a message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Straight into the main queue.
    Immediate,
    /// Through the delay queue with this definition.
    Delayed(QueueDefinition),
}

impl Route {
    /// Name of the queue the message is published to.
    pub fn target<'a>(&'a self, main_queue: &'a str) -> &'a str {
        match self {
            Route::Immediate => main_queue,
            Route::Delayed(def) => def.name(),
        }
    }
}

/// Name of the delay queue for `delay_ms`.
///
/// Plain decimal digits, no grouping, no locale: this string is shared by
/// every producer of the deployment.
pub fn delayed_queue_name(prefix: &str, delay_ms: u64) -> String {
    format!("{}{}", prefix, delay_ms)
}

/// Largest message TTL the broker accepts, in milliseconds.
pub const MAX_DELAY_MS: u64 = u32::MAX as u64;

/// Definition of the delay queue for `delay_ms`.
pub fn delayed_queue(
    prefix: &str,
    delay_ms: u64,
    main_queue: &str,
    durable: bool,
) -> Result<QueueDefinition, AmqpError> {
    if delay_ms > MAX_DELAY_MS {
        error!(delay_ms = delay_ms, "delay does not fit a message ttl");
        return Err(AmqpError::InvalidDelay(delay_ms as u128));
    }

    Ok(QueueDefinition::new(&delayed_queue_name(prefix, delay_ms))
        .durable(durable)
        .delete()
        .ttl(delay_ms as i64)
        .dead_letter_to(main_queue))
}

/// Computes the route of a message.
///
/// Delays are rounded up to the next whole millisecond so a message never
/// becomes visible before its delay elapsed. Only a zero delay is immediate.
pub fn route(
    delay: Option<Duration>,
    prefix: &str,
    main_queue: &str,
    durable: bool,
) -> Result<Route, AmqpError> {
    let delay_ms = match delay {
        None => return Ok(Route::Immediate),
        Some(d) if d.is_zero() => return Ok(Route::Immediate),
        Some(d) => d.as_nanos().div_ceil(1_000_000),
    };

    let delay_ms = u64::try_from(delay_ms).map_err(|_| {
        error!("delay does not fit a message ttl");
        AmqpError::InvalidDelay(delay_ms)
    })?;

    Ok(Route::Delayed(delayed_queue(prefix, delay_ms, main_queue, durable)?))
}

/// Declares the delay queue of `route`, if any.
///
/// Declaration is idempotent, so it is repeated on every delayed publish.
pub async fn prepare_route(channel: &dyn BrokerChannel, route: &Route) -> Result<(), AmqpError> {
    if let Route::Delayed(def) = route {
        debug!(
            queue = def.name(),
            ttl = def.message_ttl(),
            "declaring delay queue"
        );
        channel.declare_queue(def).await?;
    }

    Ok(())
}
