// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! Construction-time options for [`AmqpMessageQueue`](crate::mq::AmqpMessageQueue).
//! Options can be built in code, deserialized from any serde format, or read
//! from the process environment. They never change after the queue is built.

use crate::errors::AmqpError;
use serde::Deserialize;
use tracing::error;

/// Default name of the main queue
pub const DEFAULT_QUEUE: &str = "fedify_queue";
/// Default prefix of the per-delay queues
pub const DEFAULT_DELAYED_QUEUE_PREFIX: &str = "fedify_delayed_";

pub const ENV_QUEUE: &str = "AMQP_QUEUE";
pub const ENV_DELAYED_QUEUE_PREFIX: &str = "AMQP_DELAYED_QUEUE_PREFIX";
pub const ENV_DURABLE: &str = "AMQP_DURABLE";
pub const ENV_NATIVE_RETRIAL: &str = "AMQP_NATIVE_RETRIAL";

/// Options of an AMQP-backed message queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpQueueOptions {
    pub(crate) queue: String,
    pub(crate) delayed_queue_prefix: String,
    pub(crate) durable: bool,
    pub(crate) native_retrial: bool,
}

impl Default for AmqpQueueOptions {
    fn default() -> Self {
        AmqpQueueOptions {
            queue: DEFAULT_QUEUE.to_owned(),
            delayed_queue_prefix: DEFAULT_DELAYED_QUEUE_PREFIX.to_owned(),
            durable: true,
            native_retrial: false,
        }
    }
}

impl AmqpQueueOptions {
    /// Sets the name of the main queue.
    ///
    /// Every producer and consumer of a deployment must agree on it.
    pub fn queue(mut self, name: &str) -> Self {
        self.queue = name.to_owned();
        self
    }

    /// Sets the prefix used to name the per-delay queues.
    pub fn delayed_queue_prefix(mut self, prefix: &str) -> Self {
        self.delayed_queue_prefix = prefix.to_owned();
        self
    }

    /// Sets whether queues and messages survive a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// When enabled, a failed handler nacks its message with requeue so the
    /// broker redelivers it. Disabled by default: every delivery is acked.
    pub fn native_retrial(mut self, enabled: bool) -> Self {
        self.native_retrial = enabled;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn prefix(&self) -> &str {
        &self.delayed_queue_prefix
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_native_retrial(&self) -> bool {
        self.native_retrial
    }

    /// Reads options from the process environment.
    ///
    /// Unset variables keep their default value.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = AmqpQueueOptions::default();

        if let Some(queue) = lookup(ENV_QUEUE) {
            options.queue = queue;
        }

        if let Some(prefix) = lookup(ENV_DELAYED_QUEUE_PREFIX) {
            options.delayed_queue_prefix = prefix;
        }

        if let Some(value) = lookup(ENV_DURABLE) {
            options.durable = parse_bool(ENV_DURABLE, &value)?;
        }

        if let Some(value) = lookup(ENV_NATIVE_RETRIAL) {
            options.native_retrial = parse_bool(ENV_NATIVE_RETRIAL, &value)?;
        }

        Ok(options)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AmqpError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => {
            error!(key = key, value = value, "invalid boolean option");
            Err(AmqpError::InvalidConfiguration(format!("{}={}", key, value)))
        }
    }
}
