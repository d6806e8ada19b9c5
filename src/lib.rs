// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

#[cfg(test)]
mod fake;

pub mod broker;
pub mod channel;
pub mod config;
pub mod delay;
pub mod errors;
pub mod handler;
pub mod listener;
pub mod mq;
pub mod publisher;
pub mod queue;

pub use config::AmqpQueueOptions;
pub use errors::{AmqpError, HandlerError};
pub use handler::{handler_fn, MessageHandler};
pub use listener::ListenOptions;
pub use mq::AmqpMessageQueue;
pub use publisher::EnqueueOptions;
