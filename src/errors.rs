// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Message Queue
//!
//! This module provides the error taxonomy for every queue operation. The
//! `AmqpError` enum covers three families of failure:
//!
//! - transport failures (connection or channel unusable, broker-side close)
//! - configuration conflicts (a queue redeclared with incompatible parameters)
//! - encoding failures (payloads that cannot be serialized or deserialized)
//!
//! Failures raised by a caller-supplied handler are deliberately not part of
//! this enum: they are isolated per message and never surface from `listen`.

use thiserror::Error;

/// Error type returned by a [`MessageHandler`](crate::handler::MessageHandler).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during queue operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating or using a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Transport error while declaring the queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The broker refused a queue declaration because the queue already
    /// exists with different parameters
    #[error("queue declared with conflicting parameters `{0}`")]
    ConfigurationConflict(String),

    /// Options that could not be parsed
    #[error("invalid configuration `{0}`")]
    InvalidConfiguration(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing an outbound payload
    #[error("failure to encode payload `{0}`")]
    EncodingError(String),

    /// Error deserializing an inbound payload
    #[error("failure to decode payload `{0}`")]
    DecodingError(String),

    /// A delay that cannot be expressed as a broker TTL
    #[error("delay of {0}ms cannot be used as a message ttl")]
    InvalidDelay(u128),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error receiving a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error closing a channel
    #[error("failure to close channel `{0}`")]
    CloseChannelError(String),

    /// The delivery stream ended without a cancellation being requested
    #[error("consumer `{0}` was closed by the broker")]
    ConsumerClosed(String),
}

impl AmqpError {
    /// Returns true when the connection or channel is unusable.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            AmqpError::ConfigurationConflict(_)
                | AmqpError::InvalidConfiguration(_)
                | AmqpError::EncodingError(_)
                | AmqpError::DecodingError(_)
                | AmqpError::InvalidDelay(_)
        )
    }

    /// Returns true when a queue identity was redeclared with different
    /// parameters.
    pub fn is_configuration_conflict(&self) -> bool {
        matches!(self, AmqpError::ConfigurationConflict(_))
    }
}
