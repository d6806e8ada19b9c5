// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! The queue logic talks to the broker only through the two traits of this
//! module. `BrokerConnection` hands out channels; `BrokerChannel` exposes the
//! handful of AMQP 0-9-1 methods the queue needs (queue.declare, basic.qos,
//! basic.publish, basic.consume, basic.ack, basic.nack, basic.cancel and
//! channel.close). Both are implemented for the `lapin` types.

use crate::{errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions,
    },
    protocol::{basic::AMQPProperties, constants::REPLY_SUCCESS},
    types::FieldTable,
    BasicProperties, Channel, Connection,
};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code the broker uses to refuse a redeclaration with different
/// parameters.
pub const PRECONDITION_FAILED: u16 = 406;

/// A message handed out by the broker and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: AMQPProperties,
}

/// Deliveries of one subscription, in broker order.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Source of broker channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A channel on a live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue. Redeclaring with identical parameters is a no-op,
    /// conflicting parameters fail with `AmqpError::ConfigurationConflict`.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries of this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Publishes through the default exchange, routed to `queue`.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with explicit acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Cancels a subscription. Returns once the broker confirmed it.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl BrokerConnection for Connection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match Connection::create_channel(self).await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(channel))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .queue_declare(&def.name, def.declare_options(), def.arguments())
            .await
        {
            Ok(_) => {
                debug!("queue: {} was declared", def.name);
                Ok(())
            }
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "queue exists with different parameters"
                );
                Err(AmqpError::ConfigurationConflict(def.name.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        // Without confirm mode the returned confirmation resolves immediately.
        match self
            .basic_publish(
                crate::queue::DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Ok(InboundDelivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                data: delivery.data,
                properties: delivery.properties,
            }),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error while nack msg");
            AmqpError::NackMessageError
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Channel::close(self, REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close channel");
                AmqpError::CloseChannelError(err.to_string())
            })
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_err) => amqp_err.get_id() == PRECONDITION_FAILED,
        _ => false,
    }
}
